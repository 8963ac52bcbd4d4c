//! Properties of state fingerprints.

use proptest::prelude::*;
use std::sync::Arc;
use strand_eval::{GlobalState, Value};
use strand_mc::fingerprint;

fn store(assignments: &[(String, i64)]) -> GlobalState {
    let mut state = GlobalState::new(Arc::from(Vec::new()));
    for (name, v) in assignments {
        state.set(&[Value::atom(name)], Value::Int(*v)).unwrap();
    }
    state
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    /// The fingerprint depends on the store contents, not on write order.
    #[test]
    fn fingerprint_ignores_write_order(
        vars in prop::collection::btree_map("[a-f]", -20i64..20, 0..6),
    ) {
        let forward: Vec<(String, i64)> = vars.clone().into_iter().collect();
        let mut backward = forward.clone();
        backward.reverse();
        prop_assert_eq!(fingerprint(&store(&forward)), fingerprint(&store(&backward)));
    }
}
