//! Operators applied by the `Nary` instruction.
//!
//! Each operator function returns `Ok(None)` when the operand types do not
//! fit; `apply` turns that into a single "unexpected types" failure listing
//! every operand in push order.

use crate::bytecode::Operator;
use crate::context::Context;
use crate::eval::{ExecError, ExecResult};
use crate::state::{Bag, GlobalState};
use crate::value::Value;
use smallvec::SmallVec;
use std::sync::Arc;

type Operands = SmallVec<[Value; 4]>;

/// Largest set, list or string an operator may build.
pub(crate) const MAX_AGGREGATE: usize = 1 << 24;

/// Element count of `len` repeated `n` times, if it is within bounds.
fn repeated_len(op: &'static str, len: usize, n: i64) -> ExecResult<usize> {
    let times = usize::try_from(n.max(0)).map_err(|_| ExecError::TooLarge(op))?;
    match len.checked_mul(times) {
        Some(total) if total <= MAX_AGGREGATE => Ok(times),
        _ => Err(ExecError::TooLarge(op)),
    }
}

/// Pop `arity` operands, apply `operator`, push the result.
pub(crate) fn apply(
    operator: Operator,
    arity: usize,
    state: &GlobalState,
    ctx: &mut Context,
) -> ExecResult<()> {
    let mut args: Operands = (0..arity).map(|_| ctx.pop()).collect();
    args.reverse();

    let result = if is_associative(operator) {
        fold(operator, &args)?
    } else {
        match args.as_slice() {
            [a] => unary(operator, a, state, ctx)?,
            [a, b] => binary(operator, a, b)?,
            [d, k, v] => dict_add(d, k, v),
            _ => unreachable!("operator {} linked with arity {}", operator, arity),
        }
    };

    match result {
        Some(v) => {
            ctx.push(v);
            Ok(())
        }
        None => Err(ExecError::Operands {
            op: operator.symbol(),
            operands: Value::list(args.iter().cloned()).to_string(),
        }),
    }
}

fn is_associative(op: Operator) -> bool {
    matches!(
        op,
        Operator::Plus | Operator::Times | Operator::And | Operator::Or | Operator::Xor
    )
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(x) => Some(*x),
        _ => None,
    }
}

/// Integer op with overflow check, falling back to float for mixed operands.
fn arith(
    a: &Value,
    b: &Value,
    sym: &'static str,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> ExecResult<Option<Value>> {
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return int_op(*x, *y)
            .map(|n| Some(Value::Int(n)))
            .ok_or(ExecError::Overflow(sym));
    }
    Ok(match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => Some(Value::Float(float_op(x, y))),
        _ => None,
    })
}

fn floor_div(a: i64, b: i64) -> ExecResult<i64> {
    if b == 0 {
        return Err(ExecError::DivisionByZero);
    }
    let q = a.checked_div(b).ok_or(ExecError::Overflow("/"))?;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(q - 1)
    } else {
        Ok(q)
    }
}

fn floor_mod(a: i64, b: i64) -> ExecResult<i64> {
    if b == 0 {
        return Err(ExecError::DivisionByZero);
    }
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

// === Unary ===

fn unary(op: Operator, a: &Value, state: &GlobalState, ctx: &Context) -> ExecResult<Option<Value>> {
    Ok(match (op, a) {
        (Operator::Minus, Value::Int(n)) => Some(Value::Int(
            n.checked_neg().ok_or(ExecError::Overflow("-"))?,
        )),
        (Operator::Minus, Value::Float(x)) => Some(Value::Float(-x)),
        (Operator::BitNot, Value::Int(n)) => Some(Value::Int(!n)),
        (Operator::Not, Value::Bool(b)) => Some(Value::Bool(!b)),
        (Operator::Abs, Value::Int(n)) => Some(Value::Int(
            n.checked_abs().ok_or(ExecError::Overflow("abs"))?,
        )),
        (Operator::Abs, Value::Float(x)) => Some(Value::Float(x.abs())),

        (Operator::AtLabel, Value::Pc(pc)) => {
            require_atomic(ctx, "atLabel")?;
            let mut bag = Bag::new();
            for (c, n) in state.ctxbag.iter() {
                let Some(c) = c.as_context() else { continue };
                if c.pc == *pc {
                    for _ in 0..n {
                        bag.add(Value::list([Value::Pc(c.entry), c.arg.clone()]));
                    }
                }
            }
            Some(bag.to_value())
        }
        (Operator::CountLabel, Value::Pc(pc)) => {
            require_atomic(ctx, "countLabel")?;
            let count: usize = state
                .ctxbag
                .iter()
                .filter(|(c, _)| c.as_context().is_some_and(|c| c.pc == *pc))
                .map(|(_, n)| n)
                .sum();
            Some(Value::Int(count as i64))
        }
        (Operator::GetContext, _) => Some(ctx.to_value()),
        (Operator::Contexts, _) => {
            require_atomic(ctx, "contexts")?;
            Some(state.all_contexts())
        }

        (Operator::IsEmpty, Value::Set(s)) => Some(Value::Bool(s.is_empty())),
        (Operator::IsEmpty, Value::Dict(d)) => Some(Value::Bool(d.is_empty())),
        (Operator::Min, Value::Set(s)) => Some(s.first().cloned().ok_or_else(|| empty("min", a))?),
        (Operator::Max, Value::Set(s)) => Some(s.last().cloned().ok_or_else(|| empty("max", a))?),
        (Operator::Min, Value::Dict(d)) => Some(
            d.iter()
                .map(|(_, v)| v)
                .min()
                .cloned()
                .ok_or_else(|| empty("min", a))?,
        ),
        (Operator::Max, Value::Dict(d)) => Some(
            d.iter()
                .map(|(_, v)| v)
                .max()
                .cloned()
                .ok_or_else(|| empty("max", a))?,
        ),
        (Operator::Len, Value::Set(s)) => Some(Value::Int(s.len() as i64)),
        (Operator::Len, Value::Dict(d)) => Some(Value::Int(d.len() as i64)),
        (Operator::Len, Value::Atom(s)) => Some(Value::Int(s.chars().count() as i64)),
        (Operator::Str, Value::Atom(_)) => Some(a.clone()),
        (Operator::Str, _) => Some(Value::atom(&a.to_string())),
        (Operator::Any, Value::Set(s)) => Some(Value::Bool(s.iter().any(Value::is_truthy))),
        (Operator::Any, Value::Dict(d)) => Some(Value::Bool(d.iter().any(|(_, v)| v.is_truthy()))),
        (Operator::All, Value::Set(s)) => Some(Value::Bool(s.iter().all(Value::is_truthy))),
        (Operator::All, Value::Dict(d)) => Some(Value::Bool(d.iter().all(|(_, v)| v.is_truthy()))),
        (Operator::Keys, Value::Dict(d)) => Some(Value::Set(Arc::new(
            d.iter().map(|(k, _)| k.clone()).collect(),
        ))),
        _ => None,
    })
}

fn require_atomic(ctx: &Context, op: &'static str) -> ExecResult<()> {
    if ctx.atomic == 0 {
        return Err(ExecError::NotAtomic(op));
    }
    Ok(())
}

fn empty(op: &'static str, value: &Value) -> ExecError {
    ExecError::Empty {
        op,
        value: value.clone(),
    }
}

// === Binary ===

fn binary(op: Operator, a: &Value, b: &Value) -> ExecResult<Option<Value>> {
    Ok(match op {
        Operator::Eq => Some(Value::Bool(a == b)),
        Operator::Ne => Some(Value::Bool(a != b)),
        Operator::Lt => Some(Value::Bool(a < b)),
        Operator::Le => Some(Value::Bool(a <= b)),
        Operator::Gt => Some(Value::Bool(a > b)),
        Operator::Ge => Some(Value::Bool(a >= b)),

        Operator::Minus => match (a, b) {
            (Value::Set(x), Value::Set(y)) => Some(Value::Set(Arc::new(
                x.iter()
                    .filter(|v| !Value::set_contains(y, v))
                    .cloned()
                    .collect(),
            ))),
            _ => arith(a, b, "-", i64::checked_sub, |x, y| x - y)?,
        },
        Operator::Div => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(Value::Int(floor_div(*x, *y)?)),
            _ => float_div(a, b, false)?,
        },
        Operator::FloorDiv => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(Value::Int(floor_div(*x, *y)?)),
            _ => float_div(a, b, true)?,
        },
        Operator::Mod => match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(Value::Int(floor_mod(*x, *y)?)),
            _ => match (as_f64(a), as_f64(b)) {
                (Some(_), Some(y)) if y == 0.0 => return Err(ExecError::DivisionByZero),
                (Some(x), Some(y)) => Some(Value::Float(x - y * (x / y).floor())),
                _ => None,
            },
        },
        Operator::Pow => match (a, b) {
            (Value::Int(x), Value::Int(y)) if *y >= 0 => {
                let exp = u32::try_from(*y).map_err(|_| ExecError::Overflow("**"))?;
                Some(Value::Int(
                    x.checked_pow(exp).ok_or(ExecError::Overflow("**"))?,
                ))
            }
            (Value::Int(_), Value::Int(_)) => None,
            _ => match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => Some(Value::Float(x.powf(y))),
                _ => None,
            },
        },
        Operator::Shl | Operator::Shr => match (a, b) {
            (Value::Int(x), Value::Int(n)) => {
                if !(0..64).contains(n) {
                    return Err(ExecError::BadShift(*n));
                }
                let n = *n as u32;
                if op == Operator::Shl {
                    let shifted = x << n;
                    if shifted >> n != *x {
                        return Err(ExecError::Overflow("<<"));
                    }
                    Some(Value::Int(shifted))
                } else {
                    Some(Value::Int(x >> n))
                }
            }
            _ => None,
        },
        Operator::Range => match (a, b) {
            (Value::Int(lo), Value::Int(hi)) => {
                let width = (*hi as i128) - (*lo as i128) + 1;
                if width > MAX_AGGREGATE as i128 {
                    return Err(ExecError::TooLarge(".."));
                }
                Some(Value::Set(Arc::new((*lo..=*hi).map(Value::Int).collect())))
            }
            _ => None,
        },
        Operator::In => match b {
            Value::Set(s) => Some(Value::Bool(Value::set_contains(s, a))),
            Value::Dict(d) => Some(Value::Bool(d.iter().any(|(_, v)| v == a))),
            Value::Atom(s) => match a {
                Value::Atom(sub) => Some(Value::Bool(s.contains(sub.as_ref()))),
                _ => None,
            },
            _ => None,
        },
        Operator::SetAdd => match a {
            Value::Set(s) => {
                let mut s = Arc::clone(s);
                Value::set_insert(Arc::make_mut(&mut s), b.clone());
                Some(Value::Set(s))
            }
            _ => None,
        },
        Operator::BagAdd => match a {
            Value::Dict(d) => {
                let count = match Value::dict_lookup(d, b) {
                    Some(Value::Int(n)) => n.checked_add(1).ok_or(ExecError::Overflow("BagAdd"))?,
                    Some(_) => return Ok(None),
                    None => 1,
                };
                let mut d = Arc::clone(d);
                Value::dict_insert(Arc::make_mut(&mut d), b.clone(), Value::Int(count));
                Some(Value::Dict(d))
            }
            _ => None,
        },
        _ => None,
    })
}

fn float_div(a: &Value, b: &Value, floor: bool) -> ExecResult<Option<Value>> {
    let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) else {
        return Ok(None);
    };
    if y == 0.0 {
        return Err(ExecError::DivisionByZero);
    }
    if matches!(a, Value::Int(_)) && y.is_infinite() {
        return Ok(Some(Value::Int(0)));
    }
    let q = x / y;
    Ok(Some(Value::Float(if floor { q.floor() } else { q })))
}

// === Ternary ===

/// Insert `k: v` unless the existing entry is already at least `v`.
fn dict_add(d: &Value, k: &Value, v: &Value) -> Option<Value> {
    let Value::Dict(entries) = d else {
        return None;
    };
    if let Some(existing) = Value::dict_lookup(entries, k) {
        if existing >= v {
            return Some(d.clone());
        }
    }
    let mut entries = Arc::clone(entries);
    Value::dict_insert(Arc::make_mut(&mut entries), k.clone(), v.clone());
    Some(Value::Dict(entries))
}

// === Associative ===

/// Fold from the top of the stack down: the last-pushed operand is the seed
/// and each earlier operand is combined on its left.
fn fold(op: Operator, args: &[Value]) -> ExecResult<Option<Value>> {
    let Some((seed, rest)) = args.split_last() else {
        return Ok(None);
    };
    let mut acc = seed.clone();
    for e1 in rest.iter().rev() {
        match combine(op, e1, &acc)? {
            Some(v) => acc = v,
            None => return Ok(None),
        }
    }
    Ok(Some(acc))
}

fn combine(op: Operator, a: &Value, b: &Value) -> ExecResult<Option<Value>> {
    match op {
        Operator::Plus => match (a, b) {
            (Value::Atom(x), Value::Atom(y)) => Ok(Some(Value::atom(&format!("{}{}", x, y)))),
            (Value::Dict(_), Value::Dict(_)) => Ok(concat(a, b)),
            _ => arith(a, b, "+", i64::checked_add, |x, y| x + y),
        },
        Operator::Times => match (a, b) {
            (Value::Dict(_), Value::Int(n)) | (Value::Int(n), Value::Dict(_)) => {
                let list = if matches!(a, Value::Dict(_)) { a } else { b };
                repeat_list(list, *n)
            }
            (Value::Atom(s), Value::Int(n)) | (Value::Int(n), Value::Atom(s)) => {
                let times = repeated_len("*", s.len(), *n)?;
                Ok(Some(Value::atom(&s.repeat(times))))
            }
            _ => arith(a, b, "*", i64::checked_mul, |x, y| x * y),
        },
        Operator::And => Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(Value::Int(x & y)),
            (Value::Set(x), Value::Set(y)) => Some(Value::Set(Arc::new(
                x.iter()
                    .filter(|v| Value::set_contains(y, v))
                    .cloned()
                    .collect(),
            ))),
            (Value::Dict(x), Value::Dict(y)) => Some(Value::Dict(Arc::new(
                x.iter()
                    .filter_map(|(k, v)| {
                        Value::dict_lookup(y, k).map(|w| (k.clone(), v.min(w).clone()))
                    })
                    .collect(),
            ))),
            _ => None,
        }),
        Operator::Or => Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(Value::Int(x | y)),
            (Value::Set(x), Value::Set(y)) => {
                Some(Value::set_from_iter(x.iter().chain(y.iter()).cloned()))
            }
            (Value::Dict(x), Value::Dict(y)) => {
                let mut merged = x.as_ref().clone();
                for (k, w) in y.iter() {
                    let keep = match Value::dict_lookup(&merged, k) {
                        Some(v) => v.max(w).clone(),
                        None => w.clone(),
                    };
                    Value::dict_insert(&mut merged, k.clone(), keep);
                }
                Some(Value::Dict(Arc::new(merged)))
            }
            _ => None,
        }),
        Operator::Xor => Ok(match (a, b) {
            (Value::Int(x), Value::Int(y)) => Some(Value::Int(x ^ y)),
            (Value::Set(x), Value::Set(y)) => Some(Value::set_from_iter(
                x.iter()
                    .filter(|v| !Value::set_contains(y, v))
                    .chain(y.iter().filter(|v| !Value::set_contains(x, v)))
                    .cloned(),
            )),
            _ => None,
        }),
        _ => Ok(None),
    }
}

/// Concatenate two list-shaped dicts, renumbering the right side.
fn concat(a: &Value, b: &Value) -> Option<Value> {
    let mut items = a.list_values()?;
    items.extend(b.list_values()?);
    Some(Value::list(items))
}

fn repeat_list(list: &Value, n: i64) -> ExecResult<Option<Value>> {
    let Some(items) = list.list_values() else {
        return Ok(None);
    };
    let times = repeated_len("*", items.len(), n)?;
    Ok(Some(Value::list(
        std::iter::repeat(items).take(times).flatten(),
    )))
}
