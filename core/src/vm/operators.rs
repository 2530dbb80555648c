//! Binary and unary operator implementations.

use core::cmp::Ordering;

use crate::{parser::BinaryOp, values::Value, vm::RuntimeError};

/// Evaluate a binary operation for the instruction at `ip`.
pub(super) fn binary(
    ip: usize,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arithmetic(ip, op, left, right)
        }
        BinaryOp::Concat => {
            let mut text = left.to_text();
            text.push_str(&right.to_text());
            Ok(Value::Str(text))
        }
        BinaryOp::Eq => Ok(Value::Bool(left.loose_eq(right))),
        BinaryOp::Ne => Ok(Value::Bool(!left.loose_eq(right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = left.loose_cmp(right).ok_or_else(|| {
                RuntimeError::type_error(
                    ip,
                    format!(
                        "cannot compare {} with {} using '{}'",
                        left.kind(),
                        right.kind(),
                        op.symbol()
                    ),
                )
            })?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
    }
}

fn arithmetic(
    ip: usize,
    op: BinaryOp,
    left: &Value,
    right: &Value,
) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => binary_int(ip, op, *a, *b),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            if op == BinaryOp::Mod {
                return Err(RuntimeError::type_error(ip, "'%' requires int operands"));
            }
            binary_float(ip, op, as_float(left), as_float(right)).map(Value::Float)
        }
        _ => Err(RuntimeError::type_error(
            ip,
            format!(
                "unsupported operand kinds for '{}': {} and {}",
                op.symbol(),
                left.kind(),
                right.kind()
            ),
        )),
    }
}

fn as_float(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => f64::NAN,
    }
}

/// Evaluate an arithmetic operation on two integers.
///
/// Uses wrapping arithmetic to prevent panics on overflow. Division yields an
/// integer only when it is exact.
fn binary_int(ip: usize, op: BinaryOp, left: i64, right: i64) -> Result<Value, RuntimeError> {
    match op {
        BinaryOp::Add => Ok(Value::Int(left.wrapping_add(right))),
        BinaryOp::Sub => Ok(Value::Int(left.wrapping_sub(right))),
        BinaryOp::Mul => Ok(Value::Int(left.wrapping_mul(right))),
        BinaryOp::Div | BinaryOp::Mod if right == 0 => {
            Err(RuntimeError::type_error(ip, "division by zero"))
        }
        // Use wrapping_rem/wrapping_div to handle the i64::MIN / -1 case
        BinaryOp::Div if left.wrapping_rem(right) == 0 => Ok(Value::Int(left.wrapping_div(right))),
        BinaryOp::Div => Ok(Value::Float(left as f64 / right as f64)),
        BinaryOp::Mod => Ok(Value::Int(left.wrapping_rem(right))),
        _ => Err(RuntimeError::type_error(
            ip,
            format!("'{}' is not arithmetic", op.symbol()),
        )),
    }
}

/// Evaluate an arithmetic operation on two floats.
fn binary_float(ip: usize, op: BinaryOp, left: f64, right: f64) -> Result<f64, RuntimeError> {
    match op {
        BinaryOp::Add => Ok(left + right),
        BinaryOp::Sub => Ok(left - right),
        BinaryOp::Mul => Ok(left * right),
        BinaryOp::Div if right == 0.0 => Err(RuntimeError::type_error(ip, "division by zero")),
        BinaryOp::Div => Ok(left / right),
        _ => Err(RuntimeError::type_error(
            ip,
            format!("'{}' is not defined for floats", op.symbol()),
        )),
    }
}

pub(super) fn negate(ip: usize, value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
        Value::Float(f) => Ok(Value::Float(-f)),
        other => Err(RuntimeError::type_error(
            ip,
            format!("cannot negate a {} value", other.kind()),
        )),
    }
}
