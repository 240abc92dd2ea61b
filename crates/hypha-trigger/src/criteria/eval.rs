//! Tree-walking evaluator over `serde_json::Value`.

use serde_json::Value;

use super::parser::{CmpOp, Expr};
use super::EvalError;

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub(crate) fn evaluate(expr: &Expr, env: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::String(s) => Ok(Value::String(s.clone())),
        Expr::Number(n) => Ok(serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Path(path) => resolve_path(path, env),
        Expr::Not(operand) => match evaluate(operand, env)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(EvalError::Eval(format!(
                "'!' needs a boolean operand, got {}",
                type_name(&other)
            ))),
        },
        Expr::And(left, right) => {
            if !boolean(left, env, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(boolean(right, env, "&&")?))
        }
        Expr::Or(left, right) => {
            if boolean(left, env, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(boolean(right, env, "||")?))
        }
        Expr::Compare(op, left, right) => {
            let left = evaluate(left, env)?;
            let right = evaluate(right, env)?;
            compare(*op, &left, &right).map(Value::Bool)
        }
        Expr::Has(object, path) => {
            let object = evaluate(object, env)?;
            Ok(Value::Bool(has(&object, path)))
        }
    }
}

fn boolean(expr: &Expr, env: &Value, op: &str) -> Result<bool, EvalError> {
    match evaluate(expr, env)? {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::Eval(format!(
            "'{}' needs boolean operands, got {}",
            op,
            type_name(&other)
        ))),
    }
}

/// Resolve a dotted path against the environment. The root segment must be
/// a known binding; below that, absent members resolve to null.
fn resolve_path(path: &[String], env: &Value) -> Result<Value, EvalError> {
    let root = &path[0];
    let Some(mut current) = env.get(root.as_str()) else {
        return Err(EvalError::Eval(format!("unknown identifier '{}'", root)));
    };
    for segment in &path[1..] {
        match current.get(segment.as_str()) {
            Some(next) => current = next,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, EvalError> {
    match op {
        CmpOp::Eq => Ok(left == right),
        CmpOp::Ne => Ok(left != right),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (left, right) {
                (Value::Number(l), Value::Number(r)) => {
                    let l = l.as_f64().unwrap_or(f64::NAN);
                    let r = r.as_f64().unwrap_or(f64::NAN);
                    l.partial_cmp(&r).ok_or_else(|| {
                        EvalError::Eval("cannot order non-finite numbers".to_string())
                    })?
                }
                (Value::String(l), Value::String(r)) => l.cmp(r),
                (l, r) => {
                    return Err(EvalError::Eval(format!(
                        "cannot order {} and {}",
                        type_name(l),
                        type_name(r)
                    )))
                }
            };
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                CmpOp::Eq | CmpOp::Ne => unreachable!(),
            })
        }
    }
}

/// `has(obj, "a.b.c")`: true iff every segment exists as a nested key.
/// Non-objects never contain anything.
fn has(object: &Value, path: &str) -> bool {
    let mut current = object;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return false,
            },
            _ => return false,
        }
    }
    true
}
