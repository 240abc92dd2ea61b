//! The criteria expression language.
//!
//! A criteria is a boolean expression over a single root identifier,
//! `event`, bound to the structured view of the incoming event (see
//! [`view`](crate::view)):
//!
//! ```text
//! event.event_type == "user.updated" && event.payload.after.role == "admin"
//! event.namespace < "m" || has(event.payload.after, "billing.plan")
//! !(event.actor.type == "system")
//! ```
//!
//! Supported: logical `&&`, `||`, `!`; comparisons `==`, `!=`, `<`, `<=`,
//! `>`, `>=`; string, number and boolean literals; member access with `.`;
//! and the builtin `has(obj, "a.b.c")`, true iff every segment of the
//! dotted path exists as a nested key. Expressions must evaluate to a
//! boolean; any other result type is an evaluation error.
//!
//! Absent members resolve to `null`; `null` compares unequal to every
//! string and number, so `event.payload.after.role == "admin"` is simply
//! false when the payload has no `role`.

mod eval;
mod lexer;
mod parser;

use thiserror::Error;

pub(crate) use parser::Expr;

/// Criteria compile or evaluation failure. Never surfaced to clients; the
/// dispatcher logs it and skips the trigger.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("evaluation error: {0}")]
    Eval(String),

    #[error("criteria must evaluate to a boolean, got {0}")]
    NotBoolean(&'static str),
}

/// A compiled criteria expression.
#[derive(Debug, Clone)]
pub struct Criteria {
    source: String,
    root: Expr,
}

impl Criteria {
    pub fn compile(source: &str) -> Result<Self, EvalError> {
        let tokens = lexer::tokenize(source)?;
        let root = parser::parse(&tokens)?;
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an environment; the root object holds the `event`
    /// binding.
    pub fn evaluate(&self, env: &serde_json::Value) -> Result<bool, EvalError> {
        match eval::evaluate(&self.root, env)? {
            serde_json::Value::Bool(b) => Ok(b),
            other => Err(EvalError::NotBoolean(eval::type_name(&other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn env() -> serde_json::Value {
        json!({
            "event": {
                "event_id": "e-1",
                "event_type": "user.updated",
                "namespace": "prod",
                "object_type": "User",
                "actor": {"type": "user", "id": "u-9"},
                "payload": {
                    "before": {"role": "user"},
                    "after": {"role": "admin", "login_count": 3},
                },
            }
        })
    }

    fn eval(source: &str) -> Result<bool, EvalError> {
        Criteria::compile(source)?.evaluate(&env())
    }

    #[test]
    fn test_equality() {
        assert_eq!(eval(r#"event.event_type == "user.updated""#), Ok(true));
        assert_eq!(eval(r#"event.event_type == "user.created""#), Ok(false));
        assert_eq!(eval(r#"event.event_type != "user.created""#), Ok(true));
    }

    #[test]
    fn test_nested_member_access() {
        assert_eq!(eval(r#"event.payload.after.role == "admin""#), Ok(true));
        assert_eq!(eval(r#"event.payload.before.role == "admin""#), Ok(false));
    }

    #[test]
    fn test_logical_operators() {
        assert_eq!(
            eval(r#"event.namespace == "prod" && event.payload.after.role == "admin""#),
            Ok(true)
        );
        assert_eq!(
            eval(r#"event.namespace == "dev" || event.object_type == "User""#),
            Ok(true)
        );
        assert_eq!(eval(r#"!(event.actor.type == "system")"#), Ok(true));
    }

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(eval("event.payload.after.login_count >= 3"), Ok(true));
        assert_eq!(eval("event.payload.after.login_count < 3"), Ok(false));
    }

    #[test]
    fn test_string_ordering() {
        assert_eq!(eval(r#"event.namespace < "qa""#), Ok(true));
    }

    #[test]
    fn test_has_builtin() {
        assert_eq!(eval(r#"has(event.payload.after, "role")"#), Ok(true));
        assert_eq!(eval(r#"has(event.payload.after, "billing.plan")"#), Ok(false));
        assert_eq!(eval(r#"has(event.payload, "after.role")"#), Ok(true));
        // has() on a non-object is false, not an error
        assert_eq!(eval(r#"has(event.event_id, "x")"#), Ok(false));
    }

    #[test]
    fn test_absent_member_is_null_and_unequal() {
        assert_eq!(eval(r#"event.payload.after.missing == "x""#), Ok(false));
        assert_eq!(eval(r#"event.payload.after.missing != "x""#), Ok(true));
    }

    #[test]
    fn test_non_boolean_result_is_error() {
        assert_eq!(
            eval("event.event_id"),
            Err(EvalError::NotBoolean("string"))
        );
        assert!(matches!(
            eval("event.payload.after.login_count"),
            Err(EvalError::NotBoolean("number"))
        ));
    }

    #[test]
    fn test_unknown_root_identifier_is_error() {
        assert!(matches!(eval("msg.kind == \"x\""), Err(EvalError::Eval(_))));
    }

    #[test]
    fn test_ordering_type_mismatch_is_error() {
        assert!(matches!(
            eval(r#"event.payload.after < "x""#),
            Err(EvalError::Eval(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Criteria::compile("event.=="), Err(EvalError::Parse(_))));
        assert!(matches!(Criteria::compile("a && "), Err(EvalError::Parse(_))));
        assert!(matches!(Criteria::compile("size(event)"), Err(EvalError::Parse(_))));
        assert!(matches!(Criteria::compile(""), Err(EvalError::Parse(_))));
    }

    #[test]
    fn test_logical_operand_must_be_boolean() {
        assert!(matches!(
            eval(r#"event.event_id && event.namespace == "prod""#),
            Err(EvalError::Eval(_))
        ));
    }
}
