//! Trigger/event matching.

use hypha_core::Event;

use crate::criteria::{Criteria, EvalError};
use crate::index::wildcard_match;
use crate::types::Trigger;
use crate::view::{event_view, EXT_OBJECT_TYPE};

/// Does the trigger's namespace selection cover this namespace? An empty
/// selection covers everything.
pub fn namespace_matches(trigger: &Trigger, namespace: &str) -> bool {
    trigger.namespaces.is_empty()
        || trigger
            .namespaces
            .iter()
            .any(|pattern| wildcard_match(pattern, namespace))
}

/// Returns whether the event satisfies the trigger.
///
/// Disabled triggers never match. With empty criteria the trigger matches
/// on the (event_type, namespaces, object_type) predicates, each treating
/// empty as "any". Otherwise the criteria expression decides; it must
/// evaluate to a boolean.
pub fn match_trigger(trigger: &Trigger, event: &Event) -> Result<bool, EvalError> {
    if !trigger.enabled {
        return Ok(false);
    }

    if trigger.criteria.is_empty() {
        let type_ok = trigger.event_type.is_empty() || trigger.event_type == event.ty();
        let object_ok = trigger.object_type.is_empty()
            || trigger.object_type == event.extension_str(EXT_OBJECT_TYPE);
        return Ok(type_ok && namespace_matches(trigger, event.source()) && object_ok);
    }

    let criteria = Criteria::compile(&trigger.criteria)?;
    criteria.evaluate(&event_view(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn trigger() -> Trigger {
        Trigger {
            id: "t".into(),
            name: "t".into(),
            namespaces: Vec::new(),
            object_type: String::new(),
            event_type: String::new(),
            criteria: String::new(),
            description: String::new(),
            enabled: true,
            action: "fn".into(),
        }
    }

    fn user_updated(role_after: &str) -> Event {
        Event::builder("e-1", "prod", "user.updated")
            .extension(EXT_OBJECT_TYPE, "User")
            .json_data(json!({"before": {"role": "user"}, "after": {"role": role_after}}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_disabled_never_matches() {
        let mut t = trigger();
        t.enabled = false;
        assert_eq!(match_trigger(&t, &user_updated("admin")), Ok(false));
    }

    #[test]
    fn test_empty_criteria_matches_on_predicates() {
        let mut t = trigger();
        t.event_type = "user.updated".into();
        t.object_type = "User".into();
        t.namespaces = vec!["prod".into()];
        assert_eq!(match_trigger(&t, &user_updated("admin")), Ok(true));

        t.event_type = "user.created".into();
        assert_eq!(match_trigger(&t, &user_updated("admin")), Ok(false));
    }

    #[test]
    fn test_empty_predicates_mean_any() {
        let t = trigger();
        assert_eq!(match_trigger(&t, &user_updated("admin")), Ok(true));
    }

    #[test]
    fn test_object_type_predicate() {
        let mut t = trigger();
        t.object_type = "Order".into();
        assert_eq!(match_trigger(&t, &user_updated("admin")), Ok(false));
    }

    #[test]
    fn test_criteria_decides_match() {
        let mut t = trigger();
        t.event_type = "user.updated".into();
        t.criteria = r#"event.payload.after.role == "admin""#.into();

        assert_eq!(match_trigger(&t, &user_updated("admin")), Ok(true));
        assert_eq!(match_trigger(&t, &user_updated("user")), Ok(false));
    }

    #[test]
    fn test_criteria_error_propagates() {
        let mut t = trigger();
        t.criteria = "event.event_id".into(); // non-boolean result
        assert!(match_trigger(&t, &user_updated("admin")).is_err());
    }

    #[test]
    fn test_namespace_matches_wildcards() {
        let mut t = trigger();
        t.namespaces = vec!["prod-*".into()];
        assert!(namespace_matches(&t, "prod-eu"));
        assert!(!namespace_matches(&t, "dev"));

        t.namespaces.clear();
        assert!(namespace_matches(&t, "anything"));
    }
}
