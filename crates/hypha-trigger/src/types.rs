//! The trigger document.

use serde::{Deserialize, Serialize};

use crate::error::{TriggerError, TriggerResult};

/// A trigger binds a slice of the event stream to a function.
///
/// `namespaces` is a list of patterns matched against the event's source;
/// a pattern is either a literal or contains `*`, which matches any
/// substring. Absent or empty means all namespaces. `criteria` is an
/// expression in the [`criteria`](crate::criteria) language; when empty,
/// matching falls back to the (event_type, namespaces, object_type)
/// predicates. `action` names the function to invoke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub object_type: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub criteria: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub enabled: bool,
    pub action: String,
}

impl Trigger {
    /// Reject documents the dispatcher cannot act on.
    pub fn validate(&self) -> TriggerResult<()> {
        if self.id.is_empty() {
            return Err(TriggerError::invalid("id must not be empty"));
        }
        if self.action.is_empty() {
            return Err(TriggerError::invalid(format!(
                "trigger '{}' has no action",
                self.id
            )));
        }
        Ok(())
    }

    pub fn to_yaml(&self) -> TriggerResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(document: &str) -> TriggerResult<Self> {
        let trigger: Trigger = serde_yaml::from_str(document)?;
        trigger.validate()?;
        Ok(trigger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_round_trip() {
        let trigger = Trigger {
            id: "t-1".into(),
            name: "admin promotions".into(),
            namespaces: vec!["prod".into(), "staging-*".into()],
            object_type: "User".into(),
            event_type: "user.updated".into(),
            criteria: r#"event.payload.after.role == "admin""#.into(),
            description: String::new(),
            enabled: true,
            action: "notify-admins".into(),
        };
        let yaml = trigger.to_yaml().unwrap();
        let parsed = Trigger::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, trigger);
    }

    #[test]
    fn test_from_yaml_defaults() {
        let parsed = Trigger::from_yaml(
            "id: t-2\nname: all events\nenabled: true\naction: audit-log\n",
        )
        .unwrap();
        assert!(parsed.namespaces.is_empty());
        assert!(parsed.criteria.is_empty());
        assert!(parsed.event_type.is_empty());
    }

    #[test]
    fn test_validation_rejects_missing_action() {
        let result = Trigger::from_yaml("id: t-3\nname: broken\nenabled: true\naction: ''\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_json_field_names() {
        let trigger = Trigger::from_yaml(
            "id: t-4\nname: n\nobject_type: Order\nevent_type: order.created\nenabled: false\naction: a\n",
        )
        .unwrap();
        let json = serde_json::to_value(&trigger).unwrap();
        assert_eq!(json["object_type"], "Order");
        assert_eq!(json["event_type"], "order.created");
        assert_eq!(json["enabled"], false);
    }
}
