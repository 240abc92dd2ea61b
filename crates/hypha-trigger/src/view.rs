//! The structured event view criteria expressions evaluate against.
//!
//! Maps the envelope onto the flat shape the expression language exposes
//! under the root `event` binding: `namespace` is the envelope's `source`,
//! the object/actor/context fields come from well-known extension
//! attributes, and `payload.{before,after}` are lifted out of the JSON data
//! payload. Missing scalar fields resolve to empty strings; missing payload
//! halves resolve to null.

use serde_json::{json, Value};

use hypha_core::Event;

/// Extension attribute names the view reads.
pub const EXT_EVENT_VERSION: &str = "eventversion";
pub const EXT_OBJECT_TYPE: &str = "objecttype";
pub const EXT_OBJECT_ID: &str = "objectid";
pub const EXT_ACTOR_TYPE: &str = "actortype";
pub const EXT_ACTOR_ID: &str = "actorid";
pub const EXT_REQUEST_ID: &str = "requestid";
pub const EXT_TRACE_ID: &str = "traceid";

/// Build the evaluation environment for one event.
pub fn event_view(event: &Event) -> Value {
    let (before, after) = match event.json_data() {
        Some(Value::Object(map)) => (
            map.get("before").cloned().unwrap_or(Value::Null),
            map.get("after").cloned().unwrap_or(Value::Null),
        ),
        _ => (Value::Null, Value::Null),
    };

    json!({
        "event": {
            "event_id": event.id(),
            "event_type": event.ty(),
            "event_version": event.extension_str(EXT_EVENT_VERSION),
            "namespace": event.source(),
            "object_type": event.extension_str(EXT_OBJECT_TYPE),
            "object_id": event.extension_str(EXT_OBJECT_ID),
            "timestamp": event.time().unwrap_or(""),
            "actor": {
                "type": event.extension_str(EXT_ACTOR_TYPE),
                "id": event.extension_str(EXT_ACTOR_ID),
            },
            "context": {
                "request_id": event.extension_str(EXT_REQUEST_ID),
                "trace_id": event.extension_str(EXT_TRACE_ID),
            },
            "payload": {
                "before": before,
                "after": after,
            },
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_view() {
        let event = Event::builder("e-1", "prod", "user.updated")
            .time("2026-03-01T12:00:00Z")
            .extension(EXT_OBJECT_TYPE, "User")
            .extension(EXT_OBJECT_ID, "u-7")
            .extension(EXT_ACTOR_TYPE, "user")
            .extension(EXT_ACTOR_ID, "admin-1")
            .extension(EXT_REQUEST_ID, "r-1")
            .extension(EXT_TRACE_ID, "tr-1")
            .json_data(json!({"before": {"role": "user"}, "after": {"role": "admin"}}))
            .build()
            .unwrap();

        let view = event_view(&event);
        assert_eq!(view["event"]["event_id"], "e-1");
        assert_eq!(view["event"]["namespace"], "prod");
        assert_eq!(view["event"]["event_type"], "user.updated");
        assert_eq!(view["event"]["object_type"], "User");
        assert_eq!(view["event"]["actor"]["type"], "user");
        assert_eq!(view["event"]["context"]["trace_id"], "tr-1");
        assert_eq!(view["event"]["payload"]["after"]["role"], "admin");
    }

    #[test]
    fn test_bare_event_resolves_to_empty_strings() {
        let event = Event::builder("e-2", "ns", "t").build().unwrap();
        let view = event_view(&event);
        assert_eq!(view["event"]["actor"]["type"], "");
        assert_eq!(view["event"]["actor"]["id"], "");
        assert_eq!(view["event"]["context"]["request_id"], "");
        assert_eq!(view["event"]["object_type"], "");
        assert_eq!(view["event"]["timestamp"], "");
        assert_eq!(view["event"]["payload"]["before"], Value::Null);
    }

    #[test]
    fn test_binary_payload_yields_null_halves() {
        let event = Event::builder("e-3", "ns", "t")
            .binary_data(vec![1, 2, 3])
            .build()
            .unwrap();
        let view = event_view(&event);
        assert_eq!(view["event"]["payload"]["before"], Value::Null);
        assert_eq!(view["event"]["payload"]["after"], Value::Null);
    }
}
