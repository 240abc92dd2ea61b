//! Structured event envelope.
//!
//! Events are the single currency of the runtime: they arrive as invocation
//! arguments, flow over the event stream, and come back out of functions as
//! results. The envelope carries the four required attributes (`id`,
//! `source`, `type`, `specversion`), the optional standard attributes, a
//! flat extension map of scalar values, and an optional payload that is
//! either structured JSON or raw bytes.
//!
//! Events are value objects. There are no mutators; construct them through
//! [`EventBuilder`] and treat them as immutable afterwards. The JSON codec
//! preserves every attribute and every extension across a round trip.

use std::collections::BTreeMap;
use std::fmt;

use base64::Engine as _;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Attribute names that are part of the envelope itself and therefore can
/// never be used as extension keys.
const RESERVED_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "type",
    "specversion",
    "time",
    "subject",
    "datacontenttype",
    "dataschema",
    "data",
    "data_base64",
];

/// A scalar extension attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtensionValue {
    String(String),
    Bool(bool),
    Integer(i64),
}

impl ExtensionValue {
    /// View the value as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ExtensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{}", s),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Integer(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for ExtensionValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for ExtensionValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for ExtensionValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for ExtensionValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

/// Event payload: structured JSON or opaque bytes.
///
/// JSON payloads serialize under the `data` member; binary payloads under
/// `data_base64` with standard base64 encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

/// The structured event envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: String,
    source: String,
    ty: String,
    specversion: String,
    time: Option<String>,
    subject: Option<String>,
    datacontenttype: Option<String>,
    dataschema: Option<String>,
    extensions: BTreeMap<String, ExtensionValue>,
    data: Option<EventData>,
}

impl Event {
    /// Start building an event with the three caller-supplied required
    /// attributes. `specversion` defaults to `1.0`.
    pub fn builder(
        id: impl Into<String>,
        source: impl Into<String>,
        ty: impl Into<String>,
    ) -> EventBuilder {
        EventBuilder::new(id, source, ty)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ty(&self) -> &str {
        &self.ty
    }

    pub fn specversion(&self) -> &str {
        &self.specversion
    }

    pub fn time(&self) -> Option<&str> {
        self.time.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn datacontenttype(&self) -> Option<&str> {
        self.datacontenttype.as_deref()
    }

    pub fn dataschema(&self) -> Option<&str> {
        self.dataschema.as_deref()
    }

    pub fn extensions(&self) -> &BTreeMap<String, ExtensionValue> {
        &self.extensions
    }

    /// Look up an extension attribute.
    pub fn extension(&self, key: &str) -> Option<&ExtensionValue> {
        self.extensions.get(key)
    }

    /// Look up a string extension attribute, or `""` when it is absent or
    /// not a string. This is the resolution rule the trigger view relies on.
    pub fn extension_str(&self, key: &str) -> &str {
        self.extensions
            .get(key)
            .and_then(ExtensionValue::as_str)
            .unwrap_or("")
    }

    pub fn data(&self) -> Option<&EventData> {
        self.data.as_ref()
    }

    /// The JSON payload, if the event carries one.
    pub fn json_data(&self) -> Option<&serde_json::Value> {
        match &self.data {
            Some(EventData::Json(value)) => Some(value),
            _ => None,
        }
    }

    /// Encode to the canonical JSON wire form.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the canonical JSON wire form.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builder for [`Event`].
#[derive(Debug, Clone)]
pub struct EventBuilder {
    id: String,
    source: String,
    ty: String,
    specversion: String,
    time: Option<String>,
    subject: Option<String>,
    datacontenttype: Option<String>,
    dataschema: Option<String>,
    extensions: BTreeMap<String, ExtensionValue>,
    data: Option<EventData>,
}

impl EventBuilder {
    fn new(id: impl Into<String>, source: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            ty: ty.into(),
            specversion: "1.0".to_string(),
            time: None,
            subject: None,
            datacontenttype: None,
            dataschema: None,
            extensions: BTreeMap::new(),
            data: None,
        }
    }

    pub fn specversion(mut self, specversion: impl Into<String>) -> Self {
        self.specversion = specversion.into();
        self
    }

    /// Set the `time` attribute. Must be an RFC 3339 timestamp; validated at
    /// `build` time so the wire form is preserved verbatim.
    pub fn time(mut self, time: impl Into<String>) -> Self {
        self.time = Some(time.into());
        self
    }

    /// Stamp the event with the current UTC time.
    pub fn time_now(mut self) -> Self {
        self.time = Some(chrono::Utc::now().to_rfc3339());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn datacontenttype(mut self, ct: impl Into<String>) -> Self {
        self.datacontenttype = Some(ct.into());
        self
    }

    pub fn dataschema(mut self, schema: impl Into<String>) -> Self {
        self.dataschema = Some(schema.into());
        self
    }

    pub fn extension(mut self, key: impl Into<String>, value: impl Into<ExtensionValue>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Attach a structured JSON payload with content type
    /// `application/json`.
    pub fn json_data(mut self, value: serde_json::Value) -> Self {
        self.datacontenttype
            .get_or_insert_with(|| "application/json".to_string());
        self.data = Some(EventData::Json(value));
        self
    }

    /// Attach an opaque byte payload.
    pub fn binary_data(mut self, bytes: Vec<u8>) -> Self {
        self.data = Some(EventData::Binary(bytes));
        self
    }

    /// Validate and freeze the event.
    pub fn build(self) -> Result<Event> {
        if self.id.is_empty() {
            return Err(CoreError::invalid_event("id must not be empty"));
        }
        if self.source.is_empty() {
            return Err(CoreError::invalid_event("source must not be empty"));
        }
        if self.ty.is_empty() {
            return Err(CoreError::invalid_event("type must not be empty"));
        }
        if self.specversion.is_empty() {
            return Err(CoreError::invalid_event("specversion must not be empty"));
        }
        if let Some(time) = &self.time {
            chrono::DateTime::parse_from_rfc3339(time).map_err(|e| {
                CoreError::invalid_event(format!("time is not RFC 3339: {}", e))
            })?;
        }
        for key in self.extensions.keys() {
            if RESERVED_ATTRIBUTES.contains(&key.as_str()) {
                return Err(CoreError::invalid_event(format!(
                    "extension key '{}' shadows a standard attribute",
                    key
                )));
            }
        }
        Ok(Event {
            id: self.id,
            source: self.source,
            ty: self.ty,
            specversion: self.specversion,
            time: self.time,
            subject: self.subject,
            datacontenttype: self.datacontenttype,
            dataschema: self.dataschema,
            extensions: self.extensions,
            data: self.data,
        })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("specversion", &self.specversion)?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("source", &self.source)?;
        map.serialize_entry("type", &self.ty)?;
        if let Some(time) = &self.time {
            map.serialize_entry("time", time)?;
        }
        if let Some(subject) = &self.subject {
            map.serialize_entry("subject", subject)?;
        }
        if let Some(ct) = &self.datacontenttype {
            map.serialize_entry("datacontenttype", ct)?;
        }
        if let Some(schema) = &self.dataschema {
            map.serialize_entry("dataschema", schema)?;
        }
        for (key, value) in &self.extensions {
            match value {
                ExtensionValue::String(s) => map.serialize_entry(key, s)?,
                ExtensionValue::Bool(b) => map.serialize_entry(key, b)?,
                ExtensionValue::Integer(i) => map.serialize_entry(key, i)?,
            }
        }
        match &self.data {
            Some(EventData::Json(value)) => map.serialize_entry("data", value)?,
            Some(EventData::Binary(bytes)) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                map.serialize_entry("data_base64", &encoded)?;
            }
            None => {}
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_map(EventVisitor)
    }
}

struct EventVisitor;

impl<'de> Visitor<'de> for EventVisitor {
    type Value = Event;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a structured event object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Event, A::Error> {
        let mut id = None;
        let mut source = None;
        let mut ty = None;
        let mut specversion = None;
        let mut time = None;
        let mut subject = None;
        let mut datacontenttype = None;
        let mut dataschema = None;
        let mut extensions = BTreeMap::new();
        let mut data = None;

        while let Some(key) = access.next_key::<String>()? {
            match key.as_str() {
                "id" => id = Some(access.next_value::<String>()?),
                "source" => source = Some(access.next_value::<String>()?),
                "type" => ty = Some(access.next_value::<String>()?),
                "specversion" => specversion = Some(access.next_value::<String>()?),
                "time" => time = Some(access.next_value::<String>()?),
                "subject" => subject = Some(access.next_value::<String>()?),
                "datacontenttype" => datacontenttype = Some(access.next_value::<String>()?),
                "dataschema" => dataschema = Some(access.next_value::<String>()?),
                "data" => data = Some(EventData::Json(access.next_value()?)),
                "data_base64" => {
                    let encoded = access.next_value::<String>()?;
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(encoded.as_bytes())
                        .map_err(|e| de::Error::custom(format!("invalid data_base64: {}", e)))?;
                    data = Some(EventData::Binary(bytes));
                }
                _ => {
                    let value = access.next_value::<serde_json::Value>()?;
                    let ext = match value {
                        serde_json::Value::String(s) => ExtensionValue::String(s),
                        serde_json::Value::Bool(b) => ExtensionValue::Bool(b),
                        serde_json::Value::Number(n) => match n.as_i64() {
                            Some(i) => ExtensionValue::Integer(i),
                            None => {
                                return Err(de::Error::custom(format!(
                                    "extension '{}' must be an integer",
                                    key
                                )))
                            }
                        },
                        _ => {
                            return Err(de::Error::custom(format!(
                                "extension '{}' must be a scalar",
                                key
                            )))
                        }
                    };
                    extensions.insert(key, ext);
                }
            }
        }

        Ok(Event {
            id: id.ok_or_else(|| de::Error::missing_field("id"))?,
            source: source.ok_or_else(|| de::Error::missing_field("source"))?,
            ty: ty.ok_or_else(|| de::Error::missing_field("type"))?,
            specversion: specversion.ok_or_else(|| de::Error::missing_field("specversion"))?,
            time,
            subject,
            datacontenttype,
            dataschema,
            extensions,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_event() -> Event {
        Event::builder("ev-42", "orders", "order.created")
            .time("2026-03-01T12:00:00Z")
            .subject("order/42")
            .extension("objecttype", "Order")
            .extension("objectid", "42")
            .extension("sequence", 7i64)
            .extension("replayed", false)
            .json_data(json!({"before": null, "after": {"total": 99}}))
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_core_attributes() {
        assert!(Event::builder("", "s", "t").build().is_err());
        assert!(Event::builder("i", "", "t").build().is_err());
        assert!(Event::builder("i", "s", "").build().is_err());
        assert!(Event::builder("i", "s", "t").build().is_ok());
    }

    #[test]
    fn test_builder_rejects_bad_time() {
        let result = Event::builder("i", "s", "t").time("yesterday").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_reserved_extension() {
        let result = Event::builder("i", "s", "t").extension("id", "x").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_json_round_trip_preserves_everything() {
        let event = sample_event();
        let bytes = event.to_json().unwrap();
        let decoded = Event::from_json(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn test_round_trip_preserves_extension_types() {
        let event = sample_event();
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            decoded.extension("sequence"),
            Some(&ExtensionValue::Integer(7))
        );
        assert_eq!(
            decoded.extension("replayed"),
            Some(&ExtensionValue::Bool(false))
        );
        assert_eq!(decoded.extension_str("objecttype"), "Order");
    }

    #[test]
    fn test_unknown_members_become_extensions() {
        let decoded = Event::from_json(
            br#"{"specversion":"1.0","id":"1","source":"s","type":"t","tenant":"acme"}"#,
        )
        .unwrap();
        assert_eq!(decoded.extension_str("tenant"), "acme");
    }

    #[test]
    fn test_missing_required_attribute_fails() {
        let result = Event::from_json(br#"{"specversion":"1.0","id":"1","source":"s"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_binary_payload_round_trip() {
        let event = Event::builder("b-1", "blobs", "blob.stored")
            .binary_data(vec![0, 159, 146, 150])
            .build()
            .unwrap();
        let decoded = Event::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(decoded.data(), Some(&EventData::Binary(vec![0, 159, 146, 150])));
    }

    #[test]
    fn test_extension_str_defaults_to_empty() {
        let event = Event::builder("1", "s", "t").build().unwrap();
        assert_eq!(event.extension_str("actortype"), "");
    }

    #[test]
    fn test_json_data_sets_content_type() {
        let event = Event::builder("1", "s", "t")
            .json_data(json!({"k": "v"}))
            .build()
            .unwrap();
        assert_eq!(event.datacontenttype(), Some("application/json"));
    }
}
