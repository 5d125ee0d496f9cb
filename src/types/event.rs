use serde::{Deserialize, Serialize};
use serde_json::Value;

/// QMP timestamp, typically included in event messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since epoch.
    pub seconds: i64,

    /// Microseconds within the second.
    pub microseconds: i64,
}

/// A decoded event.
///
/// This type is intentionally _lossless_:
/// - `name` keeps the original event name.
/// - `data` keeps an arbitrary JSON payload.
///
/// You can deserialize `data` into your own strongly typed struct when needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event name.
    pub name: String,

    /// Event data payload.
    #[serde(default)]
    pub data: Value,

    /// Optional timestamp.
    pub timestamp: Option<Timestamp>,
}

impl Event {
    /// The event as it appeared on the wire.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        serde_json::to_value(EventMessage::from(self.clone())).unwrap_or(Value::Null)
    }
}

/// Raw event message as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name.
    #[serde(rename = "event")]
    pub name: String,

    /// Event data payload.
    #[serde(default)]
    pub data: Value,

    /// Timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Timestamp>,
}

impl From<EventMessage> for Event {
    fn from(msg: EventMessage) -> Self {
        Self {
            name: msg.name,
            data: msg.data,
            timestamp: msg.timestamp,
        }
    }
}

impl From<Event> for EventMessage {
    fn from(ev: Event) -> Self {
        Self {
            name: ev.name,
            data: ev.data,
            timestamp: ev.timestamp,
        }
    }
}

/// Selects events by name and, optionally, by a partial payload pattern.
///
/// The pattern is matched against the wire form of the event
/// (`{"event": .., "data": .., "timestamp": ..}`): every key of the pattern
/// must be present, objects are compared recursively and everything else by
/// equality. `{"data": {"device": "drive0"}}` accepts any event whose data
/// has `device == "drive0"`, whatever other members it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFilter {
    /// Event name.
    pub name: String,

    /// Optional partial pattern.
    pub pattern: Option<Value>,
}

impl EventFilter {
    /// Match on the event name only.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
        }
    }

    /// Additionally require the wire form to contain `pattern`.
    #[must_use]
    pub fn with_pattern(mut self, pattern: Value) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Whether `event` is accepted by this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if event.name != self.name {
            return false;
        }

        match &self.pattern {
            Some(pattern) => partial_match(&event.to_wire(), pattern),
            None => true,
        }
    }
}

fn partial_match(value: &Value, pattern: &Value) -> bool {
    let Some(pattern) = pattern.as_object() else {
        return value == pattern;
    };

    let Some(value) = value.as_object() else {
        return false;
    };

    pattern.iter().all(|(key, want)| match value.get(key) {
        Some(got) if got.is_object() => partial_match(got, want),
        Some(got) => got == want,
        None => false,
    })
}
