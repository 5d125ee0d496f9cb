use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::types::{Event, EventMessage};

/// Name of the negotiation command that leaves capabilities mode.
pub(crate) const CAPABILITIES_COMMAND: &str = "qmp_capabilities";

/// A command object as sent on the wire.
///
/// `arguments` is only serialized when non-empty and `id` only when supplied,
/// so `Command::new("bar")` encodes as exactly `{"execute":"bar"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Command name.
    pub execute: String,

    /// Arguments object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,

    /// Correlation id, echoed back by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl Command {
    /// A command with no arguments and no id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            execute: name.into(),
            arguments: None,
            id: None,
        }
    }

    /// Attach an arguments object.
    ///
    /// `null` and `{}` leave the command without arguments; any other
    /// non-object value is rejected.
    pub fn with_arguments(mut self, args: Value) -> Result<Self> {
        self.arguments = match args {
            Value::Null => None,
            Value::Object(map) if map.is_empty() => None,
            Value::Object(map) => Some(map),
            other => {
                return Err(Error::protocol(format!(
                    "arguments for '{}' must be a JSON object, got {other}",
                    self.execute
                )));
            }
        };
        Ok(self)
    }

    /// Serialize `args` and attach it as the arguments object.
    pub fn with_serialized_arguments<A: Serialize>(self, args: &A) -> Result<Self> {
        let value = serde_json::to_value(args).map_err(Error::from)?;
        self.with_arguments(value)
    }

    /// Set a single argument.
    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub(crate) fn capabilities(enable: &[String]) -> Self {
        let cmd = Self::new(CAPABILITIES_COMMAND);
        if enable.is_empty() {
            cmd
        } else {
            cmd.arg("enable", enable.to_vec())
        }
    }
}

/// The `error` object returned by QMP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpError {
    /// Error class; empty when the server sent none.
    #[serde(default)]
    pub class: String,
    /// Error description; empty when the server sent none.
    #[serde(default)]
    pub desc: String,
}

impl QmpError {
    /// Read whatever the server put under `error`, never failing.
    ///
    /// A bare string becomes the description; any other shape that does not
    /// fit is kept as its JSON text.
    fn lenient(value: Value) -> Self {
        match value {
            Value::String(desc) => Self {
                class: String::new(),
                desc,
            },
            other => serde_json::from_value(other.clone()).unwrap_or_else(|_| Self {
                class: String::new(),
                desc: other.to_string(),
            }),
        }
    }
}

/// QMP command response.
///
/// Anything read while a command is outstanding that is not an event is
/// taken as the reply, whatever its shape. Members other than `return`,
/// `error` and `id` are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QmpResponse {
    /// Request id, echoed by the server when the command carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    /// Success payload.
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Error payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QmpError>,

    /// Any other top-level members.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl QmpResponse {
    /// Build a reply from a decoded object without rejecting any shape.
    #[must_use]
    pub fn from_object(mut map: Map<String, Value>) -> Self {
        Self {
            id: map.remove("id"),
            result: map.remove("return"),
            error: map.remove("error").map(QmpError::lenient),
            extra: map,
        }
    }

    /// Whether the reply carries a `return` member.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_some() && self.error.is_none()
    }
}

/// A decoded server message, tagged by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Asynchronous notification (has an `event` key).
    Event(Event),
    /// Everything else.
    Reply(QmpResponse),
}

impl Message {
    /// Classify a raw JSON object.
    pub fn classify(value: Value) -> Result<Self> {
        if value.get("event").is_some() {
            let ev: EventMessage = serde_json::from_value(value).map_err(|e| Error::Protocol {
                message: format!("malformed event: {e}"),
            })?;
            return Ok(Self::Event(Event::from(ev)));
        }

        match value {
            Value::Object(map) => Ok(Self::Reply(QmpResponse::from_object(map))),
            other => Err(Error::protocol(format!("expected a JSON object, got {other}"))),
        }
    }
}
