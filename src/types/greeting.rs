use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Top-level key identifying a QMP greeting.
pub(crate) const GREETING_KEY: &str = "QMP";

/// QMP greeting message.
///
/// QMP sends this as the very first JSON object after the socket is connected.
/// The object is kept verbatim; [`Greeting::info`] offers a typed view of the
/// usual `version` / `capabilities` members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Greeting(Value);

impl Greeting {
    /// Accept `value` if it carries the `QMP` key.
    pub fn from_value(value: Value) -> Result<Self> {
        match value.get(GREETING_KEY) {
            Some(_) => Ok(Self(value)),
            None => Err(Error::connect(format!(
                "greeting has no '{GREETING_KEY}' member"
            ))),
        }
    }

    /// The greeting as received.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Consume into the raw JSON object.
    #[must_use]
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Typed view of the `QMP` section, if it has the usual shape.
    #[must_use]
    pub fn info(&self) -> Option<QmpInfo> {
        self.0
            .get(GREETING_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// `QMP` section in the greeting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpInfo {
    /// Server version.
    pub version: QmpVersion,

    /// Supported capabilities.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// QEMU version information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersion {
    /// QEMU package version.
    pub qemu: QmpVersionNumber,

    /// Package string (when available).
    #[serde(default)]
    pub package: String,
}

/// Numeric version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpVersionNumber {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Micro version.
    pub micro: u64,
}
