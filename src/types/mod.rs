//! Public data types.

mod event;
mod greeting;
mod message;

pub use event::{Event, EventFilter, EventMessage, Timestamp};
pub use greeting::{Greeting, QmpInfo, QmpVersion, QmpVersionNumber};
pub use message::{Command, Message, QmpError, QmpResponse};

#[cfg(any(test, feature = "mock"))]
pub(crate) use greeting::GREETING_KEY;
#[cfg(any(test, feature = "mock"))]
pub(crate) use message::CAPABILITIES_COMMAND;
