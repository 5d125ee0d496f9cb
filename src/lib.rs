//! `qmp` - QEMU Machine Protocol client engine.
//!
//! The engine owns one byte-stream connection to a QMP peer (Unix or TCP) and
//! provides:
//! - connect (client role) and accept (server role, bounded wait)
//! - the greeting + `qmp_capabilities` handshake
//! - one-at-a-time command dispatch with the reply paired to its command
//! - an ordered queue of the events that arrive interleaved with replies,
//!   drained without blocking or with a bounded / unbounded wait
//!
//! No background task is spawned: messages are only read while a method of
//! [`Client`] is running, and every method takes `&mut self`.
//!
//! ## Quick start (Unix socket)
//!
//! ```no_run
//! use qmp::{Client, Endpoint, Wait};
//! # async fn demo() -> qmp::Result<()> {
//! let mut client = Client::new(Endpoint::unix("/var/run/qemu-server/100.qmp"));
//! let greeting = client.connect().await?;
//! println!("greeting = {}", greeting.as_value());
//!
//! // Raw reply:
//! let reply = client.cmd("query-status", None, None).await?;
//! println!("reply = {reply:?}");
//!
//! // Typed call:
//! let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
//! println!("status = {status}");
//!
//! // Events received so far, or the next one within five seconds:
//! for ev in client.get_events(Wait::Timeout(std::time::Duration::from_secs(5))).await? {
//!     println!("event: {}", ev.name);
//! }
//! client.clear_events();
//!
//! client.close().await?;
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod codec;
mod connection;
mod dispatcher;
mod event_queue;
mod negotiator;
mod transport;

pub mod error;
pub mod types;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use client::{Client, ClientBuilder, ConnectOptions, ConnectionState};
pub use error::{Error, ErrorKind, Result};
pub use event_queue::Wait;
pub use negotiator::NegotiationState;
pub use transport::{AsyncQmpStream, Endpoint, QmpStream};
