//! Mock peer and transcript replay helpers.
//!
//! This module is intended for:
//! - unit/integration tests
//! - scripted misbehaving peers (bad greeting, rejected capabilities, hang-ups)
//! - CI regression tests using recorded QMP "conversations"
//!
//! Every message the mock receives is logged and can be inspected with
//! [`MockServer::received`], which makes it usable as a spy.
//!
//! It is gated behind `cfg(test)` or the `mock` Cargo feature.

use std::{collections::HashMap, future::Future, path::Path, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
    sync::{Mutex, mpsc, oneshot},
};

#[cfg(unix)]
use tokio::net::UnixListener;

use crate::{
    error::{Error, Result},
    transport::Endpoint,
    types::{CAPABILITIES_COMMAND, GREETING_KEY},
};

/// How a command should be answered by the mock.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Successful `return` payload.
    Return(Value),

    /// Error response.
    Error {
        /// QMP error class.
        class: String,
        /// QMP error description.
        desc: String,
    },

    /// Close the connection instead of answering.
    HangUp,
}

impl MockReply {
    fn into_response(self, id: Option<&Value>) -> Option<Value> {
        let mut resp = match self {
            MockReply::Return(v) => serde_json::json!({"return": v}),
            MockReply::Error { class, desc } => serde_json::json!({
                "error": {"class": class, "desc": desc}
            }),
            MockReply::HangUp => return None,
        };

        if let (Some(id), Some(obj)) = (id, resp.as_object_mut()) {
            obj.insert("id".to_string(), id.clone());
        }
        Some(resp)
    }
}

/// A simple mock script.
#[derive(Debug, Clone)]
pub struct MockScript {
    /// Greeting to send. `None` closes the connection without a word.
    pub greeting: Option<Value>,

    /// Answer to `qmp_capabilities`.
    pub capabilities: MockReply,

    /// Map from `execute` command name to reply.
    pub replies: HashMap<String, MockReply>,

    /// Events sent just before the reply to a given command.
    pub events_before_reply: HashMap<String, Vec<Value>>,

    /// Events sent right after a successful negotiation.
    pub post_handshake_events: Vec<Value>,
}

impl MockScript {
    /// Create a default greeting matching a recent QEMU.
    #[must_use]
    pub fn default_greeting() -> Value {
        serde_json::json!({
            GREETING_KEY: {
                "version": {
                    "qemu": {"major": 8, "minor": 2, "micro": 0},
                    "package": "mock"
                },
                "capabilities": ["oob"]
            }
        })
    }

    /// Create a script with a default greeting.
    #[must_use]
    pub fn new() -> Self {
        Self {
            greeting: Some(Self::default_greeting()),
            capabilities: MockReply::Return(serde_json::json!({})),
            replies: HashMap::new(),
            events_before_reply: HashMap::new(),
            post_handshake_events: Vec::new(),
        }
    }

    /// Replace the greeting.
    #[must_use]
    pub fn greeting(mut self, greeting: Value) -> Self {
        self.greeting = Some(greeting);
        self
    }

    /// Close the connection instead of greeting.
    #[must_use]
    pub fn no_greeting(mut self) -> Self {
        self.greeting = None;
        self
    }

    /// Refuse `qmp_capabilities`.
    #[must_use]
    pub fn reject_capabilities(mut self, class: impl Into<String>, desc: impl Into<String>) -> Self {
        self.capabilities = MockReply::Error {
            class: class.into(),
            desc: desc.into(),
        };
        self
    }

    /// Add a successful reply.
    #[must_use]
    pub fn reply_return(mut self, command: impl Into<String>, value: Value) -> Self {
        self.replies
            .insert(command.into(), MockReply::Return(value));
        self
    }

    /// Add an error reply.
    #[must_use]
    pub fn reply_error(
        mut self,
        command: impl Into<String>,
        class: impl Into<String>,
        desc: impl Into<String>,
    ) -> Self {
        self.replies.insert(
            command.into(),
            MockReply::Error {
                class: class.into(),
                desc: desc.into(),
            },
        );
        self
    }

    /// Close the connection when `command` arrives.
    #[must_use]
    pub fn hang_up_on(mut self, command: impl Into<String>) -> Self {
        self.replies.insert(command.into(), MockReply::HangUp);
        self
    }

    /// Send `event` right before the reply to `command`.
    #[must_use]
    pub fn event_before(mut self, command: impl Into<String>, event: Value) -> Self {
        self.events_before_reply
            .entry(command.into())
            .or_default()
            .push(event);
        self
    }

    /// Add an event to be sent after handshake.
    #[must_use]
    pub fn post_event(mut self, event: Value) -> Self {
        self.post_handshake_events.push(event);
        self
    }
}

impl Default for MockScript {
    fn default() -> Self {
        Self::new()
    }
}

/// Build an event message with a zero timestamp.
#[must_use]
pub fn event(name: &str, data: Value) -> Value {
    serde_json::json!({
        "event": name,
        "data": data,
        "timestamp": {"seconds": 0, "microseconds": 0}
    })
}

/// A running mock peer.
///
/// Dropping every handle to the server shuts it down.
#[derive(Debug, Clone)]
pub struct MockServer {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    endpoint: Endpoint,
    received: Arc<Mutex<Vec<Value>>>,
    shutdown_tx: mpsc::Sender<()>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl MockServer {
    /// Start a TCP mock server on 127.0.0.1:0 (ephemeral port).
    pub async fn start_tcp(script: MockScript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::from)?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        Ok(Self::spawn(endpoint, move |received| async move {
            if let Ok((stream, _peer)) = listener.accept().await {
                let _ = handle_connection(stream, script, received).await;
            }
        }))
    }

    /// Start a Unix mock server at the given path.
    #[cfg(unix)]
    pub async fn start_unix(path: impl AsRef<Path>, script: MockScript) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // Best effort cleanup.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path).map_err(Error::from)?;
        let endpoint = Endpoint::unix(path);

        Ok(Self::spawn(endpoint, move |received| async move {
            if let Ok((stream, _addr)) = listener.accept().await {
                let _ = handle_connection(stream, script, received).await;
            }
        }))
    }

    /// Play the peer in a peer-initiated connection: keep dialing `endpoint`
    /// until a listener shows up, then serve `script` on that connection.
    pub fn dial(endpoint: Endpoint, script: MockScript) -> Self {
        let target = endpoint.clone();
        Self::spawn(endpoint, move |received| async move {
            for _ in 0..500 {
                match crate::transport::connect(&target).await {
                    Ok(stream) => {
                        let _ = handle_connection(stream, script, received).await;
                        return;
                    }
                    Err(_not_yet) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
    }

    fn spawn<F, Fut>(endpoint: Endpoint, serve: F) -> Self
    where
        F: FnOnce(Arc<Mutex<Vec<Value>>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (done_tx, done_rx) = oneshot::channel();
        let serving = serve(received.clone());

        tokio::spawn(async move {
            tokio::select! {
                _ = serving => {}
                _ = shutdown_rx.recv() => {}
            }

            let _ = done_tx.send(());
        });

        Self {
            inner: Arc::new(Inner {
                endpoint,
                received,
                shutdown_tx,
                done_rx: Mutex::new(Some(done_rx)),
            }),
        }
    }

    /// Endpoint clients should connect to (or, for [`MockServer::dial`],
    /// listen on).
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.inner.endpoint.clone()
    }

    /// Every message received from the client so far, in order.
    pub async fn received(&self) -> Vec<Value> {
        self.inner.received.lock().await.clone()
    }

    /// Wait until the peer's connection has ended, then shut down.
    pub async fn finished(&self) {
        let mut rx = self.inner.done_rx.lock().await;
        if let Some(done) = rx.take() {
            let _ = done.await;
        }
    }

    /// Shut down the server and wait for completion.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(()).await;
        self.finished().await;
    }
}

async fn handle_connection<S>(
    stream: S,
    mut script: MockScript,
    received: Arc<Mutex<Vec<Value>>>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    let Some(greeting) = script.greeting.take() else {
        return Ok(());
    };
    send_json(&mut w, &greeting).await?;

    let mut negotiated = false;

    loop {
        let Some(req) = recv_json(&mut r).await? else {
            return Ok(());
        };
        received.lock().await.push(req.clone());

        let id = req.get("id").cloned();
        let execute = req
            .get("execute")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();

        if !negotiated {
            let reply = if execute == CAPABILITIES_COMMAND {
                script.capabilities.clone()
            } else {
                MockReply::Error {
                    class: "CommandNotFound".to_string(),
                    desc: format!("Expecting capabilities negotiation with '{CAPABILITIES_COMMAND}'"),
                }
            };
            negotiated = execute == CAPABILITIES_COMMAND && matches!(reply, MockReply::Return(_));

            let Some(resp) = reply.into_response(id.as_ref()) else {
                return Ok(());
            };
            send_json(&mut w, &resp).await?;

            if negotiated {
                for ev in std::mem::take(&mut script.post_handshake_events) {
                    send_json(&mut w, &ev).await?;
                }
            }
            continue;
        }

        if let Some(events) = script.events_before_reply.get(&execute) {
            for ev in events {
                send_json(&mut w, ev).await?;
            }
        }

        let reply = script
            .replies
            .get(&execute)
            .cloned()
            .unwrap_or_else(|| MockReply::Error {
                class: "CommandNotFound".to_string(),
                desc: format!("The command {execute} has not been found"),
            });

        let Some(resp) = reply.into_response(id.as_ref()) else {
            return Ok(());
        };
        send_json(&mut w, &resp).await?;
    }
}

async fn send_json<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, msg: &Value) -> Result<()> {
    let line = msg.to_string();
    w.write_all(line.as_bytes()).await.map_err(Error::from)?;
    w.write_all(b"\r\n").await.map_err(Error::from)?;
    w.flush().await.map_err(Error::from)?;
    Ok(())
}

async fn recv_json<R: tokio::io::AsyncBufRead + Unpin>(r: &mut R) -> Result<Option<Value>> {
    let mut line = String::new();
    let n = r.read_line(&mut line).await.map_err(Error::from)?;
    if n == 0 {
        return Ok(None);
    }

    let line = line.trim_end_matches(['\r', '\n']);
    serde_json::from_str(line).map(Some).map_err(Error::from)
}

/// A transcript step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "dir", rename_all = "lowercase")]
pub enum TranscriptStep {
    /// A message sent by the server.
    Server {
        /// Message payload.
        msg: Value,
    },
    /// A message expected from the client.
    Client {
        /// Message payload.
        msg: Value,
    },
}

/// A JSONL transcript, suitable for replay.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    /// Ordered transcript steps.
    pub steps: Vec<TranscriptStep>,
}

impl Transcript {
    /// Parse from JSON Lines content.
    pub fn from_jsonl_str(s: &str) -> Result<Self> {
        let mut steps = Vec::new();
        for (idx, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let step: TranscriptStep = serde_json::from_str(line).map_err(|e| Error::Protocol {
                message: format!("invalid jsonl at line {}: {}", idx + 1, e),
            })?;
            steps.push(step);
        }

        Ok(Self { steps })
    }

    /// Load a transcript from a JSONL file.
    pub fn from_jsonl_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(Error::from)?;
        Self::from_jsonl_str(&data)
    }
}

/// Replay a transcript by acting as a QMP server.
///
/// The server sends/receives messages exactly as specified and hangs up on
/// the first client message that differs from the transcript.
#[derive(Debug)]
pub struct ReplayServer {
    server: MockServer,
}

impl ReplayServer {
    /// Start a replay server on TCP.
    pub async fn start_tcp(transcript: Transcript) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(Error::from)?;
        let addr = listener.local_addr().map_err(Error::from)?;
        let endpoint = Endpoint::tcp(addr.ip().to_string(), addr.port());

        let server = MockServer::spawn(endpoint, move |received| async move {
            if let Ok((stream, _peer)) = listener.accept().await {
                let _ = replay_connection(stream, transcript, received).await;
            }
        });

        Ok(Self { server })
    }

    /// Endpoint clients should connect to.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.server.endpoint()
    }

    /// Every message received from the client so far, in order.
    pub async fn received(&self) -> Vec<Value> {
        self.server.received().await
    }

    /// Shut down the server.
    pub async fn shutdown(&self) {
        self.server.shutdown().await
    }
}

async fn replay_connection<S>(
    stream: S,
    transcript: Transcript,
    received: Arc<Mutex<Vec<Value>>>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (r, mut w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    for step in transcript.steps {
        match step {
            TranscriptStep::Server { msg } => {
                send_json(&mut w, &msg).await?;
            }
            TranscriptStep::Client { msg: expected } => {
                let Some(got) = recv_json(&mut r).await? else {
                    return Ok(());
                };
                received.lock().await.push(got.clone());

                if got != expected {
                    return Err(Error::Protocol {
                        message: format!("transcript mismatch: expected {expected}, got {got}"),
                    });
                }
            }
        }
    }

    Ok(())
}
