//! QMP client facade.

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::{
    connection::Connection,
    dispatcher,
    error::{Error, ErrorKind, Result},
    event_queue::Wait,
    negotiator::{NegotiationState, Negotiator},
    transport::{self, AsyncQmpStream, Endpoint, QmpStream},
    types::{Command, Event, EventFilter, Greeting, QmpResponse},
};

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket. `connect` / `accept` may be called.
    Disconnected,
    /// Dialing the endpoint.
    Connecting,
    /// Listening for the peer to dial in.
    Accepting,
    /// Greeting / capabilities exchange in progress.
    Negotiating,
    /// Commands may be issued.
    Ready,
    /// `close` was called, or the connection broke after the handshake. The
    /// client cannot be reused.
    Closed,
}

/// Options controlling how the QMP connection is established.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Send `qmp_capabilities` after the greeting.
    ///
    /// When disabled the connection is usable as soon as the greeting is read,
    /// which is only useful against peers that skip capabilities mode.
    pub negotiate: bool,

    /// Capabilities to enable during the `qmp_capabilities` negotiation.
    ///
    /// Leaving this empty performs a plain `qmp_capabilities` without arguments.
    pub enable_capabilities: Vec<String>,

    /// Bound on the greeting, the negotiation reply and command replies.
    ///
    /// `None` blocks indefinitely. Event waits are bounded by their own
    /// [`Wait`] argument instead.
    pub read_timeout: Option<Duration>,

    /// How long [`Client::accept_default`] waits for the peer.
    pub accept_timeout: Duration,

    /// Label attached to log events for this client.
    pub nickname: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            negotiate: true,
            enable_capabilities: Vec::new(),
            read_timeout: None,
            accept_timeout: Duration::from_secs(15),
            nickname: None,
        }
    }
}

/// QMP client builder.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    endpoint: Endpoint,
    options: ConnectOptions,
}

impl ClientBuilder {
    /// Whether to run the capabilities negotiation.
    #[must_use]
    pub fn negotiate(mut self, negotiate: bool) -> Self {
        self.options.negotiate = negotiate;
        self
    }

    /// Set capabilities to enable during handshake.
    #[must_use]
    pub fn enable_capabilities(mut self, caps: impl Into<Vec<String>>) -> Self {
        self.options.enable_capabilities = caps.into();
        self
    }

    /// Set the read timeout for handshake and command replies.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.read_timeout = timeout;
        self
    }

    /// Set the default accept timeout.
    #[must_use]
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.options.accept_timeout = timeout;
        self
    }

    /// Set the log label.
    #[must_use]
    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.options.nickname = Some(nickname.into());
        self
    }

    /// Build a disconnected client.
    #[must_use]
    pub fn build(self) -> Client {
        Client::with_options(self.endpoint, self.options)
    }
}

/// A QMP client owning at most one connection.
///
/// Every operation takes `&mut self`: one caller drives the connection at a
/// time, so at most one command is ever in flight. Nothing runs in the
/// background; events are only read while the caller is inside `cmd`,
/// `get_events`, `pull_event` or `events_wait`. Share a client between tasks
/// by wrapping it in a mutex.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
    options: ConnectOptions,
    state: ConnectionState,
    conn: Option<Connection>,
    greeting: Option<Greeting>,
    negotiation: NegotiationState,
}

impl Client {
    /// Create a disconnected client for `endpoint` with default options.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_options(endpoint, ConnectOptions::default())
    }

    /// Create a builder for the given endpoint.
    #[must_use]
    pub fn builder(endpoint: Endpoint) -> ClientBuilder {
        ClientBuilder {
            endpoint,
            options: ConnectOptions::default(),
        }
    }

    /// Create a disconnected client with explicit options.
    #[must_use]
    pub fn with_options(endpoint: Endpoint, options: ConnectOptions) -> Self {
        Self {
            endpoint,
            options,
            state: ConnectionState::Disconnected,
            conn: None,
            greeting: None,
            negotiation: NegotiationState::Init,
        }
    }

    /// The endpoint this client dials or listens on.
    #[must_use]
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Where the most recent handshake got to.
    #[must_use]
    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation
    }

    /// The greeting received during the last successful handshake.
    #[must_use]
    pub fn greeting(&self) -> Option<&Greeting> {
        self.greeting.as_ref()
    }

    /// Dial the endpoint and perform the handshake.
    ///
    /// On failure the client is back in [`ConnectionState::Disconnected`] and
    /// may be connected again.
    pub async fn connect(&mut self) -> Result<Greeting> {
        self.ensure_disconnected()?;
        self.state = ConnectionState::Connecting;

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, nickname = ?self.options.nickname, "connecting to QMP endpoint");

        match transport::connect(&self.endpoint).await {
            Ok(stream) => self.handshake(stream).await,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Listen on the endpoint, wait up to `timeout` for the peer to connect,
    /// then perform the handshake.
    pub async fn accept(&mut self, timeout: Duration) -> Result<Greeting> {
        self.ensure_disconnected()?;
        self.state = ConnectionState::Accepting;

        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.endpoint, nickname = ?self.options.nickname, ?timeout, "waiting for QMP peer");

        match transport::accept(&self.endpoint, timeout).await {
            Ok(stream) => self.handshake(stream).await,
            Err(e) => {
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// [`Client::accept`] with the configured accept timeout.
    pub async fn accept_default(&mut self) -> Result<Greeting> {
        let timeout = self.options.accept_timeout;
        self.accept(timeout).await
    }

    /// Perform the handshake over an already established byte stream.
    ///
    /// The endpoint is not used. This is how socket pairs and in-memory
    /// streams are attached.
    pub async fn connect_with_stream<S>(&mut self, stream: S) -> Result<Greeting>
    where
        S: AsyncQmpStream + 'static,
    {
        self.ensure_disconnected()?;
        self.handshake(Box::new(stream)).await
    }

    async fn handshake(&mut self, stream: QmpStream) -> Result<Greeting> {
        self.state = ConnectionState::Negotiating;

        let mut conn = Connection::new(stream, self.options.read_timeout);
        let mut negotiator =
            Negotiator::new(&self.options.enable_capabilities, self.options.negotiate);

        let outcome = negotiator.run(&mut conn).await;
        self.negotiation = negotiator.state();

        match outcome {
            Ok(greeting) => {
                self.conn = Some(conn);
                self.greeting = Some(greeting.clone());
                self.state = ConnectionState::Ready;
                Ok(greeting)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, nickname = ?self.options.nickname, error = %e, "QMP handshake failed");
                let _ = conn.shutdown().await;
                self.state = ConnectionState::Disconnected;
                Err(e)
            }
        }
    }

    /// Send a command and return its reply.
    ///
    /// `args` must be a JSON object; it is omitted from the wire when `None`
    /// or empty. `id` is sent only when supplied. `Ok(None)` means the peer is
    /// gone (EOF before the reply, or a broken pipe on send).
    pub async fn cmd(
        &mut self,
        name: &str,
        args: Option<Value>,
        id: Option<Value>,
    ) -> Result<Option<QmpResponse>> {
        let mut command = Command::new(name);
        if let Some(args) = args {
            command = command.with_arguments(args)?;
        }
        command.id = id;
        self.cmd_obj(&command).await
    }

    /// Send a pre-built command object and return its reply.
    ///
    /// Any failure while the reply is outstanding closes the client, since the
    /// next reply could no longer be paired with the next command.
    pub async fn cmd_obj(&mut self, command: &Command) -> Result<Option<QmpResponse>> {
        let conn = self.ready_conn()?;
        let outcome = dispatcher::dispatch(conn, command).await;
        self.settle(outcome, true)
    }

    /// Execute a command and decode its `return` value.
    ///
    /// An `error` reply becomes [`Error::Qmp`]; a vanished peer becomes
    /// [`Error::Disconnected`].
    pub async fn execute<A, R>(&mut self, name: &str, args: Option<A>) -> Result<R>
    where
        A: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let mut command = Command::new(name);
        if let Some(args) = args {
            command = command.with_serialized_arguments(&args)?;
        }

        match self.cmd_obj(&command).await? {
            Some(reply) => decode_execute_response(name, reply),
            None => Err(Error::Disconnected),
        }
    }

    /// Return every queued event, after picking up anything already arrived.
    ///
    /// The queue is not consumed; call [`Client::clear_events`] afterwards to
    /// avoid seeing the same events again. If the queue is still empty, `wait`
    /// decides whether to block for the next event.
    pub async fn get_events(&mut self, wait: impl Into<Wait>) -> Result<Vec<Event>> {
        let conn = self.ready_conn()?;
        let outcome = fill_queue(conn, wait.into())
            .await
            .map(|()| conn.events.snapshot());
        self.settle(outcome, false)
    }

    /// Remove and return the oldest queued event.
    ///
    /// Same waiting rules as [`Client::get_events`]; `Ok(None)` only with
    /// [`Wait::No`].
    pub async fn pull_event(&mut self, wait: impl Into<Wait>) -> Result<Option<Event>> {
        let conn = self.ready_conn()?;
        let outcome = fill_queue(conn, wait.into())
            .await
            .map(|()| conn.events.pop());
        self.settle(outcome, false)
    }

    /// Drop all queued events.
    pub fn clear_events(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.events.clear();
        }
    }

    /// Wait for the first event matching any of `filters`.
    ///
    /// Already queued events are searched first. Only the matching event is
    /// removed; everything else stays queued in arrival order. With
    /// [`Wait::No`] nothing blocks and `Ok(None)` means no match.
    pub async fn events_wait(
        &mut self,
        filters: &[EventFilter],
        wait: impl Into<Wait>,
    ) -> Result<Option<Event>> {
        let conn = self.ready_conn()?;
        let outcome = wait_matching(conn, filters, wait.into()).await;
        self.settle(outcome, false)
    }

    /// Wait for the first event called `name`.
    pub async fn event_wait(
        &mut self,
        name: &str,
        wait: impl Into<Wait>,
    ) -> Result<Option<Event>> {
        self.events_wait(&[EventFilter::named(name)], wait).await
    }

    /// Change the bound on command-reply reads; `None` blocks indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.options.read_timeout = timeout;
        if let Some(conn) = self.conn.as_mut() {
            conn.set_read_timeout(timeout);
        }
    }

    /// Release the socket. The client cannot be used afterwards; calling
    /// `close` again is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.state = ConnectionState::Closed;
        match self.conn.take() {
            Some(conn) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, nickname = ?self.options.nickname, "closing QMP connection");
                match conn.shutdown().await {
                    Err(Error::Io { source }) if source.kind() == std::io::ErrorKind::NotConnected => Ok(()),
                    Err(e) if !e.is_peer_gone() => Err(e),
                    _ => Ok(()),
                }
            }
            None => Ok(()),
        }
    }

    fn ensure_disconnected(&self) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected => Ok(()),
            ConnectionState::Closed => Err(Error::Closed),
            other => Err(Error::protocol(format!(
                "client is already in state {other:?}"
            ))),
        }
    }

    /// Drop the connection when `outcome` shows the stream is out of step.
    ///
    /// Malformed input and transport failures always end the connection. A
    /// timeout only does so while a reply is outstanding; an expired event
    /// wait leaves nothing unpaired.
    fn settle<T>(&mut self, outcome: Result<T>, reply_pending: bool) -> Result<T> {
        if let Err(e) = &outcome {
            let fatal = match e.kind() {
                ErrorKind::Protocol | ErrorKind::Transport => true,
                ErrorKind::Timeout => reply_pending,
                _ => false,
            };
            if fatal && self.conn.take().is_some() {
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.endpoint, nickname = ?self.options.nickname, error = %e, "dropping QMP connection");
                self.state = ConnectionState::Closed;
            }
        }
        outcome
    }

    fn ready_conn(&mut self) -> Result<&mut Connection> {
        match (self.state, self.conn.as_mut()) {
            (ConnectionState::Ready, Some(conn)) => Ok(conn),
            _ => Err(Error::Closed),
        }
    }
}

async fn fill_queue(conn: &mut Connection, wait: Wait) -> Result<()> {
    dispatcher::drain_pending(conn).await?;
    if !conn.events.is_empty() {
        return Ok(());
    }

    match wait {
        Wait::No => Ok(()),
        Wait::Forever => dispatcher::wait_for_event(conn, None).await,
        Wait::Timeout(t) => dispatcher::wait_for_event(conn, Some(t)).await,
    }
}

async fn wait_matching(
    conn: &mut Connection,
    filters: &[EventFilter],
    wait: Wait,
) -> Result<Option<Event>> {
    dispatcher::drain_pending(conn).await?;
    if let Some(ev) = conn.events.take_matching(filters) {
        return Ok(Some(ev));
    }

    let limit = match wait {
        Wait::No => return Ok(None),
        Wait::Forever => None,
        Wait::Timeout(t) => Some(t),
    };

    crate::connection::bounded(limit, async {
        loop {
            let seen = conn.events.len();
            dispatcher::wait_for_event(conn, None).await?;
            if let Some(ev) = conn.events.take_matching_from(seen, filters) {
                return Ok(Some(ev));
            }
        }
    })
    .await
}

fn decode_execute_response<R: serde::de::DeserializeOwned>(
    command: &str,
    resp: QmpResponse,
) -> Result<R> {
    if let Some(err) = resp.error {
        return Err(Error::qmp(command, err.class, err.desc));
    }

    let value = resp
        .result
        .ok_or_else(|| Error::protocol("missing 'return' field in response"))?;

    deserialize_value::<R>(value).map_err(|e| Error::Protocol {
        message: format!("failed to decode response for '{command}': {e}"),
    })
}

fn deserialize_value<T: serde::de::DeserializeOwned>(v: Value) -> std::result::Result<T, String> {
    serde_path_to_error::deserialize(v).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Status {
        running: bool,
    }

    #[test]
    fn decodes_return_payload() {
        let resp = QmpResponse {
            id: None,
            result: Some(json!({"running": true})),
            error: None,
            extra: Default::default(),
        };
        let status: Status = decode_execute_response("query-status", resp).unwrap();
        assert!(status.running);
    }

    #[test]
    fn error_reply_becomes_qmp_error() {
        let resp = QmpResponse {
            id: None,
            result: None,
            error: Some(crate::types::QmpError {
                class: "CommandNotFound".to_string(),
                desc: "The command nope has not been found".to_string(),
            }),
            extra: Default::default(),
        };
        let err = decode_execute_response::<Value>("nope", resp).unwrap_err();
        assert!(matches!(err, Error::Qmp { ref class, .. } if class == "CommandNotFound"));
    }

    #[test]
    fn decode_failure_names_the_path() {
        let resp = QmpResponse {
            id: None,
            result: Some(json!({"running": "yes"})),
            error: None,
            extra: Default::default(),
        };
        let err = decode_execute_response::<Status>("query-status", resp).unwrap_err();
        assert!(err.to_string().contains("running"), "{err}");
    }

    #[tokio::test]
    async fn unconnected_client_rejects_commands() {
        let mut client = Client::new(Endpoint::tcp("127.0.0.1", 1));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        let err = client.cmd("query-status", None, None).await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn close_is_terminal_and_idempotent() {
        let mut client = Client::new(Endpoint::tcp("127.0.0.1", 1));
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(client.connect().await, Err(Error::Closed)));
    }
}
