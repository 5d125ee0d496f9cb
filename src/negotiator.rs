//! Greeting and capabilities handshake.

use crate::{
    connection::Connection,
    dispatcher,
    error::{Error, ErrorKind, Result},
    types::{Command, Greeting},
};

/// Progress of the handshake on a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Nothing read yet.
    Init,
    /// Waiting for the server greeting.
    AwaitGreeting,
    /// `qmp_capabilities` sent, waiting for its reply.
    Negotiating,
    /// Commands may be issued.
    Ready,
    /// The handshake failed; the connection is unusable.
    Failed,
}

#[derive(Debug)]
pub(crate) struct Negotiator<'a> {
    state: NegotiationState,
    enable: &'a [String],
    negotiate: bool,
}

impl<'a> Negotiator<'a> {
    pub(crate) fn new(enable: &'a [String], negotiate: bool) -> Self {
        Self {
            state: NegotiationState::Init,
            enable,
            negotiate,
        }
    }

    pub(crate) fn state(&self) -> NegotiationState {
        self.state
    }

    /// Drive the handshake to `Ready` and hand back the greeting.
    pub(crate) async fn run(&mut self, conn: &mut Connection) -> Result<Greeting> {
        self.state = NegotiationState::AwaitGreeting;
        let greeting = match self.await_greeting(conn).await {
            Ok(g) => g,
            Err(e) => return Err(self.fail(e)),
        };

        #[cfg(feature = "tracing")]
        if let Some(info) = greeting.info() {
            tracing::debug!(
                qemu_major = info.version.qemu.major,
                qemu_minor = info.version.qemu.minor,
                qemu_micro = info.version.qemu.micro,
                caps = ?info.capabilities,
                "received QMP greeting"
            );
        }

        if !self.negotiate {
            self.state = NegotiationState::Ready;
            return Ok(greeting);
        }

        self.state = NegotiationState::Negotiating;
        let reply = match dispatcher::dispatch(conn, &Command::capabilities(self.enable)).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };

        match reply {
            Some(r) if r.is_success() => {
                self.state = NegotiationState::Ready;
                Ok(greeting)
            }
            Some(r) => {
                let message = match r.error {
                    Some(err) => format!("{}: {}", err.class, err.desc),
                    None => "reply carries no 'return' member".to_string(),
                };
                Err(self.fail(Error::capabilities(message)))
            }
            None => Err(self.fail(Error::capabilities("connection closed before the reply"))),
        }
    }

    async fn await_greeting(&mut self, conn: &mut Connection) -> Result<Greeting> {
        let value = match conn.read_value().await {
            Ok(Some(v)) => v,
            Ok(None) => return Err(Error::connect("connection closed before the greeting")),
            Err(e) if e.kind() == ErrorKind::Transport => return Err(e),
            Err(e) => return Err(Error::connect(format!("no usable greeting: {e}"))),
        };

        Greeting::from_value(value)
    }

    fn fail(&mut self, err: Error) -> Error {
        self.state = NegotiationState::Failed;
        err
    }
}
