//! An open, framed QMP stream and its event buffer.

use std::{fmt, future::Future, time::Duration};

use serde_json::Value;
use tokio::io::{ReadHalf, WriteHalf};

use crate::{
    codec::{FrameReader, FrameWriter},
    error::{Error, Result},
    event_queue::EventQueue,
    transport::QmpStream,
    types::{Command, Message},
};

/// How long a non-blocking drain waits for data that may already be in flight.
pub(crate) const DRAIN_GRACE: Duration = Duration::from_millis(5);

pub(crate) struct Connection {
    reader: FrameReader<ReadHalf<QmpStream>>,
    writer: FrameWriter<WriteHalf<QmpStream>>,
    read_timeout: Option<Duration>,
    pub(crate) events: EventQueue,
}

impl Connection {
    pub(crate) fn new(stream: QmpStream, read_timeout: Option<Duration>) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(r),
            writer: FrameWriter::new(w),
            read_timeout,
            events: EventQueue::default(),
        }
    }

    pub(crate) fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub(crate) async fn send(&mut self, command: &Command) -> Result<()> {
        self.writer.send(command).await
    }

    /// Next raw object, bounded by the read timeout.
    pub(crate) async fn read_value(&mut self) -> Result<Option<Value>> {
        let limit = self.read_timeout;
        bounded(limit, self.reader.read_value()).await
    }

    /// Next classified message, bounded by the read timeout.
    pub(crate) async fn read_message(&mut self) -> Result<Option<Message>> {
        match self.read_value().await? {
            Some(v) => Message::classify(v).map(Some),
            None => Ok(None),
        }
    }

    /// Next classified message with no bound at all.
    pub(crate) async fn read_message_unbounded(&mut self) -> Result<Option<Message>> {
        match self.reader.read_value().await? {
            Some(v) => Message::classify(v).map(Some),
            None => Ok(None),
        }
    }

    /// One read attempt that only waits for [`DRAIN_GRACE`].
    ///
    /// The short wait gives the runtime a chance to notice bytes that already
    /// sit in the socket buffer. Yields `None` both when nothing arrived and
    /// when the peer has closed; a partial line stays buffered for the next
    /// read.
    pub(crate) async fn try_read_message(&mut self) -> Result<Option<Message>> {
        match bounded(Some(DRAIN_GRACE), self.reader.read_value()).await {
            Ok(Some(v)) => Message::classify(v).map(Some),
            Ok(None) | Err(Error::Timeout { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn shutdown(mut self) -> Result<()> {
        self.writer.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("read_timeout", &self.read_timeout)
            .field("queued_events", &self.events.len())
            .finish()
    }
}

/// Await `fut`, failing with [`Error::Timeout`] once `limit` has passed.
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_elapsed) => Err(Error::Timeout { timeout }),
        },
        None => fut.await,
    }
}
