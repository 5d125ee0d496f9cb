//! Newline-delimited JSON framing.
//!
//! Reads go through an owned buffer filled with `read_buf`, so a read that is
//! abandoned half way (a timed-out or drain read) never loses bytes: the
//! partial line stays buffered for the next call.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a single message, delimiter excluded.
pub(crate) const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub(crate) struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Bytes of `buf` already scanned without finding a newline.
    scanned: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(4096),
            scanned: 0,
        }
    }

    /// Read the next JSON object.
    ///
    /// `Ok(None)` means the peer closed the stream on a message boundary.
    pub(crate) async fn read_value(&mut self) -> Result<Option<Value>> {
        loop {
            if let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') {
                let end = self.scanned + offset;
                let line: Vec<u8> = self.buf.drain(..=end).collect();
                self.scanned = 0;

                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                return decode_line(line).map(Some);
            }

            self.scanned = self.buf.len();
            if self.buf.len() > MAX_FRAME_LEN {
                return Err(Error::protocol(format!(
                    "message exceeds {MAX_FRAME_LEN} bytes without a newline"
                )));
            }

            let n = self.inner.read_buf(&mut self.buf).await.map_err(Error::from)?;
            if n == 0 {
                if self.buf.trim_ascii().is_empty() {
                    return Ok(None);
                }
                return Err(Error::protocol("connection closed in the middle of a message"));
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Serialize `msg` and write it, newline included, in one call.
    pub(crate) async fn send<T: Serialize>(&mut self, msg: &T) -> Result<()> {
        let mut line = serde_json::to_vec(msg).map_err(Error::from)?;
        line.push(b'\n');
        self.inner.write_all(&line).await.map_err(Error::from)?;
        self.inner.flush().await.map_err(Error::from)?;
        Ok(())
    }

    pub(crate) async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(Error::from)
    }
}

fn decode_line(line: &[u8]) -> Result<Value> {
    let value: Value = serde_json::from_slice(line).map_err(|e| Error::Protocol {
        message: format!("undecodable message: {e}"),
    })?;

    if !value.is_object() {
        return Err(Error::protocol(format!(
            "expected a JSON object, got {value}"
        )));
    }

    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn splits_lines_and_strips_crlf() {
        let input: &[u8] = b"{\"a\":1}\r\n\r\n{\"b\":2}\n";
        let mut reader = FrameReader::new(input);
        assert_eq!(reader.read_value().await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(reader.read_value().await.unwrap(), Some(json!({"b": 2})));
        assert_eq!(reader.read_value().await.unwrap(), None);
    }

    #[tokio::test]
    async fn garbage_is_a_protocol_error() {
        let input: &[u8] = b"{not json\n";
        let mut reader = FrameReader::new(input);
        let err = reader.read_value().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn non_object_is_a_protocol_error() {
        let input: &[u8] = b"[1,2,3]\n";
        let mut reader = FrameReader::new(input);
        let err = reader.read_value().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn truncated_message_at_eof_is_a_protocol_error() {
        let input: &[u8] = b"{\"a\":";
        let mut reader = FrameReader::new(input);
        let err = reader.read_value().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn abandoned_read_keeps_partial_line() {
        let (mut peer, local) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(local);

        peer.write_all(b"{\"event\":").await.unwrap();
        let first = tokio::time::timeout(Duration::from_millis(20), reader.read_value()).await;
        assert!(first.is_err(), "half a line must not complete");

        peer.write_all(b"\"STOP\"}\n").await.unwrap();
        let value = reader.read_value().await.unwrap();
        assert_eq!(value, Some(json!({"event": "STOP"})));
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_message() {
        let (peer, local) = tokio::io::duplex(256);
        let mut writer = FrameWriter::new(local);
        writer.send(&json!({"execute": "stop"})).await.unwrap();
        writer.shutdown().await.unwrap();

        let mut out = String::new();
        let mut peer = peer;
        peer.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{\"execute\":\"stop\"}\n");
    }
}
