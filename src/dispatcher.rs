//! Command/reply pairing and event routing.
//!
//! Exactly one command is in flight at a time: the reply to a command is the
//! first non-event message read after it was sent. Events met on the way are
//! appended to the connection's queue in arrival order.

use std::time::Duration;

use crate::{
    connection::{Connection, bounded},
    error::{Error, Result},
    types::{Command, Message, QmpResponse},
};

/// Send `command` and read until its reply.
///
/// `Ok(None)` means there is no reply to be had: the peer closed the stream,
/// or it was already gone when the command was written.
pub(crate) async fn dispatch(conn: &mut Connection, command: &Command) -> Result<Option<QmpResponse>> {
    if let Err(e) = conn.send(command).await {
        if e.is_peer_gone() {
            #[cfg(feature = "tracing")]
            tracing::debug!(command = %command.execute, error = %e, "peer gone before QMP command was sent");
            return Ok(None);
        }
        return Err(e);
    }

    #[cfg(feature = "tracing")]
    tracing::trace!(command = %command.execute, "sent QMP command");

    loop {
        match conn.read_message().await? {
            Some(Message::Event(ev)) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(event = %ev.name, "queued QMP event while awaiting reply");
                conn.events.push(ev);
            }
            Some(Message::Reply(reply)) => return Ok(Some(reply)),
            None => return Ok(None),
        }
    }
}

/// Pick up at most one already-arrived message, waiting only a brief grace.
pub(crate) async fn drain_pending(conn: &mut Connection) -> Result<()> {
    match conn.try_read_message().await? {
        Some(Message::Event(ev)) => conn.events.push(ev),
        Some(Message::Reply(_unsolicited)) => {
            #[cfg(feature = "tracing")]
            tracing::debug!(reply = ?_unsolicited, "discarding QMP reply with no command in flight");
        }
        None => {}
    }
    Ok(())
}

/// Read until one event has been queued.
///
/// Replies seen meanwhile have no command to belong to and are dropped. With
/// a `limit`, the whole wait is bounded, not each read.
pub(crate) async fn wait_for_event(conn: &mut Connection, limit: Option<Duration>) -> Result<()> {
    bounded(limit, async {
        loop {
            match conn.read_message_unbounded().await? {
                Some(Message::Event(ev)) => {
                    conn.events.push(ev);
                    return Ok(());
                }
                Some(Message::Reply(_unsolicited)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(reply = ?_unsolicited, "discarding QMP reply while waiting for an event");
                }
                None => return Err(Error::Disconnected),
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    use super::*;
    use crate::error::ErrorKind;

    fn pair() -> (Connection, BufReader<DuplexStream>) {
        let (local, peer) = tokio::io::duplex(4096);
        (Connection::new(Box::new(local), None), BufReader::new(peer))
    }

    async fn write_line(peer: &mut BufReader<DuplexStream>, v: Value) {
        let mut line = v.to_string();
        line.push('\n');
        peer.get_mut().write_all(line.as_bytes()).await.unwrap();
    }

    fn event(name: &str) -> Value {
        json!({"event": name, "data": {}, "timestamp": {"seconds": 1, "microseconds": 0}})
    }

    #[tokio::test]
    async fn events_before_reply_are_queued_in_order() {
        let (mut conn, mut peer) = pair();
        for name in ["A", "B", "C"] {
            write_line(&mut peer, event(name)).await;
        }
        write_line(&mut peer, json!({"return": {"ok": true}})).await;

        let reply = dispatch(&mut conn, &Command::new("ping")).await.unwrap().unwrap();
        assert_eq!(reply.result, Some(json!({"ok": true})));

        let names: Vec<_> = conn.events.snapshot().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["A", "B", "C"]);

        let mut sent = String::new();
        peer.read_line(&mut sent).await.unwrap();
        assert_eq!(sent, "{\"execute\":\"ping\"}\n");
    }

    #[tokio::test]
    async fn eof_instead_of_reply_is_no_result() {
        let (mut conn, peer) = pair();
        drop(peer);
        // The write may already fail with a broken pipe; both paths are "no result".
        let reply = dispatch(&mut conn, &Command::new("quit")).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn drain_takes_one_message_without_blocking() {
        let (mut conn, mut peer) = pair();
        drain_pending(&mut conn).await.unwrap();
        assert!(conn.events.is_empty());

        write_line(&mut peer, event("RESUME")).await;
        drain_pending(&mut conn).await.unwrap();
        assert_eq!(conn.events.len(), 1);
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let (mut conn, _peer) = pair();
        let err = wait_for_event(&mut conn, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn wait_skips_stray_replies() {
        let (mut conn, mut peer) = pair();
        write_line(&mut peer, json!({"return": {}})).await;
        write_line(&mut peer, event("SHUTDOWN")).await;
        wait_for_event(&mut conn, None).await.unwrap();
        assert_eq!(conn.events.pop().map(|e| e.name), Some("SHUTDOWN".to_string()));
    }

    #[tokio::test]
    async fn wait_on_closed_peer_is_disconnected() {
        let (mut conn, peer) = pair();
        drop(peer);
        let err = wait_for_event(&mut conn, None).await.unwrap_err();
        assert!(matches!(err, Error::Disconnected));
    }
}
