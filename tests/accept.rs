use std::time::Duration;

use qmp::mock::{MockScript, MockServer, event};
use qmp::{Client, ConnectionState, Endpoint, ErrorKind};
use serde_json::json;

fn free_tcp_endpoint() -> Endpoint {
    let l = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = l.local_addr().expect("addr").port();
    Endpoint::tcp("127.0.0.1", port)
}

#[tokio::test]
async fn accepts_peer_initiated_tcp_connection() -> qmp::Result<()> {
    let endpoint = free_tcp_endpoint();
    let script = MockScript::new()
        .event_before("query-status", event("RESUME", json!({})))
        .reply_return("query-status", json!({"status": "running"}));
    let peer = MockServer::dial(endpoint.clone(), script);

    let mut client = Client::new(endpoint);
    let greeting = client.accept(Duration::from_secs(10)).await?;
    assert!(greeting.info().is_some());
    assert_eq!(client.state(), ConnectionState::Ready);

    let reply = client.cmd("query-status", None, None).await?.expect("reply");
    assert_eq!(reply.result, Some(json!({"status": "running"})));
    assert_eq!(client.get_events(false).await?.len(), 1);

    client.close().await?;
    peer.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn accepts_peer_initiated_unix_connection() -> qmp::Result<()> {
    let dir = tempfile::tempdir().map_err(qmp::Error::from)?;
    let endpoint = Endpoint::unix(dir.path().join("qmp-server.sock"));
    let peer = MockServer::dial(endpoint.clone(), MockScript::new());

    let mut client = Client::builder(endpoint)
        .accept_timeout(Duration::from_secs(10))
        .nickname("vm0")
        .build();
    client.accept_default().await?;
    assert_eq!(client.state(), ConnectionState::Ready);

    client.close().await?;
    peer.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn accept_without_peer_times_out() {
    let mut client = Client::new(free_tcp_endpoint());
    let err = client
        .accept(Duration::from_millis(100))
        .await
        .expect_err("nobody dials in");
    assert_eq!(err.kind(), ErrorKind::Connect);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}
