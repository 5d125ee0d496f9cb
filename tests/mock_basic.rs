use qmp::mock::{MockScript, MockServer, event};
use qmp::{Client, ConnectionState, ErrorKind, NegotiationState};
use serde_json::json;

#[tokio::test]
async fn connect_returns_greeting_unmodified() -> qmp::Result<()> {
    let script = MockScript::new().greeting(json!({"QMP": {"version": {}}}));
    let server = MockServer::start_tcp(script).await?;

    let mut client = Client::new(server.endpoint());
    let greeting = client.connect().await?;

    assert_eq!(greeting.as_value(), &json!({"QMP": {"version": {}}}));
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(client.negotiation_state(), NegotiationState::Ready);
    assert_eq!(client.greeting(), Some(&greeting));

    client.close().await?;
    server.finished().await;
    assert_eq!(
        server.received().await,
        vec![json!({"execute": "qmp_capabilities"})]
    );
    Ok(())
}

#[tokio::test]
async fn commands_serialize_exactly() -> qmp::Result<()> {
    let script = MockScript::new()
        .reply_return("foo", json!({}))
        .reply_return("bar", json!({}));
    let server = MockServer::start_tcp(script).await?;

    let mut client = Client::new(server.endpoint());
    client.connect().await?;

    let reply = client
        .cmd("foo", Some(json!({"a": 1})), Some(json!("x")))
        .await?
        .expect("reply");
    assert_eq!(reply.id, Some(json!("x")));

    let reply = client.cmd("bar", None, None).await?.expect("reply");
    assert_eq!(reply.id, None);

    client.close().await?;
    server.finished().await;

    let received = server.received().await;
    assert_eq!(received[1], json!({"execute": "foo", "arguments": {"a": 1}, "id": "x"}));
    assert_eq!(received[2], json!({"execute": "bar"}));
    Ok(())
}

#[tokio::test]
async fn events_before_reply_are_queued_in_order() -> qmp::Result<()> {
    let script = MockScript::new()
        .event_before("ping", event("FIRST", json!({"n": 1})))
        .event_before("ping", event("SECOND", json!({"n": 2})))
        .reply_return("ping", json!({"pong": true}));
    let server = MockServer::start_tcp(script).await?;

    let mut client = Client::new(server.endpoint());
    client.connect().await?;

    let reply = client.cmd("ping", None, None).await?.expect("reply");
    assert_eq!(reply.result, Some(json!({"pong": true})));

    let events = client.get_events(false).await?;
    let names: Vec<_> = events.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["FIRST", "SECOND"]);
    assert_eq!(events[1].data, json!({"n": 2}));

    // A snapshot does not consume.
    assert_eq!(client.get_events(false).await?.len(), 2);
    client.clear_events();
    assert!(client.get_events(false).await?.is_empty());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn execute_decodes_return_and_errors() -> qmp::Result<()> {
    let script = MockScript::new()
        .reply_return(
            "query-status",
            json!({"running": true, "singlestep": false, "status": "running"}),
        )
        .reply_error("stop", "GenericError", "not now");
    let server = MockServer::start_tcp(script).await?;

    let mut client = Client::new(server.endpoint());
    client.connect().await?;

    let status: serde_json::Value = client.execute("query-status", Option::<()>::None).await?;
    assert_eq!(status.get("status").and_then(|v| v.as_str()), Some("running"));

    let err = client
        .execute::<(), serde_json::Value>("stop", None)
        .await
        .expect_err("must error");
    assert_eq!(err.kind(), ErrorKind::Command);

    let err = client
        .execute::<(), serde_json::Value>("no-such-command", None)
        .await
        .expect_err("must error");
    assert!(err.to_string().contains("CommandNotFound"), "{err}");

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn hang_up_instead_of_reply_is_no_result() -> qmp::Result<()> {
    let script = MockScript::new().hang_up_on("quit");
    let server = MockServer::start_tcp(script).await?;

    let mut client = Client::new(server.endpoint());
    client.connect().await?;

    assert!(client.cmd("quit", None, None).await?.is_none());

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn closed_client_reports_transport_errors() -> qmp::Result<()> {
    let server = MockServer::start_tcp(MockScript::new()).await?;

    let mut client = Client::new(server.endpoint());
    client.connect().await?;
    client.close().await?;
    assert_eq!(client.state(), ConnectionState::Closed);

    let err = client.cmd("query-status", None, None).await.expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Transport);

    let err = client.get_events(false).await.expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Transport);

    let err = client.pull_event(false).await.expect_err("closed");
    assert_eq!(err.kind(), ErrorKind::Transport);

    // A second close is harmless.
    client.close().await?;

    server.shutdown().await;
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn unix_socket_round_trip() -> qmp::Result<()> {
    let dir = tempfile::tempdir().map_err(qmp::Error::from)?;
    let path = dir.path().join("qmp.sock");

    let script = MockScript::new().reply_return("query-version", json!({"package": "mock"}));
    let server = MockServer::start_unix(&path, script).await?;

    let mut client = Client::new(server.endpoint());
    let greeting = client.connect().await?;
    let info = greeting.info().expect("typed greeting");
    assert_eq!(info.version.qemu.major, 8);

    let reply = client.cmd("query-version", None, None).await?.expect("reply");
    assert_eq!(reply.result, Some(json!({"package": "mock"})));

    client.close().await?;
    server.shutdown().await;
    Ok(())
}
