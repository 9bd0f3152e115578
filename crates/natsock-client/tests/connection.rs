mod support;

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use natsock_client::{Client, ConnectOptions, Error, Event, Status};
use support::{handshake, mock_pair};

fn options() -> ConnectOptions {
    ConnectOptions::new("ws://mock")
        .reconnect_delay(Duration::from_millis(10))
        .max_reconnect_delay(Duration::from_millis(50))
        .reconnect_jitter(false)
        .request_timeout(Duration::from_secs(2))
}

async fn connected_client() -> Result<(Client, support::ServerSession, String)> {
    let (connector, mut server) = mock_pair();
    let connecting = tokio::spawn(Client::connect_with(options(), Box::new(connector)));
    let mut session = server.next_session().await;
    let inbox = handshake(&mut session).await;
    let client = connecting.await??;
    Ok((client, session, inbox))
}

#[tokio::test]
async fn handshake_reaches_connected_and_caches_server_info() -> Result<()> {
    let (client, _session, _inbox) = connected_client().await?;
    assert_eq!(client.status(), Status::Connected);
    let info = client.server_info();
    assert_eq!(info.server_id, "test");
    assert_eq!(info.version, "2.10.0");
    assert!(info.headers);
    Ok(())
}

#[tokio::test]
async fn request_resolves_with_the_reply_payload() -> Result<()> {
    let (client, mut session, inbox) = connected_client().await?;
    let requester = client.clone();
    let request =
        tokio::spawn(async move { requester.request("svc.echo", Bytes::from_static(b"hi")).await });

    let published = session.recv().await;
    let line = published.split("\r\n").next().expect("command line");
    let tokens: Vec<&str> = line.split_ascii_whitespace().collect();
    assert_eq!(tokens[0], "PUB");
    assert_eq!(tokens[1], "svc.echo");
    let reply = tokens[2].to_string();
    assert_eq!(reply, format!("{inbox}1"));
    assert_eq!(tokens[3], "2");
    assert!(published.ends_with("\r\nhi\r\n"));

    session.send(format!("MSG {reply} 1 5\r\nworld\r\n"));
    let message = request.await??;
    assert_eq!(&message.payload[..], b"world");
    Ok(())
}

#[tokio::test]
async fn request_fails_with_no_responders_on_503() -> Result<()> {
    let (client, mut session, inbox) = connected_client().await?;
    let requester = client.clone();
    let request =
        tokio::spawn(async move { requester.request("svc.dead", Bytes::new()).await });

    let _published = session.recv().await;
    let headers = "NATS/1.0 503 No Responders\r\n\r\n";
    session.send(format!(
        "HMSG {inbox}1 1 {len} {len}\r\n{headers}\r\n",
        len = headers.len()
    ));
    match request.await? {
        Err(Error::NoResponders { subject }) => assert_eq!(subject, "svc.dead"),
        other => panic!("expected no-responders, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn request_times_out_without_a_reply() -> Result<()> {
    let (connector, mut server) = mock_pair();
    let opts = options().request_timeout(Duration::from_millis(50));
    let connecting = tokio::spawn(Client::connect_with(opts, Box::new(connector)));
    let mut session = server.next_session().await;
    let _inbox = handshake(&mut session).await;
    let client = connecting.await??;

    let result = client.request("svc.slow", Bytes::new()).await;
    match result {
        Err(Error::RequestTimeout { subject }) => assert_eq!(subject, "svc.slow"),
        other => panic!("expected timeout, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn reconnect_replays_subscriptions_with_preserved_sids() -> Result<()> {
    let (connector, mut server) = mock_pair();
    let connecting = tokio::spawn(Client::connect_with(options(), Box::new(connector)));
    let mut session = server.next_session().await;
    let _inbox = handshake(&mut session).await;
    let client = connecting.await??;
    let mut events = client.events();

    let mut subscription = client.subscribe("events.>").await?;
    let sub_line = session.recv().await;
    assert_eq!(sub_line, format!("SUB events.> {}\r\n", subscription.sid()));

    // Transport drop: the client must reconnect and replay the SUB with the
    // sid it originally allocated.
    drop(session);
    let mut session = server.next_session().await;
    let _new_inbox = handshake(&mut session).await;
    let replayed = session.recv().await;
    assert_eq!(replayed, format!("SUB events.> {}\r\n", subscription.sid()));

    let mut saw_reconnecting = false;
    let mut saw_connected = false;
    while !(saw_reconnecting && saw_connected) {
        match events.recv().await? {
            Event::StatusChanged(Status::Reconnecting) => saw_reconnecting = true,
            Event::StatusChanged(Status::Connected) => saw_connected = true,
            _ => {}
        }
    }

    // The replayed registration still delivers.
    session.send(format!(
        "MSG events.ready {} 2\r\nok\r\n",
        subscription.sid()
    ));
    let message = subscription.next().await.expect("delivery after reconnect");
    assert_eq!(message.subject, "events.ready");
    assert_eq!(&message.payload[..], b"ok");
    Ok(())
}

#[tokio::test]
async fn queue_subscribe_registers_the_group() -> Result<()> {
    let (client, mut session, _inbox) = connected_client().await?;
    let subscription = client.queue_subscribe("jobs.*", "workers").await?;
    assert_eq!(
        session.recv().await,
        format!("SUB jobs.* workers {}\r\n", subscription.sid())
    );
    Ok(())
}

#[tokio::test]
async fn unanswered_keepalive_pings_force_a_reconnect() -> Result<()> {
    let (connector, mut server) = mock_pair();
    let opts = options()
        .ping_interval(Duration::from_millis(20))
        .max_ping_out(1);
    let connecting = tokio::spawn(Client::connect_with(opts, Box::new(connector)));
    let mut session = server.next_session().await;
    let _inbox = handshake(&mut session).await;
    let client = connecting.await??;
    let mut events = client.events();

    // Never answer the keep-alive PINGs; the watchdog must drop the link and
    // the reconnect loop must bring up a second session.
    let mut session = server.next_session().await;
    let _inbox = handshake(&mut session).await;

    let mut saw_reconnecting = false;
    let mut saw_connected = false;
    while !(saw_reconnecting && saw_connected) {
        match events.recv().await? {
            Event::StatusChanged(Status::Reconnecting) => saw_reconnecting = true,
            Event::StatusChanged(Status::Connected) => saw_connected = true,
            _ => {}
        }
    }
    Ok(())
}

#[tokio::test]
async fn drop_new_policy_reports_slow_consumers() -> Result<()> {
    let (connector, mut server) = mock_pair();
    let opts = options()
        .queue_policy(natsock_client::QueuePolicy::DropNew)
        .subscription_capacity(1);
    let connecting = tokio::spawn(Client::connect_with(opts, Box::new(connector)));
    let mut session = server.next_session().await;
    let _inbox = handshake(&mut session).await;
    let client = connecting.await??;
    let mut events = client.events();

    let mut subscription = client.subscribe("firehose").await?;
    let _sub_line = session.recv().await;
    for n in 0..3 {
        session.send(format!("MSG firehose {} 1\r\n{n}\r\n", subscription.sid()));
    }

    loop {
        if let Event::SlowConsumer { sid, subject } = events.recv().await? {
            assert_eq!(sid, subscription.sid());
            assert_eq!(subject, "firehose");
            break;
        }
    }
    // The first message was queued before the overflow and still delivers.
    let first = subscription.next().await.expect("queued message");
    assert_eq!(&first.payload[..], b"0");
    Ok(())
}

#[tokio::test]
async fn info_updates_refresh_cached_server_info() -> Result<()> {
    let (client, mut session, _inbox) = connected_client().await?;
    session.send(
        "INFO {\"server_id\":\"replacement\",\"version\":\"2.11.0\",\"headers\":true}\r\n",
    );
    // Flush round-trips a PING behind the INFO, so the refresh is visible
    // once it resolves.
    let flusher = client.clone();
    let flush = tokio::spawn(async move { flusher.flush().await });
    assert_eq!(session.recv().await, "PING\r\n");
    session.send("PONG\r\n");
    flush.await??;
    assert_eq!(client.server_info().server_id, "replacement");
    Ok(())
}

#[tokio::test]
async fn pending_requests_fail_on_connection_loss() -> Result<()> {
    let (client, mut session, _inbox) = connected_client().await?;
    let requester = client.clone();
    let request =
        tokio::spawn(async move { requester.request("svc.echo", Bytes::new()).await });
    let _published = session.recv().await;
    drop(session);
    match request.await? {
        Err(Error::Connection(_)) => {}
        other => panic!("expected connection error, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn server_ping_is_answered_with_pong() -> Result<()> {
    let (_client, mut session, _inbox) = connected_client().await?;
    session.send("PING\r\n");
    assert_eq!(session.recv().await, "PONG\r\n");
    Ok(())
}

#[tokio::test]
async fn flush_round_trips_a_ping() -> Result<()> {
    let (client, mut session, _inbox) = connected_client().await?;
    let flusher = client.clone();
    let flush = tokio::spawn(async move { flusher.flush().await });
    assert_eq!(session.recv().await, "PING\r\n");
    session.send("PONG\r\n");
    flush.await??;
    Ok(())
}

#[tokio::test]
async fn unsubscribe_sends_unsub_and_stops_delivery() -> Result<()> {
    let (client, mut session, _inbox) = connected_client().await?;
    let subscription = client.subscribe("orders.*").await?;
    let sid = subscription.sid();
    let _sub_line = session.recv().await;
    subscription.unsubscribe().await?;
    assert_eq!(session.recv().await, format!("UNSUB {sid}\r\n"));
    Ok(())
}

#[tokio::test]
async fn publish_with_headers_emits_hpub() -> Result<()> {
    let (client, mut session, _inbox) = connected_client().await?;
    let mut headers = natsock_wire::HeaderMap::new();
    headers.append("Nats-Rollup", "sub");
    client
        .publish_with_headers("o.meta", headers, Bytes::from_static(b"{}"))
        .await?;
    let written = session.recv().await;
    assert!(written.starts_with("HPUB o.meta "), "{written}");
    assert!(written.contains("NATS/1.0\r\nNats-Rollup: sub\r\n"), "{written}");
    Ok(())
}

#[tokio::test]
async fn close_is_terminal() -> Result<()> {
    let (client, _session, _inbox) = connected_client().await?;
    client.close().await;
    assert_eq!(client.status(), Status::Closed);
    match client.publish("a", Bytes::new()).await {
        Err(Error::Closed) => {}
        other => panic!("expected closed, got {other:?}"),
    }
    // Idempotent.
    client.close().await;
    assert_eq!(client.status(), Status::Closed);
    Ok(())
}

#[tokio::test]
async fn auth_failure_surfaces_as_authentication_error() -> Result<()> {
    let (connector, mut server) = mock_pair();
    let connecting = tokio::spawn(Client::connect_with(
        options().allow_reconnect(false),
        Box::new(connector),
    ));
    let session = server.next_session().await;
    session.send(format!("INFO {}\r\n", support::INFO));
    session.send("-ERR 'Authorization Violation'\r\n");
    match connecting.await? {
        Err(Error::Authentication(text)) => assert!(text.contains("Authorization")),
        other => panic!("expected authentication error, got {other:?}"),
    }
    Ok(())
}
