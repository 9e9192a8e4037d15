// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::atomic::Ordering, time::Duration};

use region_ipc_client::{BytesPayload, Client, IpcError, Serializable, cfg::config::ClientConfig};
use tokio::net::TcpListener;

use super::server::{Reply, TestServer};

/// S1: a single call round-trips its payload through a real socket.
#[tokio::test]
async fn single_call_round_trips_through_the_wire() {
    let server = TestServer::spawn(Duration::ZERO, |_id, mut payload| {
        payload.extend_from_slice(b"-ack");
        Reply::Value(payload)
    })
    .await;

    let client = Client::<BytesPayload>::new(ClientConfig::default());
    let value = client.call(&BytesPayload::new(b"hi".to_vec()), server.addr).await.unwrap();
    assert_eq!(value.0, b"hi-ack");

    client.stop().await;
}

/// S2: a remote exception is surfaced as-is and the connection stays usable.
#[tokio::test]
async fn remote_exception_surfaces_without_closing_the_connection() {
    let server = TestServer::spawn(Duration::ZERO, |_id, _payload| {
        Reply::Error("java.lang.RuntimeException".to_string(), "boom".to_string())
    })
    .await;

    let client = Client::<BytesPayload>::new(ClientConfig::default());
    let err = client.call(&BytesPayload::new(b"x".to_vec()), server.addr).await.unwrap_err();
    match err {
        IpcError::Remote(e) => assert_eq!(e.message, "boom"),
        other => panic!("expected a Remote error, got {other:?}"),
    }

    assert_eq!(client.connection_count().await, 1, "connection must survive a remote error");
    client.stop().await;
}

/// S3: a connect-refused failure is surfaced after the bounded retry cap.
#[tokio::test]
async fn connect_refused_is_surfaced_after_bounded_retries() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener); // nobody is listening on `addr` anymore

    let mut cfg = ClientConfig::default();
    cfg.max_retries = 0; // exhausts after exactly one attempt

    let client = Client::<BytesPayload>::new(cfg);
    let err = client.call(&BytesPayload::default(), addr).await.unwrap_err();
    assert!(matches!(err, IpcError::ConnectRefused { .. }), "got {err:?}");

    client.stop().await;
}

/// S4: a connection with no in-flight calls is evicted once it has been
/// idle past `max_idle_time`.
#[tokio::test]
async fn idle_connections_are_evicted_after_max_idle_time() {
    let server = TestServer::spawn(Duration::ZERO, |_id, payload| Reply::Value(payload)).await;

    let mut cfg = ClientConfig::default();
    cfg.max_idle_time = Duration::from_millis(80);
    cfg.ping_interval = Duration::from_secs(60);

    let client = Client::<BytesPayload>::new(cfg);
    client.call(&BytesPayload::new(b"a".to_vec()), server.addr).await.unwrap();
    assert_eq!(client.connection_count().await, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(client.connection_count().await, 0, "idle connection should have been evicted");

    client.stop().await;
}

/// S5: a call whose response is delayed past the ping interval keeps the
/// connection alive via the read-timeout heartbeat instead of failing.
#[tokio::test]
async fn long_running_call_keeps_the_connection_alive_with_pings() {
    let server =
        TestServer::spawn(Duration::from_millis(260), |_id, payload| Reply::Value(payload)).await;
    let ping_count = server.ping_count.clone();

    let mut cfg = ClientConfig::default();
    cfg.ping_interval = Duration::from_millis(50);

    let client = Client::<BytesPayload>::new(cfg);
    let value = client.call(&BytesPayload::new(b"slow".to_vec()), server.addr).await.unwrap();
    assert_eq!(value.0, b"slow");

    let pings = ping_count.load(Ordering::SeqCst);
    assert!(pings >= 2, "expected at least 2 pings during the long read, got {pings}");

    client.stop().await;
}

/// `stop()` must return promptly even when the only connection is idle (its
/// `pending` map empty) at the moment of cancellation — a reader parked in
/// `wait_for_work` with nothing pending must still notice the cancellation
/// and tear itself down instead of looping forever.
#[tokio::test]
async fn stop_completes_when_the_only_connection_is_idle() {
    let server = TestServer::spawn(Duration::ZERO, |_id, payload| Reply::Value(payload)).await;

    let client = Client::<BytesPayload>::new(ClientConfig::default());
    client.call(&BytesPayload::new(b"a".to_vec()), server.addr).await.unwrap();
    assert_eq!(client.connection_count().await, 1);

    tokio::time::timeout(Duration::from_secs(5), client.stop())
        .await
        .expect("stop() must not hang on an idle connection");
    assert_eq!(client.connection_count().await, 0);
}

/// Resolving a nonexistent hostname surfaces `IpcError::UnknownHost` instead
/// of reaching the connect-retry machinery.
#[tokio::test]
async fn call_host_surfaces_unknown_host_for_unresolvable_names() {
    let client = Client::<BytesPayload>::new(ClientConfig::default());
    let err = client
        .call_host(&BytesPayload::default(), "this-host-does-not-resolve.invalid", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::UnknownHost(_)), "got {err:?}");

    client.stop().await;
}

/// S6: a parallel fan-out reports the failing leg as `None` instead of
/// failing the whole batch.
#[tokio::test]
async fn parallel_fan_out_reports_partial_failure_as_none() {
    let good = TestServer::spawn(Duration::ZERO, |_id, payload| Reply::Value(payload)).await;

    let dead_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead_listener.local_addr().unwrap();
    drop(dead_listener);

    let mut cfg = ClientConfig::default();
    cfg.max_retries = 0;

    let client = Client::<BytesPayload>::new(cfg);

    let p1 = BytesPayload::new(b"one".to_vec());
    let p2 = BytesPayload::new(b"two".to_vec());
    let params: Vec<&dyn Serializable> = vec![&p1, &p2];
    let addrs = vec![good.addr, dead_addr];

    let values = client.call_parallel(&params, &addrs).await.unwrap();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].as_ref().unwrap().0, b"one");
    assert!(values[1].is_none());

    client.stop().await;
}
