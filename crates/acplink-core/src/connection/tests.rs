use super::*;
use crate::config::DEFAULT_NOTIFICATION_BUFFER;
use crate::error::{ProtocolError, codes};
use crate::protocol::{Message, Request};
use crate::stream::{Direction, StreamPayload};
use crate::transport::{MessageReader, MessageWriter, memory};
use futures::future::join_all;
use serde_json::json;
use std::sync::atomic::AtomicUsize;

fn echo_agent(builder: ConnectionBuilder) -> ConnectionBuilder {
    builder
        .raw_method("echo", |_conn, params| async move { Ok(params.unwrap_or(Value::Null)) })
        .method("double", |_conn, n: i64| async move { Ok(n * 2) })
}

fn connect(
    agent: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder,
    client: impl FnOnce(ConnectionBuilder) -> ConnectionBuilder,
) -> (Connection, Connection) {
    let (agent_side, client_side) = memory::pair(64 * 1024);
    let agent = agent(Connection::builder(agent_side).config(ConnectionConfig::default().named("agent"))).start();
    let client = client(Connection::builder(client_side).config(ConnectionConfig::default().named("client"))).start();
    (agent, client)
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (agent, client) = connect(echo_agent, |b| b);

    let echoed: Value = client.call("echo", json!({"hello": "world"})).await.unwrap();
    assert_eq!(echoed, json!({"hello": "world"}));

    let doubled: i64 = client.call("double", 21).await.unwrap();
    assert_eq!(doubled, 42);

    client.close().await.unwrap();
    agent.close().await.unwrap();
}

#[tokio::test]
async fn test_calls_written_in_fifo_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let (_agent, client) = connect(
        move |b| {
            b.method("record", move |_conn, n: u32| {
                let recorder = Arc::clone(&recorder);
                async move {
                    recorder.lock().push(n);
                    Ok(n + 1000)
                }
            })
        },
        |b| b,
    );

    let calls = (0..20u32).map(|n| {
        let client = client.clone();
        async move { (n, client.call::<_, u32>("record", n).await.unwrap()) }
    });
    let results = join_all(calls).await;

    for (n, result) in results {
        assert_eq!(result, n + 1000);
    }
    assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_reentrant_call_and_notify_from_handler() {
    let progress = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);

    let (_agent, client) = connect(
        |b| {
            b.method("outer", |conn: Connection, n: i64| async move {
                let doubled: i64 = conn
                    .call("client/double", n)
                    .await
                    .map_err(|e| ProtocolError::internal_error().with_data(json!(e.to_string())))?;
                conn.notify("client/progress", doubled)
                    .map_err(|_| ProtocolError::internal_error())?;
                Ok(doubled + 1)
            })
        },
        move |b| {
            b.method("client/double", |_conn, n: i64| async move { Ok(n * 2) })
                .notification("client/progress", move |_conn, n: i64| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(n);
                        Ok(())
                    }
                })
        },
    );

    let result: i64 = tokio::time::timeout(Duration::from_secs(5), client.call("outer", 5))
        .await
        .expect("re-entrant call deadlocked")
        .unwrap();
    assert_eq!(result, 11);

    tokio::time::timeout(Duration::from_secs(5), async {
        while progress.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(*progress.lock(), vec![10]);
}

#[tokio::test]
async fn test_close_is_idempotent_under_concurrency() {
    let (_agent, client) = connect(echo_agent, |b| b);

    let outcomes = join_all((0..8).map(|_| {
        let client = client.clone();
        async move { client.close().await }
    }))
    .await;

    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert!(client.is_closed());
    assert!(client.close().await.is_ok());
}

#[tokio::test]
async fn test_operations_after_close_fail_fast() {
    let (_agent, client) = connect(echo_agent, |b| b);
    client.close().await.unwrap();

    let call = tokio::time::timeout(Duration::from_millis(100), client.call::<_, Value>("echo", ()))
        .await
        .unwrap();
    assert!(matches!(call, Err(RpcError::ConnectionClosed)));
    assert!(matches!(client.notify("anything", ()), Err(RpcError::ConnectionClosed)));
    assert!(matches!(
        client.notify_direct("anything", ()).await,
        Err(RpcError::ConnectionClosed)
    ));
    assert!(client.wait().await.is_ok());
}

#[tokio::test]
async fn test_in_flight_call_fails_on_local_close() {
    let (_agent, client) = connect(
        |b| {
            b.raw_method("hang", |_conn, _params| async {
                futures::future::pending::<Result<Value, ProtocolError>>().await
            })
        },
        |b| b,
    );

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, Value>("hang", ()).await })
    };
    while client.stats().pending_calls == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    client.close().await.unwrap();
    assert!(matches!(waiter.await.unwrap(), Err(RpcError::ConnectionClosed)));
}

#[tokio::test]
async fn test_peer_close_disconnects_other_side() {
    let (agent, client) = connect(echo_agent, |b| b);

    client.close().await.unwrap();
    let waited = tokio::time::timeout(Duration::from_secs(5), agent.wait())
        .await
        .unwrap();
    assert!(matches!(waited, Err(RpcError::Disconnected { .. })));

    assert!(agent.is_done());
    assert!(!agent.is_closed());
    let err = agent.call::<_, Value>("echo", ()).await.unwrap_err();
    assert!(err.is_transport());
    assert!(matches!(err, RpcError::Disconnected { .. }));
    assert!(agent.disconnect_reason().is_some());

    // Closing after the peer left keeps the disconnect as the outcome.
    agent.close().await.ok();
    assert!(matches!(agent.wait().await, Err(RpcError::Disconnected { .. })));
}

#[tokio::test]
async fn test_notification_queue_full() {
    let (local, _peer) = memory::pair(64);
    let conn = Connection::builder(local).start();

    // Nothing yields between enqueues, so the consumer has not drained any.
    for n in 0..DEFAULT_NOTIFICATION_BUFFER {
        conn.notify("tick", n).unwrap();
    }
    let err = conn.notify("tick", "overflow").unwrap_err();
    assert!(matches!(err, RpcError::NotificationQueueFull { capacity: 50 }));
    assert_eq!(conn.stats().notifications_dropped, 1);
}

#[tokio::test]
async fn test_notify_with_cancelled_token() {
    let (_agent, client) = connect(echo_agent, |b| b);
    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        client.notify_with(&cancel, "tick", ()),
        Err(RpcError::Cancelled)
    ));
    assert!(matches!(
        client.call_with::<_, Value>(&cancel, "echo", ()).await,
        Err(RpcError::Cancelled)
    ));
}

async fn wait_for(seen: &Arc<Mutex<Vec<u32>>>, len: usize) -> parking_lot::MutexGuard<'_, Vec<u32>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        while seen.lock().len() < len {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    seen.lock()
}

#[tokio::test]
async fn test_notifications_arrive_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let (_agent, client) = connect(
        move |b| {
            b.notification("tick", move |_conn, n: u32| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(n);
                    Ok(())
                }
            })
        },
        |b| b,
    );

    for n in 0..10u32 {
        client.notify("tick", n).unwrap();
    }
    assert_eq!(
        *wait_for(&seen, 10).await,
        (0..10).collect::<Vec<_>>()
    );

    // A direct write bypasses the buffer, so it is only ordered after
    // notifications that already left it.
    client.notify_direct("tick", 10u32).await.unwrap();
    assert_eq!(*wait_for(&seen, 11).await, (0..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_protocol_errors_over_the_wire() {
    let (_agent, client) = connect(echo_agent, |b| b);

    match client.call::<_, Value>("missing", ()).await {
        Err(RpcError::Protocol(e)) => assert_eq!(e.code, codes::METHOD_NOT_FOUND),
        other => panic!("unexpected {other:?}"),
    }
    match client.call::<_, Value>("double", "not a number").await {
        Err(RpcError::Protocol(e)) => assert_eq!(e.code, codes::INVALID_PARAMS),
        other => panic!("unexpected {other:?}"),
    }

    // Unknown notifications are ignored and the connection keeps working.
    client.notify("nobody/listens", ()).unwrap();
    let doubled: i64 = client.call("double", 4).await.unwrap();
    assert_eq!(doubled, 8);
}

#[tokio::test]
async fn test_call_timeout() {
    let (_agent, client) = connect(
        |b| {
            b.raw_method("slow", |_conn, _params| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            })
        },
        |b| b,
    );

    let err = client
        .call_with_timeout::<_, Value>(&CancellationToken::new(), "slow", (), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { millis: 50 }));
    assert_eq!(client.stats().pending_calls, 0);
}

#[tokio::test]
async fn test_cancel_after_issue() {
    let started = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&started);
    let (_agent, client) = connect(
        move |b| {
            b.raw_method("slow", move |_conn, _params| {
                let flag = Arc::clone(&flag);
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Value::Null)
                }
            })
        },
        |b| b,
    );

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    let counter = Arc::clone(&started);
    tokio::spawn(async move {
        while counter.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        canceller.cancel();
    });

    let err = client.call_with::<_, Value>(&cancel, "slow", ()).await.unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));
    assert_eq!(started.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_sees_both_directions() {
    let (_agent, client) = connect(echo_agent, |b| b);
    let mut events = client.subscribe();

    let _: i64 = client.call("double", 3).await.unwrap();

    let cancel = CancellationToken::new();
    let outgoing = events.recv(&cancel).await.unwrap();
    assert_eq!(outgoing.direction, Direction::Outgoing);
    assert_eq!(outgoing.method(), Some("double"));

    let incoming = events.recv(&cancel).await.unwrap();
    assert_eq!(incoming.direction, Direction::Incoming);
    assert!(matches!(incoming.payload, StreamPayload::Response { .. }));

    client.close().await.unwrap();
    assert!(events.recv(&cancel).await.is_err());
}

#[tokio::test]
async fn test_state_is_observational() {
    let (_agent, client) = connect(echo_agent, |b| b);
    let changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&changes);
    client.on_state_change(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Calls are not gated on the lifecycle.
    let _: i64 = client.call("double", 1).await.unwrap();

    client.set_state(ConnectionState::Initialized).unwrap();
    assert!(client.set_state(ConnectionState::Uninitialized).is_err());
    client.set_state(ConnectionState::SessionReady).unwrap();
    client.set_state(ConnectionState::SessionReady).unwrap();

    assert_eq!(client.state(), ConnectionState::SessionReady);
    assert!(client.require_state(ConnectionState::SessionReady).is_ok());
    assert_eq!(changes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stats_count_traffic() {
    let (agent, client) = connect(echo_agent, |b| b);
    let _: i64 = client.call("double", 2).await.unwrap();
    client.notify_direct("nobody/listens", ()).await.unwrap();

    let stats = client.stats();
    assert_eq!(stats.calls_issued, 1);
    assert_eq!(stats.notifications_sent, 1);
    assert_eq!(stats.inbound_messages, 1);
    assert_eq!(stats.pending_calls, 0);

    tokio::time::timeout(Duration::from_secs(5), async {
        while agent.stats().responses_sent < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// A client whose call consumer is stuck writing a frame larger than the
/// pipe, plus the peer reader that can unstick it
async fn stalled_client() -> (Connection, Box<dyn MessageReader>, Box<dyn MessageWriter>) {
    let (local, remote) = memory::pair(64);
    let client = Connection::builder(local)
        .config(ConnectionConfig::default().named("stalled"))
        .start();
    let (peer_reader, peer_writer) = remote.into_parts();

    let caller = client.clone();
    tokio::spawn(async move { caller.call::<_, Value>("first", "x".repeat(4096)).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.stats().calls_issued, 0);

    (client, peer_reader, peer_writer)
}

async fn next_method(reader: &mut Box<dyn MessageReader>) -> String {
    let message = tokio::time::timeout(Duration::from_secs(5), reader.receive())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    message.method().unwrap().to_string()
}

#[tokio::test]
async fn test_call_cancelled_while_queued_is_never_sent() {
    let (client, mut peer, _peer_writer) = stalled_client().await;

    let token = CancellationToken::new();
    let skipped = {
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move { client.call_with::<_, Value>(&token, "skipped", ()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    token.cancel();
    assert!(matches!(skipped.await.unwrap(), Err(RpcError::Cancelled)));

    let after = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, Value>("after", ()).await })
    };

    assert_eq!(next_method(&mut peer).await, "first");
    assert_eq!(next_method(&mut peer).await, "after");
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.stats().calls_issued < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(client.stats().calls_issued, 2);

    client.close().await.ok();
    assert!(matches!(after.await.unwrap(), Err(RpcError::ConnectionClosed)));
}

#[tokio::test]
async fn test_queued_call_timeout_releases_its_slot() {
    let (client, mut peer, _peer_writer) = stalled_client().await;

    let err = client
        .call_with_timeout::<_, Value>(&CancellationToken::new(), "late", (), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Timeout { .. }));
    assert_eq!(client.stats().pending_calls, 1);

    let after = {
        let client = client.clone();
        tokio::spawn(async move { client.call::<_, Value>("after", ()).await })
    };
    assert_eq!(next_method(&mut peer).await, "first");
    assert_eq!(next_method(&mut peer).await, "after");
    assert_eq!(client.stats().pending_calls, 2);

    client.close().await.ok();
    assert!(after.await.unwrap().is_err());
    assert_eq!(client.stats().pending_calls, 0);
}

#[tokio::test]
async fn test_close_completes_when_peer_stops_reading() {
    let (local, remote) = memory::pair(256);
    let config = ConnectionConfig {
        inbound_buffer: 1,
        ..ConnectionConfig::default()
    };
    let conn = Connection::builder(local)
        .config(config)
        .method("slow", |_conn, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
        .start();
    let (_peer_reader, mut peer_writer) = remote.into_parts();

    for id in 0..200i64 {
        let mut request = Request::new(id, "slow");
        request.params = Some(json!(50));
        peer_writer.send(&Message::from(request)).await.unwrap();
    }
    tokio::time::timeout(Duration::from_secs(5), async {
        while conn.stats().inbound_messages < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(conn.stats().inbound_rejected > 0);

    let closed = tokio::time::timeout(Duration::from_secs(5), conn.close()).await;
    assert!(closed.is_ok());
    assert!(conn.is_closed());
}
