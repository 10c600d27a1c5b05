use super::*;
use crate::config::ReconnectConfig;
use crate::transport::memory;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

/// Resource that logs its release into a shared journal
struct Journaled {
    id: String,
    journal: Arc<Mutex<Vec<String>>>,
    fail: bool,
    delay: Duration,
}

impl Journaled {
    fn new(id: &str, journal: &Arc<Mutex<Vec<String>>>, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            journal: Arc::clone(journal),
            fail,
            delay: Duration::ZERO,
        })
    }

    fn slow(id: &str, journal: &Arc<Mutex<Vec<String>>>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            journal: Arc::clone(journal),
            fail: false,
            delay,
        })
    }
}

#[async_trait]
impl ManagedResource for Journaled {
    fn id(&self) -> &str {
        &self.id
    }

    async fn release(&self) -> RpcResult<()> {
        tokio::time::sleep(self.delay).await;
        self.journal.lock().push(self.id.clone());
        if self.fail {
            Err(RpcError::other(format!("{} refused to go", self.id)))
        } else {
            Ok(())
        }
    }
}

fn echo_connection(transport: crate::transport::Transport, name: &str) -> Connection {
    Connection::builder(transport)
        .config(crate::config::ConnectionConfig::default().named(name))
        .raw_method("echo", |_conn, params| async move { Ok(params.unwrap_or(Value::Null)) })
        .start()
}

/// A client-side connection plus the agent serving it
fn client_pair() -> (Connection, Connection) {
    let (agent_side, client_side) = memory::pair(64 * 1024);
    (
        echo_connection(agent_side, "agent"),
        Connection::builder(client_side).start(),
    )
}

fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&ConnectionEvent) + Send + Sync + 'static) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    (events, move |event: &ConnectionEvent| {
        sink.lock().push(event.name().to_string())
    })
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

#[tokio::test]
async fn test_shutdown_releases_terminals_then_sessions_once() {
    let (_agent, client) = client_pair();
    let (events, observer) = recorder();
    let managed = ManagedConnection::builder("c1", Role::Client, client.clone())
        .on_event(observer)
        .start();

    let journal = Arc::new(Mutex::new(Vec::new()));
    managed.sessions().track(Journaled::new("session-1", &journal, true));
    let terminals = managed.terminals().expect("client role owns terminals");
    terminals.track(Journaled::new("terminal-1", &journal, true));

    let err = managed.shutdown(&CancellationToken::new()).await.unwrap_err();
    match &err {
        RpcError::Aggregate(errors) => assert_eq!(errors.len(), 2),
        other => panic!("expected aggregate, got {other:?}"),
    }
    assert_eq!(*journal.lock(), vec!["terminal-1", "session-1"]);

    assert_eq!(managed.shutdown_state(), ShutdownState::Closed);
    assert!(client.is_closed());
    assert!(managed.lifecycle_token().is_cancelled());

    // Second call is a no-op.
    assert!(managed.shutdown(&CancellationToken::new()).await.is_ok());
    assert_eq!(journal.lock().len(), 2);
    assert_eq!(*events.lock(), vec!["connected", "disconnected", "error"]);
}

#[tokio::test]
async fn test_clean_shutdown() {
    let (_agent, client) = client_pair();
    let managed = ManagedConnection::new("a1", Role::Agent, client);
    assert!(managed.terminals().is_none());

    let journal = Arc::new(Mutex::new(Vec::new()));
    managed.sessions().track(Journaled::new("s", &journal, false));

    assert!(managed.shutdown(&CancellationToken::new()).await.is_ok());
    assert!(managed.sessions().is_empty());
    assert!(!managed.is_running());
    assert!(matches!(
        managed.reconnect(&CancellationToken::new()).await,
        Err(RpcError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn test_shutdown_is_bounded_by_timeout() {
    let (_agent, client) = client_pair();
    let config = ManagedConfig {
        shutdown_timeout: Duration::from_millis(50),
        ..ManagedConfig::default()
    };
    let managed = ManagedConnection::builder("slow", Role::Agent, client.clone())
        .config(config)
        .start();

    let journal = Arc::new(Mutex::new(Vec::new()));
    managed
        .sessions()
        .track(Journaled::slow("stuck", &journal, Duration::from_secs(30)));

    let err = tokio::time::timeout(
        Duration::from_secs(5),
        managed.shutdown(&CancellationToken::new()),
    )
    .await
    .expect("shutdown ignored its timeout")
    .unwrap_err();

    assert!(err.causes().iter().any(|e| matches!(e, RpcError::Timeout { millis: 50 })));
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_shutdown_honours_cancellation() {
    let (_agent, client) = client_pair();
    let managed = ManagedConnection::new("c", Role::Client, client);
    let journal = Arc::new(Mutex::new(Vec::new()));
    managed
        .sessions()
        .track(Journaled::slow("stuck", &journal, Duration::from_secs(30)));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = managed.shutdown(&cancel).await.unwrap_err();
    assert!(err.causes().iter().any(|e| matches!(e, RpcError::Cancelled)));
    assert_eq!(managed.shutdown_state(), ShutdownState::Closed);
}

#[tokio::test]
async fn test_state_is_mirrored_as_events() {
    let (_agent, client) = client_pair();
    let managed = ManagedConnection::new("c", Role::Client, client.clone());
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&transitions);
    managed.on_event(move |event| {
        if let ConnectionEvent::StateChanged { from, to } = event {
            sink.lock().push((*from, *to));
        }
    });

    client.set_state(ConnectionState::Initialized).unwrap();
    client.set_state(ConnectionState::Authenticated).unwrap();

    assert_eq!(managed.state(), ConnectionState::Authenticated);
    assert_eq!(
        *transitions.lock(),
        vec![
            (ConnectionState::Uninitialized, ConnectionState::Initialized),
            (ConnectionState::Initialized, ConnectionState::Authenticated),
        ]
    );
}

#[tokio::test]
async fn test_panicking_observer_does_not_stop_others() {
    let (_agent, client) = client_pair();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);

    let managed = ManagedConnection::builder("c", Role::Agent, client.clone())
        .on_event(|_| panic!("observer bug"))
        .on_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .start();

    client.set_state(ConnectionState::Initialized).unwrap();
    managed.shutdown(&CancellationToken::new()).await.unwrap();

    // connected, state_changed, disconnected
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_reconnect_requires_connector() {
    let (_agent, client) = client_pair();
    let managed = ManagedConnection::new("c", Role::Client, client);
    let err = managed.reconnect(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, RpcError::Config { .. }));
}

#[tokio::test]
async fn test_supervisor_reconnects_after_peer_loss() {
    let agents: Arc<Mutex<Vec<Connection>>> = Arc::new(Mutex::new(Vec::new()));
    let (first_agent, client) = client_pair();
    agents.lock().push(first_agent.clone());

    let registry = Arc::clone(&agents);
    let connector = move || {
        let registry = Arc::clone(&registry);
        async move {
            let (agent_side, client_side) = memory::pair(64 * 1024);
            registry.lock().push(echo_connection(agent_side, "agent"));
            Ok::<_, RpcError>(Connection::builder(client_side).start())
        }
    };

    let (events, observer) = recorder();
    let managed = ManagedConnection::builder("c", Role::Client, client.clone())
        .config(ManagedConfig {
            reconnect: ReconnectConfig::enabled()
                .initial_delay(Duration::from_millis(1))
                .max_delay(Duration::from_millis(5)),
            ..ManagedConfig::default()
        })
        .connector(connector)
        .on_event(observer)
        .start();

    first_agent.close().await.unwrap();
    eventually(|| events.lock().iter().filter(|e| *e == "connected").count() == 2).await;

    let fresh = managed.connection();
    assert!(!fresh.ptr_eq(&client));
    let echoed: String = fresh.call("echo", "again").await.unwrap();
    assert_eq!(echoed, "again");
    assert_eq!(
        events.lock()[..4],
        ["connected", "disconnected", "reconnecting", "connected"]
    );

    managed.shutdown(&CancellationToken::new()).await.unwrap();
}

#[tokio::test]
async fn test_supervisor_gives_up_after_max_retries() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let (agent, client) = client_pair();

    let (events, observer) = recorder();
    let policy = ReconnectPolicy::new(
        ReconnectConfig::enabled()
            .max_retries(2)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2)),
    )
    .on_attempt(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let _managed = ManagedConnection::builder("c", Role::Client, client)
        .connector(|| async { Err::<Connection, _>(RpcError::transport("agent binary missing")) })
        .reconnect_policy(policy)
        .on_event(observer)
        .start();

    agent.close().await.unwrap();
    eventually(|| events.lock().last().map(String::as_str) == Some("error")).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}
