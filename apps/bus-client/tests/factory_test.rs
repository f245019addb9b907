mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};

use bus_client::memory::MemoryServer;
use bus_client::retry::RetryPolicy;
use bus_client::transport::Transport;
use bus_client::{ConnectionFactory, ErrorCode, UserDescriptor};

use common::{StubConnector, URL};

fn memory_factory(server: &MemoryServer) -> Arc<ConnectionFactory> {
    Arc::new(ConnectionFactory::new(
        Arc::new(server.clone()),
        URL,
        RetryPolicy::fixed(Duration::from_secs(3)),
    ))
}

// ---------------------------------------------------------------------------
// Connect options
// ---------------------------------------------------------------------------

#[test]
fn connect_options_derive_from_account() {
    let connector = StubConnector::new();
    let factory = common::stub_factory(&connector);
    let options = factory
        .connect_options(&UserDescriptor::new("acc", ["p2", "p1", "p2"]))
        .unwrap();

    assert_eq!(options.name, r#"{"accountId":"acc","projectIds":["p1","p2"]}"#);
    assert_eq!(options.user, "account-acc");
    assert_eq!(options.inbox_prefix, "_INBOX.account-acc");
    assert_eq!(options.servers, vec![URL.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn missing_account_fails_without_connecting() {
    let server = MemoryServer::new(URL);
    let factory = memory_factory(&server);

    let err = factory
        .get_new_conn(&UserDescriptor::new("", ["p1"]))
        .await
        .err()
        .unwrap();
    assert_eq!(err.code, ErrorCode::NotSignedIn);
    assert_eq!(server.connect_attempts(), 0);
}

// ---------------------------------------------------------------------------
// Single-flight
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_attempt() {
    let connector = StubConnector::new();
    connector.set_latency(Duration::from_secs(1));
    let factory = common::stub_factory(&connector);
    let user = UserDescriptor::new("acc", ["p1"]);

    let results = futures_util::future::join_all((0..5).map(|_| factory.get_new_conn(&user))).await;

    assert_eq!(connector.calls(), 1);
    let ids: Vec<String> = results
        .into_iter()
        .map(|r| r.ok().unwrap().id().to_string())
        .collect();
    assert!(ids.iter().all(|id| id == "stub-1"));
}

#[tokio::test(start_paused = true)]
async fn settled_connect_is_not_reused() {
    let connector = StubConnector::new();
    let factory = common::stub_factory(&connector);
    let user = UserDescriptor::new("acc", ["p1"]);

    let first = factory.get_new_conn(&user).await.ok().unwrap();
    let second = factory.get_new_conn(&user).await.ok().unwrap();

    assert_eq!(connector.calls(), 2);
    assert_ne!(first.id(), second.id());
}

#[tokio::test(start_paused = true)]
async fn different_users_connect_separately() {
    let connector = StubConnector::new();
    connector.set_latency(Duration::from_secs(1));
    let factory = common::stub_factory(&connector);

    let a = UserDescriptor::new("acc", ["p1"]);
    let b = UserDescriptor::new("acc", ["p1", "p2"]);
    let (ra, rb) = tokio::join!(factory.get_new_conn(&a), factory.get_new_conn(&b));
    assert!(ra.is_ok() && rb.is_ok());
    assert_eq!(connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn connect_fresh_bypasses_in_flight_attempt() {
    let connector = StubConnector::new();
    connector.set_latency(Duration::from_secs(1));
    let factory = common::stub_factory(&connector);
    let user = UserDescriptor::new("acc", ["p1"]);

    let (shared, fresh) = tokio::join!(factory.get_new_conn(&user), factory.connect_fresh(&user));
    assert_ne!(shared.ok().unwrap().id(), fresh.ok().unwrap().id());
    assert_eq!(connector.calls(), 2);
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn retries_every_three_seconds_until_connected() {
    let server = MemoryServer::new(URL);
    server.grant("acc", ["p1"]);
    server.fail_next_connects(2);
    let factory = memory_factory(&server);

    let start = Instant::now();
    let conn = factory
        .get_new_conn(&UserDescriptor::new("acc", ["p1"]))
        .await
        .ok()
        .unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(6));
    assert_eq!(server.connect_attempts(), 3);
    assert!(conn.is_connected());
}

#[tokio::test(start_paused = true)]
async fn malformed_connect_reply_is_retried() {
    let connector = StubConnector::new();
    connector.fail_next(2);
    let factory = common::stub_factory(&connector);

    let start = Instant::now();
    let conn = factory
        .get_new_conn(&UserDescriptor::new("acc", ["p1"]))
        .await
        .ok()
        .unwrap();

    assert_eq!(start.elapsed(), Duration::from_secs(6));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(connector.calls(), 1);
    assert_eq!(conn.id(), "stub-1");
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_retrying() {
    let server = MemoryServer::new(URL);
    server.fail_next_connects(usize::MAX);
    let factory = memory_factory(&server);

    let pending = tokio::spawn({
        let factory = factory.clone();
        async move {
            factory
                .get_new_conn(&UserDescriptor::new("acc", ["p1"]))
                .await
                .map(|_| ())
        }
    });
    time::sleep(Duration::from_secs(10)).await;
    factory.shutdown();

    let err = pending.await.unwrap().unwrap_err();
    assert_eq!(err.code, ErrorCode::Cancelled);
    assert_eq!(server.connect_attempts(), 4);
}
