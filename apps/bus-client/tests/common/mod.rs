#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use bus_client::memory::MemoryServer;
use bus_client::retry::RetryPolicy;
use bus_client::transport::{
    ConnectOptions, Connector, Message, PublishOptions, RequestManyOptions, RequestOptions,
    ServerInfo, Stats, Status, SubscribeOptions, Subscription, Transport,
};
use bus_client::{
    BusClient, BusConnection, BusError, Config, ConnectionFactory, PermissionsCache, Result,
    Session, Settings, UserDescriptor,
};

pub const URL: &str = "memory://bus";

/// Let spawned tasks that need no timers run to completion.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

// ---------------------------------------------------------------------------
// Stub transport: every observable is settable, every call is counted.
// ---------------------------------------------------------------------------

pub struct StubTransport {
    id: String,
    stats: Mutex<Stats>,
    subscriptions: AtomicUsize,
    connected: AtomicBool,
    draining: AtomicBool,
    closed: watch::Sender<bool>,
    status_tx: broadcast::Sender<Status>,
    close_calls: AtomicUsize,
    drain_calls: AtomicUsize,
    drained_at: Mutex<Option<Instant>>,
    fail_drain: AtomicBool,
}

impl StubTransport {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        let (status_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            id: id.into(),
            stats: Mutex::new(Stats::default()),
            subscriptions: AtomicUsize::new(0),
            connected: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            closed,
            status_tx,
            close_calls: AtomicUsize::new(0),
            drain_calls: AtomicUsize::new(0),
            drained_at: Mutex::new(None),
            fail_drain: AtomicBool::new(false),
        })
    }

    pub fn set_traffic(&self, in_bytes: u64, out_bytes: u64) {
        *self.stats.lock() = Stats {
            in_bytes,
            in_msgs: 1,
            out_bytes,
            out_msgs: 1,
        };
    }

    pub fn set_subscriptions(&self, n: usize) {
        self.subscriptions.store(n, Ordering::SeqCst);
    }

    pub fn fail_drain(&self) {
        self.fail_drain.store(true, Ordering::SeqCst);
    }

    pub fn emit(&self, status: Status) {
        let _ = self.status_tx.send(status);
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn drain_calls(&self) -> usize {
        self.drain_calls.load(Ordering::SeqCst)
    }

    pub fn drained_at(&self) -> Option<Instant> {
        *self.drained_at.lock()
    }

    fn shut(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.subscriptions.store(0, Ordering::SeqCst);
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn publish(&self, _subject: &str, _data: Vec<u8>, _options: PublishOptions) -> Result<()> {
        Ok(())
    }

    fn publish_message(&self, _msg: Message) -> Result<()> {
        Ok(())
    }

    fn respond_message(&self, msg: &Message, _data: Vec<u8>) -> Result<bool> {
        Ok(msg.reply.is_some())
    }

    fn subscribe(&self, subject: &str, _options: SubscribeOptions) -> Result<Subscription> {
        Err(BusError::internal(format!("stub cannot subscribe to {subject}")))
    }

    fn resub(&self, _sub: &mut Subscription, _subject: &str) -> Result<()> {
        Ok(())
    }

    fn check(&self, _subject: &str, _sub: bool, _publish: bool) -> Result<()> {
        Ok(())
    }

    async fn request(&self, subject: &str, _data: Vec<u8>, _options: RequestOptions) -> Result<Message> {
        Err(BusError::no_responders(subject))
    }

    async fn request_many(
        &self,
        subject: &str,
        _data: Vec<u8>,
        _options: RequestManyOptions,
    ) -> Result<Vec<Message>> {
        Err(BusError::no_responders(subject))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.drain_calls.fetch_add(1, Ordering::SeqCst);
        *self.drained_at.lock() = Some(Instant::now());
        if self.fail_drain.load(Ordering::SeqCst) {
            return Err(BusError::closed());
        }
        self.draining.store(true, Ordering::SeqCst);
        self.shut();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shut();
        Ok(())
    }

    async fn closed(&self) -> Option<BusError> {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
        None
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn get_server(&self) -> String {
        URL.to_string()
    }

    fn server_info(&self) -> Option<ServerInfo> {
        Some(ServerInfo {
            server_id: "stub".to_string(),
            server_name: "stub".to_string(),
            version: "2.10.22".to_string(),
            max_payload: 1024,
        })
    }

    async fn rtt(&self) -> Result<Duration> {
        Ok(Duration::ZERO)
    }

    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    fn status(&self) -> broadcast::Receiver<Status> {
        self.status_tx.subscribe()
    }

    fn stats(&self) -> Stats {
        *self.stats.lock()
    }

    fn num_subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Stub connector: records each connect and hands out fresh stub transports.
// ---------------------------------------------------------------------------

pub struct StubConnector {
    latency: Mutex<Duration>,
    /// Connects still to be rejected with a malformed-reply error.
    failures: AtomicUsize,
    attempts: AtomicUsize,
    opened: Mutex<Vec<(UserDescriptor, Arc<StubTransport>)>>,
}

impl StubConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latency: Mutex::new(Duration::ZERO),
            failures: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
        })
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Every connect call, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Connects that produced a transport.
    pub fn calls(&self) -> usize {
        self.opened.lock().len()
    }

    /// Users of every connect call, in order.
    pub fn users(&self) -> Vec<UserDescriptor> {
        self.opened.lock().iter().map(|(u, _)| u.clone()).collect()
    }

    pub fn opened(&self, index: usize) -> Arc<StubTransport> {
        self.opened.lock()[index].1.clone()
    }
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(BusError::invalid_argument("malformed payload: EOF"));
        }
        let user: UserDescriptor = serde_json::from_str(&options.name)?;
        let conn = {
            let mut opened = self.opened.lock();
            let conn = StubTransport::new(format!("stub-{}", opened.len() + 1));
            opened.push((user, conn.clone()));
            conn
        };
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(conn)
    }
}

pub fn stub_factory(connector: &Arc<StubConnector>) -> Arc<ConnectionFactory> {
    let retry = RetryPolicy::fixed(Settings::default().connect_retry_delay);
    Arc::new(ConnectionFactory::new(connector.clone(), URL, retry))
}

/// A facade over a hand-made stub (`stub-0`) for `user`, whose later
/// connections come from `connector`.
pub fn stub_connection(
    connector: &Arc<StubConnector>,
    user: UserDescriptor,
    cache: Arc<PermissionsCache>,
) -> (BusConnection, Arc<StubTransport>) {
    let initial = StubTransport::new("stub-0");
    let conn = BusConnection::new(
        initial.clone(),
        user,
        cache,
        stub_factory(connector),
        Settings::default(),
    );
    (conn, initial)
}

// ---------------------------------------------------------------------------
// In-process bus
// ---------------------------------------------------------------------------

pub async fn memory_client(server: &MemoryServer, session: Session) -> BusClient {
    BusClient::from_config(&Config::local(URL), Arc::new(server.clone()), session).await
}
