//! In-process message bus.
//!
//! Implements the [`Connector`]/[`Transport`] boundary without a network:
//! subject routing lives in a `DashMap` shared by every connection, and each
//! connection is authorised for the projects its account has been granted
//! out of the ones it asked for. Used by the demo binary and by tests.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus_common::id::{self, prefix};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{self, Instant};

use crate::error::{BusError, ErrorCode, Result};
use crate::factory::UserDescriptor;
use crate::subject;
use crate::transport::{
    ConnectOptions, Connector, Message, Permissions, PublishOptions, RequestManyOptions,
    RequestOptions, ServerInfo, Stats, Status, SubjectPermission, SubscribeOptions, Subscription,
    SubscriptionControl, Transport, UserInfo, UserInfoReply,
};

/// Version reported by the in-process server.
pub const DEFAULT_VERSION: &str = "2.10.22";

/// Capacity of each connection's status channel.
const STATUS_CAPACITY: usize = 64;

const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Handle onto an in-process bus. Cloneable; clones share the same bus.
#[derive(Clone)]
pub struct MemoryServer {
    shared: Arc<ServerShared>,
    /// Every connection ever opened, kept here rather than in `ServerShared`
    /// so connections do not keep themselves alive through the server.
    connections: Arc<Mutex<Vec<Arc<MemoryConnection>>>>,
}

struct ServerShared {
    url: String,
    info: Mutex<ServerInfo>,
    /// account id -> projects the account may access.
    grants: DashMap<String, BTreeSet<String>>,
    /// sid -> route.
    routes: DashMap<u64, Route>,
    next_sid: AtomicU64,
    connect_attempts: AtomicUsize,
    failing_connects: AtomicUsize,
    connect_latency: Mutex<Duration>,
}

struct Route {
    subject: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
    remaining: Option<usize>,
    owner: Arc<ConnCounters>,
    /// Request inboxes: not visible as user subscriptions.
    internal: bool,
}

/// Per-connection state that routes need to reach.
struct ConnCounters {
    sids: Mutex<HashSet<u64>>,
    in_bytes: AtomicU64,
    in_msgs: AtomicU64,
    out_bytes: AtomicU64,
    out_msgs: AtomicU64,
}

impl ConnCounters {
    fn new() -> Self {
        Self {
            sids: Mutex::new(HashSet::new()),
            in_bytes: AtomicU64::new(0),
            in_msgs: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            out_msgs: AtomicU64::new(0),
        }
    }

    fn record_in(&self, bytes: usize) {
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
    }

    fn record_out(&self, bytes: usize) {
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Stats {
        Stats {
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
        }
    }
}

impl ServerShared {
    fn add_route(&self, route: Route) -> u64 {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed) + 1;
        if !route.internal {
            route.owner.sids.lock().insert(sid);
        }
        self.routes.insert(sid, route);
        sid
    }

    fn remove_route(&self, sid: u64) {
        if let Some((_, route)) = self.routes.remove(&sid) {
            route.owner.sids.lock().remove(&sid);
        }
    }

    fn remove_routes_of(&self, owner: &Arc<ConnCounters>) {
        self.routes.retain(|_, r| !Arc::ptr_eq(&r.owner, owner));
        owner.sids.lock().clear();
    }

    /// Fan `msg` out to every matching route. Within a queue group only the
    /// member with the lowest sid receives it. Returns the number of
    /// deliveries.
    fn deliver(&self, msg: &Message) -> usize {
        let mut matched: Vec<(u64, Option<String>)> = self
            .routes
            .iter()
            .filter(|e| subject::matches(&e.subject, &msg.subject))
            .map(|e| (*e.key(), e.queue.clone()))
            .collect();
        matched.sort_by_key(|(sid, _)| *sid);

        let mut groups = HashSet::new();
        let mut delivered = 0;
        let mut expired = Vec::new();
        for (sid, queue) in matched {
            if let Some(queue) = queue {
                if !groups.insert(queue) {
                    continue;
                }
            }
            let Some(mut route) = self.routes.get_mut(&sid) else {
                continue;
            };
            if route.tx.send(msg.clone()).is_err() {
                expired.push(sid);
                continue;
            }
            route.owner.record_in(msg.data.len());
            delivered += 1;
            if let Some(remaining) = route.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
                if *remaining == 0 {
                    expired.push(sid);
                }
            }
        }
        for sid in expired {
            self.remove_route(sid);
        }
        delivered
    }
}

impl SubscriptionControl for ServerShared {
    fn unsubscribe(&self, sid: u64) {
        self.remove_route(sid);
    }
}

impl MemoryServer {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let info = ServerInfo {
            server_id: id::prefixed_ulid("srv"),
            server_name: "memory".to_string(),
            version: DEFAULT_VERSION.to_string(),
            max_payload: MAX_PAYLOAD,
        };
        Self {
            shared: Arc::new(ServerShared {
                url,
                info: Mutex::new(info),
                grants: DashMap::new(),
                routes: DashMap::new(),
                next_sid: AtomicU64::new(0),
                connect_attempts: AtomicUsize::new(0),
                failing_connects: AtomicUsize::new(0),
                connect_latency: Mutex::new(Duration::ZERO),
            }),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn set_version(&self, version: impl Into<String>) {
        self.shared.info.lock().version = version.into();
    }

    /// Allow `account_id` to access `projects` (in addition to existing grants).
    pub fn grant<I, S>(&self, account_id: &str, projects: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entry = self.shared.grants.entry(account_id.to_string()).or_default();
        entry.extend(projects.into_iter().map(Into::into));
    }

    /// Remove a grant. Existing connections keep what they were given.
    pub fn revoke(&self, account_id: &str, project_id: &str) {
        if let Some(mut entry) = self.shared.grants.get_mut(account_id) {
            entry.remove(project_id);
        }
    }

    /// Make the next `n` connect attempts fail with a transient error.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Delay every connect attempt by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        *self.shared.connect_latency.lock() = latency;
    }

    /// Connect attempts seen so far, including failed ones.
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Every connection ever opened, in order.
    pub fn connections(&self) -> Vec<Arc<MemoryConnection>> {
        self.connections.lock().clone()
    }

    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.is_closed())
            .count()
    }
}

#[async_trait]
impl Connector for MemoryServer {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Transport>> {
        let shared = &self.shared;
        shared.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let latency = *shared.connect_latency.lock();
        if !latency.is_zero() {
            time::sleep(latency).await;
        }

        let failing = shared
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BusError::connect("server unavailable"));
        }
        if !options.servers.iter().any(|s| s == &shared.url) {
            return Err(BusError::connect(format!(
                "no route to {:?}",
                options.servers
            )));
        }

        let requested: UserDescriptor = serde_json::from_str(&options.name)
            .map_err(|_| BusError::permission_denied("malformed connection name"))?;
        let account_id = requested.account_id;
        if account_id.is_empty()
            || options.user != id::account_user(&account_id)
            || options.inbox_prefix != id::inbox_prefix(&account_id)
        {
            return Err(BusError::permission_denied("authorization violation"));
        }

        let allowed = shared
            .grants
            .get(&account_id)
            .map(|g| g.clone())
            .unwrap_or_default();
        let granted: Vec<String> = requested
            .project_ids
            .into_iter()
            .filter(|p| allowed.contains(p))
            .collect();

        let conn = Arc::new(MemoryConnection::new(
            shared.clone(),
            options.clone(),
            account_id,
            granted,
        ));
        self.connections.lock().push(conn.clone());
        tracing::debug!(
            conn = %conn.id,
            account_id = %conn.account_id,
            projects = conn.granted.len(),
            "memory bus connection opened"
        );
        Ok(conn)
    }
}

/// One connection to a [`MemoryServer`].
pub struct MemoryConnection {
    id: String,
    server: Arc<ServerShared>,
    counters: Arc<ConnCounters>,
    options: ConnectOptions,
    account_id: String,
    granted: Vec<String>,
    permissions: Permissions,
    connected: AtomicBool,
    draining: AtomicBool,
    closed: watch::Sender<bool>,
    status_tx: broadcast::Sender<Status>,
    close_calls: AtomicUsize,
    drain_calls: AtomicUsize,
}

impl MemoryConnection {
    fn new(
        server: Arc<ServerShared>,
        options: ConnectOptions,
        account_id: String,
        granted: Vec<String>,
    ) -> Self {
        let account_subjects = format!("{}.{}.>", prefix::ACCOUNT, account_id);
        let mut publish: Vec<String> = granted.iter().map(|p| subject::project_grant(p)).collect();
        let mut subscribe = publish.clone();
        publish.push(account_subjects.clone());
        publish.push(prefix::SYS_USER_INFO.to_string());
        subscribe.push(account_subjects);
        subscribe.push(format!("{}.>", options.inbox_prefix));

        let (closed, _) = watch::channel(false);
        let (status_tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            id: id::prefixed_ulid(prefix::CONNECTION),
            server,
            counters: Arc::new(ConnCounters::new()),
            options,
            account_id,
            granted,
            permissions: Permissions {
                publish: SubjectPermission {
                    allow: publish,
                    deny: Vec::new(),
                },
                subscribe: SubjectPermission {
                    allow: subscribe,
                    deny: Vec::new(),
                },
            },
            connected: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            closed,
            status_tx,
            close_calls: AtomicUsize::new(0),
            drain_calls: AtomicUsize::new(0),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Projects this connection was actually authorised for.
    pub fn granted_projects(&self) -> &[String] {
        &self.granted
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn drain_calls(&self) -> usize {
        self.drain_calls.load(Ordering::SeqCst)
    }

    /// Drop the link without closing, as a network blip would.
    pub fn simulate_disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(Status::Disconnect(self.server.url.clone()));
    }

    fn emit(&self, status: Status) {
        // No receivers is fine.
        let _ = self.status_tx.send(status);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BusError::closed())
        } else {
            Ok(())
        }
    }

    fn publish_allowed(&self, subject: &str) -> bool {
        // Replies to any inbox are always allowed.
        subject.starts_with(prefix::INBOX)
            || self
                .permissions
                .publish
                .allow
                .iter()
                .any(|p| subject::matches(p, subject))
    }

    fn subscribe_allowed(&self, subject: &str) -> bool {
        self.permissions
            .subscribe
            .allow
            .iter()
            .any(|p| subject::matches(p, subject))
    }

    fn send(&self, msg: Message) -> Result<usize> {
        if msg.data.len() > MAX_PAYLOAD {
            return Err(BusError::invalid_argument("payload too large"));
        }
        self.counters.record_out(msg.data.len());
        Ok(self.server.deliver(&msg))
    }

    fn user_info_reply(&self, inbox: String) -> Result<Message> {
        let reply = UserInfoReply {
            data: UserInfo {
                user: self.options.user.clone(),
                account: self.account_id.clone(),
                permissions: self.permissions.clone(),
            },
        };
        let data = serde_json::to_vec(&reply)?;
        self.counters.record_in(data.len());
        Ok(Message::new(inbox, data))
    }

    fn inbox_route(&self, max: Option<usize>) -> (String, u64, mpsc::UnboundedReceiver<Message>) {
        let inbox = id::new_inbox(&self.options.inbox_prefix);
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.server.add_route(Route {
            subject: inbox.clone(),
            queue: None,
            tx,
            remaining: max,
            owner: self.counters.clone(),
            internal: true,
        });
        (inbox, sid, rx)
    }

    fn shutdown(&self) {
        self.server.remove_routes_of(&self.counters);
        self.connected.store(false, Ordering::SeqCst);
        self.draining.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
        self.emit(Status::Close);
        tracing::debug!(conn = %self.id, "memory bus connection closed");
    }
}

#[async_trait]
impl Transport for MemoryConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn publish(&self, subject: &str, data: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.publish_message(Message {
            subject: subject.to_string(),
            reply: options.reply,
            headers: options.headers,
            data,
        })
    }

    fn publish_message(&self, msg: Message) -> Result<()> {
        self.check(&msg.subject, false, true)?;
        self.send(msg)?;
        Ok(())
    }

    fn respond_message(&self, msg: &Message, data: Vec<u8>) -> Result<bool> {
        match &msg.reply {
            Some(reply) => {
                self.publish(reply, data, PublishOptions::default())?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn subscribe(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription> {
        self.check(subject, true, false)?;
        if self.is_draining() {
            return Err(BusError::new(ErrorCode::Closed, "connection draining"));
        }
        if options.max == Some(0) {
            return Err(BusError::invalid_argument("max must be positive"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let sid = self.server.add_route(Route {
            subject: subject.to_string(),
            queue: options.queue,
            tx,
            remaining: options.max,
            owner: self.counters.clone(),
            internal: false,
        });
        let control: Arc<dyn SubscriptionControl> = self.server.clone();
        Ok(Subscription::new(sid, subject, rx, control))
    }

    fn resub(&self, sub: &mut Subscription, subject: &str) -> Result<()> {
        self.check(subject, true, false)?;
        let mut route = self
            .server
            .routes
            .get_mut(&sub.sid())
            .ok_or_else(|| BusError::invalid_argument("unknown subscription"))?;
        if !Arc::ptr_eq(&route.owner, &self.counters) {
            return Err(BusError::invalid_argument("subscription belongs to another connection"));
        }
        route.subject = subject.to_string();
        drop(route);
        sub.set_subject(subject);
        Ok(())
    }

    fn check(&self, subject: &str, sub: bool, publish: bool) -> Result<()> {
        subject::validate(subject, sub && !publish)?;
        self.ensure_open()?;
        if publish && !self.publish_allowed(subject) {
            return Err(BusError::permission_denied(format!(
                "permissions violation for publish to {subject:?}"
            )));
        }
        if sub && !self.subscribe_allowed(subject) {
            return Err(BusError::permission_denied(format!(
                "permissions violation for subscription to {subject:?}"
            )));
        }
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        options: RequestOptions,
    ) -> Result<Message> {
        self.check(subject, false, true)?;
        if subject == prefix::SYS_USER_INFO {
            self.counters.record_out(data.len());
            return self.user_info_reply(id::new_inbox(&self.options.inbox_prefix));
        }

        let (inbox, sid, mut rx) = self.inbox_route(Some(1));
        let msg = Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers: options.headers,
            data,
        };
        if self.send(msg)? == 0 {
            self.server.remove_route(sid);
            return Err(BusError::no_responders(subject));
        }
        match time::timeout(options.timeout, rx.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(BusError::closed()),
            Err(_) => {
                self.server.remove_route(sid);
                Err(BusError::timeout(format!("request to {subject} timed out")))
            }
        }
    }

    async fn request_many(
        &self,
        subject: &str,
        data: Vec<u8>,
        options: RequestManyOptions,
    ) -> Result<Vec<Message>> {
        self.check(subject, false, true)?;
        let (inbox, sid, mut rx) = self.inbox_route(None);
        let msg = Message {
            subject: subject.to_string(),
            reply: Some(inbox),
            headers: None,
            data,
        };
        if self.send(msg)? == 0 {
            self.server.remove_route(sid);
            return Err(BusError::no_responders(subject));
        }

        let deadline = Instant::now() + options.max_wait;
        let mut replies = Vec::new();
        while let Ok(Some(reply)) = time::timeout_at(deadline, rx.recv()).await {
            replies.push(reply);
            if options.max_messages.is_some_and(|max| replies.len() >= max) {
                break;
            }
        }
        self.server.remove_route(sid);
        Ok(replies)
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn drain(&self) -> Result<()> {
        self.drain_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if self.draining.swap(true, Ordering::SeqCst) {
            return Err(BusError::new(ErrorCode::Closed, "connection already draining"));
        }
        // Give in-flight deliveries a turn before tearing down.
        tokio::task::yield_now().await;
        self.shutdown();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if !self.is_closed() {
            self.shutdown();
        }
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
        self.connected.load(Ordering::SeqCst) && !self.is_closed()
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(Status::Disconnect(self.server.url.clone()));
        }
    }

    fn get_server(&self) -> String {
        self.server.url.clone()
    }

    fn server_info(&self) -> Option<ServerInfo> {
        Some(self.server.info.lock().clone())
    }

    async fn rtt(&self) -> Result<Duration> {
        self.ensure_open()?;
        let start = Instant::now();
        tokio::task::yield_now().await;
        Ok(start.elapsed())
    }

    async fn reconnect(&self) -> Result<()> {
        self.ensure_open()?;
        let url = self.server.url.clone();
        self.emit(Status::Disconnect(url.clone()));
        self.emit(Status::Reconnecting);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(Status::Reconnect(url));
        Ok(())
    }

    fn status(&self) -> broadcast::Receiver<Status> {
        self.status_tx.subscribe()
    }

    fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    fn num_subscriptions(&self) -> usize {
        self.counters.sids.lock().len()
    }
}
