//! The long-lived connection facade.
//!
//! A [`BusConnection`] wraps whichever transport connection is currently
//! active and swaps it out underneath its callers: when the session needs
//! access to more projects (the server bakes grants in at connect time),
//! when it resumes from standby, and when it sheds load after hitting the
//! subscription ceiling. Anything bound to a specific transport connection
//! must be re-established on [`ConnectionEvent::Reconnect`].
//!
//! States:
//! - active: `conn` is open and serves every passthrough.
//! - standby: `conn` was closed on purpose; `resume` opens a new one.
//! - superseding: an upgrade swapped in a new `conn`; the old one sits in
//!   `prev`, still counted, until it is drained after the grace period.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bus_common::id::prefix;
use bus_common::{parse_semver, SemVer};
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use crate::config::Settings;
use crate::debounce::Debouncer;
use crate::error::{BusError, Result};
use crate::events::{ConnectionEvent, EventHub};
use crate::factory::{ConnectionFactory, UserDescriptor};
use crate::permissions::PermissionsCache;
use crate::subject;
use crate::transport::{
    Message, PublishOptions, RequestManyOptions, RequestOptions, ServerInfo, Stats, Status,
    SubscribeOptions, Subscription, Transport, UserInfoReply,
};

/// Traffic totals across every connection this facade has used, plus the
/// live subscription count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub in_bytes: u64,
    pub in_msgs: u64,
    pub out_bytes: u64,
    pub out_msgs: u64,
    pub num_subscriptions: usize,
}

struct State {
    conn: Arc<dyn Transport>,
    user: UserDescriptor,
    /// Superseded connections waiting for their grace-period drain.
    prev: Vec<Arc<dyn Transport>>,
    standby: bool,
    /// Multiplier on the subscription backoff. Only ever grows.
    subscription_penalty: f64,
    /// Stats of connections that are no longer active or in `prev`.
    retired_stats: Stats,
}

struct Inner {
    state: Mutex<State>,
    cache: Arc<PermissionsCache>,
    factory: Arc<ConnectionFactory>,
    settings: Settings,
    events: EventHub,
    /// Bumped on every swap of `conn`.
    generation: watch::Sender<u64>,
    debounce: Debouncer,
    /// Held while opening a replacement connection, so resume and upgrade
    /// never swap concurrently.
    reconnect_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct BusConnection {
    inner: Arc<Inner>,
}

impl BusConnection {
    /// Wrap an already-open connection made for `user`.
    ///
    /// Starts a background reconciliation that overwrites the permissions
    /// cache with what the server actually granted this connection.
    pub fn new(
        conn: Arc<dyn Transport>,
        user: UserDescriptor,
        cache: Arc<PermissionsCache>,
        factory: Arc<ConnectionFactory>,
        settings: Settings,
    ) -> Self {
        let user = UserDescriptor::new(user.account_id, user.project_ids);
        let (generation, _) = watch::channel(0);
        tracing::info!(
            conn = %conn.id(),
            account_id = %user.account_id,
            projects = user.project_ids.len(),
            "bus connection ready"
        );
        let this = Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    conn,
                    user,
                    prev: Vec::new(),
                    standby: false,
                    subscription_penalty: 1.0,
                    retired_stats: Stats::default(),
                }),
                cache,
                factory,
                settings,
                events: EventHub::new(),
                generation,
                debounce: Debouncer::new(settings.permission_debounce),
                reconnect_lock: tokio::sync::Mutex::new(()),
            }),
        };
        let reconcile = this.clone();
        tokio::spawn(async move { reconcile.update_cache().await });
        this
    }

    /// The connection currently serving requests. Do not hold on to it
    /// across a [`ConnectionEvent::Reconnect`].
    pub fn current(&self) -> Arc<dyn Transport> {
        self.inner.state.lock().conn.clone()
    }

    pub fn user(&self) -> UserDescriptor {
        self.inner.state.lock().user.clone()
    }

    pub fn is_standby(&self) -> bool {
        self.inner.state.lock().standby
    }

    pub fn subscription_penalty(&self) -> f64 {
        self.inner.state.lock().subscription_penalty
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Replace the cached permissions with what the server granted the
    /// current connection. Best effort.
    async fn update_cache(&self) {
        match self.get_project_permissions().await {
            Ok(ids) => {
                tracing::debug!(count = ids.len(), "reconciled permissions cache with server grants");
                self.inner.cache.set(ids).await;
            }
            Err(err) => tracing::debug!(%err, "could not read granted permissions"),
        }
    }

    /// Project ids the server has granted the current connection, read from
    /// its publish allow-list.
    pub async fn get_project_permissions(&self) -> Result<Vec<String>> {
        let reply = self
            .current()
            .request(prefix::SYS_USER_INFO, Vec::new(), RequestOptions::default())
            .await?;
        let info: UserInfoReply = reply.json()?;
        let ids: BTreeSet<String> = info
            .data
            .permissions
            .publish
            .allow
            .iter()
            .filter_map(|entry| subject::project_id_of(entry))
            .map(str::to_string)
            .collect();
        Ok(ids.into_iter().collect())
    }

    /// Close the socket without tearing down the facade. No-op when already
    /// in standby. Pending work on the connection is discarded.
    pub async fn standby(&self) {
        let conn = {
            let mut state = self.inner.state.lock();
            if state.standby {
                return;
            }
            state.standby = true;
            // Before the lock drops, so a racing resume() reconnects.
            state.conn.mark_disconnected();
            state.conn.clone()
        };
        tracing::info!(conn = %conn.id(), "entering standby");
        close_quietly(conn.as_ref()).await;
    }

    /// Leave standby by opening a new connection for the cached project set.
    /// No-op unless in standby, or if the transport is still connected.
    pub async fn resume(&self) -> Result<()> {
        let _guard = self.inner.reconnect_lock.lock().await;
        let account_id = {
            let mut state = self.inner.state.lock();
            if !state.standby {
                return Ok(());
            }
            state.standby = false;
            if state.conn.is_connected() {
                tracing::debug!(conn = %state.conn.id(), "resume: still connected");
                return Ok(());
            }
            state.user.account_id.clone()
        };

        let user = UserDescriptor::new(account_id, self.inner.cache.get());
        tracing::info!(
            account_id = %user.account_id,
            projects = user.project_ids.len(),
            "resuming from standby"
        );
        let conn = match self.inner.factory.get_new_conn(&user).await {
            Ok(conn) => conn,
            Err(err) => {
                self.inner.state.lock().standby = true;
                return Err(err);
            }
        };

        let replaced = {
            let mut state = self.inner.state.lock();
            if state.standby {
                None
            } else {
                let old = std::mem::replace(&mut state.conn, conn.clone());
                state.retired_stats += old.stats();
                state.user = user;
                Some(old)
            }
        };
        match replaced {
            Some(old) => {
                tracing::info!(old = %old.id(), conn = %conn.id(), "resumed");
                self.swapped();
            }
            None => {
                tracing::info!(conn = %conn.id(), "standby requested while resuming; closing new connection");
                close_quietly(conn.as_ref()).await;
            }
        }
        Ok(())
    }

    /// Subscriptions on the active connection plus every connection still
    /// waiting to drain.
    ///
    /// Reaching the configured ceiling puts the facade into standby and
    /// schedules a resume after a backoff that grows with every breach.
    pub fn num_subscriptions(&self) -> usize {
        let settings = &self.inner.settings;
        let (count, tripped) = {
            let mut state = self.inner.state.lock();
            let count = state.conn.num_subscriptions()
                + state.prev.iter().map(|c| c.num_subscriptions()).sum::<usize>();
            if count >= settings.max_subscriptions && !state.standby {
                state.standby = true;
                state.conn.mark_disconnected();
                state.subscription_penalty *= settings.subscription_penalty_factor;
                let delay = settings
                    .subscription_backoff
                    .mul_f64(state.subscription_penalty);
                (count, Some((state.conn.clone(), delay)))
            } else {
                (count, None)
            }
        };
        if let Some((conn, delay)) = tripped {
            self.shed_load(conn, count, delay);
        }
        count
    }

    fn shed_load(&self, conn: Arc<dyn Transport>, count: usize, delay: Duration) {
        tracing::warn!(
            subscriptions = count,
            max = self.inner.settings.max_subscriptions,
            resume_in_ms = delay.as_millis() as u64,
            "too many subscriptions; entering standby"
        );
        self.inner.events.emit(ConnectionEvent::SubscriptionLimit {
            subscriptions: count,
            resume_in_ms: delay.as_millis() as u64,
        });
        let this = self.clone();
        tokio::spawn(async move {
            close_quietly(conn.as_ref()).await;
            tokio::time::sleep(delay).await;
            if let Err(err) = this.resume().await {
                tracing::warn!(%err, "resume after subscription limit failed");
            }
        });
    }

    /// Ask for access to more projects.
    ///
    /// The ids are added to the permissions cache right away; opening the
    /// replacement connection is debounced so bursts of calls result in a
    /// single upgrade. Errors from the upgrade are returned to the caller.
    pub async fn add_project_permissions<I, S>(&self, project_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let project_ids: Vec<String> = project_ids.into_iter().map(Into::into).collect();
        for id in &project_ids {
            subject::validate_project_id(id)?;
        }
        self.inner.cache.add(project_ids).await;
        let this = self.clone();
        self.inner
            .debounce
            .call(move || async move { this.update_project_permissions().await })
            .await
    }

    async fn update_project_permissions(&self) -> Result<()> {
        let _guard = self.inner.reconnect_lock.lock().await;
        let wanted = self.inner.cache.get();
        let user = {
            let state = self.inner.state.lock();
            if state.user.covers(&wanted) {
                return Ok(());
            }
            if state.standby {
                // resume() reconnects with the cached set anyway.
                tracing::debug!("permission upgrade deferred until resume");
                return Ok(());
            }
            UserDescriptor::new(state.user.account_id.clone(), wanted)
        };

        tracing::info!(
            account_id = %user.account_id,
            projects = ?user.project_ids,
            "upgrading bus permissions"
        );
        let conn = self.inner.factory.connect_fresh(&user).await?;

        let replaced = {
            let mut state = self.inner.state.lock();
            if state.standby {
                None
            } else {
                let old = std::mem::replace(&mut state.conn, conn.clone());
                state.prev.push(old.clone());
                state.user = user;
                Some(old)
            }
        };
        let Some(old) = replaced else {
            tracing::info!(conn = %conn.id(), "standby requested during upgrade; closing new connection");
            close_quietly(conn.as_ref()).await;
            return Ok(());
        };
        tracing::info!(old = %old.id(), conn = %conn.id(), "switched to upgraded connection");
        self.swapped();
        self.schedule_drain(old);
        Ok(())
    }

    /// Drain `old` once the grace period is over, then forget it.
    fn schedule_drain(&self, old: Arc<dyn Transport>) {
        let grace = self.inner.settings.drain_grace;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            tracing::debug!(conn = %old.id(), "draining superseded connection");
            if let Err(err) = old.drain().await {
                tracing::warn!(conn = %old.id(), %err, "drain of superseded connection failed");
            }
            this.forget(old.as_ref());
        });
    }

    fn forget(&self, old: &dyn Transport) {
        let mut state = self.inner.state.lock();
        let before = state.prev.len();
        state.prev.retain(|c| c.id() != old.id());
        if state.prev.len() < before {
            state.retired_stats += old.stats();
        }
    }

    fn swapped(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
        self.inner.events.emit(ConnectionEvent::Reconnect);
    }

    /// Status receiver of the current connection only.
    pub fn status(&self) -> broadcast::Receiver<Status> {
        self.current().status()
    }

    /// Status changes of whichever connection is active, following every
    /// swap. Each item is also emitted as [`ConnectionEvent::Status`].
    pub fn status_of_current_connection(&self) -> impl Stream<Item = Status> + Send + 'static {
        struct Follow {
            conn: BusConnection,
            generation: watch::Receiver<u64>,
            rx: broadcast::Receiver<Status>,
        }

        let generation = self.inner.generation.subscribe();
        let rx = self.status();
        let follow = Follow {
            conn: self.clone(),
            generation,
            rx,
        };
        stream::unfold(follow, |mut f| async move {
            loop {
                tokio::select! {
                    changed = f.generation.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                        f.rx = f.conn.status();
                    }
                    status = f.rx.recv() => match status {
                        Ok(status) => {
                            f.conn.inner.events.emit(ConnectionEvent::Status {
                                status: status.clone(),
                            });
                            return Some((status, f));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "status stream lagged");
                        }
                        Err(RecvError::Closed) => {
                            if f.generation.changed().await.is_err() {
                                return None;
                            }
                            f.rx = f.conn.status();
                        }
                    },
                }
            }
        })
    }

    /// Totals over the active connection, connections waiting to drain and
    /// every connection used before them.
    pub fn stats(&self) -> ConnectionStats {
        let traffic = {
            let state = self.inner.state.lock();
            state
                .prev
                .iter()
                .fold(state.retired_stats + state.conn.stats(), |acc, c| acc + c.stats())
        };
        ConnectionStats {
            in_bytes: traffic.in_bytes,
            in_msgs: traffic.in_msgs,
            out_bytes: traffic.out_bytes,
            out_msgs: traffic.out_msgs,
            num_subscriptions: self.num_subscriptions(),
        }
    }

    pub fn server_version(&self) -> Result<SemVer> {
        let info = self.current().server_info().ok_or_else(BusError::closed)?;
        Ok(parse_semver(&info.version)?)
    }

    /// Close the active connection and every superseded one. The facade
    /// stays in standby afterwards.
    pub async fn close(&self) -> Result<()> {
        let (conn, prev) = {
            let mut state = self.inner.state.lock();
            state.standby = true;
            let prev = std::mem::take(&mut state.prev);
            for c in &prev {
                state.retired_stats += c.stats();
            }
            (state.conn.clone(), prev)
        };
        for old in prev {
            close_quietly(old.as_ref()).await;
        }
        tracing::info!(conn = %conn.id(), "closing bus connection");
        let result = conn.close().await;
        conn.mark_disconnected();
        result
    }

    pub fn publish(&self, subject: &str, data: Vec<u8>, options: PublishOptions) -> Result<()> {
        self.current().publish(subject, data, options)
    }

    pub fn publish_message(&self, msg: Message) -> Result<()> {
        self.current().publish_message(msg)
    }

    pub fn respond_message(&self, msg: &Message, data: Vec<u8>) -> Result<bool> {
        self.current().respond_message(msg, data)
    }

    pub fn subscribe(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription> {
        self.num_subscriptions();
        self.current().subscribe(subject, options)
    }

    pub async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        options: RequestOptions,
    ) -> Result<Message> {
        self.current().request(subject, data, options).await
    }

    pub async fn request_many(
        &self,
        subject: &str,
        data: Vec<u8>,
        options: RequestManyOptions,
    ) -> Result<Vec<Message>> {
        self.current().request_many(subject, data, options).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.current().flush().await
    }

    /// Drain the active connection.
    pub async fn drain(&self) -> Result<()> {
        self.current().drain().await
    }

    pub fn is_closed(&self) -> bool {
        self.current().is_closed()
    }

    pub fn is_draining(&self) -> bool {
        self.current().is_draining()
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_connected()
    }

    pub fn get_server(&self) -> String {
        self.current().get_server()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.current().server_info()
    }

    pub async fn rtt(&self) -> Result<Duration> {
        self.current().rtt().await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.current().reconnect().await
    }

    pub fn resub(&self, sub: &mut Subscription, subject: &str) -> Result<()> {
        self.current().resub(sub, subject)
    }

    pub fn check(&self, subject: &str, sub: bool, publish: bool) -> Result<()> {
        self.current().check(subject, sub, publish)
    }
}

/// Close without draining and make sure watchers see the connection as down.
async fn close_quietly(conn: &dyn Transport) {
    if let Err(err) = conn.close().await {
        tracing::debug!(conn = %conn.id(), %err, "close failed");
    }
    conn.mark_disconnected();
}
