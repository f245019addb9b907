//! The message-bus client boundary.
//!
//! Everything below this trait pair (wire protocol, sockets, server-side
//! routing) is a black box to the connection manager. [`crate::memory`]
//! provides an in-process implementation.

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::{BusError, Result};

/// A message as seen on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: None,
            data: data.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.data)?)
    }

    pub fn string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub reply: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group: each message goes to one member of the group.
    pub queue: Option<String>,
    /// Automatically unsubscribe after this many messages.
    pub max: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub timeout: Duration,
    pub headers: Option<BTreeMap<String, String>>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            headers: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestManyOptions {
    /// Stop after this many responses.
    pub max_messages: Option<usize>,
    /// Stop collecting after this long regardless.
    pub max_wait: Duration,
}

impl Default for RequestManyOptions {
    fn default() -> Self {
        Self {
            max_messages: None,
            max_wait: Duration::from_secs(10),
        }
    }
}

/// Connection status notifications, for UI presentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Status {
    Disconnect(String),
    Reconnect(String),
    Reconnecting,
    StaleConnection,
    Update,
    Error(String),
    Close,
}

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub in_bytes: u64,
    pub in_msgs: u64,
    pub out_bytes: u64,
    pub out_msgs: u64,
}

impl AddAssign for Stats {
    fn add_assign(&mut self, rhs: Self) {
        self.in_bytes += rhs.in_bytes;
        self.in_msgs += rhs.in_msgs;
        self.out_bytes += rhs.out_bytes;
        self.out_msgs += rhs.out_msgs;
    }
}

impl Add for Stats {
    type Output = Stats;

    fn add(mut self, rhs: Self) -> Stats {
        self += rhs;
        self
    }
}

/// What the server says about itself on connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub server_name: String,
    pub version: String,
    pub max_payload: usize,
}

/// Allow/deny lists for one direction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectPermission {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub publish: SubjectPermission,
    #[serde(default)]
    pub subscribe: SubjectPermission,
}

/// Reply body of a user-info request: the grants the server actually gave
/// this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub user: String,
    pub account: String,
    #[serde(default)]
    pub permissions: Permissions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoReply {
    pub data: UserInfo,
}

/// Protocol knobs handed to the transport unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningOptions {
    pub ping_interval: Duration,
    pub max_ping_out: u32,
    pub reconnect_time_wait: Duration,
    /// `None` reconnects forever.
    pub max_reconnect_attempts: Option<u32>,
    pub wait_on_first_connect: bool,
}

impl Default for TuningOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            max_ping_out: 3,
            reconnect_time_wait: Duration::from_secs(1),
            max_reconnect_attempts: None,
            wait_on_first_connect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    /// Stable JSON of the requesting user; the server derives grants from it.
    pub name: String,
    pub user: String,
    pub inbox_prefix: String,
    pub servers: Vec<String>,
    pub tuning: TuningOptions,
}

/// Opens transport connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn Transport>>;
}

/// One open connection to the bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    fn publish(&self, subject: &str, data: Vec<u8>, options: PublishOptions) -> Result<()>;
    fn publish_message(&self, msg: Message) -> Result<()>;
    /// Reply to `msg`. Returns false if it carried no reply subject.
    fn respond_message(&self, msg: &Message, data: Vec<u8>) -> Result<bool>;

    fn subscribe(&self, subject: &str, options: SubscribeOptions) -> Result<Subscription>;
    /// Point an existing subscription at a new subject.
    fn resub(&self, sub: &mut Subscription, subject: &str) -> Result<()>;
    /// Validate `subject` and check it against this connection's grants.
    fn check(&self, subject: &str, sub: bool, publish: bool) -> Result<()>;

    async fn request(&self, subject: &str, data: Vec<u8>, options: RequestOptions)
        -> Result<Message>;
    async fn request_many(
        &self,
        subject: &str,
        data: Vec<u8>,
        options: RequestManyOptions,
    ) -> Result<Vec<Message>>;

    async fn flush(&self) -> Result<()>;
    /// Stop accepting work, let subscriptions finish, then close.
    async fn drain(&self) -> Result<()>;
    /// Close immediately, discarding anything pending.
    async fn close(&self) -> Result<()>;
    /// Resolves once the connection is closed, with the error that closed it.
    async fn closed(&self) -> Option<BusError>;
    fn is_closed(&self) -> bool;
    fn is_draining(&self) -> bool;

    fn is_connected(&self) -> bool;
    /// Force the protocol state to "disconnected" so status watchers see the
    /// truth after a deliberate close.
    fn mark_disconnected(&self);

    fn get_server(&self) -> String;
    fn server_info(&self) -> Option<ServerInfo>;
    async fn rtt(&self) -> Result<Duration>;
    async fn reconnect(&self) -> Result<()>;

    fn status(&self) -> broadcast::Receiver<Status>;
    fn stats(&self) -> Stats;
    fn num_subscriptions(&self) -> usize;
}

/// Lets a [`Subscription`] release its server-side registration.
pub trait SubscriptionControl: Send + Sync {
    fn unsubscribe(&self, sid: u64);
}

/// An open subscription. Dropping it unsubscribes.
pub struct Subscription {
    sid: u64,
    subject: String,
    receiver: mpsc::UnboundedReceiver<Message>,
    control: Arc<dyn SubscriptionControl>,
    active: bool,
}

impl Subscription {
    pub fn new(
        sid: u64,
        subject: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Message>,
        control: Arc<dyn SubscriptionControl>,
    ) -> Self {
        Self {
            sid,
            subject: subject.into(),
            receiver,
            control,
            active: true,
        }
    }

    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn set_subject(&mut self, subject: &str) {
        self.subject = subject.to_string();
    }

    /// Next message, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }

    pub fn try_next(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.control.unsubscribe(self.sid);
        }
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_add_up() {
        let a = Stats {
            in_bytes: 10,
            in_msgs: 1,
            out_bytes: 20,
            out_msgs: 2,
        };
        let mut b = Stats {
            in_bytes: 1,
            in_msgs: 1,
            out_bytes: 2,
            out_msgs: 1,
        };
        b += a;
        assert_eq!(b.in_bytes, 11);
        assert_eq!((a + Stats::default()), a);
    }

    #[test]
    fn status_serializes_for_ui() {
        let json = serde_json::to_value(Status::Disconnect("ws://x".into())).unwrap();
        assert_eq!(json, serde_json::json!({"type": "disconnect", "data": "ws://x"}));
        let json = serde_json::to_value(Status::Close).unwrap();
        assert_eq!(json, serde_json::json!({"type": "close"}));
    }

    #[test]
    fn user_info_reply_tolerates_missing_lists() {
        let reply: UserInfoReply = serde_json::from_str(
            r#"{"data":{"user":"account-a","account":"a","permissions":{"publish":{"allow":["project.p.>"]}}}}"#,
        )
        .unwrap();
        assert_eq!(reply.data.permissions.publish.allow, vec!["project.p.>"]);
        assert!(reply.data.permissions.subscribe.allow.is_empty());
    }
}
