//! Opens authenticated bus connections for a user and a fixed project set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use bus_common::{account_user, inbox_prefix, parse_semver, SemVer};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{BusError, Result};
use crate::retry::RetryPolicy;
use crate::transport::{ConnectOptions, Connector, Transport, TuningOptions};

/// Oldest server release the client is tested against.
pub const MIN_SERVER_VERSION: SemVer = SemVer::new(2, 10, 0);

/// Who is connecting and which projects they want access to. The server
/// derives the connection's grants from this, so it is fixed per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserDescriptor {
    pub account_id: String,
    pub project_ids: Vec<String>,
}

impl UserDescriptor {
    /// Project ids are deduplicated and sorted.
    pub fn new<I, S>(account_id: impl Into<String>, project_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let project_ids: BTreeSet<String> = project_ids.into_iter().map(Into::into).collect();
        Self {
            account_id: account_id.into(),
            project_ids: project_ids.into_iter().collect(),
        }
    }

    /// JSON with sorted keys, identical for equal descriptors.
    pub fn stable_json(&self) -> String {
        // serde_json's default map is a BTreeMap, so going through `Value`
        // sorts the keys.
        serde_json::to_value(self)
            .map(|v| v.to_string())
            .unwrap_or_default()
    }

    /// True if every id in `ids` is already part of this descriptor.
    pub fn covers(&self, ids: &[String]) -> bool {
        ids.iter().all(|id| self.project_ids.binary_search(id).is_ok())
    }
}

type PendingConn = Shared<BoxFuture<'static, Result<Arc<dyn Transport>>>>;

pub struct ConnectionFactory {
    connector: Arc<dyn Connector>,
    server_url: String,
    retry: RetryPolicy,
    in_flight: Arc<Mutex<HashMap<String, PendingConn>>>,
}

impl ConnectionFactory {
    pub fn new(connector: Arc<dyn Connector>, server_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            connector,
            server_url: server_url.into(),
            retry,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Stop every pending and future retry loop.
    pub fn shutdown(&self) {
        self.retry.cancel_token().cancel();
    }

    /// Options for a connection on behalf of `user`.
    pub fn connect_options(&self, user: &UserDescriptor) -> Result<ConnectOptions> {
        if user.account_id.is_empty() {
            return Err(BusError::not_signed_in());
        }
        Ok(ConnectOptions {
            name: user.stable_json(),
            user: account_user(&user.account_id),
            inbox_prefix: inbox_prefix(&user.account_id),
            servers: vec![self.server_url.clone()],
            tuning: TuningOptions::default(),
        })
    }

    /// Open a connection for `user`, retrying until it succeeds. Concurrent
    /// calls for the same user share a single attempt.
    pub async fn get_new_conn(&self, user: &UserDescriptor) -> Result<Arc<dyn Transport>> {
        let options = self.connect_options(user)?;
        let key = options.name.clone();
        let pending = {
            let mut in_flight = self.in_flight.lock();
            match in_flight.get(&key) {
                Some(pending) => {
                    tracing::debug!(account_id = %user.account_id, "joining in-flight connect");
                    pending.clone()
                }
                None => {
                    let in_flight_map = self.in_flight.clone();
                    let attempt = self.open(options);
                    let cleanup_key = key.clone();
                    let pending = async move {
                        let result = attempt.await;
                        in_flight_map.lock().remove(&cleanup_key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, pending.clone());
                    pending
                }
            }
        };
        pending.await
    }

    /// Always open a brand-new connection, bypassing the in-flight map. Used
    /// when upgrading permissions, where sharing an attempt made for an
    /// older project set would be wrong.
    pub async fn connect_fresh(&self, user: &UserDescriptor) -> Result<Arc<dyn Transport>> {
        let options = self.connect_options(user)?;
        self.open(options).await
    }

    fn open(&self, options: ConnectOptions) -> BoxFuture<'static, Result<Arc<dyn Transport>>> {
        let connector = self.connector.clone();
        let retry = self.retry.clone();
        async move {
            tracing::info!(
                user = %options.user,
                servers = ?options.servers,
                "connecting to message bus"
            );
            let conn = retry
                .run("bus connect", || connector.connect(&options))
                .await?;
            check_server_version(conn.as_ref());
            tracing::info!(conn = %conn.id(), user = %options.user, "connected to message bus");
            Ok(conn)
        }
        .boxed()
    }
}

fn check_server_version(conn: &dyn Transport) {
    let Some(info) = conn.server_info() else {
        return;
    };
    match parse_semver(&info.version) {
        Ok(version) if version < MIN_SERVER_VERSION => {
            tracing::warn!(%version, min = %MIN_SERVER_VERSION, "server is older than supported");
        }
        Ok(version) => tracing::debug!(%version, "server version"),
        Err(err) => tracing::warn!(%err, "unrecognised server version"),
    }
}
