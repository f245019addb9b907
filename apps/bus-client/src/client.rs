//! Per-session entry point that owns the shared pieces and hands out the
//! one [`BusConnection`] for the session.

use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::{Config, Settings};
use crate::connection::BusConnection;
use crate::error::{BusError, Result};
use crate::factory::{ConnectionFactory, UserDescriptor};
use crate::permissions::PermissionsCache;
use crate::retry::RetryPolicy;
use crate::session::Session;
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::transport::Connector;

pub struct BusClient {
    session: Session,
    cache: Arc<PermissionsCache>,
    factory: Arc<ConnectionFactory>,
    settings: Settings,
    connection: OnceCell<BusConnection>,
}

impl BusClient {
    pub fn new(
        session: Session,
        cache: Arc<PermissionsCache>,
        factory: Arc<ConnectionFactory>,
        settings: Settings,
    ) -> Self {
        Self {
            session,
            cache,
            factory,
            settings,
            connection: OnceCell::new(),
        }
    }

    /// Build a client from configuration, loading the persisted permissions
    /// cache if a path is configured.
    pub async fn from_config(config: &Config, connector: Arc<dyn Connector>, session: Session) -> Self {
        let store: Arc<dyn KeyValueStore> = match &config.permissions_path {
            Some(dir) => Arc::new(FileStore::new(dir)),
            None => Arc::new(MemoryStore::new()),
        };
        let cache = Arc::new(PermissionsCache::load(store).await);
        let retry = RetryPolicy::fixed(config.settings.connect_retry_delay);
        let factory = Arc::new(ConnectionFactory::new(connector, &config.server_url, retry));
        Self::new(session, cache, factory, config.settings)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn cache(&self) -> &Arc<PermissionsCache> {
        &self.cache
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.factory
    }

    /// The connection, if `connect` has completed.
    pub fn connection(&self) -> Option<BusConnection> {
        self.connection.get().cloned()
    }

    /// Get the session's connection, opening it on first use. Concurrent
    /// callers share the same attempt.
    ///
    /// Waits for sign-in once if nobody is signed in yet.
    pub async fn connect(&self) -> Result<BusConnection> {
        self.connection
            .get_or_try_init(|| self.open())
            .await
            .cloned()
    }

    async fn open(&self) -> Result<BusConnection> {
        let account_id = match self.session.account_id() {
            Some(id) => id,
            None => {
                tracing::info!("waiting for sign-in before connecting");
                self.session.signed_in().await;
                self.session.account_id().ok_or_else(BusError::not_signed_in)?
            }
        };
        let user = UserDescriptor::new(account_id, self.cache.get());
        let conn = self.factory.get_new_conn(&user).await?;
        Ok(BusConnection::new(
            conn,
            user,
            self.cache.clone(),
            self.factory.clone(),
            self.settings,
        ))
    }

    /// Stop pending connect retries and close the connection.
    pub async fn shutdown(&self) -> Result<()> {
        self.factory.shutdown();
        match self.connection.get() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }
}
