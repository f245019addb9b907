use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bus_client::memory::MemoryServer;
use bus_client::transport::{PublishOptions, SubscribeOptions};
use bus_client::{BusClient, Config, Session};

/// Runs the client against an in-process bus: signs in as `ACCOUNT_ID`,
/// requests access to `PROJECT_IDS` and logs connection status until Ctrl-C.
#[tokio::main]
async fn main() {
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let account_id = required_var("ACCOUNT_ID");
    let project_ids: Vec<String> = std::env::var("PROJECT_IDS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let server = MemoryServer::new(&config.server_url);
    server.grant(&account_id, project_ids.iter().cloned());

    tracing::info!(
        server_url = %config.server_url,
        %account_id,
        projects = project_ids.len(),
        "bus-client configured"
    );

    let session = Session::signed_in_as(account_id);
    let client = BusClient::from_config(&config, Arc::new(server), session).await;
    let conn = match client.connect().await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::error!(%err, "could not connect");
            return;
        }
    };

    let status = conn.status_of_current_connection();
    tokio::spawn(async move {
        let mut status = Box::pin(status);
        while let Some(status) = status.next().await {
            tracing::info!(?status, "connection status");
        }
    });

    if let Err(err) = conn.add_project_permissions(project_ids.clone()).await {
        tracing::error!(%err, "permission upgrade failed");
    }

    let mut subs = Vec::new();
    for project_id in &project_ids {
        let subject = format!("project.{project_id}.hello");
        match conn.subscribe(&subject, SubscribeOptions::default()) {
            Ok(sub) => subs.push(sub),
            Err(err) => tracing::warn!(%err, %subject, "subscribe failed"),
        }
        if let Err(err) = conn.publish(&subject, b"hello".to_vec(), PublishOptions::default()) {
            tracing::warn!(%err, %subject, "publish failed");
        }
    }

    match conn.server_version() {
        Ok(version) => tracing::info!(%version, "server version"),
        Err(err) => tracing::warn!(%err, "unknown server version"),
    }
    tracing::info!(stats = ?conn.stats(), "bus-client running; press Ctrl-C to stop");

    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
    }
    drop(subs);
    if let Err(err) = client.shutdown().await {
        tracing::warn!(%err, "shutdown failed");
    }
    tracing::info!(stats = ?conn.stats(), "bus-client stopped");
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}
