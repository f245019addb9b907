pub mod client;
pub mod config;
pub mod connection;
pub mod debounce;
pub mod error;
pub mod events;
pub mod factory;
pub mod memory;
pub mod permissions;
pub mod retry;
pub mod session;
pub mod store;
pub mod subject;
pub mod transport;

pub use client::BusClient;
pub use config::{Config, Settings};
pub use connection::{BusConnection, ConnectionStats};
pub use error::{BusError, ErrorCode, Result};
pub use events::ConnectionEvent;
pub use factory::{ConnectionFactory, UserDescriptor};
pub use permissions::PermissionsCache;
pub use session::Session;
pub use transport::{Connector, Message, Status, Transport};
