//! Relaydesk sync client
//!
//! Keeps an operator console's view of every conversation consistent with
//! the relay hub: live events are merged into a local store, local actions
//! are applied optimistically and queued across disconnects, and each
//! reconnect reloads authoritative state from the chat API.

pub mod catalog;
pub mod config;
pub mod error;
pub mod lease;
pub mod logging;
pub mod manager;
pub mod queue;
pub mod reconnect;
pub mod snapshot;
pub mod store;
pub mod subscribers;
pub mod transport;

pub use catalog::{Catalog, HttpCatalog};
pub use config::{ConfigError, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use manager::SyncManager;
pub use reconnect::ReconnectPolicy;
pub use snapshot::{SyncSnapshot, SyncStatus};
pub use subscribers::Subscription;
pub use transport::{Connector, Link, WsConnector};
