//! Client resilience layer for the assistant's terminal and mobile apps
//!
//! Keeps the client responsive when the backend is slow or unreachable:
//! - [`cache`]: two-tier TTL cache (memory plus a pluggable store)
//! - [`queue`]: durable offline queue replaying mutations in order
//! - [`sync`]: sync passes, connectivity tracking, conflict resolution
//! - [`transport`]: realtime channel with reconnection and correlated
//!   request/reply
//!
//! Storage and the wire are behind traits ([`store::KeyValueStore`],
//! [`transport::Connector`]) so the same core runs on every platform.

pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod queue;
pub mod store;
pub mod sync;
pub mod transport;


pub use cache::{CacheConfig, CacheManager};
pub use config::ClientConfig;
pub use error::{QueueError, TransportError};
pub use events::{EventBus, SubscriptionId};
pub use models::{ActionStatus, QueuedAction, SyncStatus, SyncableEntity, WireMessage};
pub use queue::{ActionHandler, OfflineQueue, QueueConfig};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use sync::{ConflictStrategy, ConnectivityProbe, SyncConfig, SyncEngine, SyncEvent};
pub use transport::{
    ConnectionEvent, ConnectionHandle, ConnectionState, Connector, RealtimeClient,
    TransportConfig, TransportEvent,
};
