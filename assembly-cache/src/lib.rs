//! # assembly-cache - Restriction-aware element cache with autoupdate
//!
//! Keeps the current state of every element (a JSON record identified by
//! `collection:id`), numbers every change batch with a change id and pushes
//! per-user restricted deltas to connected clients.
//!
//! ## Architecture
//!
//! ```text
//!  change_elements(batch)
//!          │
//!          ▼
//! ┌─────────────────┐  commit   ┌──────────────────────┐
//! │  ElementCache   │ ────────► │ CacheProvider        │
//! │  (schema check, │           │ (memory | RocksDB)   │
//! │   validation)   │           └──────────────────────┘
//! └───────┬─────────┘
//!         │ invalidate          ┌──────────────────────┐
//!         ├───────────────────► │ RestrictionEngine    │
//!         │ record              └──────────────────────┘
//!         ├───────────────────► HistorySink
//!         │ dispatch            ┌──────────────────────┐
//!         └───────────────────► │ AutoupdateDispatcher │ ──► sessions (WebSocket)
//!                               └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`element`] - Element ids, element data and change batches
//! - [`provider`] - Storage contract with in-memory and RocksDB backends
//! - [`cache`] - The element cache service
//! - [`restriction`] - Per-collection visibility strategies and result cache
//! - [`autoupdate`] - Per-session fan-out of committed batches
//! - [`history`] - Append-only change history
//! - [`auth`] - Token to user resolution for WebSocket sessions
//! - [`protocol`] - JSON frames of the WebSocket feed
//! - [`server`] - WebSocket autoupdate server
//! - [`client`] - WebSocket client that resumes from its last change id

pub mod element;
pub mod provider;
pub mod cache;
pub mod restriction;
pub mod autoupdate;
pub mod history;
pub mod auth;
pub mod protocol;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use element::{Element, ElementChange, ElementId, ElementIdError};
pub use provider::{
    CacheProvider, DataSince, MemoryCacheProvider, ProviderError, RocksCacheProvider, RocksConfig,
};
pub use cache::{CacheConfig, CacheError, CacheResult, ElementCache, Populate, PopulateError};
pub use restriction::{
    PermissionPredicate, Restrict, RestrictionEngine, RestrictionRegistry, RestrictionStats,
    RestrictionStrategy, UserId, ANONYMOUS_USER,
};
pub use autoupdate::{
    AutoupdateDispatcher, AutoupdateMessage, ChannelTransport, DispatchStats, SendError,
    SessionTransport,
};
pub use history::{HistoryBatch, HistoryEntry, HistoryError, HistorySink, HistoryStore};
pub use auth::{AuthError, Authenticate};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use server::{AutoupdateServer, ServerConfig, ServerError, ServerStats};
pub use client::{AutoupdateClient, ClientError, ClientEvent, ConnectionState};
