//! CRM Realtime Entity Store
//!
//! Mirrors backend rows (leads, conversations, dispatch jobs, messages) in memory
//! and keeps the mirror consistent with the backend's change feed:
//! - Transport adapter with reconnect backoff and degraded signalling
//! - Version-ordered entity tables that tolerate duplicate and reordered events
//! - Per-channel snapshot/live synchronization with event buffering
//! - Memoized selectors notified once per batch
//! - Reference-counted lifecycle with a teardown grace window

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod cdc;
pub mod channel;
pub mod driver;
pub mod engine;
pub mod lifecycle;
pub mod memory;
pub mod phoenix;
pub mod selector;
pub mod selectors;
pub mod store;
pub mod table;
pub mod transport;

pub use cdc::{Normalizer, RawChange};
pub use channel::{ChannelStatus, Degradation, SyncState};
pub use engine::{Batch, EngineInput, SyncEngine};
pub use lifecycle::{ConsumerGuard, LifecycleState, SyncContext};
pub use memory::MemoryBackend;
pub use phoenix::SupabaseBackend;
pub use selector::{FnSelector, Selector, SelectorRegistry, SubscriptionHandle, Tracked};
pub use store::StoreSnapshot;
pub use table::{ApplyOutcome, EntityTable, TableView};
pub use transport::{Connection, RealtimeBackend, TransportAdapter, TransportEvent};
