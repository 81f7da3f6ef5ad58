//! Process-wide resource cache.
//!
//! One cache instance serves every client connection. It deduplicates
//! backend work (one get/subscribe per resource view, one access request
//! per resource/token pair), applies resource events to its cached
//! state, fans events out to client subscriptions, and re-derives
//! per-query-view deltas when a service signals a query event.
//!
//! ## Architecture
//!
//! ```text
//! bus events: event.<name>.*        gateway connections
//!         ↓                               ↑ loaded / event callbacks
//! per-name pump task → cache task (serial job queue, owns all state)
//!         ↓ get/access/query requests
//! backend services
//! ```
//!
//! All entry state is touched only on the cache task; bus callbacks and
//! connection tasks communicate with it by enqueueing closures.

pub mod access;
mod cache;
pub mod codec;
pub mod diff;
mod entry;
mod query;
mod subscriber;

pub use access::Access;
pub use cache::{AccessCallback, Cache};
pub use subscriber::{LoadedResource, ResourceEvent, ResourceHandle, SubId, Subscriber};
