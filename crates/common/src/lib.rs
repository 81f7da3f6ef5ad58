//! Shared types for the resource gateway.
//!
//! This crate is the leaf every other crate builds on:
//! - Resource identifiers (`Rid`) and their parsing rules
//! - The value codec: primitives, resource references, delete markers,
//!   and the model/collection resource shapes
//! - The wire error taxonomy (`RError`, `system.*` codes)
//! - The abstract message-bus interface (`BusClient`) with an
//!   in-process implementation for tests (`MockBus`)

pub mod bus;
pub mod error;
pub mod rid;
pub mod value;

pub use error::RError;
pub use rid::Rid;
pub use value::{Collection, Model, Resource, ResourceType, Value};
