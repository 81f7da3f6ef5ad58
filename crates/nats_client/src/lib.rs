//! NATS implementation of the gateway's bus interface.

mod client;

pub use client::NatsClient;
