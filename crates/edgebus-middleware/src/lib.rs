//! `edgebus-middleware` – typed edge over a publish/subscribe bus.
//!
//! Moves domain values onto and off a message bus without caring what the
//! values mean; two caller-supplied converters are the only code that knows.
//!
//! # Modules
//!
//! - [`edge`] – the [`Edge`] adapter: fire-and-forget publishing and the
//!   ack-then-convert-then-deliver receive path.
//! - [`client`] – the [`Topic`] / [`Subscription`] seam a bus client
//!   implements, plus publish and ack result handles.
//! - [`memory`] – in-process bus client built on Tokio channels.
//! - [`sink`] – error sinks for the edge.
//! - [`codec`] – JSON converters.

pub mod client;
pub mod codec;
pub mod edge;
pub mod memory;
pub mod sink;

pub use client::{
    AckResponse, AckResult, Message, PublishResult, ReceiveSettings, Subscription, Topic,
};
pub use edge::{DEFAULT_MIN_EXTENSION_PERIOD, Edge, EdgeSettings};
pub use memory::{MemoryBus, MemorySubscription, MemoryTopic};
pub use sink::{ErrorSink, channel_sink, tracing_sink};
