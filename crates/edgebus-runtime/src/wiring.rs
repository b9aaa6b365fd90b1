//! Binds an [`Edge`] to named in-memory topics and subscriptions.

use std::sync::Arc;

use edgebus_middleware::{Edge, MemoryBus, Subscription};
use edgebus_types::{BoxError, EdgeError, Envelope};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EdgeConfig;

/// Build an edge over `bus` using the names and tunables in `config`.
///
/// The subscription is created (and attached to `config.topic`) if it does
/// not exist yet, and its worker count is set from `config.num_workers`.
pub fn open_memory_edge<T, F, G, S>(
    bus: &MemoryBus,
    config: &EdgeConfig,
    ctx: CancellationToken,
    to_envelope: F,
    from_envelope: G,
    error_sink: S,
) -> Edge<T>
where
    T: Send + 'static,
    F: Fn(T) -> Result<Envelope, BoxError> + Send + Sync + 'static,
    G: Fn(&Envelope) -> Result<T, BoxError> + Send + Sync + 'static,
    S: Fn(EdgeError) + Send + Sync + 'static,
{
    let topic = bus.topic(&config.topic);
    let subscription = bus.subscription(&config.subscription, &config.topic);

    let mut receive_settings = subscription.receive_settings();
    receive_settings.num_workers = config.num_workers.max(1);
    subscription.set_receive_settings(receive_settings);

    info!(
        topic = %config.topic,
        subscription = %config.subscription,
        num_workers = receive_settings.num_workers,
        "memory edge opened"
    );

    let subscription: Arc<dyn Subscription> = subscription;
    Edge::new(ctx, topic, subscription, to_envelope, from_envelope, error_sink)
        .with_settings(config.edge_settings())
}
