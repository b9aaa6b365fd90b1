//! Error sinks: where an [`Edge`][crate::edge::Edge] sends every anomaly.
//!
//! A sink is any `Fn(EdgeError) + Send + Sync`. The edge calls it from many
//! tasks at once, so it must tolerate concurrent invocation.

use std::sync::Arc;

use edgebus_types::EdgeError;
use tokio::sync::mpsc;
use tracing::error;

/// Shared, type-erased error sink.
pub type ErrorSink = Arc<dyn Fn(EdgeError) + Send + Sync>;

/// Sink that logs every error at `error` level.
pub fn tracing_sink() -> impl Fn(EdgeError) + Send + Sync + Clone + 'static {
    |err: EdgeError| match err.message_id() {
        Some(id) => error!(message_id = %id, error = %err, "edge error"),
        None => error!(error = %err, "edge error"),
    }
}

/// Sink that forwards every error onto an unbounded channel.
///
/// Errors raised after the receiver is dropped are discarded.
pub fn channel_sink() -> (
    impl Fn(EdgeError) + Send + Sync + Clone + 'static,
    mpsc::UnboundedReceiver<EdgeError>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = move |err: EdgeError| {
        let _ = tx.send(err);
    };
    (sink, rx)
}
