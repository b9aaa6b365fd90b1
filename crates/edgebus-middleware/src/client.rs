//! The bus-client seam.
//!
//! The edge never speaks to a concrete message broker. It talks to a
//! [`Topic`] for publishing and a [`Subscription`] for consuming, and the
//! broker-specific client implements both.
//!
//! # Overview
//!
//! - [`Topic`] – accepts an [`Envelope`] and hands back a [`PublishResult`]
//!   that resolves once the broker has confirmed (or refused) the publish.
//! - [`Subscription`] – runs a receive loop, invoking a [`MessageHandler`]
//!   for every delivered [`Message`] from a pool of concurrent workers.
//! - [`Message`] – one delivered envelope plus its one-shot acknowledger.
//!   Acking yields an [`AckResult`] that resolves to an [`AckResponse`].
//! - [`MemorySubscription`][crate::memory::MemorySubscription] and
//!   [`MemoryTopic`][crate::memory::MemoryTopic] – the in-process client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edgebus_types::{AckOutcome, BusError, Envelope};
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Default number of handlers a subscription runs at once.
pub const DEFAULT_NUM_WORKERS: usize = 10;

/// Flow-control knobs a subscription exposes to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveSettings {
    /// Floor for each ack-deadline extension the client requests while a
    /// handler is still running.
    pub min_extension_period: Duration,
    /// Upper bound on concurrently running handlers.
    pub num_workers: usize,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            min_extension_period: Duration::ZERO,
            num_workers: DEFAULT_NUM_WORKERS,
        }
    }
}

/// Publishing half of a bus client.
pub trait Topic: Send + Sync {
    /// Topic name.
    fn id(&self) -> &str;

    /// Enqueue `envelope` for publishing.
    ///
    /// Must not block on network I/O; the outcome is delivered through the
    /// returned [`PublishResult`].
    fn publish(&self, envelope: Envelope) -> PublishResult;
}

/// Per-message callback driven by [`Subscription::receive`].
///
/// The token is the per-message context supplied by the bus client.
pub type MessageHandler =
    Arc<dyn Fn(CancellationToken, Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Consuming half of a bus client.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subscription name.
    fn id(&self) -> &str;

    fn receive_settings(&self) -> ReceiveSettings;

    /// Replace the settings used by the next call to [`receive`][Self::receive].
    fn set_receive_settings(&self, settings: ReceiveSettings);

    /// Run the receive loop until `ctx` is cancelled or the client fails.
    ///
    /// `handler` may be invoked concurrently for distinct messages.
    /// Implementations wait for in-flight handlers before returning.
    ///
    /// # Errors
    ///
    /// Returns the [`BusError`] that terminated the loop. Cancellation of
    /// `ctx` is a clean shutdown and yields `Ok(())`.
    async fn receive(&self, ctx: CancellationToken, handler: MessageHandler)
    -> Result<(), BusError>;
}

// ---------------------------------------------------------------------------
// Publish results
// ---------------------------------------------------------------------------

/// Future-like handle for the outcome of a single publish.
pub struct PublishResult {
    rx: oneshot::Receiver<Result<String, BusError>>,
}

/// Completes the paired [`PublishResult`].
pub struct PublishResolver {
    tx: oneshot::Sender<Result<String, BusError>>,
}

impl PublishResult {
    /// Create an unresolved result and the resolver that completes it.
    pub fn pending() -> (PublishResolver, PublishResult) {
        let (tx, rx) = oneshot::channel();
        (PublishResolver { tx }, PublishResult { rx })
    }

    /// Create an already-resolved result.
    pub fn ready(result: Result<String, BusError>) -> Self {
        let (resolver, result_handle) = Self::pending();
        resolver.resolve(result);
        result_handle
    }

    /// Wait for the broker's verdict.
    ///
    /// Returns the server-assigned message id. Yields
    /// [`BusError::Cancelled`] if `ctx` fires first and [`BusError::Closed`]
    /// if the resolver was dropped without answering.
    pub async fn get(self, ctx: &CancellationToken) -> Result<String, BusError> {
        tokio::select! {
            biased;
            res = self.rx => res.unwrap_or(Err(BusError::Closed)),
            _ = ctx.cancelled() => Err(BusError::Cancelled),
        }
    }
}

impl PublishResolver {
    pub fn resolve(self, result: Result<String, BusError>) {
        // The waiter may already be gone; nobody is left to tell.
        let _ = self.tx.send(result);
    }
}

impl fmt::Debug for PublishResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublishResult").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Ack results
// ---------------------------------------------------------------------------

/// What the broker said about an acknowledgement.
///
/// `error` and a non-success `outcome` are independent: a client may report
/// a retrieval error and still return an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckResponse {
    pub outcome: AckOutcome,
    pub error: Option<BusError>,
}

impl AckResponse {
    pub fn success() -> Self {
        Self::outcome(AckOutcome::Success)
    }

    pub fn outcome(outcome: AckOutcome) -> Self {
        Self {
            outcome,
            error: None,
        }
    }

    pub fn failed(outcome: AckOutcome, error: BusError) -> Self {
        Self {
            outcome,
            error: Some(error),
        }
    }
}

/// Future-like handle for the outcome of a single acknowledgement.
pub struct AckResult {
    rx: oneshot::Receiver<AckResponse>,
}

/// Completes the paired [`AckResult`].
pub struct AckResolver {
    tx: oneshot::Sender<AckResponse>,
}

impl AckResult {
    pub fn pending() -> (AckResolver, AckResult) {
        let (tx, rx) = oneshot::channel();
        (AckResolver { tx }, AckResult { rx })
    }

    pub fn ready(response: AckResponse) -> Self {
        let (resolver, result) = Self::pending();
        resolver.resolve(response);
        result
    }

    /// Wait for the ack outcome.
    ///
    /// A cancelled `ctx` yields `Other` with [`BusError::Cancelled`]; a
    /// dropped resolver yields `Other` with [`BusError::Closed`].
    pub async fn get(self, ctx: &CancellationToken) -> AckResponse {
        tokio::select! {
            biased;
            res = self.rx => {
                res.unwrap_or_else(|_| AckResponse::failed(AckOutcome::Other, BusError::Closed))
            }
            _ = ctx.cancelled() => AckResponse::failed(AckOutcome::Other, BusError::Cancelled),
        }
    }
}

impl AckResolver {
    pub fn resolve(self, response: AckResponse) {
        let _ = self.tx.send(response);
    }
}

// ---------------------------------------------------------------------------
// Delivered messages
// ---------------------------------------------------------------------------

/// Client-side acknowledger for one delivered message.
pub trait Acker: Send {
    /// Acknowledge the message with id `id`.
    fn ack_with_result(self: Box<Self>, id: &str) -> AckResult;
}

impl<F> Acker for F
where
    F: FnOnce(&str) -> AckResult + Send,
{
    fn ack_with_result(self: Box<Self>, id: &str) -> AckResult {
        (*self)(id)
    }
}

/// A delivered envelope that has not been acknowledged yet.
pub struct Message {
    envelope: Envelope,
    acker: Box<dyn Acker>,
}

impl Message {
    pub fn new(envelope: Envelope, acker: Box<dyn Acker>) -> Self {
        Self { envelope, acker }
    }

    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    /// Acknowledge the message.
    ///
    /// Consumes the message so it can be acked at most once, and hands the
    /// envelope back to the caller along with the pending outcome.
    pub fn ack_with_result(self) -> (Envelope, AckResult) {
        let result = self.acker.ack_with_result(&self.envelope.id);
        (self.envelope, result)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_result_resolves_with_server_id() {
        let ctx = CancellationToken::new();
        let result = PublishResult::ready(Ok("srv-1".to_string()));
        assert_eq!(result.get(&ctx).await, Ok("srv-1".to_string()));
    }

    #[tokio::test]
    async fn publish_result_reports_cancellation() {
        let ctx = CancellationToken::new();
        let (_resolver, result) = PublishResult::pending();
        ctx.cancel();
        assert_eq!(result.get(&ctx).await, Err(BusError::Cancelled));
    }

    #[tokio::test]
    async fn publish_result_prefers_answer_over_cancellation() {
        let ctx = CancellationToken::new();
        ctx.cancel();
        let result = PublishResult::ready(Err(BusError::Rejected("nack".to_string())));
        assert_eq!(
            result.get(&ctx).await,
            Err(BusError::Rejected("nack".to_string()))
        );
    }

    #[tokio::test]
    async fn dropped_publish_resolver_reads_as_closed() {
        let ctx = CancellationToken::new();
        let (resolver, result) = PublishResult::pending();
        drop(resolver);
        assert_eq!(result.get(&ctx).await, Err(BusError::Closed));
    }

    #[tokio::test]
    async fn ack_result_waits_for_resolver() {
        let ctx = CancellationToken::new();
        let (resolver, result) = AckResult::pending();
        let waiter = tokio::spawn(async move { result.get(&ctx).await });
        resolver.resolve(AckResponse::outcome(AckOutcome::PermissionDenied));
        let response = waiter.await.unwrap();
        assert_eq!(response.outcome, AckOutcome::PermissionDenied);
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn ack_result_cancelled_and_closed() {
        let ctx = CancellationToken::new();
        let (resolver, result) = AckResult::pending();
        drop(resolver);
        assert_eq!(
            result.get(&ctx).await,
            AckResponse::failed(AckOutcome::Other, BusError::Closed)
        );

        let (_resolver, result) = AckResult::pending();
        ctx.cancel();
        assert_eq!(
            result.get(&ctx).await,
            AckResponse::failed(AckOutcome::Other, BusError::Cancelled)
        );
    }

    #[tokio::test]
    async fn message_ack_hands_back_envelope() {
        let envelope = Envelope::new(b"payload".to_vec()).with_id("m1");
        let message = Message::new(
            envelope.clone(),
            Box::new(|id: &str| {
                assert_eq!(id, "m1");
                AckResult::ready(AckResponse::success())
            }),
        );
        assert_eq!(message.id(), "m1");

        let (returned, ack) = message.ack_with_result();
        assert_eq!(returned, envelope);
        let response = ack.get(&CancellationToken::new()).await;
        assert!(response.outcome.is_success());
    }

    #[test]
    fn receive_settings_defaults() {
        let settings = ReceiveSettings::default();
        assert_eq!(settings.min_extension_period, Duration::ZERO);
        assert_eq!(settings.num_workers, DEFAULT_NUM_WORKERS);
    }
}
