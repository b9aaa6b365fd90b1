//! [`Edge`] – typed boundary between a domain value stream and the bus.
//!
//! An edge owns one topic, one subscription and a pair of converters between
//! a domain type `T` and [`Envelope`]. It exposes exactly two operations:
//!
//! * [`Edge::send`] – convert a `T`, publish it, and return without waiting
//!   for the broker. The publish outcome is awaited on a spawned task.
//!
//! * [`Edge::receive_on`] – consume the subscription and push converted
//!   values onto a caller-owned [`mpsc::Sender`].
//!
//! Every anomaly on either path is reported to the error sink given at
//! construction; nothing is retried and nothing panics.
//!
//! # Per-message ordering
//!
//! | Step | On failure |
//! |---|---|
//! | 1. ack the message and await the outcome | retrieval error reported, outcome still classified |
//! | 2. classify the outcome | non-success reported, message dropped |
//! | 3. convert the envelope | conversion error reported, message dropped |
//! | 4. write to the delivery channel | closed channel reported |
//!
//! Acking before converting makes delivery at-most-once. A crash between ack
//! and channel write loses the message.

use std::sync::Arc;
use std::time::Duration;

use edgebus_types::{AckOutcome, BoxError, BusError, EdgeError, Envelope};
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::client::{AckResponse, Message, MessageHandler, Subscription, Topic};
use crate::sink::ErrorSink;

/// Minimum ack-deadline extension applied to the subscription on receive.
/// Handlers may block on a slow delivery-channel consumer.
pub const DEFAULT_MIN_EXTENSION_PERIOD: Duration = Duration::from_secs(20);

type ToEnvelope<T> = Arc<dyn Fn(T) -> Result<Envelope, BoxError> + Send + Sync>;
type FromEnvelope<T> = Arc<dyn Fn(&Envelope) -> Result<T, BoxError> + Send + Sync>;

/// Tunables for an [`Edge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeSettings {
    pub min_extension_period: Duration,
}

impl Default for EdgeSettings {
    fn default() -> Self {
        Self {
            min_extension_period: DEFAULT_MIN_EXTENSION_PERIOD,
        }
    }
}

/// Typed publish/consume adapter over one topic and one subscription.
///
/// Cloning an edge is cheap; clones share the same handles, converters and
/// sink.
pub struct Edge<T> {
    ctx: CancellationToken,
    topic: Arc<dyn Topic>,
    subscription: Arc<dyn Subscription>,
    to_envelope: ToEnvelope<T>,
    from_envelope: FromEnvelope<T>,
    error_sink: ErrorSink,
    settings: EdgeSettings,
}

impl<T> Clone for Edge<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            topic: Arc::clone(&self.topic),
            subscription: Arc::clone(&self.subscription),
            to_envelope: Arc::clone(&self.to_envelope),
            from_envelope: Arc::clone(&self.from_envelope),
            error_sink: Arc::clone(&self.error_sink),
            settings: self.settings,
        }
    }
}

impl<T: Send + 'static> Edge<T> {
    /// Build an edge.
    ///
    /// `ctx` is the long-lived context that bounds every publish-result
    /// wait started by [`send`][Self::send]; cancel it to abandon pending
    /// waits during shutdown.
    ///
    /// `error_sink` is invoked concurrently from publish-wait tasks and from
    /// every receive worker. It must be safe to call from several tasks at
    /// once, which the `Send + Sync` bound enforces.
    pub fn new<F, G, S>(
        ctx: CancellationToken,
        topic: Arc<dyn Topic>,
        subscription: Arc<dyn Subscription>,
        to_envelope: F,
        from_envelope: G,
        error_sink: S,
    ) -> Self
    where
        F: Fn(T) -> Result<Envelope, BoxError> + Send + Sync + 'static,
        G: Fn(&Envelope) -> Result<T, BoxError> + Send + Sync + 'static,
        S: Fn(EdgeError) + Send + Sync + 'static,
    {
        Self {
            ctx,
            topic,
            subscription,
            to_envelope: Arc::new(to_envelope),
            from_envelope: Arc::new(from_envelope),
            error_sink: Arc::new(error_sink),
            settings: EdgeSettings::default(),
        }
    }

    /// Replace the default [`EdgeSettings`].
    pub fn with_settings(mut self, settings: EdgeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> EdgeSettings {
        self.settings
    }

    /// Convert `payload` and publish it without waiting for the broker.
    ///
    /// A conversion failure is reported as [`EdgeError::ConvertTo`] and
    /// nothing is published. A publish failure is reported later, from a
    /// spawned task, as [`EdgeError::Publish`].
    ///
    /// Outside a Tokio runtime the publish result could not be awaited, so
    /// nothing is published and [`BusError::NoRuntime`] is reported as
    /// [`EdgeError::Publish`].
    pub fn send(&self, payload: T) {
        let envelope = match (self.to_envelope)(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                report(&self.error_sink, EdgeError::ConvertTo(e));
                return;
            }
        };
        let Ok(runtime) = Handle::try_current() else {
            report(&self.error_sink, EdgeError::Publish(BusError::NoRuntime));
            return;
        };

        let pending = self.topic.publish(envelope);
        debug!(topic = %self.topic.id(), "publish submitted");

        let ctx = self.ctx.clone();
        let sink = Arc::clone(&self.error_sink);
        let topic = self.topic.id().to_string();
        runtime.spawn(async move {
            match pending.get(&ctx).await {
                Ok(id) => trace!(topic = %topic, message_id = %id, "publish confirmed"),
                Err(e) => report(&sink, EdgeError::Publish(e)),
            }
        });
    }

    /// Consume the subscription, writing converted values to `tx`.
    ///
    /// Applies the configured minimum extension period to the subscription,
    /// then runs its receive loop until `ctx` is cancelled or the client
    /// fails. A terminal client error is reported once as
    /// [`EdgeError::Receive`].
    ///
    /// The edge never closes `tx`.
    pub async fn receive_on(&self, ctx: CancellationToken, tx: mpsc::Sender<T>) {
        let mut receive_settings = self.subscription.receive_settings();
        receive_settings.min_extension_period = self.settings.min_extension_period;
        self.subscription.set_receive_settings(receive_settings);

        let delivery = Arc::new(Delivery {
            from_envelope: Arc::clone(&self.from_envelope),
            error_sink: Arc::clone(&self.error_sink),
            tx,
        });
        let handler: MessageHandler =
            Arc::new(move |message_ctx: CancellationToken, message: Message| {
                let delivery = Arc::clone(&delivery);
                async move { delivery.handle(message_ctx, message).await }.boxed()
            });

        let subscription = self.subscription.id().to_string();
        info!(
            subscription = %subscription,
            min_extension_secs = self.settings.min_extension_period.as_secs(),
            "receive loop starting"
        );
        if let Err(e) = self.subscription.receive(ctx, handler).await {
            report(&self.error_sink, EdgeError::Receive(e));
        }
        info!(subscription = %subscription, "receive loop stopped");
    }
}

/// Per-receive state shared by every worker.
struct Delivery<T> {
    from_envelope: FromEnvelope<T>,
    error_sink: ErrorSink,
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> Delivery<T> {
    async fn handle(&self, ctx: CancellationToken, message: Message) {
        let (envelope, ack) = message.ack_with_result();
        let AckResponse { outcome, error } = ack.get(&ctx).await;
        if let Some(e) = error {
            report(&self.error_sink, EdgeError::AckResult(e));
        }

        if outcome != AckOutcome::Success {
            report(
                &self.error_sink,
                EdgeError::AckRejected {
                    id: envelope.id,
                    outcome,
                },
            );
            return;
        }

        let value = match (self.from_envelope)(&envelope) {
            Ok(value) => value,
            Err(e) => {
                report(&self.error_sink, EdgeError::Convert(e));
                return;
            }
        };
        let Envelope { id, .. } = envelope;

        if self.tx.send(value).await.is_err() {
            report(&self.error_sink, EdgeError::Deliver { id });
            return;
        }
        debug!(message_id = %id, "message delivered");
    }
}

fn report(sink: &ErrorSink, err: EdgeError) {
    warn!(error = %err, "edge error");
    sink(err);
}
