//! In-process bus client built on Tokio channels.
//!
//! [`MemoryBus`] stands in for a managed broker in tests and local runs. It
//! speaks the same [`Topic`] / [`Subscription`] seam as a real client, so an
//! [`Edge`][crate::edge::Edge] wired to it behaves exactly as it would in
//! production, minus the network.
//!
//! Each subscription owns an unbounded queue. Publishing to a topic copies
//! the envelope into the queue of every subscription attached to that topic;
//! a topic with no subscriptions silently drops what it receives.
//!
//! Acks succeed unless scripted otherwise with
//! [`MemorySubscription::script_ack`]. Publish failures and terminal receive
//! failures can be injected with [`MemoryTopic::fail_publishes`] and
//! [`MemorySubscription::fail_receive`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use edgebus_types::{BusError, Envelope};
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::client::{
    AckResponse, AckResult, Message, MessageHandler, PublishResult, ReceiveSettings, Subscription,
    Topic,
};

#[derive(Default)]
struct Registry {
    topics: HashMap<String, Arc<MemoryTopic>>,
    subscriptions: HashMap<String, Arc<MemorySubscription>>,
    // topic name -> attached subscriptions
    routes: HashMap<String, Vec<Arc<MemorySubscription>>>,
}

/// Shared in-memory broker. Clone it cheaply – all clones share the same
/// topics and subscriptions.
#[derive(Clone, Default)]
pub struct MemoryBus {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the topic called `name`, creating it on first use.
    pub fn topic(&self, name: &str) -> Arc<MemoryTopic> {
        let mut registry = self.registry.lock();
        let topic = registry.topics.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryTopic {
                name: name.to_string(),
                registry: Arc::downgrade(&self.registry),
                fault: Mutex::new(None),
                publish_count: AtomicUsize::new(0),
            })
        });
        Arc::clone(topic)
    }

    /// Return the subscription called `name`, creating it and attaching it to
    /// `topic` on first use.
    ///
    /// An existing subscription keeps its original topic.
    pub fn subscription(&self, name: &str, topic: &str) -> Arc<MemorySubscription> {
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.subscriptions.get(name) {
            return Arc::clone(existing);
        }
        let subscription = Arc::new(MemorySubscription::new(name));
        registry
            .subscriptions
            .insert(name.to_string(), Arc::clone(&subscription));
        registry
            .routes
            .entry(topic.to_string())
            .or_default()
            .push(Arc::clone(&subscription));
        debug!(subscription = %name, topic = %topic, "memory subscription attached");
        subscription
    }
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// Publishing handle for one in-memory topic.
pub struct MemoryTopic {
    name: String,
    // Weak: the registry owns the topic.
    registry: Weak<Mutex<Registry>>,
    fault: Mutex<Option<BusError>>,
    publish_count: AtomicUsize,
}

impl MemoryTopic {
    /// Make every following publish fail with `fault`, or clear the fault
    /// with `None`.
    pub fn fail_publishes(&self, fault: Option<BusError>) {
        *self.fault.lock() = fault;
    }

    /// Number of publish attempts seen so far, failed ones included.
    pub fn publish_count(&self) -> usize {
        self.publish_count.load(Ordering::SeqCst)
    }

    /// Copy `envelope` into every subscription attached to this topic.
    /// Returns the number of subscriptions reached.
    fn fan_out(&self, envelope: &Envelope) -> usize {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let targets = registry
            .lock()
            .routes
            .get(&self.name)
            .cloned()
            .unwrap_or_default();
        for subscription in &targets {
            subscription.deliver(envelope.clone());
        }
        targets.len()
    }
}

impl Topic for MemoryTopic {
    fn id(&self) -> &str {
        &self.name
    }

    fn publish(&self, mut envelope: Envelope) -> PublishResult {
        self.publish_count.fetch_add(1, Ordering::SeqCst);

        let fault = self.fault.lock().clone();
        if let Some(err) = fault {
            warn!(topic = %self.name, error = %err, "memory publish failed");
            return PublishResult::ready(Err(err));
        }

        envelope.id = Uuid::new_v4().to_string();
        envelope.publish_time = Some(Utc::now());
        let reached = self.fan_out(&envelope);
        trace!(topic = %self.name, message_id = %envelope.id, reached, "memory publish");
        PublishResult::ready(Ok(envelope.id))
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Consuming handle for one in-memory subscription.
pub struct MemorySubscription {
    name: String,
    inbox: mpsc::UnboundedSender<Envelope>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    settings: Mutex<ReceiveSettings>,
    ack_script: Arc<Mutex<HashMap<String, AckResponse>>>,
    acked: Arc<Mutex<Vec<String>>>,
    fault: Mutex<Option<BusError>>,
    fault_raised: Notify,
}

impl MemorySubscription {
    fn new(name: &str) -> Self {
        let (inbox, queue) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            inbox,
            queue: tokio::sync::Mutex::new(queue),
            settings: Mutex::new(ReceiveSettings::default()),
            ack_script: Arc::new(Mutex::new(HashMap::new())),
            acked: Arc::new(Mutex::new(Vec::new())),
            fault: Mutex::new(None),
            fault_raised: Notify::new(),
        }
    }

    /// Enqueue `envelope` directly, bypassing any topic.
    pub fn deliver(&self, envelope: Envelope) {
        // The subscription owns both ends of its queue, so this cannot fail
        // while `self` is alive.
        let _ = self.inbox.send(envelope);
    }

    /// Answer the next ack of message `id` with `response` instead of
    /// success.
    pub fn script_ack(&self, id: &str, response: AckResponse) {
        self.ack_script.lock().insert(id.to_string(), response);
    }

    /// Ids acked so far, in ack order.
    pub fn acked_ids(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    /// Terminate the active receive loop (and any later one) with `err`.
    pub fn fail_receive(&self, err: BusError) {
        *self.fault.lock() = Some(err);
        self.fault_raised.notify_one();
    }

    fn current_fault(&self) -> Option<BusError> {
        self.fault.lock().clone()
    }

    fn wrap(&self, envelope: Envelope) -> Message {
        let script = Arc::clone(&self.ack_script);
        let acked = Arc::clone(&self.acked);
        Message::new(
            envelope,
            Box::new(move |id: &str| {
                let response = script.lock().remove(id).unwrap_or_else(AckResponse::success);
                acked.lock().push(id.to_string());
                trace!(message_id = %id, outcome = %response.outcome, "memory ack");
                AckResult::ready(response)
            }),
        )
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    fn id(&self) -> &str {
        &self.name
    }

    fn receive_settings(&self) -> ReceiveSettings {
        *self.settings.lock()
    }

    fn set_receive_settings(&self, settings: ReceiveSettings) {
        *self.settings.lock() = settings;
    }

    async fn receive(
        &self,
        ctx: CancellationToken,
        handler: MessageHandler,
    ) -> Result<(), BusError> {
        let mut queue = self
            .queue
            .try_lock()
            .map_err(|_| BusError::AlreadyReceiving)?;

        let settings = self.receive_settings();
        let workers = Arc::new(Semaphore::new(settings.num_workers.max(1)));
        let mut in_flight = JoinSet::new();

        info!(
            subscription = %self.name,
            num_workers = settings.num_workers,
            min_extension_secs = settings.min_extension_period.as_secs(),
            "memory receive loop started"
        );

        let exit = loop {
            if let Some(err) = self.current_fault() {
                break Err(err);
            }

            let permit = tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                _ = self.fault_raised.notified() => continue,
                permit = Arc::clone(&workers).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Err(BusError::Closed),
                },
            };

            let envelope = tokio::select! {
                _ = ctx.cancelled() => break Ok(()),
                _ = self.fault_raised.notified() => continue,
                next = queue.recv() => match next {
                    Some(envelope) => envelope,
                    None => break Err(BusError::Closed),
                },
            };

            let message = self.wrap(envelope);
            let handler = Arc::clone(&handler);
            let message_ctx = ctx.child_token();
            in_flight.spawn(async move {
                handler(message_ctx, message).await;
                drop(permit);
            });

            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    warn!(subscription = %self.name, error = %e, "message handler aborted");
                }
            }
        };

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(subscription = %self.name, error = %e, "message handler aborted");
            }
        }

        info!(subscription = %self.name, clean = exit.is_ok(), "memory receive loop stopped");
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgebus_types::AckOutcome;
    use futures_util::FutureExt;
    use std::time::Duration;

    /// Handler that acks every message and forwards `(id, outcome)`.
    fn forwarding_handler(tx: mpsc::UnboundedSender<(String, AckOutcome)>) -> MessageHandler {
        Arc::new(move |ctx: CancellationToken, message: Message| {
            let tx = tx.clone();
            async move {
                let (envelope, ack) = message.ack_with_result();
                let response = ack.get(&ctx).await;
                let _ = tx.send((envelope.id, response.outcome));
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn topic_fans_out_to_attached_subscriptions() {
        let bus = MemoryBus::new();
        let topic = bus.topic("readings");
        let first = bus.subscription("first", "readings");
        let second = bus.subscription("second", "readings");
        let _other = bus.subscription("other", "alerts");

        let ctx = CancellationToken::new();
        let id = topic
            .publish(Envelope::new(b"x".to_vec()))
            .get(&ctx)
            .await
            .unwrap();
        assert!(!id.is_empty());
        assert_eq!(topic.publish_count(), 1);

        for subscription in [first, second] {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run_ctx = CancellationToken::new();
            let receiver = {
                let subscription = Arc::clone(&subscription);
                let run_ctx = run_ctx.clone();
                tokio::spawn(
                    async move { subscription.receive(run_ctx, forwarding_handler(tx)).await },
                )
            };
            let (got_id, outcome) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got_id, id);
            assert_eq!(outcome, AckOutcome::Success);
            run_ctx.cancel();
            assert_eq!(receiver.await.unwrap(), Ok(()));
        }
    }

    #[test]
    fn registry_returns_same_handles() {
        let bus = MemoryBus::new();
        let a = bus.topic("t");
        let b = bus.topic("t");
        assert!(Arc::ptr_eq(&a, &b));

        let s1 = bus.subscription("s", "t");
        let s2 = bus.subscription("s", "other");
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[tokio::test]
    async fn injected_publish_fault_is_returned() {
        let bus = MemoryBus::new();
        let topic = bus.topic("t");
        topic.fail_publishes(Some(BusError::Rejected("nack".to_string())));

        let ctx = CancellationToken::new();
        let result = topic.publish(Envelope::new(b"x".to_vec())).get(&ctx).await;
        assert_eq!(result, Err(BusError::Rejected("nack".to_string())));
        assert_eq!(topic.publish_count(), 1);

        topic.fail_publishes(None);
        assert!(topic.publish(Envelope::new(b"y".to_vec())).get(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn scripted_ack_and_acked_ids() {
        let bus = MemoryBus::new();
        let subscription = bus.subscription("s", "t");
        subscription.script_ack("m2", AckResponse::outcome(AckOutcome::PermissionDenied));
        subscription.deliver(Envelope::new(b"1".to_vec()).with_id("m1"));
        subscription.deliver(Envelope::new(b"2".to_vec()).with_id("m2"));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();
        let receiver = {
            let subscription = Arc::clone(&subscription);
            let ctx = ctx.clone();
            tokio::spawn(async move { subscription.receive(ctx, forwarding_handler(tx)).await })
        };

        let mut outcomes = HashMap::new();
        for _ in 0..2 {
            let (id, outcome) = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            outcomes.insert(id, outcome);
        }
        assert_eq!(outcomes["m1"], AckOutcome::Success);
        assert_eq!(outcomes["m2"], AckOutcome::PermissionDenied);

        ctx.cancel();
        receiver.await.unwrap().unwrap();

        let mut acked = subscription.acked_ids();
        acked.sort();
        assert_eq!(acked, vec!["m1".to_string(), "m2".to_string()]);
    }

    #[tokio::test]
    async fn fail_receive_terminates_loop_with_error() {
        let bus = MemoryBus::new();
        let subscription = bus.subscription("s", "t");
        let (tx, _rx) = mpsc::unbounded_channel();

        let receiver = {
            let subscription = Arc::clone(&subscription);
            tokio::spawn(async move {
                subscription
                    .receive(CancellationToken::new(), forwarding_handler(tx))
                    .await
            })
        };
        tokio::task::yield_now().await;
        subscription.fail_receive(BusError::Transport("stream reset".to_string()));

        let exit = tokio::time::timeout(Duration::from_secs(1), receiver)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, Err(BusError::Transport("stream reset".to_string())));
    }

    #[tokio::test]
    async fn concurrent_receive_is_refused() {
        let bus = MemoryBus::new();
        let subscription = bus.subscription("s", "t");
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = CancellationToken::new();

        let first = {
            let subscription = Arc::clone(&subscription);
            let ctx = ctx.clone();
            let handler = forwarding_handler(tx.clone());
            tokio::spawn(async move { subscription.receive(ctx, handler).await })
        };
        // Let the first loop take the queue.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = subscription.receive(ctx.clone(), forwarding_handler(tx)).await;
        assert_eq!(second, Err(BusError::AlreadyReceiving));

        ctx.cancel();
        assert_eq!(first.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn in_flight_handlers_finish_before_receive_returns() {
        let bus = MemoryBus::new();
        let subscription = bus.subscription("s", "t");
        subscription.deliver(Envelope::new(b"slow".to_vec()).with_id("slow"));

        let finished = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<()>();
        let handler: MessageHandler = {
            let finished = Arc::clone(&finished);
            Arc::new(move |_ctx: CancellationToken, _message: Message| {
                let finished = Arc::clone(&finished);
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                }
                .boxed()
            })
        };

        let ctx = CancellationToken::new();
        let receiver = {
            let subscription = Arc::clone(&subscription);
            let ctx = ctx.clone();
            tokio::spawn(async move { subscription.receive(ctx, handler).await })
        };
        started_rx.recv().await.unwrap();
        ctx.cancel();
        receiver.await.unwrap().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
