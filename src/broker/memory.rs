use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::sync::Notify;
use tracing::debug;

use super::{
    Acker, BrokerError, BrokerHealth, Delivery, MessageBroker, PublishError, QueueSubscription,
    topology,
};
use crate::events::envelope::Envelope;
use crate::events::routing::BindingPattern;
use rabbitmq::Topology;

/// In-process broker with AMQP topic semantics.
///
/// Used by tests and local runs: pattern bindings, manual ack, redelivery of
/// unsettled messages and per-queue dead-letter capture all behave as the
/// real broker does, without a network. `restart` simulates a broker restart
/// returning unacked deliveries to their queues; `set_reachable(false)`
/// simulates a network partition.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    reachable: AtomicBool,
    next_tag: AtomicU64,
    routes: Mutex<Routes>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
}

#[derive(Default)]
struct Routes {
    /// Declared exchange -> (queue name, binding pattern)
    exchanges: HashMap<String, Vec<(String, BindingPattern)>>,
}

struct QueueState {
    name: String,
    notify: Notify,
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    dead: Vec<StoredMessage>,
    subscribers: usize,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let broker = Self::default();
        broker.inner.reachable.store(true, Ordering::SeqCst);
        broker
    }

    /// Declares exchanges, queues and bindings. Idempotent, as on the real
    /// broker.
    pub fn declare_topology(&self, topology: &Topology) {
        let mut routes = self.inner.routes.lock();
        for exchange in &topology.exchanges {
            routes.exchanges.entry(exchange.name.clone()).or_default();
        }
        let mut queues = self.inner.queues.lock();
        for queue in &topology.queues {
            queues
                .entry(queue.name.clone())
                .or_insert_with(|| Arc::new(QueueState::new(&queue.name)));
            for binding in &queue.bindings {
                let bindings = routes.exchanges.entry(binding.exchange.clone()).or_default();
                let already = bindings.iter().any(|(name, pattern)| {
                    name == &queue.name && pattern.as_str() == binding.routing_key
                });
                if !already {
                    bindings.push((
                        queue.name.clone(),
                        BindingPattern::new(&binding.routing_key),
                    ));
                }
            }
        }
    }

    /// Delivers raw bytes under a routing key, bypassing envelope encoding.
    /// Lets tests inject malformed bodies the way a foreign producer could.
    pub fn publish_raw(&self, routing_key: &str, body: Vec<u8>) -> Result<(), PublishError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("broker marked unreachable".into()));
        }
        let exchange = topology::exchange_for(routing_key)
            .ok_or_else(|| PublishError::UnknownExchange(routing_key.to_owned()))?;
        self.route(exchange, routing_key, body)
    }

    fn route(&self, exchange: &str, routing_key: &str, body: Vec<u8>) -> Result<(), PublishError> {
        let targets: Vec<String> = {
            let routes = self.inner.routes.lock();
            let bindings = routes
                .exchanges
                .get(exchange)
                .ok_or_else(|| PublishError::UnknownExchange(exchange.to_owned()))?;
            bindings
                .iter()
                .filter(|(_, pattern)| pattern.matches(routing_key))
                .map(|(queue, _)| queue.clone())
                .collect()
        };
        // No matching binding drops the message, as a topic exchange does.
        let queues = self.inner.queues.lock();
        for name in targets {
            if let Some(queue) = queues.get(&name) {
                queue.inner.lock().ready.push_back(StoredMessage {
                    routing_key: routing_key.to_owned(),
                    body: body.clone(),
                    redelivered: false,
                });
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }

    /// Simulates a broker restart: every unsettled delivery returns to the
    /// front of its queue, flagged as redelivered.
    pub fn restart(&self) {
        let queues = self.inner.queues.lock();
        for queue in queues.values() {
            let mut inner = queue.inner.lock();
            let mut returned: Vec<(u64, StoredMessage)> = inner.unacked.drain().collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for (_, mut message) in returned.into_iter().rev() {
                message.redelivered = true;
                inner.ready.push_front(message);
            }
            queue.notify.notify_waiters();
        }
        debug!("in-memory broker restarted");
    }

    /// Flips simulated reachability for publish and health.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Ready (not in-flight) messages on a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.with_queue(queue, |inner| inner.ready.len())
    }

    /// Bodies dead-lettered off a queue, oldest first.
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |inner| {
            inner.dead.iter().map(|m| m.body.clone()).collect()
        })
    }

    /// Active subscriptions on a queue.
    pub fn subscriber_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |inner| inner.subscribers)
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueInner) -> T) -> T {
        let queues = self.inner.queues.lock();
        queues
            .get(queue)
            .map(|q| f(&q.inner.lock()))
            .unwrap_or_default()
    }
}

impl QueueState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            notify: Notify::new(),
            inner: Mutex::new(QueueInner::default()),
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(PublishError::Unreachable("broker marked unreachable".into()));
        }
        let key = envelope.routing_key.as_str();
        let exchange = topology::exchange_for(key)
            .ok_or_else(|| PublishError::UnknownExchange(key.to_owned()))?;
        self.route(exchange, key, envelope.encode())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueSubscription>, BrokerError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable("broker marked unreachable".into()));
        }
        let state = {
            let queues = self.inner.queues.lock();
            queues
                .get(queue)
                .cloned()
                .ok_or_else(|| BrokerError::Subscribe(format!("queue not declared: {}", queue)))?
        };
        state.inner.lock().subscribers += 1;
        Ok(Box::new(MemorySubscription {
            broker: self.inner.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            acker: Arc::new(MemoryAcker {
                queue: Arc::clone(&state),
            }),
            queue: state,
        }))
    }

    async fn health(&self) -> BrokerHealth {
        if self.inner.reachable.load(Ordering::SeqCst) {
            BrokerHealth::Reachable
        } else {
            BrokerHealth::Unreachable
        }
    }
}

struct MemorySubscription {
    broker: Arc<BrokerState>,
    queue: Arc<QueueState>,
    acker: Arc<MemoryAcker>,
    closed: Arc<AtomicBool>,
}

impl MemorySubscription {
    /// Returns unsettled deliveries to the queue head as redelivered and
    /// retires the subscription, as the broker does on channel close.
    fn release_unsettled(&self) {
        let mut inner = self.queue.inner.lock();
        inner.subscribers = inner.subscribers.saturating_sub(1);
        let mut returned: Vec<(u64, StoredMessage)> = inner.unacked.drain().collect();
        returned.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in returned.into_iter().rev() {
            message.redelivered = true;
            inner.ready.push_front(message);
        }
        drop(inner);
        self.queue.notify.notify_waiters();
    }
}

impl Drop for MemorySubscription {
    /// A subscription dropped without `close` (an aborted consumer task)
    /// must not strand its in-flight deliveries.
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release_unsettled();
            debug!(queue = %self.queue.name, "in-memory subscription dropped, deliveries returned");
        }
    }
}

#[async_trait]
impl QueueSubscription for MemorySubscription {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            {
                if self.closed.load(Ordering::SeqCst) {
                    return None;
                }
                let mut inner = self.queue.inner.lock();
                if let Some(message) = inner.ready.pop_front() {
                    let tag = self.broker.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
                    let delivery = Delivery {
                        routing_key: message.routing_key.clone(),
                        body: message.body.clone(),
                        redelivered: message.redelivered,
                        delivery_tag: tag,
                    };
                    inner.unacked.insert(tag, message);
                    return Some(delivery);
                }
            }
            notified.await;
        }
    }

    fn acker(&self) -> Arc<dyn Acker> {
        Arc::clone(&self.acker) as Arc<dyn Acker>
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.release_unsettled();
            debug!(queue = %self.queue.name, "in-memory subscription closed");
        }
        Ok(())
    }
}

struct MemoryAcker {
    queue: Arc<QueueState>,
}

impl MemoryAcker {
    fn take_unacked(&self, delivery: &Delivery) -> Result<StoredMessage, BrokerError> {
        self.queue
            .inner
            .lock()
            .unacked
            .remove(&delivery.delivery_tag)
            .ok_or_else(|| {
                BrokerError::Ack(format!("unknown delivery tag: {}", delivery.delivery_tag))
            })
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.take_unacked(delivery).map(|_| ())
    }

    async fn nack_requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut message = self.take_unacked(delivery)?;
        message.redelivered = true;
        let mut inner = self.queue.inner.lock();
        inner.ready.push_front(message);
        drop(inner);
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let message = self.take_unacked(delivery)?;
        self.queue.inner.lock().dead.push(message);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::topology::{MONTHLY_REPORT_QUEUE, platform_topology};
    use crate::events::routing::RoutingKey;
    use serde_json::json;

    fn broker() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.declare_topology(&platform_topology());
        broker
    }

    fn report_envelope() -> Envelope {
        Envelope::new(
            RoutingKey::parse("email.monthly.report").unwrap(),
            json!({"userId": "U1"}),
        )
    }

    #[tokio::test]
    async fn publish_routes_to_bound_queue() {
        let broker = broker();
        broker.publish(&report_envelope()).await.unwrap();
        assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 1);
    }

    #[tokio::test]
    async fn publish_with_no_matching_binding_is_dropped() {
        let broker = broker();
        let envelope = Envelope::new(
            RoutingKey::parse("order.created").unwrap(),
            json!({"orderId": "O1"}),
        );
        broker.publish(&envelope).await.unwrap();
        assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 0);
    }

    #[tokio::test]
    async fn unreachable_broker_rejects_publishes() {
        let broker = broker();
        broker.set_reachable(false);
        let err = broker.publish(&report_envelope()).await.unwrap_err();
        assert!(matches!(err, PublishError::Unreachable(_)));
        assert_eq!(broker.health().await, BrokerHealth::Unreachable);
    }

    #[tokio::test]
    async fn ack_settles_and_requeue_redelivers() {
        let broker = broker();
        broker.publish(&report_envelope()).await.unwrap();

        let mut sub = broker.subscribe(MONTHLY_REPORT_QUEUE).await.unwrap();
        let acker = sub.acker();

        let first = sub.recv().await.unwrap();
        assert!(!first.redelivered);
        acker.nack_requeue(&first).await.unwrap();

        let second = sub.recv().await.unwrap();
        assert!(second.redelivered);
        assert_eq!(second.body, first.body);
        acker.ack(&second).await.unwrap();
        assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 0);
    }

    #[tokio::test]
    async fn restart_returns_unacked_to_the_queue() {
        let broker = broker();
        broker.publish(&report_envelope()).await.unwrap();

        let mut sub = broker.subscribe(MONTHLY_REPORT_QUEUE).await.unwrap();
        let delivery = sub.recv().await.unwrap();

        broker.restart();
        let redelivered = sub.recv().await.unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.body, delivery.body);
    }

    #[tokio::test]
    async fn dead_letter_removes_from_processing() {
        let broker = broker();
        broker.publish(&report_envelope()).await.unwrap();

        let mut sub = broker.subscribe(MONTHLY_REPORT_QUEUE).await.unwrap();
        let acker = sub.acker();
        let delivery = sub.recv().await.unwrap();
        acker.dead_letter(&delivery).await.unwrap();

        assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 0);
        assert_eq!(broker.dead_letters(MONTHLY_REPORT_QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscription_returns_in_flight_deliveries() {
        let broker = broker();
        broker.publish(&report_envelope()).await.unwrap();

        let mut sub = broker.subscribe(MONTHLY_REPORT_QUEUE).await.unwrap();
        let first = sub.recv().await.unwrap();
        // Dropped without close, as when an owning task is aborted.
        drop(sub);

        assert_eq!(broker.subscriber_count(MONTHLY_REPORT_QUEUE), 0);
        assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 1);

        let mut replacement = broker.subscribe(MONTHLY_REPORT_QUEUE).await.unwrap();
        let redelivered = replacement.recv().await.unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.body, first.body);
    }

    #[tokio::test]
    async fn close_returns_in_flight_deliveries() {
        let broker = broker();
        broker.publish(&report_envelope()).await.unwrap();

        let mut sub = broker.subscribe(MONTHLY_REPORT_QUEUE).await.unwrap();
        let _delivery = sub.recv().await.unwrap();
        assert_eq!(broker.subscriber_count(MONTHLY_REPORT_QUEUE), 1);

        sub.close().await.unwrap();
        assert_eq!(broker.subscriber_count(MONTHLY_REPORT_QUEUE), 0);
        assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 1);
    }
}
