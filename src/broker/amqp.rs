use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

use super::{
    Acker, BrokerError, BrokerHealth, Delivery, MessageBroker, PublishError, QueueSubscription,
    topology,
};
use crate::events::envelope::Envelope;
use rabbitmq::{
    ConnectionStatus, OutboundMessage, RabbitBus, RabbitMqError, SubscriptionAcker, Topology,
    TopicPublisher, TopicSubscription,
};

/// Production broker over one [`RabbitBus`] connection.
///
/// Publisher channels are opened lazily, one confirm-mode channel per
/// exchange, and cached for the life of the process. A failed publish drops
/// the cached channel so the next publish reopens it on the recovered
/// connection.
pub struct AmqpBroker {
    bus: Arc<RabbitBus>,
    publishers: tokio::sync::Mutex<HashMap<String, Arc<TopicPublisher>>>,
    status: watch::Receiver<ConnectionStatus>,
}

impl AmqpBroker {
    pub fn new(bus: Arc<RabbitBus>) -> Self {
        let status = bus.status();
        Self {
            bus,
            publishers: tokio::sync::Mutex::new(HashMap::new()),
            status,
        }
    }

    /// Declares the platform topology on the connected broker.
    pub async fn declare_topology(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.bus
            .declare_topology(topology)
            .await
            .map_err(|err| BrokerError::Topology(err.to_string()))
    }

    async fn publisher(&self, exchange: &str) -> Result<Arc<TopicPublisher>, PublishError> {
        let mut publishers = self.publishers.lock().await;
        if let Some(publisher) = publishers.get(exchange) {
            return Ok(Arc::clone(publisher));
        }
        let publisher = Arc::new(
            self.bus
                .topic_publisher(exchange)
                .await
                .map_err(map_publish_error)?,
        );
        publishers.insert(exchange.to_owned(), Arc::clone(&publisher));
        Ok(publisher)
    }

    async fn evict_publisher(&self, exchange: &str) {
        self.publishers.lock().await.remove(exchange);
    }
}

fn map_publish_error(err: RabbitMqError) -> PublishError {
    match err {
        RabbitMqError::ConfirmTimeout => PublishError::ConfirmTimeout,
        RabbitMqError::Nacked => PublishError::Rejected,
        RabbitMqError::Uri(msg) | RabbitMqError::Connection(msg) => {
            PublishError::Unreachable(msg)
        }
        other => PublishError::ChannelClosed(other.to_string()),
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError> {
        let key = envelope.routing_key.as_str();
        let exchange = topology::exchange_for(key)
            .ok_or_else(|| PublishError::UnknownExchange(key.to_owned()))?;

        let publisher = self.publisher(exchange).await?;
        let message = OutboundMessage::new(key, envelope.encode())
            .with_message_id(&envelope.message_id.to_string());

        match publisher.publish(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Stale channel; reopen on the next publish.
                self.evict_publisher(exchange).await;
                Err(map_publish_error(err))
            }
        }
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueSubscription>, BrokerError> {
        let subscription = self
            .bus
            .subscribe(queue)
            .await
            .map_err(|err| BrokerError::Subscribe(err.to_string()))?;
        let acker = Arc::new(AmqpAcker {
            inner: subscription.acker(),
        });
        Ok(Box::new(AmqpSubscription {
            subscription,
            acker,
        }))
    }

    async fn health(&self) -> BrokerHealth {
        match *self.status.borrow() {
            ConnectionStatus::Connected => BrokerHealth::Reachable,
            ConnectionStatus::Disconnected => BrokerHealth::Unreachable,
        }
    }
}

struct AmqpSubscription {
    subscription: TopicSubscription,
    acker: Arc<AmqpAcker>,
}

#[async_trait]
impl QueueSubscription for AmqpSubscription {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let message = self.subscription.recv().await?;
            let Some(deliver) = message.deliver else {
                warn!("consumer message without a deliver frame, skipping");
                continue;
            };
            return Some(Delivery {
                routing_key: deliver.routing_key().to_owned(),
                body: message.content.unwrap_or_default(),
                redelivered: deliver.redelivered(),
                delivery_tag: deliver.delivery_tag(),
            });
        }
    }

    fn acker(&self) -> Arc<dyn Acker> {
        Arc::clone(&self.acker) as Arc<dyn Acker>
    }

    async fn close(self: Box<Self>) -> Result<(), BrokerError> {
        self.subscription
            .close()
            .await
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }
}

struct AmqpAcker {
    inner: SubscriptionAcker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner
            .ack_tag(delivery.delivery_tag)
            .await
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }

    async fn nack_requeue(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner
            .nack_tag(delivery.delivery_tag, true)
            .await
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }

    /// Requeue-less nack; the queue's dead-letter exchange receives the
    /// message.
    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner
            .nack_tag(delivery.delivery_tag, false)
            .await
            .map_err(|err| BrokerError::Ack(err.to_string()))
    }
}
