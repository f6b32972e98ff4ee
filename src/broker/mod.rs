//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// Broker seam between the event code and the transport. Production services run the AMQP
// implementation over the `rabbitmq` crate; tests run the in-memory implementation with the same
// topic-exchange semantics (pattern bindings, manual ack, redelivery, dead-lettering).
//
// | Component        | Description                                                   |
// |------------------|---------------------------------------------------------------|
// | MessageBroker    | Publish with confirm semantics, subscribe, report health      |
// | QueueSubscription| Pull deliveries off one queue, hand out an Acker              |
// | Acker            | Settle a delivery: ack, requeue, or dead-letter               |
// | AmqpBroker       | Adapter over rabbitmq::RabbitBus                              |
// | InMemoryBroker   | Test double with real queue/binding behaviour                 |
// | topology         | The platform's exchanges, queues and bindings                 |
//--------------------------------------------------------------------------------------------------

pub mod amqp;
pub mod memory;
pub mod topology;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::events::envelope::Envelope;

/// Errors for broker operations other than publishing.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached (connection refused, recovery exhausted)
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// Declaring exchanges, queues or bindings failed
    #[error("topology declaration failed: {0}")]
    Topology(String),
    /// Starting a consumer on a queue failed
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// Settling a delivery (ack or nack) failed
    #[error("acknowledgement failed: {0}")]
    Ack(String),
}

/// Errors surfaced to a publisher.
///
/// Every variant means the caller must not assume the event was durably
/// accepted; the publishing service decides whether to retry or fail its own
/// request.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker could not be reached
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    /// The publish channel dropped before the broker confirmed
    #[error("publish channel closed: {0}")]
    ChannelClosed(String),
    /// The broker did not confirm within the configured window
    #[error("broker did not confirm the publish in time")]
    ConfirmTimeout,
    /// The broker refused the message
    #[error("broker rejected the publish")]
    Rejected,
    /// No exchange in the platform topology accepts this routing key
    #[error("no exchange accepts routing key: {0}")]
    UnknownExchange(String),
}

/// Broker connectivity as seen from this process, for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerHealth {
    Reachable,
    Unreachable,
}

/// One message handed to a consumer, not yet settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub routing_key: String,
    pub body: Vec<u8>,
    /// True when the broker has delivered this message before (a prior
    /// consumer nacked it or died holding it)
    pub redelivered: bool,
    /// Broker-assigned tag used to settle the delivery
    pub delivery_tag: u64,
}

/// Settles deliveries for one subscription.
///
/// Exactly one of the three calls must be made per delivery. Cloning the
/// handle into per-message worker tasks is the expected usage.
#[async_trait]
pub trait Acker: Send + Sync {
    /// Marks the delivery as processed; the broker forgets it.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Returns the delivery to the queue for another attempt; the next
    /// delivery carries `redelivered = true`.
    async fn nack_requeue(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Removes the delivery from normal processing into the dead-letter
    /// destination for operator inspection.
    async fn dead_letter(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

/// A manual-ack consumer on one durable queue.
#[async_trait]
pub trait QueueSubscription: Send {
    /// Next delivery, or `None` once the subscription is closed.
    async fn recv(&mut self) -> Option<Delivery>;

    /// Acker shared with worker tasks processing this queue's deliveries.
    fn acker(&self) -> Arc<dyn Acker>;

    /// Closes the subscription; unsettled deliveries return to the queue.
    async fn close(self: Box<Self>) -> Result<(), BrokerError>;
}

/// The transport seam: publish, subscribe and health.
///
/// `publish` resolves the destination exchange from the envelope's routing
/// key and returns only after the broker has durably accepted the message
/// (confirm semantics). It never waits for any consumer.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> Result<(), PublishError>;

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueSubscription>, BrokerError>;

    async fn health(&self) -> BrokerHealth;
}
