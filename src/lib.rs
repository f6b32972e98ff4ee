// Expose the modules
pub mod broker;
pub mod config;
pub mod events;
pub mod health;

// Re-export key types for easier usage
pub use broker::{
    Acker, BrokerError, BrokerHealth, Delivery, MessageBroker, PublishError, QueueSubscription,
    amqp::AmqpBroker, memory::InMemoryBroker, topology::platform_topology,
};
pub use events::{
    consumer::{ConsumerState, EventConsumer},
    envelope::{DecodeError, Envelope},
    handlers::{EventHandler, EventLogger, HandlerError},
    idempotency::{IdempotencyStore, InMemoryIdempotencyStore},
    publisher::EventPublisher,
    report::{EmailSender, MonthlyReportHandler, ReportRenderer},
    routing::{BindingPattern, RoutingKey},
    types::DomainEvent,
};
