use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::DomainEvent;
use crate::broker::{MessageBroker, PublishError};

/// Hands domain events to the broker after the service's local write has
/// committed.
///
/// `publish` returns once the broker has durably accepted the message; it
/// never waits for a consumer. A publish failure means the event may not
/// exist on the broker and the caller decides whether that fails its own
/// operation.
pub struct EventPublisher {
    broker: Arc<dyn MessageBroker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn MessageBroker>) -> Self {
        Self { broker }
    }

    /// Publishes the event and returns its message id.
    ///
    /// # Errors
    /// Any [`PublishError`] means the event must not be assumed delivered.
    pub async fn publish(&self, event: &DomainEvent) -> Result<Uuid, PublishError> {
        let envelope = event.to_envelope();
        self.broker.publish(&envelope).await?;
        info!(
            routing_key = %envelope.routing_key,
            message_id = %envelope.message_id,
            "event published"
        );
        Ok(envelope.message_id)
    }

    /// Publishes without failing the caller: a lost event is logged and
    /// swallowed. For events whose loss the owning operation tolerates.
    pub async fn publish_best_effort(&self, event: &DomainEvent) {
        if let Err(err) = self.publish(event).await {
            warn!(
                routing_key = event.routing_key(),
                error = %err,
                "event publish failed, continuing without it"
            );
        }
    }
}
