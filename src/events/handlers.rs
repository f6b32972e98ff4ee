use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use super::envelope::Envelope;
use super::types::DomainEvent;

/// Failure of one handler invocation.
///
/// The classification drives the dispatcher's settle decision: a transient
/// failure on a first delivery earns one requeue, anything else is removed
/// to the dead-letter destination.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retrying the same delivery may succeed (dependency down, rate limit)
    #[error("transient handler failure: {0}")]
    Transient(String),
    /// Retrying can never succeed (bad payload, rejected recipient)
    #[error("permanent handler failure: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A consuming capability invoked by the dispatcher for one routing key.
///
/// Handlers must tolerate redelivery: the platform guarantees at-least-once,
/// so the same message may arrive more than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// The routing key this handler consumes.
    fn routing_key(&self) -> &'static str;

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

/// Handler that records an event and does nothing else. Used for keys a
/// service observes without acting on.
pub struct EventLogger {
    routing_key: &'static str,
}

impl EventLogger {
    pub fn new(routing_key: &'static str) -> Self {
        Self { routing_key }
    }
}

#[async_trait]
impl EventHandler for EventLogger {
    fn routing_key(&self) -> &'static str {
        self.routing_key
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        match DomainEvent::from_envelope(envelope) {
            Ok(event) => info!(
                routing_key = %envelope.routing_key,
                message_id = %envelope.message_id,
                ?event,
                "event observed"
            ),
            Err(err) => return Err(HandlerError::Permanent(err.to_string())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::routing;
    use crate::events::types::{CartCleared, DomainEvent};

    #[tokio::test]
    async fn logger_accepts_a_vocabulary_event() {
        let logger = EventLogger::new(routing::CART_CLEARED);
        let envelope = DomainEvent::CartCleared(CartCleared {
            user_id: "U1".to_string(),
        })
        .to_envelope();
        assert!(logger.handle(&envelope).await.is_ok());
    }

    #[tokio::test]
    async fn logger_rejects_an_undecodable_payload_permanently() {
        let logger = EventLogger::new(routing::ORDER_CREATED);
        let envelope = Envelope::new(
            crate::events::routing::RoutingKey::parse(routing::ORDER_CREATED).unwrap(),
            serde_json::json!({"orderId": 7}),
        );
        let err = logger.handle(&envelope).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
