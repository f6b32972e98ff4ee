use rabbitmq::{QueueSpec, Topology};

// Exchange per producing service. Names are cross-service contracts.
pub const ORDER_EVENTS_EXCHANGE: &str = "order.events";
pub const CART_EVENTS_EXCHANGE: &str = "cart.events";
pub const USER_EVENTS_EXCHANGE: &str = "user.events";
pub const EMAIL_EVENTS_EXCHANGE: &str = "email.events";

/// Exchange receiving messages removed from normal processing.
pub const DEAD_LETTER_EXCHANGE: &str = "platform.dead-letter";
/// Queue collecting dead-lettered messages for operator inspection.
pub const DEAD_LETTER_QUEUE: &str = "platform.dead-letters";

/// Queue feeding the email service's monthly-report consumer.
pub const MONTHLY_REPORT_QUEUE: &str = "email.monthly-report";

/// The full exchange/queue/binding layout of the platform.
///
/// Declared idempotently by every service at startup so deploy order does
/// not matter; declaring existing topology is a no-op.
pub fn platform_topology() -> Topology {
    Topology::default()
        .exchange(ORDER_EVENTS_EXCHANGE)
        .exchange(CART_EVENTS_EXCHANGE)
        .exchange(USER_EVENTS_EXCHANGE)
        .exchange(EMAIL_EVENTS_EXCHANGE)
        .exchange(DEAD_LETTER_EXCHANGE)
        .queue(
            QueueSpec::new(MONTHLY_REPORT_QUEUE)
                .bind(EMAIL_EVENTS_EXCHANGE, "email.monthly.report")
                .with_dead_letter_exchange(DEAD_LETTER_EXCHANGE),
        )
        .queue(QueueSpec::new(DEAD_LETTER_QUEUE).bind(DEAD_LETTER_EXCHANGE, "#"))
}

/// Maps a routing key to the exchange its producer publishes on.
///
/// The first segment of the key names the owning service.
pub fn exchange_for(routing_key: &str) -> Option<&'static str> {
    match routing_key.split('.').next() {
        Some("order") => Some(ORDER_EVENTS_EXCHANGE),
        Some("cart") => Some(CART_EVENTS_EXCHANGE),
        Some("user") => Some(USER_EVENTS_EXCHANGE),
        Some("email") => Some(EMAIL_EVENTS_EXCHANGE),
        _ => None,
    }
}
