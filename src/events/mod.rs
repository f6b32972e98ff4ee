//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// This module implements the asynchronous event propagation core of the platform: the contract
// connecting order creation, cart mutation and user lifecycle events to downstream consumers.
//
// | Component                | Description                                                |
// |--------------------------|-----------------------------------------------------------|
// | Envelope                 | Canonical wire format for events (key, payload, metadata) |
// | RoutingKey               | Validated dot-delimited topic, closed vocabulary          |
// | EventPublisher           | Hands domain events to the broker with confirm semantics  |
// | EventConsumer            | Dispatch loop: decode, route by key, ack/requeue/DLQ      |
// | EventHandler             | Trait for capabilities invoked by the dispatcher          |
// | MonthlyReportHandler     | Idempotent report-generation consumer (email service)     |
// | IdempotencyStore         | Dedupe store making redelivery safe                       |
//--------------------------------------------------------------------------------------------------

pub mod consumer;
pub mod envelope;
pub mod handlers;
pub mod idempotency;
pub mod publisher;
pub mod report;
pub mod routing;
pub mod types;
