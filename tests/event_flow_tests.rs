//! End-to-end event flow over the in-memory broker: publish, route, dispatch,
//! settle, dead-letter and dedupe behave as one system.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use commerce_events::broker::topology::{
    MONTHLY_REPORT_QUEUE, ORDER_EVENTS_EXCHANGE, platform_topology,
};
use commerce_events::events::report::{
    EmailError, EmailSender, RenderedReport, TextReportRenderer,
};
use commerce_events::events::types::{
    MonthlyReportRequested, OrderCreated, TransactionSummary,
};
use commerce_events::{
    DomainEvent, Envelope, EventConsumer, EventHandler, EventPublisher, HandlerError,
    InMemoryBroker, InMemoryIdempotencyStore, MessageBroker, MonthlyReportHandler, PublishError,
};
use rabbitmq::{QueueSpec, Topology};

const ORDER_AUDIT_QUEUE: &str = "orders.audit";

fn broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.declare_topology(&platform_topology());
    // Extra consumer queue for order events, as an auditing service would own.
    broker.declare_topology(
        &Topology::default()
            .queue(QueueSpec::new(ORDER_AUDIT_QUEUE).bind(ORDER_EVENTS_EXCHANGE, "order.#")),
    );
    broker
}

fn order_created() -> DomainEvent {
    DomainEvent::OrderCreated(OrderCreated {
        order_id: "O1".to_string(),
        order_number: "ORD-2024-0001".to_string(),
        user_id: "U1".to_string(),
        total_amount: dec!(42.50),
        status: "Pending".to_string(),
        created_at: "2024-03-01T12:00:00Z".parse().unwrap(),
    })
}

fn report_request(user_id: &str) -> DomainEvent {
    DomainEvent::MonthlyReportRequested(MonthlyReportRequested {
        user_id: user_id.to_string(),
        user_email: format!("{}@example.com", user_id.to_lowercase()),
        user_name: "Dana".to_string(),
        transactions: vec![TransactionSummary {
            order_number: "ORD-2024-0001".to_string(),
            order_date: "2024-03-05T09:00:00Z".parse().unwrap(),
            total_amount: dec!(42.50),
            status: "Delivered".to_string(),
            items: vec![],
        }],
        report_month: "2024-03-01T00:00:00Z".parse().unwrap(),
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Records every event it sees, in arrival order.
struct RecordingHandler {
    routing_key: &'static str,
    seen: Arc<Mutex<Vec<DomainEvent>>>,
}

#[async_trait]
impl EventHandler for RecordingHandler {
    fn routing_key(&self) -> &'static str {
        self.routing_key
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let event = DomainEvent::from_envelope(envelope)
            .map_err(|err| HandlerError::Permanent(err.to_string()))?;
        self.seen.lock().push(event);
        Ok(())
    }
}

/// Email sender that counts sends and fails the first N attempts.
struct FlakyEmailSender {
    sends: AtomicUsize,
    fail_first: usize,
}

impl FlakyEmailSender {
    fn new(fail_first: usize) -> Self {
        Self {
            sends: AtomicUsize::new(0),
            fail_first,
        }
    }

    fn sent(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmailSender for FlakyEmailSender {
    async fn send_with_attachment(
        &self,
        _to: &str,
        _report: &RenderedReport,
    ) -> Result<(), EmailError> {
        let attempt = self.sends.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first {
            Err(EmailError::Unavailable("smtp down".into()))
        } else {
            Ok(())
        }
    }
}

fn report_consumer(
    broker: &InMemoryBroker,
    email: Arc<FlakyEmailSender>,
) -> EventConsumer {
    let handler = Arc::new(MonthlyReportHandler::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(TextReportRenderer::new()),
        email,
    ));
    EventConsumer::builder(
        Arc::new(broker.clone()) as Arc<dyn MessageBroker>,
        MONTHLY_REPORT_QUEUE,
    )
    .handler(handler)
    .build()
}

#[tokio::test]
async fn order_created_flows_from_publisher_to_consumer() {
    let broker = broker();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = EventConsumer::builder(
        Arc::new(broker.clone()) as Arc<dyn MessageBroker>,
        ORDER_AUDIT_QUEUE,
    )
    .handler(Arc::new(RecordingHandler {
        routing_key: "order.created",
        seen: Arc::clone(&seen),
    }))
    .build();
    consumer.start().await.unwrap();

    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    publisher.publish(&order_created()).await.unwrap();

    wait_until(|| !seen.lock().is_empty()).await;
    let DomainEvent::OrderCreated(order) = seen.lock()[0].clone() else {
        panic!("expected an order.created event");
    };
    assert_eq!(order.order_id, "O1");
    assert_eq!(order.user_id, "U1");
    assert_eq!(order.total_amount, dec!(42.50));

    consumer.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn events_arrive_in_publish_order() {
    let broker = broker();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = EventConsumer::builder(
        Arc::new(broker.clone()) as Arc<dyn MessageBroker>,
        ORDER_AUDIT_QUEUE,
    )
    .handler(Arc::new(RecordingHandler {
        routing_key: "order.created",
        seen: Arc::clone(&seen),
    }))
    .build();
    consumer.start().await.unwrap();

    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    for n in 1..=3 {
        let mut event = order_created();
        if let DomainEvent::OrderCreated(order) = &mut event {
            order.order_id = format!("O{}", n);
        }
        publisher.publish(&event).await.unwrap();
    }

    wait_until(|| seen.lock().len() == 3).await;
    let ids: Vec<String> = seen
        .lock()
        .iter()
        .map(|event| match event {
            DomainEvent::OrderCreated(order) => order.order_id.clone(),
            other => panic!("unexpected event: {:?}", other),
        })
        .collect();
    assert_eq!(ids, ["O1", "O2", "O3"]);

    consumer.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn messages_survive_a_broker_restart() {
    let broker = broker();
    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    publisher.publish(&report_request("U1")).await.unwrap();

    broker.restart();
    assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 1);

    let email = Arc::new(FlakyEmailSender::new(0));
    let consumer = report_consumer(&broker, Arc::clone(&email));
    consumer.start().await.unwrap();

    wait_until(|| email.sent() == 1).await;
    consumer.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn duplicate_report_requests_send_one_email() {
    let broker = broker();
    let email = Arc::new(FlakyEmailSender::new(0));
    let consumer = report_consumer(&broker, Arc::clone(&email));
    consumer.start().await.unwrap();

    // Two distinct messages for the same user and month.
    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    publisher.publish(&report_request("U1")).await.unwrap();
    publisher.publish(&report_request("U1")).await.unwrap();
    publisher.publish(&report_request("U2")).await.unwrap();

    wait_until(|| broker.queue_depth(MONTHLY_REPORT_QUEUE) == 0).await;
    wait_until(|| email.sent() == 2).await;
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(email.sent(), 2);

    consumer.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn transient_failure_retries_once_then_succeeds() {
    let broker = broker();
    let email = Arc::new(FlakyEmailSender::new(1));
    let consumer = report_consumer(&broker, Arc::clone(&email));
    consumer.start().await.unwrap();

    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    publisher.publish(&report_request("U1")).await.unwrap();

    wait_until(|| email.sent() == 2).await;
    wait_until(|| broker.queue_depth(MONTHLY_REPORT_QUEUE) == 0).await;
    assert!(broker.dead_letters(MONTHLY_REPORT_QUEUE).is_empty());

    // No third delivery appears.
    tokio::time::sleep(Duration::from_millis(25)).await;
    assert_eq!(email.sent(), 2);

    consumer.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn persistent_transient_failure_dead_letters_after_the_retry() {
    let broker = broker();
    let email = Arc::new(FlakyEmailSender::new(usize::MAX));
    let consumer = report_consumer(&broker, Arc::clone(&email));
    consumer.start().await.unwrap();

    let publisher = EventPublisher::new(Arc::new(broker.clone()));
    publisher.publish(&report_request("U1")).await.unwrap();

    // First delivery requeues, the redelivery is removed to the dead letters.
    wait_until(|| broker.dead_letters(MONTHLY_REPORT_QUEUE).len() == 1).await;
    assert_eq!(email.sent(), 2);
    assert_eq!(broker.queue_depth(MONTHLY_REPORT_QUEUE), 0);

    consumer.stop(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn unreachable_broker_fails_the_publish() {
    let broker = broker();
    broker.set_reachable(false);
    let publisher = EventPublisher::new(Arc::new(broker));

    let err = publisher.publish(&order_created()).await.unwrap_err();
    assert!(matches!(err, PublishError::Unreachable(_)));
}
