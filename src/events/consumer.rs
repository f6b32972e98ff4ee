use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::envelope::Envelope;
use super::handlers::{EventHandler, HandlerError};
use crate::broker::{Acker, BrokerError, Delivery, MessageBroker, QueueSubscription};

/// Lifecycle of an [`EventConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Starting,
    Consuming,
    Stopping,
}

/// Dispatch loop for one queue.
///
/// Deliveries are decoded, routed to the handler registered for their
/// routing key and settled exactly once each:
///
/// - handler success, or no handler for the key: acknowledge
/// - undecodable body: dead-letter (redelivery cannot help)
/// - transient handler failure on a first delivery: requeue once
/// - transient failure on a redelivery, permanent failure, or a handler
///   panic: dead-letter
///
/// Deliveries are dispatched in queue order, one spawned handler task at a
/// time, so redeliveries and queue order behave predictably. `start` is
/// idempotent; `stop` drains the in-flight handler up to a deadline and
/// abandons it past that.
pub struct EventConsumer {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    handlers: Arc<HashMap<&'static str, Arc<dyn EventHandler>>>,
    state: Arc<Mutex<ConsumerState>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn builder(broker: Arc<dyn MessageBroker>, queue: &str) -> EventConsumerBuilder {
        EventConsumerBuilder {
            broker,
            queue: queue.to_owned(),
            handlers: HashMap::new(),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    /// Subscribes and spawns the dispatch loop. Calling `start` on a
    /// consumer that is not stopped is a no-op.
    pub async fn start(&self) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock();
            if *state != ConsumerState::Stopped {
                info!(queue = %self.queue, state = ?*state, "consumer already running, start ignored");
                return Ok(());
            }
            *state = ConsumerState::Starting;
        }

        let subscription = match self.broker.subscribe(&self.queue).await {
            Ok(subscription) => subscription,
            Err(err) => {
                *self.state.lock() = ConsumerState::Stopped;
                return Err(err);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut state = self.state.lock();
            if *state != ConsumerState::Starting {
                // A concurrent stop() won the race while we were subscribing.
                drop(state);
                let _ = subscription.close().await;
                return Ok(());
            }
            // Set before spawning; the loop owns the transition to Stopped.
            *state = ConsumerState::Consuming;
            *self.shutdown.lock() = Some(shutdown_tx);
        }

        let handlers = Arc::clone(&self.handlers);
        let queue = self.queue.clone();
        let state = Arc::clone(&self.state);
        let handle = tokio::spawn(async move {
            run_loop(subscription, handlers, shutdown_rx, &queue).await;
            *state.lock() = ConsumerState::Stopped;
        });
        *self.task.lock() = Some(handle);
        info!(queue = %self.queue, "consumer started");
        Ok(())
    }

    /// Signals the loop to stop and waits up to `deadline` for the in-flight
    /// handler to finish. Past the deadline the loop is aborted; its unacked
    /// delivery returns to the queue for redelivery.
    pub async fn stop(&self, deadline: Duration) {
        let (shutdown, handle) = {
            let mut state = self.state.lock();
            if *state == ConsumerState::Stopped {
                return;
            }
            *state = ConsumerState::Stopping;
            (self.shutdown.lock().take(), self.task.lock().take())
        };

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(mut handle) = handle {
            if tokio::time::timeout(deadline, &mut handle).await.is_err() {
                warn!(queue = %self.queue, "consumer stop deadline passed, abandoning in-flight handler");
                handle.abort();
            }
        }
        *self.state.lock() = ConsumerState::Stopped;
        info!(queue = %self.queue, "consumer stopped");
    }
}

/// Builder collecting one handler per routing key.
pub struct EventConsumerBuilder {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    handlers: HashMap<&'static str, Arc<dyn EventHandler>>,
}

impl EventConsumerBuilder {
    /// Registers a handler under its routing key. A second handler for the
    /// same key replaces the first.
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(handler.routing_key(), handler);
        self
    }

    pub fn build(self) -> EventConsumer {
        EventConsumer {
            broker: self.broker,
            queue: self.queue,
            handlers: Arc::new(self.handlers),
            state: Arc::new(Mutex::new(ConsumerState::Stopped)),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }
}

async fn run_loop(
    mut subscription: Box<dyn QueueSubscription>,
    handlers: Arc<HashMap<&'static str, Arc<dyn EventHandler>>>,
    mut shutdown: watch::Receiver<bool>,
    queue: &str,
) {
    let acker = subscription.acker();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            delivery = subscription.recv() => {
                let Some(delivery) = delivery else { break };
                dispatch(&delivery, &handlers, acker.as_ref(), queue).await;
            }
        }
    }
    if let Err(err) = subscription.close().await {
        warn!(queue, error = %err, "error closing subscription");
    }
}

/// Settles one delivery per the dispatch policy. Never panics and never
/// exits the loop: a poisonous message is removed, not fatal.
async fn dispatch(
    delivery: &Delivery,
    handlers: &HashMap<&'static str, Arc<dyn EventHandler>>,
    acker: &dyn Acker,
    queue: &str,
) {
    let envelope = match Envelope::decode(&delivery.body) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(queue, error = %err, "undecodable message body, dead-lettering");
            settle(acker.dead_letter(delivery).await, queue);
            return;
        }
    };

    let Some(handler) = handlers.get(envelope.routing_key.as_str()) else {
        warn!(
            queue,
            routing_key = %envelope.routing_key,
            message_id = %envelope.message_id,
            "no handler for routing key, acknowledging"
        );
        settle(acker.ack(delivery).await, queue);
        return;
    };

    // The handler runs in its own task so a panic surfaces as a join error
    // instead of taking the dispatch loop down.
    let invocation = {
        let handler = Arc::clone(handler);
        let envelope = envelope.clone();
        tokio::spawn(async move { handler.handle(&envelope).await })
    };
    let outcome = match invocation.await {
        Ok(outcome) => outcome,
        Err(join_err) => Err(HandlerError::Permanent(format!(
            "handler panicked: {}",
            join_err
        ))),
    };

    match outcome {
        Ok(()) => settle(acker.ack(delivery).await, queue),
        Err(err) if err.is_transient() && !delivery.redelivered => {
            warn!(
                queue,
                routing_key = %envelope.routing_key,
                message_id = %envelope.message_id,
                error = %err,
                "transient handler failure, requeueing for one retry"
            );
            settle(acker.nack_requeue(delivery).await, queue);
        }
        Err(err) => {
            error!(
                queue,
                routing_key = %envelope.routing_key,
                message_id = %envelope.message_id,
                redelivered = delivery.redelivered,
                error = %err,
                "handler failure, dead-lettering"
            );
            settle(acker.dead_letter(delivery).await, queue);
        }
    }
}

fn settle(result: Result<(), BrokerError>, queue: &str) {
    if let Err(err) = result {
        error!(queue, error = %err, "failed to settle delivery");
    }
}
