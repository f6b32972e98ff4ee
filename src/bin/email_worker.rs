use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{Level, info, warn};

use commerce_events::broker::topology::{MONTHLY_REPORT_QUEUE, platform_topology};
use commerce_events::config::Config;
use commerce_events::events::report::{LoggingEmailSender, TextReportRenderer};
use commerce_events::{
    AmqpBroker, EventConsumer, InMemoryIdempotencyStore, MessageBroker, MonthlyReportHandler,
    health,
};
use rabbitmq::{ConnectOptions, RabbitBus};

/// Email service worker: consumes monthly-report requests off the broker.
#[derive(Parser)]
#[command(name = "email_worker")]
struct Args {
    /// Bind address for the health endpoint, overriding HEALTH_ADDR
    #[arg(long)]
    health_addr: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let args = Args::parse();
    let config = Config::from_env();
    let health_addr = args.health_addr.unwrap_or_else(|| config.health_addr.clone());

    let bus = Arc::new(
        RabbitBus::connect(ConnectOptions::new(&config.rabbit_url, &config.app_id))
            .await
            .context("connecting to rabbitmq")?,
    );
    let broker = Arc::new(AmqpBroker::new(Arc::clone(&bus)));
    broker
        .declare_topology(&platform_topology())
        .await
        .context("declaring topology")?;

    let handler = Arc::new(MonthlyReportHandler::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        Arc::new(TextReportRenderer::new()),
        Arc::new(LoggingEmailSender::new()),
    ));
    let consumer = EventConsumer::builder(
        Arc::clone(&broker) as Arc<dyn MessageBroker>,
        MONTHLY_REPORT_QUEUE,
    )
    .handler(handler)
    .build();
    consumer.start().await.context("starting consumer")?;

    let app = health::router(Arc::clone(&broker) as Arc<dyn MessageBroker>);
    let listener = TcpListener::bind(&health_addr)
        .await
        .with_context(|| format!("binding health endpoint on {}", health_addr))?;
    info!(%health_addr, "health endpoint listening");
    let health_server = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            warn!(error = %err, "health server exited");
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining consumer");

    consumer.stop(config.shutdown_timeout).await;
    health_server.abort();

    drop(consumer);
    drop(broker);
    if let Some(bus) = Arc::into_inner(bus) {
        if let Err(err) = bus.close().await {
            warn!(error = %err, "error closing broker connection");
        }
    }
    info!("worker stopped");
    Ok(())
}
