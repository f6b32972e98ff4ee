use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::envelope::Envelope;
use super::handlers::{EventHandler, HandlerError};
use super::idempotency::IdempotencyStore;
use super::routing;
use super::types::MonthlyReportRequested;

/// Failure rendering a report.
#[derive(Debug, Error)]
pub enum RenderError {
    /// The request data cannot produce a report; retrying cannot help
    #[error("invalid report input: {0}")]
    InvalidInput(String),
    /// The rendering backend is temporarily down
    #[error("renderer unavailable: {0}")]
    Unavailable(String),
}

/// Failure sending an email.
#[derive(Debug, Error)]
pub enum EmailError {
    /// The provider refused the recipient address; retrying cannot help
    #[error("recipient rejected: {0}")]
    RecipientRejected(String),
    /// The provider throttled us; retrying later may succeed
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// The provider is temporarily down
    #[error("email provider unavailable: {0}")]
    Unavailable(String),
}

/// A rendered report ready to be attached to an email.
#[derive(Debug, Clone)]
pub struct RenderedReport {
    pub subject: String,
    pub body: String,
    pub attachment_name: String,
    pub attachment: Vec<u8>,
}

/// Renders a user's monthly transaction report.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render_report(
        &self,
        request: &MonthlyReportRequested,
    ) -> Result<RenderedReport, RenderError>;
}

/// Delivers report emails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_with_attachment(
        &self,
        to: &str,
        report: &RenderedReport,
    ) -> Result<(), EmailError>;
}

/// Consumes `email.monthly.report`, rendering and emailing one user's
/// report per request.
///
/// The handler is idempotent over the business key `(userId, reportMonth)`,
/// not the message id: two distinct messages asking for the same user and
/// month produce one email. The claim is taken before the side effect and
/// released on failure, so a redelivery after a transient failure retries
/// cleanly while a redelivery after success is skipped.
pub struct MonthlyReportHandler {
    store: Arc<dyn IdempotencyStore>,
    renderer: Arc<dyn ReportRenderer>,
    email: Arc<dyn EmailSender>,
}

impl MonthlyReportHandler {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        renderer: Arc<dyn ReportRenderer>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            store,
            renderer,
            email,
        }
    }

    fn dedupe_key(request: &MonthlyReportRequested) -> String {
        format!(
            "monthly-report:{}:{}",
            request.user_id,
            request.report_month.format("%Y-%m")
        )
    }

    async fn process(&self, request: &MonthlyReportRequested) -> Result<(), HandlerError> {
        let report = self
            .renderer
            .render_report(request)
            .await
            .map_err(|err| match err {
                RenderError::InvalidInput(msg) => HandlerError::Permanent(msg),
                RenderError::Unavailable(msg) => HandlerError::Transient(msg),
            })?;

        self.email
            .send_with_attachment(&request.user_email, &report)
            .await
            .map_err(|err| match err {
                EmailError::RecipientRejected(msg) => HandlerError::Permanent(msg),
                EmailError::RateLimited(msg) | EmailError::Unavailable(msg) => {
                    HandlerError::Transient(msg)
                }
            })?;

        info!(
            user_id = %request.user_id,
            month = %request.report_month.format("%Y-%m"),
            transactions = request.transactions.len(),
            "monthly report sent"
        );
        Ok(())
    }
}

#[async_trait]
impl EventHandler for MonthlyReportHandler {
    fn routing_key(&self) -> &'static str {
        routing::EMAIL_MONTHLY_REPORT
    }

    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let request: MonthlyReportRequested = envelope
            .payload_as()
            .map_err(|err| HandlerError::Permanent(err.to_string()))?;

        let key = Self::dedupe_key(&request);
        if !self.store.try_begin(&key).await {
            info!(%key, message_id = %envelope.message_id, "report already handled, skipping");
            return Ok(());
        }

        match self.process(&request).await {
            Ok(()) => {
                self.store.complete(&key).await;
                Ok(())
            }
            Err(err) => {
                self.store.release(&key).await;
                Err(err)
            }
        }
    }
}

/// Plain-text renderer used by the worker binary.
#[derive(Default)]
pub struct TextReportRenderer;

impl TextReportRenderer {
    pub fn new() -> Self {
        Self
    }

    fn month_title(month: &DateTime<Utc>) -> String {
        month.format("%B %Y").to_string()
    }
}

#[async_trait]
impl ReportRenderer for TextReportRenderer {
    async fn render_report(
        &self,
        request: &MonthlyReportRequested,
    ) -> Result<RenderedReport, RenderError> {
        if request.user_email.is_empty() {
            return Err(RenderError::InvalidInput("empty recipient email".into()));
        }

        let total: Decimal = request.transactions.iter().map(|t| t.total_amount).sum();
        let mut text = String::new();
        let name = if request.user_name.is_empty() {
            "customer"
        } else {
            &request.user_name
        };
        // Writing to a String cannot fail.
        let _ = writeln!(text, "Dear {},", name);
        let _ = writeln!(text);
        let _ = writeln!(
            text,
            "Your transaction report for {}:",
            Self::month_title(&request.report_month)
        );
        let _ = writeln!(text, "Total Orders: {}", request.transactions.len());
        let _ = writeln!(text, "Total Amount: {}", total);
        let _ = writeln!(text);
        for transaction in &request.transactions {
            let _ = writeln!(
                text,
                "{}  {}  {}  {}",
                transaction.order_number,
                transaction.order_date.format("%Y-%m-%d"),
                transaction.total_amount,
                transaction.status
            );
            for item in &transaction.items {
                let _ = writeln!(
                    text,
                    "    {} x{} @ {} = {}",
                    item.product_name, item.quantity, item.unit_price, item.total_price
                );
            }
        }

        Ok(RenderedReport {
            subject: format!(
                "Monthly Transaction Report - {}",
                Self::month_title(&request.report_month)
            ),
            body: text.clone(),
            attachment_name: format!(
                "transaction-report-{}.txt",
                request.report_month.format("%Y-%m")
            ),
            attachment: text.into_bytes(),
        })
    }
}

/// Email sender that only logs, for local runs without a provider.
#[derive(Default)]
pub struct LoggingEmailSender;

impl LoggingEmailSender {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EmailSender for LoggingEmailSender {
    async fn send_with_attachment(
        &self,
        to: &str,
        report: &RenderedReport,
    ) -> Result<(), EmailError> {
        info!(
            to,
            subject = %report.subject,
            attachment = %report.attachment_name,
            bytes = report.attachment.len(),
            "email sent (logging sender)"
        );
        Ok(())
    }
}
