//--------------------------------------------------------------------------------------------------
// STRUCTS & ENUMS
//--------------------------------------------------------------------------------------------------
// | Name                    | Description                                       | Key Methods       |
// |-------------------------|---------------------------------------------------|-------------------|
// | DomainEvent             | Event variants published by the platform services | routing_key       |
// | MonthlyReportRequested  | Payload for the email service's report consumer   |                   |
//--------------------------------------------------------------------------------------------------

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::envelope::{DecodeError, Envelope};
use super::routing::{self, RoutingKey};

/// Published after an order's local write has committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    #[serde(default)]
    pub order_number: String,
    pub user_id: String,
    pub total_amount: Decimal,
    #[serde(default)]
    pub status: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

/// Payload shared by `cart.item.added` and `cart.item.updated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemChange {
    pub user_id: String,
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemRemoved {
    pub user_id: String,
    pub product_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartCleared {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRegistered {
    pub user_id: String,
    pub email: String,
    #[serde(default)]
    pub user_name: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLoggedIn {
    pub user_id: String,
    pub email: String,
    pub logged_in_at: DateTime<Utc>,
}

/// One line of a transaction report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOrderItem {
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub total_price: Decimal,
}

/// One order summarized in a monthly report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionSummary {
    pub order_number: String,
    pub order_date: DateTime<Utc>,
    pub total_amount: Decimal,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub items: Vec<ReportOrderItem>,
}

/// Asks the email service to render and send one user's monthly report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyReportRequested {
    pub user_id: String,
    pub user_email: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub transactions: Vec<TransactionSummary>,
    pub report_month: DateTime<Utc>,
}

/// Events published by the platform services after their local writes commit.
///
/// A published event is an immutable fact about something that already
/// happened; it is never retracted.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    OrderCreated(OrderCreated),
    CartItemAdded(CartItemChange),
    CartItemUpdated(CartItemChange),
    CartItemRemoved(CartItemRemoved),
    CartCleared(CartCleared),
    UserRegistered(UserRegistered),
    UserLoggedIn(UserLoggedIn),
    MonthlyReportRequested(MonthlyReportRequested),
}

impl DomainEvent {
    /// The routing key this event is published under.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::OrderCreated(_) => routing::ORDER_CREATED,
            Self::CartItemAdded(_) => routing::CART_ITEM_ADDED,
            Self::CartItemUpdated(_) => routing::CART_ITEM_UPDATED,
            Self::CartItemRemoved(_) => routing::CART_ITEM_REMOVED,
            Self::CartCleared(_) => routing::CART_CLEARED,
            Self::UserRegistered(_) => routing::USER_REGISTERED,
            Self::UserLoggedIn(_) => routing::USER_LOGGED_IN,
            Self::MonthlyReportRequested(_) => routing::EMAIL_MONTHLY_REPORT,
        }
    }

    /// The event payload as a JSON tree.
    pub fn payload(&self) -> serde_json::Value {
        // Safe to unwrap: every payload is a plain struct of JSON-friendly fields
        match self {
            Self::OrderCreated(p) => serde_json::to_value(p).unwrap(),
            Self::CartItemAdded(p) => serde_json::to_value(p).unwrap(),
            Self::CartItemUpdated(p) => serde_json::to_value(p).unwrap(),
            Self::CartItemRemoved(p) => serde_json::to_value(p).unwrap(),
            Self::CartCleared(p) => serde_json::to_value(p).unwrap(),
            Self::UserRegistered(p) => serde_json::to_value(p).unwrap(),
            Self::UserLoggedIn(p) => serde_json::to_value(p).unwrap(),
            Self::MonthlyReportRequested(p) => serde_json::to_value(p).unwrap(),
        }
    }

    /// Wraps the event in a fresh persistent envelope.
    pub fn to_envelope(&self) -> Envelope {
        // Safe to unwrap: vocabulary keys are valid by construction
        let key = RoutingKey::parse(self.routing_key()).unwrap();
        Envelope::new(key, self.payload())
    }

    /// Decodes the typed event out of an envelope, dispatching on routing key.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DecodeError> {
        match envelope.routing_key.as_str() {
            routing::ORDER_CREATED => envelope.payload_as().map(Self::OrderCreated),
            routing::CART_ITEM_ADDED => envelope.payload_as().map(Self::CartItemAdded),
            routing::CART_ITEM_UPDATED => envelope.payload_as().map(Self::CartItemUpdated),
            routing::CART_ITEM_REMOVED => envelope.payload_as().map(Self::CartItemRemoved),
            routing::CART_CLEARED => envelope.payload_as().map(Self::CartCleared),
            routing::USER_REGISTERED => envelope.payload_as().map(Self::UserRegistered),
            routing::USER_LOGGED_IN => envelope.payload_as().map(Self::UserLoggedIn),
            routing::EMAIL_MONTHLY_REPORT => {
                envelope.payload_as().map(Self::MonthlyReportRequested)
            }
            other => Err(DecodeError {
                reason: format!("routing key outside the event vocabulary: {}", other),
                raw: envelope.payload.to_string().into_bytes(),
            }),
        }
    }
}
