use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// Routing keys are stable API contracts between services; changing their
// syntax is a breaking change requiring coordinated deployment.
pub const ORDER_CREATED: &str = "order.created";
pub const CART_ITEM_ADDED: &str = "cart.item.added";
pub const CART_ITEM_UPDATED: &str = "cart.item.updated";
pub const CART_ITEM_REMOVED: &str = "cart.item.removed";
pub const CART_CLEARED: &str = "cart.cleared";
pub const USER_REGISTERED: &str = "user.registered";
pub const USER_LOGGED_IN: &str = "user.logged_in";
pub const EMAIL_MONTHLY_REPORT: &str = "email.monthly.report";

/// The closed, documented routing-key vocabulary of the platform.
pub const VOCABULARY: &[&str] = &[
    ORDER_CREATED,
    CART_ITEM_ADDED,
    CART_ITEM_UPDATED,
    CART_ITEM_REMOVED,
    CART_CLEARED,
    USER_REGISTERED,
    USER_LOGGED_IN,
    EMAIL_MONTHLY_REPORT,
];

/// Errors raised when parsing a routing key
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoutingKeyError {
    /// The routing key was empty
    #[error("routing key must not be empty")]
    Empty,
    /// A dot-delimited segment was empty (leading, trailing or doubled dot)
    #[error("routing key has an empty segment: {0}")]
    EmptySegment(String),
}

/// A validated, dot-delimited topic string (e.g. `order.created`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Parses and validates a routing key: non-empty, dot-delimited tokens,
    /// none of them empty.
    pub fn parse(raw: &str) -> Result<Self, RoutingKeyError> {
        if raw.is_empty() {
            return Err(RoutingKeyError::Empty);
        }
        if raw.split('.').any(str::is_empty) {
            return Err(RoutingKeyError::EmptySegment(raw.to_owned()));
        }
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = RoutingKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}

/// An AMQP topic binding pattern.
///
/// `*` substitutes for exactly one word, `#` for zero or more words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingPattern(String);

impl BindingPattern {
    pub fn new(pattern: &str) -> Self {
        Self(pattern.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a routing key matches this pattern.
    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&pattern, &key)
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            // `#` consumes zero words, or one word and stays in play.
            match_words(&pattern[1..], key)
                || (!key.is_empty() && match_words(pattern, &key[1..]))
        }
        Some(&word) => match key.first() {
            Some(&first) if word == "*" || word == first => {
                match_words(&pattern[1..], &key[1..])
            }
            _ => false,
        },
    }
}
