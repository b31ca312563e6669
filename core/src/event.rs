//! Inbound events and the ingest response envelope.
//!
//! RULE: An event is validated in full before the engine writes anything.
//! A ValidationFailure never leaves a row behind.

use crate::{
    error::{DeskError, DeskResult},
    types::{EventId, EventStatus, TransactionId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_TYPE_TRANSACTION: &str = "TRANSACTION";
pub const DEFAULT_PRIORITY: &str = "normal";
pub const DEFAULT_CURRENCY: &str = "USD";

pub const MSG_PROCESSED: &str = "Transaction ingested and processed";
pub const MSG_ALREADY_PROCESSED: &str = "Event already processed";

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

/// The transaction embedded in an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub merchant: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    // Optional pre-computed behavioral fields. When present they take
    // precedence over the synthesised per-user baseline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_transaction_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_frequency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_since_last_transaction: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity_flag: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_change: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_change: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_change_speed: Option<f64>,
}

impl TransactionPayload {
    /// Minimal payload; optional fields left empty.
    pub fn new(transaction_id: &str, user_id: &str, amount: f64) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            user_id: user_id.to_string(),
            amount,
            currency: default_currency(),
            merchant: String::new(),
            ip_address: String::new(),
            location: String::new(),
            device_id: String::new(),
            timestamp: None,
            avg_transaction_amount: None,
            transaction_frequency: None,
            days_since_last_transaction: None,
            velocity_flag: None,
            device_change: None,
            ip_change: None,
            location_change_speed: None,
        }
    }
}

/// A structured inbound document carrying one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub event_id: EventId,
    pub source_system: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub ingestion_timestamp: Option<DateTime<Utc>>,
    pub transaction: TransactionPayload,
}

impl TransactionEvent {
    pub fn new(event_id: &str, source_system: &str, transaction: TransactionPayload) -> Self {
        Self {
            event_id: event_id.to_string(),
            source_system: source_system.to_string(),
            channel: None,
            priority: None,
            ingestion_timestamp: None,
            transaction,
        }
    }

    pub fn priority_or_default(&self) -> &str {
        self.priority.as_deref().unwrap_or(DEFAULT_PRIORITY)
    }

    /// Reject malformed payloads before any state mutation.
    pub fn validate(&self) -> DeskResult<()> {
        fn required(field: &str, value: &str) -> DeskResult<()> {
            if value.trim().is_empty() {
                return Err(DeskError::validation(format!("{field} must not be empty")));
            }
            Ok(())
        }

        required("event_id", &self.event_id)?;
        required("source_system", &self.source_system)?;

        let txn = &self.transaction;
        required("transaction.transaction_id", &txn.transaction_id)?;
        required("transaction.user_id", &txn.user_id)?;
        required("transaction.currency", &txn.currency)?;

        if !txn.amount.is_finite() || txn.amount < 0.0 {
            return Err(DeskError::validation(format!(
                "transaction.amount must be a finite, non-negative number (got {})",
                txn.amount
            )));
        }
        if let Some(speed) = txn.location_change_speed {
            if !speed.is_finite() {
                return Err(DeskError::validation(
                    "transaction.location_change_speed must be finite",
                ));
            }
        }
        if let Some(avg) = txn.avg_transaction_amount {
            if !avg.is_finite() || avg < 0.0 {
                return Err(DeskError::validation(
                    "transaction.avg_transaction_amount must be finite and non-negative",
                ));
            }
        }
        Ok(())
    }
}

/// What the caller of `ingest` gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    pub event_id: EventId,
    pub status: EventStatus,
    pub transaction_id: Option<TransactionId>,
    pub message: String,
}
