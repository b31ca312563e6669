//! SQLite persistence layer.
//!
//! RULE: Only store/ talks to the database.
//! The engine and the alert workflow call store methods; they never
//! execute SQL directly.
//!
//! Writes that must land together go through `atomically`, which holds a
//! write lock (BEGIN IMMEDIATE) for the whole unit of work. SQLite admits
//! one writer at a time, so a read-modify-write inside `atomically` can
//! never interleave with another connection's.

use crate::{
    enrichment::{DerivedFeatures, EnrichmentContext, Explanations, Signals},
    error::DeskResult,
    reference_data::GeoPoint,
    types::{EventId, EventStatus, RuleAction, Severity, TransactionId, TransactionStatus},
};
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection, Row};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;

mod alert;
mod event;
mod trail;
mod transaction;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct DeskStore {
    conn: Connection,
    path: Option<String>, // None for :memory:, Some(path) for file
    busy_timeout: Duration,
}

impl DeskStore {
    pub fn open(path: &str) -> DeskResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// `busy_timeout` bounds how long a statement waits on another
    /// connection's write lock before failing with SQLITE_BUSY.
    pub fn open_with_timeout(path: &str, busy_timeout: Duration) -> DeskResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI,
        )?;
        // WAL mode only for real files (shared-memory and :memory: ignore it).
        let _ = conn.execute_batch("PRAGMA journal_mode=WAL;");
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.busy_timeout(busy_timeout)?;
        Ok(Self {
            conn,
            path: Some(path.to_string()),
            busy_timeout,
        })
    }

    /// Open an in-memory database (used in tests).
    pub fn in_memory() -> DeskResult<Self> {
        let conn = Connection::open(":memory:")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(Self {
            conn,
            path: None,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        })
    }

    /// Reopen a new connection to the same database.
    /// For in-memory databases, this returns a new in-memory database (isolated).
    /// For file-based databases, this opens the same file.
    pub fn reopen(&self) -> DeskResult<Self> {
        match &self.path {
            Some(p) => Self::open_with_timeout(p, self.busy_timeout),
            None => Self::in_memory(),
        }
    }

    /// Apply all schema migrations in order.
    pub fn migrate(&self) -> DeskResult<()> {
        self.conn
            .execute_batch(include_str!("../../../migrations/001_ingestion.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/002_transactions.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/003_decision_trail.sql"))?;
        self.conn
            .execute_batch(include_str!("../../../migrations/004_alerts_cases.sql"))?;
        Ok(())
    }

    // ── Unit of work ───────────────────────────────────────────

    /// Run `f` inside BEGIN IMMEDIATE … COMMIT. Any error from `f` or from
    /// COMMIT rolls the whole unit back and is returned unchanged.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> DeskResult<T>) -> DeskResult<T> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        let outcome = f(self).and_then(|value| {
            self.conn.execute_batch("COMMIT")?;
            Ok(value)
        });
        if outcome.is_err() && !self.conn.is_autocommit() {
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                log::error!("rollback failed: {e}");
            }
        }
        outcome
    }

    /// Nested all-or-nothing block. Usable inside or outside `atomically`.
    pub fn savepoint<T>(&self, name: &str, f: impl FnOnce(&Self) -> DeskResult<T>) -> DeskResult<T> {
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch(&format!("RELEASE {name}"))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rb) = self
                    .conn
                    .execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))
                {
                    log::error!("rollback to savepoint {name} failed: {rb}");
                }
                Err(e)
            }
        }
    }

    /// Escape hatch for tests that need to tamper with the schema
    /// (e.g. install a failing trigger) or hold the write lock.
    #[cfg(any(test, feature = "test-util"))]
    pub fn execute_batch(&self, sql: &str) -> DeskResult<()> {
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    /// Row count of any table. Test helper.
    #[cfg(any(test, feature = "test-util"))]
    pub fn count_rows(&self, table: &str) -> DeskResult<i64> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(crate::error::DeskError::validation(format!("bad table name '{table}'")));
        }
        let n = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
        Ok(n)
    }
}

// ── Column helpers ───────────────────────────────────────────────

/// Read a JSON text column into `T`.
fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

// ── Row types ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestedEventRecord {
    pub id: i64,
    pub event_id: EventId,
    pub source_system: String,
    pub channel: Option<String>,
    pub priority: String,
    pub event_type: String,
    /// The inbound document as received.
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub processing_error: Option<String>,
    pub transaction_id: Option<TransactionId>,
    /// Number of claims taken; the current attempt's claim token.
    pub attempts: i64,
    pub claimed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

fn map_event(row: &Row<'_>) -> rusqlite::Result<IngestedEventRecord> {
    Ok(IngestedEventRecord {
        id: row.get(0)?,
        event_id: row.get(1)?,
        source_system: row.get(2)?,
        channel: row.get(3)?,
        priority: row.get(4)?,
        event_type: row.get(5)?,
        payload: json_col(row, 6)?,
        status: row.get(7)?,
        processing_error: row.get(8)?,
        transaction_id: row.get(9)?,
        attempts: row.get(10)?,
        claimed_at: row.get(11)?,
        received_at: row.get(12)?,
        processed_at: row.get(13)?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedContextRecord {
    pub id: i64,
    pub event_id: EventId,
    pub transaction_id: Option<TransactionId>,
    pub context: EnrichmentContext,
    pub created_at: DateTime<Utc>,
}

fn map_enriched_context(row: &Row<'_>) -> rusqlite::Result<EnrichedContextRecord> {
    let lat: Option<f64> = row.get(6)?;
    let lon: Option<f64> = row.get(7)?;
    let signals: Signals = json_col(row, 13)?;
    let derived_features: DerivedFeatures = json_col(row, 14)?;
    let explanations: Explanations = json_col(row, 15)?;
    Ok(EnrichedContextRecord {
        id: row.get(0)?,
        event_id: row.get(1)?,
        transaction_id: row.get(2)?,
        context: EnrichmentContext {
            geo_country: row.get(3)?,
            geo_city: row.get(4)?,
            geo_coordinates: lat.zip(lon).map(|(lat, lon)| GeoPoint { lat, lon }),
            device_type: row.get(8)?,
            device_risk_level: row.get(9)?,
            ip_reputation: row.get(10)?,
            ip_risk_score: row.get(11)?,
            user_segment: row.get(12)?,
            signals,
            derived_features,
            explanations,
        },
        created_at: row.get(5)?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Internal id (UUID v4).
    pub id: TransactionId,
    /// The caller's transaction identifier.
    pub external_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub merchant: String,
    pub ip_address: String,
    pub location: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn map_transaction(row: &Row<'_>) -> rusqlite::Result<TransactionRecord> {
    Ok(TransactionRecord {
        id: row.get(0)?,
        external_id: row.get(1)?,
        user_id: row.get(2)?,
        amount: row.get(3)?,
        currency: row.get(4)?,
        merchant: row.get(5)?,
        ip_address: row.get(6)?,
        location: row.get(7)?,
        device_id: row.get(8)?,
        timestamp: row.get(9)?,
        status: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScoreRecord {
    pub id: i64,
    pub transaction_id: TransactionId,
    pub score: f64,
    pub confidence: f64,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluationRecord {
    pub id: i64,
    pub event_id: EventId,
    pub transaction_id: Option<TransactionId>,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub action: RuleAction,
    pub reason: String,
    pub matched: bool,
    pub created_at: DateTime<Utc>,
}

/// JSON body of `automated_action.details`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDetails {
    pub reason: String,
    pub triggered_rules: Vec<String>,
}

pub const ACTION_STATUS_EXECUTED: &str = "EXECUTED";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomatedActionRecord {
    pub id: i64,
    pub event_id: EventId,
    pub transaction_id: Option<TransactionId>,
    pub action_type: RuleAction,
    pub status: String,
    pub details: ActionDetails,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}
