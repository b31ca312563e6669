//! Shared primitive types used across the pipeline.
//!
//! Every status-like enum is persisted as its upper/lower-case text form,
//! so the same string appears in SQLite, in JSON bundles, and in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Externally supplied event identifier (unique per ingested event).
pub type EventId = String;

/// Internally generated transaction identifier (UUID v4 text).
pub type TransactionId = String;

/// Row id of an alert or a case.
pub type RecordId = i64;

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        "unknown {} value '{}'", stringify!($name), other
                    )),
                }
            }
        }

        impl rusqlite::ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
                Ok(rusqlite::types::ToSqlOutput::from(self.as_str()))
            }
        }

        impl rusqlite::types::FromSql for $name {
            fn column_result(
                value: rusqlite::types::ValueRef<'_>,
            ) -> rusqlite::types::FromSqlResult<Self> {
                let text = value.as_str()?;
                text.parse()
                    .map_err(|e: String| rusqlite::types::FromSqlError::Other(e.into()))
            }
        }
    };
}

// ── Ingested event lifecycle ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

text_enum!(EventStatus {
    Received => "RECEIVED",
    Processing => "PROCESSING",
    Processed => "PROCESSED",
    Failed => "FAILED",
});

// ── Transaction disposition ────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Allow,
    Challenge,
    Block,
    /// Manual override: analyst force-approved.
    Approved,
    /// Manual override: analyst rejected.
    Rejected,
}

text_enum!(TransactionStatus {
    Pending => "PENDING",
    Allow => "ALLOW",
    Challenge => "CHALLENGE",
    Block => "BLOCK",
    Approved => "APPROVED",
    Rejected => "REJECTED",
});

// ── Rule actions ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleAction {
    Allow,
    Challenge,
    Block,
}

text_enum!(RuleAction {
    Allow => "ALLOW",
    Challenge => "CHALLENGE",
    Block => "BLOCK",
});

impl RuleAction {
    /// Severity priority: BLOCK > CHALLENGE > ALLOW.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Allow => 1,
            Self::Challenge => 2,
            Self::Block => 3,
        }
    }

    /// CHALLENGE and BLOCK intervene on the transaction; ALLOW does not.
    pub fn is_intervention(&self) -> bool {
        !matches!(self, Self::Allow)
    }

    pub fn as_status(&self) -> TransactionStatus {
        match self {
            Self::Allow => TransactionStatus::Allow,
            Self::Challenge => TransactionStatus::Challenge,
            Self::Block => TransactionStatus::Block,
        }
    }
}

// ── Rule severity ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

// ── Alert lifecycle ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    Open,
    InProgress,
    Resolved,
    Dismissed,
}

text_enum!(AlertStatus {
    Open => "OPEN",
    InProgress => "IN_PROGRESS",
    Resolved => "RESOLVED",
    Dismissed => "DISMISSED",
});

impl AlertStatus {
    /// OPEN → IN_PROGRESS → RESOLVED, with DISMISSED reachable from
    /// OPEN or IN_PROGRESS. RESOLVED and DISMISSED are terminal.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::InProgress)
                | (Self::InProgress, Self::Resolved)
                | (Self::Open, Self::Dismissed)
                | (Self::InProgress, Self::Dismissed)
        )
    }
}
