//! Alert/Case workflow.
//!
//! An alert is seeded from an event's actionable rule hits (CHALLENGE or
//! BLOCK). ALLOW hits are recorded in the trail but raise nothing for an
//! analyst to look at.
//!
//! Alert lifecycle:
//!   OPEN ──assign──▶ IN_PROGRESS ──resolve──▶ RESOLVED
//!     └──────dismiss──────┴──────────────────▶ DISMISSED
//!
//! Assigning opens exactly one case. Case and alert resolution are
//! independent: resolving one never touches the other.

use crate::{
    error::{DeskError, DeskResult},
    rule_engine::RuleHit,
    store::DeskStore,
    types::{AlertStatus, EventId, RecordId, Severity, TransactionId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

/// Values an alert is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSeed {
    pub rule_id: String,
    pub severity: Severity,
    pub reason: String,
}

/// Highest-severity actionable hit; ties go to the earliest in catalog order.
pub fn seed_from_hits(hits: &[RuleHit]) -> Option<AlertSeed> {
    hits.iter()
        .filter(|h| h.action.is_intervention())
        .min_by_key(|h| Reverse(h.severity))
        .map(|h| AlertSeed {
            rule_id: h.rule_id.clone(),
            severity: h.severity,
            reason: h.reason.clone(),
        })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: RecordId,
    pub event_id: EventId,
    pub transaction_id: TransactionId,
    pub rule_id: String,
    pub severity: Severity,
    pub reason: String,
    pub status: AlertStatus,
    pub assigned_to: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: RecordId,
    pub alert_id: RecordId,
    pub analyst: String,
    pub conclusion: Option<String>,
    pub resolution_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CaseRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

fn required<'a>(field: &str, value: &'a str) -> DeskResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DeskError::validation(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}

fn load_alert(store: &DeskStore, alert_id: RecordId) -> DeskResult<AlertRecord> {
    store
        .get_alert(alert_id)?
        .ok_or_else(|| DeskError::not_found("alert", alert_id))
}

/// Check the transition, then compare-and-swap the status.
fn transition(
    store: &DeskStore,
    alert: &AlertRecord,
    next: AlertStatus,
    assigned_to: Option<&str>,
    notes: Option<&str>,
    at: DateTime<Utc>,
) -> DeskResult<()> {
    let invalid = || DeskError::InvalidTransition {
        entity: "alert",
        from: alert.status.to_string(),
        to: next.to_string(),
    };
    if !alert.status.can_transition_to(next) {
        return Err(invalid());
    }
    if store.update_alert_status(alert.id, alert.status, next, assigned_to, notes, at)? != 1 {
        return Err(invalid());
    }
    Ok(())
}

// ── Operations ───────────────────────────────────────────────────

/// OPEN → IN_PROGRESS, opening the alert's case. Both or neither.
pub fn assign_alert(
    store: &DeskStore,
    alert_id: RecordId,
    analyst: &str,
) -> DeskResult<(AlertRecord, CaseRecord)> {
    let analyst = required("analyst", analyst)?;
    store.atomically(|s| {
        let alert = load_alert(s, alert_id)?;
        let now = Utc::now();
        transition(s, &alert, AlertStatus::InProgress, Some(analyst), None, now)?;
        let case_id = s.insert_case(alert_id, analyst, now)?;
        let case = s
            .get_case(case_id)?
            .ok_or_else(|| DeskError::not_found("case", case_id))?;
        log::info!("alert={alert_id} assigned to {analyst}; case={case_id} opened");
        Ok((load_alert(s, alert_id)?, case))
    })
}

/// IN_PROGRESS → RESOLVED. Notes are required.
pub fn resolve_alert(store: &DeskStore, alert_id: RecordId, notes: &str) -> DeskResult<AlertRecord> {
    let notes = required("notes", notes)?;
    store.atomically(|s| {
        let alert = load_alert(s, alert_id)?;
        transition(s, &alert, AlertStatus::Resolved, None, Some(notes), Utc::now())?;
        log::info!("alert={alert_id} resolved");
        load_alert(s, alert_id)
    })
}

/// OPEN | IN_PROGRESS → DISMISSED. Opens no case.
pub fn dismiss_alert(store: &DeskStore, alert_id: RecordId, notes: Option<&str>) -> DeskResult<AlertRecord> {
    store.atomically(|s| {
        let alert = load_alert(s, alert_id)?;
        transition(s, &alert, AlertStatus::Dismissed, None, notes, Utc::now())?;
        log::info!("alert={alert_id} dismissed");
        load_alert(s, alert_id)
    })
}

/// Close a case with a resolution code and conclusion. A case resolves once.
pub fn resolve_case(
    store: &DeskStore,
    case_id: RecordId,
    resolution_code: &str,
    conclusion: &str,
) -> DeskResult<CaseRecord> {
    let code = required("resolution_code", resolution_code)?;
    let conclusion = required("conclusion", conclusion)?;
    store.atomically(|s| {
        let case = s
            .get_case(case_id)?
            .ok_or_else(|| DeskError::not_found("case", case_id))?;
        if case.is_resolved() || s.close_case(case_id, code, conclusion, Utc::now())? != 1 {
            return Err(DeskError::InvalidTransition {
                entity: "case",
                from: "resolved".into(),
                to: "resolved".into(),
            });
        }
        log::info!("case={case_id} resolved with {code}");
        s.get_case(case_id)?
            .ok_or_else(|| DeskError::not_found("case", case_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleAction;

    fn hit(id: &str, severity: Severity, action: RuleAction) -> RuleHit {
        RuleHit {
            rule_id: id.into(),
            rule_name: id.into(),
            severity,
            action,
            reason: format!("{id} reason"),
        }
    }

    #[test]
    fn no_hits_no_alert() {
        assert_eq!(seed_from_hits(&[]), None);
    }

    #[test]
    fn allow_only_hits_raise_nothing() {
        assert_eq!(seed_from_hits(&[hit("safe", Severity::Low, RuleAction::Allow)]), None);
    }

    #[test]
    fn highest_severity_actionable_hit_seeds() {
        let hits = vec![
            hit("safe", Severity::Critical, RuleAction::Allow),
            hit("velocity", Severity::Medium, RuleAction::Challenge),
            hit("geo", Severity::High, RuleAction::Block),
        ];
        let seed = seed_from_hits(&hits).unwrap();
        assert_eq!(seed.rule_id, "geo");
        assert_eq!(seed.severity, Severity::High);
        assert_eq!(seed.reason, "geo reason");
    }

    #[test]
    fn severity_tie_goes_to_first() {
        let hits = vec![
            hit("first", Severity::Medium, RuleAction::Challenge),
            hit("second", Severity::Medium, RuleAction::Challenge),
        ];
        assert_eq!(seed_from_hits(&hits).unwrap().rule_id, "first");
    }
}
