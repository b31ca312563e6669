//! Event snapshots and daily metrics: the read-side system of record.
//!
//! A snapshot is written once, at the end of a successful attempt, and
//! never rewritten. A later manual override changes the transaction row
//! but leaves the snapshot describing the state the pipeline produced.

use crate::{
    decision::Decision,
    enrichment::EnrichmentContext,
    event::TransactionPayload,
    scoring::RiskPrediction,
    types::{EventId, RuleAction, TransactionId, TransactionStatus},
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Small metrics bundle carried on each snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetrics {
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSnapshot {
    pub event_id: EventId,
    pub transaction_id: TransactionId,
    pub transaction_status: TransactionStatus,
    pub risk_score: f64,
    pub amount: f64,
    pub currency: String,
    pub geo_country: Option<String>,
    pub geo_city: Option<String>,
    pub device_type: String,
    pub ip_reputation: String,
    pub ip_risk_score: f64,
    pub rule_action: RuleAction,
    pub rule_ids: Vec<String>,
    pub metrics: SnapshotMetrics,
    pub created_at: DateTime<Utc>,
}

impl EventSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        event_id: &str,
        transaction_id: &str,
        status: TransactionStatus,
        txn: &TransactionPayload,
        ctx: &EnrichmentContext,
        decision: &Decision,
        prediction: &RiskPrediction,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.to_string(),
            transaction_id: transaction_id.to_string(),
            transaction_status: status,
            risk_score: prediction.score,
            amount: txn.amount,
            currency: txn.currency.clone(),
            geo_country: ctx.geo_country.clone(),
            geo_city: ctx.geo_city.clone(),
            device_type: ctx.device_type.clone(),
            ip_reputation: ctx.ip_reputation.clone(),
            ip_risk_score: ctx.ip_risk_score,
            rule_action: decision.action,
            rule_ids: decision.triggered_rule_ids.clone(),
            metrics: SnapshotMetrics {
                confidence: prediction.confidence,
                reason: prediction.reason.clone(),
            },
            created_at,
        }
    }
}

/// Filter for `query_snapshots`. Unset fields do not constrain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFilter {
    pub status: Option<TransactionStatus>,
    pub action: Option<RuleAction>,
    /// Matched case-insensitively.
    pub country: Option<String>,
    /// Snapshots whose triggered rule list contains this id.
    pub rule_id: Option<String>,
    pub limit: Option<usize>,
}

pub const DEFAULT_QUERY_LIMIT: usize = 100;

impl SnapshotFilter {
    pub fn limit_or_default(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_QUERY_LIMIT)
    }
}

/// One row per UTC calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetric {
    pub metric_date: NaiveDate,
    pub total_events: i64,
    pub blocked_events: i64,
    pub challenged_events: i64,
    pub allowed_events: i64,
    pub avg_amount: f64,
    pub avg_risk_score: f64,
    pub updated_at: DateTime<Utc>,
}

/// Per-status increments for the (blocked, challenged, allowed) buckets.
/// Manual-override statuses never reach the metric path and count nowhere.
pub fn bucket_increments(status: TransactionStatus) -> (i64, i64, i64) {
    match status {
        TransactionStatus::Block => (1, 0, 0),
        TransactionStatus::Challenge => (0, 1, 0),
        TransactionStatus::Allow => (0, 0, 1),
        _ => (0, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enrichment::EnrichmentEngine, reference_data::ReferenceData};

    #[test]
    fn build_denormalizes_decision_and_score() {
        let mut txn = TransactionPayload::new("tx-1", "alice", 42.0);
        txn.location = "Dubai, UAE".into();
        let ctx = EnrichmentEngine::new(ReferenceData::builtin()).enrich(&txn);
        let decision = Decision {
            action: RuleAction::Challenge,
            status_override: Some(TransactionStatus::Challenge),
            reason: "r".into(),
            triggered_rule_ids: vec!["a".into(), "b".into()],
        };
        let prediction = RiskPrediction { score: 12.0, confidence: 0.9, reason: "ok".into() };

        let snap = EventSnapshot::build(
            "evt-1",
            "id-1",
            TransactionStatus::Challenge,
            &txn,
            &ctx,
            &decision,
            &prediction,
            Utc::now(),
        );
        assert_eq!(snap.rule_action, RuleAction::Challenge);
        assert_eq!(snap.rule_ids, vec!["a", "b"]);
        assert_eq!(snap.geo_country.as_deref(), Some("UAE"));
        assert_eq!(snap.metrics.confidence, 0.9);
        assert_eq!(snap.metrics.reason, "ok");
    }

    #[test]
    fn buckets() {
        assert_eq!(bucket_increments(TransactionStatus::Block), (1, 0, 0));
        assert_eq!(bucket_increments(TransactionStatus::Allow), (0, 0, 1));
        assert_eq!(bucket_increments(TransactionStatus::Pending), (0, 0, 0));
    }
}
