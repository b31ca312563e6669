//! Rule evaluation: matches a static rule catalog against one
//! (transaction, enrichment) pair.
//!
//! RULES:
//!   - A rule matches when ALL of its conditions hold.
//!   - Every rule is evaluated independently; there is no short-circuit
//!     between rules, so catalog order never changes WHICH rules match.
//!   - Hits are returned in catalog order. Picking a winner is the
//!     decision resolver's job, not this module's.
//!   - A condition type this build does not know deserializes to
//!     `Condition::Unrecognized` and never matches.

use crate::{
    enrichment::EnrichmentContext,
    event::TransactionPayload,
    types::{RuleAction, Severity},
};
use serde::{Deserialize, Serialize};

// ── Catalog types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    AmountGreaterThan { value: f64 },
    AmountLessThan { value: f64 },
    /// Inclusive on both ends.
    AmountBetween { min: f64, max: f64 },
    /// Compared against the upper-cased geo country.
    CountryIn { value: Vec<String> },
    IpRiskAbove { value: f64 },
    IpReputationEquals { value: String },
    VelocityFlagEquals { value: bool },
    DeviceChangeEquals { value: bool },
    UserSegmentIn { value: Vec<String> },
    #[serde(other)]
    Unrecognized,
}

impl Condition {
    pub fn matches(&self, txn: &TransactionPayload, ctx: &EnrichmentContext) -> bool {
        match self {
            Self::AmountGreaterThan { value } => txn.amount > *value,
            Self::AmountLessThan { value } => txn.amount < *value,
            Self::AmountBetween { min, max } => *min <= txn.amount && txn.amount <= *max,
            Self::CountryIn { value } => {
                let country = ctx.geo_country.as_deref().unwrap_or_default().to_uppercase();
                value.iter().any(|c| c.to_uppercase() == country)
            }
            Self::IpRiskAbove { value } => ctx.ip_risk_score > *value,
            Self::IpReputationEquals { value } => ctx.ip_reputation == *value,
            Self::VelocityFlagEquals { value } => ctx.derived_features.velocity_flag == *value,
            Self::DeviceChangeEquals { value } => ctx.derived_features.device_change == *value,
            Self::UserSegmentIn { value } => value.iter().any(|s| *s == ctx.user_segment),
            Self::Unrecognized => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub severity: Severity,
    pub action: RuleAction,
    pub reason: String,
    pub conditions: Vec<Condition>,
}

impl Rule {
    /// A rule with no conditions never matches; an empty conjunction
    /// would otherwise fire on every event.
    pub fn matches(&self, txn: &TransactionPayload, ctx: &EnrichmentContext) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.matches(txn, ctx))
    }
}

/// One fully matched rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleHit {
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub action: RuleAction,
    pub reason: String,
}

impl From<&Rule> for RuleHit {
    fn from(rule: &Rule) -> Self {
        Self {
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            action: rule.action,
            reason: rule.reason.clone(),
        }
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleCatalog {
    pub rules: Vec<Rule>,
}

impl RuleCatalog {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn evaluate(&self, txn: &TransactionPayload, ctx: &EnrichmentContext) -> Vec<RuleHit> {
        let hits: Vec<RuleHit> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(txn, ctx))
            .map(RuleHit::from)
            .collect();
        log::debug!(
            "txn={} matched {} of {} rules",
            txn.transaction_id,
            hits.len(),
            self.rules.len()
        );
        hits
    }

    /// Rules that carry at least one condition this build does not know.
    /// They can never match; surfaced at startup so a typo is not silent.
    pub fn rules_with_unrecognized_conditions(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.conditions.iter().any(|c| *c == Condition::Unrecognized))
            .map(|r| r.id.as_str())
            .collect()
    }

    /// The compiled-in catalog. Kept identical to `data/rules/rule_catalog.json`.
    pub fn builtin() -> Self {
        Self::new(vec![
            Rule {
                id: "high_amount_risky_geo".into(),
                name: "High Amount from Risky Geo".into(),
                severity: Severity::High,
                action: RuleAction::Block,
                reason: "Large transaction sourced from a monitored geography and risky IP.".into(),
                conditions: vec![
                    Condition::AmountGreaterThan { value: 10_000.0 },
                    Condition::CountryIn {
                        value: vec!["UAE".into(), "BRAZIL".into(), "INDIA".into()],
                    },
                    Condition::IpRiskAbove { value: 0.7 },
                ],
            },
            Rule {
                id: "velocity_spike".into(),
                name: "Velocity Spike".into(),
                severity: Severity::Medium,
                action: RuleAction::Challenge,
                reason: "Customer velocity exceeded baseline thresholds.".into(),
                conditions: vec![
                    Condition::VelocityFlagEquals { value: true },
                    Condition::AmountBetween { min: 500.0, max: 5_000.0 },
                ],
            },
            Rule {
                id: "device_change_high_value".into(),
                name: "Device Change on High Value".into(),
                severity: Severity::Medium,
                action: RuleAction::Challenge,
                reason: "High value purchase on unfamiliar device.".into(),
                conditions: vec![
                    Condition::DeviceChangeEquals { value: true },
                    Condition::AmountGreaterThan { value: 3_000.0 },
                ],
            },
            Rule {
                id: "known_safe_network".into(),
                name: "Known Safe Network".into(),
                severity: Severity::Low,
                action: RuleAction::Allow,
                reason: "Traffic originates from vetted partner network.".into(),
                conditions: vec![
                    Condition::IpReputationEquals { value: "trusted_partner".into() },
                    Condition::AmountLessThan { value: 5_000.0 },
                ],
            },
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{enrichment::EnrichmentEngine, reference_data::ReferenceData};

    fn ctx_for(txn: &TransactionPayload) -> EnrichmentContext {
        EnrichmentEngine::new(ReferenceData::builtin()).enrich(txn)
    }

    fn txn(amount: f64, ip: &str, device: &str, location: &str) -> TransactionPayload {
        let mut t = TransactionPayload::new("tx-r", "alice", amount);
        t.ip_address = ip.into();
        t.device_id = device.into();
        t.location = location.into();
        t.location_change_speed = Some(0.3);
        t
    }

    fn ids(hits: &[RuleHit]) -> Vec<&str> {
        hits.iter().map(|h| h.rule_id.as_str()).collect()
    }

    #[test]
    fn known_safe_network_matches() {
        let t = txn(1_000.0, "66.10.0.5", "iphone_1", "Austin, USA");
        let hits = RuleCatalog::builtin().evaluate(&t, &ctx_for(&t));
        assert_eq!(ids(&hits), vec!["known_safe_network"]);
        assert_eq!(hits[0].action, RuleAction::Allow);
    }

    #[test]
    fn risky_geo_needs_all_three_conditions() {
        let catalog = RuleCatalog::builtin();

        let t = txn(15_000.0, "45.1.2.3", "iphone_1", "Dubai, UAE");
        assert_eq!(ids(&catalog.evaluate(&t, &ctx_for(&t))), vec!["high_amount_risky_geo"]);

        // Safe IP: geo + amount alone are not enough.
        let t = txn(15_000.0, "66.1.2.3", "iphone_1", "Dubai, UAE");
        assert!(catalog.evaluate(&t, &ctx_for(&t)).is_empty());

        // Unmonitored country.
        let t = txn(15_000.0, "45.1.2.3", "iphone_1", "Paris, France");
        assert!(catalog.evaluate(&t, &ctx_for(&t)).is_empty());
    }

    #[test]
    fn block_and_challenge_can_both_match() {
        let t = txn(15_000.0, "45.1.2.3", "jailbreak_7", "Mumbai, India");
        let hits = RuleCatalog::builtin().evaluate(&t, &ctx_for(&t));
        assert_eq!(ids(&hits), vec!["high_amount_risky_geo", "device_change_high_value"]);
    }

    #[test]
    fn amount_between_is_inclusive() {
        let mut t = txn(500.0, "", "", "");
        t.transaction_frequency = Some(30);
        let catalog = RuleCatalog::builtin();
        assert_eq!(ids(&catalog.evaluate(&t, &ctx_for(&t))), vec!["velocity_spike"]);
        t.amount = 5_000.0;
        assert_eq!(ids(&catalog.evaluate(&t, &ctx_for(&t))), vec!["velocity_spike"]);
        t.amount = 5_000.01;
        assert!(catalog.evaluate(&t, &ctx_for(&t)).is_empty());
    }

    #[test]
    fn user_segment_condition() {
        let rule = Rule {
            id: "merchant_watch".into(),
            name: "Merchant Watch".into(),
            severity: Severity::Low,
            action: RuleAction::Challenge,
            reason: "Merchant traffic".into(),
            conditions: vec![Condition::UserSegmentIn { value: vec!["merchant".into()] }],
        };
        let catalog = RuleCatalog::new(vec![rule]);
        let mut t = txn(10.0, "", "", "");
        assert!(catalog.evaluate(&t, &ctx_for(&t)).is_empty());
        t.user_id = "merchant-12".into();
        assert_eq!(ids(&catalog.evaluate(&t, &ctx_for(&t))), vec!["merchant_watch"]);
    }

    #[test]
    fn unknown_condition_type_fails_closed() {
        let json = r#"{"rules": [{
            "id": "typo", "name": "Typo", "severity": "high", "action": "BLOCK",
            "reason": "x",
            "conditions": [
                {"type": "amount_greater_than", "value": 0},
                {"type": "amount_greather_than", "value": 0}
            ]
        }]}"#;
        let catalog: RuleCatalog = serde_json::from_str(json).unwrap();
        assert_eq!(catalog.rules[0].conditions[1], Condition::Unrecognized);
        assert_eq!(catalog.rules_with_unrecognized_conditions(), vec!["typo"]);

        let t = txn(100.0, "", "", "");
        assert!(catalog.evaluate(&t, &ctx_for(&t)).is_empty());
    }

    #[test]
    fn rule_without_conditions_never_matches() {
        let catalog = RuleCatalog::new(vec![Rule {
            id: "empty".into(),
            name: "Empty".into(),
            severity: Severity::Low,
            action: RuleAction::Block,
            reason: String::new(),
            conditions: vec![],
        }]);
        let t = txn(1.0, "", "", "");
        assert!(catalog.evaluate(&t, &ctx_for(&t)).is_empty());
    }

    #[test]
    fn evaluation_is_order_independent() {
        let t = txn(15_000.0, "45.1.2.3", "jailbreak_7", "Mumbai, India");
        let ctx = ctx_for(&t);
        let forward = RuleCatalog::builtin();
        let mut reversed = forward.clone();
        reversed.rules.reverse();

        let mut a = ids(&forward.evaluate(&t, &ctx)).into_iter().map(String::from).collect::<Vec<_>>();
        let mut b = ids(&reversed.evaluate(&t, &ctx)).into_iter().map(String::from).collect::<Vec<_>>();
        a.sort();
        b.sort();
        assert_eq!(a, b);
    }
}
