//! Transaction disposition: rules first, score as the backstop.

use crate::{decision::Decision, scoring::RiskPrediction, types::TransactionStatus};
use serde::{Deserialize, Serialize};

const BLOCK_SCORE: f64 = 800.0;
const CHALLENGE_SCORE: f64 = 500.0;

/// A rule override always wins. Only events that no rule intervened on
/// fall through to the score thresholds.
pub fn resolve_status(decision: &Decision, prediction: &RiskPrediction) -> TransactionStatus {
    if let Some(status) = decision.status_override {
        return status;
    }
    status_from_score(prediction.score)
}

pub fn status_from_score(score: f64) -> TransactionStatus {
    if score > BLOCK_SCORE {
        TransactionStatus::Block
    } else if score > CHALLENGE_SCORE {
        TransactionStatus::Challenge
    } else {
        TransactionStatus::Allow
    }
}

// ── Manual override ──────────────────────────────────────────────────────────

/// Analyst decision on a settled transaction. Approve is the "unblock" path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManualOverride {
    Approve,
    Reject,
}

impl ManualOverride {
    pub fn target_status(self) -> TransactionStatus {
        match self {
            Self::Approve => TransactionStatus::Approved,
            Self::Reject => TransactionStatus::Rejected,
        }
    }
}

/// Only a pipeline disposition (ALLOW/CHALLENGE/BLOCK) can be overridden.
/// PENDING has not been decided yet; APPROVED/REJECTED are final.
pub fn override_target(current: TransactionStatus, decision: ManualOverride) -> Option<TransactionStatus> {
    match current {
        TransactionStatus::Allow | TransactionStatus::Challenge | TransactionStatus::Block => {
            Some(decision.target_status())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RuleAction;

    fn prediction(score: f64) -> RiskPrediction {
        RiskPrediction { score, confidence: 0.9, reason: "test".into() }
    }

    #[test]
    fn score_fallback_thresholds() {
        let none = Decision::no_rule();
        assert_eq!(resolve_status(&none, &prediction(850.0)), TransactionStatus::Block);
        assert_eq!(resolve_status(&none, &prediction(600.0)), TransactionStatus::Challenge);
        assert_eq!(resolve_status(&none, &prediction(100.0)), TransactionStatus::Allow);
    }

    #[test]
    fn thresholds_are_strict() {
        assert_eq!(status_from_score(800.0), TransactionStatus::Challenge);
        assert_eq!(status_from_score(500.0), TransactionStatus::Allow);
    }

    #[test]
    fn rule_override_beats_score() {
        let challenge = Decision {
            action: RuleAction::Challenge,
            status_override: Some(TransactionStatus::Challenge),
            reason: "r".into(),
            triggered_rule_ids: vec!["r".into()],
        };
        assert_eq!(resolve_status(&challenge, &prediction(999.0)), TransactionStatus::Challenge);
        assert_eq!(resolve_status(&challenge, &prediction(0.0)), TransactionStatus::Challenge);
    }

    #[test]
    fn override_only_from_pipeline_dispositions() {
        use TransactionStatus::*;
        assert_eq!(override_target(Block, ManualOverride::Approve), Some(Approved));
        assert_eq!(override_target(Challenge, ManualOverride::Reject), Some(Rejected));
        assert_eq!(override_target(Allow, ManualOverride::Reject), Some(Rejected));
        assert_eq!(override_target(Pending, ManualOverride::Approve), None);
        assert_eq!(override_target(Approved, ManualOverride::Reject), None);
        assert_eq!(override_target(Rejected, ManualOverride::Approve), None);
    }
}
