//! Decision resolver: reduces rule hits to one disposition.
//!
//! Pure and side-effect free. The winner is the FIRST hit (catalog order)
//! at the highest action priority, BLOCK > CHALLENGE > ALLOW.

use crate::{
    rule_engine::RuleHit,
    types::{RuleAction, TransactionStatus},
};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

pub const NO_RULE_REASON: &str = "No rule triggered.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: RuleAction,
    /// BLOCK/CHALLENGE when a rule intervened; None lets the score decide.
    pub status_override: Option<TransactionStatus>,
    pub reason: String,
    /// Every matched rule id, winner or not, in catalog order.
    pub triggered_rule_ids: Vec<String>,
}

impl Decision {
    pub fn no_rule() -> Self {
        Self {
            action: RuleAction::Allow,
            status_override: None,
            reason: NO_RULE_REASON.to_string(),
            triggered_rule_ids: Vec::new(),
        }
    }
}

pub fn decide(hits: &[RuleHit]) -> Decision {
    // min_by_key keeps the first of equal keys; Reverse turns it into
    // "first hit at the highest priority".
    let Some(top) = hits.iter().min_by_key(|h| Reverse(h.action.priority())) else {
        return Decision::no_rule();
    };

    Decision {
        action: top.action,
        status_override: top.action.is_intervention().then(|| top.action.as_status()),
        reason: top.reason.clone(),
        triggered_rule_ids: hits.iter().map(|h| h.rule_id.clone()).collect(),
    }
}
