//! End-to-end decisioning scenarios.
//!
//! Tests cover: rule priority, rule override over score, score fallback
//! thresholds, degraded scoring, automated actions, and alert gating.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use txdesk_core::{
    config::DeskConfig,
    engine::IngestEngine,
    event::{TransactionEvent, TransactionPayload},
    scoring::{RiskPrediction, Scorer, ScoringFeatures, FALLBACK_REASON},
    snapshot::SnapshotFilter,
    store::DeskStore,
    types::{AlertStatus, RuleAction, Severity, TransactionStatus},
};

/// Always answers with the same score.
struct FixedScorer(f64);

impl Scorer for FixedScorer {
    fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
        Ok(RiskPrediction {
            score: self.0,
            confidence: 0.7,
            reason: format!("fixed {}", self.0),
        })
    }
}

struct BrokenScorer;

impl Scorer for BrokenScorer {
    fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
        anyhow::bail!("model not loaded")
    }
}

struct SlowScorer;

impl Scorer for SlowScorer {
    fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
        thread::sleep(Duration::from_millis(300));
        Ok(RiskPrediction { score: 999.0, confidence: 1.0, reason: "late".into() })
    }
}

fn engine_with(scorer: Arc<dyn Scorer>) -> IngestEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = DeskStore::in_memory().unwrap();
    store.migrate().unwrap();
    let mut config = DeskConfig::default_test();
    config.scoring_timeout = Duration::from_millis(50);
    IngestEngine::with_scorer(store, config, scorer)
}

fn event(event_id: &str, amount: f64, ip: &str, device: &str, location: &str) -> TransactionEvent {
    let mut txn = TransactionPayload::new(&format!("tx-{event_id}"), "alice", amount);
    txn.merchant = "m".into();
    txn.ip_address = ip.into();
    txn.device_id = device.into();
    txn.location = location.into();
    txn.location_change_speed = Some(0.3);
    TransactionEvent::new(event_id, "gateway", txn)
}

fn status_of(engine: &IngestEngine, event_id: &str) -> TransactionStatus {
    let txn_id = engine.get_event(event_id).unwrap().unwrap().transaction_id.unwrap();
    engine.get_transaction(&txn_id).unwrap().unwrap().0.status
}

#[test]
fn high_amount_from_risky_geo_is_blocked() {
    let engine = IngestEngine::build_test().unwrap();
    engine.ingest(&event("geo", 15_000.0, "45.1.2.3", "iphone_1", "Dubai, UAE")).unwrap();

    assert_eq!(status_of(&engine, "geo"), TransactionStatus::Block);

    let evals = engine.rule_evaluations("geo").unwrap();
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].rule_id, "high_amount_risky_geo");
    assert!(evals[0].matched);

    let action = engine.automated_action("geo").unwrap().expect("automated action");
    assert_eq!(action.action_type, RuleAction::Block);
    assert_eq!(action.status, "EXECUTED");
    assert_eq!(action.details.triggered_rules, vec!["high_amount_risky_geo"]);

    let alert = engine.alert_for_event("geo").unwrap().expect("alert");
    assert_eq!(alert.severity, Severity::High);
    assert_eq!(alert.status, AlertStatus::Open);
    assert_eq!(alert.rule_id, "high_amount_risky_geo");

    let snap = engine.get_snapshot("geo").unwrap().unwrap();
    assert_eq!(snap.transaction_status, TransactionStatus::Block);
    assert_eq!(snap.rule_action, RuleAction::Block);
    assert_eq!(snap.geo_country.as_deref(), Some("UAE"));
    assert_eq!(snap.ip_reputation, "botnet");
    assert_eq!(snap.metrics.reason, "High Amount (Rule-based)");
}

#[test]
fn known_safe_network_allows_without_alert() {
    let engine = IngestEngine::build_test().unwrap();
    engine.ingest(&event("safe", 1_000.0, "66.10.0.5", "iphone_1", "Austin, USA")).unwrap();

    assert_eq!(status_of(&engine, "safe"), TransactionStatus::Allow);
    let evals = engine.rule_evaluations("safe").unwrap();
    assert_eq!(evals.len(), 1);
    assert_eq!(evals[0].rule_id, "known_safe_network");
    assert!(engine.automated_action("safe").unwrap().is_none());
    assert!(engine.alert_for_event("safe").unwrap().is_none());

    let snap = engine.get_snapshot("safe").unwrap().unwrap();
    assert_eq!(snap.rule_action, RuleAction::Allow);
    assert_eq!(snap.rule_ids, vec!["known_safe_network"]);
}

#[test]
fn block_wins_over_challenge_and_over_low_score() {
    let engine = engine_with(Arc::new(FixedScorer(0.0)));
    engine
        .ingest(&event("both", 15_000.0, "45.1.2.3", "jailbreak_7", "Mumbai, India"))
        .unwrap();

    assert_eq!(status_of(&engine, "both"), TransactionStatus::Block);
    let evals = engine.rule_evaluations("both").unwrap();
    let ids: Vec<_> = evals.iter().map(|r| r.rule_id.as_str()).collect();
    assert_eq!(ids, vec!["high_amount_risky_geo", "device_change_high_value"]);

    let action = engine.automated_action("both").unwrap().unwrap();
    assert_eq!(action.action_type, RuleAction::Block);
    assert_eq!(action.details.reason, "Large transaction sourced from a monitored geography and risky IP.");
    assert_eq!(action.details.triggered_rules.len(), 2);

    let alert = engine.alert_for_event("both").unwrap().unwrap();
    assert_eq!(alert.severity, Severity::High);
}

#[test]
fn challenge_rule_beats_high_score() {
    let engine = engine_with(Arc::new(FixedScorer(999.0)));
    let mut e = event("velo", 1_000.0, "10.0.0.1", "iphone_1", "Austin, USA");
    e.transaction.transaction_frequency = Some(30);
    engine.ingest(&e).unwrap();

    assert_eq!(status_of(&engine, "velo"), TransactionStatus::Challenge);
    let alert = engine.alert_for_event("velo").unwrap().unwrap();
    assert_eq!(alert.severity, Severity::Medium);
    assert_eq!(alert.rule_id, "velocity_spike");
}

#[test]
fn score_decides_when_no_rule_fires() {
    for (score, expected) in [
        (850.0, TransactionStatus::Block),
        (600.0, TransactionStatus::Challenge),
        (100.0, TransactionStatus::Allow),
    ] {
        let engine = engine_with(Arc::new(FixedScorer(score)));
        engine.ingest(&event("plain", 100.0, "", "", "Paris, France")).unwrap();

        assert_eq!(status_of(&engine, "plain"), expected, "score {score}");
        assert!(engine.rule_evaluations("plain").unwrap().is_empty());
        // No rule intervened: nothing automated, nothing for an analyst.
        assert!(engine.automated_action("plain").unwrap().is_none());
        assert!(engine.alert_for_event("plain").unwrap().is_none());

        let snap = engine.get_snapshot("plain").unwrap().unwrap();
        assert_eq!(snap.rule_action, RuleAction::Allow);
        assert_eq!(snap.risk_score, score);
        assert!(snap.rule_ids.is_empty());
    }
}

#[test]
fn scorer_failure_degrades_to_fallback() {
    let scorers: [Arc<dyn Scorer>; 2] = [Arc::new(BrokenScorer), Arc::new(SlowScorer)];
    for scorer in scorers {
        let engine = engine_with(scorer);
        let resp = engine.ingest(&event("deg", 100.0, "", "", "Paris, France")).unwrap();

        let (txn, score) = engine
            .get_transaction(resp.transaction_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(txn.status, TransactionStatus::Allow);
        assert_eq!(score.score, 0.0);
        assert_eq!(score.confidence, 0.0);
        assert_eq!(score.reason, FALLBACK_REASON);
    }
}

#[test]
fn snapshot_queries_filter_and_order() {
    let engine = IngestEngine::build_test().unwrap();
    engine.ingest(&event("q1", 15_000.0, "45.1.2.3", "iphone_1", "Dubai, UAE")).unwrap();
    engine.ingest(&event("q2", 1_000.0, "66.10.0.5", "iphone_1", "Austin, USA")).unwrap();
    engine.ingest(&event("q3", 12_000.0, "91.0.0.9", "iphone_1", "Sao Paulo, Brazil")).unwrap();

    let all = engine.query_snapshots(&SnapshotFilter::default()).unwrap();
    let order: Vec<_> = all.iter().map(|s| s.event_id.as_str()).collect();
    assert_eq!(order, vec!["q3", "q2", "q1"], "newest first");

    let blocked = engine
        .query_snapshots(&SnapshotFilter {
            status: Some(TransactionStatus::Block),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(blocked.len(), 2);

    let uae = engine
        .query_snapshots(&SnapshotFilter {
            country: Some("uae".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(uae.len(), 1);
    assert_eq!(uae[0].event_id, "q1");

    let by_rule = engine
        .query_snapshots(&SnapshotFilter {
            rule_id: Some("known_safe_network".into()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(by_rule.len(), 1);
    assert_eq!(by_rule[0].event_id, "q2");

    let limited = engine
        .query_snapshots(&SnapshotFilter {
            action: Some(RuleAction::Block),
            limit: Some(1),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].event_id, "q3");
}
