//! Scoring collaborator: the opaque risk scorer and its degraded mode.
//!
//! The engine never lets the scorer abort an ingest: an error, a panic,
//! a non-finite answer or a missed deadline all become `fallback()`.
//!
//! A call that misses its deadline is abandoned, not cancelled: the worker
//! thread runs to completion and its late answer is dropped.

use crate::{enrichment::EnrichmentContext, event::TransactionPayload, rng::stable_seed};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

pub const MAX_SCORE: f64 = 1000.0;
pub const FALLBACK_REASON: &str = "Scoring unavailable (degraded fallback)";

/// What the scorer sees: the raw transaction plus the derived features.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringFeatures {
    pub transaction_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub merchant: String,
    pub ip_risk_score: f64,
    pub avg_transaction_amount: f64,
    pub transaction_frequency: i64,
    pub days_since_last_transaction: i64,
    pub velocity_flag: bool,
    pub device_change: bool,
    pub ip_change: bool,
    pub location_change_speed: f64,
}

impl ScoringFeatures {
    pub fn from_parts(txn: &TransactionPayload, ctx: &EnrichmentContext) -> Self {
        let f = &ctx.derived_features;
        Self {
            transaction_id: txn.transaction_id.clone(),
            user_id: txn.user_id.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            merchant: txn.merchant.clone(),
            ip_risk_score: ctx.ip_risk_score,
            avg_transaction_amount: f.avg_transaction_amount,
            transaction_frequency: f.transaction_frequency,
            days_since_last_transaction: f.days_since_last_transaction,
            velocity_flag: f.velocity_flag,
            device_change: f.device_change,
            ip_change: f.ip_change,
            location_change_speed: f.location_change_speed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPrediction {
    /// 0..=1000
    pub score: f64,
    /// 0.0..=1.0
    pub confidence: f64,
    pub reason: String,
}

impl RiskPrediction {
    pub fn fallback() -> Self {
        Self {
            score: 0.0,
            confidence: 0.0,
            reason: FALLBACK_REASON.to_string(),
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.reason == FALLBACK_REASON
    }

    /// Clamp into range; None if either number is not finite.
    fn sanitized(self) -> Option<Self> {
        if !self.score.is_finite() || !self.confidence.is_finite() {
            return None;
        }
        Some(Self {
            score: self.score.clamp(0.0, MAX_SCORE),
            confidence: self.confidence.clamp(0.0, 1.0),
            reason: self.reason,
        })
    }
}

/// The contract an external risk model fulfils.
pub trait Scorer: Send + Sync {
    fn predict(&self, features: &ScoringFeatures) -> anyhow::Result<RiskPrediction>;
}

/// A scorer behind a deadline and a cap on concurrent calls.
///
/// Each call runs on its own thread. A call that misses its deadline keeps
/// its slot until the thread finishes, so a hung model can pin at most
/// `max_in_flight` threads; once they are all taken, scoring degrades to
/// the fallback without spawning.
#[derive(Clone)]
pub struct BoundedScorer {
    scorer: Arc<dyn Scorer>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
}

/// One occupied slot; released when the scoring thread drops it.
struct InFlightSlot(Arc<AtomicUsize>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BoundedScorer {
    pub fn new(scorer: Arc<dyn Scorer>, max_in_flight: usize) -> Self {
        Self {
            scorer,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Scorer threads currently running, abandoned ones included.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn try_acquire(&self) -> Option<InFlightSlot> {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()?;
        Some(InFlightSlot(Arc::clone(&self.in_flight)))
    }

    /// Call the scorer on a worker thread and wait at most `timeout`.
    /// Always returns a usable prediction.
    pub fn score(&self, features: &ScoringFeatures, timeout: Duration) -> RiskPrediction {
        let Some(slot) = self.try_acquire() else {
            log::warn!(
                "txn={} {} scorer calls still running; using fallback",
                features.transaction_id,
                self.max_in_flight
            );
            return RiskPrediction::fallback();
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let worker_scorer = Arc::clone(&self.scorer);
        let worker_features = features.clone();

        let spawned = thread::Builder::new()
            .name("txdesk-scorer".into())
            .spawn(move || {
                let _slot = slot;
                // Receiver may be gone after a timeout; a failed send is expected then.
                let _ = tx.send(worker_scorer.predict(&worker_features));
            });
        if let Err(e) = spawned {
            log::warn!("txn={} scorer thread not started: {e}", features.transaction_id);
            return RiskPrediction::fallback();
        }

        match rx.recv_timeout(timeout) {
            Ok(Ok(prediction)) => match prediction.sanitized() {
                Some(p) => p,
                None => {
                    log::warn!(
                        "txn={} scorer returned a non-finite prediction; using fallback",
                        features.transaction_id
                    );
                    RiskPrediction::fallback()
                }
            },
            Ok(Err(e)) => {
                log::warn!("txn={} scorer failed: {e:#}; using fallback", features.transaction_id);
                RiskPrediction::fallback()
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::warn!(
                    "txn={} scorer exceeded {}ms; using fallback",
                    features.transaction_id,
                    timeout.as_millis()
                );
                RiskPrediction::fallback()
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                // The worker panicked before sending.
                log::warn!("txn={} scorer panicked; using fallback", features.transaction_id);
                RiskPrediction::fallback()
            }
        }
    }
}

// ── Default scorer ───────────────────────────────────────────────────────────

const HIGH_AMOUNT: f64 = 10_000.0;
const MEDIUM_AMOUNT: f64 = 5_000.0;

/// Amount-tiered scorer used when no trained model is wired in.
/// The low tier is a pseudo-random 0..100 keyed by transaction id, so a
/// replayed transaction always scores the same.
#[derive(Debug, Default, Clone)]
pub struct AmountScorer;

impl Scorer for AmountScorer {
    fn predict(&self, features: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
        let prediction = if features.amount > HIGH_AMOUNT {
            RiskPrediction {
                score: 900.0,
                confidence: 0.95,
                reason: "High Amount (Rule-based)".into(),
            }
        } else if features.amount > MEDIUM_AMOUNT {
            RiskPrediction {
                score: 600.0,
                confidence: 0.8,
                reason: "Medium Amount (Rule-based)".into(),
            }
        } else {
            RiskPrediction {
                score: (stable_seed(&features.transaction_id) % 100) as f64,
                confidence: 0.9,
                reason: "Normal Activity (Rule-based)".into(),
            }
        };
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(amount: f64) -> ScoringFeatures {
        ScoringFeatures {
            transaction_id: "tx-s".into(),
            user_id: "alice".into(),
            amount,
            currency: "USD".into(),
            merchant: "shop".into(),
            ip_risk_score: 0.35,
            avg_transaction_amount: 150.0,
            transaction_frequency: 3,
            days_since_last_transaction: 1,
            velocity_flag: false,
            device_change: false,
            ip_change: false,
            location_change_speed: 0.2,
        }
    }

    struct Failing;
    impl Scorer for Failing {
        fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
            anyhow::bail!("model offline")
        }
    }

    struct Slow;
    impl Scorer for Slow {
        fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
            thread::sleep(Duration::from_millis(500));
            Ok(RiskPrediction { score: 999.0, confidence: 1.0, reason: "late".into() })
        }
    }

    struct Panicking;
    impl Scorer for Panicking {
        fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
            panic!("scorer bug")
        }
    }

    struct OutOfRange;
    impl Scorer for OutOfRange {
        fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
            Ok(RiskPrediction { score: 4_000.0, confidence: -2.0, reason: "hot".into() })
        }
    }

    const BUDGET: Duration = Duration::from_millis(100);

    #[test]
    fn amount_tiers() {
        let s = AmountScorer;
        assert_eq!(s.predict(&features(20_000.0)).unwrap().score, 900.0);
        assert_eq!(s.predict(&features(6_000.0)).unwrap().score, 600.0);
        let low = s.predict(&features(50.0)).unwrap();
        assert!(low.score < 100.0);
        assert_eq!(low, s.predict(&features(50.0)).unwrap());
    }

    fn bounded(scorer: impl Scorer + 'static) -> BoundedScorer {
        BoundedScorer::new(Arc::new(scorer), 4)
    }

    #[test]
    fn failure_becomes_fallback() {
        assert!(bounded(Failing).score(&features(1.0), BUDGET).is_fallback());
    }

    #[test]
    fn timeout_becomes_fallback() {
        let p = bounded(Slow).score(&features(1.0), Duration::from_millis(20));
        assert_eq!(p, RiskPrediction::fallback());
    }

    #[test]
    fn panic_becomes_fallback() {
        let scorer = bounded(Panicking);
        assert!(scorer.score(&features(1.0), BUDGET).is_fallback());
        assert_eq!(scorer.in_flight(), 0, "slot released by the unwinding thread");
    }

    #[test]
    fn out_of_range_is_clamped() {
        let p = bounded(OutOfRange).score(&features(1.0), BUDGET);
        assert_eq!(p.score, MAX_SCORE);
        assert_eq!(p.confidence, 0.0);
    }

    /// Counts calls and sleeps, standing in for a hung model.
    struct Hanging(Arc<AtomicUsize>);
    impl Scorer for Hanging {
        fn predict(&self, _: &ScoringFeatures) -> anyhow::Result<RiskPrediction> {
            self.0.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(300));
            Ok(RiskPrediction { score: 1.0, confidence: 1.0, reason: "late".into() })
        }
    }

    #[test]
    fn abandoned_calls_are_capped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scorer = BoundedScorer::new(Arc::new(Hanging(Arc::clone(&calls))), 2);
        let short = Duration::from_millis(10);

        for _ in 0..5 {
            assert!(scorer.score(&features(1.0), short).is_fallback());
        }
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "no thread spawned past the cap");
        assert_eq!(scorer.in_flight(), 2);

        // Slots free up once the abandoned threads finish.
        thread::sleep(Duration::from_millis(600));
        assert_eq!(scorer.in_flight(), 0);
        scorer.score(&features(1.0), short);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clones_share_the_cap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let a = BoundedScorer::new(Arc::new(Hanging(Arc::clone(&calls))), 1);
        let b = a.clone();
        a.score(&features(1.0), Duration::from_millis(10));
        assert!(b.score(&features(1.0), Duration::from_millis(10)).is_fallback());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
