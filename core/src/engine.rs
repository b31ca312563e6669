//! The ingest engine: one call per inbound event.
//!
//! STAGE ORDER (fixed, never reordered):
//!   1. Validate            (no state touched on failure)
//!   2. Register            (insert RECEIVED; a lost insert race re-reads)
//!   3. Claim               (CAS RECEIVED|FAILED|stale PROCESSING → PROCESSING;
//!                           the new attempt number is the claim token)
//!   4. Enrich → Evaluate → Decide → Score → Dispose   (pure, no lock held)
//!   5. Persist             (one BEGIN IMMEDIATE unit of work):
//!        enriched context, transaction + risk score (savepoint),
//!        context link, rule evaluations, automated action,
//!        snapshot, daily metric, alert, event → PROCESSED
//!
//! RULES:
//!   - A PROCESSED event is never re-run; re-submission returns the
//!     prior outcome.
//!   - Any error in 4–5 rolls back every write of the attempt, then marks
//!     the event FAILED with the error text and propagates the error. The
//!     FAILED mark is retried with backoff while the database is locked.
//!   - A FAILED event is re-attempted from scratch only when re-submitted,
//!     and only with the payload it was first registered with.
//!   - A PROCESSING claim older than the lease is presumed abandoned and may
//!     be re-claimed. Settling writes present the claim token, so a stale
//!     owner can never overwrite the outcome of the attempt that replaced it.
//!   - Scoring never fails an attempt; it degrades to the fallback.
//!
//! Engines do not share connections. For parallel ingestion give each
//! worker its own engine via `worker()`.

use crate::{
    alert_workflow::{self, AlertRecord, CaseRecord},
    config::DeskConfig,
    decision::decide,
    disposition::{override_target, resolve_status, ManualOverride},
    enrichment::EnrichmentEngine,
    error::{DeskError, DeskResult},
    event::{IngestResponse, TransactionEvent, MSG_ALREADY_PROCESSED, MSG_PROCESSED},
    rule_engine::RuleCatalog,
    scoring::{AmountScorer, BoundedScorer, Scorer, ScoringFeatures},
    snapshot::{EventMetric, EventSnapshot, SnapshotFilter},
    store::{
        ActionDetails, AutomatedActionRecord, DeskStore, EnrichedContextRecord,
        IngestedEventRecord, RiskScoreRecord, RuleEvaluationRecord, TransactionRecord,
    },
    types::{AlertStatus, EventStatus, RecordId, TransactionId, TransactionStatus},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const TXN_SAVEPOINT: &str = "txn_with_score";

/// Attempts at recording FAILED. Each one also waits up to the store's
/// busy timeout for the write lock.
const MARK_FAILED_ATTEMPTS: u32 = 5;
const MARK_FAILED_BACKOFF: Duration = Duration::from_millis(25);

pub struct IngestEngine {
    store:      DeskStore,
    enrichment: EnrichmentEngine,
    rules:      RuleCatalog,
    scorer:     BoundedScorer,
    config:     DeskConfig,
}

impl IngestEngine {
    /// Engine with the default amount-tiered scorer.
    pub fn new(store: DeskStore, config: DeskConfig) -> Self {
        Self::with_scorer(store, config, Arc::new(AmountScorer))
    }

    pub fn with_scorer(store: DeskStore, config: DeskConfig, scorer: Arc<dyn Scorer>) -> Self {
        let scorer = BoundedScorer::new(scorer, config.scoring_max_in_flight);
        Self::assemble(store, config, scorer)
    }

    fn assemble(store: DeskStore, config: DeskConfig, scorer: BoundedScorer) -> Self {
        Self {
            enrichment: EnrichmentEngine::new(config.reference_data.clone()),
            rules: config.rules.clone(),
            scorer,
            store,
            config,
        }
    }

    /// In-memory, migrated store with the compiled-in config.
    /// Used by tests.
    pub fn build_test() -> DeskResult<Self> {
        let store = DeskStore::in_memory()?;
        store.migrate()?;
        Ok(Self::new(store, DeskConfig::default_test()))
    }

    /// Same config and scorer on a fresh connection to the same database.
    /// Workers share the scorer's in-flight cap.
    pub fn worker(&self) -> DeskResult<Self> {
        Ok(Self::assemble(
            self.store.reopen()?,
            self.config.clone(),
            self.scorer.clone(),
        ))
    }

    pub fn store(&self) -> &DeskStore {
        &self.store
    }

    pub fn config(&self) -> &DeskConfig {
        &self.config
    }

    // ── Ingest ─────────────────────────────────────────────────

    pub fn ingest(&self, event: &TransactionEvent) -> DeskResult<IngestResponse> {
        event.validate()?;

        let record = match self.store.find_event(&event.event_id)? {
            Some(existing) => existing,
            None => self.register(event)?,
        };

        if record.status == EventStatus::Processed {
            log::debug!("event={} replayed", event.event_id);
            return replay(&record);
        }
        if !same_payload(&record, event)? {
            return Err(DeskError::validation(format!(
                "event_id '{}' was registered with a different payload",
                event.event_id
            )));
        }

        let now = Utc::now();
        let Some(attempt) = self
            .store
            .claim_event(&event.event_id, now, self.stale_claim_cutoff(now))?
        else {
            return self.await_settled(&event.event_id);
        };

        if record.status == EventStatus::Processing {
            log::warn!(
                "event={} re-claimed stale claim {} (older than {:?})",
                event.event_id,
                record.attempts,
                self.config.claim_lease
            );
        }
        log::debug!("event={} claimed (attempt {attempt})", event.event_id);
        self.process(record.id, attempt, event)
    }

    /// Claims taken before this instant are past their lease.
    fn stale_claim_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.claim_lease)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Insert the event in RECEIVED, or read the row a concurrent
    /// submitter inserted first.
    fn register(&self, event: &TransactionEvent) -> DeskResult<IngestedEventRecord> {
        match self.store.insert_event(event, Utc::now()) {
            Ok(_) => {}
            Err(e) if e.is_unique_violation() => {
                log::warn!("event={} lost insert race; re-reading winner", event.event_id);
            }
            Err(e) => return Err(e),
        }
        self.store
            .find_event(&event.event_id)?
            .ok_or_else(|| DeskError::not_found("event", &event.event_id))
    }

    /// Another unit of work holds the event. Poll until it settles or the
    /// wait budget runs out.
    fn await_settled(&self, event_id: &str) -> DeskResult<IngestResponse> {
        let deadline = Instant::now() + self.config.inflight_wait;
        loop {
            let record = self
                .store
                .find_event(event_id)?
                .ok_or_else(|| DeskError::not_found("event", event_id))?;
            match record.status {
                EventStatus::Processed => return replay(&record),
                EventStatus::Failed => {
                    return Err(DeskError::EventFailed {
                        event_id: event_id.to_string(),
                        error: record.processing_error.unwrap_or_default(),
                    })
                }
                EventStatus::Received | EventStatus::Processing => {}
            }
            if Instant::now() >= deadline {
                log::warn!("event={event_id} still in flight after {:?}", self.config.inflight_wait);
                return Err(DeskError::EventInFlight {
                    event_id: event_id.to_string(),
                });
            }
            thread::sleep(self.config.inflight_poll);
        }
    }

    fn process(
        &self,
        ingested_event_id: i64,
        attempt: i64,
        event: &TransactionEvent,
    ) -> DeskResult<IngestResponse> {
        match self.run_attempt(ingested_event_id, attempt, event) {
            Ok(transaction_id) => Ok(IngestResponse {
                event_id: event.event_id.clone(),
                status: EventStatus::Processed,
                transaction_id: Some(transaction_id),
                message: MSG_PROCESSED.to_string(),
            }),
            Err(e) => {
                let text = e.to_string();
                log::error!("event={} failed: {text}", event.event_id);
                self.record_failure(&event.event_id, attempt, &text)?;
                Err(e)
            }
        }
    }

    /// Mark the claim FAILED. The failed unit of work has already rolled
    /// back, but the lock that sank it may still be held, so a busy
    /// database is retried with backoff. If it never clears, the mark
    /// error is returned and the claim is left for the lease to expire.
    fn record_failure(&self, event_id: &str, attempt: i64, text: &str) -> DeskResult<()> {
        let mut backoff = MARK_FAILED_BACKOFF;
        for n in 1..=MARK_FAILED_ATTEMPTS {
            match self.store.mark_event_failed(event_id, attempt, text, Utc::now()) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    log::warn!("event={event_id} claim {attempt} was re-claimed; failure not recorded");
                    return Ok(());
                }
                Err(mark) if n < MARK_FAILED_ATTEMPTS && mark.is_busy() => {
                    log::warn!("event={event_id} FAILED mark {n}/{MARK_FAILED_ATTEMPTS} hit a locked database");
                    thread::sleep(backoff);
                    backoff *= 2;
                }
                Err(mark) => {
                    log::error!(
                        "event={event_id} could not be marked FAILED: {mark}; \
                         claim {attempt} stays PROCESSING until its lease expires"
                    );
                    return Err(DeskError::EventFailed {
                        event_id: event_id.to_string(),
                        error: format!("{text}; failure not recorded: {mark}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn run_attempt(
        &self,
        ingested_event_id: i64,
        attempt: i64,
        event: &TransactionEvent,
    ) -> DeskResult<TransactionId> {
        let txn = &event.transaction;

        let ctx = self.enrichment.enrich(txn);
        let hits = self.rules.evaluate(txn, &ctx);
        let decision = decide(&hits);
        let prediction = self
            .scorer
            .score(&ScoringFeatures::from_parts(txn, &ctx), self.config.scoring_timeout);
        let status = resolve_status(&decision, &prediction);
        let alert_seed = alert_workflow::seed_from_hits(&hits);

        let now = Utc::now();
        let occurred_at = txn.timestamp.or(event.ingestion_timestamp).unwrap_or(now);
        let transaction_id: TransactionId = Uuid::new_v4().to_string();
        let pending = TransactionRecord {
            id: transaction_id.clone(),
            external_id: txn.transaction_id.clone(),
            user_id: txn.user_id.clone(),
            amount: txn.amount,
            currency: txn.currency.clone(),
            merchant: txn.merchant.clone(),
            ip_address: txn.ip_address.clone(),
            location: txn.location.clone(),
            device_id: txn.device_id.clone(),
            timestamp: occurred_at,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        let snapshot = EventSnapshot::build(
            &event.event_id,
            &transaction_id,
            status,
            txn,
            &ctx,
            &decision,
            &prediction,
            now,
        );

        self.store.atomically(|store| {
            store.insert_enriched_context(ingested_event_id, &ctx, now)?;

            store.savepoint(TXN_SAVEPOINT, |s| {
                s.insert_transaction(&pending)?;
                s.insert_risk_score(&transaction_id, &prediction, now)?;
                s.update_transaction_status(&transaction_id, TransactionStatus::Pending, status, now)?;
                Ok(())
            })?;
            store.link_context_to_transaction(ingested_event_id, &transaction_id)?;

            store.insert_rule_evaluations(ingested_event_id, &transaction_id, &hits, now)?;
            if decision.action.is_intervention() {
                let details = ActionDetails {
                    reason: decision.reason.clone(),
                    triggered_rules: decision.triggered_rule_ids.clone(),
                };
                store.insert_automated_action(
                    ingested_event_id,
                    &transaction_id,
                    decision.action,
                    &details,
                    now,
                )?;
            }

            store.insert_snapshot(ingested_event_id, &snapshot)?;
            store.record_metric(occurred_at.date_naive(), status, txn.amount, prediction.score, now)?;

            if let Some(seed) = &alert_seed {
                store.insert_alert(ingested_event_id, &transaction_id, seed, now)?;
            }

            store.mark_event_processed(ingested_event_id, attempt, &transaction_id, now)
        })?;

        log::info!(
            "event={} txn={} status={} action={} score={:.0}{} rules={:?}",
            event.event_id,
            transaction_id,
            status,
            decision.action,
            prediction.score,
            if prediction.is_fallback() { " (fallback)" } else { "" },
            decision.triggered_rule_ids,
        );
        Ok(transaction_id)
    }

    // ── Manual override ────────────────────────────────────────

    /// Approve (unblock) or reject a settled transaction.
    pub fn override_transaction(
        &self,
        transaction_id: &str,
        decision: ManualOverride,
    ) -> DeskResult<TransactionRecord> {
        self.store.atomically(|s| {
            let txn = s
                .get_transaction(transaction_id)?
                .ok_or_else(|| DeskError::not_found("transaction", transaction_id))?;
            let invalid = || DeskError::InvalidTransition {
                entity: "transaction",
                from: txn.status.to_string(),
                to: decision.target_status().to_string(),
            };
            let target = override_target(txn.status, decision).ok_or_else(invalid)?;
            if s.update_transaction_status(transaction_id, txn.status, target, Utc::now())? != 1 {
                return Err(invalid());
            }
            log::info!("txn={transaction_id} manually overridden {} -> {target}", txn.status);
            s.get_transaction(transaction_id)?
                .ok_or_else(|| DeskError::not_found("transaction", transaction_id))
        })
    }

    // ── Read side ──────────────────────────────────────────────

    pub fn get_event(&self, event_id: &str) -> DeskResult<Option<IngestedEventRecord>> {
        self.store.find_event(event_id)
    }

    pub fn get_enriched_context(&self, event_id: &str) -> DeskResult<Option<EnrichedContextRecord>> {
        self.store.get_enriched_context(event_id)
    }

    /// The transaction together with its one-to-one risk score.
    pub fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> DeskResult<Option<(TransactionRecord, RiskScoreRecord)>> {
        let Some(txn) = self.store.get_transaction(transaction_id)? else {
            return Ok(None);
        };
        let score = self
            .store
            .get_risk_score(transaction_id)?
            .ok_or_else(|| DeskError::not_found("risk score", transaction_id))?;
        Ok(Some((txn, score)))
    }

    pub fn rule_evaluations(&self, event_id: &str) -> DeskResult<Vec<RuleEvaluationRecord>> {
        self.store.rule_evaluations(event_id)
    }

    pub fn automated_action(&self, event_id: &str) -> DeskResult<Option<AutomatedActionRecord>> {
        self.store.automated_action(event_id)
    }

    pub fn get_snapshot(&self, event_id: &str) -> DeskResult<Option<EventSnapshot>> {
        self.store.get_snapshot(event_id)
    }

    pub fn query_snapshots(&self, filter: &SnapshotFilter) -> DeskResult<Vec<EventSnapshot>> {
        self.store.query_snapshots(filter)
    }

    pub fn recent_metrics(&self, days: usize) -> DeskResult<Vec<EventMetric>> {
        self.store.recent_metrics(days)
    }

    /// The row of the newest `metric_date` on record. Event time drives
    /// the day, so this need not be today.
    pub fn latest_metric(&self) -> DeskResult<Option<EventMetric>> {
        Ok(self.store.recent_metrics(1)?.into_iter().next())
    }

    pub fn alert_for_event(&self, event_id: &str) -> DeskResult<Option<AlertRecord>> {
        self.store.alert_for_event(event_id)
    }

    pub fn get_alert(&self, alert_id: RecordId) -> DeskResult<Option<AlertRecord>> {
        self.store.get_alert(alert_id)
    }

    pub fn list_alerts(&self, status: Option<AlertStatus>, limit: usize) -> DeskResult<Vec<AlertRecord>> {
        self.store.list_alerts(status, limit)
    }

    pub fn get_case(&self, case_id: RecordId) -> DeskResult<Option<CaseRecord>> {
        self.store.get_case(case_id)
    }

    pub fn case_for_alert(&self, alert_id: RecordId) -> DeskResult<Option<CaseRecord>> {
        self.store.case_for_alert(alert_id)
    }

    pub fn list_cases(&self, analyst: Option<&str>, limit: usize) -> DeskResult<Vec<CaseRecord>> {
        self.store.list_cases(analyst, limit)
    }

    // ── Alert/Case workflow ────────────────────────────────────

    pub fn assign_alert(&self, alert_id: RecordId, analyst: &str) -> DeskResult<(AlertRecord, CaseRecord)> {
        alert_workflow::assign_alert(&self.store, alert_id, analyst)
    }

    pub fn resolve_alert(&self, alert_id: RecordId, notes: &str) -> DeskResult<AlertRecord> {
        alert_workflow::resolve_alert(&self.store, alert_id, notes)
    }

    pub fn dismiss_alert(&self, alert_id: RecordId, notes: Option<&str>) -> DeskResult<AlertRecord> {
        alert_workflow::dismiss_alert(&self.store, alert_id, notes)
    }

    pub fn resolve_case(&self, case_id: RecordId, resolution_code: &str, conclusion: &str) -> DeskResult<CaseRecord> {
        alert_workflow::resolve_case(&self.store, case_id, resolution_code, conclusion)
    }
}

/// True when `event` is the document the event row was registered with.
/// Both sides go through the same text round trip so float formatting
/// cannot cause a false mismatch.
fn same_payload(record: &IngestedEventRecord, event: &TransactionEvent) -> DeskResult<bool> {
    let submitted: serde_json::Value = serde_json::from_str(&serde_json::to_string(event)?)?;
    Ok(submitted == record.payload)
}

/// The prior outcome of a PROCESSED event.
fn replay(record: &IngestedEventRecord) -> DeskResult<IngestResponse> {
    Ok(IngestResponse {
        event_id: record.event_id.clone(),
        status: EventStatus::Processed,
        transaction_id: record.transaction_id.clone(),
        message: MSG_ALREADY_PROCESSED.to_string(),
    })
}

