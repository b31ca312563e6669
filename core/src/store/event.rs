use super::{map_enriched_context, map_event, DeskStore, EnrichedContextRecord, IngestedEventRecord};
use crate::{
    enrichment::EnrichmentContext,
    error::{DeskError, DeskResult},
    event::{TransactionEvent, EVENT_TYPE_TRANSACTION},
    types::{EventStatus, TransactionId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

const EVENT_COLUMNS: &str = "id, event_id, source_system, channel, priority, event_type,
     payload, status, processing_error, transaction_id, attempts, claimed_at, received_at,
     processed_at";

impl DeskStore {
    // ── Ingested events ────────────────────────────────────────

    /// Insert in RECEIVED. A second insert of the same event_id fails with a
    /// UNIQUE violation (see `DeskError::is_unique_violation`).
    pub fn insert_event(&self, event: &TransactionEvent, received_at: DateTime<Utc>) -> DeskResult<i64> {
        let payload = serde_json::to_string(event)?;
        self.conn.execute(
            "INSERT INTO ingested_event (
                event_id, source_system, channel, priority, event_type,
                payload, status, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_id,
                event.source_system,
                event.channel,
                event.priority_or_default(),
                EVENT_TYPE_TRANSACTION,
                payload,
                EventStatus::Received,
                received_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn find_event(&self, event_id: &str) -> DeskResult<Option<IngestedEventRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM ingested_event WHERE event_id = ?1"),
                params![event_id],
                map_event,
            )
            .optional()?;
        Ok(record)
    }

    /// Compare-and-swap into PROCESSING. Claimable rows are RECEIVED,
    /// FAILED, or PROCESSING with a claim older than `stale_before` (an
    /// owner that died, or whose failure could not be recorded).
    ///
    /// Returns the new attempt number, which is the claim token the
    /// settling write must present. None when another unit of work holds a
    /// live claim or the event is already PROCESSED.
    pub fn claim_event(
        &self,
        event_id: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> DeskResult<Option<i64>> {
        let attempt = self
            .conn
            .query_row(
                "UPDATE ingested_event
                 SET status = ?1, processing_error = NULL, attempts = attempts + 1, claimed_at = ?2
                 WHERE event_id = ?3
                   AND (status IN (?4, ?5) OR (status = ?1 AND claimed_at < ?6))
                 RETURNING attempts",
                params![
                    EventStatus::Processing,
                    now,
                    event_id,
                    EventStatus::Received,
                    EventStatus::Failed,
                    stale_before,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(attempt)
    }

    /// Settle the claim `attempt` as PROCESSED. Fails when the claim was
    /// lost to a re-claim, which rolls the caller's unit of work back.
    pub fn mark_event_processed(
        &self,
        ingested_event_id: i64,
        attempt: i64,
        transaction_id: &str,
        at: DateTime<Utc>,
    ) -> DeskResult<()> {
        let changed = self.conn.execute(
            "UPDATE ingested_event
             SET status = ?1, transaction_id = ?2, processed_at = ?3,
                 processing_error = NULL, claimed_at = NULL
             WHERE id = ?4 AND status = ?5 AND attempts = ?6",
            params![
                EventStatus::Processed,
                transaction_id,
                at,
                ingested_event_id,
                EventStatus::Processing,
                attempt,
            ],
        )?;
        if changed != 1 {
            return Err(DeskError::InvalidTransition {
                entity: "event",
                from: format!("claim {attempt} no longer held"),
                to: EventStatus::Processed.to_string(),
            });
        }
        Ok(())
    }

    /// Stamp the failure of claim `attempt`. Runs outside the rolled-back
    /// unit of work so the error text survives. Returns false when the
    /// claim was already lost, in which case nothing is written.
    pub fn mark_event_failed(
        &self,
        event_id: &str,
        attempt: i64,
        error: &str,
        at: DateTime<Utc>,
    ) -> DeskResult<bool> {
        let changed = self.conn.execute(
            "UPDATE ingested_event
             SET status = ?1, processing_error = ?2, processed_at = ?3, claimed_at = NULL
             WHERE event_id = ?4 AND status = ?5 AND attempts = ?6",
            params![
                EventStatus::Failed,
                error,
                at,
                event_id,
                EventStatus::Processing,
                attempt,
            ],
        )?;
        Ok(changed == 1)
    }

    // ── Enriched context ───────────────────────────────────────

    pub fn insert_enriched_context(
        &self,
        ingested_event_id: i64,
        ctx: &EnrichmentContext,
        at: DateTime<Utc>,
    ) -> DeskResult<i64> {
        self.conn.execute(
            "INSERT INTO enriched_event_context (
                ingested_event_id, geo_country, geo_city, geo_lat, geo_lon,
                device_type, device_risk_level, ip_reputation, ip_risk_score,
                user_segment, signals, derived_features, explanations, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                ingested_event_id,
                ctx.geo_country,
                ctx.geo_city,
                ctx.geo_coordinates.map(|g| g.lat),
                ctx.geo_coordinates.map(|g| g.lon),
                ctx.device_type,
                ctx.device_risk_level,
                ctx.ip_reputation,
                ctx.ip_risk_score,
                ctx.user_segment,
                serde_json::to_string(&ctx.signals)?,
                serde_json::to_string(&ctx.derived_features)?,
                serde_json::to_string(&ctx.explanations)?,
                at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn link_context_to_transaction(
        &self,
        ingested_event_id: i64,
        transaction_id: &TransactionId,
    ) -> DeskResult<()> {
        self.conn.execute(
            "UPDATE enriched_event_context SET transaction_id = ?1 WHERE ingested_event_id = ?2",
            params![transaction_id, ingested_event_id],
        )?;
        Ok(())
    }

    pub fn get_enriched_context(&self, event_id: &str) -> DeskResult<Option<EnrichedContextRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT c.id, e.event_id, c.transaction_id, c.geo_country, c.geo_city,
                        c.created_at, c.geo_lat, c.geo_lon, c.device_type, c.device_risk_level,
                        c.ip_reputation, c.ip_risk_score, c.user_segment,
                        c.signals, c.derived_features, c.explanations
                 FROM enriched_event_context c
                 JOIN ingested_event e ON e.id = c.ingested_event_id
                 WHERE e.event_id = ?1",
                params![event_id],
                map_enriched_context,
            )
            .optional()?;
        Ok(record)
    }
}
