use super::{json_col, ActionDetails, AutomatedActionRecord, DeskStore, RuleEvaluationRecord, ACTION_STATUS_EXECUTED};
use crate::{
    error::DeskResult,
    rule_engine::RuleHit,
    snapshot::{bucket_increments, EventMetric, EventSnapshot, SnapshotFilter, SnapshotMetrics},
    types::{RuleAction, TransactionStatus},
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, ToSql};

const SNAPSHOT_COLUMNS: &str = "s.event_id, s.transaction_id, s.transaction_status, s.risk_score,
     s.amount, s.currency, s.geo_country, s.geo_city, s.device_type, s.ip_reputation,
     s.ip_risk_score, s.rule_action, s.rule_ids, s.metrics, s.created_at";

fn map_snapshot(row: &Row<'_>) -> rusqlite::Result<EventSnapshot> {
    let rule_ids: Vec<String> = json_col(row, 12)?;
    let metrics: SnapshotMetrics = json_col(row, 13)?;
    Ok(EventSnapshot {
        event_id: row.get(0)?,
        transaction_id: row.get(1)?,
        transaction_status: row.get(2)?,
        risk_score: row.get(3)?,
        amount: row.get(4)?,
        currency: row.get(5)?,
        geo_country: row.get(6)?,
        geo_city: row.get(7)?,
        device_type: row.get(8)?,
        ip_reputation: row.get(9)?,
        ip_risk_score: row.get(10)?,
        rule_action: row.get(11)?,
        rule_ids,
        metrics,
        created_at: row.get(14)?,
    })
}

fn map_metric(row: &Row<'_>) -> rusqlite::Result<EventMetric> {
    Ok(EventMetric {
        metric_date: row.get(0)?,
        total_events: row.get(1)?,
        blocked_events: row.get(2)?,
        challenged_events: row.get(3)?,
        allowed_events: row.get(4)?,
        avg_amount: row.get(5)?,
        avg_risk_score: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

impl DeskStore {
    // ── Rule evaluations ───────────────────────────────────────

    /// One row per matched rule. Call inside `atomically` so the batch
    /// lands as a unit.
    pub fn insert_rule_evaluations(
        &self,
        ingested_event_id: i64,
        transaction_id: &str,
        hits: &[RuleHit],
        at: DateTime<Utc>,
    ) -> DeskResult<()> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO rule_evaluation (
                ingested_event_id, transaction_id, rule_id, rule_name,
                severity, action, reason, matched, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
        )?;
        for hit in hits {
            stmt.execute(params![
                ingested_event_id,
                transaction_id,
                hit.rule_id,
                hit.rule_name,
                hit.severity,
                hit.action,
                hit.reason,
                at,
            ])?;
        }
        Ok(())
    }

    pub fn rule_evaluations(&self, event_id: &str) -> DeskResult<Vec<RuleEvaluationRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.id, e.event_id, r.transaction_id, r.rule_id, r.rule_name,
                    r.severity, r.action, r.reason, r.matched, r.created_at
             FROM rule_evaluation r
             JOIN ingested_event e ON e.id = r.ingested_event_id
             WHERE e.event_id = ?1
             ORDER BY r.id ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id], |row| {
                Ok(RuleEvaluationRecord {
                    id: row.get(0)?,
                    event_id: row.get(1)?,
                    transaction_id: row.get(2)?,
                    rule_id: row.get(3)?,
                    rule_name: row.get(4)?,
                    severity: row.get(5)?,
                    action: row.get(6)?,
                    reason: row.get(7)?,
                    matched: row.get::<_, i32>(8)? != 0,
                    created_at: row.get(9)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Automated actions ──────────────────────────────────────

    pub fn insert_automated_action(
        &self,
        ingested_event_id: i64,
        transaction_id: &str,
        action_type: RuleAction,
        details: &ActionDetails,
        at: DateTime<Utc>,
    ) -> DeskResult<i64> {
        self.conn.execute(
            "INSERT INTO automated_action (
                ingested_event_id, transaction_id, action_type, status, details,
                created_at, processed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                ingested_event_id,
                transaction_id,
                action_type,
                ACTION_STATUS_EXECUTED,
                serde_json::to_string(details)?,
                at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn automated_action(&self, event_id: &str) -> DeskResult<Option<AutomatedActionRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT a.id, e.event_id, a.transaction_id, a.action_type, a.status,
                        a.details, a.created_at, a.processed_at
                 FROM automated_action a
                 JOIN ingested_event e ON e.id = a.ingested_event_id
                 WHERE e.event_id = ?1",
                params![event_id],
                |row| {
                    Ok(AutomatedActionRecord {
                        id: row.get(0)?,
                        event_id: row.get(1)?,
                        transaction_id: row.get(2)?,
                        action_type: row.get(3)?,
                        status: row.get(4)?,
                        details: json_col(row, 5)?,
                        created_at: row.get(6)?,
                        processed_at: row.get(7)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    // ── Snapshots ──────────────────────────────────────────────

    pub fn insert_snapshot(&self, ingested_event_id: i64, snap: &EventSnapshot) -> DeskResult<()> {
        self.conn.execute(
            "INSERT INTO event_snapshot (
                ingested_event_id, event_id, transaction_id, transaction_status, risk_score,
                amount, currency, geo_country, geo_city, device_type, ip_reputation,
                ip_risk_score, rule_action, rule_ids, metrics, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                ingested_event_id,
                snap.event_id,
                snap.transaction_id,
                snap.transaction_status,
                snap.risk_score,
                snap.amount,
                snap.currency,
                snap.geo_country,
                snap.geo_city,
                snap.device_type,
                snap.ip_reputation,
                snap.ip_risk_score,
                snap.rule_action,
                serde_json::to_string(&snap.rule_ids)?,
                serde_json::to_string(&snap.metrics)?,
                snap.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_snapshot(&self, event_id: &str) -> DeskResult<Option<EventSnapshot>> {
        let snap = self
            .conn
            .query_row(
                &format!("SELECT {SNAPSHOT_COLUMNS} FROM event_snapshot s WHERE s.event_id = ?1"),
                params![event_id],
                map_snapshot,
            )
            .optional()?;
        Ok(snap)
    }

    /// Newest first.
    pub fn query_snapshots(&self, filter: &SnapshotFilter) -> DeskResult<Vec<EventSnapshot>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("s.transaction_status = ?");
            args.push(Box::new(status));
        }
        if let Some(action) = filter.action {
            clauses.push("s.rule_action = ?");
            args.push(Box::new(action));
        }
        if let Some(country) = &filter.country {
            clauses.push("UPPER(s.geo_country) = UPPER(?)");
            args.push(Box::new(country.clone()));
        }
        if let Some(rule_id) = &filter.rule_id {
            clauses.push("EXISTS (SELECT 1 FROM json_each(s.rule_ids) WHERE json_each.value = ?)");
            args.push(Box::new(rule_id.clone()));
        }
        let limit = i64::try_from(filter.limit_or_default()).unwrap_or(i64::MAX);
        args.push(Box::new(limit));

        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM event_snapshot s {where_sql}
             ORDER BY s.created_at DESC, s.id DESC LIMIT ?"
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), map_snapshot)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Daily metrics ──────────────────────────────────────────

    /// Count one processed event toward `day` and fold `amount` and
    /// `risk_score` into the running means:
    ///   new_avg = old_avg + (value - old_avg) / new_count
    ///
    /// A single upsert statement: every right-hand side reads the row as it
    /// was before this update, and no other writer can interleave.
    pub fn record_metric(
        &self,
        day: NaiveDate,
        status: TransactionStatus,
        amount: f64,
        risk_score: f64,
        at: DateTime<Utc>,
    ) -> DeskResult<()> {
        let (blocked, challenged, allowed) = bucket_increments(status);
        self.conn.execute(
            "INSERT INTO event_metric (
                metric_date, total_events, blocked_events, challenged_events,
                allowed_events, avg_amount, avg_risk_score, updated_at
            ) VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(metric_date) DO UPDATE SET
                total_events      = total_events + 1,
                blocked_events    = blocked_events + excluded.blocked_events,
                challenged_events = challenged_events + excluded.challenged_events,
                allowed_events    = allowed_events + excluded.allowed_events,
                avg_amount        = avg_amount
                                    + (excluded.avg_amount - avg_amount) / (total_events + 1),
                avg_risk_score    = avg_risk_score
                                    + (excluded.avg_risk_score - avg_risk_score) / (total_events + 1),
                updated_at        = excluded.updated_at",
            params![day, blocked, challenged, allowed, amount, risk_score, at],
        )?;
        Ok(())
    }

    /// The most recent `days` metric rows, newest day first.
    pub fn recent_metrics(&self, days: usize) -> DeskResult<Vec<EventMetric>> {
        let mut stmt = self.conn.prepare(
            "SELECT metric_date, total_events, blocked_events, challenged_events,
                    allowed_events, avg_amount, avg_risk_score, updated_at
             FROM event_metric
             ORDER BY metric_date DESC
             LIMIT ?1",
        )?;
        let limit = i64::try_from(days).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![limit], map_metric)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
