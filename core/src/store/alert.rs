use super::DeskStore;
use crate::{
    alert_workflow::{AlertRecord, AlertSeed, CaseRecord},
    error::DeskResult,
    types::{AlertStatus, RecordId},
};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

const ALERT_COLUMNS: &str = "a.id, e.event_id, a.transaction_id, a.rule_id, a.severity, a.reason,
     a.status, a.assigned_to, a.notes, a.created_at, a.updated_at";

const CASE_COLUMNS: &str = "id, alert_id, analyst, conclusion, resolution_code,
     created_at, updated_at, resolved_at";

fn map_alert(row: &Row<'_>) -> rusqlite::Result<AlertRecord> {
    Ok(AlertRecord {
        id: row.get(0)?,
        event_id: row.get(1)?,
        transaction_id: row.get(2)?,
        rule_id: row.get(3)?,
        severity: row.get(4)?,
        reason: row.get(5)?,
        status: row.get(6)?,
        assigned_to: row.get(7)?,
        notes: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_case(row: &Row<'_>) -> rusqlite::Result<CaseRecord> {
    Ok(CaseRecord {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        analyst: row.get(2)?,
        conclusion: row.get(3)?,
        resolution_code: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        resolved_at: row.get(7)?,
    })
}

impl DeskStore {
    // ── Alerts ─────────────────────────────────────────────────

    pub fn insert_alert(
        &self,
        ingested_event_id: i64,
        transaction_id: &str,
        seed: &AlertSeed,
        at: DateTime<Utc>,
    ) -> DeskResult<RecordId> {
        self.conn.execute(
            "INSERT INTO alert (
                ingested_event_id, transaction_id, rule_id, severity, reason,
                status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                ingested_event_id,
                transaction_id,
                seed.rule_id,
                seed.severity,
                seed.reason,
                AlertStatus::Open,
                at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_alert(&self, alert_id: RecordId) -> DeskResult<Option<AlertRecord>> {
        let alert = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alert a
                     JOIN ingested_event e ON e.id = a.ingested_event_id
                     WHERE a.id = ?1"
                ),
                params![alert_id],
                map_alert,
            )
            .optional()?;
        Ok(alert)
    }

    pub fn alert_for_event(&self, event_id: &str) -> DeskResult<Option<AlertRecord>> {
        let alert = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ALERT_COLUMNS} FROM alert a
                     JOIN ingested_event e ON e.id = a.ingested_event_id
                     WHERE e.event_id = ?1"
                ),
                params![event_id],
                map_alert,
            )
            .optional()?;
        Ok(alert)
    }

    /// Compare-and-swap on status. `assigned_to`/`notes` overwrite only
    /// when Some. Returns rows changed (0 or 1).
    pub fn update_alert_status(
        &self,
        alert_id: RecordId,
        from: AlertStatus,
        to: AlertStatus,
        assigned_to: Option<&str>,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> DeskResult<usize> {
        let changed = self.conn.execute(
            "UPDATE alert
             SET status = ?1,
                 assigned_to = COALESCE(?2, assigned_to),
                 notes = COALESCE(?3, notes),
                 updated_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![to, assigned_to, notes, at, alert_id, from],
        )?;
        Ok(changed)
    }

    /// Oldest first within the limit.
    pub fn list_alerts(&self, status: Option<AlertStatus>, limit: usize) -> DeskResult<Vec<AlertRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ALERT_COLUMNS} FROM alert a
             JOIN ingested_event e ON e.id = a.ingested_event_id
             WHERE ?1 IS NULL OR a.status = ?1
             ORDER BY a.id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![status, limit], map_alert)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Cases ──────────────────────────────────────────────────

    pub fn insert_case(&self, alert_id: RecordId, analyst: &str, at: DateTime<Utc>) -> DeskResult<RecordId> {
        self.conn.execute(
            "INSERT INTO analyst_case (alert_id, analyst, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)",
            params![alert_id, analyst, at],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_case(&self, case_id: RecordId) -> DeskResult<Option<CaseRecord>> {
        let case = self
            .conn
            .query_row(
                &format!("SELECT {CASE_COLUMNS} FROM analyst_case WHERE id = ?1"),
                params![case_id],
                map_case,
            )
            .optional()?;
        Ok(case)
    }

    pub fn case_for_alert(&self, alert_id: RecordId) -> DeskResult<Option<CaseRecord>> {
        let case = self
            .conn
            .query_row(
                &format!("SELECT {CASE_COLUMNS} FROM analyst_case WHERE alert_id = ?1"),
                params![alert_id],
                map_case,
            )
            .optional()?;
        Ok(case)
    }

    pub fn list_cases(&self, analyst: Option<&str>, limit: usize) -> DeskResult<Vec<CaseRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {CASE_COLUMNS} FROM analyst_case
             WHERE ?1 IS NULL OR analyst = ?1
             ORDER BY id ASC
             LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![analyst, limit], map_case)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Only an unresolved case closes. Returns rows changed (0 or 1).
    pub fn close_case(
        &self,
        case_id: RecordId,
        resolution_code: &str,
        conclusion: &str,
        at: DateTime<Utc>,
    ) -> DeskResult<usize> {
        let changed = self.conn.execute(
            "UPDATE analyst_case
             SET resolution_code = ?1, conclusion = ?2, resolved_at = ?3, updated_at = ?3
             WHERE id = ?4 AND resolved_at IS NULL",
            params![resolution_code, conclusion, at, case_id],
        )?;
        Ok(changed)
    }
}
