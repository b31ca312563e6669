use super::{map_transaction, DeskStore, RiskScoreRecord, TransactionRecord};
use crate::{error::DeskResult, scoring::RiskPrediction, types::TransactionStatus};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

const TRANSACTION_COLUMNS: &str = "id, external_id, user_id, amount, currency, merchant,
     ip_address, location, device_id, timestamp, status, created_at, updated_at";

impl DeskStore {
    // ── Transactions ───────────────────────────────────────────

    pub fn insert_transaction(&self, txn: &TransactionRecord) -> DeskResult<()> {
        self.conn.execute(
            "INSERT INTO transactions (
                id, external_id, user_id, amount, currency, merchant,
                ip_address, location, device_id, timestamp, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                txn.id,
                txn.external_id,
                txn.user_id,
                txn.amount,
                txn.currency,
                txn.merchant,
                txn.ip_address,
                txn.location,
                txn.device_id,
                txn.timestamp,
                txn.status,
                txn.created_at,
                txn.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_transaction(&self, id: &str) -> DeskResult<Option<TransactionRecord>> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id],
                map_transaction,
            )
            .optional()?;
        Ok(record)
    }

    /// Compare-and-swap on the current status. Returns rows changed (0 or 1).
    pub fn update_transaction_status(
        &self,
        id: &str,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    ) -> DeskResult<usize> {
        let changed = self.conn.execute(
            "UPDATE transactions SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to, at, id, from],
        )?;
        Ok(changed)
    }

    // ── Risk scores ────────────────────────────────────────────

    pub fn insert_risk_score(
        &self,
        transaction_id: &str,
        prediction: &RiskPrediction,
        at: DateTime<Utc>,
    ) -> DeskResult<i64> {
        self.conn.execute(
            "INSERT INTO risk_score (transaction_id, score, confidence, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                transaction_id,
                prediction.score,
                prediction.confidence,
                prediction.reason,
                at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_risk_score(&self, transaction_id: &str) -> DeskResult<Option<RiskScoreRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT id, transaction_id, score, confidence, reason, created_at
                 FROM risk_score WHERE transaction_id = ?1",
                params![transaction_id],
                |row| {
                    Ok(RiskScoreRecord {
                        id: row.get(0)?,
                        transaction_id: row.get(1)?,
                        score: row.get(2)?,
                        confidence: row.get(3)?,
                        reason: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }
}
