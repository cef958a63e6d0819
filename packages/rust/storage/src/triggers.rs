//! Per-entity trigger state: last grant time per trigger reason, and the
//! explicit block-until timestamp.

use chrono::{DateTime, Utc};
use dealflow_shared::{EntityId, Result, TriggerReason};
use libsql::params;

use crate::{Storage, db_err, opt_text, parse_ts, text, ts};

pub(crate) const UPSERT_TRIGGER_SQL: &str =
    "INSERT INTO entity_triggers (entity_id, trigger_reason, last_triggered_at, triggered_by)
     VALUES (?1, ?2, ?3, ?4)
     ON CONFLICT(entity_id, trigger_reason) DO UPDATE SET
       last_triggered_at = excluded.last_triggered_at,
       triggered_by = excluded.triggered_by";

impl Storage {
    /// When `reason` was last granted for `entity_id`, if ever.
    pub async fn last_trigger(
        &self,
        entity_id: &EntityId,
        reason: TriggerReason,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT last_triggered_at FROM entity_triggers
                 WHERE entity_id = ?1 AND trigger_reason = ?2",
                params![entity_id.as_str(), reason.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(parse_ts(&text(&row, 0)?)?)),
            None => Ok(None),
        }
    }

    /// Record a granted trigger (upserts).
    pub async fn record_trigger(
        &self,
        entity_id: &EntityId,
        reason: TriggerReason,
        user_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn
            .execute(
                UPSERT_TRIGGER_SQL,
                params![entity_id.as_str(), reason.as_str(), ts(at), user_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// The entity's block-until timestamp and the reason given, if set.
    pub async fn get_block(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<(DateTime<Utc>, Option<String>)>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT blocked_until, reason FROM entity_blocks WHERE entity_id = ?1",
                params![entity_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some((parse_ts(&text(&row, 0)?)?, opt_text(&row, 1)))),
            None => Ok(None),
        }
    }

    /// Suppress all triggers for `entity_id` until `until` (upserts).
    pub async fn set_block(
        &self,
        entity_id: &EntityId,
        until: DateTime<Utc>,
        reason: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn
            .execute(
                "INSERT INTO entity_blocks (entity_id, blocked_until, reason)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity_id) DO UPDATE SET
                   blocked_until = excluded.blocked_until,
                   reason = excluded.reason",
                params![entity_id.as_str(), ts(until), reason],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Remove any block on `entity_id`.
    pub async fn clear_block(&self, entity_id: &EntityId) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn
            .execute(
                "DELETE FROM entity_blocks WHERE entity_id = ?1",
                params![entity_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
