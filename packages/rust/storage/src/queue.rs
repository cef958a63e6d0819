//! Queue Item store: insert, atomic claim, conditional status updates, and
//! delete-by-filter cleanup.

use chrono::{DateTime, Utc};
use dealflow_shared::{
    DealflowError, EntityId, FundId, QueueItem, QueueStatus, Result,
};
use libsql::{TransactionBehavior, params};

use crate::triggers::UPSERT_TRIGGER_SQL;
use crate::{Storage, db_err, opt_text, parse_ts, text, ts};

const INSERT_ITEM_SQL: &str =
    "INSERT INTO queue_items (id, entity_id, fund_id, priority, trigger_reason, status,
                              attempts, created_at, started_at, completed_at,
                              error_message, scheduled_for)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

const ITEM_COLUMNS: &str = "id, entity_id, fund_id, priority, trigger_reason, status, attempts, \
     created_at, started_at, completed_at, error_message, scheduled_for";

/// Outcome of an atomic claim.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    /// Items moved to `processing` by this call, oldest `scheduled_for` first.
    Claimed(Vec<QueueItem>),
    /// Nothing claimed: `processing` entities already at the concurrency limit.
    Throttled { processing: usize },
}

impl Storage {
    /// Insert a new queue item as given.
    pub async fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn
            .execute(
                INSERT_ITEM_SQL,
                params![
                    item.id.as_str(),
                    item.entity_id.as_str(),
                    item.fund_id.as_str(),
                    item.priority.as_str(),
                    item.trigger_reason.as_str(),
                    item.status.as_str(),
                    i64::from(item.attempts),
                    ts(item.created_at),
                    item.started_at.map(ts),
                    item.completed_at.map(ts),
                    item.error_message.as_deref(),
                    ts(item.scheduled_for),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Insert a queue item and record its trigger reason as granted at the
    /// item's creation time, in one transaction. Neither row is written if
    /// either insert fails.
    pub async fn insert_granted_queue_item(
        &self,
        item: &QueueItem,
        user_id: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        if let Err(e) = tx
            .execute(
                INSERT_ITEM_SQL,
                params![
                    item.id.as_str(),
                    item.entity_id.as_str(),
                    item.fund_id.as_str(),
                    item.priority.as_str(),
                    item.trigger_reason.as_str(),
                    item.status.as_str(),
                    i64::from(item.attempts),
                    ts(item.created_at),
                    item.started_at.map(ts),
                    item.completed_at.map(ts),
                    item.error_message.as_deref(),
                    ts(item.scheduled_for),
                ],
            )
            .await
        {
            tx.rollback().await.map_err(db_err)?;
            return Err(db_err(e));
        }
        if let Err(e) = tx
            .execute(
                UPSERT_TRIGGER_SQL,
                params![
                    item.entity_id.as_str(),
                    item.trigger_reason.as_str(),
                    ts(item.created_at),
                    user_id
                ],
            )
            .await
        {
            tx.rollback().await.map_err(db_err)?;
            return Err(db_err(e));
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    /// Get a queue item by ID.
    pub async fn get_queue_item(&self, id: &str) -> Result<Option<QueueItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_queue_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// All queue items for an entity, oldest first.
    pub async fn list_queue_items_for_entity(&self, entity_id: &EntityId) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM queue_items
                     WHERE entity_id = ?1 ORDER BY created_at, id"
                ),
                params![entity_id.as_str()],
            )
            .await
            .map_err(db_err)?;
        collect_items(&mut rows).await
    }

    /// Atomically move up to `batch_size` due items to `processing`.
    ///
    /// Runs inside one `BEGIN IMMEDIATE` transaction while holding this
    /// handle's connection lock, so concurrent claimers (on this handle or on
    /// other handles to the same file) serialize and never see the same
    /// `queued` row. At most one item per entity is claimed, entities that
    /// already have a `processing` item are skipped, and the number of
    /// processing entities never exceeds `max_concurrent`.
    pub async fn claim_queue_items(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        max_concurrent: usize,
    ) -> Result<ClaimResult> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let processing = {
            let mut rows = tx
                .query(
                    "SELECT COUNT(DISTINCT entity_id) FROM queue_items WHERE status = 'processing'",
                    params![],
                )
                .await
                .map_err(db_err)?;
            match rows.next().await.map_err(db_err)? {
                Some(row) => row.get::<i64>(0).map_err(db_err)? as usize,
                None => 0,
            }
        };

        if processing >= max_concurrent {
            tx.rollback().await.map_err(db_err)?;
            return Ok(ClaimResult::Throttled { processing });
        }

        let limit = batch_size.min(max_concurrent - processing);
        if limit == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(ClaimResult::Claimed(Vec::new()));
        }

        let now = ts(now);
        let mut rows = tx
            .query(
                &format!(
                    "UPDATE queue_items
                     SET status = 'processing', started_at = ?1, attempts = attempts + 1
                     WHERE id IN (
                       SELECT q.id FROM queue_items q
                       WHERE q.status = 'queued'
                         AND q.scheduled_for <= ?1
                         AND q.entity_id NOT IN (
                           SELECT entity_id FROM queue_items WHERE status = 'processing')
                         AND q.id = (
                           SELECT q2.id FROM queue_items q2
                           WHERE q2.entity_id = q.entity_id
                             AND q2.status = 'queued'
                             AND q2.scheduled_for <= ?1
                           ORDER BY q2.scheduled_for, q2.created_at, q2.id
                           LIMIT 1)
                       ORDER BY q.scheduled_for, q.created_at, q.id
                       LIMIT ?2)
                     RETURNING {ITEM_COLUMNS}"
                ),
                params![now.as_str(), limit as i64],
            )
            .await
            .map_err(db_err)?;
        let mut claimed = collect_items(&mut rows).await?;
        drop(rows);
        tx.commit().await.map_err(db_err)?;

        // RETURNING order is unspecified.
        claimed.sort_by(|a, b| {
            (a.scheduled_for, a.created_at, &a.id).cmp(&(b.scheduled_for, b.created_at, &b.id))
        });
        Ok(ClaimResult::Claimed(claimed))
    }

    /// Move a `processing` item to `completed` or `failed`.
    ///
    /// Returns `Queue` error if the item does not exist or is not processing.
    pub async fn finish_queue_item(
        &self,
        id: &str,
        status: QueueStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        if !matches!(status, QueueStatus::Completed | QueueStatus::Failed) {
            return Err(DealflowError::Queue(format!(
                "cannot finish item {id} as '{status}'"
            )));
        }

        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE queue_items
                 SET status = ?1, completed_at = ?2, error_message = ?3
                 WHERE id = ?4 AND status = 'processing'",
                params![status.as_str(), ts(now), error_message, id],
            )
            .await
            .map_err(db_err)?;

        if changed == 0 {
            return Err(DealflowError::Queue(format!(
                "queue item {id} is not processing"
            )));
        }
        Ok(())
    }

    /// Handle items stuck in `processing` since before `started_before`.
    ///
    /// Items with attempts left go back to `queued` at `requeue_at`; the rest
    /// fail with `exhausted_message`. Returns `(requeued_ids, failed_ids)`.
    pub async fn reclaim_stuck_items(
        &self,
        started_before: DateTime<Utc>,
        max_attempts: u32,
        requeue_at: DateTime<Utc>,
        exhausted_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(Vec<String>, Vec<String>)> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;

        let cutoff = ts(started_before);
        let max = i64::from(max_attempts);

        let mut rows = tx
            .query(
                "UPDATE queue_items
                 SET status = 'queued', scheduled_for = ?1, started_at = NULL
                 WHERE status = 'processing' AND started_at < ?2 AND attempts < ?3
                 RETURNING id",
                params![ts(requeue_at), cutoff.as_str(), max],
            )
            .await
            .map_err(db_err)?;
        let requeued = collect_ids(&mut rows).await?;
        drop(rows);

        let mut rows = tx
            .query(
                "UPDATE queue_items
                 SET status = 'failed', completed_at = ?1, error_message = ?2
                 WHERE status = 'processing' AND started_at < ?3 AND attempts >= ?4
                 RETURNING id",
                params![ts(now), exhausted_message, cutoff.as_str(), max],
            )
            .await
            .map_err(db_err)?;
        let failed = collect_ids(&mut rows).await?;
        drop(rows);

        tx.commit().await.map_err(db_err)?;
        Ok((requeued, failed))
    }

    /// Failed items that still have attempts left.
    pub async fn list_retryable_failed(&self, max_attempts: u32) -> Result<Vec<QueueItem>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ITEM_COLUMNS} FROM queue_items
                     WHERE status = 'failed' AND attempts < ?1
                     ORDER BY completed_at, id"
                ),
                params![i64::from(max_attempts)],
            )
            .await
            .map_err(db_err)?;
        collect_items(&mut rows).await
    }

    /// Put a `failed` item back in the queue. Returns false if it was no longer failed.
    pub async fn requeue_failed_item(&self, id: &str, scheduled_for: DateTime<Utc>) -> Result<bool> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE queue_items
                 SET status = 'queued', scheduled_for = ?1, started_at = NULL, completed_at = NULL,
                     error_message = NULL
                 WHERE id = ?2 AND status = 'failed'",
                params![ts(scheduled_for), id],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Delete completed/failed items finished before `cutoff`.
    pub async fn delete_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn
            .execute(
                "DELETE FROM queue_items
                 WHERE status IN ('completed', 'failed')
                   AND COALESCE(completed_at, created_at) < ?1",
                params![ts(cutoff)],
            )
            .await
            .map_err(db_err)
    }

    /// Delete queued items created before `cutoff` that were never claimed.
    pub async fn delete_queued_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        conn
            .execute(
                "DELETE FROM queue_items
                 WHERE status = 'queued' AND attempts = 0 AND created_at < ?1",
                params![ts(cutoff)],
            )
            .await
            .map_err(db_err)
    }

    /// Item counts per status, optionally restricted to one fund.
    pub async fn count_queue_items_by_status(
        &self,
        fund_id: Option<&FundId>,
    ) -> Result<Vec<(QueueStatus, u64)>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM queue_items
                 WHERE ?1 IS NULL OR fund_id = ?1
                 GROUP BY status ORDER BY status",
                params![fund_id.map(FundId::as_str)],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let status: QueueStatus = text(&row, 0)?.parse()?;
            let count = row.get::<i64>(1).map_err(db_err)?;
            results.push((status, count as u64));
        }
        Ok(results)
    }
}

async fn collect_items(rows: &mut libsql::Rows) -> Result<Vec<QueueItem>> {
    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_queue_item(&row)?);
    }
    Ok(results)
}

async fn collect_ids(rows: &mut libsql::Rows) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        ids.push(text(&row, 0)?);
    }
    Ok(ids)
}

/// Convert a database row (in `ITEM_COLUMNS` order) to a [`QueueItem`].
fn row_to_queue_item(row: &libsql::Row) -> Result<QueueItem> {
    Ok(QueueItem {
        id: text(row, 0)?,
        entity_id: EntityId::new(text(row, 1)?)?,
        fund_id: FundId::new(text(row, 2)?)?,
        priority: text(row, 3)?.parse()?,
        trigger_reason: text(row, 4)?.parse()?,
        status: text(row, 5)?.parse()?,
        attempts: row.get::<i64>(6).map_err(db_err)? as u32,
        created_at: parse_ts(&text(row, 7)?)?,
        started_at: opt_text(row, 8).map(|s| parse_ts(&s)).transpose()?,
        completed_at: opt_text(row, 9).map(|s| parse_ts(&s)).transpose()?,
        error_message: opt_text(row, 10),
        scheduled_for: parse_ts(&text(row, 11)?)?,
    })
}
