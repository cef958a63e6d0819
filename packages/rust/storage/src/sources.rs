//! Source Record store: provider snapshots per entity.

use dealflow_shared::{EntityId, Result, SourceRecord};
use libsql::params;

use crate::{Storage, db_err, parse_ts, text, ts};

impl Storage {
    /// Insert a source record. Older records for the same provider are kept.
    pub async fn insert_source_record(&self, record: &SourceRecord) -> Result<()> {
        self.check_writable()?;
        let conn = self.conn.lock().await;
        let payload = serde_json::to_string(&record.payload)?;
        conn
            .execute(
                "INSERT INTO source_records (id, entity_id, provider, payload_json, retrieved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.id.as_str(),
                    record.entity_id.as_str(),
                    record.provider.as_str(),
                    payload,
                    ts(record.retrieved_at),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent record for one (entity, provider) pair.
    pub async fn latest_source_record(
        &self,
        entity_id: &EntityId,
        provider: &str,
    ) -> Result<Option<SourceRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, entity_id, provider, payload_json, retrieved_at
                 FROM source_records
                 WHERE entity_id = ?1 AND provider = ?2
                 ORDER BY retrieved_at DESC, id DESC
                 LIMIT 1",
                params![entity_id.as_str(), provider],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_source_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Most recent record of every provider that has data for `entity_id`.
    pub async fn latest_source_records(&self, entity_id: &EntityId) -> Result<Vec<SourceRecord>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT s.id, s.entity_id, s.provider, s.payload_json, s.retrieved_at
                 FROM source_records s
                 WHERE s.entity_id = ?1
                   AND s.id = (
                     SELECT s2.id FROM source_records s2
                     WHERE s2.entity_id = s.entity_id AND s2.provider = s.provider
                     ORDER BY s2.retrieved_at DESC, s2.id DESC
                     LIMIT 1)
                 ORDER BY s.provider",
                params![entity_id.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_source_record(&row)?);
        }
        Ok(results)
    }
}

/// Convert a database row to a [`SourceRecord`].
fn row_to_source_record(row: &libsql::Row) -> Result<SourceRecord> {
    let payload: serde_json::Value = serde_json::from_str(&text(row, 3)?)?;
    Ok(SourceRecord {
        id: text(row, 0)?,
        entity_id: EntityId::new(text(row, 1)?)?,
        provider: text(row, 2)?,
        payload,
        retrieved_at: parse_ts(&text(row, 4)?)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::test_support::test_storage;

    fn record(entity: &str, provider: &str, payload: serde_json::Value, age_hours: i64) -> SourceRecord {
        SourceRecord {
            id: Uuid::now_v7().to_string(),
            entity_id: EntityId::new(entity).unwrap(),
            provider: provider.into(),
            payload,
            retrieved_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[tokio::test]
    async fn latest_record_wins_per_provider() {
        let storage = test_storage().await;
        let entity = EntityId::new("D1").unwrap();

        // Newer record inserted first, to prove ordering is by time not insertion.
        storage
            .insert_source_record(&record("D1", "LinkedIn", json!({"employee_count": 40}), 1))
            .await
            .unwrap();
        storage
            .insert_source_record(&record("D1", "LinkedIn", json!({"employee_count": 12}), 48))
            .await
            .unwrap();
        storage
            .insert_source_record(&record("D1", "Crunchbase", json!({"num_employees": "11-50"}), 2))
            .await
            .unwrap();
        storage
            .insert_source_record(&record("D2", "LinkedIn", json!({"employee_count": 7}), 0))
            .await
            .unwrap();

        let latest = storage
            .latest_source_record(&entity, "LinkedIn")
            .await
            .unwrap()
            .expect("linkedin record");
        assert_eq!(latest.payload["employee_count"], 40);

        let all = storage.latest_source_records(&entity).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].provider, "Crunchbase");
        assert_eq!(all[1].provider, "LinkedIn");
        assert_eq!(all[1].payload["employee_count"], 40);
    }

    #[tokio::test]
    async fn no_records_is_empty_not_error() {
        let storage = test_storage().await;
        let entity = EntityId::new("nobody").unwrap();
        assert!(storage.latest_source_records(&entity).await.unwrap().is_empty());
        assert!(
            storage
                .latest_source_record(&entity, "LinkedIn")
                .await
                .unwrap()
                .is_none()
        );
    }
}
