//! Durable record store on sqlite.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use super::{RecordStore, StoreError};
use crate::resource::{ResourceRecord, ResourceState};

pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl SqliteRecordStore {
    /// Open (or create) the record database under `data_dir`.
    pub async fn new(data_dir: &Path) -> Result<Self, StoreError> {
        let db_path = data_dir.join("converge.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database.
    ///
    /// Limited to one connection: each pooled connection would otherwise
    /// see its own empty database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                resource_id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                state TEXT NOT NULL,
                properties_json TEXT NOT NULL,
                progress_json TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn load(&self, resource_id: &str) -> Result<Option<ResourceRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT resource_id, kind, state, properties_json, progress_json,
                   error, created_at, updated_at
            FROM resources WHERE resource_id = ?
            "#,
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    async fn compare_and_swap(
        &self,
        resource_id: &str,
        expected: Option<ResourceState>,
        record: ResourceRecord,
    ) -> Result<bool, StoreError> {
        let properties_json = encode_json(resource_id, &record.properties)?;
        let progress_json = match &record.progress {
            Some(token) => Some(encode_json(resource_id, token)?),
            None => None,
        };

        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO resources (resource_id, kind, state, properties_json,
                                           progress_json, error, created_at, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                    ON CONFLICT(resource_id) DO NOTHING
                    "#,
                )
                .bind(resource_id)
                .bind(&record.kind)
                .bind(record.state.as_str())
                .bind(&properties_json)
                .bind(&progress_json)
                .bind(&record.error)
                .bind(record.created_at.to_rfc3339())
                .bind(record.updated_at.to_rfc3339())
                .execute(&self.pool)
                .await?
            }
            Some(state) => {
                sqlx::query(
                    r#"
                    UPDATE resources
                    SET kind = ?, state = ?, properties_json = ?, progress_json = ?,
                        error = ?, updated_at = ?
                    WHERE resource_id = ? AND state = ?
                    "#,
                )
                .bind(&record.kind)
                .bind(record.state.as_str())
                .bind(&properties_json)
                .bind(&progress_json)
                .bind(&record.error)
                .bind(record.updated_at.to_rfc3339())
                .bind(resource_id)
                .bind(state.as_str())
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn list(&self) -> Result<Vec<ResourceRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT resource_id, kind, state, properties_json, progress_json,
                   error, created_at, updated_at
            FROM resources ORDER BY resource_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }
}

fn encode_json<T: serde::Serialize>(resource_id: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        resource_id: resource_id.to_string(),
        detail: e.to_string(),
    })
}

fn row_to_record(row: SqliteRow) -> Result<ResourceRecord, StoreError> {
    let resource_id: String = row.get("resource_id");

    let state_str: String = row.get("state");
    let state = ResourceState::parse(&state_str).ok_or_else(|| StoreError::Corrupt {
        resource_id: resource_id.clone(),
        detail: format!("unknown state {:?}", state_str),
    })?;

    let properties_json: String = row.get("properties_json");
    let properties = serde_json::from_str(&properties_json).map_err(|e| StoreError::Corrupt {
        resource_id: resource_id.clone(),
        detail: e.to_string(),
    })?;

    let progress = match row.get::<Option<String>, _>("progress_json") {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
            resource_id: resource_id.clone(),
            detail: e.to_string(),
        })?),
        None => None,
    };

    let created_at = parse_timestamp(&resource_id, row.get("created_at"))?;
    let updated_at = parse_timestamp(&resource_id, row.get("updated_at"))?;

    Ok(ResourceRecord {
        resource_id,
        kind: row.get("kind"),
        state,
        properties,
        progress,
        error: row.get("error"),
        created_at,
        updated_at,
    })
}

fn parse_timestamp(resource_id: &str, raw: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            resource_id: resource_id.to_string(),
            detail: format!("bad timestamp {:?}: {}", raw, e),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::PropertyValue;
    use crate::resource::ProgressToken;

    fn make_record(id: &str, state: ResourceState) -> ResourceRecord {
        let mut record = ResourceRecord::new(
            id,
            "kv_record",
            state,
            [("root".to_string(), PropertyValue::from("backends"))]
                .into_iter()
                .collect(),
        );
        let mut token = ProgressToken::new(id);
        token.steps.push("ensure-root".to_string());
        token.notes.insert("path".to_string(), "backends/img/s1".to_string());
        token.correlation_id = Some("s1".to_string());
        record.progress = Some(token);
        record
    }

    #[tokio::test]
    async fn round_trip_preserves_the_record() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let record = make_record("res-1", ResourceState::CreateInProgress);

        assert!(store
            .compare_and_swap("res-1", None, record.clone())
            .await
            .unwrap());
        let loaded = store.load("res-1").await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn insert_of_existing_record_is_rejected() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let record = make_record("res-1", ResourceState::CreateInProgress);
        assert!(store
            .compare_and_swap("res-1", None, record.clone())
            .await
            .unwrap());
        assert!(!store.compare_and_swap("res-1", None, record).await.unwrap());
    }

    #[tokio::test]
    async fn swap_requires_the_expected_state() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        let record = make_record("res-1", ResourceState::CreateInProgress);
        store
            .compare_and_swap("res-1", None, record.clone())
            .await
            .unwrap();

        let mut done = record.clone();
        done.state = ResourceState::CreateComplete;
        assert!(!store
            .compare_and_swap("res-1", Some(ResourceState::Failed), done.clone())
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("res-1", Some(ResourceState::CreateInProgress), done)
            .await
            .unwrap());
        let loaded = store.load("res-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ResourceState::CreateComplete);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SqliteRecordStore::new(dir.path()).await.unwrap();
            store
                .compare_and_swap(
                    "res-1",
                    None,
                    make_record("res-1", ResourceState::CreateComplete),
                )
                .await
                .unwrap();
        }
        let store = SqliteRecordStore::new(dir.path()).await.unwrap();
        let loaded = store.load("res-1").await.unwrap().unwrap();
        assert_eq!(loaded.state, ResourceState::CreateComplete);
        assert_eq!(loaded.progress.unwrap().note("path"), Some("backends/img/s1"));
    }

    #[tokio::test]
    async fn list_returns_all_records() {
        let store = SqliteRecordStore::in_memory().await.unwrap();
        for id in ["res-b", "res-a"] {
            store
                .compare_and_swap(id, None, make_record(id, ResourceState::CreateComplete))
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.resource_id)
            .collect();
        assert_eq!(ids, vec!["res-a", "res-b"]);
    }
}
