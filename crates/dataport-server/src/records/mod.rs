//! Data record access for import and export
//!
//! Records belong to a data model and carry an untyped JSON payload keyed by
//! attribute name. Payloads are passed through as-is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataport_common::Row;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::RecordError;
use crate::jobs::types::ExportFilters;

pub mod memory;

pub use memory::MemoryRecordStore;

/// A stored data record
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub id: Uuid,
    pub payload: Row,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataRecord {
    /// Flatten into an export row: `id`, payload keys, then timestamps
    pub fn into_row(self) -> Row {
        let mut row = Row::new();
        row.insert("id".to_string(), Value::String(self.id.to_string()));
        for (key, value) in self.payload {
            if key == "id" || key == "created_at" || key == "updated_at" {
                continue;
            }
            row.insert(key, value);
        }
        row.insert("created_at".to_string(), Value::String(self.created_at.to_rfc3339()));
        row.insert("updated_at".to_string(), Value::String(self.updated_at.to_rfc3339()));
        row
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Attribute names of a data model, in declaration order
    async fn attribute_names(&self, data_model_id: Uuid) -> Result<Vec<String>, RecordError>;

    async fn insert_record(&self, data_model_id: Uuid, payload: &Row) -> Result<Uuid, RecordError>;

    async fn count_matching(
        &self,
        data_model_id: Uuid,
        filters: &ExportFilters,
    ) -> Result<i64, RecordError>;

    /// One page of matching records, newest first
    async fn fetch_batch(
        &self,
        data_model_id: Uuid,
        filters: &ExportFilters,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DataRecord>, RecordError>;
}

/// `%term%` with LIKE wildcards in `term` escaped
pub fn like_pattern(term: &str) -> String {
    let mut pattern = String::with_capacity(term.len() + 2);
    pattern.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// Postgres-backed record store over `data_records`
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    id: Uuid,
    data: Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn search_param(filters: &ExportFilters) -> Option<String> {
    filters
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(like_pattern)
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn attribute_names(&self, data_model_id: Uuid) -> Result<Vec<String>, RecordError> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT name
            FROM data_model_attributes
            WHERE data_model_id = $1
            ORDER BY position ASC, name ASC
            "#,
        )
        .bind(data_model_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(names)
    }

    async fn insert_record(&self, data_model_id: Uuid, payload: &Row) -> Result<Uuid, RecordError> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO data_records (id, data_model_id, data, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(data_model_id)
        .bind(Value::Object(payload.clone()))
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn count_matching(
        &self,
        data_model_id: Uuid,
        filters: &ExportFilters,
    ) -> Result<i64, RecordError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM data_records
            WHERE data_model_id = $1
              AND deleted_at IS NULL
              AND ($2::TEXT IS NULL OR data::TEXT ILIKE $2)
              AND ($3::UUID[] IS NULL OR id = ANY($3))
            "#,
        )
        .bind(data_model_id)
        .bind(search_param(filters))
        .bind(filters.ids.as_deref())
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn fetch_batch(
        &self,
        data_model_id: Uuid,
        filters: &ExportFilters,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DataRecord>, RecordError> {
        let rows: Vec<RecordRow> = sqlx::query_as(
            r#"
            SELECT id, data, created_at, updated_at
            FROM data_records
            WHERE data_model_id = $1
              AND deleted_at IS NULL
              AND ($2::TEXT IS NULL OR data::TEXT ILIKE $2)
              AND ($3::UUID[] IS NULL OR id = ANY($3))
            ORDER BY created_at DESC, id ASC
            OFFSET $4
            LIMIT $5
            "#,
        )
        .bind(data_model_id)
        .bind(search_param(filters))
        .bind(filters.ids.as_deref())
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DataRecord {
                id: row.id,
                payload: match row.data {
                    Value::Object(map) => map,
                    other => {
                        let mut map = Row::new();
                        map.insert("value".to_string(), other);
                        map
                    },
                },
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
            .collect())
    }
}
