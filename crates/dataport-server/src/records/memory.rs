//! In-process record store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dataport_common::Row;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{DataRecord, RecordStore};
use crate::error::RecordError;
use crate::jobs::types::ExportFilters;

type InsertCheck = Box<dyn Fn(&Row) -> Option<RecordError> + Send + Sync>;

#[derive(Default)]
struct Models {
    attributes: HashMap<Uuid, Vec<String>>,
    records: HashMap<Uuid, Vec<StoredRecord>>,
}

#[derive(Clone)]
struct StoredRecord {
    record: DataRecord,
    deleted: bool,
}

/// Record store held in memory, with an optional insert check for failure tests
#[derive(Default)]
pub struct MemoryRecordStore {
    models: Mutex<Models>,
    insert_check: Option<InsertCheck>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject inserts for which `check` returns an error
    pub fn with_insert_check(
        mut self,
        check: impl Fn(&Row) -> Option<RecordError> + Send + Sync + 'static,
    ) -> Self {
        self.insert_check = Some(Box::new(check));
        self
    }

    fn models(&self) -> std::sync::MutexGuard<'_, Models> {
        self.models.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_attributes(&self, data_model_id: Uuid, names: &[&str]) {
        self.models()
            .attributes
            .insert(data_model_id, names.iter().map(|n| n.to_string()).collect());
    }

    /// Seed a record with an explicit creation time
    pub fn seed(&self, data_model_id: Uuid, payload: Row, created_at: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.models()
            .records
            .entry(data_model_id)
            .or_default()
            .push(StoredRecord {
                record: DataRecord {
                    id,
                    payload,
                    created_at,
                    updated_at: created_at,
                },
                deleted: false,
            });
        id
    }

    pub fn soft_delete(&self, data_model_id: Uuid, id: Uuid) {
        if let Some(records) = self.models().records.get_mut(&data_model_id) {
            for stored in records.iter_mut().filter(|s| s.record.id == id) {
                stored.deleted = true;
            }
        }
    }

    /// Live records of a data model, in insertion order
    pub fn records(&self, data_model_id: Uuid) -> Vec<DataRecord> {
        self.models()
            .records
            .get(&data_model_id)
            .map(|records| {
                records
                    .iter()
                    .filter(|s| !s.deleted)
                    .map(|s| s.record.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn matching(&self, data_model_id: Uuid, filters: &ExportFilters) -> Vec<DataRecord> {
        let needle = filters
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        let mut matching: Vec<DataRecord> = self
            .records(data_model_id)
            .into_iter()
            .filter(|record| match &filters.ids {
                Some(ids) => ids.contains(&record.id),
                None => true,
            })
            .filter(|record| match &needle {
                Some(needle) => serde_json::to_string(&record.payload)
                    .map(|text| text.to_lowercase().contains(needle.as_str()))
                    .unwrap_or(false),
                None => true,
            })
            .collect();

        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        matching
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn attribute_names(&self, data_model_id: Uuid) -> Result<Vec<String>, RecordError> {
        Ok(self
            .models()
            .attributes
            .get(&data_model_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_record(&self, data_model_id: Uuid, payload: &Row) -> Result<Uuid, RecordError> {
        if let Some(err) = self.insert_check.as_ref().and_then(|check| check(payload)) {
            return Err(err);
        }
        Ok(self.seed(data_model_id, payload.clone(), Utc::now()))
    }

    async fn count_matching(
        &self,
        data_model_id: Uuid,
        filters: &ExportFilters,
    ) -> Result<i64, RecordError> {
        Ok(self.matching(data_model_id, filters).len() as i64)
    }

    async fn fetch_batch(
        &self,
        data_model_id: Uuid,
        filters: &ExportFilters,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DataRecord>, RecordError> {
        let offset = usize::try_from(offset).unwrap_or(0);
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .matching(data_model_id, filters)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }
}
