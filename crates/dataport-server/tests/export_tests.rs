//! Export job integration tests

mod common;

use chrono::{Duration, Utc};
use common::{csv_file, export_record, import_record, row, small_batches, Harness};
use dataport_common::{codec, CsvDialect, FileFormat};
use dataport_server::jobs::types::{ExportFilters, ExportResult};
use dataport_server::jobs::{JobKind, JobResult, JobStatus};
use dataport_server::records::MemoryRecordStore;
use dataport_server::storage::MemoryBackend;
use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

fn export_result(result: Option<JobResult>) -> ExportResult {
    match result {
        Some(JobResult::Export(result)) => result,
        other => panic!("expected an export result, got {:?}", other),
    }
}

fn object_key(result: &ExportResult) -> String {
    format!("exports/{}", result.file_name)
}

#[tokio::test]
async fn test_empty_csv_export_completes() {
    let harness = Harness::new(small_batches());
    let id = harness
        .submit_export(export_record(Uuid::new_v4(), "csv", ExportFilters::default(), Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(job.data.total_rows, Some(0));
    assert_eq!(job.data.processed_rows, 0);

    let result = export_result(job.result);
    assert_eq!(result.file_size, 0);
    assert_eq!(harness.blobs.get(&object_key(&result)), Some(Vec::new()));
}

#[tokio::test]
async fn test_empty_json_export_is_an_empty_array() {
    let harness = Harness::new(small_batches());
    let id = harness
        .submit_export(export_record(Uuid::new_v4(), "json", ExportFilters::default(), Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;

    assert_eq!(job.status, JobStatus::Completed);
    let result = export_result(job.result);
    assert!(result.file_name.ends_with(".json"));
    let body = harness.blobs.get(&object_key(&result)).unwrap();
    assert_eq!(serde_json::from_slice::<serde_json::Value>(&body).unwrap(), json!([]));
}

#[tokio::test]
async fn test_failed_upload_fails_the_export() {
    let harness = Harness::build(
        small_batches(),
        MemoryRecordStore::new(),
        Some(MemoryBackend::new().with_failing_uploads()),
    );
    let model = Uuid::new_v4();
    harness.records.seed(model, row(json!({"name": "Ada"})), Utc::now());

    let id = harness
        .submit_export(export_record(model, "csv", ExportFilters::default(), Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.result.is_none());
    assert!(job
        .error
        .as_deref()
        .unwrap_or_default()
        .starts_with("Storage operation failed"));

    let stored = harness.jobs.state(JobKind::Export, id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.result.is_none());
    assert!(stored.error_message.is_some());
    assert!(harness.blobs.keys().is_empty());
}

#[tokio::test]
async fn test_export_without_storage_fails() {
    let harness = Harness::without_storage(small_batches());
    let id = harness
        .submit_export(export_record(Uuid::new_v4(), "csv", ExportFilters::default(), Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("No storage service configured"));
}

#[tokio::test]
async fn test_unknown_export_format_fails() {
    let harness = Harness::new(small_batches());
    let id = harness
        .submit_export(export_record(Uuid::new_v4(), "pdf", ExportFilters::default(), Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some("Unsupported file format: pdf"));
}

#[tokio::test]
async fn test_export_batches_report_progress() {
    let harness = Harness::new(small_batches());
    let model = Uuid::new_v4();
    let base = Utc::now();
    for i in 0..25 {
        harness.records.seed(
            model,
            row(json!({"name": format!("person-{}", i)})),
            base + Duration::seconds(i),
        );
    }

    let id = harness
        .submit_export(export_record(model, "csv", ExportFilters::default(), vec!["name".to_string()]))
        .await;
    let job = harness.wait_for_terminal(id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.data.processed_rows, 25);
    assert_eq!(harness.progress_checkpoints(id), vec![0, 0, 40, 80, 99, 100]);

    let result = export_result(job.result);
    let body = String::from_utf8(harness.blobs.get(&object_key(&result)).unwrap()).unwrap();
    let lines: Vec<&str> = body.lines().collect();
    assert_eq!(lines.len(), 26);
    assert_eq!(lines[0], "name");
    // Newest first
    assert_eq!(lines[1], "person-24");
    assert_eq!(lines[25], "person-0");
    assert_eq!(result.file_size, body.len() as i64);
    assert_eq!(
        harness.blobs.content_type(&object_key(&result)).as_deref(),
        Some(FileFormat::Csv.content_type())
    );
}

#[tokio::test]
async fn test_export_applies_filters_and_default_columns() {
    let harness = Harness::new(small_batches());
    let model = Uuid::new_v4();
    let base = Utc::now();
    let ada = harness
        .records
        .seed(model, row(json!({"name": "Ada Lovelace", "field": "math"})), base);
    let grace = harness.records.seed(
        model,
        row(json!({"name": "Grace Hopper", "field": "navy"})),
        base + Duration::seconds(1),
    );
    let deleted = harness
        .records
        .seed(model, row(json!({"name": "Ada Clone"})), base);
    harness.records.soft_delete(model, deleted);

    let search = ExportFilters {
        search: Some("ada".to_string()),
        ids: None,
    };
    let id = harness
        .submit_export(export_record(model, "json", search, Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;

    let result = export_result(job.result);
    let body: serde_json::Value =
        serde_json::from_slice(&harness.blobs.get(&object_key(&result)).unwrap()).unwrap();
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], json!(ada.to_string()));
    assert_eq!(items[0]["name"], json!("Ada Lovelace"));
    let keys: Vec<&String> = items[0].as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["id", "name", "field", "created_at", "updated_at"]);

    let by_id = ExportFilters {
        search: None,
        ids: Some(vec![grace]),
    };
    let id = harness
        .submit_export(export_record(model, "csv", by_id, vec!["name".to_string(), "field".to_string()]))
        .await;
    let job = harness.wait_for_terminal(id).await;
    let result = export_result(job.result);
    let body = String::from_utf8(harness.blobs.get(&object_key(&result)).unwrap()).unwrap();
    assert_eq!(body, "name,field\nGrace Hopper,navy");
}

#[tokio::test]
async fn test_xlsx_export_can_be_read_back() {
    let harness = Harness::new(small_batches());
    let model = Uuid::new_v4();
    let base = Utc::now();
    harness
        .records
        .seed(model, row(json!({"name": "Ada", "age": 36})), base);
    harness
        .records
        .seed(model, row(json!({"name": "Grace", "age": 85})), base + Duration::seconds(1));

    let id = harness
        .submit_export(export_record(
            model,
            "xlsx",
            ExportFilters::default(),
            vec!["name".to_string(), "age".to_string()],
        ))
        .await;
    let job = harness.wait_for_terminal(id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let result = export_result(job.result);
    assert!(result.file_name.ends_with(".xlsx"));
    let bytes = harness.blobs.get(&object_key(&result)).unwrap();
    let rows = codec::decode(&bytes, FileFormat::Xlsx, CsvDialect::default()).unwrap();
    assert_eq!(
        rows,
        vec![
            row(json!({"name": "Grace", "age": 85})),
            row(json!({"name": "Ada", "age": 36})),
        ]
    );
}

#[tokio::test]
async fn test_naive_csv_round_trip_splits_embedded_commas() {
    let harness = Harness::new(small_batches());
    let source = Uuid::new_v4();
    let original = row(json!({"name": "Lovelace, Ada", "age": "36"}));
    harness.records.seed(source, original.clone(), Utc::now());

    let id = harness
        .submit_export(export_record(
            source,
            "csv",
            ExportFilters::default(),
            vec!["name".to_string(), "age".to_string()],
        ))
        .await;
    let export = export_result(harness.wait_for_terminal(id).await.result);

    let target = Uuid::new_v4();
    harness.records.set_attributes(target, &["name", "age"]);
    let id = harness
        .submit_import(import_record(target, Some(csv_file(&object_key(&export))), Vec::new()))
        .await;
    let job = harness.wait_for_terminal(id).await;
    assert_eq!(job.status, JobStatus::Completed);

    let imported = harness.records.records(target);
    assert_eq!(imported.len(), 1);
    assert_ne!(imported[0].payload, original);
    assert_eq!(imported[0].payload, row(json!({"name": "Lovelace", "age": "Ada"})));
}
