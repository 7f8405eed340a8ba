//! Storage backend resolution tests
//!
//! Resolution order is: active `storage_connections` row, then MinIO
//! environment variables, then AWS S3 environment variables. A live service
//! resolves again before every operation. Tests touching the process
//! environment or the database run serially.

use dataport_server::error::StorageError;
use dataport_server::storage::config::{StorageConfig, StorageConnection, StorageKind};
use dataport_server::storage::{MemoryBackend, StorageService};
use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;

const STORAGE_ENV: &[&str] = &[
    "MINIO_ENDPOINT",
    "MINIO_ACCESS_KEY",
    "MINIO_SECRET_KEY",
    "MINIO_BUCKET",
    "MINIO_USE_SSL",
    "MINIO_REGION",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_S3_BUCKET",
    "AWS_REGION",
];

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

fn minio_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("MINIO_ENDPOINT", "minio.local:9000"),
        ("MINIO_ACCESS_KEY", "minio"),
        ("MINIO_SECRET_KEY", "minio-secret"),
    ]
}

fn s3_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("AWS_ACCESS_KEY_ID", "AKIA"),
        ("AWS_SECRET_ACCESS_KEY", "secret"),
        ("AWS_S3_BUCKET", "exports-bucket"),
    ]
}

fn connection(connection_type: &str, config: serde_json::Value) -> StorageConnection {
    StorageConnection {
        name: "primary".to_string(),
        connection_type: connection_type.to_string(),
        config,
    }
}

#[test]
fn test_explicit_connection_wins_over_environment() {
    let explicit = connection(
        "s3",
        json!({"accessKey": "row-key", "secretKey": "row-secret", "bucket": "row-bucket"}),
    );
    let mut vars = minio_env();
    vars.extend(s3_env());

    let config = StorageConfig::resolve(Some(&explicit), env(&vars)).unwrap();
    assert_eq!(config.kind, StorageKind::S3);
    assert_eq!(config.bucket, "row-bucket");
    assert_eq!(config.access_key, "row-key");
}

#[test]
fn test_unusable_connection_falls_back_to_environment() {
    // MinIO rows need an endpoint
    let explicit = connection("minio", json!({"accessKey": "k", "secretKey": "s"}));
    let config = StorageConfig::resolve(Some(&explicit), env(&minio_env())).unwrap();
    assert_eq!(config.kind, StorageKind::Minio);
    assert_eq!(config.endpoint.as_deref(), Some("http://minio.local:9000"));
}

#[test]
fn test_minio_environment_wins_over_s3() {
    let mut vars = minio_env();
    vars.extend(s3_env());

    let config = StorageConfig::resolve(None, env(&vars)).unwrap();
    assert_eq!(config.kind, StorageKind::Minio);
    assert!(config.path_style);
}

#[test]
fn test_s3_environment_is_the_last_resort() {
    let config = StorageConfig::resolve(None, env(&s3_env())).unwrap();
    assert_eq!(config.kind, StorageKind::S3);
    assert_eq!(config.bucket, "exports-bucket");
    assert_eq!(
        config.object_url("exports/a.csv"),
        format!("https://exports-bucket.s3.{}.amazonaws.com/exports/a.csv", config.region)
    );
}

#[test]
fn test_nothing_configured() {
    assert!(StorageConfig::resolve(None, env(&[])).is_none());
    assert!(!StorageService::unconfigured().is_configured());
}

#[tokio::test]
async fn test_unconfigured_service_rejects_every_operation() {
    let storage = StorageService::unconfigured();
    assert_eq!(
        storage.upload_file("exports/a.csv", b"a".to_vec(), "text/csv").await,
        Err(StorageError::BackendUnavailable)
    );
    assert_eq!(
        storage.download_file("uploads/a.csv").await,
        Err(StorageError::BackendUnavailable)
    );
}

#[tokio::test]
async fn test_upload_reports_url_size_and_checksum() {
    let blobs = Arc::new(MemoryBackend::new());
    let storage = StorageService::new(blobs.clone());

    let uploaded = storage
        .upload_file("exports/hello.json", b"hello".to_vec(), "application/json")
        .await
        .unwrap();
    assert_eq!(uploaded.url, "memory://exports/hello.json");
    assert_eq!(uploaded.size, 5);
    assert_eq!(
        uploaded.checksum,
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    assert_eq!(blobs.content_type("exports/hello.json").as_deref(), Some("application/json"));
    assert_eq!(storage.download_file("exports/hello.json").await.unwrap(), b"hello".to_vec());
}

fn clear_storage_env() -> Vec<(&'static str, Option<String>)> {
    let saved = STORAGE_ENV.iter().map(|key| (*key, std::env::var(key).ok())).collect();
    for key in STORAGE_ENV {
        std::env::remove_var(key);
    }
    saved
}

fn restore_env(saved: Vec<(&'static str, Option<String>)>) {
    for (key, value) in saved {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
}

#[tokio::test]
#[serial]
async fn test_live_service_follows_environment_changes() {
    let saved = clear_storage_env();

    // No database: the connection lookup fails and the environment decides
    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(std::time::Duration::from_millis(200))
        .connect_lazy("postgresql://127.0.0.1:1/none")
        .unwrap();
    let storage = StorageService::live(pool);
    assert!(storage.is_configured());
    assert_eq!(storage.active_backend().await, None);
    assert_eq!(
        storage.download_file("uploads/a.csv").await,
        Err(StorageError::BackendUnavailable)
    );

    // Same service, no restart
    for (key, value) in minio_env() {
        std::env::set_var(key, value);
    }
    assert_eq!(storage.active_backend().await.as_deref(), Some("minio"));

    // A failing lookup keeps the backend already in use
    for key in STORAGE_ENV {
        std::env::remove_var(key);
    }
    assert_eq!(storage.active_backend().await.as_deref(), Some("minio"));

    restore_env(saved);
}

#[tokio::test]
#[serial]
async fn test_live_service_picks_up_activated_connection_row() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&url)
        .await
        .unwrap();
    sqlx::migrate!("../../migrations").run(&pool).await.unwrap();

    let saved = clear_storage_env();
    sqlx::query("UPDATE storage_connections SET is_active = FALSE WHERE name LIKE 'test-%'")
        .execute(&pool)
        .await
        .unwrap();

    let storage = StorageService::live(pool.clone());
    let before = storage.active_backend().await;

    let name = format!("test-{}", uuid::Uuid::new_v4());
    sqlx::query(
        r#"
        INSERT INTO storage_connections (name, connection_type, is_active, config)
        VALUES ($1, 'minio', TRUE, $2)
        "#,
    )
    .bind(&name)
    .bind(json!({"endpoint": "minio.local:9000", "accessKey": "k", "secretKey": "s"}))
    .execute(&pool)
    .await
    .unwrap();

    let after = storage.active_backend().await;

    sqlx::query("DELETE FROM storage_connections WHERE name = $1")
        .bind(&name)
        .execute(&pool)
        .await
        .unwrap();
    restore_env(saved);

    assert_eq!(before, None);
    assert_eq!(after.as_deref(), Some("minio"));
}
