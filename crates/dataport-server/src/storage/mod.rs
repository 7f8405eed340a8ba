//! Blob storage adapter
//!
//! [`StorageService`] hides which backend is active. Uploads and downloads are
//! buffer-level: downloads drain the backend stream into one `Vec<u8>`.
//!
//! A service built with [`StorageService::live`] re-reads the active
//! `storage_connections` row before every operation, so switching connections
//! takes effect without a restart.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;

pub mod config;

use config::{StorageConfig, StorageConnection};

/// Chunks of an object being downloaded
pub type ObjectStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[async_trait]
pub trait BlobBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, StorageError>;

    fn object_url(&self, key: &str) -> String;
}

/// S3 API backend, used for both MinIO and AWS S3
#[derive(Clone)]
pub struct S3Backend {
    client: Client,
    config: StorageConfig,
}

impl S3Backend {
    pub fn new(config: StorageConfig) -> Self {
        debug!(kind = ?config.kind, bucket = %config.bucket, "Initializing S3 backend");

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "dataport-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Self { client, config }
    }
}

#[async_trait]
impl BlobBackend for S3Backend {
    fn name(&self) -> &str {
        match self.config.kind {
            config::StorageKind::Minio => "minio",
            config::StorageKind::S3 => "s3",
        }
    }

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::OperationFailed(DisplayErrorContext(&e).to_string()))?;

        Ok(())
    }

    async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, StorageError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::OperationFailed(DisplayErrorContext(&e).to_string()))?;

        let chunks = stream::unfold(Some(response.body), |state| async move {
            let mut body = state?;
            match body.try_next().await {
                Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
                Ok(None) => None,
                Err(e) => Some((Err(StorageError::DownloadStream(e.to_string())), None)),
            }
        });

        Ok(chunks.boxed())
    }

    fn object_url(&self, key: &str) -> String {
        self.config.object_url(key)
    }
}

#[derive(Default)]
struct MemoryObjects {
    objects: HashMap<String, (Vec<u8>, String)>,
}

/// Backend held in memory
///
/// Objects are streamed back in small chunks so callers exercise stream draining.
#[derive(Default)]
pub struct MemoryBackend {
    objects: Mutex<MemoryObjects>,
    fail_uploads: bool,
    fail_stream_after: Option<usize>,
}

impl MemoryBackend {
    pub const CHUNK_SIZE: usize = 8;

    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every upload
    pub fn with_failing_uploads(mut self) -> Self {
        self.fail_uploads = true;
        self
    }

    /// Break download streams after `chunks` chunks
    pub fn with_broken_streams(mut self, chunks: usize) -> Self {
        self.fail_stream_after = Some(chunks);
        self
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, MemoryObjects> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, key: &str, data: impl Into<Vec<u8>>) {
        self.objects()
            .objects
            .insert(key.to_string(), (data.into(), "application/octet-stream".to_string()));
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects().objects.get(key).map(|(data, _)| data.clone())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects().objects.get(key).map(|(_, ct)| ct.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects().objects.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn put_object(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        if self.fail_uploads {
            return Err(StorageError::OperationFailed(format!("upload of {} rejected", key)));
        }
        self.objects()
            .objects
            .insert(key.to_string(), (data, content_type.to_string()));
        Ok(())
    }

    async fn get_object_stream(&self, key: &str) -> Result<ObjectStream, StorageError> {
        let data = self
            .get(key)
            .ok_or_else(|| StorageError::OperationFailed(format!("object not found: {}", key)))?;

        let mut chunks: Vec<Result<Bytes, StorageError>> = data
            .chunks(Self::CHUNK_SIZE)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        if let Some(after) = self.fail_stream_after {
            chunks.truncate(after);
            chunks.push(Err(StorageError::DownloadStream("connection reset".to_string())));
        }

        Ok(stream::iter(chunks).boxed())
    }

    fn object_url(&self, key: &str) -> String {
        format!("memory://{}", key)
    }
}

/// Result of a successful upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub path: String,
    pub url: String,
    pub size: i64,
    pub checksum: String,
}

#[derive(Clone, Default)]
enum BackendSource {
    #[default]
    None,
    Fixed(Arc<dyn BlobBackend>),
    Live(Arc<LiveBackend>),
}

/// Backend resolved per operation, rebuilt only when the resolved config changes
struct LiveBackend {
    pool: PgPool,
    current: Mutex<Option<(StorageConfig, Arc<dyn BlobBackend>)>>,
}

impl LiveBackend {
    fn cached(&self) -> std::sync::MutexGuard<'_, Option<(StorageConfig, Arc<dyn BlobBackend>)>> {
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn backend(&self) -> Option<Arc<dyn BlobBackend>> {
        let explicit = match active_connection(&self.pool).await {
            Ok(connection) => connection,
            Err(e) => {
                // Keep the last good backend rather than dropping to the environment
                if let Some((_, backend)) = self.cached().as_ref() {
                    warn!("Failed to read storage connections, keeping current backend: {}", e);
                    return Some(backend.clone());
                }
                warn!("Failed to read storage connections, using environment: {}", e);
                None
            },
        };

        let config = StorageConfig::resolve(explicit.as_ref(), |key| std::env::var(key).ok());
        let mut cached = self.cached();
        let Some(config) = config else {
            if cached.take().is_some() {
                warn!("Storage backend is no longer configured");
            }
            return None;
        };

        if let Some((current, backend)) = cached.as_ref() {
            if *current == config {
                return Some(backend.clone());
            }
        }

        info!(kind = ?config.kind, bucket = %config.bucket, "Storage backend resolved");
        let backend: Arc<dyn BlobBackend> = Arc::new(S3Backend::new(config.clone()));
        *cached = Some((config, backend.clone()));
        Some(backend)
    }
}

/// Storage adapter used by the workers
#[derive(Clone, Default)]
pub struct StorageService {
    source: BackendSource,
}

impl StorageService {
    pub fn new(backend: Arc<dyn BlobBackend>) -> Self {
        Self {
            source: BackendSource::Fixed(backend),
        }
    }

    /// Service without a backend; every operation reports it as unavailable
    pub fn unconfigured() -> Self {
        Self {
            source: BackendSource::None,
        }
    }

    /// Service that resolves its backend before every operation
    pub fn live(pool: PgPool) -> Self {
        Self {
            source: BackendSource::Live(Arc::new(LiveBackend {
                pool,
                current: Mutex::new(None),
            })),
        }
    }

    /// Whether a backend is fixed or resolved per operation
    pub fn is_configured(&self) -> bool {
        !matches!(self.source, BackendSource::None)
    }

    /// Name of the backend the next operation would use
    pub async fn active_backend(&self) -> Option<String> {
        self.backend().await.ok().map(|backend| backend.name().to_string())
    }

    async fn backend(&self) -> Result<Arc<dyn BlobBackend>, StorageError> {
        let backend = match &self.source {
            BackendSource::None => None,
            BackendSource::Fixed(backend) => Some(backend.clone()),
            BackendSource::Live(live) => live.backend().await,
        };
        backend.ok_or(StorageError::BackendUnavailable)
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload_file(
        &self,
        path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadedFile, StorageError> {
        let backend = self.backend().await?;
        let checksum = calculate_sha256(&data);
        let size = data.len() as i64;

        debug!(backend = backend.name(), "Uploading {} bytes to {}", size, path);
        backend.put_object(path, data, content_type).await?;
        info!(backend = backend.name(), "Uploaded {}", path);

        Ok(UploadedFile {
            path: path.to_string(),
            url: backend.object_url(path),
            size,
            checksum,
        })
    }

    #[instrument(skip(self))]
    pub async fn download_file(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        let backend = self.backend().await?;
        let chunks = backend.get_object_stream(path).await?;

        let data = chunks
            .try_fold(Vec::new(), |mut buffer, chunk| async move {
                buffer.extend_from_slice(&chunk);
                Ok(buffer)
            })
            .await?;

        debug!(backend = backend.name(), "Downloaded {} bytes from {}", data.len(), path);
        Ok(data)
    }
}

async fn active_connection(pool: &PgPool) -> Result<Option<StorageConnection>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT name, connection_type, config
        FROM storage_connections
        WHERE is_active = TRUE
          AND connection_type IN ('minio', 's3')
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await
}

fn calculate_sha256(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
