use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default region when none is configured
pub const DEFAULT_REGION: &str = "us-east-1";

/// Default MinIO bucket
pub const DEFAULT_MINIO_BUCKET: &str = "dataport";

/// Which kind of blob store a configuration points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Minio,
    S3,
}

impl StorageKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "minio" => Some(StorageKind::Minio),
            "s3" => Some(StorageKind::S3),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub kind: StorageKind,
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub use_ssl: bool,
    pub path_style: bool,
}

/// An active row of `storage_connections`
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct StorageConnection {
    pub name: String,
    pub connection_type: String,
    pub config: Value,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim).map(str::to_lowercase).as_deref() {
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        _ => default,
    }
}

/// Prefix `endpoint` with a scheme when it has none
fn endpoint_url(endpoint: &str, use_ssl: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if use_ssl {
        format!("https://{}", endpoint)
    } else {
        format!("http://{}", endpoint)
    }
}

impl StorageConfig {
    /// Configuration from a `storage_connections` row
    ///
    /// Returns `None` for unknown connection types or rows missing credentials.
    pub fn from_connection(connection: &StorageConnection) -> Option<Self> {
        let kind = StorageKind::parse(&connection.connection_type)?;
        let field = |key: &str| -> Option<String> {
            match connection.config.get(key)? {
                Value::String(s) => non_empty(Some(s.clone())),
                Value::Bool(b) => Some(b.to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            }
        };

        let access_key = field("accessKey").or_else(|| field("access_key"))?;
        let secret_key = field("secretKey").or_else(|| field("secret_key"))?;
        let use_ssl = parse_bool(field("useSSL").or_else(|| field("use_ssl")), kind == StorageKind::S3);
        let endpoint = field("endpoint").map(|e| endpoint_url(&e, use_ssl));

        if kind == StorageKind::Minio && endpoint.is_none() {
            return None;
        }

        Some(Self {
            kind,
            path_style: kind == StorageKind::Minio,
            endpoint,
            region: field("region").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket: field("bucket").unwrap_or_else(|| DEFAULT_MINIO_BUCKET.to_string()),
            access_key,
            secret_key,
            use_ssl,
        })
    }

    /// `MINIO_ENDPOINT`, `MINIO_ACCESS_KEY` and `MINIO_SECRET_KEY` must all be set
    pub fn from_minio_env(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let endpoint = non_empty(lookup("MINIO_ENDPOINT"))?;
        let access_key = non_empty(lookup("MINIO_ACCESS_KEY"))?;
        let secret_key = non_empty(lookup("MINIO_SECRET_KEY"))?;
        let use_ssl = parse_bool(lookup("MINIO_USE_SSL"), false);

        Some(Self {
            kind: StorageKind::Minio,
            endpoint: Some(endpoint_url(&endpoint, use_ssl)),
            region: non_empty(lookup("MINIO_REGION")).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket: non_empty(lookup("MINIO_BUCKET"))
                .unwrap_or_else(|| DEFAULT_MINIO_BUCKET.to_string()),
            access_key,
            secret_key,
            use_ssl,
            path_style: true,
        })
    }

    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_S3_BUCKET` must all be set
    pub fn from_s3_env(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let access_key = non_empty(lookup("AWS_ACCESS_KEY_ID"))?;
        let secret_key = non_empty(lookup("AWS_SECRET_ACCESS_KEY"))?;
        let bucket = non_empty(lookup("AWS_S3_BUCKET"))?;

        Some(Self {
            kind: StorageKind::S3,
            endpoint: None,
            region: non_empty(lookup("AWS_REGION")).unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket,
            access_key,
            secret_key,
            use_ssl: true,
            path_style: false,
        })
    }

    /// First usable configuration: explicit row, then MinIO env, then S3 env
    pub fn resolve(
        explicit: Option<&StorageConnection>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Option<Self> {
        explicit
            .and_then(Self::from_connection)
            .or_else(|| Self::from_minio_env(&lookup))
            .or_else(|| Self::from_s3_env(&lookup))
    }

    /// Public URL of an object
    pub fn object_url(&self, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint.trim_end_matches('/'), self.bucket, key),
            None => format!("https://{}.s3.{}.amazonaws.com/{}", self.bucket, self.region, key),
        }
    }
}
