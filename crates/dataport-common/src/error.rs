//! Error types for Dataport

use thiserror::Error;

/// Result type alias for codec and shared operations
pub type Result<T> = std::result::Result<T, DataportError>;

/// Main error type for the shared crate
#[derive(Error, Debug)]
pub enum DataportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Spreadsheet error: {0}")]
    Spreadsheet(String),

    #[error("Unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<calamine::XlsxError> for DataportError {
    fn from(err: calamine::XlsxError) -> Self {
        DataportError::Spreadsheet(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for DataportError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        DataportError::Spreadsheet(err.to_string())
    }
}
