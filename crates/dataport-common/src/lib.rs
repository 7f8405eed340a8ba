//! Dataport Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared, I/O-free building blocks for the Dataport workspace.
//!
//! # Overview
//!
//! - **Codec**: CSV, spreadsheet (XLSX) and JSON conversion between byte buffers
//!   and row objects
//! - **Error Handling**: Common error type and result alias
//! - **Logging**: Centralised `tracing` subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use dataport_common::codec::{decode, CsvDialect, FileFormat};
//!
//! fn count_rows(bytes: &[u8]) -> dataport_common::Result<usize> {
//!     let rows = decode(bytes, FileFormat::Csv, CsvDialect::Naive)?;
//!     Ok(rows.len())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use codec::{CsvDialect, FileFormat, Row};
pub use error::{DataportError, Result};
