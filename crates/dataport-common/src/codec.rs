//! File codecs for bulk import and export
//!
//! Stateless conversions between raw file bytes and row objects. A row is a JSON
//! object keyed by column name; column order is preserved.
//!
//! CSV comes in two dialects:
//! - [`CsvDialect::Naive`]: header line plus plain comma split, no quoting. This is
//!   the format existing consumers expect. A value containing a comma or a
//!   newline does not survive a round trip.
//! - [`CsvDialect::Rfc4180`]: quoting-aware reader and writer.

use calamine::{open_workbook_from_rs, Data, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Cursor;
use std::str::FromStr;

use crate::error::{DataportError, Result};

/// One decoded row
pub type Row = Map<String, Value>;

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Xlsx,
    Json,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Xlsx => "xlsx",
            FileFormat::Json => "json",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            FileFormat::Csv => "text/csv",
            FileFormat::Xlsx => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            },
            FileFormat::Json => "application/json",
        }
    }

    /// Detect the format of an uploaded file, MIME type first, then extension
    pub fn detect(mime_type: Option<&str>, file_name: Option<&str>) -> Result<Self> {
        if let Some(format) = mime_type.and_then(Self::from_mime) {
            return Ok(format);
        }

        if let Some(format) = file_name.and_then(Self::from_file_name) {
            return Ok(format);
        }

        Err(DataportError::UnsupportedFormat(
            mime_type
                .or(file_name)
                .unwrap_or("unknown")
                .to_string(),
        ))
    }

    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let essence = mime_type.split(';').next().unwrap_or("").trim().to_lowercase();
        match essence.as_str() {
            "text/csv" | "application/csv" | "text/comma-separated-values" => Some(FileFormat::Csv),
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel" => Some(FileFormat::Xlsx),
            "application/json" | "text/json" => Some(FileFormat::Json),
            _ => None,
        }
    }

    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let (_, extension) = file_name.rsplit_once('.')?;
        match extension.to_lowercase().as_str() {
            "csv" => Some(FileFormat::Csv),
            "xlsx" | "xls" => Some(FileFormat::Xlsx),
            "json" => Some(FileFormat::Json),
            _ => None,
        }
    }
}

impl FromStr for FileFormat {
    type Err = DataportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(FileFormat::Csv),
            "xlsx" | "excel" => Ok(FileFormat::Xlsx),
            "json" => Ok(FileFormat::Json),
            other => Err(DataportError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CSV flavour used for both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CsvDialect {
    #[default]
    Naive,
    Rfc4180,
}

impl FromStr for CsvDialect {
    type Err = DataportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "naive" | "legacy" => Ok(CsvDialect::Naive),
            "rfc4180" | "quoted" => Ok(CsvDialect::Rfc4180),
            other => Err(DataportError::Config(format!("Invalid CSV dialect: {}", other))),
        }
    }
}

/// Decode a file into rows
pub fn decode(bytes: &[u8], format: FileFormat, dialect: CsvDialect) -> Result<Vec<Row>> {
    match format {
        FileFormat::Csv => match dialect {
            CsvDialect::Naive => decode_csv_naive(bytes),
            CsvDialect::Rfc4180 => decode_csv_quoted(bytes),
        },
        FileFormat::Xlsx => decode_xlsx(bytes),
        FileFormat::Json => decode_json(bytes),
    }
}

/// Encode rows into a file
///
/// `columns` fixes the header and its order; when empty the header is every key
/// seen across `rows`, in first-seen order.
pub fn encode(
    rows: &[Row],
    columns: &[String],
    format: FileFormat,
    dialect: CsvDialect,
) -> Result<Vec<u8>> {
    let header = if columns.is_empty() {
        collect_columns(rows)
    } else {
        columns.to_vec()
    };

    match format {
        FileFormat::Csv => match dialect {
            CsvDialect::Naive => Ok(encode_csv_naive(rows, &header)),
            CsvDialect::Rfc4180 => encode_csv_quoted(rows, &header),
        },
        FileFormat::Xlsx => encode_xlsx(rows, &header),
        FileFormat::Json => encode_json(rows, columns),
    }
}

/// Every key across `rows`, in first-seen order
pub fn collect_columns(rows: &[Row]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.iter().any(|c| c == key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

/// Text form of a cell for the CSV writers
fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

fn decode_csv_naive(bytes: &[u8]) -> Result<Vec<Row>> {
    let text = String::from_utf8_lossy(bytes);
    let mut lines = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.trim().is_empty());

    let Some(header_line) = lines.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_line
        .trim_start_matches('\u{feff}')
        .split(',')
        .map(|h| h.trim().to_string())
        .collect();

    let rows = lines
        .map(|line| {
            let values: Vec<&str> = line.split(',').collect();
            headers
                .iter()
                .enumerate()
                .map(|(i, header)| {
                    let value = values.get(i).map(|v| v.trim()).unwrap_or("");
                    (header.clone(), Value::String(value.to_string()))
                })
                .collect::<Row>()
        })
        .collect();

    Ok(rows)
}

fn encode_csv_naive(rows: &[Row], header: &[String]) -> Vec<u8> {
    if header.is_empty() {
        return Vec::new();
    }

    let mut out = header.join(",");
    for row in rows {
        out.push('\n');
        let line: Vec<String> = header.iter().map(|c| cell_text(row.get(c))).collect();
        out.push_str(&line.join(","));
    }
    out.into_bytes()
}

fn decode_csv_quoted(bytes: &[u8]) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').to_string())
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        let row = headers
            .iter()
            .enumerate()
            .map(|(i, header)| {
                let value = record.get(i).unwrap_or("");
                (header.clone(), Value::String(value.to_string()))
            })
            .collect::<Row>();
        rows.push(row);
    }

    Ok(rows)
}

fn encode_csv_quoted(rows: &[Row], header: &[String]) -> Result<Vec<u8>> {
    if header.is_empty() {
        return Ok(Vec::new());
    }

    let mut writer = csv::WriterBuilder::new().from_writer(Vec::new());
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(header.iter().map(|c| cell_text(row.get(c))))?;
    }

    writer
        .into_inner()
        .map_err(|e| DataportError::Io(e.into_error()))
}

fn decode_xlsx(bytes: &[u8]) -> Result<Vec<Row>> {
    let mut workbook: Xlsx<_> = open_workbook_from_rs(Cursor::new(bytes))?;
    let range = match workbook.worksheet_range_at(0) {
        Some(range) => range?,
        None => return Ok(Vec::new()),
    };

    let mut row_iter = range.rows();
    let Some(header_cells) = row_iter.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header_cells
        .iter()
        .map(|cell| match cell {
            Data::Empty => String::new(),
            other => other.to_string().trim().to_string(),
        })
        .collect();

    let mut rows = Vec::new();
    for cells in row_iter {
        let mut row = Row::new();
        for (header, cell) in headers.iter().zip(cells.iter()) {
            if header.is_empty() {
                continue;
            }
            if let Some(value) = xlsx_cell_value(cell) {
                row.insert(header.clone(), value);
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }

    Ok(rows)
}

fn xlsx_cell_value(cell: &Data) -> Option<Value> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(s) => Some(Value::String(s.clone())),
        Data::Bool(b) => Some(Value::Bool(*b)),
        Data::Int(i) => Some(Value::from(*i)),
        Data::Float(f) => {
            // Spreadsheets store every number as a double
            if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                Some(Value::from(*f as i64))
            } else {
                serde_json::Number::from_f64(*f).map(Value::Number)
            }
        },
        other => Some(Value::String(other.to_string())),
    }
}

fn encode_xlsx(rows: &[Row], header: &[String]) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Export")?;

    for (col, name) in header.iter().enumerate() {
        sheet.write_string(0, xlsx_col(col)?, name.as_str())?;
    }

    for (index, row) in rows.iter().enumerate() {
        let row_num = u32::try_from(index + 1)
            .map_err(|_| DataportError::InvalidInput("too many rows for a worksheet".into()))?;
        for (col, name) in header.iter().enumerate() {
            let col = xlsx_col(col)?;
            match row.get(name) {
                None | Some(Value::Null) => {},
                Some(Value::Bool(b)) => {
                    sheet.write_boolean(row_num, col, *b)?;
                },
                Some(Value::Number(n)) => match n.as_f64() {
                    Some(f) => {
                        sheet.write_number(row_num, col, f)?;
                    },
                    None => {
                        sheet.write_string(row_num, col, n.to_string())?;
                    },
                },
                Some(Value::String(s)) => {
                    sheet.write_string(row_num, col, s.as_str())?;
                },
                Some(other) => {
                    sheet.write_string(row_num, col, other.to_string())?;
                },
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

fn xlsx_col(index: usize) -> Result<u16> {
    u16::try_from(index)
        .map_err(|_| DataportError::InvalidInput("too many columns for a worksheet".into()))
}

fn decode_json(bytes: &[u8]) -> Result<Vec<Row>> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Array(items) = value else {
        return Err(DataportError::InvalidInput(
            "JSON import must be an array of objects".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => Ok(map),
            _ => Err(DataportError::InvalidInput(format!(
                "JSON element {} is not an object",
                i + 1
            ))),
        })
        .collect()
}

fn encode_json(rows: &[Row], columns: &[String]) -> Result<Vec<u8>> {
    if columns.is_empty() {
        return Ok(serde_json::to_vec_pretty(rows)?);
    }

    let projected: Vec<Row> = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                .collect()
        })
        .collect();
    Ok(serde_json::to_vec_pretty(&projected)?)
}
