//! Tabular row sources.
//!
//! A [`Dataset`] is an ordered list of rows sharing one column set. It can be
//! read from the first worksheet of an Excel workbook, from CSV (delimiter
//! sniffed from the header line) or from a JSON array of objects. Nothing
//! beyond "rows of named fields" is interpreted.

use std::collections::HashSet;
use std::fs;
use std::io::Cursor;
use std::path::Path;

use calamine::{Data, DataType, Reader, Xlsx, XlsxError};
use chrono::{NaiveDate, NaiveTime};
use serde_json::Value;
use thiserror::Error;

/// Cell contents treated as missing when reading CSV.
const NULL_MARKERS: &[&str] = &[
    "#N/A", "#N/A N/A", "#NA", "-1.#IND", "-1.#QNAN", "-NaN", "-nan", "1.#IND", "1.#QNAN",
    "<NA>", "N/A", "NA", "NULL", "NaN", "None", "n/a", "nan", "null",
];

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Errors raised while loading a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("failed to read dataset file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed workbook: {0}")]
    Workbook(#[from] XlsxError),
    #[error("workbook has no worksheet")]
    NoWorksheet,
    #[error("dataset has no header row")]
    MissingHeader,
    #[error("column {0} has an empty name")]
    EmptyColumnName(usize),
    #[error("duplicate column name '{0}'")]
    DuplicateColumn(String),
    #[error("row {row} has {found} cells but the header defines {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error("JSON dataset must be an array of objects")]
    NotAnArray,
    #[error("JSON item {0} is not an object")]
    NotAnObject(usize),
    #[error("unsupported dataset format '{0}' (expected .xlsx, .csv or .json)")]
    UnsupportedFormat(String),
}

/// A raw cell value as it came out of the source.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Text(String),
    Integer(i64),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl RawCell {
    /// Interpret one text field; NA markers count as missing.
    pub fn from_text_field(field: &str) -> Self {
        let trimmed = field.trim();
        if trimmed.is_empty() || NULL_MARKERS.contains(&trimmed) {
            Self::Empty
        } else {
            Self::Text(field.to_string())
        }
    }
}

impl From<&Data> for RawCell {
    fn from(cell: &Data) -> Self {
        match cell {
            Data::Empty | Data::Error(_) => Self::Empty,
            Data::String(text) => Self::from_text_field(text),
            Data::Int(value) => Self::Integer(*value),
            Data::Float(value) => Self::Number(*value),
            Data::Bool(value) => Self::Bool(*value),
            Data::DateTime(_) | Data::DateTimeIso(_) => match cell.as_datetime() {
                Some(moment) if moment.time() == NaiveTime::MIN => Self::Date(moment.date()),
                Some(moment) => Self::Text(moment.format("%Y-%m-%d %H:%M:%S").to_string()),
                None => Self::Text(cell.to_string()),
            },
            Data::DurationIso(text) => Self::Text(text.clone()),
        }
    }
}

impl From<&Value> for RawCell {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Self::Empty,
            Value::Bool(b) => Self::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => n.as_f64().map(Self::Number).unwrap_or(Self::Empty),
            },
            Value::String(s) => Self::Text(s.clone()),
            nested => Self::Text(nested.to_string()),
        }
    }
}

/// One record, with cells aligned to the dataset's columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    cells: Vec<RawCell>,
}

impl Row {
    pub fn new(cells: Vec<RawCell>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[RawCell] {
        &self.cells
    }

    pub fn cell(&self, index: usize) -> &RawCell {
        self.cells.get(index).unwrap_or(&RawCell::Empty)
    }
}

/// Supported dataset file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetFormat {
    Xlsx,
    Csv,
    Json,
}

impl DatasetFormat {
    /// Detect the format from an uploaded file name.
    pub fn from_filename(filename: &str) -> Result<Self, DatasetError> {
        let extension = Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        match extension.as_str() {
            "xlsx" | "xlsm" => Ok(Self::Xlsx),
            "csv" | "tsv" | "txt" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => Err(DatasetError::UnsupportedFormat(filename.to_string())),
        }
    }
}

/// Ordered rows sharing a unique, non-empty column set.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dataset {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Dataset {
    /// Build a dataset, checking column names and row widths.
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Result<Self, DatasetError> {
        let mut seen = HashSet::new();
        for (index, column) in columns.iter().enumerate() {
            if column.trim().is_empty() {
                return Err(DatasetError::EmptyColumnName(index + 1));
            }
            if !seen.insert(column.as_str()) {
                return Err(DatasetError::DuplicateColumn(column.clone()));
            }
        }

        for (index, row) in rows.iter().enumerate() {
            if row.cells.len() != columns.len() {
                return Err(DatasetError::RaggedRow {
                    row: index + 1,
                    found: row.cells.len(),
                    expected: columns.len(),
                });
            }
        }

        Ok(Self { columns, rows })
    }

    /// Load an uploaded file, picking the reader from its extension.
    pub fn from_upload(filename: &str, data: &[u8]) -> Result<Self, DatasetError> {
        match DatasetFormat::from_filename(filename)? {
            DatasetFormat::Xlsx => Self::from_xlsx_bytes(data),
            DatasetFormat::Csv => Self::from_csv_bytes(data),
            DatasetFormat::Json => Self::from_json_bytes(data),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        Self::from_upload(&path.to_string_lossy(), &data)
    }

    /// Read CSV with a header row. Short records are padded with empty cells;
    /// trailing empty cells beyond the header are ignored.
    pub fn from_csv_bytes(data: &[u8]) -> Result<Self, DatasetError> {
        let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(sniff_delimiter(data))
            .has_headers(true)
            .flexible(true)
            .from_reader(data);

        let columns: Vec<String> = reader
            .headers()?
            .iter()
            .map(|name| name.trim().to_string())
            .collect();
        if columns.is_empty() || columns.iter().all(String::is_empty) {
            return Err(DatasetError::MissingHeader);
        }

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let overflow = record
                .iter()
                .skip(columns.len())
                .any(|field| !field.trim().is_empty());
            if overflow {
                return Err(DatasetError::RaggedRow {
                    row: index + 1,
                    found: record.len(),
                    expected: columns.len(),
                });
            }

            let mut cells: Vec<RawCell> = record
                .iter()
                .take(columns.len())
                .map(RawCell::from_text_field)
                .collect();
            cells.resize(columns.len(), RawCell::Empty);
            rows.push(Row::new(cells));
        }

        Self::new(columns, rows)
    }

    /// Read the first worksheet of a workbook. Its first row is the header;
    /// rows with no value at all are skipped.
    pub fn from_xlsx_bytes(data: &[u8]) -> Result<Self, DatasetError> {
        let mut workbook = Xlsx::new(Cursor::new(data))?;
        let sheet = workbook
            .worksheet_range_at(0)
            .ok_or(DatasetError::NoWorksheet)??;

        let mut rows = sheet.rows();
        let columns: Vec<String> = match rows.next() {
            Some(header) => header.iter().map(|cell| cell.to_string().trim().to_string()).collect(),
            None => return Err(DatasetError::MissingHeader),
        };
        if columns.iter().all(String::is_empty) {
            return Err(DatasetError::MissingHeader);
        }

        let rows = rows
            .map(|cells| cells.iter().map(RawCell::from).collect::<Vec<_>>())
            .filter(|cells| cells.iter().any(|cell| *cell != RawCell::Empty))
            .map(Row::new)
            .collect();

        Self::new(columns, rows)
    }

    /// Read a JSON array of flat objects. The column set is the union of keys
    /// in first-seen order; absent keys become empty cells.
    pub fn from_json_bytes(data: &[u8]) -> Result<Self, DatasetError> {
        let data = data.strip_prefix(UTF8_BOM).unwrap_or(data);
        let value: Value = serde_json::from_slice(data)?;
        let items = value.as_array().ok_or(DatasetError::NotAnArray)?;

        let mut columns: Vec<String> = Vec::new();
        let mut objects = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let object = item
                .as_object()
                .ok_or(DatasetError::NotAnObject(index + 1))?;
            for key in object.keys() {
                if !columns.iter().any(|column| column == key) {
                    columns.push(key.clone());
                }
            }
            objects.push(object);
        }

        let rows = objects
            .into_iter()
            .map(|object| {
                Row::new(
                    columns
                        .iter()
                        .map(|column| object.get(column).map(RawCell::from).unwrap_or(RawCell::Empty))
                        .collect(),
                )
            })
            .collect();

        Self::new(columns, rows)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

/// Pick the delimiter that occurs most often in the header line.
fn sniff_delimiter(data: &[u8]) -> u8 {
    let header = data.split(|b| *b == b'\n').next().unwrap_or_default();
    [b',', b';', b'\t', b'|']
        .into_iter()
        .map(|candidate| (candidate, header.iter().filter(|b| **b == candidate).count()))
        .filter(|(_, count)| *count > 0)
        .max_by_key(|(_, count)| *count)
        .map(|(candidate, _)| candidate)
        .unwrap_or(b',')
}
