//! Spreadsheet snapshot ingestion: the row contract, row validation and row sources.
//!
//! Parsing the spreadsheet itself happens upstream; sources here receive rows
//! that are already split into named columns.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use wotrack_core::NO_DATE_MARKER;
use wotrack_storage::OrderUpsert;

pub const CRATE_NAME: &str = "wotrack-ingest";

const MAX_EXTERNAL_CODE_LEN: usize = 64;

const EXTERNAL_CODE_KEYS: [&str; 4] = ["external_code", "externalId", "externalCode", "external_id"];

/// One spreadsheet row as handed over by the parser.
///
/// Numeric and boolean cells are read as their text form, since exports
/// often type order codes as numbers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SheetRow {
    #[serde(
        default,
        alias = "externalId",
        alias = "externalCode",
        alias = "external_id",
        deserialize_with = "cell_text"
    )]
    pub external_code: Option<String>,
    #[serde(default, alias = "rawStatus", alias = "status", deserialize_with = "cell_text")]
    pub raw_status: Option<String>,
    #[serde(
        default,
        alias = "completionDateText",
        alias = "completion_date",
        deserialize_with = "cell_text"
    )]
    pub completion_date_text: Option<String>,
    /// Every other column, carried through as display attributes.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
    /// Set when the row could not be read; validation rejects it.
    #[serde(skip)]
    pub malformed: Option<String>,
}

impl SheetRow {
    pub fn new(external_code: &str, raw_status: &str, completion_date_text: &str) -> Self {
        Self {
            external_code: Some(external_code.to_string()),
            raw_status: Some(raw_status.to_string()),
            completion_date_text: Some(completion_date_text.to_string()),
            ..Self::default()
        }
    }

    /// Read one row of a snapshot. Never fails: an unreadable row comes back
    /// marked malformed, keeping whatever external code could be salvaged.
    pub fn from_json(value: JsonValue) -> Self {
        let salvaged_code = value.as_object().and_then(|object| {
            EXTERNAL_CODE_KEYS
                .iter()
                .find_map(|key| object.get(*key))
                .and_then(scalar_text)
        });
        match serde_json::from_value::<SheetRow>(value) {
            Ok(row) => row,
            Err(err) => Self {
                external_code: salvaged_code,
                malformed: Some(err.to_string()),
                ..Self::default()
            },
        }
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn cell_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<JsonValue>::deserialize(deserializer)? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => scalar_text(&value)
            .map(Some)
            .ok_or_else(|| <D::Error as de::Error>::custom(format!("expected a text cell, found {value}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowValidationError {
    #[error("malformed row: {0}")]
    Malformed(String),
    #[error("row has no external code")]
    MissingExternalCode,
    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Turn a raw row into the spreadsheet-owned order fields.
///
/// Blank completion dates become [`NO_DATE_MARKER`]; a missing status becomes
/// an empty string.
pub fn validate_row(row: &SheetRow) -> Result<OrderUpsert, RowValidationError> {
    if let Some(reason) = &row.malformed {
        return Err(RowValidationError::Malformed(reason.clone()));
    }
    let external_code = row
        .external_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .ok_or(RowValidationError::MissingExternalCode)?;
    if external_code.chars().count() > MAX_EXTERNAL_CODE_LEN {
        return Err(RowValidationError::InvalidField {
            field: "external_code",
            reason: format!("longer than {MAX_EXTERNAL_CODE_LEN} characters"),
        });
    }
    if external_code.chars().any(char::is_control) {
        return Err(RowValidationError::InvalidField {
            field: "external_code",
            reason: "contains control characters".into(),
        });
    }

    let completion_date_text = row
        .completion_date_text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(NO_DATE_MARKER);

    Ok(OrderUpsert {
        external_code: external_code.to_string(),
        raw_status: row.raw_status.as_deref().unwrap_or_default().trim().to_string(),
        completion_date_text: completion_date_text.to_string(),
        attributes: attributes_from_extra(&row.extra),
    })
}

fn attributes_from_extra(extra: &BTreeMap<String, JsonValue>) -> BTreeMap<String, String> {
    extra
        .iter()
        .filter_map(|(key, value)| {
            let text = match value {
                JsonValue::Null => return None,
                JsonValue::String(s) => s.trim().to_string(),
                other => other.to_string(),
            };
            (!text.is_empty()).then(|| (key.clone(), text))
        })
        .collect()
}

/// A full spreadsheet export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sheet: String,
    #[serde(default)]
    pub exported_at: Option<DateTime<Utc>>,
    pub rows: Vec<SheetRow>,
}

#[derive(Deserialize)]
struct WrappedSnapshot {
    sheet: String,
    #[serde(default)]
    exported_at: Option<DateTime<Utc>>,
    rows: Vec<JsonValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Wrapped(WrappedSnapshot),
    Bare(Vec<JsonValue>),
}

/// Parse snapshot JSON: either `{ "sheet", "exported_at", "rows" }` or a bare row array.
///
/// Only the envelope can fail here. Rows are read one at a time, so a bad
/// row surfaces later as a [`RowValidationError::Malformed`].
pub fn parse_snapshot(bytes: &[u8], default_sheet: &str) -> Result<Snapshot> {
    let parsed: SnapshotFile = serde_json::from_slice(bytes).context("parsing snapshot json")?;
    let (sheet, exported_at, rows) = match parsed {
        SnapshotFile::Wrapped(w) => (w.sheet, w.exported_at, w.rows),
        SnapshotFile::Bare(rows) => (default_sheet.to_string(), None, rows),
    };
    Ok(Snapshot {
        sheet,
        exported_at,
        rows: rows.into_iter().map(SheetRow::from_json).collect(),
    })
}

pub fn load_snapshot_file(path: impl AsRef<Path>) -> Result<Snapshot> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_snapshot(&bytes, &sheet_name_for(path)).with_context(|| format!("parsing {}", path.display()))
}

fn sheet_name_for(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot".to_string())
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait RowSource: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self) -> Result<Snapshot, SourceError>;
}

#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
    name: String,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = sheet_name_for(&path);
        Self { path, name }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RowSource for JsonFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<Snapshot, SourceError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading {}", self.path.display()))?;
        let snapshot = parse_snapshot(&raw, &self.name)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(snapshot)
    }
}

#[derive(Debug, Clone)]
pub struct InMemorySource {
    snapshot: Snapshot,
}

impl InMemorySource {
    pub fn new(sheet: &str, rows: Vec<SheetRow>) -> Self {
        Self {
            snapshot: Snapshot {
                sheet: sheet.to_string(),
                exported_at: None,
                rows,
            },
        }
    }
}

#[async_trait]
impl RowSource for InMemorySource {
    fn name(&self) -> &str {
        &self.snapshot.sheet
    }

    async fn load(&self) -> Result<Snapshot, SourceError> {
        if self.snapshot.sheet.trim().is_empty() {
            return Err(SourceError::Message("in-memory source has no sheet name".into()));
        }
        Ok(self.snapshot.clone())
    }
}
