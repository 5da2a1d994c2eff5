//! Core domain model for wotrack: work orders, executions, actors and sync progress.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

mod civil;
mod reconcile;

pub use civil::{CivilCalendar, CivilDate, CIVIL_DATE_FORMAT, DEFAULT_CIVIL_TZ, NO_DATE_MARKER};
pub use reconcile::{
    derive_status_label, is_cancelled_status, is_completed_today, normalize_for_match,
    summarize, ChildSummary, DailySummary, EnrichedOrder, MarkerTable, ObservationMarker,
    Reconciler, StatusLabel,
};

pub const CRATE_NAME: &str = "wotrack-core";

/// Work order whose authoritative fields come from the spreadsheet of record.
///
/// Only the sync pipeline writes `raw_status`, `completion_date_text` and
/// `attributes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub external_code: String,
    pub raw_status: String,
    /// Civil date literal (`dd/mm/yyyy`), a timestamp, or [`NO_DATE_MARKER`].
    pub completion_date_text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub last_modified: DateTime<Utc>,
}

impl Order {
    pub fn has_completion_date(&self) -> bool {
        let text = self.completion_date_text.trim();
        !text.is_empty() && text != NO_DATE_MARKER
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Pending,
    Done,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Done => "DONE",
        }
    }
}

impl FromStr for ExecutionState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "DONE" => Ok(Self::Done),
            _ => Err(ParseEnumError::new("execution state", s)),
        }
    }
}

/// Foreign key to whoever owns an execution or receives a notification.
///
/// `Legacy` references only exist until the identity merge has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ActorRef {
    Legacy(Uuid),
    Team(Uuid),
}

/// Application-tracked handling of an order. At most one per order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub order_id: Uuid,
    pub owner: Option<ActorRef>,
    pub state: ExecutionState,
    pub observation: String,
    pub last_modified: DateTime<Utc>,
}

/// Per-box (or similar) completion entry hanging off an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub label: String,
    pub state: ExecutionState,
    pub completion_date_text: String,
}

/// Read-side join of an order with its application-owned data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBundle {
    pub order: Order,
    pub execution: Option<Execution>,
    #[serde(default)]
    pub children: Vec<ChildRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Supervisor,
    Team,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Supervisor => "supervisor",
            Self::Team => "team",
        }
    }
}

impl FromStr for Role {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "supervisor" => Ok(Self::Supervisor),
            "team" | "technician" => Ok(Self::Team),
            _ => Err(ParseEnumError::new("role", s)),
        }
    }
}

/// Opaque credential material. Hashing happens in the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Credentials {
    pub password_hash: Option<String>,
    #[serde(default)]
    pub must_change_password: bool,
}

/// Unified team identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    /// Internal short code, used as a login fallback for teams with unusable names.
    pub code: Option<String>,
    /// Globally unique once the identity merge has completed.
    pub login_name: Option<String>,
    pub display_name: String,
    pub credentials: Credentials,
    pub role: Role,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Pre-merge technician record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyActor {
    pub id: Uuid,
    pub login_name: Option<String>,
    pub display_name: String,
    pub credentials: Credentials,
    pub active: bool,
    /// Actor this record was folded into, once the identity merge reached it.
    #[serde(default)]
    pub merged_into: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub recipient: ActorRef,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Running,
    Completed,
    Error,
}

impl SyncStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Process-wide progress of the sync pipeline. Always replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub total: usize,
    pub current: usize,
    pub status: SyncStatus,
    pub message: String,
    pub last_update: DateTime<Utc>,
}

impl SyncProgress {
    pub fn idle(at: DateTime<Utc>) -> Self {
        Self {
            total: 0,
            current: 0,
            status: SyncStatus::Idle,
            message: String::new(),
            last_update: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy(id) => write!(f, "legacy:{id}"),
            Self::Team(id) => write!(f, "team:{id}"),
        }
    }
}
