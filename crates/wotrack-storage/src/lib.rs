//! Persistence contracts and backends for wotrack.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use wotrack_core::{
    Actor, ChildRecord, Credentials, Execution, LegacyActor, Notification, Order, OrderBundle,
    Role,
};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgIdentityTx, PgStore};

pub const CRATE_NAME: &str = "wotrack-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend cannot be reached at all. Callers treat this as fatal.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_systemic(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => Self::Unavailable(err.to_string()),
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.message().to_string())
            }
            _ => Self::Backend(err.to_string()),
        }
    }
}

/// Spreadsheet-owned order fields written by the sync pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpsert {
    pub external_code: String,
    pub raw_status: String,
    pub completion_date_text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl OrderUpsert {
    fn matches(&self, order: &Order) -> bool {
        order.raw_status == self.raw_status
            && order.completion_date_text == self.completion_date_text
            && order.attributes == self.attributes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Only `last_modified` was refreshed.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RelinkCounts {
    pub executions: usize,
    pub notifications: usize,
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Soft upsert keyed by external code. Never touches executions or child records.
    async fn upsert_order(
        &self,
        row: &OrderUpsert,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn get_order_by_code(&self, external_code: &str) -> Result<Option<Order>, StoreError>;

    async fn load_bundle(&self, order_id: Uuid) -> Result<Option<OrderBundle>, StoreError>;

    async fn list_bundles(&self) -> Result<Vec<OrderBundle>, StoreError>;

    /// Insert or replace the single execution attached to `execution.order_id`.
    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn save_child_record(&self, child: &ChildRecord) -> Result<(), StoreError>;
}

/// Unit of work used by the identity merge. Dropping it without calling
/// [`IdentityTx::commit`] discards every change made through it.
#[async_trait]
pub trait IdentityTx: Send {
    /// Login names compare case-insensitively.
    async fn find_actor_by_login(&mut self, login_name: &str) -> Result<Option<Actor>, StoreError>;

    async fn insert_actor(&mut self, actor: &Actor) -> Result<(), StoreError>;

    async fn update_actor(&mut self, actor: &Actor) -> Result<(), StoreError>;

    /// Repoint every execution and notification owned by `legacy_id` at `actor_id`.
    async fn reassign_legacy_refs(
        &mut self,
        legacy_id: Uuid,
        actor_id: Uuid,
    ) -> Result<RelinkCounts, StoreError>;

    /// Record that `legacy_id` now lives on as `actor_id`.
    async fn mark_legacy_merged(&mut self, legacy_id: Uuid, actor_id: Uuid) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn list_legacy_actors(&self) -> Result<Vec<LegacyActor>, StoreError>;

    async fn list_actors(&self) -> Result<Vec<Actor>, StoreError>;

    async fn begin_identity_tx(&self) -> Result<Box<dyn IdentityTx>, StoreError>;

    /// Set login, credentials and role on an actor. Fails with
    /// [`StoreError::Conflict`] when the login is already taken.
    async fn assign_login(
        &self,
        actor_id: Uuid,
        login_name: &str,
        credentials: &Credentials,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn migration_marker(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn set_migration_marker(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn save_legacy_actor(&self, legacy: &LegacyActor) -> Result<(), StoreError>;

    async fn save_actor(&self, actor: &Actor) -> Result<(), StoreError>;

    async fn save_notification(&self, notification: &Notification) -> Result<(), StoreError>;

    async fn list_notifications(&self) -> Result<Vec<Notification>, StoreError>;
}
