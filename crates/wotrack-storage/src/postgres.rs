//! Postgres backend. Schema lives in `migrations/` at the workspace root.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;
use wotrack_core::{
    Actor, ActorRef, ChildRecord, Credentials, Execution, ExecutionState, LegacyActor,
    Notification, Order, OrderBundle, Role,
};

use crate::{
    IdentityStore, IdentityTx, OrderStore, OrderUpsert, RelinkCounts, StoreError, UpsertOutcome,
};

const ORDER_COLUMNS: &str =
    "id, external_code, raw_status, completion_date_text, attributes, last_modified";
const EXECUTION_COLUMNS: &str =
    "id, order_id, legacy_technician_id, team_id, state, observation, last_modified";
const TEAM_COLUMNS: &str = "id, code, login_name, display_name, password_hash, must_change_password, role, active, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn owner_columns(owner: Option<ActorRef>) -> (Option<Uuid>, Option<Uuid>) {
    match owner {
        Some(ActorRef::Legacy(id)) => (Some(id), None),
        Some(ActorRef::Team(id)) => (None, Some(id)),
        None => (None, None),
    }
}

fn owner_from_columns(legacy: Option<Uuid>, team: Option<Uuid>) -> Option<ActorRef> {
    team.map(ActorRef::Team).or(legacy.map(ActorRef::Legacy))
}

fn parse_state(text: &str) -> Result<ExecutionState, StoreError> {
    text.parse()
        .map_err(|err: wotrack_core::ParseEnumError| StoreError::Backend(err.to_string()))
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let attributes: Json<std::collections::BTreeMap<String, String>> = row.try_get("attributes")?;
    Ok(Order {
        id: row.try_get("id")?,
        external_code: row.try_get("external_code")?,
        raw_status: row.try_get("raw_status")?,
        completion_date_text: row.try_get("completion_date_text")?,
        attributes: attributes.0,
        last_modified: row.try_get("last_modified")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(Execution {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        owner: owner_from_columns(
            row.try_get("legacy_technician_id")?,
            row.try_get("team_id")?,
        ),
        state: parse_state(&state)?,
        observation: row.try_get("observation")?,
        last_modified: row.try_get("last_modified")?,
    })
}

fn child_from_row(row: &PgRow) -> Result<ChildRecord, StoreError> {
    let state: String = row.try_get("state")?;
    Ok(ChildRecord {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        label: row.try_get("label")?,
        state: parse_state(&state)?,
        completion_date_text: row.try_get("completion_date_text")?,
    })
}

fn actor_from_row(row: &PgRow) -> Result<Actor, StoreError> {
    let role: String = row.try_get("role")?;
    Ok(Actor {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        login_name: row.try_get("login_name")?,
        display_name: row.try_get("display_name")?,
        credentials: Credentials {
            password_hash: row.try_get("password_hash")?,
            must_change_password: row.try_get("must_change_password")?,
        },
        role: role
            .parse()
            .map_err(|err: wotrack_core::ParseEnumError| StoreError::Backend(err.to_string()))?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn legacy_from_row(row: &PgRow) -> Result<LegacyActor, StoreError> {
    Ok(LegacyActor {
        id: row.try_get("id")?,
        login_name: row.try_get("login_name")?,
        display_name: row.try_get("display_name")?,
        credentials: Credentials {
            password_hash: row.try_get("password_hash")?,
            must_change_password: row.try_get("must_change_password")?,
        },
        active: row.try_get("active")?,
        merged_into: row.try_get("merged_into")?,
    })
}

fn notification_from_row(row: &PgRow) -> Result<Notification, StoreError> {
    let recipient = owner_from_columns(
        row.try_get("legacy_technician_id")?,
        row.try_get("team_id")?,
    )
    .ok_or_else(|| StoreError::Backend("notification without recipient".into()))?;
    Ok(Notification {
        id: row.try_get("id")?,
        recipient,
        message: row.try_get("message")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
    })
}

async fn write_actor(conn: &mut PgConnection, actor: &Actor) -> Result<u64, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO teams (id, code, login_name, display_name, password_hash,
                           must_change_password, role, active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (id) DO UPDATE SET
            code = EXCLUDED.code,
            login_name = EXCLUDED.login_name,
            display_name = EXCLUDED.display_name,
            password_hash = EXCLUDED.password_hash,
            must_change_password = EXCLUDED.must_change_password,
            role = EXCLUDED.role,
            active = EXCLUDED.active,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(actor.id)
    .bind(&actor.code)
    .bind(&actor.login_name)
    .bind(&actor.display_name)
    .bind(&actor.credentials.password_hash)
    .bind(actor.credentials.must_change_password)
    .bind(actor.role.as_str())
    .bind(actor.active)
    .bind(actor.created_at)
    .bind(actor.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl OrderStore for PgStore {
    async fn upsert_order(
        &self,
        row: &OrderUpsert,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let existing = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE external_code = $1 FOR UPDATE"
        ))
        .bind(&row.external_code)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO orders (id, external_code, raw_status, completion_date_text, attributes, last_modified)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(&row.external_code)
                .bind(&row.raw_status)
                .bind(&row.completion_date_text)
                .bind(Json(&row.attributes))
                .bind(now)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome::Inserted
            }
            Some(existing) => {
                let order = order_from_row(&existing)?;
                if row.matches(&order) {
                    sqlx::query("UPDATE orders SET last_modified = $2 WHERE id = $1")
                        .bind(order.id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    UpsertOutcome::Unchanged
                } else {
                    sqlx::query(
                        r#"
                        UPDATE orders
                           SET raw_status = $2,
                               completion_date_text = $3,
                               attributes = $4,
                               last_modified = $5
                         WHERE id = $1
                        "#,
                    )
                    .bind(order.id)
                    .bind(&row.raw_status)
                    .bind(&row.completion_date_text)
                    .bind(Json(&row.attributes))
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    UpsertOutcome::Updated
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_order_by_code(&self, external_code: &str) -> Result<Option<Order>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE external_code = $1"
        ))
        .bind(external_code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn load_bundle(&self, order_id: Uuid) -> Result<Option<OrderBundle>, StoreError> {
        let Some(row) = sqlx::query(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let order = order_from_row(&row)?;
        let execution = sqlx::query(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(execution_from_row)
        .transpose()?;
        let children = sqlx::query(
            "SELECT id, order_id, label, state, completion_date_text FROM child_records WHERE order_id = $1 ORDER BY label",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(child_from_row)
        .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(OrderBundle {
            order,
            execution,
            children,
        }))
    }

    async fn list_bundles(&self) -> Result<Vec<OrderBundle>, StoreError> {
        let orders = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders ORDER BY external_code"
        ))
        .fetch_all(&self.pool)
        .await?;
        let mut executions: HashMap<Uuid, Execution> = HashMap::new();
        for row in sqlx::query(&format!("SELECT {EXECUTION_COLUMNS} FROM executions"))
            .fetch_all(&self.pool)
            .await?
        {
            let execution = execution_from_row(&row)?;
            executions.insert(execution.order_id, execution);
        }
        let mut children: HashMap<Uuid, Vec<ChildRecord>> = HashMap::new();
        for row in sqlx::query(
            "SELECT id, order_id, label, state, completion_date_text FROM child_records ORDER BY label",
        )
        .fetch_all(&self.pool)
        .await?
        {
            let child = child_from_row(&row)?;
            children.entry(child.order_id).or_default().push(child);
        }

        orders
            .iter()
            .map(|row| {
                let order = order_from_row(row)?;
                Ok(OrderBundle {
                    execution: executions.remove(&order.id),
                    children: children.remove(&order.id).unwrap_or_default(),
                    order,
                })
            })
            .collect()
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let (legacy, team) = owner_columns(execution.owner);
        sqlx::query(
            r#"
            INSERT INTO executions (id, order_id, legacy_technician_id, team_id, state, observation, last_modified)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (order_id) DO UPDATE SET
                id = EXCLUDED.id,
                legacy_technician_id = EXCLUDED.legacy_technician_id,
                team_id = EXCLUDED.team_id,
                state = EXCLUDED.state,
                observation = EXCLUDED.observation,
                last_modified = EXCLUDED.last_modified
            "#,
        )
        .bind(execution.id)
        .bind(execution.order_id)
        .bind(legacy)
        .bind(team)
        .bind(execution.state.as_str())
        .bind(&execution.observation)
        .bind(execution.last_modified)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_child_record(&self, child: &ChildRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO child_records (id, order_id, label, state, completion_date_text)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                label = EXCLUDED.label,
                state = EXCLUDED.state,
                completion_date_text = EXCLUDED.completion_date_text
            "#,
        )
        .bind(child.id)
        .bind(child.order_id)
        .bind(&child.label)
        .bind(child.state.as_str())
        .bind(&child.completion_date_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub struct PgIdentityTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgIdentityTx {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Backend("transaction already committed".into()))
    }
}

#[async_trait]
impl IdentityTx for PgIdentityTx {
    async fn find_actor_by_login(&mut self, login_name: &str) -> Result<Option<Actor>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TEAM_COLUMNS} FROM teams WHERE lower(login_name) = lower($1) FOR UPDATE"
        ))
        .bind(login_name)
        .fetch_optional(self.conn()?)
        .await?;
        row.as_ref().map(actor_from_row).transpose()
    }

    async fn insert_actor(&mut self, actor: &Actor) -> Result<(), StoreError> {
        write_actor(self.conn()?, actor).await?;
        Ok(())
    }

    async fn update_actor(&mut self, actor: &Actor) -> Result<(), StoreError> {
        write_actor(self.conn()?, actor).await?;
        Ok(())
    }

    async fn reassign_legacy_refs(
        &mut self,
        legacy_id: Uuid,
        actor_id: Uuid,
    ) -> Result<RelinkCounts, StoreError> {
        let executions = sqlx::query(
            "UPDATE executions SET team_id = $2, legacy_technician_id = NULL WHERE legacy_technician_id = $1",
        )
        .bind(legacy_id)
        .bind(actor_id)
        .execute(self.conn()?)
        .await?
        .rows_affected();
        let notifications = sqlx::query(
            "UPDATE notifications SET team_id = $2, legacy_technician_id = NULL WHERE legacy_technician_id = $1",
        )
        .bind(legacy_id)
        .bind(actor_id)
        .execute(self.conn()?)
        .await?
        .rows_affected();
        Ok(RelinkCounts {
            executions: executions as usize,
            notifications: notifications as usize,
        })
    }

    async fn mark_legacy_merged(&mut self, legacy_id: Uuid, actor_id: Uuid) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE legacy_technicians SET merged_into = $2 WHERE id = $1")
            .bind(legacy_id)
            .bind(actor_id)
            .execute(self.conn()?)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(StoreError::NotFound(format!("legacy actor {legacy_id}")));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already committed".into()))?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn list_legacy_actors(&self) -> Result<Vec<LegacyActor>, StoreError> {
        sqlx::query(
            "SELECT id, login_name, display_name, password_hash, must_change_password, active, merged_into FROM legacy_technicians ORDER BY display_name",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(legacy_from_row)
        .collect()
    }

    async fn list_actors(&self) -> Result<Vec<Actor>, StoreError> {
        sqlx::query(&format!("SELECT {TEAM_COLUMNS} FROM teams ORDER BY display_name"))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(actor_from_row)
            .collect()
    }

    async fn begin_identity_tx(&self) -> Result<Box<dyn IdentityTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgIdentityTx { tx: Some(tx) }))
    }

    async fn assign_login(
        &self,
        actor_id: Uuid,
        login_name: &str,
        credentials: &Credentials,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE teams
               SET login_name = $2,
                   password_hash = $3,
                   must_change_password = $4,
                   role = $5,
                   updated_at = $6
             WHERE id = $1
            "#,
        )
        .bind(actor_id)
        .bind(login_name)
        .bind(&credentials.password_hash)
        .bind(credentials.must_change_password)
        .bind(role.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if affected == 0 {
            return Err(StoreError::NotFound(format!("actor {actor_id}")));
        }
        Ok(())
    }

    async fn migration_marker(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT completed_at FROM migration_markers WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<DateTime<Utc>, _>("completed_at"))
            .transpose()?)
    }

    async fn set_migration_marker(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO migration_markers (name, completed_at) VALUES ($1, $2) ON CONFLICT (name) DO UPDATE SET completed_at = EXCLUDED.completed_at",
        )
        .bind(name)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_legacy_actor(&self, legacy: &LegacyActor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO legacy_technicians (id, login_name, display_name, password_hash, must_change_password, active, merged_into)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                login_name = EXCLUDED.login_name,
                display_name = EXCLUDED.display_name,
                password_hash = EXCLUDED.password_hash,
                must_change_password = EXCLUDED.must_change_password,
                active = EXCLUDED.active,
                merged_into = EXCLUDED.merged_into
            "#,
        )
        .bind(legacy.id)
        .bind(&legacy.login_name)
        .bind(&legacy.display_name)
        .bind(&legacy.credentials.password_hash)
        .bind(legacy.credentials.must_change_password)
        .bind(legacy.active)
        .bind(legacy.merged_into)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_actor(&self, actor: &Actor) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        write_actor(&mut conn, actor).await?;
        Ok(())
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let (legacy, team) = owner_columns(Some(notification.recipient));
        sqlx::query(
            r#"
            INSERT INTO notifications (id, legacy_technician_id, team_id, message, read, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                legacy_technician_id = EXCLUDED.legacy_technician_id,
                team_id = EXCLUDED.team_id,
                message = EXCLUDED.message,
                read = EXCLUDED.read
            "#,
        )
        .bind(notification.id)
        .bind(legacy)
        .bind(team)
        .bind(&notification.message)
        .bind(notification.read)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, StoreError> {
        sqlx::query(
            "SELECT id, legacy_technician_id, team_id, message, read, created_at FROM notifications ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(notification_from_row)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_columns_round_trip_through_nullable_pair() {
        let id = Uuid::new_v4();
        assert_eq!(owner_columns(Some(ActorRef::Legacy(id))), (Some(id), None));
        assert_eq!(owner_columns(Some(ActorRef::Team(id))), (None, Some(id)));
        assert_eq!(owner_from_columns(None, Some(id)), Some(ActorRef::Team(id)));
        assert_eq!(owner_from_columns(Some(id), None), Some(ActorRef::Legacy(id)));
        assert_eq!(owner_from_columns(None, None), None);
    }
}
