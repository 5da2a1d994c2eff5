//! In-process store used by tests, demos and the single-node dev server.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;
use wotrack_core::{
    Actor, ActorRef, ChildRecord, Credentials, Execution, LegacyActor, Notification, Order,
    OrderBundle, Role,
};

use crate::{
    IdentityStore, IdentityTx, OrderStore, OrderUpsert, RelinkCounts, StoreError, UpsertOutcome,
};

#[derive(Debug, Clone, Default)]
struct Faults {
    unavailable: bool,
    failing_codes: BTreeSet<String>,
    failing_relinks: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    orders: BTreeMap<String, Order>,
    executions: HashMap<Uuid, Execution>,
    children: Vec<ChildRecord>,
    actors: BTreeMap<Uuid, Actor>,
    legacy_actors: BTreeMap<Uuid, LegacyActor>,
    notifications: Vec<Notification>,
    markers: BTreeMap<String, DateTime<Utc>>,
    faults: Faults,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.faults.unavailable {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }

    fn bundle_for(&self, order: &Order) -> OrderBundle {
        OrderBundle {
            order: order.clone(),
            execution: self.executions.get(&order.id).cloned(),
            children: self
                .children
                .iter()
                .filter(|c| c.order_id == order.id)
                .cloned()
                .collect(),
        }
    }

    fn ensure_login_free(&self, login_name: Option<&str>, owner: Uuid) -> Result<(), StoreError> {
        let Some(login_name) = login_name else {
            return Ok(());
        };
        let taken = self
            .actors
            .values()
            .any(|a| a.id != owner && same_login(a.login_name.as_deref(), login_name));
        if taken {
            return Err(StoreError::Conflict(format!(
                "login name {login_name:?} already in use"
            )));
        }
        Ok(())
    }
}

fn same_login(existing: Option<&str>, login_name: &str) -> bool {
    existing.is_some_and(|existing| existing.to_lowercase() == login_name.to_lowercase())
}

/// Mutex-guarded state. Identity transactions hold the lock for their whole
/// lifetime and work on a copy that is only written back on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing the backend entirely.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.faults.unavailable = unavailable;
    }

    /// Make every upsert of `external_code` fail with a backend error.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn fail_upserts_for(&self, external_code: &str) {
        self.state
            .lock()
            .await
            .faults
            .failing_codes
            .insert(external_code.to_string());
    }

    /// Make notification relinking for `legacy_id` fail after executions were moved.
    #[cfg(any(test, feature = "test-hooks"))]
    pub async fn fail_relink_for(&self, legacy_id: Uuid) {
        self.state.lock().await.faults.failing_relinks.insert(legacy_id);
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    pub async fn executions_owned_by(&self, owner: ActorRef) -> Vec<Execution> {
        self.state
            .lock()
            .await
            .executions
            .values()
            .filter(|e| e.owner == Some(owner))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn upsert_order(
        &self,
        row: &OrderUpsert,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if state.faults.failing_codes.contains(&row.external_code) {
            return Err(StoreError::Backend(format!(
                "write rejected for {}",
                row.external_code
            )));
        }

        let Some(order) = state.orders.get_mut(&row.external_code) else {
            let order = Order {
                id: Uuid::new_v4(),
                external_code: row.external_code.clone(),
                raw_status: row.raw_status.clone(),
                completion_date_text: row.completion_date_text.clone(),
                attributes: row.attributes.clone(),
                last_modified: now,
            };
            state.orders.insert(row.external_code.clone(), order);
            return Ok(UpsertOutcome::Inserted);
        };

        order.last_modified = now;
        if row.matches(order) {
            return Ok(UpsertOutcome::Unchanged);
        }
        if order.raw_status != row.raw_status {
            order.raw_status = row.raw_status.clone();
        }
        if order.completion_date_text != row.completion_date_text {
            order.completion_date_text = row.completion_date_text.clone();
        }
        if order.attributes != row.attributes {
            order.attributes = row.attributes.clone();
        }
        Ok(UpsertOutcome::Updated)
    }

    async fn get_order_by_code(&self, external_code: &str) -> Result<Option<Order>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.orders.get(external_code).cloned())
    }

    async fn load_bundle(&self, order_id: Uuid) -> Result<Option<OrderBundle>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state
            .orders
            .values()
            .find(|o| o.id == order_id)
            .map(|o| state.bundle_for(o)))
    }

    async fn list_bundles(&self) -> Result<Vec<OrderBundle>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.orders.values().map(|o| state.bundle_for(o)).collect())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if !state.orders.values().any(|o| o.id == execution.order_id) {
            return Err(StoreError::NotFound(format!("order {}", execution.order_id)));
        }
        state.executions.insert(execution.order_id, execution.clone());
        Ok(())
    }

    async fn save_child_record(&self, child: &ChildRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if !state.orders.values().any(|o| o.id == child.order_id) {
            return Err(StoreError::NotFound(format!("order {}", child.order_id)));
        }
        state.children.retain(|c| c.id != child.id);
        state.children.push(child.clone());
        Ok(())
    }
}

pub struct MemoryIdentityTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: Option<MemoryState>,
}

impl MemoryIdentityTx {
    fn working(&mut self) -> Result<&mut MemoryState, StoreError> {
        self.working
            .as_mut()
            .ok_or_else(|| StoreError::Backend("transaction already committed".into()))
    }
}

#[async_trait]
impl IdentityTx for MemoryIdentityTx {
    async fn find_actor_by_login(&mut self, login_name: &str) -> Result<Option<Actor>, StoreError> {
        let state = self.working()?;
        Ok(state
            .actors
            .values()
            .find(|a| same_login(a.login_name.as_deref(), login_name))
            .cloned())
    }

    async fn insert_actor(&mut self, actor: &Actor) -> Result<(), StoreError> {
        let state = self.working()?;
        if state.actors.contains_key(&actor.id) {
            return Err(StoreError::Conflict(format!("actor {} exists", actor.id)));
        }
        state.ensure_login_free(actor.login_name.as_deref(), actor.id)?;
        state.actors.insert(actor.id, actor.clone());
        Ok(())
    }

    async fn update_actor(&mut self, actor: &Actor) -> Result<(), StoreError> {
        let state = self.working()?;
        if !state.actors.contains_key(&actor.id) {
            return Err(StoreError::NotFound(format!("actor {}", actor.id)));
        }
        state.ensure_login_free(actor.login_name.as_deref(), actor.id)?;
        state.actors.insert(actor.id, actor.clone());
        Ok(())
    }

    async fn reassign_legacy_refs(
        &mut self,
        legacy_id: Uuid,
        actor_id: Uuid,
    ) -> Result<RelinkCounts, StoreError> {
        let state = self.working()?;
        let from = Some(ActorRef::Legacy(legacy_id));
        let mut counts = RelinkCounts::default();
        for execution in state.executions.values_mut() {
            if execution.owner == from {
                execution.owner = Some(ActorRef::Team(actor_id));
                counts.executions += 1;
            }
        }
        if state.faults.failing_relinks.contains(&legacy_id) {
            return Err(StoreError::Backend(format!(
                "notification relink failed for {legacy_id}"
            )));
        }
        for notification in &mut state.notifications {
            if notification.recipient == ActorRef::Legacy(legacy_id) {
                notification.recipient = ActorRef::Team(actor_id);
                counts.notifications += 1;
            }
        }
        Ok(counts)
    }

    async fn mark_legacy_merged(&mut self, legacy_id: Uuid, actor_id: Uuid) -> Result<(), StoreError> {
        let legacy = self
            .working()?
            .legacy_actors
            .get_mut(&legacy_id)
            .ok_or_else(|| StoreError::NotFound(format!("legacy actor {legacy_id}")))?;
        legacy.merged_into = Some(actor_id);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let working = self
            .working
            .take()
            .ok_or_else(|| StoreError::Backend("transaction already committed".into()))?;
        *self.guard = working;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn list_legacy_actors(&self) -> Result<Vec<LegacyActor>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.legacy_actors.values().cloned().collect())
    }

    async fn list_actors(&self) -> Result<Vec<Actor>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.actors.values().cloned().collect())
    }

    async fn begin_identity_tx(&self) -> Result<Box<dyn IdentityTx>, StoreError> {
        let guard = self.state.clone().lock_owned().await;
        guard.check_available()?;
        let working = guard.clone();
        Ok(Box::new(MemoryIdentityTx {
            guard,
            working: Some(working),
        }))
    }

    async fn assign_login(
        &self,
        actor_id: Uuid,
        login_name: &str,
        credentials: &Credentials,
        role: Role,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.ensure_login_free(Some(login_name), actor_id)?;
        let actor = state
            .actors
            .get_mut(&actor_id)
            .ok_or_else(|| StoreError::NotFound(format!("actor {actor_id}")))?;
        actor.login_name = Some(login_name.to_string());
        actor.credentials = credentials.clone();
        actor.role = role;
        actor.updated_at = now;
        Ok(())
    }

    async fn migration_marker(&self, name: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.markers.get(name).copied())
    }

    async fn set_migration_marker(&self, name: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.markers.insert(name.to_string(), at);
        Ok(())
    }

    async fn save_legacy_actor(&self, legacy: &LegacyActor) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.legacy_actors.insert(legacy.id, legacy.clone());
        Ok(())
    }

    async fn save_actor(&self, actor: &Actor) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.ensure_login_free(actor.login_name.as_deref(), actor.id)?;
        state.actors.insert(actor.id, actor.clone());
        Ok(())
    }

    async fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.notifications.retain(|n| n.id != notification.id);
        state.notifications.push(notification.clone());
        Ok(())
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, StoreError> {
        let state = self.state.lock().await;
        state.check_available()?;
        Ok(state.notifications.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wotrack_core::ExecutionState;

    fn row(code: &str, status: &str, completion: &str) -> OrderUpsert {
        OrderUpsert {
            external_code: code.into(),
            raw_status: status.into(),
            completion_date_text: completion.into(),
            attributes: BTreeMap::new(),
        }
    }

    fn team(login: Option<&str>) -> Actor {
        let now = Utc::now();
        Actor {
            id: Uuid::new_v4(),
            code: None,
            login_name: login.map(str::to_string),
            display_name: "Team".into(),
            credentials: Credentials::default(),
            role: Role::Team,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn soft_upsert_reports_outcome_and_keeps_execution() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        assert_eq!(
            store.upsert_order(&row("OS-1", "OPEN", "-"), t0).await.unwrap(),
            UpsertOutcome::Inserted
        );
        let order = store.get_order_by_code("OS-1").await.unwrap().unwrap();
        let execution = Execution {
            id: Uuid::new_v4(),
            order_id: order.id,
            owner: None,
            state: ExecutionState::Done,
            observation: "ok".into(),
            last_modified: t0,
        };
        store.save_execution(&execution).await.unwrap();

        let t1 = t0 + chrono::Duration::minutes(5);
        assert_eq!(
            store.upsert_order(&row("OS-1", "OPEN", "-"), t1).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store
                .upsert_order(&row("OS-1", "CLOSED", "05/03/2024"), t1)
                .await
                .unwrap(),
            UpsertOutcome::Updated
        );

        let bundle = store.load_bundle(order.id).await.unwrap().unwrap();
        assert_eq!(bundle.order.id, order.id);
        assert_eq!(bundle.order.raw_status, "CLOSED");
        assert_eq!(bundle.order.last_modified, t1);
        assert_eq!(bundle.execution, Some(execution));
    }

    #[tokio::test]
    async fn execution_is_unique_per_order() {
        let store = MemoryStore::new();
        store.upsert_order(&row("OS-1", "OPEN", "-"), Utc::now()).await.unwrap();
        let order = store.get_order_by_code("OS-1").await.unwrap().unwrap();
        for observation in ["first", "second"] {
            let execution = Execution {
                id: Uuid::new_v4(),
                order_id: order.id,
                owner: None,
                state: ExecutionState::Pending,
                observation: observation.into(),
                last_modified: Utc::now(),
            };
            store.save_execution(&execution).await.unwrap();
        }
        let bundle = store.load_bundle(order.id).await.unwrap().unwrap();
        assert_eq!(bundle.execution.unwrap().observation, "second");
    }

    #[tokio::test]
    async fn dropped_transaction_leaves_no_trace() {
        let store = MemoryStore::new();
        {
            let mut tx = store.begin_identity_tx().await.unwrap();
            tx.insert_actor(&team(Some("silva"))).await.unwrap();
        }
        assert!(store.list_actors().await.unwrap().is_empty());

        let mut tx = store.begin_identity_tx().await.unwrap();
        tx.insert_actor(&team(Some("silva"))).await.unwrap();
        tx.commit().await.unwrap();
        drop(tx);
        assert_eq!(store.list_actors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn login_names_stay_unique() {
        let store = MemoryStore::new();
        store.save_actor(&team(Some("silva"))).await.unwrap();
        let other = team(None);
        store.save_actor(&other).await.unwrap();
        let err = store
            .assign_login(other.id, "silva", &Credentials::default(), Role::Team, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let err = store
            .assign_login(other.id, "SILVA", &Credentials::default(), Role::Team, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn login_lookup_ignores_case() {
        let store = MemoryStore::new();
        let maria = team(Some("maria"));
        store.save_actor(&maria).await.unwrap();
        let mut tx = store.begin_identity_tx().await.unwrap();
        let found = tx.find_actor_by_login("Maria").await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(maria.id));
    }

    #[tokio::test]
    async fn legacy_merge_mark_only_lands_on_commit() {
        let store = MemoryStore::new();
        let legacy = LegacyActor {
            id: Uuid::new_v4(),
            login_name: None,
            display_name: "Carlos".into(),
            credentials: Credentials::default(),
            active: true,
            merged_into: None,
        };
        store.save_legacy_actor(&legacy).await.unwrap();
        let actor = team(None);

        {
            let mut tx = store.begin_identity_tx().await.unwrap();
            tx.mark_legacy_merged(legacy.id, actor.id).await.unwrap();
        }
        assert_eq!(store.list_legacy_actors().await.unwrap()[0].merged_into, None);

        let mut tx = store.begin_identity_tx().await.unwrap();
        tx.mark_legacy_merged(legacy.id, actor.id).await.unwrap();
        assert!(matches!(
            tx.mark_legacy_merged(Uuid::new_v4(), actor.id).await,
            Err(StoreError::NotFound(_))
        ));
        tx.commit().await.unwrap();
        drop(tx);
        assert_eq!(store.list_legacy_actors().await.unwrap()[0].merged_into, Some(actor.id));
    }

    #[tokio::test]
    async fn unavailable_store_is_systemic() {
        let store = MemoryStore::new();
        store.set_unavailable(true).await;
        let err = store
            .upsert_order(&row("OS-1", "OPEN", "-"), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_systemic());
    }
}
