//! In-process coordination hub
//!
//! A stand-in for a ZooKeeper/etcd-class coordination service: one shared
//! hub, any number of sessions. Mutations fan out to every session's
//! observer (including the writer, so echo suppression is exercised for
//! real), advisory locks are hub-wide, and closing a session removes its
//! registered node the way an ephemeral node would disappear.

use super::store::{MetaStore, MetaStoreObserver};
use super::{
    FragmentMeta, FrontEndMeta, StorageEngineMeta, StorageUnitMeta, TimeSeriesInterval, UserMeta,
};
use crate::{MetaStoreError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

#[derive(Default)]
struct HubState {
    next_node_id: u64,
    next_engine_id: u64,
    next_unit_seq: u64,
    nodes: HashMap<u64, FrontEndMeta>,
    engines: HashMap<u64, StorageEngineMeta>,
    units: HashMap<String, StorageUnitMeta>,
    fragments: HashMap<TimeSeriesInterval, BTreeMap<i64, FragmentMeta>>,
    schema_mappings: HashMap<String, HashMap<String, i32>>,
    users: HashMap<String, UserMeta>,
    sessions: HashMap<Uuid, SessionHandle>,
}

#[derive(Default)]
struct SessionHandle {
    observer: Option<Arc<dyn MetaStoreObserver>>,
    node_id: Option<u64>,
}

/// Shared coordination state for [`MemoryMetaStore`] sessions.
pub struct MemoryCoordinator {
    state: Mutex<HubState>,
    fragment_lock: Arc<tokio::sync::Mutex<()>>,
    storage_unit_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryCoordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HubState::default()),
            fragment_lock: Arc::new(tokio::sync::Mutex::new(())),
            storage_unit_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Process-wide hub used by the `meta_storage = "memory"` backend.
    pub fn global() -> Arc<Self> {
        static GLOBAL: OnceLock<Arc<MemoryCoordinator>> = OnceLock::new();
        GLOBAL.get_or_init(MemoryCoordinator::new).clone()
    }

    /// Open a new session against this hub.
    pub fn session(self: &Arc<Self>) -> Arc<MemoryMetaStore> {
        let session_id = Uuid::new_v4();
        self.state
            .lock()
            .sessions
            .insert(session_id, SessionHandle::default());
        Arc::new(MemoryMetaStore {
            hub: self.clone(),
            session_id,
            held_fragment: Mutex::new(None),
            held_storage_unit: Mutex::new(None),
        })
    }

    fn observers(&self) -> Vec<Arc<dyn MetaStoreObserver>> {
        self.state
            .lock()
            .sessions
            .values()
            .filter_map(|s| s.observer.clone())
            .collect()
    }

    fn notify(&self, f: impl Fn(&dyn MetaStoreObserver)) {
        for observer in self.observers() {
            f(observer.as_ref());
        }
    }
}

/// One session of the in-process coordination hub.
pub struct MemoryMetaStore {
    hub: Arc<MemoryCoordinator>,
    session_id: Uuid,
    held_fragment: Mutex<Option<OwnedMutexGuard<()>>>,
    held_storage_unit: Mutex<Option<OwnedMutexGuard<()>>>,
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn register_node(&self, node: FrontEndMeta) -> Result<u64> {
        let registered = {
            let mut state = self.hub.state.lock();
            state.next_node_id += 1;
            let mut node = node;
            node.id = state.next_node_id;
            state.nodes.insert(node.id, node.clone());
            if let Some(session) = state.sessions.get_mut(&self.session_id) {
                session.node_id = Some(node.id);
            }
            node
        };
        let id = registered.id;
        self.hub
            .notify(|o| o.node_changed(id, Some(registered.clone())));
        Ok(id)
    }

    async fn load_nodes(&self) -> Result<HashMap<u64, FrontEndMeta>> {
        Ok(self.hub.state.lock().nodes.clone())
    }

    async fn add_storage_engine(&self, engine: StorageEngineMeta) -> Result<u64> {
        let stored = {
            let mut state = self.hub.state.lock();
            let mut engine = engine;
            engine.id = state.next_engine_id;
            state.next_engine_id += 1;
            state.engines.insert(engine.id, engine.clone());
            engine
        };
        let id = stored.id;
        self.hub.notify(|o| o.storage_engine_added(stored.clone()));
        Ok(id)
    }

    async fn load_storage_engines(
        &self,
        local: Vec<StorageEngineMeta>,
    ) -> Result<HashMap<u64, StorageEngineMeta>> {
        let (engines, seeded) = {
            let mut state = self.hub.state.lock();
            let mut seeded = Vec::new();
            if state.engines.is_empty() {
                for mut engine in local {
                    engine.id = state.next_engine_id;
                    state.next_engine_id += 1;
                    state.engines.insert(engine.id, engine.clone());
                    seeded.push(engine);
                }
            }
            (state.engines.clone(), seeded)
        };
        for engine in seeded {
            self.hub.notify(|o| o.storage_engine_added(engine.clone()));
        }
        Ok(engines)
    }

    async fn add_storage_unit(&self) -> Result<String> {
        let mut state = self.hub.state.lock();
        state.next_unit_seq += 1;
        Ok(format!("unit{:010}", state.next_unit_seq))
    }

    async fn update_storage_unit(&self, unit: &StorageUnitMeta) -> Result<()> {
        let stored = {
            let mut state = self.hub.state.lock();
            // Replica sets are a cache-level index; the durable copy holds
            // only master-id pointers.
            let mut stored = unit.clone();
            stored.replicas.clear();
            state.units.insert(stored.id.clone(), stored.clone());
            stored
        };
        self.hub
            .notify(|o| o.storage_unit_changed(stored.id.clone(), stored.clone()));
        Ok(())
    }

    async fn load_storage_units(&self) -> Result<HashMap<String, StorageUnitMeta>> {
        Ok(self.hub.state.lock().units.clone())
    }

    async fn add_fragment(&self, fragment: &FragmentMeta) -> Result<()> {
        {
            let mut state = self.hub.state.lock();
            let slot = state
                .fragments
                .entry(fragment.ts_interval.clone())
                .or_default();
            if slot.contains_key(&fragment.time_interval.start) {
                return Err(MetaStoreError::Contention(format!(
                    "fragment {} at {} already exists",
                    fragment.ts_interval, fragment.time_interval.start
                ))
                .into());
            }
            slot.insert(fragment.time_interval.start, fragment.clone());
        }
        let fragment = fragment.clone();
        self.hub.notify(|o| o.fragment_changed(true, fragment.clone()));
        Ok(())
    }

    async fn update_fragment(&self, fragment: &FragmentMeta) -> Result<()> {
        {
            let mut state = self.hub.state.lock();
            let slot = state
                .fragments
                .entry(fragment.ts_interval.clone())
                .or_default();
            if !slot.contains_key(&fragment.time_interval.start) {
                return Err(MetaStoreError::Contention(format!(
                    "fragment {} at {} does not exist",
                    fragment.ts_interval, fragment.time_interval.start
                ))
                .into());
            }
            slot.insert(fragment.time_interval.start, fragment.clone());
        }
        let fragment = fragment.clone();
        self.hub
            .notify(|o| o.fragment_changed(false, fragment.clone()));
        Ok(())
    }

    async fn load_fragments(&self) -> Result<HashMap<TimeSeriesInterval, Vec<FragmentMeta>>> {
        let state = self.hub.state.lock();
        Ok(state
            .fragments
            .iter()
            .map(|(interval, by_start)| (interval.clone(), by_start.values().cloned().collect()))
            .collect())
    }

    async fn update_schema_mapping(
        &self,
        schema: &str,
        mapping: Option<&HashMap<String, i32>>,
    ) -> Result<()> {
        let published = {
            let mut state = self.hub.state.lock();
            match mapping {
                Some(mapping) => {
                    state
                        .schema_mappings
                        .insert(schema.to_string(), mapping.clone());
                    Some(mapping.clone())
                }
                None => {
                    state.schema_mappings.remove(schema);
                    None
                }
            }
        };
        let schema = schema.to_string();
        self.hub
            .notify(|o| o.schema_mapping_changed(schema.clone(), published.clone()));
        Ok(())
    }

    async fn load_schema_mappings(&self) -> Result<HashMap<String, HashMap<String, i32>>> {
        Ok(self.hub.state.lock().schema_mappings.clone())
    }

    async fn add_user(&self, user: &UserMeta) -> Result<()> {
        self.hub
            .state
            .lock()
            .users
            .insert(user.username.clone(), user.clone());
        let user = user.clone();
        self.hub
            .notify(|o| o.user_changed(user.username.clone(), Some(user.clone())));
        Ok(())
    }

    async fn update_user(&self, user: &UserMeta) -> Result<()> {
        self.add_user(user).await
    }

    async fn remove_user(&self, username: &str) -> Result<()> {
        self.hub.state.lock().users.remove(username);
        let username = username.to_string();
        self.hub.notify(|o| o.user_changed(username.clone(), None));
        Ok(())
    }

    async fn load_users(&self, default_admin: UserMeta) -> Result<Vec<UserMeta>> {
        let mut state = self.hub.state.lock();
        if state.users.is_empty() {
            state
                .users
                .insert(default_admin.username.clone(), default_admin);
        }
        Ok(state.users.values().cloned().collect())
    }

    async fn lock_fragment(&self) -> Result<()> {
        let guard = self.hub.fragment_lock.clone().lock_owned().await;
        *self.held_fragment.lock() = Some(guard);
        Ok(())
    }

    async fn release_fragment(&self) -> Result<()> {
        match self.held_fragment.lock().take() {
            Some(_guard) => Ok(()),
            None => Err(MetaStoreError::Contention(
                "fragment lock not held by this session".to_string(),
            )
            .into()),
        }
    }

    async fn lock_storage_unit(&self) -> Result<()> {
        let guard = self.hub.storage_unit_lock.clone().lock_owned().await;
        *self.held_storage_unit.lock() = Some(guard);
        Ok(())
    }

    async fn release_storage_unit(&self) -> Result<()> {
        match self.held_storage_unit.lock().take() {
            Some(_guard) => Ok(()),
            None => Err(MetaStoreError::Contention(
                "storage-unit lock not held by this session".to_string(),
            )
            .into()),
        }
    }

    fn subscribe(&self, observer: Arc<dyn MetaStoreObserver>) {
        if let Some(session) = self.hub.state.lock().sessions.get_mut(&self.session_id) {
            session.observer = Some(observer);
        }
    }

    async fn close(&self) -> Result<()> {
        // Drop held locks first so peers are not blocked on a dead session.
        self.held_fragment.lock().take();
        self.held_storage_unit.lock().take();
        let removed_node = {
            let mut state = self.hub.state.lock();
            let node_id = state
                .sessions
                .remove(&self.session_id)
                .and_then(|s| s.node_id);
            node_id.and_then(|id| state.nodes.remove(&id).map(|_| id))
        };
        if let Some(id) = removed_node {
            self.hub.notify(|o| o.node_changed(id, None));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unit_ids_are_monotonic() {
        let hub = MemoryCoordinator::new();
        let session = hub.session();
        let a = session.add_storage_unit().await.unwrap();
        let b = session.add_storage_unit().await.unwrap();
        assert!(a < b);
        assert!(a.starts_with("unit"));
    }

    #[tokio::test]
    async fn locks_exclude_across_sessions() {
        let hub = MemoryCoordinator::new();
        let first = hub.session();
        let second = hub.session();

        first.lock_fragment().await.unwrap();
        let contender = {
            let second = second.clone();
            tokio::spawn(async move {
                second.lock_fragment().await.unwrap();
                second.release_fragment().await.unwrap();
            })
        };
        // The contender cannot finish while we hold the lock.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        first.release_fragment().await.unwrap();
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn release_without_hold_is_an_error() {
        let hub = MemoryCoordinator::new();
        let session = hub.session();
        assert!(session.release_fragment().await.is_err());
    }

    #[tokio::test]
    async fn close_removes_registered_node() {
        let hub = MemoryCoordinator::new();
        let session = hub.session();
        let peer = hub.session();
        let id = session
            .register_node(FrontEndMeta::new("127.0.0.1", 6888))
            .await
            .unwrap();
        assert!(peer.load_nodes().await.unwrap().contains_key(&id));
        session.close().await.unwrap();
        assert!(!peer.load_nodes().await.unwrap().contains_key(&id));
    }

    #[tokio::test]
    async fn engine_seeding_happens_once() {
        let hub = MemoryCoordinator::new();
        let first = hub.session();
        let second = hub.session();

        let local = vec![StorageEngineMeta::new(
            "127.0.0.1",
            8086,
            super::super::EngineKind::InfluxDb,
            HashMap::new(),
            1,
        )];
        let engines = first.load_storage_engines(local.clone()).await.unwrap();
        assert_eq!(engines.len(), 1);

        // The second node's static list must not duplicate the engines.
        let engines = second.load_storage_engines(local).await.unwrap();
        assert_eq!(engines.len(), 1);
    }
}
