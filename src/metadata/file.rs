//! File-backed meta store
//!
//! Single-process backend: state lives in memory and every mutation is
//! snapshotted to one JSON file, reloaded at open. Advisory locks provide
//! exclusion within the process only; there is no cross-process
//! coordination and no remote change events, so the installed observer
//! never fires.

use super::store::{MetaStore, MetaStoreObserver};
use super::{
    FragmentMeta, FrontEndMeta, StorageEngineMeta, StorageUnitMeta, TimeSeriesInterval, UserMeta,
};
use crate::{MetaStoreError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    next_node_id: u64,
    next_engine_id: u64,
    next_unit_seq: u64,
    nodes: HashMap<u64, FrontEndMeta>,
    engines: HashMap<u64, StorageEngineMeta>,
    units: HashMap<String, StorageUnitMeta>,
    fragments: Vec<FragmentMeta>,
    schema_mappings: HashMap<String, HashMap<String, i32>>,
    users: HashMap<String, UserMeta>,
}

/// Meta store persisted to a local JSON file.
pub struct FileMetaStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
    fragment_lock: Arc<tokio::sync::Mutex<()>>,
    storage_unit_lock: Arc<tokio::sync::Mutex<()>>,
    held_fragment: Mutex<Option<OwnedMutexGuard<()>>>,
    held_storage_unit: Mutex<Option<OwnedMutexGuard<()>>>,
    observer: Mutex<Option<Arc<dyn MetaStoreObserver>>>,
}

impl FileMetaStore {
    /// Open the store, loading any previously persisted snapshot.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let raw = std::fs::read(&path).map_err(MetaStoreError::from)?;
            serde_json::from_slice(&raw).map_err(MetaStoreError::from)?
        } else {
            PersistedState::default()
        };
        debug!(path = %path.display(), "opened file meta store");
        Ok(Self {
            path,
            state: Mutex::new(state),
            fragment_lock: Arc::new(tokio::sync::Mutex::new(())),
            storage_unit_lock: Arc::new(tokio::sync::Mutex::new(())),
            held_fragment: Mutex::new(None),
            held_storage_unit: Mutex::new(None),
            observer: Mutex::new(None),
        })
    }

    /// Mutate state and persist the snapshot under one state lock hold.
    fn with_state<T>(&self, f: impl FnOnce(&mut PersistedState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let value = f(&mut state)?;
        let raw = serde_json::to_vec_pretty(&*state).map_err(MetaStoreError::from)?;
        std::fs::write(&self.path, raw).map_err(MetaStoreError::from)?;
        Ok(value)
    }
}

#[async_trait]
impl MetaStore for FileMetaStore {
    async fn register_node(&self, node: FrontEndMeta) -> Result<u64> {
        self.with_state(|state| {
            state.next_node_id += 1;
            let mut node = node;
            node.id = state.next_node_id;
            let id = node.id;
            state.nodes.insert(id, node);
            Ok(id)
        })
    }

    async fn load_nodes(&self) -> Result<HashMap<u64, FrontEndMeta>> {
        Ok(self.state.lock().nodes.clone())
    }

    async fn add_storage_engine(&self, engine: StorageEngineMeta) -> Result<u64> {
        self.with_state(|state| {
            let mut engine = engine;
            engine.id = state.next_engine_id;
            state.next_engine_id += 1;
            let id = engine.id;
            state.engines.insert(id, engine);
            Ok(id)
        })
    }

    async fn load_storage_engines(
        &self,
        local: Vec<StorageEngineMeta>,
    ) -> Result<HashMap<u64, StorageEngineMeta>> {
        self.with_state(|state| {
            if state.engines.is_empty() {
                for mut engine in local {
                    engine.id = state.next_engine_id;
                    state.next_engine_id += 1;
                    state.engines.insert(engine.id, engine);
                }
            }
            Ok(state.engines.clone())
        })
    }

    async fn add_storage_unit(&self) -> Result<String> {
        self.with_state(|state| {
            state.next_unit_seq += 1;
            Ok(format!("unit{:010}", state.next_unit_seq))
        })
    }

    async fn update_storage_unit(&self, unit: &StorageUnitMeta) -> Result<()> {
        self.with_state(|state| {
            let mut stored = unit.clone();
            stored.replicas.clear();
            state.units.insert(stored.id.clone(), stored);
            Ok(())
        })
    }

    async fn load_storage_units(&self) -> Result<HashMap<String, StorageUnitMeta>> {
        Ok(self.state.lock().units.clone())
    }

    async fn add_fragment(&self, fragment: &FragmentMeta) -> Result<()> {
        self.with_state(|state| {
            let exists = state.fragments.iter().any(|f| {
                f.ts_interval == fragment.ts_interval
                    && f.time_interval.start == fragment.time_interval.start
            });
            if exists {
                return Err(MetaStoreError::Contention(format!(
                    "fragment {} at {} already exists",
                    fragment.ts_interval, fragment.time_interval.start
                ))
                .into());
            }
            state.fragments.push(fragment.clone());
            Ok(())
        })
    }

    async fn update_fragment(&self, fragment: &FragmentMeta) -> Result<()> {
        self.with_state(|state| {
            let slot = state.fragments.iter_mut().find(|f| {
                f.ts_interval == fragment.ts_interval
                    && f.time_interval.start == fragment.time_interval.start
            });
            match slot {
                Some(slot) => {
                    *slot = fragment.clone();
                    Ok(())
                }
                None => Err(MetaStoreError::Contention(format!(
                    "fragment {} at {} does not exist",
                    fragment.ts_interval, fragment.time_interval.start
                ))
                .into()),
            }
        })
    }

    async fn load_fragments(&self) -> Result<HashMap<TimeSeriesInterval, Vec<FragmentMeta>>> {
        let state = self.state.lock();
        let mut grouped: HashMap<TimeSeriesInterval, Vec<FragmentMeta>> = HashMap::new();
        for fragment in &state.fragments {
            grouped
                .entry(fragment.ts_interval.clone())
                .or_default()
                .push(fragment.clone());
        }
        for list in grouped.values_mut() {
            list.sort_by_key(|f| f.time_interval.start);
        }
        Ok(grouped)
    }

    async fn update_schema_mapping(
        &self,
        schema: &str,
        mapping: Option<&HashMap<String, i32>>,
    ) -> Result<()> {
        self.with_state(|state| {
            match mapping {
                Some(mapping) => {
                    state
                        .schema_mappings
                        .insert(schema.to_string(), mapping.clone());
                }
                None => {
                    state.schema_mappings.remove(schema);
                }
            }
            Ok(())
        })
    }

    async fn load_schema_mappings(&self) -> Result<HashMap<String, HashMap<String, i32>>> {
        Ok(self.state.lock().schema_mappings.clone())
    }

    async fn add_user(&self, user: &UserMeta) -> Result<()> {
        self.with_state(|state| {
            state.users.insert(user.username.clone(), user.clone());
            Ok(())
        })
    }

    async fn update_user(&self, user: &UserMeta) -> Result<()> {
        self.add_user(user).await
    }

    async fn remove_user(&self, username: &str) -> Result<()> {
        self.with_state(|state| {
            state.users.remove(username);
            Ok(())
        })
    }

    async fn load_users(&self, default_admin: UserMeta) -> Result<Vec<UserMeta>> {
        self.with_state(|state| {
            if state.users.is_empty() {
                state
                    .users
                    .insert(default_admin.username.clone(), default_admin);
            }
            Ok(state.users.values().cloned().collect())
        })
    }

    async fn lock_fragment(&self) -> Result<()> {
        let guard = self.fragment_lock.clone().lock_owned().await;
        *self.held_fragment.lock() = Some(guard);
        Ok(())
    }

    async fn release_fragment(&self) -> Result<()> {
        match self.held_fragment.lock().take() {
            Some(_guard) => Ok(()),
            None => {
                Err(MetaStoreError::Contention("fragment lock not held".to_string()).into())
            }
        }
    }

    async fn lock_storage_unit(&self) -> Result<()> {
        let guard = self.storage_unit_lock.clone().lock_owned().await;
        *self.held_storage_unit.lock() = Some(guard);
        Ok(())
    }

    async fn release_storage_unit(&self) -> Result<()> {
        match self.held_storage_unit.lock().take() {
            Some(_guard) => Ok(()),
            None => {
                Err(MetaStoreError::Contention("storage-unit lock not held".to_string()).into())
            }
        }
    }

    fn subscribe(&self, observer: Arc<dyn MetaStoreObserver>) {
        // Kept for interface parity: a single-process store has no remote
        // writers, so the observer never fires.
        *self.observer.lock() = Some(observer);
    }

    async fn close(&self) -> Result<()> {
        self.held_fragment.lock().take();
        self.held_storage_unit.lock().take();
        Ok(())
    }
}
