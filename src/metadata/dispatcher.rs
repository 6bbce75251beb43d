//! Change-event dispatch
//!
//! All backend observer callbacks funnel into one unbounded queue consumed
//! by a dedicated worker, so cache mutations have a single writer no matter
//! which thread the backend delivers events on. The worker applies the
//! echo/initial/pre-bootstrap filters before touching the cache.

use super::cache::MetaCache;
use super::manager::StorageEngineChangeHook;
use super::store::MetaStoreObserver;
use super::{FragmentMeta, FrontEndMeta, StorageEngineMeta, StorageUnitMeta, UserMeta};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};

/// A remote metadata change delivered by the backend.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Node {
        id: u64,
        node: Option<FrontEndMeta>,
    },
    StorageEngine {
        engine: StorageEngineMeta,
    },
    StorageUnit {
        id: String,
        unit: StorageUnitMeta,
    },
    Fragment {
        create: bool,
        fragment: FragmentMeta,
    },
    SchemaMapping {
        schema: String,
        mapping: Option<HashMap<String, i32>>,
    },
    User {
        username: String,
        user: Option<UserMeta>,
    },
}

/// Observer installed into the backend; forwards every event to the worker
/// queue without blocking the delivering thread.
pub(super) struct QueueObserver {
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

impl QueueObserver {
    pub(super) fn new(sender: mpsc::UnboundedSender<ChangeEvent>) -> Self {
        Self { sender }
    }

    fn push(&self, event: ChangeEvent) {
        // A closed receiver just means the manager shut down first.
        let _ = self.sender.send(event);
    }
}

impl MetaStoreObserver for QueueObserver {
    fn node_changed(&self, id: u64, node: Option<FrontEndMeta>) {
        self.push(ChangeEvent::Node { id, node });
    }

    fn storage_engine_added(&self, engine: StorageEngineMeta) {
        self.push(ChangeEvent::StorageEngine { engine });
    }

    fn storage_unit_changed(&self, id: String, unit: StorageUnitMeta) {
        self.push(ChangeEvent::StorageUnit { id, unit });
    }

    fn fragment_changed(&self, create: bool, fragment: FragmentMeta) {
        self.push(ChangeEvent::Fragment { create, fragment });
    }

    fn schema_mapping_changed(&self, schema: String, mapping: Option<HashMap<String, i32>>) {
        self.push(ChangeEvent::SchemaMapping { schema, mapping });
    }

    fn user_changed(&self, username: String, user: Option<UserMeta>) {
        self.push(ChangeEvent::User { username, user });
    }
}

/// The dispatch worker: drains the queue and reduces events into cache
/// mutations.
pub(super) struct DispatchWorker {
    pub(super) local_id: u64,
    pub(super) cache: Arc<MetaCache>,
    pub(super) engine_hooks: Arc<RwLock<Vec<StorageEngineChangeHook>>>,
}

impl DispatchWorker {
    pub(super) fn run(
        self,
        mut receiver: mpsc::UnboundedReceiver<ChangeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                self.apply(event);
            }
        })
    }

    pub(super) fn apply(&self, event: ChangeEvent) {
        match event {
            ChangeEvent::Node { id, node } => match node {
                Some(node) => self.cache.add_node(node),
                None => self.cache.remove_node(id),
            },
            ChangeEvent::StorageEngine { engine } => {
                self.cache.add_storage_engine(engine.clone());
                for hook in self.engine_hooks.read().iter() {
                    if let Err(e) = hook(None, &engine) {
                        error!(engine_id = engine.id, "storage engine change hook failed: {e}");
                    }
                }
            }
            ChangeEvent::StorageUnit { id, unit } => self.apply_storage_unit(id, unit),
            ChangeEvent::Fragment { create, fragment } => self.apply_fragment(create, fragment),
            ChangeEvent::SchemaMapping { schema, mapping } => match mapping {
                Some(mapping) if !mapping.is_empty() => {
                    self.cache.add_or_update_schema_mapping(&schema, mapping)
                }
                _ => self.cache.remove_schema_mapping(&schema),
            },
            ChangeEvent::User { username, user } => match user {
                Some(user) => self.cache.add_or_update_user(user),
                None => self.cache.remove_user(&username),
            },
        }
    }

    fn apply_storage_unit(&self, id: String, mut unit: StorageUnitMeta) {
        if unit.created_by == self.local_id {
            // Already applied optimistically by the local write path.
            return;
        }
        if unit.initial {
            // Initial units flow through the bootstrap load only.
            return;
        }
        if !self.cache.has_storage_unit() {
            // Pre-bootstrap; the bulk load will pick this unit up.
            return;
        }
        let origin = self.cache.get_storage_unit(&id);
        match &origin {
            None => {
                if !unit.is_master() && !self.cache.add_replica_to_master(&unit.master_id, &unit.id)
                {
                    warn!(
                        unit_id = %unit.id,
                        master_id = %unit.master_id,
                        "replica arrived before its master storage unit"
                    );
                }
                self.cache.add_storage_unit(unit);
            }
            Some(origin) => {
                if unit.is_master() {
                    // A republished master does not carry the replica index.
                    unit.replicas = origin.replicas.clone();
                }
                self.cache.update_storage_unit(unit);
            }
        }
    }

    fn apply_fragment(&self, create: bool, fragment: FragmentMeta) {
        if create && fragment.created_by == self.local_id {
            return;
        }
        if !create && fragment.updated_by == self.local_id {
            return;
        }
        if fragment.initial {
            return;
        }
        if !self.cache.has_fragment() {
            return;
        }
        if self
            .cache
            .get_storage_unit(&fragment.master_storage_unit_id)
            .is_none()
        {
            warn!(
                master_storage_unit_id = %fragment.master_storage_unit_id,
                "fragment refers to a storage unit absent from the cache"
            );
        }
        if create {
            self.cache.add_fragment(fragment);
        } else {
            self.cache.update_fragment(fragment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{TimeInterval, TimeSeriesInterval};

    fn worker(local_id: u64) -> DispatchWorker {
        DispatchWorker {
            local_id,
            cache: Arc::new(MetaCache::new()),
            engine_hooks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Worker whose cache has completed the bootstrap loads, so unit and
    /// fragment events pass the pre-bootstrap gate.
    fn bootstrapped_worker(local_id: u64) -> DispatchWorker {
        let worker = worker(local_id);
        let seed = StorageUnitMeta::new_master("unit0000000099", 0);
        let mut units = HashMap::new();
        units.insert(seed.id.clone(), seed);
        worker.cache.init_storage_units(units);

        let key = TimeSeriesInterval::new(Some("zz".to_string()), None);
        let mut fragments = HashMap::new();
        fragments.insert(
            key.clone(),
            vec![FragmentMeta::new(
                key,
                TimeInterval::open_ended(0),
                "unit0000000099",
            )],
        );
        worker.cache.init_fragments(fragments);
        worker
    }

    fn remote_unit(id: &str, created_by: u64) -> StorageUnitMeta {
        let mut unit = StorageUnitMeta::new_master(id, 0);
        unit.created_by = created_by;
        unit
    }

    #[test]
    fn self_originated_unit_events_are_dropped() {
        let worker = bootstrapped_worker(1);
        worker.apply(ChangeEvent::StorageUnit {
            id: "unit0000000001".to_string(),
            unit: remote_unit("unit0000000001", 1),
        });
        assert!(worker.cache.get_storage_unit("unit0000000001").is_none());
    }

    #[test]
    fn pre_bootstrap_unit_events_are_dropped() {
        let worker = worker(1);
        worker.apply(ChangeEvent::StorageUnit {
            id: "unit0000000001".to_string(),
            unit: remote_unit("unit0000000001", 2),
        });
        assert!(!worker.cache.has_storage_unit());
        assert!(worker.cache.get_storage_unit("unit0000000001").is_none());
    }

    #[test]
    fn initial_flagged_unit_events_are_dropped() {
        let worker = bootstrapped_worker(1);
        let mut unit = remote_unit("unit0000000001", 2);
        unit.initial = true;
        worker.apply(ChangeEvent::StorageUnit {
            id: unit.id.clone(),
            unit,
        });
        assert!(worker.cache.get_storage_unit("unit0000000001").is_none());
    }

    #[test]
    fn remote_replica_spliced_into_master() {
        let worker = bootstrapped_worker(1);
        worker.apply(ChangeEvent::StorageUnit {
            id: "unit0000000001".to_string(),
            unit: remote_unit("unit0000000001", 2),
        });

        let mut replica = StorageUnitMeta::new_replica("unit0000000002", 1, "unit0000000001");
        replica.created_by = 2;
        worker.apply(ChangeEvent::StorageUnit {
            id: replica.id.clone(),
            unit: replica,
        });

        let master = worker.cache.get_storage_unit("unit0000000001").unwrap();
        assert_eq!(master.replicas, vec!["unit0000000002".to_string()]);
    }

    #[test]
    fn master_update_preserves_replica_index() {
        let worker = bootstrapped_worker(1);
        worker.apply(ChangeEvent::StorageUnit {
            id: "unit0000000001".to_string(),
            unit: remote_unit("unit0000000001", 2),
        });
        let mut replica = StorageUnitMeta::new_replica("unit0000000002", 1, "unit0000000001");
        replica.created_by = 2;
        worker.apply(ChangeEvent::StorageUnit {
            id: replica.id.clone(),
            unit: replica,
        });

        // Republish the master (e.g. moved to another engine).
        let mut moved = remote_unit("unit0000000001", 2);
        moved.storage_engine_id = 5;
        worker.apply(ChangeEvent::StorageUnit {
            id: moved.id.clone(),
            unit: moved,
        });

        let master = worker.cache.get_storage_unit("unit0000000001").unwrap();
        assert_eq!(master.storage_engine_id, 5);
        assert_eq!(master.replicas, vec!["unit0000000002".to_string()]);
    }

    #[test]
    fn fragment_update_echo_is_dropped() {
        let worker = bootstrapped_worker(1);

        let key = TimeSeriesInterval::new(Some("a".to_string()), Some("m".to_string()));
        let mut fragment = FragmentMeta::new(
            key.clone(),
            TimeInterval::open_ended(0),
            "unit0000000099",
        );
        fragment.created_by = 2;
        worker.apply(ChangeEvent::Fragment {
            create: true,
            fragment: fragment.clone(),
        });
        assert!(worker.cache.get_latest_fragment_map().contains_key(&key));

        // A local update must not re-apply through the observer path.
        let mut closed = fragment.end_fragment(100);
        closed.updated_by = 1;
        worker.apply(ChangeEvent::Fragment {
            create: false,
            fragment: closed,
        });
        assert!(worker.cache.get_latest_fragment_map().contains_key(&key));
    }

    #[test]
    fn engine_hooks_fan_out_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let worker = worker(1);
        let calls = Arc::new(AtomicUsize::new(0));
        for expected in 0..3usize {
            let calls = calls.clone();
            worker
                .engine_hooks
                .write()
                .push(Box::new(move |before, after| {
                    assert!(before.is_none());
                    assert_eq!(after.id, 9);
                    assert_eq!(calls.fetch_add(1, Ordering::SeqCst) % 3, expected);
                    Ok(())
                }));
        }
        let engine = StorageEngineMeta::new("127.0.0.1", 8086, crate::metadata::EngineKind::InfluxDb, HashMap::new(), 2);
        let mut engine = engine;
        engine.id = 9;
        worker.apply(ChangeEvent::StorageEngine { engine });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
