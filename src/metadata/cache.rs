//! In-memory index of cluster metadata
//!
//! The cache owns the only mutable copies of the entities; everything else
//! refers to them by id. Each logical index serializes readers and writers
//! through its own `RwLock`, so every method is read-consistent on its own
//! (no torn reads) and no method holds two index locks at once.

use super::{
    FragmentMeta, FrontEndMeta, StorageEngineMeta, StorageUnitMeta, TimeInterval,
    TimeSeriesInterval, TimeSeriesRange, UserMeta,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::error;

/// Sentinel returned for absent schema-mapping items.
pub const SCHEMA_MAPPING_ABSENT: i32 = -1;

#[derive(Default)]
struct EngineIndex {
    engines: HashMap<u64, StorageEngineMeta>,
    /// engineId → unit ids currently assigned to it
    engine_units: HashMap<u64, Vec<String>>,
}

#[derive(Default)]
struct UnitIndex {
    units: HashMap<String, StorageUnitMeta>,
    initialized: bool,
}

#[derive(Default)]
struct FragmentIndex {
    /// Series-interval keys in insertion order, each with its fragment list
    /// sorted by start time ascending
    ordered: Vec<(TimeSeriesInterval, Vec<FragmentMeta>)>,
    /// Open-ended fragment per series interval
    latest: BTreeMap<TimeSeriesInterval, FragmentMeta>,
    initialized: bool,
}

/// Thread-safe in-memory view of cluster metadata.
#[derive(Default)]
pub struct MetaCache {
    nodes: RwLock<HashMap<u64, FrontEndMeta>>,
    engines: RwLock<EngineIndex>,
    units: RwLock<UnitIndex>,
    fragments: RwLock<FragmentIndex>,
    schema_mappings: RwLock<HashMap<String, HashMap<String, i32>>>,
    users: RwLock<HashMap<String, UserMeta>>,
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Front-end nodes
    // ------------------------------------------------------------------

    pub fn add_node(&self, node: FrontEndMeta) {
        self.nodes.write().insert(node.id, node);
    }

    pub fn remove_node(&self, id: u64) {
        self.nodes.write().remove(&id);
    }

    pub fn get_node_list(&self) -> Vec<FrontEndMeta> {
        self.nodes.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Storage engines
    // ------------------------------------------------------------------

    pub fn add_storage_engine(&self, engine: StorageEngineMeta) {
        let mut index = self.engines.write();
        index.engine_units.entry(engine.id).or_default();
        index.engines.insert(engine.id, engine);
    }

    pub fn get_storage_engine(&self, id: u64) -> Option<StorageEngineMeta> {
        self.engines.read().engines.get(&id).cloned()
    }

    pub fn get_storage_engine_list(&self) -> Vec<StorageEngineMeta> {
        self.engines.read().engines.values().cloned().collect()
    }

    pub fn get_storage_engine_units(&self, engine_id: u64) -> Vec<String> {
        self.engines
            .read()
            .engine_units
            .get(&engine_id)
            .cloned()
            .unwrap_or_default()
    }

    fn link_unit_to_engine(&self, engine_id: u64, unit_id: &str) {
        let mut index = self.engines.write();
        let units = index.engine_units.entry(engine_id).or_default();
        if !units.iter().any(|u| u == unit_id) {
            units.push(unit_id.to_string());
        }
    }

    // ------------------------------------------------------------------
    // Storage units
    // ------------------------------------------------------------------

    pub fn has_storage_unit(&self) -> bool {
        self.units.read().initialized
    }

    /// Bulk-install the storage unit view. Idempotent: once initialized, a
    /// subsequent call is a no-op, and an empty install leaves the cache
    /// uninitialized (a fresh cluster has nothing to install yet). Replica
    /// sets are rebuilt from master-id pointers, since the durable copies
    /// do not carry them.
    pub fn init_storage_units(&self, mut units: HashMap<String, StorageUnitMeta>) {
        if units.is_empty() {
            return;
        }
        {
            let mut index = self.units.write();
            if index.initialized {
                return;
            }
            relink_replicas(&mut units);
            index.units = units.clone();
            index.initialized = true;
        }
        for unit in units.values() {
            self.link_unit_to_engine(unit.storage_engine_id, &unit.id);
        }
    }

    /// Insert or replace a storage unit and keep the engine back-pointer
    /// index in sync.
    pub fn add_storage_unit(&self, unit: StorageUnitMeta) {
        let engine_id = unit.storage_engine_id;
        let unit_id = unit.id.clone();
        self.units.write().units.insert(unit.id.clone(), unit);
        self.link_unit_to_engine(engine_id, &unit_id);
    }

    pub fn update_storage_unit(&self, unit: StorageUnitMeta) {
        self.add_storage_unit(unit);
    }

    pub fn get_storage_unit(&self, id: &str) -> Option<StorageUnitMeta> {
        self.units.read().units.get(id).cloned()
    }

    pub fn get_storage_units(&self, ids: &HashSet<String>) -> HashMap<String, StorageUnitMeta> {
        let index = self.units.read();
        ids.iter()
            .filter_map(|id| index.units.get(id).map(|u| (id.clone(), u.clone())))
            .collect()
    }

    /// Splice a replica into its master's replica set. Returns false when
    /// the master is absent from the cache.
    pub fn add_replica_to_master(&self, master_id: &str, replica_id: &str) -> bool {
        let mut index = self.units.write();
        match index.units.get_mut(master_id) {
            Some(master) => {
                master.add_replica(replica_id);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Fragments
    // ------------------------------------------------------------------

    pub fn has_fragment(&self) -> bool {
        self.fragments.read().initialized
    }

    /// Bulk-install the fragment view. Idempotent like
    /// [`init_storage_units`](Self::init_storage_units): a second call or an
    /// empty install is a no-op. Keys are installed in series-interval
    /// order; later additions append in arrival order.
    pub fn init_fragments(&self, map: HashMap<TimeSeriesInterval, Vec<FragmentMeta>>) {
        if map.is_empty() {
            return;
        }
        let mut index = self.fragments.write();
        if index.initialized {
            return;
        }
        let mut keys: Vec<TimeSeriesInterval> = map.keys().cloned().collect();
        keys.sort();
        for key in keys {
            let mut list = map[&key].clone();
            list.sort_by_key(|f| f.time_interval.start);
            if let Some(open) = list.iter().find(|f| f.time_interval.is_open_ended()) {
                index.latest.insert(key.clone(), open.clone());
            }
            index.ordered.push((key, list));
        }
        index.initialized = true;
    }

    /// Insert a fragment, keeping its series-interval list sorted by start
    /// time. Two fragments with equal start times under one series interval
    /// would break the non-overlap invariant; the duplicate is logged and
    /// dropped.
    pub fn add_fragment(&self, fragment: FragmentMeta) {
        let mut index = self.fragments.write();
        let position = index
            .ordered
            .iter()
            .position(|(key, _)| *key == fragment.ts_interval);
        let position = match position {
            Some(position) => position,
            None => {
                index
                    .ordered
                    .push((fragment.ts_interval.clone(), Vec::new()));
                index.ordered.len() - 1
            }
        };
        let list = &mut index.ordered[position].1;
        match list.binary_search_by_key(&fragment.time_interval.start, |f| f.time_interval.start) {
            Ok(_) => {
                error!(
                    ts_interval = %fragment.ts_interval,
                    start_time = fragment.time_interval.start,
                    "cache consistency error: duplicate fragment start time in series interval"
                );
                return;
            }
            Err(position) => list.insert(position, fragment.clone()),
        }
        if fragment.time_interval.is_open_ended() {
            index.latest.insert(fragment.ts_interval.clone(), fragment);
        }
    }

    /// Replace the fragment sharing the given series interval and start
    /// time, maintaining the latest-fragment index.
    pub fn update_fragment(&self, fragment: FragmentMeta) {
        let mut index = self.fragments.write();
        let entry = index
            .ordered
            .iter_mut()
            .find(|(key, _)| *key == fragment.ts_interval);
        let Some((_, list)) = entry else {
            error!(
                ts_interval = %fragment.ts_interval,
                "cache consistency error: update for unknown series interval"
            );
            return;
        };
        match list.binary_search_by_key(&fragment.time_interval.start, |f| f.time_interval.start) {
            Ok(position) => list[position] = fragment.clone(),
            Err(_) => {
                error!(
                    ts_interval = %fragment.ts_interval,
                    start_time = fragment.time_interval.start,
                    "cache consistency error: update for unknown fragment"
                );
                return;
            }
        }
        if fragment.time_interval.is_open_ended() {
            index.latest.insert(fragment.ts_interval.clone(), fragment);
        } else if index
            .latest
            .get(&fragment.ts_interval)
            .is_some_and(|latest| latest.time_interval.start == fragment.time_interval.start)
        {
            index.latest.remove(&fragment.ts_interval);
        }
    }

    /// All fragments whose series interval overlaps the range, grouped by
    /// series interval in key-insertion order.
    pub fn get_fragment_map_by_ts_range(
        &self,
        range: &TimeSeriesRange,
    ) -> Vec<(TimeSeriesInterval, Vec<FragmentMeta>)> {
        self.fragments
            .read()
            .ordered
            .iter()
            .filter(|(key, _)| range.overlaps(key))
            .map(|(key, list)| (key.clone(), list.clone()))
            .collect()
    }

    /// As [`get_fragment_map_by_ts_range`](Self::get_fragment_map_by_ts_range),
    /// additionally filtered by time overlap.
    pub fn get_fragment_map_by_ts_range_and_time_interval(
        &self,
        range: &TimeSeriesRange,
        time_interval: &TimeInterval,
    ) -> Vec<(TimeSeriesInterval, Vec<FragmentMeta>)> {
        self.fragments
            .read()
            .ordered
            .iter()
            .filter(|(key, _)| range.overlaps(key))
            .filter_map(|(key, list)| {
                let filtered: Vec<FragmentMeta> = list
                    .iter()
                    .filter(|f| f.time_interval.is_intersect(time_interval))
                    .cloned()
                    .collect();
                if filtered.is_empty() {
                    None
                } else {
                    Some((key.clone(), filtered))
                }
            })
            .collect()
    }

    /// The open-ended fragment per series interval.
    pub fn get_latest_fragment_map(&self) -> BTreeMap<TimeSeriesInterval, FragmentMeta> {
        self.fragments.read().latest.clone()
    }

    pub fn get_latest_fragment_map_by_ts_range(
        &self,
        range: &TimeSeriesRange,
    ) -> BTreeMap<TimeSeriesInterval, FragmentMeta> {
        self.fragments
            .read()
            .latest
            .iter()
            .filter(|(key, _)| range.overlaps(key))
            .map(|(key, fragment)| (key.clone(), fragment.clone()))
            .collect()
    }

    pub fn get_fragment_list_by_series_name(&self, name: &str) -> Vec<FragmentMeta> {
        let index = self.fragments.read();
        let mut result: Vec<FragmentMeta> = index
            .ordered
            .iter()
            .filter(|(key, _)| key.contains_name(name))
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        result.sort_by_key(|f| f.time_interval.start);
        result
    }

    pub fn get_fragment_list_by_series_name_and_time_interval(
        &self,
        name: &str,
        time_interval: &TimeInterval,
    ) -> Vec<FragmentMeta> {
        let mut result = self.get_fragment_list_by_series_name(name);
        result.retain(|f| f.time_interval.is_intersect(time_interval));
        result
    }

    pub fn get_latest_fragment_by_series_name(&self, name: &str) -> Option<FragmentMeta> {
        self.fragments
            .read()
            .latest
            .iter()
            .find(|(key, _)| key.contains_name(name))
            .map(|(_, fragment)| fragment.clone())
    }

    // ------------------------------------------------------------------
    // Schema mappings
    // ------------------------------------------------------------------

    pub fn add_or_update_schema_mapping(&self, schema: &str, mapping: HashMap<String, i32>) {
        self.schema_mappings
            .write()
            .insert(schema.to_string(), mapping);
    }

    pub fn remove_schema_mapping(&self, schema: &str) {
        self.schema_mappings.write().remove(schema);
    }

    pub fn add_or_update_schema_mapping_item(&self, schema: &str, key: &str, value: i32) {
        self.schema_mappings
            .write()
            .entry(schema.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn remove_schema_mapping_item(&self, schema: &str, key: &str) {
        if let Some(mapping) = self.schema_mappings.write().get_mut(schema) {
            mapping.remove(key);
        }
    }

    pub fn get_schema_mapping(&self, schema: &str) -> Option<HashMap<String, i32>> {
        self.schema_mappings.read().get(schema).cloned()
    }

    pub fn get_schema_mapping_item(&self, schema: &str, key: &str) -> i32 {
        self.schema_mappings
            .read()
            .get(schema)
            .and_then(|mapping| mapping.get(key).copied())
            .unwrap_or(SCHEMA_MAPPING_ABSENT)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn add_or_update_user(&self, user: UserMeta) {
        self.users.write().insert(user.username.clone(), user);
    }

    pub fn remove_user(&self, username: &str) {
        self.users.write().remove(username);
    }

    pub fn get_user(&self, username: &str) -> Option<UserMeta> {
        self.users.read().get(username).cloned()
    }

    pub fn get_users(&self) -> Vec<UserMeta> {
        self.users.read().values().cloned().collect()
    }
}

/// Rebuild replica sets from master-id pointers after a bulk load.
fn relink_replicas(units: &mut HashMap<String, StorageUnitMeta>) {
    for unit in units.values_mut() {
        unit.replicas.clear();
    }
    let replica_links: Vec<(String, String)> = units
        .values()
        .filter(|u| !u.is_master())
        .map(|u| (u.master_id.clone(), u.id.clone()))
        .collect();
    for (master_id, replica_id) in replica_links {
        match units.get_mut(&master_id) {
            Some(master) => master.add_replica(&replica_id),
            None => error!(
                %master_id,
                %replica_id,
                "storage unit refers to a master absent from the loaded view"
            ),
        }
    }
}
