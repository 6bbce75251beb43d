//! Cluster metadata manager
//!
//! The authoritative handle over cluster metadata for one front-end
//! process: bootstraps identity, keeps the local [`MetaCache`] in step with
//! the backing [`MetaStore`], and runs the cluster-wide fragment creation
//! protocols. Created once at startup and shared by `Arc` handle.

use super::cache::MetaCache;
use super::dispatcher::{DispatchWorker, QueueObserver};
use super::store::MetaStore;
use super::{
    AuthType, FragmentMeta, FrontEndMeta, StorageEngineMeta, StorageUnitMeta, TimeInterval,
    TimeSeriesInterval, TimeSeriesRange, UserMeta,
};
use crate::config::ClusterConfig;
use crate::ids::SnowflakeIdGenerator;
use crate::{Error, Result};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Hook invoked on the dispatch worker for every storage engine change.
///
/// Hooks must not block: they run on the single dispatch worker and a slow
/// hook stalls every other cache update. Errors are logged, never retried.
pub type StorageEngineChangeHook =
    Box<dyn Fn(Option<&StorageEngineMeta>, &StorageEngineMeta) -> Result<()> + Send + Sync>;

pub struct MetaManager {
    cache: Arc<MetaCache>,
    store: Arc<dyn MetaStore>,
    config: ClusterConfig,
    id: u64,
    id_generator: SnowflakeIdGenerator,
    engine_hooks: Arc<RwLock<Vec<StorageEngineChangeHook>>>,
    prefix_stats: RwLock<HashMap<String, f64>>,
    worker: tokio::task::JoinHandle<()>,
}

impl Drop for MetaManager {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

impl MetaManager {
    /// Construct the manager against the backend named in the config.
    ///
    /// Bootstrap failure is fatal for the process: callers are expected to
    /// exit on error.
    pub async fn new(config: ClusterConfig) -> Result<Arc<Self>> {
        let store = config.open_meta_store()?;
        Self::with_store(config, store).await
    }

    /// Construct the manager against an explicit backend session.
    pub async fn with_store(config: ClusterConfig, store: Arc<dyn MetaStore>) -> Result<Arc<Self>> {
        let cache = Arc::new(MetaCache::new());
        let engine_hooks: Arc<RwLock<Vec<StorageEngineChangeHook>>> =
            Arc::new(RwLock::new(Vec::new()));

        // Subscribe before the initial loads: events racing the bulk load
        // are parked on the queue and gated on the has_* flags.
        let (sender, receiver) = mpsc::unbounded_channel();
        store.subscribe(Arc::new(QueueObserver::new(sender)));

        // Identity first: the node id seeds the unique-id generator and
        // drives echo suppression for everything after it.
        for node in store.load_nodes().await?.into_values() {
            cache.add_node(node);
        }
        let id = store
            .register_node(FrontEndMeta::new(config.host.clone(), config.port))
            .await?;
        info!(node_id = id, "registered front-end node");
        cache.add_node(FrontEndMeta {
            id,
            host: config.host.clone(),
            port: config.port,
        });

        let worker = DispatchWorker {
            local_id: id,
            cache: cache.clone(),
            engine_hooks: engine_hooks.clone(),
        }
        .run(receiver);

        let local_engines = config.parse_storage_engines(id);
        for engine in store
            .load_storage_engines(local_engines)
            .await?
            .into_values()
        {
            cache.add_storage_engine(engine);
        }

        store.lock_storage_unit().await?;
        let units = store.load_storage_units().await;
        store.release_storage_unit().await?;
        cache.init_storage_units(units?);

        store.lock_fragment().await?;
        let fragments = store.load_fragments().await;
        store.release_fragment().await?;
        cache.init_fragments(fragments?);

        for (schema, mapping) in store.load_schema_mappings().await? {
            cache.add_or_update_schema_mapping(&schema, mapping);
        }

        let admin = UserMeta::administrator(&config.admin_username, &config.admin_password);
        for user in store.load_users(admin).await? {
            cache.add_or_update_user(user);
        }

        Ok(Arc::new(Self {
            cache,
            store,
            config,
            id,
            id_generator: SnowflakeIdGenerator::new(id),
            engine_hooks,
            prefix_stats: RwLock::new(HashMap::new()),
            worker,
        }))
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn get_node_id(&self) -> u64 {
        self.id
    }

    pub fn get_node_list(&self) -> Vec<FrontEndMeta> {
        self.cache.get_node_list()
    }

    /// Cluster-unique id for a locally-originated object.
    pub fn generate_id(&self) -> u64 {
        self.id_generator.next_id()
    }

    /// Tear down the backend session, releasing held locks and
    /// deregistering this node.
    pub async fn shutdown(&self) -> Result<()> {
        self.store.close().await
    }

    // ------------------------------------------------------------------
    // Storage engines
    // ------------------------------------------------------------------

    /// Publish operator-supplied engines. All-or-nothing per engine: on a
    /// store failure, engines already added stay and the operator retries.
    pub async fn add_storage_engines(&self, engines: Vec<StorageEngineMeta>) -> bool {
        for mut engine in engines {
            match self.store.add_storage_engine(engine.clone()).await {
                Ok(assigned) => {
                    engine.id = assigned;
                    self.cache.add_storage_engine(engine);
                }
                Err(e) => {
                    error!("add storage engines error: {e}");
                    return false;
                }
            }
        }
        true
    }

    pub fn get_storage_engine(&self, id: u64) -> Option<StorageEngineMeta> {
        self.cache.get_storage_engine(id)
    }

    pub fn get_storage_engine_list(&self) -> Vec<StorageEngineMeta> {
        self.cache.get_storage_engine_list()
    }

    pub fn get_storage_engine_num(&self) -> usize {
        self.cache.get_storage_engine_list().len()
    }

    pub fn register_storage_engine_change_hook(&self, hook: StorageEngineChangeHook) {
        self.engine_hooks.write().push(hook);
    }

    /// Random sample of `1 + replica_num` engine ids, or every engine when
    /// the cluster is no larger than that.
    pub fn select_storage_engine_id_list(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .get_storage_engine_list()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let wanted = 1 + self.config.replica_num;
        if ids.len() <= wanted {
            return ids;
        }
        let mut rng = rand::thread_rng();
        for i in 0..ids.len() {
            let next = rng.gen_range(0..ids.len());
            ids.swap(i, next);
        }
        ids.truncate(wanted);
        ids
    }

    // ------------------------------------------------------------------
    // Storage units
    // ------------------------------------------------------------------

    pub fn get_storage_unit(&self, id: &str) -> Option<StorageUnitMeta> {
        self.cache.get_storage_unit(id)
    }

    pub fn get_storage_units(&self, ids: &HashSet<String>) -> HashMap<String, StorageUnitMeta> {
        self.cache.get_storage_units(ids)
    }

    pub fn has_storage_unit(&self) -> bool {
        self.cache.has_storage_unit()
    }

    // ------------------------------------------------------------------
    // Fragments
    // ------------------------------------------------------------------

    pub fn has_fragment(&self) -> bool {
        self.cache.has_fragment()
    }

    pub fn get_fragment_map_by_ts_range(
        &self,
        range: &TimeSeriesRange,
    ) -> Vec<(TimeSeriesInterval, Vec<FragmentMeta>)> {
        self.cache.get_fragment_map_by_ts_range(range)
    }

    pub fn get_fragment_map_by_ts_range_and_time_interval(
        &self,
        range: &TimeSeriesRange,
        time_interval: &TimeInterval,
    ) -> Vec<(TimeSeriesInterval, Vec<FragmentMeta>)> {
        self.cache
            .get_fragment_map_by_ts_range_and_time_interval(range, time_interval)
    }

    pub fn get_latest_fragment_map(&self) -> BTreeMap<TimeSeriesInterval, FragmentMeta> {
        self.cache.get_latest_fragment_map()
    }

    pub fn get_latest_fragment_map_by_ts_range(
        &self,
        range: &TimeSeriesRange,
    ) -> BTreeMap<TimeSeriesInterval, FragmentMeta> {
        self.cache.get_latest_fragment_map_by_ts_range(range)
    }

    pub fn get_fragment_list_by_series_name(&self, name: &str) -> Vec<FragmentMeta> {
        self.cache.get_fragment_list_by_series_name(name)
    }

    pub fn get_fragment_list_by_series_name_and_time_interval(
        &self,
        name: &str,
        time_interval: &TimeInterval,
    ) -> Vec<FragmentMeta> {
        self.cache
            .get_fragment_list_by_series_name_and_time_interval(name, time_interval)
    }

    pub fn get_latest_fragment_by_series_name(&self, name: &str) -> Option<FragmentMeta> {
        self.cache.get_latest_fragment_by_series_name(name)
    }

    /// One-shot cluster bootstrap: exactly one node's proposal wins no
    /// matter how many front-ends race here. Returns true iff this node's
    /// proposal was persisted.
    pub async fn create_initial_fragments_and_storage_units(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        initial_fragments: Vec<FragmentMeta>,
    ) -> bool {
        if self.cache.has_fragment() && self.cache.has_storage_unit() {
            return false;
        }
        match self
            .initial_creation_locked(storage_units, initial_fragments)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                error!("create initial fragments error: {e}");
                false
            }
        }
    }

    async fn initial_creation_locked(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        initial_fragments: Vec<FragmentMeta>,
    ) -> Result<bool> {
        self.store.lock_fragment().await?;
        if let Err(e) = self.store.lock_storage_unit().await {
            if let Err(release) = self.store.release_fragment().await {
                error!("release fragment lock error: {release}");
            }
            return Err(e);
        }
        let result = self
            .initial_creation_under_locks(storage_units, initial_fragments)
            .await;
        if let Err(e) = self.store.release_storage_unit().await {
            error!("release storage unit lock error: {e}");
        }
        if let Err(e) = self.store.release_fragment().await {
            error!("release fragment lock error: {e}");
        }
        result
    }

    async fn initial_creation_under_locks(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        mut initial_fragments: Vec<FragmentMeta>,
    ) -> Result<bool> {
        if self.cache.has_fragment() && self.cache.has_storage_unit() {
            return Ok(false);
        }

        let global_units = self.store.load_storage_units().await?;
        if !global_units.is_empty() {
            // Another node won the race; adopt its view.
            let global_fragments = self.store.load_fragments().await?;
            self.cache.init_storage_units(global_units);
            self.cache.init_fragments(global_fragments);
            return Ok(false);
        }

        // This node is the initializer. Initial objects do not flow through
        // change events, so the cache is only installed from the reload below.
        let translation = self.publish_storage_units(storage_units, true, false).await?;

        initial_fragments.sort_by_key(|f| f.time_interval.start);
        for mut fragment in initial_fragments {
            fragment.created_by = self.id;
            fragment.initial = true;
            self.relink_fragment(&mut fragment, &translation)?;
            self.store.add_fragment(&fragment).await?;
        }

        // Reload so this cache holds exactly what every other node will see.
        let units = self.store.load_storage_units().await?;
        let fragments = self.store.load_fragments().await?;
        self.cache.init_storage_units(units);
        self.cache.init_fragments(fragments);
        Ok(true)
    }

    /// Incremental fragment creation: closes every currently-open fragment
    /// at the new batch's start time, then publishes the new units and
    /// fragments. Readers never observe two open fragments per series
    /// interval.
    pub async fn create_fragments_and_storage_units(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        fragments: Vec<FragmentMeta>,
    ) -> bool {
        if fragments.is_empty() {
            warn!("create fragments called with an empty batch");
            return false;
        }
        match self.incremental_creation_locked(storage_units, fragments).await {
            Ok(()) => true,
            Err(e) => {
                error!("create fragments error: {e}");
                false
            }
        }
    }

    async fn incremental_creation_locked(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        fragments: Vec<FragmentMeta>,
    ) -> Result<()> {
        self.store.lock_fragment().await?;
        if let Err(e) = self.store.lock_storage_unit().await {
            if let Err(release) = self.store.release_fragment().await {
                error!("release fragment lock error: {release}");
            }
            return Err(e);
        }
        let result = self
            .incremental_creation_under_locks(storage_units, fragments)
            .await;
        if let Err(e) = self.store.release_storage_unit().await {
            error!("release storage unit lock error: {e}");
        }
        if let Err(e) = self.store.release_fragment().await {
            error!("release fragment lock error: {e}");
        }
        result
    }

    async fn incremental_creation_under_locks(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        fragments: Vec<FragmentMeta>,
    ) -> Result<()> {
        let translation = self.publish_storage_units(storage_units, false, true).await?;

        // Close the open fragments before the new ones become visible.
        let boundary = fragments[0].time_interval.start;
        for open in self.cache.get_latest_fragment_map().into_values() {
            let mut closed = open.end_fragment(boundary);
            closed.updated_by = self.id;
            // The closed version must reach peers through change events even
            // when the original came from the bootstrap path, or their
            // caches would keep two open fragments per series interval.
            closed.initial = false;
            self.cache.update_fragment(closed.clone());
            self.store.update_fragment(&closed).await?;
        }

        for mut fragment in fragments {
            fragment.created_by = self.id;
            fragment.initial = false;
            self.relink_fragment(&mut fragment, &translation)?;
            self.cache.add_fragment(fragment.clone());
            self.store.add_fragment(&fragment).await?;
        }
        Ok(())
    }

    /// Reserve real ids for proposed units, rewrite self- and master-id
    /// references through a fake→actual translation table, and publish.
    /// With `update_cache`, each unit lands in the cache before its store
    /// publish returns (optimistic local update).
    async fn publish_storage_units(
        &self,
        storage_units: Vec<StorageUnitMeta>,
        initial: bool,
        update_cache: bool,
    ) -> Result<HashMap<String, StorageUnitMeta>> {
        let mut masters = Vec::new();
        let mut replicas_by_master: HashMap<String, Vec<StorageUnitMeta>> = HashMap::new();
        for unit in storage_units {
            if unit.is_master() {
                masters.push(unit);
            } else {
                replicas_by_master
                    .entry(unit.master_id.clone())
                    .or_default()
                    .push(unit);
            }
        }

        let mut translation: HashMap<String, StorageUnitMeta> = HashMap::new();
        for master in masters {
            let fake_id = master.id.clone();
            let actual_id = self.store.add_storage_unit().await?;
            let mut actual_master = master.renamed(&actual_id, &actual_id);
            actual_master.created_by = self.id;
            actual_master.initial = initial;
            if update_cache {
                self.cache.update_storage_unit(actual_master.clone());
            }
            self.store.update_storage_unit(&actual_master).await?;

            for replica in replicas_by_master.remove(&fake_id).unwrap_or_default() {
                let replica_fake_id = replica.id.clone();
                let replica_actual_id = self.store.add_storage_unit().await?;
                let mut actual_replica = replica.renamed(&replica_actual_id, &actual_id);
                actual_replica.created_by = self.id;
                actual_replica.initial = initial;
                actual_master.add_replica(&actual_replica.id);
                if update_cache {
                    self.cache.update_storage_unit(actual_replica.clone());
                }
                self.store.update_storage_unit(&actual_replica).await?;
                translation.insert(replica_fake_id, actual_replica);
            }

            if update_cache {
                // Re-install the master now that its replica set is known.
                self.cache.update_storage_unit(actual_master.clone());
            }
            translation.insert(fake_id, actual_master);
        }

        for fake_master_id in replicas_by_master.keys() {
            error!(
                %fake_master_id,
                "proposed replica refers to a master absent from the proposal"
            );
        }
        Ok(translation)
    }

    /// Resolve a fragment's placeholder unit id to the real master unit.
    /// A placeholder resolving to a replica is rewritten to that replica's
    /// master.
    fn relink_fragment(
        &self,
        fragment: &mut FragmentMeta,
        translation: &HashMap<String, StorageUnitMeta>,
    ) -> Result<()> {
        let unit = translation
            .get(&fragment.master_storage_unit_id)
            .ok_or_else(|| {
                Error::Internal(format!(
                    "fragment refers to unknown placeholder unit '{}'",
                    fragment.master_storage_unit_id
                ))
            })?;
        fragment.master_storage_unit_id = if unit.is_master() {
            unit.id.clone()
        } else {
            unit.master_id.clone()
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workload statistics / rebalancing
    // ------------------------------------------------------------------

    /// Install a flushed prefix-frequency snapshot. Snapshots are
    /// cumulative, so entries overwrite rather than accumulate.
    pub fn update_prefix(&self, prefix: HashMap<String, f64>) {
        let mut stats = self.prefix_stats.write();
        for (path, weight) in prefix {
            stats.insert(path, weight);
        }
    }

    /// Re-split the open region of the fragment space into `fragment_count`
    /// series ranges starting at `end_time`, with boundaries at weighted
    /// quantiles of the accumulated prefix statistics.
    pub async fn reallocate(&self, fragment_count: usize, end_time: i64) -> bool {
        if fragment_count == 0 {
            return false;
        }
        if self.cache.get_latest_fragment_map().is_empty() {
            return false;
        }
        let boundaries = {
            let stats = self.prefix_stats.read();
            if stats.is_empty() {
                return false;
            }
            weighted_boundaries(&stats, fragment_count)
        };

        let mut bounds: Vec<Option<String>> = Vec::with_capacity(boundaries.len() + 2);
        bounds.push(None);
        bounds.extend(boundaries.into_iter().map(Some));
        bounds.push(None);

        let mut units = Vec::new();
        let mut fragments = Vec::new();
        for window in 0..bounds.len() - 1 {
            let engines = self.select_storage_engine_id_list();
            let Some((&master_engine, replica_engines)) = engines.split_first() else {
                warn!("reallocate with no storage engines available");
                return false;
            };
            let fake_master_id = format!("fake{window}");
            units.push(StorageUnitMeta::new_master(&fake_master_id, master_engine));
            for (i, &engine) in replica_engines.iter().enumerate() {
                units.push(StorageUnitMeta::new_replica(
                    format!("fake{window}r{i}"),
                    engine,
                    &fake_master_id,
                ));
            }
            fragments.push(FragmentMeta::new(
                TimeSeriesInterval::new(bounds[window].clone(), bounds[window + 1].clone()),
                TimeInterval::open_ended(end_time),
                fake_master_id,
            ));
        }
        self.create_fragments_and_storage_units(units, fragments).await
    }

    // ------------------------------------------------------------------
    // Schema mappings
    // ------------------------------------------------------------------

    pub async fn add_or_update_schema_mapping(
        &self,
        schema: &str,
        mapping: Option<HashMap<String, i32>>,
    ) -> bool {
        if let Err(e) = self
            .store
            .update_schema_mapping(schema, mapping.as_ref())
            .await
        {
            error!("update schema mapping error: {e}");
            return false;
        }
        match mapping {
            Some(mapping) => self.cache.add_or_update_schema_mapping(schema, mapping),
            None => self.cache.remove_schema_mapping(schema),
        }
        true
    }

    /// Point update of one schema-mapping item; a value of −1 removes the
    /// key.
    pub async fn add_or_update_schema_mapping_item(
        &self,
        schema: &str,
        key: &str,
        value: i32,
    ) -> bool {
        let mut mapping = self.cache.get_schema_mapping(schema).unwrap_or_default();
        if value == super::cache::SCHEMA_MAPPING_ABSENT {
            mapping.remove(key);
        } else {
            mapping.insert(key.to_string(), value);
        }
        if let Err(e) = self.store.update_schema_mapping(schema, Some(&mapping)).await {
            error!("update schema mapping error: {e}");
            return false;
        }
        if value == super::cache::SCHEMA_MAPPING_ABSENT {
            self.cache.remove_schema_mapping_item(schema, key);
        } else {
            self.cache.add_or_update_schema_mapping_item(schema, key, value);
        }
        true
    }

    pub fn get_schema_mapping(&self, schema: &str) -> Option<HashMap<String, i32>> {
        self.cache.get_schema_mapping(schema)
    }

    pub fn get_schema_mapping_item(&self, schema: &str, key: &str) -> i32 {
        self.cache.get_schema_mapping_item(schema, key)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn add_user(&self, user: UserMeta) -> bool {
        if let Err(e) = self.store.add_user(&user).await {
            error!("add user error: {e}");
            return false;
        }
        self.cache.add_or_update_user(user);
        true
    }

    /// Update a user's password and/or auth set; `None` leaves the field
    /// unchanged. Returns false when the user does not exist.
    pub async fn update_user(
        &self,
        username: &str,
        password: Option<String>,
        auths: Option<HashSet<AuthType>>,
    ) -> bool {
        let Some(mut user) = self.cache.get_user(username) else {
            return false;
        };
        if let Some(password) = password {
            user.password = password;
        }
        if let Some(auths) = auths {
            user.auths = auths;
        }
        if let Err(e) = self.store.update_user(&user).await {
            error!("update user error: {e}");
            return false;
        }
        self.cache.add_or_update_user(user);
        true
    }

    pub async fn remove_user(&self, username: &str) -> bool {
        if let Err(e) = self.store.remove_user(username).await {
            error!("remove user error: {e}");
            return false;
        }
        self.cache.remove_user(username);
        true
    }

    pub fn get_user(&self, username: &str) -> Option<UserMeta> {
        self.cache.get_user(username)
    }

    pub fn get_users(&self) -> Vec<UserMeta> {
        self.cache.get_users()
    }
}

/// Boundary paths splitting the weighted path distribution into
/// `fragment_count` roughly equal-weight ranges.
fn weighted_boundaries(stats: &HashMap<String, f64>, fragment_count: usize) -> Vec<String> {
    let mut entries: Vec<(&String, f64)> = stats.iter().map(|(k, v)| (k, *v)).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let total: f64 = entries.iter().map(|(_, w)| w).sum();
    if total <= 0.0 {
        return Vec::new();
    }

    let step = total / fragment_count as f64;
    let mut boundaries = Vec::new();
    let mut accumulated = 0.0;
    let mut next_cut = step;
    for (path, weight) in entries {
        accumulated += weight;
        while boundaries.len() + 1 < fragment_count && accumulated >= next_cut {
            boundaries.push(path.clone());
            next_cut += step;
        }
    }
    boundaries.dedup();
    boundaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EngineKind, MemoryCoordinator};

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            replica_num: 1,
            ..Default::default()
        }
    }

    async fn manager_with_engines(engine_count: usize) -> Arc<MetaManager> {
        let hub = MemoryCoordinator::new();
        let manager = MetaManager::with_store(test_config(), hub.session())
            .await
            .unwrap();
        let engines = (0..engine_count)
            .map(|i| {
                StorageEngineMeta::new(
                    "127.0.0.1",
                    (8086 + i) as u16,
                    EngineKind::InfluxDb,
                    HashMap::new(),
                    manager.get_node_id(),
                )
            })
            .collect();
        assert!(manager.add_storage_engines(engines).await);
        manager
    }

    fn proposal(
        engine_ids: &[u64],
    ) -> (Vec<StorageUnitMeta>, Vec<FragmentMeta>) {
        let mut units = vec![StorageUnitMeta::new_master("fake0", engine_ids[0])];
        for (i, &engine) in engine_ids[1..].iter().enumerate() {
            units.push(StorageUnitMeta::new_replica(
                format!("fake0r{i}"),
                engine,
                "fake0",
            ));
        }
        let fragments = vec![FragmentMeta::new(
            TimeSeriesInterval::unbounded(),
            TimeInterval::open_ended(0),
            "fake0",
        )];
        (units, fragments)
    }

    #[tokio::test]
    async fn select_storage_engine_id_list_size() {
        let manager = manager_with_engines(5).await;
        let selected = manager.select_storage_engine_id_list();
        assert_eq!(selected.len(), 2);
        let all: HashSet<u64> = manager
            .get_storage_engine_list()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert!(selected.iter().all(|id| all.contains(id)));

        let small = manager_with_engines(1).await;
        assert_eq!(small.select_storage_engine_id_list().len(), 1);
    }

    #[tokio::test]
    async fn initial_creation_rewrites_fake_ids() {
        let manager = manager_with_engines(2).await;
        let engines: Vec<u64> = manager
            .get_storage_engine_list()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let (units, fragments) = proposal(&engines);
        assert!(
            manager
                .create_initial_fragments_and_storage_units(units, fragments)
                .await
        );

        let latest = manager.get_latest_fragment_map();
        assert_eq!(latest.len(), 1);
        let fragment = latest.values().next().unwrap();
        assert!(fragment.master_storage_unit_id.starts_with("unit"));
        let master = manager
            .get_storage_unit(&fragment.master_storage_unit_id)
            .unwrap();
        assert!(master.is_master());
        assert_eq!(master.replicas.len(), 1);
        assert!(master.initial);

        // A repeat attempt finds the cache populated and declines.
        let (units, fragments) = proposal(&engines);
        assert!(
            !manager
                .create_initial_fragments_and_storage_units(units, fragments)
                .await
        );
    }

    #[tokio::test]
    async fn incremental_creation_closes_open_fragments() {
        let manager = manager_with_engines(2).await;
        let engines: Vec<u64> = manager
            .get_storage_engine_list()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let (units, fragments) = proposal(&engines);
        assert!(
            manager
                .create_initial_fragments_and_storage_units(units, fragments)
                .await
        );

        let units = vec![StorageUnitMeta::new_master("fresh0", engines[0])];
        let fragments = vec![FragmentMeta::new(
            TimeSeriesInterval::unbounded(),
            TimeInterval::open_ended(1000),
            "fresh0",
        )];
        assert!(manager.create_fragments_and_storage_units(units, fragments).await);

        // One open fragment per series interval; the predecessor ends
        // exactly at the successor's start.
        let latest = manager.get_latest_fragment_map();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest.values().next().unwrap().time_interval.start, 1000);
        let all = manager.get_fragment_list_by_series_name("any.series");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].time_interval.end, 1000);
        assert!(!all[1].initial);
    }

    #[tokio::test]
    async fn reallocate_requires_stats_and_fragments() {
        let manager = manager_with_engines(2).await;
        assert!(!manager.reallocate(4, 1000).await);

        let engines: Vec<u64> = manager
            .get_storage_engine_list()
            .into_iter()
            .map(|e| e.id)
            .collect();
        let (units, fragments) = proposal(&engines);
        manager
            .create_initial_fragments_and_storage_units(units, fragments)
            .await;
        // Fragments exist but no statistics yet.
        assert!(!manager.reallocate(4, 1000).await);

        manager.update_prefix(
            (0..8)
                .map(|i| (format!("region.host{i}.cpu"), 1.0))
                .collect(),
        );
        assert!(manager.reallocate(4, 1000).await);
        let latest = manager.get_latest_fragment_map();
        assert_eq!(latest.len(), 4);
        assert!(latest.values().all(|f| f.time_interval.start == 1000));
    }

    #[test]
    fn weighted_boundaries_split_evenly() {
        let stats: HashMap<String, f64> =
            (0..4).map(|i| (format!("p{i}"), 1.0)).collect();
        let boundaries = weighted_boundaries(&stats, 2);
        assert_eq!(boundaries, vec!["p1".to_string()]);

        // A single dominant path cannot produce duplicate boundaries.
        let mut skewed = stats;
        skewed.insert("p0".to_string(), 100.0);
        let boundaries = weighted_boundaries(&skewed, 4);
        let unique: HashSet<&String> = boundaries.iter().collect();
        assert_eq!(unique.len(), boundaries.len());
    }

    #[tokio::test]
    async fn user_update_preserves_unset_fields() {
        let manager = manager_with_engines(1).await;
        assert!(
            manager
                .update_user("root", None, Some([AuthType::Read].into_iter().collect()))
                .await
        );
        let user = manager.get_user("root").unwrap();
        assert_eq!(user.password, "root");
        assert_eq!(user.auths, [AuthType::Read].into_iter().collect());
        assert!(!manager.update_user("ghost", None, None).await);
    }
}
