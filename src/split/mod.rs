//! Plan splitting
//!
//! Maps a logical read/write plan onto the set of (fragment, storage unit)
//! pairs that must execute it, bootstrapping the initial fragment layout on
//! first write and arming a rebalance when the observed workload has grown
//! past the configured threshold.

mod downsample;
mod generator;

pub use downsample::{assign_combine_groups, split_downsample_intervals, GroupedShard};
pub use generator::{EvenFragmentGenerator, FragmentGenerator};

use crate::config::ClusterConfig;
use crate::metadata::{
    FragmentMeta, MetaManager, StorageUnitMeta, TimeInterval, TimeSeriesInterval, TimeSeriesRange,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Aggregation function of an aggregate or downsample plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Min,
    Max,
    Sum,
    Count,
    Avg,
    First,
    Last,
}

/// Kind of a logical plan arriving from the front protocol surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    InsertRows,
    InsertNonAlignedRows,
    InsertColumns,
    InsertNonAlignedColumns,
    DeleteData,
    DeleteColumns,
    Query,
    ValueFilterQuery,
    Aggregate(AggregateKind),
    Downsample(AggregateKind),
    ShowColumns,
}

impl PlanKind {
    /// Write plans address the master and every replica; read plans address
    /// the master only.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            PlanKind::InsertRows
                | PlanKind::InsertNonAlignedRows
                | PlanKind::InsertColumns
                | PlanKind::InsertNonAlignedColumns
                | PlanKind::DeleteData
                | PlanKind::DeleteColumns
        )
    }

    fn is_insert(&self) -> bool {
        matches!(
            self,
            PlanKind::InsertRows
                | PlanKind::InsertNonAlignedRows
                | PlanKind::InsertColumns
                | PlanKind::InsertNonAlignedColumns
        )
    }
}

/// A logical plan reduced to what splitting needs: the referenced paths,
/// the addressed time interval and, for downsampled aggregates, the
/// precision.
#[derive(Debug, Clone)]
pub struct Plan {
    pub kind: PlanKind,
    pub paths: Vec<String>,
    pub time_interval: TimeInterval,
    pub precision: Option<i64>,
}

impl Plan {
    pub fn new(kind: PlanKind, paths: Vec<String>, time_interval: TimeInterval) -> Self {
        Self {
            kind,
            paths,
            time_interval,
            precision: None,
        }
    }

    pub fn insert_rows(paths: Vec<String>, time_interval: TimeInterval) -> Self {
        Self::new(PlanKind::InsertRows, paths, time_interval)
    }

    pub fn insert_columns(paths: Vec<String>, time_interval: TimeInterval) -> Self {
        Self::new(PlanKind::InsertColumns, paths, time_interval)
    }

    pub fn query(paths: Vec<String>, time_interval: TimeInterval) -> Self {
        Self::new(PlanKind::Query, paths, time_interval)
    }

    pub fn delete_data(paths: Vec<String>, time_interval: TimeInterval) -> Self {
        Self::new(PlanKind::DeleteData, paths, time_interval)
    }

    pub fn delete_columns(paths: Vec<String>) -> Self {
        Self::new(PlanKind::DeleteColumns, paths, TimeInterval::new(0, i64::MAX))
    }

    pub fn aggregate(kind: AggregateKind, paths: Vec<String>, time_interval: TimeInterval) -> Self {
        Self::new(PlanKind::Aggregate(kind), paths, time_interval)
    }

    pub fn downsample(
        kind: AggregateKind,
        paths: Vec<String>,
        time_interval: TimeInterval,
        precision: i64,
    ) -> Self {
        Self {
            kind: PlanKind::Downsample(kind),
            paths,
            time_interval,
            precision: Some(precision),
        }
    }

    /// The closed series range addressed by this plan.
    pub fn ts_range(&self) -> TimeSeriesRange {
        TimeSeriesRange::from_paths(&self.paths)
    }
}

/// One execution target: a time/series slice to run against one storage
/// unit.
#[derive(Debug, Clone)]
pub struct SplitInfo {
    pub time_interval: TimeInterval,
    pub ts_interval: TimeSeriesInterval,
    pub storage_unit: StorageUnitMeta,
    pub kind: PlanKind,
    /// Label reuniting partial downsample aggregates after execution
    pub combine_group: Option<u64>,
}

struct FlushState {
    threshold: usize,
    first_flush_done: bool,
}

/// Splits logical plans into per-(fragment, storage unit) tasks.
pub struct PlanSplitter {
    manager: Arc<MetaManager>,
    generator: Arc<dyn FragmentGenerator>,
    /// Sliding prefix-frequency table; counters mutate without the flush
    /// lock
    prefix: DashMap<String, f64>,
    flush_state: RwLock<FlushState>,
    flush_increment: usize,
    rebalance_pending: AtomicBool,
    /// Serializes the rebalance trigger across concurrent write plans
    rebalance_gate: tokio::sync::Mutex<()>,
    fragment_split_per_engine: usize,
}

impl PlanSplitter {
    pub fn new(
        manager: Arc<MetaManager>,
        generator: Arc<dyn FragmentGenerator>,
        config: &ClusterConfig,
    ) -> Self {
        Self {
            manager,
            generator,
            prefix: DashMap::new(),
            flush_state: RwLock::new(FlushState {
                threshold: config.prefix_flush_threshold,
                first_flush_done: false,
            }),
            flush_increment: config.prefix_flush_threshold,
            rebalance_pending: AtomicBool::new(false),
            rebalance_gate: tokio::sync::Mutex::new(()),
            fragment_split_per_engine: config.fragment_split_per_engine,
        }
    }

    /// Record the plan's paths into the prefix-frequency table, flushing it
    /// to the metadata layer once the configured size is reached. The first
    /// flush arms the rebalance flag.
    fn update_prefix(&self, plan: &Plan) {
        {
            let mut state = self.flush_state.write();
            if state.threshold <= self.prefix.len() {
                let snapshot: HashMap<String, f64> = self
                    .prefix
                    .iter()
                    .map(|entry| (entry.key().clone(), *entry.value()))
                    .collect();
                info!(size = snapshot.len(), "flushing prefix statistics");
                self.manager.update_prefix(snapshot);
                state.threshold += self.flush_increment;
                if !state.first_flush_done {
                    state.first_flush_done = true;
                    self.rebalance_pending.store(true, Ordering::SeqCst);
                }
            }
        }
        if plan.paths.is_empty() {
            return;
        }
        let weight = 1.0 / plan.paths.len() as f64;
        for path in &plan.paths {
            *self.prefix.entry(path.clone()).or_insert(0.0) += weight;
        }
    }

    /// Storage engines addressed by a show-columns plan: all of them.
    pub fn get_split_show_columns_results(&self) -> Vec<u64> {
        self.manager
            .get_storage_engine_list()
            .into_iter()
            .map(|e| e.id)
            .collect()
    }

    /// Split a plan into execution targets.
    pub async fn split(&self, plan: &Plan) -> Vec<SplitInfo> {
        match plan.kind {
            PlanKind::InsertRows
            | PlanKind::InsertNonAlignedRows
            | PlanKind::InsertColumns
            | PlanKind::InsertNonAlignedColumns
            | PlanKind::DeleteData => self.split_time_bounded_plan(plan).await,
            PlanKind::DeleteColumns => self.split_delete_columns_plan(plan),
            PlanKind::Query | PlanKind::ValueFilterQuery => self.split_time_bounded_plan(plan).await,
            PlanKind::Aggregate(AggregateKind::First) | PlanKind::Aggregate(AggregateKind::Last) => {
                self.split_per_path_plan(plan)
            }
            PlanKind::Aggregate(_) => self.split_time_bounded_plan(plan).await,
            PlanKind::Downsample(kind) => self.split_downsample_plan(plan, kind),
            PlanKind::ShowColumns => Vec::new(),
        }
    }

    /// Shared path for plans addressed by series range and time interval.
    /// Insert plans additionally bootstrap the initial fragment layout when
    /// the region is empty, and trigger the armed rebalance otherwise.
    async fn split_time_bounded_plan(&self, plan: &Plan) -> Vec<SplitInfo> {
        self.update_prefix(plan);
        let range = plan.ts_range();
        let mut fragment_map = self
            .manager
            .get_fragment_map_by_ts_range_and_time_interval(&range, &plan.time_interval);

        if plan.kind.is_insert() {
            if fragment_map.is_empty() {
                self.rebalance_pending.store(false, Ordering::SeqCst);
                let (units, fragments) = self
                    .generator
                    .generate_initial(&plan.paths, &plan.time_interval);
                if units.is_empty() {
                    warn!("no storage engines available, cannot bootstrap fragments");
                    return Vec::new();
                }
                self.manager
                    .create_initial_fragments_and_storage_units(units, fragments)
                    .await;
                fragment_map = self
                    .manager
                    .get_fragment_map_by_ts_range_and_time_interval(&range, &plan.time_interval);
            } else if self.rebalance_pending.load(Ordering::SeqCst) {
                let _gate = self.rebalance_gate.lock().await;
                if self.rebalance_pending.load(Ordering::SeqCst) {
                    let target =
                        self.fragment_split_per_engine * self.manager.get_storage_engine_num();
                    info!(target, "triggering fragment reallocation");
                    if !self.manager.reallocate(target, plan.time_interval.end).await {
                        warn!("fragment reallocation declined");
                    }
                    self.rebalance_pending.store(false, Ordering::SeqCst);
                }
            }
        }

        let is_query = !plan.kind.is_write();
        let mut result = Vec::new();
        for (ts_interval, fragments) in fragment_map {
            for fragment in fragments {
                for unit in self.select_storage_unit_list(&fragment, is_query) {
                    result.push(SplitInfo {
                        time_interval: fragment.time_interval,
                        ts_interval: ts_interval.clone(),
                        storage_unit: unit,
                        kind: plan.kind,
                        combine_group: None,
                    });
                }
            }
        }
        result
    }

    /// Delete-columns mutates schema everywhere the series ever lived: the
    /// lookup ignores time and the emitted slices cover all of it.
    fn split_delete_columns_plan(&self, plan: &Plan) -> Vec<SplitInfo> {
        self.update_prefix(plan);
        let range = plan.ts_range();
        let mut result = Vec::new();
        for (ts_interval, fragments) in self.manager.get_fragment_map_by_ts_range(&range) {
            for fragment in fragments {
                for unit in self.select_storage_unit_list(&fragment, false) {
                    result.push(SplitInfo {
                        time_interval: TimeInterval::new(0, i64::MAX),
                        ts_interval: ts_interval.clone(),
                        storage_unit: unit,
                        kind: plan.kind,
                        combine_group: None,
                    });
                }
            }
        }
        result
    }

    /// First/last aggregates look each path up on its own so the execution
    /// layer can short-circuit per series.
    fn split_per_path_plan(&self, plan: &Plan) -> Vec<SplitInfo> {
        self.update_prefix(plan);
        let mut result = Vec::new();
        for path in &plan.paths {
            let fragments = self
                .manager
                .get_fragment_list_by_series_name_and_time_interval(path, &plan.time_interval);
            for fragment in fragments {
                for unit in self.select_storage_unit_list(&fragment, true) {
                    result.push(SplitInfo {
                        time_interval: fragment.time_interval,
                        ts_interval: TimeSeriesInterval::new(
                            Some(path.clone()),
                            Some(path.clone()),
                        ),
                        storage_unit: unit,
                        kind: plan.kind,
                        combine_group: None,
                    });
                }
            }
        }
        result
    }

    /// Downsampled aggregates: slice the addressed time range along
    /// fragment boundaries and precision windows, tagging every slice with
    /// its combine group. Whole precision windows keep the downsample plan
    /// kind; sub-precision slices degrade to the plain aggregate.
    fn split_downsample_plan(&self, plan: &Plan, kind: AggregateKind) -> Vec<SplitInfo> {
        self.update_prefix(plan);
        let Some(precision) = plan.precision.filter(|p| *p > 0) else {
            error!("downsample plan without a positive precision");
            return Vec::new();
        };
        let range = plan.ts_range();
        let fragment_map = self
            .manager
            .get_fragment_map_by_ts_range_and_time_interval(&range, &plan.time_interval);

        // Group fragments by start time; fragments sharing a start time
        // share their time interval, so the first of each group stands for
        // the group's bounds.
        let mut groups: BTreeMap<i64, Vec<FragmentMeta>> = BTreeMap::new();
        for (_, fragments) in fragment_map {
            for fragment in fragments {
                groups
                    .entry(fragment.time_interval.start)
                    .or_default()
                    .push(fragment);
            }
        }
        let group_intervals: Vec<TimeInterval> =
            groups.values().map(|g| g[0].time_interval).collect();
        let slices = split_downsample_intervals(
            &group_intervals,
            plan.time_interval.start,
            plan.time_interval.end,
            precision,
        );
        let shards = assign_combine_groups(&slices, precision);

        let mut result = Vec::new();
        let mut next_shard = 0;
        for fragments in groups.values() {
            let group_end = fragments[0].time_interval.end;
            while next_shard < shards.len()
                && shards[next_shard].time_interval.end <= group_end
            {
                let shard = shards[next_shard];
                next_shard += 1;
                let shard_kind = if shard.whole_group {
                    PlanKind::Downsample(kind)
                } else {
                    PlanKind::Aggregate(kind)
                };
                for fragment in fragments {
                    for unit in self.select_storage_unit_list(fragment, true) {
                        result.push(SplitInfo {
                            time_interval: shard.time_interval,
                            ts_interval: fragment.ts_interval.clone(),
                            storage_unit: unit,
                            kind: shard_kind,
                            combine_group: Some(shard.combine_group),
                        });
                    }
                }
            }
        }
        result
    }

    /// Replica set to address for one fragment: the master for queries, the
    /// master plus every replica for writes.
    pub fn select_storage_unit_list(
        &self,
        fragment: &FragmentMeta,
        is_query: bool,
    ) -> Vec<StorageUnitMeta> {
        let Some(master) = self
            .manager
            .get_storage_unit(&fragment.master_storage_unit_id)
        else {
            warn!(
                master_storage_unit_id = %fragment.master_storage_unit_id,
                "fragment's master storage unit is absent from the cache"
            );
            return Vec::new();
        };
        let mut units = Vec::with_capacity(1 + master.replicas.len());
        if !is_query {
            for replica_id in &master.replicas {
                match self.manager.get_storage_unit(replica_id) {
                    Some(replica) => units.push(replica),
                    None => warn!(%replica_id, "replica absent from the cache"),
                }
            }
        }
        units.insert(0, master);
        units
    }
}
