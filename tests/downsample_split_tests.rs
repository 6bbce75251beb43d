//! Plan splitter integration tests: write-path bootstrap, replica
//! selection parity, rebalance triggering, and the downsample splitter's
//! literal worked examples.

use chronomesh::config::ClusterConfig;
use chronomesh::metadata::{
    FragmentMeta, MemoryCoordinator, MetaManager, StorageUnitMeta, TimeInterval,
    TimeSeriesInterval,
};
use chronomesh::split::{
    AggregateKind, EvenFragmentGenerator, Plan, PlanKind, PlanSplitter, SplitInfo,
};
use std::sync::Arc;

async fn cluster(engines: usize, replica_num: usize) -> (Arc<MetaManager>, PlanSplitter) {
    cluster_with(engines, replica_num, 100).await
}

async fn cluster_with(
    engines: usize,
    replica_num: usize,
    prefix_flush_threshold: usize,
) -> (Arc<MetaManager>, PlanSplitter) {
    let engine_list = (0..engines)
        .map(|i| format!("127.0.0.1#{}#influxdb", 8086 + i))
        .collect::<Vec<_>>()
        .join(",");
    let config = ClusterConfig {
        meta_storage: "memory".to_string(),
        storage_engine_list: engine_list,
        replica_num,
        fragment_split_per_engine: 2,
        prefix_flush_threshold,
        ..Default::default()
    };
    let hub = MemoryCoordinator::new();
    let manager = MetaManager::with_store(config.clone(), hub.session())
        .await
        .unwrap();
    let generator = Arc::new(EvenFragmentGenerator::new(manager.clone()));
    let splitter = PlanSplitter::new(manager.clone(), generator, &config);
    (manager, splitter)
}

fn paths(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

/// A first write plan finds no fragments, synthesizes the initial layout,
/// and addresses master plus replicas.
#[tokio::test]
async fn first_write_bootstraps_initial_layout() {
    let (manager, splitter) = cluster(2, 1).await;
    assert!(!manager.has_fragment());

    let plan = Plan::insert_rows(
        paths(&["region.a.cpu", "region.b.cpu"]),
        TimeInterval::new(0, 100),
    );
    let infos = splitter.split(&plan).await;

    assert!(manager.has_fragment());
    assert!(!infos.is_empty());
    // Every emitted unit is the fragment master or one of its replicas.
    for info in &infos {
        let unit = &info.storage_unit;
        if !unit.is_master() {
            let master = manager.get_storage_unit(&unit.master_id).unwrap();
            assert!(master.replicas.contains(&unit.id));
        }
    }
    // With replica_num 1, each fragment is addressed at 2 units.
    let masters = infos.iter().filter(|i| i.storage_unit.is_master()).count();
    let replicas = infos.len() - masters;
    assert_eq!(masters, replicas);
}

/// Query plans address masters only; write plans address the full replica
/// set.
#[tokio::test]
async fn replica_selection_parity() {
    let (_manager, splitter) = cluster(2, 1).await;
    let series = paths(&["region.a.cpu", "region.b.cpu"]);

    let write = Plan::insert_rows(series.clone(), TimeInterval::new(0, 100));
    let write_infos = splitter.split(&write).await;
    assert!(write_infos.iter().any(|i| !i.storage_unit.is_master()));

    let query = Plan::query(series.clone(), TimeInterval::new(0, 100));
    let query_infos = splitter.split(&query).await;
    assert!(!query_infos.is_empty());
    assert!(query_infos.iter().all(|i| i.storage_unit.is_master()));

    let aggregate = Plan::aggregate(AggregateKind::Sum, series, TimeInterval::new(0, 100));
    let aggregate_infos = splitter.split(&aggregate).await;
    assert!(aggregate_infos.iter().all(|i| i.storage_unit.is_master()));
}

#[tokio::test]
async fn delete_columns_addresses_all_time_and_replicas() {
    let (_manager, splitter) = cluster(2, 1).await;
    let series = paths(&["region.a.cpu", "region.b.cpu"]);
    splitter
        .split(&Plan::insert_rows(series.clone(), TimeInterval::new(0, 100)))
        .await;

    let infos = splitter.split(&Plan::delete_columns(series)).await;
    assert!(!infos.is_empty());
    assert!(infos.iter().any(|i| !i.storage_unit.is_master()));
    assert!(infos
        .iter()
        .all(|i| i.time_interval == TimeInterval::new(0, i64::MAX)));
}

#[tokio::test]
async fn first_aggregate_splits_per_path() {
    let (_manager, splitter) = cluster(1, 0).await;
    let series = paths(&["region.a.cpu", "region.b.cpu"]);
    splitter
        .split(&Plan::insert_rows(series.clone(), TimeInterval::new(0, 100)))
        .await;

    let plan = Plan::aggregate(AggregateKind::First, series, TimeInterval::new(0, 100));
    let infos = splitter.split(&plan).await;
    assert_eq!(infos.len(), 2);
    for info in &infos {
        assert_eq!(info.ts_interval.start, info.ts_interval.end);
        assert!(info.storage_unit.is_master());
    }
}

fn shard_summary(infos: &[SplitInfo]) -> Vec<(i64, i64, u64, bool)> {
    infos
        .iter()
        .map(|info| {
            (
                info.time_interval.start,
                info.time_interval.end,
                info.combine_group.unwrap(),
                matches!(info.kind, PlanKind::Downsample(_)),
            )
        })
        .collect()
}

/// Worked example: one open fragment, begin 10, end 95, precision 20. The
/// first interval is exempt from prefix shards; four whole windows land in
/// their own combine groups and the suffix opens group 4.
#[tokio::test]
async fn downsample_split_single_fragment() {
    let (_manager, splitter) = cluster(1, 0).await;
    let series = paths(&["region.a.cpu"]);
    splitter
        .split(&Plan::insert_rows(series.clone(), TimeInterval::new(0, 100)))
        .await;

    let plan = Plan::downsample(AggregateKind::Avg, series, TimeInterval::new(10, 95), 20);
    let infos = splitter.split(&plan).await;

    assert_eq!(
        shard_summary(&infos),
        vec![
            (10, 30, 0, true),
            (30, 50, 1, true),
            (50, 70, 2, true),
            (70, 90, 3, true),
            (90, 95, 4, false),
        ]
    );
}

/// Worked example: fragments [0,50) and [50,∞), begin 0, end 100,
/// precision 30. The prefix shard at the fragment boundary completes the
/// straddling combine group.
#[tokio::test]
async fn downsample_split_across_fragment_boundary() {
    let (manager, splitter) = cluster(1, 0).await;
    let series = paths(&["region.a.cpu"]);
    splitter
        .split(&Plan::insert_rows(series.clone(), TimeInterval::new(0, 10)))
        .await;

    // Close the open fragment at 50 with a successor.
    let engines: Vec<u64> = manager
        .get_storage_engine_list()
        .into_iter()
        .map(|e| e.id)
        .collect();
    let units = vec![StorageUnitMeta::new_master("fresh0", engines[0])];
    let fragments = vec![FragmentMeta::new(
        TimeSeriesInterval::unbounded(),
        TimeInterval::open_ended(50),
        "fresh0",
    )];
    assert!(manager.create_fragments_and_storage_units(units, fragments).await);

    let plan = Plan::downsample(AggregateKind::Max, series, TimeInterval::new(0, 100), 30);
    let infos = splitter.split(&plan).await;

    assert_eq!(
        shard_summary(&infos),
        vec![
            (0, 30, 0, true),
            (30, 50, 1, false),
            (50, 60, 1, false),
            (60, 90, 2, true),
            (90, 100, 3, false),
        ]
    );

    // Coverage: the emitted shards tile [0, 100) with no gaps or overlaps.
    let mut expected_start = 0;
    for (start, end, _, _) in shard_summary(&infos) {
        assert_eq!(start, expected_start);
        assert!(end > start);
        expected_start = end;
    }
    assert_eq!(expected_start, 100);
}

/// The first prefix-table flush arms the rebalance flag; the next write
/// plan that observes an existing fragment map reallocates the open region
/// into `k · engines` fragments.
#[tokio::test]
async fn armed_rebalance_triggers_reallocation() {
    let (manager, splitter) = cluster_with(2, 1, 1).await;
    let series: Vec<String> = (0..8).map(|i| format!("region.host{i}.cpu")).collect();

    // First write bootstraps the layout (and fills the prefix table).
    splitter
        .split(&Plan::insert_rows(series.clone(), TimeInterval::new(0, 100)))
        .await;
    let before = manager.get_latest_fragment_map().len();

    // Second write flushes the table, arms the flag, and reallocates.
    splitter
        .split(&Plan::insert_rows(series, TimeInterval::new(100, 200)))
        .await;

    let latest = manager.get_latest_fragment_map();
    assert_eq!(latest.len(), 4, "k=2 × 2 engines, was {before}");
    assert!(latest.values().all(|f| f.time_interval.start == 200));
}
