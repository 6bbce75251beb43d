//! Initial fragment layout synthesis
//!
//! When a write plan addresses a region with no fragments at all, the
//! splitter asks a generator for the cluster's first fragment/storage-unit
//! proposal. Proposals use placeholder unit ids; the manager rewrites them
//! to store-assigned ids during bootstrap.

use crate::metadata::{
    FragmentMeta, MetaManager, StorageUnitMeta, TimeInterval, TimeSeriesInterval,
};
use std::sync::Arc;

/// Strategy producing the initial fragment layout for a fresh cluster.
pub trait FragmentGenerator: Send + Sync {
    /// Propose storage units and fragments covering the given paths. Both
    /// lists are empty when the cluster has no storage engines to place
    /// units on.
    fn generate_initial(
        &self,
        paths: &[String],
        time_interval: &TimeInterval,
    ) -> (Vec<StorageUnitMeta>, Vec<FragmentMeta>);
}

/// Default layout: one fragment per storage engine, series boundaries at
/// evenly spaced sorted paths, replicas placed by the manager's random
/// engine selection. Fragments start at time zero so the whole history of
/// every series is covered.
pub struct EvenFragmentGenerator {
    manager: Arc<MetaManager>,
}

impl EvenFragmentGenerator {
    pub fn new(manager: Arc<MetaManager>) -> Self {
        Self { manager }
    }
}

impl FragmentGenerator for EvenFragmentGenerator {
    fn generate_initial(
        &self,
        paths: &[String],
        _time_interval: &TimeInterval,
    ) -> (Vec<StorageUnitMeta>, Vec<FragmentMeta>) {
        let engine_num = self.manager.get_storage_engine_num();
        if engine_num == 0 {
            return (Vec::new(), Vec::new());
        }

        let mut sorted_paths: Vec<&String> = paths.iter().collect();
        sorted_paths.sort();
        sorted_paths.dedup();

        // n fragments need n-1 interior boundaries; fewer distinct paths
        // than engines just yields fewer fragments.
        let fragment_num = engine_num.min(sorted_paths.len().max(1));
        let mut bounds: Vec<Option<String>> = Vec::with_capacity(fragment_num + 1);
        bounds.push(None);
        for i in 1..fragment_num {
            let boundary = Some(sorted_paths[i * sorted_paths.len() / fragment_num].clone());
            if bounds.last() != Some(&boundary) {
                bounds.push(boundary);
            }
        }
        bounds.push(None);

        let mut units = Vec::new();
        let mut fragments = Vec::new();
        for window in 0..bounds.len() - 1 {
            let engines = self.manager.select_storage_engine_id_list();
            let Some((&master_engine, replica_engines)) = engines.split_first() else {
                return (Vec::new(), Vec::new());
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
                TimeInterval::open_ended(0),
                fake_master_id,
            ));
        }
        (units, fragments)
    }
}
