//! # chronomesh
//!
//! Cluster metadata coordination core for a distributed time-series
//! database front-end.
//!
//! chronomesh keeps the authoritative in-memory view of cluster topology —
//! front-end nodes, storage engines, storage units with master/replica
//! relationships, and time-series fragments — backed by a pluggable
//! strongly-consistent store.
//!
//! ## Architecture
//!
//! - **MetaStore**: backend-agnostic durable namespace with advisory locks
//!   and change notification (file and in-process backends included)
//! - **MetaCache**: thread-safe in-memory index with range lookups over
//!   series and time intervals
//! - **MetaManager**: bootstrap, topology lifecycle, and the cluster-wide
//!   fragment creation protocols
//! - **PlanSplitter**: maps logical plans onto (fragment, storage unit)
//!   targets, including the downsample time-interval splitter
//!
//! The core delegates all consensus and locking to the coordination
//! service behind `MetaStore`; it offers an eventually consistent cached
//! view with last-writer-wins on the backing store.

pub mod config;
pub mod ids;
pub mod metadata;
pub mod split;
pub mod telemetry;

mod error;

pub use error::{Error, MetaStoreError, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::config::ClusterConfig;
    pub use crate::metadata::{
        AuthType, EngineKind, FragmentMeta, FrontEndMeta, MetaCache, MetaManager, MetaStore,
        StorageEngineMeta, StorageUnitMeta, TimeInterval, TimeSeriesInterval, TimeSeriesRange,
        UserKind, UserMeta,
    };
    pub use crate::split::{
        AggregateKind, EvenFragmentGenerator, FragmentGenerator, Plan, PlanKind, PlanSplitter,
        SplitInfo,
    };
    pub use crate::{Error, Result};
}
