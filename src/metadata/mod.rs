//! Cluster metadata model and coordination for chronomesh
//!
//! Tracks front-end nodes, storage engines, storage units (with
//! master/replica relationships) and time-series fragments, backed by a
//! pluggable strongly-consistent store.

mod cache;
mod dispatcher;
mod file;
mod manager;
mod memory;
mod store;

pub use cache::{MetaCache, SCHEMA_MAPPING_ABSENT};
pub use dispatcher::ChangeEvent;
pub use file::FileMetaStore;
pub use manager::{MetaManager, StorageEngineChangeHook};
pub use memory::{MemoryCoordinator, MemoryMetaStore};
pub use store::{MetaStore, MetaStoreObserver};

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Time range for fragments and plans, half-open `[start, end)`.
///
/// `end == i64::MAX` stands for an open-ended ("latest") interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    pub start: i64,
    pub end: i64,
}

impl TimeInterval {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// An interval starting at `start` with no upper bound.
    pub fn open_ended(start: i64) -> Self {
        Self {
            start,
            end: i64::MAX,
        }
    }

    pub fn span(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_open_ended(&self) -> bool {
        self.end == i64::MAX
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    pub fn is_intersect(&self, other: &TimeInterval) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Series-name range for fragments, half-open `[start, end)`.
///
/// `None` on either side means unbounded. The `Display` form is the stable
/// key under which backends file fragments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSeriesInterval {
    pub start: Option<String>,
    pub end: Option<String>,
}

impl TimeSeriesInterval {
    pub fn new(start: Option<String>, end: Option<String>) -> Self {
        Self { start, end }
    }

    /// The interval covering the whole series space.
    pub fn unbounded() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    pub fn is_intersect(&self, other: &TimeSeriesInterval) -> bool {
        let left = match (&self.start, &other.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        let right = match (&other.start, &self.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        left && right
    }

    pub fn contains_name(&self, name: &str) -> bool {
        let after_start = self.start.as_deref().map_or(true, |s| s <= name);
        let before_end = self.end.as_deref().map_or(true, |e| name < e);
        after_start && before_end
    }
}

impl fmt::Display for TimeSeriesInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.as_deref().unwrap_or(""),
            self.end.as_deref().unwrap_or("")
        )
    }
}

impl PartialOrd for TimeSeriesInterval {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSeriesInterval {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // None start sorts first (unbounded-left), None end sorts last.
        let start = match (&self.start, &other.start) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        };
        start.then_with(|| match (&self.end, &other.end) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (Some(_), None) => std::cmp::Ordering::Less,
            (Some(a), Some(b)) => a.cmp(b),
        })
    }
}

/// Query-side series range. Plans derive closed ranges (`[min_path,
/// max_path]`) from their path lists; fragment keys stay half-open, so the
/// two kinds are kept distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeSeriesRange {
    pub start: Option<String>,
    pub end: Option<String>,
    pub end_inclusive: bool,
}

impl TimeSeriesRange {
    pub fn new(start: Option<String>, end: Option<String>) -> Self {
        Self {
            start,
            end,
            end_inclusive: false,
        }
    }

    pub fn closed(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: Some(start.into()),
            end: Some(end.into()),
            end_inclusive: true,
        }
    }

    /// Derive the range addressed by a plan from its (unsorted) path list.
    pub fn from_paths(paths: &[String]) -> Self {
        let start = paths.iter().min().cloned();
        let end = paths.iter().max().cloned();
        Self {
            start,
            end,
            end_inclusive: true,
        }
    }

    pub fn overlaps(&self, interval: &TimeSeriesInterval) -> bool {
        let left = match (&self.start, &interval.end) {
            (Some(s), Some(e)) => s < e,
            _ => true,
        };
        let right = match (&interval.start, &self.end) {
            (Some(s), Some(e)) => {
                if self.end_inclusive {
                    s <= e
                } else {
                    s < e
                }
            }
            _ => true,
        };
        left && right
    }
}

/// A front-end node participating in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontEndMeta {
    /// Cluster-unique id assigned by the meta store at registration
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl FrontEndMeta {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            id: 0,
            host: host.into(),
            port,
        }
    }
}

/// Kind of physical storage engine backing the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    InfluxDb,
    Parquet,
    Unknown,
}

impl std::str::FromStr for EngineKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "influxdb" => EngineKind::InfluxDb,
            "parquet" => EngineKind::Parquet,
            _ => EngineKind::Unknown,
        })
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineKind::InfluxDb => "influxdb",
            EngineKind::Parquet => "parquet",
            EngineKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A physical storage engine instance.
///
/// Engines are created by operator command and never destroyed by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEngineMeta {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub kind: EngineKind,
    pub extra_params: HashMap<String, String>,
    /// Node that issued the creating command
    pub created_by: u64,
}

impl StorageEngineMeta {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        kind: EngineKind,
        extra_params: HashMap<String, String>,
        created_by: u64,
    ) -> Self {
        Self {
            id: 0,
            host: host.into(),
            port,
            kind,
            extra_params,
            created_by,
        }
    }
}

/// A logical storage slot inside a physical engine.
///
/// A unit whose `master_id` equals its own id is a master; other units are
/// replicas of that master. The replica list is a cache-maintained index
/// rebuilt from `master_id` pointers on load, never the persisted truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUnitMeta {
    pub id: String,
    pub storage_engine_id: u64,
    pub master_id: String,
    #[serde(skip)]
    pub replicas: Vec<String>,
    /// Set on units created by the one-shot cluster bootstrap
    pub initial: bool,
    pub created_by: u64,
}

impl StorageUnitMeta {
    pub fn new_master(id: impl Into<String>, storage_engine_id: u64) -> Self {
        let id = id.into();
        Self {
            master_id: id.clone(),
            id,
            storage_engine_id,
            replicas: Vec::new(),
            initial: false,
            created_by: 0,
        }
    }

    pub fn new_replica(
        id: impl Into<String>,
        storage_engine_id: u64,
        master_id: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            storage_engine_id,
            master_id: master_id.into(),
            replicas: Vec::new(),
            initial: false,
            created_by: 0,
        }
    }

    pub fn is_master(&self) -> bool {
        self.id == self.master_id
    }

    /// Copy of this unit under its store-assigned id, re-pointed at the
    /// given master. Used by the fake-id rewrite pass.
    pub fn renamed(&self, id: impl Into<String>, master_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            storage_engine_id: self.storage_engine_id,
            master_id: master_id.into(),
            replicas: Vec::new(),
            initial: self.initial,
            created_by: self.created_by,
        }
    }

    pub fn add_replica(&mut self, replica_id: impl Into<String>) {
        let replica_id = replica_id.into();
        if !self.replicas.contains(&replica_id) {
            self.replicas.push(replica_id);
        }
    }

    pub fn remove_replica(&mut self, replica_id: &str) {
        self.replicas.retain(|r| r != replica_id);
    }
}

/// A rectangle in (series, time) space assigned to one master storage unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentMeta {
    pub ts_interval: TimeSeriesInterval,
    pub time_interval: TimeInterval,
    /// Before the bootstrap rewrite this may hold a proposal-local fake id
    pub master_storage_unit_id: String,
    pub created_by: u64,
    pub updated_by: u64,
    /// Set on fragments created by the one-shot cluster bootstrap
    pub initial: bool,
}

impl FragmentMeta {
    pub fn new(
        ts_interval: TimeSeriesInterval,
        time_interval: TimeInterval,
        master_storage_unit_id: impl Into<String>,
    ) -> Self {
        Self {
            ts_interval,
            time_interval,
            master_storage_unit_id: master_storage_unit_id.into(),
            created_by: 0,
            updated_by: 0,
            initial: false,
        }
    }

    /// Closed copy of an open fragment, ending exactly where its successor
    /// starts.
    pub fn end_fragment(&self, end_time: i64) -> Self {
        let mut closed = self.clone();
        closed.time_interval = TimeInterval::new(self.time_interval.start, end_time);
        closed
    }
}

/// Kind of a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserKind {
    Administrator,
    Normal,
}

/// Capabilities grantable to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthType {
    Read,
    Write,
    Admin,
    Cluster,
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMeta {
    pub username: String,
    pub password: String,
    pub kind: UserKind,
    pub auths: HashSet<AuthType>,
}

impl UserMeta {
    /// The administrator materialized from configuration on bootstrap.
    pub fn administrator(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            kind: UserKind::Administrator,
            auths: [
                AuthType::Read,
                AuthType::Write,
                AuthType::Admin,
                AuthType::Cluster,
            ]
            .into_iter()
            .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_interval_overlap() {
        let a = TimeInterval::new(0, 10);
        let b = TimeInterval::new(9, 20);
        let c = TimeInterval::new(10, 20);
        assert!(a.is_intersect(&b));
        assert!(!a.is_intersect(&c));
        assert!(TimeInterval::open_ended(5).is_intersect(&a));
    }

    #[test]
    fn series_interval_overlap_respects_open_bounds() {
        let all = TimeSeriesInterval::unbounded();
        let mid = TimeSeriesInterval::new(Some("b".into()), Some("d".into()));
        let right = TimeSeriesInterval::new(Some("d".into()), None);
        assert!(all.is_intersect(&mid));
        assert!(mid.is_intersect(&all));
        assert!(!mid.is_intersect(&right));
        assert!(right.is_intersect(&all));
    }

    #[test]
    fn series_interval_contains_name_half_open() {
        let mid = TimeSeriesInterval::new(Some("b".into()), Some("d".into()));
        assert!(mid.contains_name("b"));
        assert!(mid.contains_name("c"));
        assert!(!mid.contains_name("d"));
        assert!(TimeSeriesInterval::unbounded().contains_name("anything"));
    }

    #[test]
    fn closed_range_reaches_interval_start() {
        // A closed plan range whose max path equals a fragment's start
        // series must still address that fragment.
        let range = TimeSeriesRange::closed("a", "d");
        let interval = TimeSeriesInterval::new(Some("d".into()), None);
        assert!(range.overlaps(&interval));
        let half_open = TimeSeriesRange::new(Some("a".into()), Some("d".into()));
        assert!(!half_open.overlaps(&interval));
    }

    #[test]
    fn series_interval_ordering_puts_unbounded_start_first() {
        let mut intervals = vec![
            TimeSeriesInterval::new(Some("m".into()), None),
            TimeSeriesInterval::new(None, Some("m".into())),
            TimeSeriesInterval::new(Some("a".into()), Some("m".into())),
        ];
        intervals.sort();
        assert_eq!(intervals[0].start, None);
        assert_eq!(intervals[1].start.as_deref(), Some("a"));
        assert_eq!(intervals[2].end, None);
    }

    #[test]
    fn storage_unit_master_detection() {
        let master = StorageUnitMeta::new_master("unit0000000001", 1);
        let replica = StorageUnitMeta::new_replica("unit0000000002", 2, "unit0000000001");
        assert!(master.is_master());
        assert!(!replica.is_master());
    }

    #[test]
    fn end_fragment_closes_at_successor_start() {
        let fragment = FragmentMeta::new(
            TimeSeriesInterval::unbounded(),
            TimeInterval::open_ended(0),
            "unit0000000001",
        );
        let closed = fragment.end_fragment(100);
        assert_eq!(closed.time_interval, TimeInterval::new(0, 100));
        assert!(!closed.time_interval.is_open_ended());
    }
}
