//! Meta store trait
//!
//! Abstracts the strongly-consistent backend holding the durable copy of
//! cluster metadata. Backends provide per-entity register/load/subscribe
//! semantics plus two cluster-wide advisory locks; everything else about
//! their key layout is their own business.

use super::{
    FragmentMeta, FrontEndMeta, StorageEngineMeta, StorageUnitMeta, TimeSeriesInterval, UserMeta,
};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Observer for remote metadata changes.
///
/// Callbacks may be invoked from any task or thread the backend controls
/// and must not take any advisory lock held by the caller of the current
/// stack. Implementations are expected to do no more than hand the event
/// off (see [`MetaManager`](super::MetaManager)'s dispatch queue).
pub trait MetaStoreObserver: Send + Sync {
    /// A front-end joined (`Some`) or left (`None`) the cluster.
    fn node_changed(&self, id: u64, node: Option<FrontEndMeta>);

    /// A storage engine was registered. Engines are never removed.
    fn storage_engine_added(&self, engine: StorageEngineMeta);

    /// A storage unit was published or republished.
    fn storage_unit_changed(&self, id: String, unit: StorageUnitMeta);

    /// A fragment was added (`create == true`) or updated.
    fn fragment_changed(&self, create: bool, fragment: FragmentMeta);

    /// A schema mapping changed; `None` or empty means removal.
    fn schema_mapping_changed(&self, schema: String, mapping: Option<HashMap<String, i32>>);

    /// A user changed; `None` means removal.
    fn user_changed(&self, username: String, user: Option<UserMeta>);
}

/// Durable namespace for cluster metadata with advisory locks and change
/// notification.
///
/// Every method either succeeds or fails with a
/// [`MetaStoreError`](crate::MetaStoreError); callers treat failures
/// uniformly. Advisory locks are scoped to the session: crash release is
/// the coordination service's responsibility. The canonical acquisition
/// order is fragment before storage-unit, released in reverse.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Register this process as a front-end and return its cluster-unique id.
    async fn register_node(&self, node: FrontEndMeta) -> Result<u64>;

    async fn load_nodes(&self) -> Result<HashMap<u64, FrontEndMeta>>;

    /// Register a storage engine, returning its assigned id.
    async fn add_storage_engine(&self, engine: StorageEngineMeta) -> Result<u64>;

    /// Load all storage engines. When the store holds none, the statically
    /// configured `local` engines are persisted first and returned.
    async fn load_storage_engines(
        &self,
        local: Vec<StorageEngineMeta>,
    ) -> Result<HashMap<u64, StorageEngineMeta>>;

    /// Reserve a fresh cluster-unique storage unit id without publishing
    /// any content. Ids are monotonically generated.
    async fn add_storage_unit(&self) -> Result<String>;

    /// Publish a storage unit's content; observers are notified.
    async fn update_storage_unit(&self, unit: &StorageUnitMeta) -> Result<()>;

    async fn load_storage_units(&self) -> Result<HashMap<String, StorageUnitMeta>>;

    /// Publish a new fragment; observers see it as a creation.
    async fn add_fragment(&self, fragment: &FragmentMeta) -> Result<()>;

    /// Republish an existing fragment; observers see it as an update.
    async fn update_fragment(&self, fragment: &FragmentMeta) -> Result<()>;

    /// Load all fragments grouped by series interval; each list is sorted
    /// by start time ascending.
    async fn load_fragments(&self) -> Result<HashMap<TimeSeriesInterval, Vec<FragmentMeta>>>;

    /// Publish a schema mapping; `None` removes it.
    async fn update_schema_mapping(
        &self,
        schema: &str,
        mapping: Option<&HashMap<String, i32>>,
    ) -> Result<()>;

    async fn load_schema_mappings(&self) -> Result<HashMap<String, HashMap<String, i32>>>;

    async fn add_user(&self, user: &UserMeta) -> Result<()>;

    async fn update_user(&self, user: &UserMeta) -> Result<()>;

    async fn remove_user(&self, username: &str) -> Result<()>;

    /// Load all users. When the store holds none, `default_admin` is
    /// persisted first and returned.
    async fn load_users(&self, default_admin: UserMeta) -> Result<Vec<UserMeta>>;

    /// Acquire the cluster-wide fragment lock.
    async fn lock_fragment(&self) -> Result<()>;

    async fn release_fragment(&self) -> Result<()>;

    /// Acquire the cluster-wide storage-unit lock. Callers holding both
    /// locks must have taken the fragment lock first.
    async fn lock_storage_unit(&self) -> Result<()>;

    async fn release_storage_unit(&self) -> Result<()>;

    /// Install the observer receiving remote change events.
    fn subscribe(&self, observer: Arc<dyn MetaStoreObserver>);

    /// Tear the session down: held locks are released and the session's
    /// registered node is deregistered.
    async fn close(&self) -> Result<()>;
}
