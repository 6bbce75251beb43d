//! Integration tests for single-node manager bootstrap and the
//! schema-mapping / user surfaces, against the file backend.

use chronomesh::config::ClusterConfig;
use chronomesh::metadata::{AuthType, FileMetaStore, MetaManager, MetaStore, UserKind};
use std::collections::HashSet;

fn file_config(dir: &tempfile::TempDir) -> ClusterConfig {
    ClusterConfig {
        meta_storage: "file".to_string(),
        meta_storage_path: dir.path().join("meta.json"),
        ..Default::default()
    }
}

/// Single-node bootstrap with no storage engines configured.
#[tokio::test]
async fn single_node_bootstrap_without_engines() {
    let dir = tempfile::tempdir().unwrap();
    let manager = MetaManager::new(file_config(&dir)).await.unwrap();

    assert_eq!(manager.get_storage_engine_num(), 0);
    assert!(manager.select_storage_engine_id_list().is_empty());
    assert!(!manager.has_fragment());
    assert!(!manager.has_storage_unit());
    assert_eq!(manager.get_node_list().len(), 1);
    assert_eq!(manager.get_node_list()[0].id, manager.get_node_id());
}

#[tokio::test]
async fn static_engine_list_loaded_at_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        storage_engine_list: "127.0.0.1#8086#influxdb,127.0.0.1#8087#parquet".to_string(),
        ..file_config(&dir)
    };
    let manager = MetaManager::new(config).await.unwrap();

    assert_eq!(manager.get_storage_engine_num(), 2);
    // replica_num = 1, so a selection covers both engines.
    assert_eq!(manager.select_storage_engine_id_list().len(), 2);
}

/// Removing a schema-mapping item with the −1 sentinel leaves the mapping
/// persisted without the key.
#[tokio::test]
async fn schema_mapping_item_removal() {
    let dir = tempfile::tempdir().unwrap();
    let manager = MetaManager::new(file_config(&dir)).await.unwrap();

    assert!(manager.add_or_update_schema_mapping_item("s", "k", 42).await);
    assert_eq!(manager.get_schema_mapping_item("s", "k"), 42);

    assert!(manager.add_or_update_schema_mapping_item("s", "k", -1).await);
    assert_eq!(manager.get_schema_mapping_item("s", "k"), -1);

    // The store holds the mapping without the removed key.
    let store = FileMetaStore::open(dir.path().join("meta.json")).unwrap();
    let mappings = store.load_schema_mappings().await.unwrap();
    let mapping = mappings.get("s").expect("mapping persisted");
    assert!(!mapping.contains_key("k"));
}

#[tokio::test]
async fn schema_mapping_bulk_update_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let manager = MetaManager::new(file_config(&dir)).await.unwrap();

    let mapping = [("a".to_string(), 1), ("b".to_string(), 2)]
        .into_iter()
        .collect();
    assert!(manager.add_or_update_schema_mapping("s", Some(mapping)).await);
    assert_eq!(manager.get_schema_mapping_item("s", "b"), 2);

    assert!(manager.add_or_update_schema_mapping("s", None).await);
    assert!(manager.get_schema_mapping("s").is_none());
}

/// The administrator is materialized from configuration; updating with a
/// `None` password leaves the password unchanged while the auth set is
/// replaced.
#[tokio::test]
async fn administrator_update_replaces_auths_only() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        admin_username: "admin".to_string(),
        admin_password: "secret".to_string(),
        ..file_config(&dir)
    };
    let manager = MetaManager::new(config).await.unwrap();

    let admin = manager.get_user("admin").expect("admin seeded from config");
    assert_eq!(admin.kind, UserKind::Administrator);
    assert_eq!(admin.auths.len(), 4);

    let read_only: HashSet<AuthType> = [AuthType::Read].into_iter().collect();
    assert!(manager.update_user("admin", None, Some(read_only.clone())).await);

    let admin = manager.get_user("admin").unwrap();
    assert_eq!(admin.password, "secret");
    assert_eq!(admin.auths, read_only);
}

#[tokio::test]
async fn user_lifecycle_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = MetaManager::new(file_config(&dir)).await.unwrap();

    let user = chronomesh::metadata::UserMeta {
        username: "reader".to_string(),
        password: "pw".to_string(),
        kind: UserKind::Normal,
        auths: [AuthType::Read].into_iter().collect(),
    };
    assert!(manager.add_user(user).await);
    assert_eq!(manager.get_users().len(), 2);

    assert!(manager.remove_user("reader").await);
    assert!(manager.get_user("reader").is_none());

    // The seeded administrator survives across a restart.
    drop(manager);
    let manager = MetaManager::new(file_config(&dir)).await.unwrap();
    assert_eq!(manager.get_users().len(), 1);
    assert!(manager.get_user("root").is_some());
}

#[tokio::test]
async fn ids_are_node_seeded() {
    let dir = tempfile::tempdir().unwrap();
    let manager = MetaManager::new(file_config(&dir)).await.unwrap();
    let a = manager.generate_id();
    let b = manager.generate_id();
    assert!(b > a);
}
