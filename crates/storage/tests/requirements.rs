#![forbid(unsafe_code)]

use cd_storage::{NewTask, RequirementKind, SqliteStore, StoreError};
use std::path::PathBuf;

fn temp_db(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let dir = base.join(format!("cd_storage_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir.join("cadence.db")
}

#[test]
fn upsert_is_idempotent_by_key() {
    let mut store = SqliteStore::open(temp_db("req_upsert")).expect("open store");

    let first = store
        .upsert_requirement("FR-1", "Login", "Users can log in", RequirementKind::Functional)
        .expect("insert");
    let second = store
        .upsert_requirement("FR-1", "Login", "Users can log in with SSO", RequirementKind::Functional)
        .expect("update");

    assert_eq!(first.id, second.id, "re-ingest keeps the id stable");
    assert_eq!(second.text, "Users can log in with SSO");

    let all = store.list_requirements(None).expect("list");
    assert_eq!(all.len(), 1);
}

#[test]
fn list_filters_by_kind_and_orders_by_key() {
    let mut store = SqliteStore::open(temp_db("req_filter")).expect("open store");
    store
        .upsert_requirement("NFR-1", "Latency", "p99 under 200ms", RequirementKind::NonFunctional)
        .expect("nfr");
    store
        .upsert_requirement("FR-2", "Logout", "Users can log out", RequirementKind::Functional)
        .expect("fr2");
    store
        .upsert_requirement("FR-1", "Login", "Users can log in", RequirementKind::Functional)
        .expect("fr1");

    let functional = store
        .list_requirements(Some(RequirementKind::Functional))
        .expect("list functional");
    let keys: Vec<&str> = functional.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, vec!["FR-1", "FR-2"]);
}

#[test]
fn links_resolve_through_the_join_table() {
    let mut store = SqliteStore::open(temp_db("req_links")).expect("open store");
    let task = store
        .create_task(NewTask {
            id: Some("T1".to_string()),
            title: "Auth".to_string(),
            ..NewTask::default()
        })
        .expect("create task")
        .id;
    store
        .upsert_requirement("FR-1", "Login", "Users can log in", RequirementKind::Functional)
        .expect("req");

    store
        .link_task_requirement(&task, "FR-1")
        .expect("link");
    // Linking twice is a no-op.
    store
        .link_task_requirement(&task, "FR-1")
        .expect("relink");

    let linked = store.requirements_for_task(&task).expect("linked");
    assert_eq!(linked.len(), 1);
    assert_eq!(linked[0].key, "FR-1");

    let err = store
        .link_task_requirement(&task, "FR-404")
        .expect_err("expected unknown requirement");
    assert!(matches!(err, StoreError::UnknownRequirement(_)));
}
