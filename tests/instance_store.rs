//! Integration tests for the SQLite instance store, running against
//! in-memory databases with the bundled migrations applied.

use chrono::{Duration as ChronoDuration, Utc};
use vigil::{
    models::{InstanceKey, PersistedInstance, RuleKey},
    persistence::{InstanceQuery, InstanceStore, SqliteInstanceStore},
};

async fn setup_store() -> SqliteInstanceStore {
    let store = SqliteInstanceStore::new("sqlite::memory:")
        .await
        .expect("Failed to set up in-memory database");
    store.run_migrations().await.expect("Failed to run migrations");
    store
}

fn row(org_id: i64, rule_uid: &str, fingerprint: u64, state: &str) -> PersistedInstance {
    let key = InstanceKey { org_id, rule_uid: rule_uid.to_string(), fingerprint };
    let now = Utc::now();
    PersistedInstance {
        org_id,
        rule_uid: rule_uid.to_string(),
        labels_hash: key.labels_hash(),
        labels: r#"{"instance":"node-1"}"#.to_string(),
        current_state: state.to_string(),
        current_reason: None,
        current_state_since: now,
        current_state_end: now,
        last_eval_time: now,
    }
}

#[tokio::test]
async fn save_and_list_round_trip() {
    let store = setup_store().await;

    store
        .save_instances(vec![row(1, "cpu", 1, "Normal"), row(1, "mem", 2, "Alerting")])
        .await
        .unwrap();

    let all = store
        .list_instances(InstanceQuery { org_id: 1, rule_uid: None })
        .await
        .unwrap();
    assert_eq!(all.len(), 2);

    let cpu_only = store
        .list_instances(InstanceQuery { org_id: 1, rule_uid: Some("cpu".to_string()) })
        .await
        .unwrap();
    assert_eq!(cpu_only.len(), 1);
    assert_eq!(cpu_only[0].rule_uid, "cpu");
    assert_eq!(cpu_only[0].current_state, "Normal");
    assert_eq!(cpu_only[0].labels, r#"{"instance":"node-1"}"#);
}

#[tokio::test]
async fn upsert_replaces_the_existing_row() {
    let store = setup_store().await;

    let mut first = row(1, "cpu", 7, "Pending");
    first.current_reason = None;
    store.save_instances(vec![first.clone()]).await.unwrap();

    let mut second = first.clone();
    second.current_state = "Alerting".to_string();
    second.current_reason = Some("Error".to_string());
    second.last_eval_time = first.last_eval_time + ChronoDuration::seconds(10);
    store.save_instances(vec![second]).await.unwrap();

    let rows = store
        .list_instances(InstanceQuery { org_id: 1, rule_uid: Some("cpu".to_string()) })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "same key must land on the same row");
    assert_eq!(rows[0].current_state, "Alerting");
    assert_eq!(rows[0].current_reason.as_deref(), Some("Error"));
    assert_eq!(rows[0].last_eval_time, first.last_eval_time + ChronoDuration::seconds(10));
}

#[tokio::test]
async fn delete_by_key_leaves_other_rows_intact() {
    let store = setup_store().await;
    store
        .save_instances(vec![row(1, "cpu", 1, "Normal"), row(1, "cpu", 2, "Alerting")])
        .await
        .unwrap();

    store
        .delete_instances(vec![InstanceKey { org_id: 1, rule_uid: "cpu".to_string(), fingerprint: 1 }])
        .await
        .unwrap();

    let rows = store
        .list_instances(InstanceQuery { org_id: 1, rule_uid: Some("cpu".to_string()) })
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].labels_hash, format!("{:016x}", 2u64));
}

#[tokio::test]
async fn delete_by_rule_removes_only_that_rule() {
    let store = setup_store().await;
    store
        .save_instances(vec![
            row(1, "cpu", 1, "Normal"),
            row(1, "cpu", 2, "Normal"),
            row(1, "mem", 3, "Normal"),
            row(2, "cpu", 4, "Normal"),
        ])
        .await
        .unwrap();

    store
        .delete_instances_by_rule(RuleKey { org_id: 1, rule_uid: "cpu".to_string() })
        .await
        .unwrap();

    let org1 = store
        .list_instances(InstanceQuery { org_id: 1, rule_uid: None })
        .await
        .unwrap();
    assert_eq!(org1.len(), 1);
    assert_eq!(org1[0].rule_uid, "mem");

    // The same rule UID under another org is untouched.
    let org2 = store
        .list_instances(InstanceQuery { org_id: 2, rule_uid: None })
        .await
        .unwrap();
    assert_eq!(org2.len(), 1);
}

#[tokio::test]
async fn fetch_org_ids_lists_each_org_once() {
    let store = setup_store().await;
    assert!(store.fetch_org_ids().await.unwrap().is_empty());

    store
        .save_instances(vec![
            row(1, "cpu", 1, "Normal"),
            row(1, "mem", 2, "Normal"),
            row(3, "cpu", 3, "Normal"),
        ])
        .await
        .unwrap();

    let mut ids = store.fetch_org_ids().await.unwrap();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn empty_batches_are_no_ops() {
    let store = setup_store().await;
    store.save_instances(vec![]).await.unwrap();
    store.delete_instances(vec![]).await.unwrap();
    assert!(store
        .list_instances(InstanceQuery { org_id: 1, rule_uid: None })
        .await
        .unwrap()
        .is_empty());
}
