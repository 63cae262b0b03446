use nymph_model::{ClassRegistry, Entity, EntityHandler, EntityRef, Guid, Query};
use nymph_store::{
    MutationKind, Nymph, QueryOutput, SqliteConfig, SqliteDriver, StoreError, StoreEvent,
};
use serde_json::json;
use std::sync::Arc;

struct UniqueEmail;

impl EntityHandler for UniqueEmail {
    fn validate(&self, entity: &Entity) -> Result<(), String> {
        match entity.get("name") {
            Some(v) if v.is_string() => Ok(()),
            _ => Err("name is required".into()),
        }
    }

    fn uniques(&self, entity: &Entity) -> Vec<String> {
        entity
            .get_str("email")
            .map(|email| vec![format!("email:{email}")])
            .unwrap_or_default()
    }
}

fn classes() -> ClassRegistry {
    let mut classes = ClassRegistry::new();
    classes.register("Employee", "Employee").unwrap();
    classes
        .register_with_handler("User", "User", Arc::new(UniqueEmail))
        .unwrap();
    classes
}

fn store() -> Nymph {
    Nymph::new(Arc::new(SqliteDriver::open_in_memory().unwrap()), classes())
}

fn employee(name: &str, salary: i64) -> Entity {
    let mut e = Entity::new("Employee");
    e.set("name", name).unwrap();
    e.set("salary", salary).unwrap();
    e
}

fn q(text: &str) -> Query {
    Query::parse(text).unwrap()
}

async fn names(nymph: &Nymph, text: &str) -> Vec<String> {
    nymph
        .get_entities(&q(text))
        .await
        .unwrap()
        .into_entities()
        .unwrap()
        .iter()
        .map(|e| e.get_str("name").unwrap_or_default().to_string())
        .collect()
}

// ── Save and load ────────────────────────────────────────────────

#[tokio::test]
async fn save_assigns_guid_and_dates() {
    let nymph = store();
    let mut jane = employee("Jane Doe", 50000);
    jane.add_tag("staff").unwrap();
    assert!(jane.is_dirty());

    assert!(nymph.save(&mut jane).await.unwrap());
    assert!(jane.guid().is_some());
    assert_eq!(jane.cdate(), jane.mdate());
    assert!(!jane.is_dirty());

    let loaded = nymph
        .get_entity_by_guid("Employee", jane.guid().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.get_str("name"), Some("Jane Doe"));
    assert_eq!(loaded.get_f64("salary"), Some(50000.0));
    assert!(loaded.has_tag("staff"));
    assert_eq!(loaded.cdate(), jane.cdate());
}

#[tokio::test]
async fn query_before_any_write_creates_tables() {
    let nymph = store();
    let out = nymph.get_entities(&q(r#"[{"class":"Employee"}]"#)).await.unwrap();
    assert_eq!(out, QueryOutput::Entities(vec![]));
    let count = nymph
        .get_entities(&q(r#"[{"class":"Employee","return":"count"}]"#))
        .await
        .unwrap();
    assert_eq!(count, QueryOutput::Count(0));
}

#[tokio::test]
async fn return_kinds() {
    let nymph = store();
    let mut a = employee("A", 1);
    let mut b = employee("B", 2);
    nymph.save(&mut a).await.unwrap();
    nymph.save(&mut b).await.unwrap();

    let guids = nymph
        .get_entities(&q(r#"[{"class":"Employee","return":"guid","sort":"salary","reverse":true}]"#))
        .await
        .unwrap();
    assert_eq!(guids, QueryOutput::Guids(vec![b.guid().unwrap(), a.guid().unwrap()]));

    let count = nymph
        .get_entities(&q(r#"[{"class":"Employee","return":"count"},{"type":"&","gt":["salary",1]}]"#))
        .await
        .unwrap();
    assert_eq!(count, QueryOutput::Count(1));

    let paged = nymph
        .get_entities(&q(r#"[{"class":"Employee","return":"count","offset":1}]"#))
        .await
        .unwrap();
    assert_eq!(paged, QueryOutput::Count(1));
}

#[tokio::test]
async fn entities_with_no_properties_still_load() {
    let nymph = store();
    let mut bare = Entity::new("Employee");
    bare.add_tag("empty").unwrap();
    nymph.save(&mut bare).await.unwrap();
    let loaded = nymph
        .get_entity(&q(r#"[{"class":"Employee"},{"type":"&","tag":"empty"}]"#))
        .await
        .unwrap()
        .unwrap();
    assert!(loaded.data().is_empty());
    assert_eq!(loaded.guid(), bare.guid());
}

#[tokio::test]
async fn paging_counts_entities_not_property_rows() {
    let nymph = store();
    for i in 0..5 {
        let mut e = employee(&format!("E{i}"), i);
        e.set("extra", json!({"i": i})).unwrap();
        nymph.save(&mut e).await.unwrap();
    }
    let page = names(&nymph, r#"[{"class":"Employee","sort":"salary","limit":2,"offset":1}]"#).await;
    assert_eq!(page, vec!["E1", "E2"]);
    let loaded = nymph
        .get_entities(&q(r#"[{"class":"Employee","sort":"salary","limit":2}]"#))
        .await
        .unwrap()
        .into_entities()
        .unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded[0].data().len(), 3);
}

// ── Updates and concurrency ──────────────────────────────────────

#[tokio::test]
async fn update_bumps_mdate_and_keeps_cdate() {
    let nymph = store();
    let mut jane = employee("Jane Doe", 50000);
    nymph.save(&mut jane).await.unwrap();
    let (cdate, mdate) = (jane.cdate(), jane.mdate());

    jane.set("salary", 60000).unwrap();
    jane.unset("name");
    assert!(nymph.save(&mut jane).await.unwrap());
    assert_eq!(jane.cdate(), cdate);
    assert!(jane.mdate() > mdate);

    let loaded = nymph
        .get_entity_by_guid("Employee", jane.guid().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.get_f64("salary"), Some(60000.0));
    assert!(!loaded.has("name"));
    assert_eq!(loaded.mdate(), jane.mdate());
}

#[tokio::test]
async fn stale_save_returns_false_and_changes_nothing() {
    let nymph = store();
    let mut original = employee("Jane Doe", 50000);
    nymph.save(&mut original).await.unwrap();

    let guid = original.guid().unwrap();
    let mut first = nymph.get_entity_by_guid("Employee", guid).await.unwrap().unwrap();
    let mut second = nymph.get_entity_by_guid("Employee", guid).await.unwrap().unwrap();

    first.set("salary", 1).unwrap();
    assert!(nymph.save(&mut first).await.unwrap());

    second.set("salary", 2).unwrap();
    assert!(!nymph.save(&mut second).await.unwrap());
    assert!(second.is_dirty());

    let stored = nymph.get_entity_by_guid("Employee", guid).await.unwrap().unwrap();
    assert_eq!(stored.get_f64("salary"), Some(1.0));
    assert!(!nymph.in_transaction().await);
}

// ── Class handlers ───────────────────────────────────────────────

fn user(name: &str, email: &str) -> Entity {
    let mut u = Entity::new("User");
    u.set("name", name).unwrap();
    u.set("email", email).unwrap();
    u
}

#[tokio::test]
async fn unique_values_are_enforced() {
    let nymph = store();
    let mut a = user("a", "same@example.com");
    nymph.save(&mut a).await.unwrap();

    let mut b = user("b", "same@example.com");
    match nymph.save(&mut b).await {
        Err(StoreError::EntityUniqueConstraint { etype, unique }) => {
            assert_eq!(etype, "User");
            assert_eq!(unique, "email:same@example.com");
        }
        other => panic!("expected unique violation, got {other:?}"),
    }
    assert!(b.guid().is_none());
    assert!(!nymph.in_transaction().await);
    let count = nymph
        .get_entities(&q(r#"[{"class":"User","return":"count"}]"#))
        .await
        .unwrap();
    assert_eq!(count, QueryOutput::Count(1));

    // Moving `a` to a new address frees the old one.
    a.set("email", "new@example.com").unwrap();
    assert!(nymph.save(&mut a).await.unwrap());
    assert!(nymph.save(&mut b).await.unwrap());
}

#[tokio::test]
async fn failed_validation_is_invalid_parameters() {
    let nymph = store();
    let mut nameless = Entity::new("User");
    assert!(matches!(
        nymph.save(&mut nameless).await,
        Err(StoreError::InvalidParameters(_))
    ));
}

#[tokio::test]
async fn unknown_class_is_rejected() {
    let nymph = store();
    let mut e = Entity::new("Nope");
    assert!(matches!(
        nymph.save(&mut e).await,
        Err(StoreError::Model(nymph_model::Error::UnknownClass(_)))
    ));
}

// ── References ───────────────────────────────────────────────────

#[tokio::test]
async fn references_are_queryable_and_resolvable() {
    let nymph = store();
    let mut boss = employee("Boss", 100);
    nymph.save(&mut boss).await.unwrap();
    let mut worker = employee("Worker", 10);
    worker.set_reference("manager", &boss).unwrap();
    nymph.save(&mut worker).await.unwrap();

    let by_ref = names(
        &nymph,
        &format!(r#"[{{"class":"Employee"}},{{"type":"&","ref":["manager","{}"]}}]"#, boss.guid().unwrap()),
    )
    .await;
    assert_eq!(by_ref, vec!["Worker"]);

    let by_qref = names(
        &nymph,
        r#"[{"class":"Employee"},{"type":"&","qref":["manager",[{"class":"Employee"},{"type":"&","gt":["salary",50]}]]}]"#,
    )
    .await;
    assert_eq!(by_qref, vec!["Worker"]);

    let handle = worker.reference_of("manager").unwrap();
    assert!(!handle.is_loaded());
    let resolved = nymph.resolve(&handle).await.unwrap();
    assert_eq!(resolved.get_str("name"), Some("Boss"));
    let again = nymph.resolve(&handle).await.unwrap();
    assert!(Arc::ptr_eq(&resolved, &again));
}

#[tokio::test]
async fn resolving_a_missing_entity_is_not_found() {
    let nymph = store();
    let dangling = EntityRef::Unresolved(nymph_model::Reference::new(Guid::new(), "Employee"));
    assert!(matches!(nymph.resolve(&dangling).await, Err(StoreError::NotFound(_))));
}

#[tokio::test]
async fn delete_removes_entity_and_side_rows() {
    let nymph = store();
    let mut boss = employee("Boss", 100);
    nymph.save(&mut boss).await.unwrap();
    let mut worker = employee("Worker", 10);
    worker.set_reference("manager", &boss).unwrap();
    nymph.save(&mut worker).await.unwrap();

    assert!(nymph.delete(&mut worker).await.unwrap());
    assert!(worker.guid().is_none());
    let refs = names(
        &nymph,
        &format!(r#"[{{"class":"Employee"}},{{"type":"&","ref":["manager","{}"]}}]"#, boss.guid().unwrap()),
    )
    .await;
    assert!(refs.is_empty());
    assert!(!nymph.delete_by_guid("Employee", Guid::new()).await.unwrap());
}

// ── Transactions ─────────────────────────────────────────────────

#[tokio::test]
async fn rollback_discards_writes() {
    let nymph = store();
    let tx = nymph.start_transaction("outer").await.unwrap();
    assert!(nymph.in_transaction().await);
    let mut e = employee("Temp", 1);
    tx.save(&mut e).await.unwrap();
    assert_eq!(names(&tx, r#"[{"class":"Employee"}]"#).await, vec!["Temp"]);
    tx.rollback("outer").await.unwrap();
    assert!(!nymph.in_transaction().await);
    assert!(names(&nymph, r#"[{"class":"Employee"}]"#).await.is_empty());
}

#[tokio::test]
async fn nested_savepoints() {
    let nymph = store();
    let outer = nymph.start_transaction("outer").await.unwrap();
    let mut kept = employee("Kept", 1);
    outer.save(&mut kept).await.unwrap();

    let inner = outer.start_transaction("inner").await.unwrap();
    let mut dropped = employee("Dropped", 2);
    inner.save(&mut dropped).await.unwrap();
    inner.rollback("inner").await.unwrap();
    assert!(nymph.in_transaction().await);

    outer.commit("outer").await.unwrap();
    assert!(!nymph.in_transaction().await);
    assert_eq!(names(&nymph, r#"[{"class":"Employee"}]"#).await, vec!["Kept"]);
}

#[tokio::test]
async fn committing_outer_level_commits_open_nested_one() {
    let nymph = store();
    let outer = nymph.start_transaction("outer").await.unwrap();
    let inner = outer.start_transaction("inner").await.unwrap();
    inner.save(&mut employee("Nested", 1)).await.unwrap();
    assert!(matches!(
        outer.save(&mut employee("Outer", 1)).await,
        Err(StoreError::InvalidParameters(_))
    ));

    outer.commit("outer").await.unwrap();
    assert!(!nymph.in_transaction().await);
    assert_eq!(names(&nymph, r#"[{"class":"Employee"}]"#).await, vec!["Nested"]);
    assert!(matches!(
        inner.rollback("inner").await,
        Err(StoreError::InvalidParameters(_))
    ));
}

#[tokio::test]
async fn plain_handle_is_kept_out_of_open_transaction() {
    let nymph = store().with_lock_timeout(std::time::Duration::from_millis(20));
    let tx = nymph.start_transaction("work").await.unwrap();
    tx.save(&mut employee("Inside", 1)).await.unwrap();
    assert!(matches!(
        nymph.save(&mut employee("Outside", 1)).await,
        Err(StoreError::Busy(_))
    ));
    assert!(matches!(
        nymph.start_transaction("other").await,
        Err(StoreError::Busy(_))
    ));
    tx.rollback("work").await.unwrap();
    assert!(names(&nymph, r#"[{"class":"Employee"}]"#).await.is_empty());
}

#[tokio::test]
async fn transaction_names_are_checked() {
    let nymph = store();
    assert!(matches!(
        nymph.start_transaction("").await,
        Err(StoreError::InvalidParameters(_))
    ));
    let tx = nymph.start_transaction("work").await.unwrap();
    assert!(matches!(tx.commit("other").await, Err(StoreError::InvalidParameters(_))));
    assert!(matches!(nymph.commit("work").await, Err(StoreError::InvalidParameters(_))));
    assert_eq!(tx.transaction_name(), Some("work"));
    tx.commit("work").await.unwrap();
}

// ── Events ───────────────────────────────────────────────────────

#[tokio::test]
async fn writes_and_transactions_emit_events() {
    let nymph = store();
    let mut events = nymph.events();

    let mut e = employee("Jane", 1);
    nymph.save(&mut e).await.unwrap();
    e.set("salary", 2).unwrap();
    nymph.save(&mut e).await.unwrap();
    let tx = nymph.start_transaction("t").await.unwrap();
    tx.delete(&mut e).await.unwrap();
    tx.commit("t").await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(match event {
            StoreEvent::Mutation { instance, mutation } => {
                let expected = if mutation.kind == MutationKind::Delete {
                    tx.instance_id()
                } else {
                    nymph.instance_id()
                };
                assert_eq!(instance, expected);
                format!("{:?}", mutation.kind)
            }
            StoreEvent::TransactionStarted { parent, .. } => {
                assert_eq!(parent, nymph.instance_id());
                "Started".to_string()
            }
            StoreEvent::TransactionCommitted { .. } => "Committed".to_string(),
            StoreEvent::TransactionRolledBack { .. } => "RolledBack".to_string(),
        });
    }
    assert_eq!(kinds, vec!["Create", "Update", "Started", "Delete", "Committed"]);
}

#[tokio::test]
async fn stale_save_emits_nothing() {
    let nymph = store();
    let mut e = employee("Jane", 1);
    nymph.save(&mut e).await.unwrap();
    let mut stale = e.clone();
    e.set("salary", 2).unwrap();
    nymph.save(&mut e).await.unwrap();

    let mut events = nymph.events();
    stale.set("salary", 3).unwrap();
    assert!(!nymph.save(&mut stale).await.unwrap());
    assert!(events.try_recv().is_err());
}

// ── Configuration ────────────────────────────────────────────────

#[tokio::test]
async fn file_database_persists() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nymph.db");
    let config = SqliteConfig::new(path.to_string_lossy()).with_prefix("test_");

    let guid = {
        let nymph = Nymph::new(Arc::new(SqliteDriver::connect(config.clone()).unwrap()), classes());
        let mut e = employee("Persisted", 7);
        nymph.save(&mut e).await.unwrap();
        e.guid().unwrap()
    };

    let nymph = Nymph::new(Arc::new(SqliteDriver::connect(config).unwrap()), classes());
    let loaded = nymph.get_entity_by_guid("Employee", guid).await.unwrap().unwrap();
    assert_eq!(loaded.get_str("name"), Some("Persisted"));
}

#[test]
fn placeholder_config_is_not_configured() {
    assert!(matches!(
        SqliteDriver::connect(SqliteConfig::default()),
        Err(StoreError::NotConfigured(_))
    ));
}

#[test]
fn unreachable_file_is_unable_to_connect() {
    let config = SqliteConfig::new("/nonexistent-nymph-dir/sub/nymph.db");
    assert!(matches!(
        SqliteDriver::connect(config),
        Err(StoreError::UnableToConnect(_))
    ));
}

#[test]
fn config_deserialises_with_defaults() {
    let config: SqliteConfig = serde_json::from_value(json!({"filename": "x.db"})).unwrap();
    assert_eq!(config.prefix, "nymph_");
    assert!(!config.is_placeholder());
}
