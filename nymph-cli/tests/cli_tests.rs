use nymph_cli::{explain, parse_class_mapping, registry_for, run_query, DialectName};
use nymph_model::{ClassRegistry, Entity, Query, ReturnKind};
use nymph_store::{Nymph, SqliteConfig, SqliteDriver};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

// ── Arguments ────────────────────────────────────────────────────

#[test]
fn class_mappings() {
    assert_eq!(
        parse_class_mapping("Employee=staff_members").unwrap(),
        ("Employee".to_string(), "staff_members".to_string())
    );
    assert!(parse_class_mapping("Employee").is_err());
    assert!(parse_class_mapping("=etype").is_err());
}

#[test]
fn unmapped_classes_use_their_own_name() {
    let query = Query::parse(
        r#"[{"class":"Employee"},{"type":"&","qref":["group",[{"class":"Group"}]]}]"#,
    )
    .unwrap();
    let classes = registry_for(&query, &[("Employee".into(), "emp".into())]).unwrap();
    assert_eq!(classes.etype_of("Employee").unwrap(), "emp");
    assert_eq!(classes.etype_of("Group").unwrap(), "Group");

    let odd = Query::parse(r#"[{"class":"Not-An-Etype"}]"#).unwrap();
    assert!(registry_for(&odd, &[]).is_err());
}

// ── explain ──────────────────────────────────────────────────────

#[test]
fn explain_sqlite() {
    let plan = explain(
        r#"[{"class":"Employee","return":"count"},{"type":"&","tag":"staff"}]"#,
        DialectName::Sqlite,
        "nymph_",
        &[],
    )
    .unwrap();
    assert_eq!(plan.dialect, "sqlite");
    assert_eq!(plan.etypes, vec!["Employee"]);
    assert_eq!(plan.returns, ReturnKind::Count);
    assert!(plan.text.contains(r#""nymph_entities_Employee""#));
    assert!(plan.params.iter().any(|p| p.value == json!(",staff,")));
    assert!(plan.params.iter().all(|p| plan.text.contains(&format!("@{}", p.name))));
}

#[test]
fn explain_postgres_numbers_placeholders() {
    let plan = explain(
        r#"[{"class":"Employee"},{"type":"&","ilike":["name","j%"]}]"#,
        DialectName::Postgres,
        "app_",
        &[],
    )
    .unwrap();
    assert_eq!(plan.dialect, "postgres");
    assert!(plan.text.contains("ILIKE"));
    assert!(plan.text.contains("$1"));
    assert!(!plan.text.contains("@p"));
    assert!(plan.text.contains("app_data_Employee"));
}

#[test]
fn explain_rejects_bad_queries() {
    assert!(explain("not json", DialectName::Sqlite, "nymph_", &[]).is_err());
    assert!(explain(r#"[{"class":"Employee"},{"type":"&","match":["name","("]}]"#, DialectName::Sqlite, "nymph_", &[]).is_err());
}

// ── query ────────────────────────────────────────────────────────

#[tokio::test]
async fn query_reads_an_existing_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.db");
    let db = path.to_string_lossy().to_string();

    let mut classes = ClassRegistry::new();
    classes.register("Employee", "Employee").unwrap();
    let nymph = Nymph::new(Arc::new(SqliteDriver::connect(SqliteConfig::new(db.clone())).unwrap()), classes);
    for name in ["Ada", "Grace"] {
        let mut e = Entity::new("Employee");
        e.set("name", name).unwrap();
        nymph.save(&mut e).await.unwrap();
    }

    let found = run_query(&db, r#"[{"class":"Employee","sort":"name"}]"#, "nymph_", &[]).await.unwrap();
    let names: Vec<&str> = found
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["data"]["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Ada", "Grace"]);

    let count = run_query(&db, r#"[{"class":"Employee","return":"count"}]"#, "nymph_", &[]).await.unwrap();
    assert_eq!(count, json!(2));
}

#[tokio::test]
async fn query_needs_a_database_name() {
    assert!(run_query("", r#"[{"class":"Employee"}]"#, "nymph_", &[]).await.is_err());
}
