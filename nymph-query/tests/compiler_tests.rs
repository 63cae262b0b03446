use nymph_model::{ClassRegistry, Query, ReturnKind};
use nymph_query::compiler::number_placeholders;
use nymph_query::{Compiler, PostgresDialect, QueryError, SqlValue, SqliteDialect};
use pretty_assertions::assert_eq;

fn registry() -> ClassRegistry {
    let mut classes = ClassRegistry::new();
    classes.register("Employee", "Employee").unwrap();
    classes.register("Project", "project").unwrap();
    classes
}

fn compile_sqlite(text: &str) -> nymph_query::CompiledQuery {
    let classes = registry();
    let compiler = Compiler::new(&SqliteDialect, &classes, "nymph_");
    compiler.compile(&Query::parse(text).unwrap()).unwrap()
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

// ── Plan shape ───────────────────────────────────────────────────

#[test]
fn guid_query_without_selectors() {
    let plan = compile_sqlite(r#"[{"class":"Employee","return":"guid"}]"#);
    assert_eq!(
        plan.text,
        r#"SELECT e1."guid" FROM "nymph_entities_Employee" e1 WHERE 1=1 ORDER BY e1."cdate" ASC, e1."guid" ASC"#
    );
    assert!(plan.params.is_empty());
    assert_eq!(plan.etypes, vec!["Employee".to_string()]);
    assert_eq!(plan.return_kind, ReturnKind::Guid);
}

#[test]
fn unpaged_count_with_tag() {
    let plan = compile_sqlite(r#"[{"class":"Employee","return":"count"},{"type":"&","tag":"staff"}]"#);
    assert_eq!(
        plan.text,
        r#"SELECT COUNT(e1."guid") AS "count" FROM "nymph_entities_Employee" e1 WHERE ((instr(e1."tags", @p1) > 0))"#
    );
    assert_eq!(plan.params, vec![("p1".to_string(), text(",staff,"))]);
}

#[test]
fn paged_count_wraps_inner_query() {
    let plan = compile_sqlite(r#"[{"class":"Employee","return":"count","limit":5}]"#);
    assert_eq!(
        plan.text,
        r#"SELECT COUNT(*) AS "count" FROM (SELECT e1."guid" FROM "nymph_entities_Employee" e1 WHERE 1=1 ORDER BY e1."cdate" ASC, e1."guid" ASC LIMIT @p1) c2"#
    );
    assert_eq!(plan.params, vec![("p1".to_string(), SqlValue::Integer(5))]);
}

#[test]
fn entity_query_pages_guids_before_joining_data() {
    let plan = compile_sqlite(r#"[{"class":"Employee","limit":5,"offset":10}]"#);
    assert!(plan.text.starts_with(
        r#"SELECT e4."guid", e4."tags", e4."cdate", e4."mdate", d5."name", d5."value" FROM (SELECT e1."guid", e1."cdate" AS "sort_0" FROM "nymph_entities_Employee" e1"#
    ));
    assert!(plan.text.contains(r#"LIMIT @p1 OFFSET @p2) l3 JOIN "nymph_entities_Employee" e4 ON e4."guid" = l3."guid""#));
    assert!(plan.text.contains(r#"LEFT JOIN "nymph_data_Employee" d5 ON d5."guid" = e4."guid""#));
    assert!(plan.text.ends_with(r#"ORDER BY l3."sort_0" ASC, l3."guid" ASC, d5."name" ASC"#));
    assert_eq!(
        plan.params,
        vec![
            ("p1".to_string(), SqlValue::Integer(5)),
            ("p2".to_string(), SqlValue::Integer(10)),
        ]
    );
}

#[test]
fn offset_without_limit() {
    let plan = compile_sqlite(r#"[{"class":"Employee","return":"guid","offset":3}]"#);
    assert!(plan.text.ends_with("LIMIT -1 OFFSET @p1"));
}

#[test]
fn property_sort_joins_data_table() {
    let plan = compile_sqlite(r#"[{"class":"Employee","sort":"salary","reverse":true}]"#);
    assert!(plan.text.contains(
        r#"LEFT JOIN "nymph_data_Employee" s2 ON s2."guid" = e1."guid" AND s2."name" = @p1"#
    ));
    assert!(plan.text.contains(r#"s2."number" AS "sort_0", s2."string" AS "sort_1""#));
    assert!(plan.text.contains(r#"ORDER BY s2."number" DESC, s2."string" DESC, e1."guid" ASC"#));
    assert!(plan.text.ends_with(r#"ORDER BY l3."sort_0" DESC, l3."sort_1" DESC, l3."guid" ASC, d5."name" ASC"#));
    assert_eq!(plan.params, vec![("p1".to_string(), text("salary"))]);
}

// ── Clauses ──────────────────────────────────────────────────────

#[test]
fn property_clauses_use_typed_columns() {
    let plan = compile_sqlite(
        r#"[{"class":"Employee","return":"guid"},{"type":"&","equal":[["name","Jane"],["salary",5],["current",true]],"gt":["age",30]}]"#,
    );
    assert!(plan.text.contains(r#"d2."name" = @p1 AND d2."string" = @p2"#));
    assert!(plan.text.contains(r#"d3."name" = @p3 AND d3."number" = @p4"#));
    assert!(plan.text.contains(r#"d4."name" = @p5 AND d4."value" = @p6"#));
    assert!(plan.text.contains(r#"d5."name" = @p7 AND d5."number" > @p8"#));
    assert_eq!(plan.params[3].1, SqlValue::Real(5.0));
    assert_eq!(plan.params[5].1, text("true"));
    assert_eq!(plan.params[7].1, SqlValue::Real(30.0));
}

#[test]
fn negation_wraps_clause() {
    let plan = compile_sqlite(r#"[{"class":"Employee","return":"guid"},{"type":"!|","tag":"a","!tag":"b"}]"#);
    assert!(plan.text.contains(
        r#"WHERE ((instr(e1."tags", @p1) > 0) OR NOT (instr(e1."tags", @p2) > 0))"#
    ));
}

#[test]
fn empty_selectors_by_type() {
    let and = compile_sqlite(r#"[{"class":"Employee","return":"count"},{"type":"&"}]"#);
    assert!(and.text.ends_with("WHERE (1=1)"));
    let or = compile_sqlite(r#"[{"class":"Employee","return":"count"},{"type":"|"}]"#);
    assert!(or.text.ends_with("WHERE (1=0)"));
}

#[test]
fn timestamp_clauses_use_entity_columns() {
    let plan = compile_sqlite(
        r#"[{"class":"Employee","return":"count"},{"type":"&","gte":["cdate",100],"equal":["mdate","x"]}]"#,
    );
    assert!(plan.text.contains(r#"(e1."cdate" >= @p1)"#));
    assert!(plan.text.contains("(1=0)"));
    assert_eq!(plan.params, vec![("p1".to_string(), SqlValue::Real(100.0))]);
}

#[test]
fn pattern_clauses_use_registered_functions() {
    let plan = compile_sqlite(
        r#"[{"class":"Employee","return":"count"},{"type":"&","imatch":["name","^j"],"like":["name","J%"],"contain":["skills","rust"]}]"#,
    );
    // Clause names are visited in sorted order: contain, imatch, like.
    assert!(plan.text.contains(r#"nymph_contains(d2."value", @p2)"#));
    assert!(plan.text.contains(r#"nymph_regexp(@p4, d3."string", 1)"#));
    assert!(plan.text.contains(r#"nymph_like(@p6, d4."string", 0)"#));
    assert_eq!(plan.params[1].1, text("\"rust\""));
}

#[test]
fn ref_and_qref_use_references_table() {
    let guid = "0123456789abcdef01234567";
    let plan = compile_sqlite(&format!(
        r#"[{{"class":"Employee","return":"guid"}},{{"type":"&","ref":["manager","{guid}"],"qref":["projects",[{{"class":"Project","limit":2}},{{"type":"&","tag":"active"}}]]}}]"#
    ));
    assert!(plan.text.contains(r#"r2."reference" IN (SELECT e3."guid" FROM "nymph_entities_project" e3"#));
    assert!(plan.text.contains(r#"LIMIT @p3)"#));
    assert!(plan.text.contains(
        r#"EXISTS (SELECT 1 FROM "nymph_references_Employee" r4 WHERE r4."guid" = e1."guid" AND r4."name" = @p4 AND r4."reference" = @p5)"#
    ));
    assert_eq!(plan.params[1].1, text(",active,"));
    assert_eq!(plan.params[4].1, text(guid));
    assert_eq!(plan.etypes, vec!["Employee".to_string(), "project".to_string()]);
}

#[test]
fn invalid_regex_fails_at_compile_time() {
    let classes = registry();
    let compiler = Compiler::new(&SqliteDialect, &classes, "nymph_");
    let query = Query::parse(r#"[{"class":"Employee"},{"type":"&","match":["name","(oops"]}]"#).unwrap();
    assert!(matches!(compiler.compile(&query), Err(QueryError::InvalidParameters(_))));
}

#[test]
fn unknown_class_fails() {
    let classes = registry();
    let compiler = Compiler::new(&SqliteDialect, &classes, "nymph_");
    let query = Query::parse(r#"[{"class":"Nope"}]"#).unwrap();
    assert!(matches!(
        compiler.compile(&query),
        Err(QueryError::Model(nymph_model::Error::UnknownClass(_)))
    ));
}

// ── Postgres rendering ───────────────────────────────────────────

#[test]
fn postgres_numbers_placeholders_in_order() {
    let classes = registry();
    let compiler = Compiler::new(&PostgresDialect, &classes, "nymph_");
    let query = Query::parse(
        r#"[{"class":"Employee","sort":"name","limit":1},{"type":"&","ilike":["name","j%"],"contain":["skills","rust"]}]"#,
    )
    .unwrap();
    let plan = compiler.compile(&query).unwrap();
    assert!(!plan.text.contains("@p"));
    assert!(plan.text.contains(r#"s2."name" = $1"#));
    assert!(plan.text.contains(r#"d3."value"::jsonb @> $3::jsonb"#));
    assert!(plan.text.contains(r#"d4."string" ILIKE $5 ESCAPE '\'"#));
    assert!(plan.text.contains(r#"ASC NULLS FIRST"#));
    assert!(plan.text.contains("LIMIT $6"));
    let values: Vec<SqlValue> = plan.params.into_iter().map(|(_, v)| v).collect();
    assert_eq!(
        values,
        vec![
            text("name"),
            text("skills"),
            text("\"rust\""),
            text("name"),
            text("j%"),
            SqlValue::Integer(1),
        ]
    );
}

#[test]
fn placeholder_numbering_reuses_names() {
    let (sql, params) = number_placeholders(
        "a = @p2 AND b @> @p1 AND c = @p2",
        vec![("p1".into(), text("x")), ("p2".into(), text("y"))],
    );
    assert_eq!(sql, "a = $1 AND b @> $2 AND c = $1");
    assert_eq!(params, vec![("p2".to_string(), text("y")), ("p1".to_string(), text("x"))]);
}
