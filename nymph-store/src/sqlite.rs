//! SQLite driver.
//!
//! Runs plans from [`nymph_query::Compiler`] against four tables per etype.
//! The regex, LIKE and JSON containment predicates are registered as SQL
//! functions backed by the same Rust code the in-memory matcher uses.
//!
//! One connection is shared by every context handle, so all handles see the
//! same transaction. Callers must finish one operation before starting the
//! next on a transaction.

use async_trait::async_trait;
use nymph_model::{canonical_json, collect_references, ClassRegistry, Entity, Guid, Query, ReturnKind};
use nymph_query::functions::{compile_regex, is_truthy, json_contains, like_match, sort_columns};
use nymph_query::{table_name, CompiledQuery, Compiler, SqlValue, SqliteDialect, TableKind};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSql, Value as SqlParam};
use rusqlite::{params, Connection, ErrorCode};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{SqliteConfig, MEMORY_FILENAME};
use crate::driver::{Driver, QueryOutput, TransactionStack, TransactionStep};
use crate::error::{StoreError, StoreResult};

/// SQLite-backed [`Driver`].
pub struct SqliteDriver {
    conn: Arc<Mutex<Connection>>,
    config: SqliteConfig,
    transactions: Mutex<TransactionStack>,
    /// Etypes whose tables are known to exist.
    ready: Mutex<HashSet<String>>,
}

/// One row of an entity query.
struct EntityRow {
    guid: String,
    tags: String,
    cdate: f64,
    mdate: f64,
    name: Option<String>,
    value: Option<String>,
}

enum Fetched {
    Entities(Vec<EntityRow>),
    Guids(Vec<String>),
    Count(i64),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn tags_column(tags: &BTreeSet<String>) -> String {
    let mut out = String::from(",");
    for tag in tags {
        out.push_str(tag);
        out.push(',');
    }
    out
}

fn parse_tags(column: &str) -> BTreeSet<String> {
    column
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn bind_value(value: &SqlValue) -> SqlParam {
    match value {
        SqlValue::Text(s) => SqlParam::Text(s.clone()),
        SqlValue::Real(f) => SqlParam::Real(*f),
        SqlValue::Integer(i) => SqlParam::Integer(*i),
    }
}

fn user_error(e: nymph_query::QueryError) -> rusqlite::Error {
    rusqlite::Error::UserFunctionError(Box::new(e))
}

/// Registers `nymph_regexp`, `nymph_like` and `nymph_contains`.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("nymph_regexp", 3, flags, |ctx| {
        let pattern: String = ctx.get(0)?;
        let Some(text) = ctx.get::<Option<String>>(1)? else {
            return Ok(false);
        };
        let case_insensitive: bool = ctx.get(2)?;
        let regex = compile_regex(&pattern, case_insensitive).map_err(user_error)?;
        Ok(regex.is_match(&text))
    })?;

    conn.create_scalar_function("nymph_like", 3, flags, |ctx| {
        let pattern: String = ctx.get(0)?;
        let Some(text) = ctx.get::<Option<String>>(1)? else {
            return Ok(false);
        };
        let case_insensitive: bool = ctx.get(2)?;
        Ok(like_match(&pattern, &text, case_insensitive))
    })?;

    conn.create_scalar_function("nymph_contains", 2, flags, |ctx| {
        let Some(haystack) = ctx.get::<Option<String>>(0)? else {
            return Ok(false);
        };
        let needle: String = ctx.get(1)?;
        let parse = |s: &str| {
            serde_json::from_str::<Value>(s)
                .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))
        };
        Ok(json_contains(&parse(&haystack)?, &parse(&needle)?))
    })?;

    Ok(())
}

impl SqliteDriver {
    /// Opens the configured database.
    pub fn connect(config: SqliteConfig) -> StoreResult<Self> {
        if config.is_placeholder() {
            return Err(StoreError::NotConfigured(
                "sqlite filename has not been set".into(),
            ));
        }
        if !config.prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(StoreError::InvalidParameters(format!(
                "invalid table prefix `{}`",
                config.prefix
            )));
        }
        let conn = if config.filename == MEMORY_FILENAME {
            Connection::open_in_memory()
        } else {
            Connection::open(&config.filename)
        }
        .map_err(|e| StoreError::UnableToConnect(format!("{}: {e}", config.filename)))?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(|e| StoreError::UnableToConnect(format!("failed to set busy timeout: {e}")))?;
        if config.wal_mode && config.filename != MEMORY_FILENAME {
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(|e| StoreError::UnableToConnect(format!("failed to enable WAL: {e}")))?;
        }
        register_functions(&conn)
            .map_err(|e| StoreError::UnableToConnect(format!("failed to register functions: {e}")))?;

        info!(filename = %config.filename, prefix = %config.prefix, "opened sqlite database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            config,
            transactions: Mutex::new(TransactionStack::default()),
            ready: Mutex::new(HashSet::new()),
        })
    }

    /// Opens a private in-memory database (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::connect(SqliteConfig::in_memory())
    }

    pub fn config(&self) -> &SqliteConfig {
        &self.config
    }

    fn table(&self, kind: TableKind, etype: &str) -> String {
        quote(&table_name(&self.config.prefix, kind, etype))
    }

    fn create_tables_now(&self, etype: &str) -> StoreResult<()> {
        nymph_model::validate_etype(etype)?;
        let entities = table_name(&self.config.prefix, TableKind::Entities, etype);
        let data = table_name(&self.config.prefix, TableKind::Data, etype);
        let references = table_name(&self.config.prefix, TableKind::References, etype);
        let uniques = table_name(&self.config.prefix, TableKind::Uniques, etype);
        let sql = format!(
            r#"
            CREATE TABLE IF NOT EXISTS "{entities}" (
                "guid" TEXT PRIMARY KEY NOT NULL,
                "tags" TEXT NOT NULL DEFAULT ',',
                "cdate" REAL NOT NULL,
                "mdate" REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS "{entities}_cdate" ON "{entities}" ("cdate");
            CREATE INDEX IF NOT EXISTS "{entities}_mdate" ON "{entities}" ("mdate");

            CREATE TABLE IF NOT EXISTS "{data}" (
                "guid" TEXT NOT NULL,
                "name" TEXT NOT NULL,
                "value" TEXT NOT NULL,
                "truthy" INTEGER NOT NULL,
                "string" TEXT,
                "number" REAL,
                PRIMARY KEY ("guid", "name")
            );
            CREATE INDEX IF NOT EXISTS "{data}_name_number" ON "{data}" ("name", "number");
            CREATE INDEX IF NOT EXISTS "{data}_name_string" ON "{data}" ("name", "string");

            CREATE TABLE IF NOT EXISTS "{references}" (
                "guid" TEXT NOT NULL,
                "name" TEXT NOT NULL,
                "reference" TEXT NOT NULL,
                PRIMARY KEY ("guid", "name", "reference")
            );
            CREATE INDEX IF NOT EXISTS "{references}_reference" ON "{references}" ("reference");

            CREATE TABLE IF NOT EXISTS "{uniques}" (
                "guid" TEXT NOT NULL,
                "unique" TEXT PRIMARY KEY NOT NULL
            );
            CREATE INDEX IF NOT EXISTS "{uniques}_guid" ON "{uniques}" ("guid");
            "#
        );
        lock(&self.conn)
            .execute_batch(&sql)
            .map_err(|e| StoreError::query_failed(sql.trim(), e))?;
        lock(&self.ready).insert(etype.to_string());
        info!(etype, "created tables");
        Ok(())
    }

    fn ensure_tables(&self, etype: &str) -> StoreResult<()> {
        if lock(&self.ready).contains(etype) {
            return Ok(());
        }
        self.create_tables_now(etype)
    }

    fn fetch(&self, plan: &CompiledQuery) -> StoreResult<Fetched> {
        let fail = |e: rusqlite::Error| StoreError::query_failed(plan.text.as_str(), e);
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(&plan.text).map_err(fail)?;
        let bound: Vec<(String, SqlParam)> = plan
            .params
            .iter()
            .map(|(name, value)| (format!("@{name}"), bind_value(value)))
            .collect();
        let named: Vec<(&str, &dyn ToSql)> = bound
            .iter()
            .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
            .collect();

        Ok(match plan.return_kind {
            ReturnKind::Count => {
                let count: i64 = stmt
                    .query_row(named.as_slice(), |row| row.get(0))
                    .map_err(fail)?;
                Fetched::Count(count)
            }
            ReturnKind::Guid => {
                let guids = stmt
                    .query_map(named.as_slice(), |row| row.get::<_, String>(0))
                    .map_err(fail)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(fail)?;
                Fetched::Guids(guids)
            }
            ReturnKind::Entity => {
                let rows = stmt
                    .query_map(named.as_slice(), |row| {
                        Ok(EntityRow {
                            guid: row.get(0)?,
                            tags: row.get(1)?,
                            cdate: row.get(2)?,
                            mdate: row.get(3)?,
                            name: row.get(4)?,
                            value: row.get(5)?,
                        })
                    })
                    .map_err(fail)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(fail)?;
                Fetched::Entities(rows)
            }
        })
    }

    /// Writes the data, reference and unique rows of `entity`.
    fn write_side_rows(
        &self,
        conn: &Connection,
        etype: &str,
        guid: &str,
        entity: &Entity,
        uniques: &[String],
    ) -> StoreResult<()> {
        let sql = format!(
            r#"INSERT INTO {} ("guid", "unique") VALUES (?1, ?2)"#,
            self.table(TableKind::Uniques, etype)
        );
        for unique in uniques {
            conn.execute(&sql, params![guid, unique]).map_err(|e| {
                if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                    StoreError::EntityUniqueConstraint {
                        etype: etype.to_string(),
                        unique: unique.clone(),
                    }
                } else {
                    StoreError::query_failed(sql.as_str(), e)
                }
            })?;
        }

        let data_sql = format!(
            r#"INSERT INTO {} ("guid", "name", "value", "truthy", "string", "number") VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            self.table(TableKind::Data, etype)
        );
        let ref_sql = format!(
            r#"INSERT INTO {} ("guid", "name", "reference") VALUES (?1, ?2, ?3)"#,
            self.table(TableKind::References, etype)
        );
        for (name, value) in entity.data() {
            let (number, string) = sort_columns(Some(value));
            conn.execute(
                &data_sql,
                params![guid, name, canonical_json(value), is_truthy(value), string, number],
            )
            .map_err(|e| StoreError::query_failed(data_sql.as_str(), e))?;
            for reference in collect_references(value) {
                conn.execute(&ref_sql, params![guid, name, reference.to_hex()])
                    .map_err(|e| StoreError::query_failed(ref_sql.as_str(), e))?;
            }
        }
        Ok(())
    }

    fn delete_side_rows(&self, conn: &Connection, etype: &str, guid: &str) -> StoreResult<()> {
        for kind in [TableKind::Data, TableKind::References, TableKind::Uniques] {
            let sql = format!(r#"DELETE FROM {} WHERE "guid" = ?1"#, self.table(kind, etype));
            conn.execute(&sql, params![guid])
                .map_err(|e| StoreError::query_failed(sql.as_str(), e))?;
        }
        Ok(())
    }
}

/// The store-maintained fields every written entity must carry.
fn stamp(entity: &Entity) -> StoreResult<(Guid, f64, f64)> {
    match (entity.guid(), entity.cdate(), entity.mdate()) {
        (Some(guid), Some(cdate), Some(mdate)) => Ok((guid, cdate, mdate)),
        _ => Err(StoreError::InvalidParameters(
            "entity is missing guid, cdate or mdate".into(),
        )),
    }
}

fn hydrate(fetched: Fetched, class: &str) -> StoreResult<QueryOutput> {
    Ok(match fetched {
        Fetched::Count(n) => QueryOutput::Count(u64::try_from(n).unwrap_or_default()),
        Fetched::Guids(guids) => QueryOutput::Guids(
            guids
                .iter()
                .map(|g| Guid::parse(g))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Fetched::Entities(rows) => {
            struct Pending {
                guid: String,
                tags: String,
                cdate: f64,
                mdate: f64,
                data: BTreeMap<String, Value>,
            }
            let mut pending: Vec<Pending> = Vec::new();
            for row in rows {
                if pending.last().is_none_or(|p| p.guid != row.guid) {
                    pending.push(Pending {
                        guid: row.guid,
                        tags: row.tags,
                        cdate: row.cdate,
                        mdate: row.mdate,
                        data: BTreeMap::new(),
                    });
                }
                if let (Some(name), Some(value), Some(entry)) = (row.name, row.value, pending.last_mut()) {
                    entry.data.insert(name, serde_json::from_str(&value)?);
                }
            }
            let entities = pending
                .into_iter()
                .map(|p| -> StoreResult<Entity> {
                    Ok(Entity::from_storage(
                        class,
                        Guid::parse(&p.guid)?,
                        p.cdate,
                        p.mdate,
                        parse_tags(&p.tags),
                        p.data,
                    ))
                })
                .collect::<StoreResult<Vec<_>>>()?;
            QueryOutput::Entities(entities)
        }
    })
}

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn query(&self, query: &Query, classes: &ClassRegistry) -> StoreResult<QueryOutput> {
        let compiler = Compiler::new(&SqliteDialect, classes, &self.config.prefix);
        let plan = compiler.compile(query)?;
        let fetched = match self.fetch(&plan) {
            Err(e) if e.is_missing_table() => {
                debug!(etypes = ?plan.etypes, "tables missing, creating and retrying");
                for etype in &plan.etypes {
                    self.create_tables_now(etype)?;
                }
                self.fetch(&plan)?
            }
            other => other?,
        };
        hydrate(fetched, &query.options.class)
    }

    async fn create_tables(&self, etype: &str) -> StoreResult<()> {
        self.create_tables_now(etype)
    }

    async fn insert(&self, etype: &str, entity: &Entity, uniques: &[String]) -> StoreResult<()> {
        self.ensure_tables(etype)?;
        let (guid, cdate, mdate) = stamp(entity)?;
        let guid = guid.to_hex();
        let conn = lock(&self.conn);
        let sql = format!(
            r#"INSERT INTO {} ("guid", "tags", "cdate", "mdate") VALUES (?1, ?2, ?3, ?4)"#,
            self.table(TableKind::Entities, etype)
        );
        conn.execute(&sql, params![guid, tags_column(entity.tags()), cdate, mdate])
            .map_err(|e| StoreError::query_failed(sql.as_str(), e))?;
        self.write_side_rows(&conn, etype, &guid, entity, uniques)?;
        debug!(etype, guid = %guid, "inserted entity");
        Ok(())
    }

    async fn update(
        &self,
        etype: &str,
        entity: &Entity,
        known_mdate: f64,
        uniques: &[String],
    ) -> StoreResult<bool> {
        self.ensure_tables(etype)?;
        let (guid, _, mdate) = stamp(entity)?;
        let guid = guid.to_hex();
        let conn = lock(&self.conn);
        let sql = format!(
            r#"UPDATE {} SET "tags" = ?1, "mdate" = ?2 WHERE "guid" = ?3 AND "mdate" <= ?4"#,
            self.table(TableKind::Entities, etype)
        );
        let changed = conn
            .execute(&sql, params![tags_column(entity.tags()), mdate, guid, known_mdate])
            .map_err(|e| StoreError::query_failed(sql.as_str(), e))?;
        if changed == 0 {
            debug!(etype, guid = %guid, "update guard failed");
            return Ok(false);
        }
        self.delete_side_rows(&conn, etype, &guid)?;
        self.write_side_rows(&conn, etype, &guid, entity, uniques)?;
        debug!(etype, guid = %guid, "updated entity");
        Ok(true)
    }

    async fn delete(&self, etype: &str, guid: Guid) -> StoreResult<bool> {
        self.ensure_tables(etype)?;
        let guid = guid.to_hex();
        let conn = lock(&self.conn);
        let sql = format!(
            r#"DELETE FROM {} WHERE "guid" = ?1"#,
            self.table(TableKind::Entities, etype)
        );
        let removed = conn
            .execute(&sql, params![guid])
            .map_err(|e| StoreError::query_failed(sql.as_str(), e))?;
        self.delete_side_rows(&conn, etype, &guid)?;
        debug!(etype, guid = %guid, removed, "deleted entity");
        Ok(removed > 0)
    }

    async fn start_transaction(&self, name: &str) -> StoreResult<()> {
        let mut stack = lock(&self.transactions);
        let sql = match stack.push(name)? {
            TransactionStep::Outer => "BEGIN".to_string(),
            TransactionStep::Savepoint(name) => format!("SAVEPOINT {}", quote(&name)),
        };
        if let Err(e) = lock(&self.conn).execute_batch(&sql) {
            let _ = stack.pop(name);
            return Err(StoreError::query_failed(sql, e));
        }
        debug!(name, depth = stack.depth(), "transaction started");
        Ok(())
    }

    async fn commit(&self, name: &str) -> StoreResult<()> {
        let mut stack = lock(&self.transactions);
        let sql = match stack.pop(name)?.1 {
            TransactionStep::Outer => "COMMIT".to_string(),
            TransactionStep::Savepoint(name) => format!("RELEASE SAVEPOINT {}", quote(&name)),
        };
        lock(&self.conn)
            .execute_batch(&sql)
            .map_err(|e| StoreError::query_failed(sql.as_str(), e))?;
        debug!(name, depth = stack.depth(), "transaction committed");
        Ok(())
    }

    async fn rollback(&self, name: &str) -> StoreResult<()> {
        let mut stack = lock(&self.transactions);
        let sql = match stack.pop(name)?.1 {
            TransactionStep::Outer => "ROLLBACK".to_string(),
            TransactionStep::Savepoint(name) => {
                let name = quote(&name);
                format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}")
            }
        };
        // Tables created inside the transaction are gone again.
        lock(&self.ready).clear();
        lock(&self.conn)
            .execute_batch(&sql)
            .map_err(|e| StoreError::query_failed(sql.as_str(), e))?;
        debug!(name, depth = stack.depth(), "transaction rolled back");
        Ok(())
    }

    async fn in_transaction(&self) -> bool {
        !lock(&self.transactions).is_empty()
    }
}
