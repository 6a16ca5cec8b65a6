// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashSet;
use std::path::Path;
use std::rc::Rc;

use crund::{
    check_arity, Backend, Column, Config, Entity, Id, Predicate, Row, StatementSpec, StoreError,
    Value,
};
use rusqlite::{
    params_from_iter, types::Value as SqlValue, Connection, ErrorCode, OptionalExtension,
};
use tracing::warn;

use super::IN_MEMORY;

const STATEMENT_CACHE_CAPACITY: usize = 256;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS a (
    id      INTEGER PRIMARY KEY,
    cint    INTEGER,
    clong   INTEGER,
    cfloat  REAL,
    cdouble REAL
);
CREATE TABLE IF NOT EXISTS b (
    id         INTEGER PRIMARY KEY,
    cint       INTEGER,
    clong      INTEGER,
    cfloat     REAL,
    cdouble    REAL,
    aid        INTEGER REFERENCES a(id),
    cvarbinary BLOB,
    cvarchar   TEXT
);
CREATE INDEX IF NOT EXISTS b_aid ON b(aid);
";

fn sql_err(e: rusqlite::Error) -> StoreError {
    match e.sqlite_error_code() {
        Some(ErrorCode::ConstraintViolation) => StoreError::Constraint(e.to_string()),
        _ => StoreError::Backend(e.to_string()),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Int(v) => SqlValue::Integer(i64::from(*v)),
        Value::Long(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(f64::from(*v)),
        Value::Double(v) => SqlValue::Real(*v),
        Value::Bytes(v) => SqlValue::Blob(v.clone()),
        Value::Text(v) => SqlValue::Text(v.clone()),
    }
}

/// Renders `spec` as SQL. The key binds to `?1`, values to `?2..`.
fn sql_of(spec: &StatementSpec) -> String {
    let column_list = |columns: &[Column]| {
        columns
            .iter()
            .map(|c| format!(", {c}"))
            .collect::<String>()
    };
    match spec {
        StatementSpec::Insert { entity, columns } => {
            let params: String = (0..columns.len()).map(|i| format!(", ?{}", i + 2)).collect();
            format!(
                "INSERT INTO {} (id{}) VALUES (?1{params})",
                entity.table_name(),
                column_list(columns)
            )
        }
        StatementSpec::Update { entity, columns } => {
            let set = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{c} = ?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            format!("UPDATE {} SET {set} WHERE id = ?1", entity.table_name())
        }
        StatementSpec::Delete { entity } => {
            format!("DELETE FROM {} WHERE id = ?1", entity.table_name())
        }
        StatementSpec::DeleteAll { entity } => format!("DELETE FROM {}", entity.table_name()),
        StatementSpec::Fetch {
            entity,
            columns,
            predicate,
        } => {
            let filter = match predicate {
                Predicate::PrimaryKey => "id = ?1",
                Predicate::KeyIn => "id IN rarray(?1) ORDER BY id",
                Predicate::ForeignKey => "aid IN rarray(?1) ORDER BY aid, id",
            };
            format!(
                "SELECT id{} FROM {} WHERE {filter}",
                column_list(columns),
                entity.table_name()
            )
        }
    }
}

fn read_row(r: &rusqlite::Row<'_>, columns: &[Column]) -> rusqlite::Result<Row> {
    let mut row = Row::new(r.get(0)?);
    for (i, column) in columns.iter().enumerate() {
        let idx = i + 1;
        match column {
            Column::Cint => row.cint = r.get(idx)?,
            Column::Clong => row.clong = r.get(idx)?,
            Column::Cfloat => row.cfloat = r.get::<_, Option<f64>>(idx)?.map(|v| v as f32),
            Column::Cdouble => row.cdouble = r.get(idx)?,
            Column::Aid => row.aid = r.get(idx)?,
            Column::Cvarbinary => row.cvarbinary = r.get(idx)?,
            Column::Cvarchar => row.cvarchar = r.get(idx)?,
        }
    }
    Ok(row)
}

/// Both entities as SQL tables in one SQLite connection.
///
/// Statements are compiled once through the connection's statement cache,
/// which is emptied when the last prepared statement is released.
/// Multi-key lookups bind the whole key list as one `rarray` parameter.
pub struct SqliteWrapper {
    conn: Connection,
    open_statements: usize,
    /// SQL compiled into the cache since it was last emptied.
    compiled: HashSet<String>,
    compilations: u64,
}

pub struct SqliteStatement {
    spec: StatementSpec,
    sql: String,
}

pub struct SqliteTx {
    active: bool,
}

impl Drop for SqliteWrapper {
    fn drop(&mut self) {
        if self.open_statements != 0 {
            warn!(
                open = self.open_statements,
                "sqlite connection closed with unreleased statements"
            );
        }
    }
}

impl SqliteWrapper {
    /// Statements compiled over the life of this connection. Preparing SQL
    /// that is already compiled does not count.
    pub fn compilations(&self) -> u64 {
        self.compilations
    }

    pub fn open_statements(&self) -> usize {
        self.open_statements
    }
}

impl Backend for SqliteWrapper {
    type Statement = SqliteStatement;
    type Tx = SqliteTx;

    fn open(config: &Config) -> Result<Self, StoreError> {
        let path = config.get_file_path();
        let conn = if path == Path::new(IN_MEMORY) {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }
        .map_err(sql_err)?;

        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        conn.pragma_update(None, "foreign_keys", config.get_enforce_foreign_keys())
            .map_err(sql_err)?;
        rusqlite::vtab::array::load_module(&conn).map_err(sql_err)?;
        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);

        Ok(Self {
            conn,
            open_statements: 0,
            compiled: HashSet::new(),
            compilations: 0,
        })
    }

    fn name(&self) -> &str {
        "sqlite"
    }

    fn orders_results(&self) -> bool {
        true
    }

    fn prepare(&mut self, spec: &StatementSpec) -> Result<SqliteStatement, StoreError> {
        spec.validate()?;
        let sql = sql_of(spec);
        self.conn.prepare_cached(&sql).map_err(sql_err)?;
        if self.compiled.insert(sql.clone()) {
            self.compilations += 1;
        }
        self.open_statements += 1;
        Ok(SqliteStatement {
            spec: spec.clone(),
            sql,
        })
    }

    fn release(&mut self, _statement: SqliteStatement) -> Result<(), StoreError> {
        self.open_statements = self
            .open_statements
            .checked_sub(1)
            .ok_or_else(|| StoreError::InvalidStatement("statement released twice".into()))?;
        if self.open_statements == 0 {
            self.conn.flush_prepared_statement_cache();
            self.compiled.clear();
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<SqliteTx, StoreError> {
        self.conn.execute_batch("BEGIN").map_err(sql_err)?;
        Ok(SqliteTx { active: true })
    }

    fn commit(&mut self, tx: &mut SqliteTx) -> Result<(), StoreError> {
        if !tx.active {
            return Err(StoreError::Transaction(
                "commit without active unit of work".into(),
            ));
        }
        // a failed COMMIT leaves the transaction open for rollback
        self.conn.execute_batch("COMMIT").map_err(sql_err)?;
        tx.active = false;
        Ok(())
    }

    fn rollback(&mut self, tx: &mut SqliteTx) -> Result<(), StoreError> {
        if tx.active && !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK").map_err(sql_err)?;
        }
        tx.active = false;
        Ok(())
    }

    fn close(&mut self, mut tx: SqliteTx) {
        if let Err(e) = self.rollback(&mut tx) {
            warn!(error = %e, "failed to roll back sqlite transaction");
        }
    }

    fn issue_one(
        &mut self,
        tx: &mut SqliteTx,
        statement: &SqliteStatement,
        key: Id,
        values: &[Value],
    ) -> Result<u64, StoreError> {
        check_arity(&statement.spec, values)?;
        if !tx.active {
            return Err(StoreError::Transaction("unit of work already ended".into()));
        }
        let params = std::iter::once(SqlValue::Integer(i64::from(key)))
            .chain(values.iter().map(to_sql));
        let mut stmt = self.conn.prepare_cached(&statement.sql).map_err(sql_err)?;
        let affected = stmt.execute(params_from_iter(params)).map_err(sql_err)?;
        Ok(affected as u64)
    }

    fn issue_unkeyed(
        &mut self,
        tx: &mut SqliteTx,
        statement: &SqliteStatement,
    ) -> Result<u64, StoreError> {
        if !matches!(statement.spec, StatementSpec::DeleteAll { .. }) {
            return Err(StoreError::InvalidStatement(format!(
                "{} takes a key",
                statement.spec
            )));
        }
        if !tx.active {
            return Err(StoreError::Transaction("unit of work already ended".into()));
        }
        let mut stmt = self.conn.prepare_cached(&statement.sql).map_err(sql_err)?;
        let affected = stmt.execute([]).map_err(sql_err)?;
        Ok(affected as u64)
    }

    fn fetch_one(
        &mut self,
        tx: &mut SqliteTx,
        statement: &SqliteStatement,
        key: Id,
    ) -> Result<Option<Row>, StoreError> {
        Ok(self.fetch_many(tx, statement, &[key])?.into_iter().next())
    }

    fn fetch_many(
        &mut self,
        tx: &mut SqliteTx,
        statement: &SqliteStatement,
        keys: &[Id],
    ) -> Result<Vec<Row>, StoreError> {
        let StatementSpec::Fetch {
            columns, predicate, ..
        } = &statement.spec
        else {
            return Err(StoreError::InvalidStatement(format!(
                "{} is not a fetch",
                statement.spec
            )));
        };
        if !tx.active {
            return Err(StoreError::Transaction("unit of work already ended".into()));
        }

        let mut stmt = self.conn.prepare_cached(&statement.sql).map_err(sql_err)?;
        let mut rows = Vec::with_capacity(keys.len());
        match predicate {
            Predicate::PrimaryKey => {
                for key in keys {
                    let row = stmt
                        .query_row([key], |r| read_row(r, columns))
                        .optional()
                        .map_err(sql_err)?;
                    rows.extend(row);
                }
            }
            Predicate::KeyIn | Predicate::ForeignKey => {
                let array: Rc<Vec<SqlValue>> = Rc::new(
                    keys.iter()
                        .map(|k| SqlValue::Integer(i64::from(*k)))
                        .collect(),
                );
                let found = stmt
                    .query_map([array], |r| read_row(r, columns))
                    .map_err(sql_err)?;
                for row in found {
                    rows.push(row.map_err(sql_err)?);
                }
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use crund::{run_benchmark, Catalog, CatalogSettings, Config, XMode};

    use super::*;

    fn small_config(path: impl AsRef<Path>) -> Config {
        let mut config = Config::new(path, 10);
        config.n_runs(2).max_varbinary_bytes(10).max_varchar_chars(10);
        config
    }

    #[test]
    fn statements_render_as_sql() {
        assert_eq!(
            sql_of(&StatementSpec::Insert {
                entity: Entity::A,
                columns: Column::SCALARS.to_vec(),
            }),
            "INSERT INTO a (id, cint, clong, cfloat, cdouble) VALUES (?1, ?2, ?3, ?4, ?5)"
        );
        assert_eq!(
            sql_of(&StatementSpec::Update {
                entity: Entity::B,
                columns: vec![Column::Aid],
            }),
            "UPDATE b SET aid = ?2 WHERE id = ?1"
        );
        assert_eq!(
            sql_of(&StatementSpec::Fetch {
                entity: Entity::B,
                columns: vec![Column::Cint],
                predicate: Predicate::ForeignKey,
            }),
            "SELECT id, cint FROM b WHERE aid IN rarray(?1) ORDER BY aid, id"
        );
    }

    #[test]
    fn full_run_in_memory() {
        let report = run_benchmark::<SqliteWrapper>(&small_config(IN_MEMORY)).unwrap();
        assert_eq!(report.backend, "sqlite");
        let names: Vec<_> = report.rounds[0]
            .timers
            .timers()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "A_getBs_bulk"));
    }

    #[test]
    fn file_store_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path().join("crund.sqlite"));
        config.renew_connection(true).modes(vec![XMode::Indy, XMode::Bulk]);
        assert!(run_benchmark::<SqliteWrapper>(&config).is_ok());
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let mut store = SqliteWrapper::open(&small_config(IN_MEMORY)).unwrap();
        let insert = store
            .prepare(&StatementSpec::Insert {
                entity: Entity::B,
                columns: vec![Column::Aid],
            })
            .unwrap();
        let mut tx = store.begin().unwrap();
        let err = store
            .issue_one(&mut tx, &insert, 1, &[Value::Int(7)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        store.close(tx);
        store.release(insert).unwrap();
        assert!(store.conn.is_autocommit());
    }

    #[test]
    fn key_list_fetch_is_ordered() {
        let mut store = SqliteWrapper::open(&small_config(IN_MEMORY)).unwrap();
        let insert = store
            .prepare(&StatementSpec::Insert {
                entity: Entity::A,
                columns: vec![Column::Cint],
            })
            .unwrap();
        let fetch = store
            .prepare(&StatementSpec::Fetch {
                entity: Entity::A,
                columns: vec![Column::Cint],
                predicate: Predicate::KeyIn,
            })
            .unwrap();

        let mut tx = store.begin().unwrap();
        for key in [5, 1, 3] {
            store
                .issue_one(&mut tx, &insert, key, &[Value::Int(key * 2)])
                .unwrap();
        }
        let rows = store.fetch_many(&mut tx, &fetch, &[3, 5, 1, 9]).unwrap();
        assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3, 5]);
        assert_eq!(rows[2].cint, Some(10));
        store.commit(&mut tx).unwrap();
        store.close(tx);

        store.release(insert).unwrap();
        store.release(fetch).unwrap();
    }

    #[test]
    fn closing_the_catalog_drops_compiled_statements() {
        let mut store = SqliteWrapper::open(&small_config(IN_MEMORY)).unwrap();
        let settings = CatalogSettings::default();

        let mut catalog = Catalog::build(&mut store, &settings).unwrap();
        let first = store.compilations();
        assert!(first > 0);
        assert!(store.open_statements() > 0);
        catalog.close(&mut store).unwrap();
        assert_eq!(store.open_statements(), 0);

        // a rebuilt catalog compiles everything again
        let mut catalog = Catalog::build(&mut store, &settings).unwrap();
        assert_eq!(store.compilations(), 2 * first);
        catalog.close(&mut store).unwrap();
    }
}
