// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::path::Path;

use crund::{
    check_arity, Backend, Config, Entity, Id, Predicate, Row, RowCodec, StatementSpec, StoreError,
    Transcoder, Value,
};
use redb::{backends::InMemoryBackend, ReadableTable, TableDefinition, WriteTransaction};
use tracing::warn;

use super::IN_MEMORY;

const A_TABLE: TableDefinition<Id, &[u8]> = TableDefinition::new("crund_a");
const B_TABLE: TableDefinition<Id, &[u8]> = TableDefinition::new("crund_b");

fn table_of(entity: Entity) -> TableDefinition<'static, Id, &'static [u8]> {
    match entity {
        Entity::A => A_TABLE,
        Entity::B => B_TABLE,
    }
}

fn backend_err(e: impl Into<redb::Error>) -> StoreError {
    StoreError::Backend(e.into().to_string())
}

fn read_row(
    table: &impl ReadableTable<Id, &'static [u8]>,
    codec: &RowCodec,
    key: Id,
) -> Result<Option<Row>, StoreError> {
    match table.get(key).map_err(backend_err)? {
        Some(guard) => Ok(Some(codec.decode(guard.value())?)),
        None => Ok(None),
    }
}

/// Both entities as encoded rows in two redb tables keyed by id.
///
/// redb has no secondary index, so lookups by foreign key are not offered.
/// Referential integrity is checked on the child side only: writing a `B`
/// whose `aid` names a missing `A` fails.
pub struct RedbWrapper {
    db: redb::Database,
    codec_a: RowCodec,
    codec_b: RowCodec,
    enforce_foreign_keys: bool,
}

pub struct RedbStatement {
    spec: StatementSpec,
}

/// A redb write transaction; reads inside a unit of work see its writes.
pub struct RedbTx {
    txn: Option<WriteTransaction>,
}

fn active(tx: &RedbTx) -> Result<&WriteTransaction, StoreError> {
    tx.txn
        .as_ref()
        .ok_or_else(|| StoreError::Transaction("unit of work already ended".into()))
}

impl RedbWrapper {
    fn codec(&mut self, entity: Entity) -> &mut RowCodec {
        match entity {
            Entity::A => &mut self.codec_a,
            Entity::B => &mut self.codec_b,
        }
    }

    fn check_parent(&self, txn: &WriteTransaction, row: &Row) -> Result<(), StoreError> {
        if !self.enforce_foreign_keys {
            return Ok(());
        }
        let Some(aid) = row.aid else {
            return Ok(());
        };
        let parents = txn.open_table(A_TABLE).map_err(backend_err)?;
        if parents.get(aid).map_err(backend_err)?.is_none() {
            return Err(StoreError::Constraint(format!(
                "B {} references missing A {aid}",
                row.id
            )));
        }
        Ok(())
    }
}

impl Backend for RedbWrapper {
    type Statement = RedbStatement;
    type Tx = RedbTx;

    fn open(config: &Config) -> Result<Self, StoreError> {
        let path = config.get_file_path();
        let db = if path == Path::new(IN_MEMORY) {
            redb::Database::builder().create_with_backend(InMemoryBackend::new())
        } else {
            redb::Database::create(path)
        }
        .map_err(backend_err)?;

        // tables are created on first open in a write transaction
        let txn = db.begin_write().map_err(backend_err)?;
        txn.open_table(A_TABLE).map_err(backend_err)?;
        txn.open_table(B_TABLE).map_err(backend_err)?;
        txn.commit().map_err(backend_err)?;

        let codec = |entity| {
            RowCodec::new(
                entity,
                config.get_max_varbinary_bytes(),
                config.get_max_varchar_chars(),
                Transcoder::new(config.get_charset()),
            )
        };
        Ok(Self {
            db,
            codec_a: codec(Entity::A),
            codec_b: codec(Entity::B),
            enforce_foreign_keys: config.get_enforce_foreign_keys(),
        })
    }

    fn name(&self) -> &str {
        "redb"
    }

    fn supports(&self, spec: &StatementSpec) -> bool {
        !matches!(
            spec,
            StatementSpec::Fetch {
                predicate: Predicate::ForeignKey,
                ..
            }
        )
    }

    fn orders_results(&self) -> bool {
        true
    }

    fn prepare(&mut self, spec: &StatementSpec) -> Result<RedbStatement, StoreError> {
        spec.validate()?;
        if !self.supports(spec) {
            return Err(StoreError::Unsupported(spec.to_string()));
        }
        Ok(RedbStatement { spec: spec.clone() })
    }

    fn release(&mut self, _statement: RedbStatement) -> Result<(), StoreError> {
        Ok(())
    }

    fn begin(&mut self) -> Result<RedbTx, StoreError> {
        let txn = self.db.begin_write().map_err(backend_err)?;
        Ok(RedbTx { txn: Some(txn) })
    }

    fn commit(&mut self, tx: &mut RedbTx) -> Result<(), StoreError> {
        match tx.txn.take() {
            Some(txn) => txn.commit().map_err(backend_err),
            None => Err(StoreError::Transaction("commit without active unit of work".into())),
        }
    }

    fn rollback(&mut self, tx: &mut RedbTx) -> Result<(), StoreError> {
        if let Some(txn) = tx.txn.take() {
            txn.abort().map_err(backend_err)?;
        }
        Ok(())
    }

    fn close(&mut self, mut tx: RedbTx) {
        if let Some(txn) = tx.txn.take() {
            if let Err(e) = txn.abort() {
                warn!(error = %e, "failed to abort redb transaction");
            }
        }
    }

    fn issue_one(
        &mut self,
        tx: &mut RedbTx,
        statement: &RedbStatement,
        key: Id,
        values: &[Value],
    ) -> Result<u64, StoreError> {
        check_arity(&statement.spec, values)?;
        let txn = active(tx)?;
        match &statement.spec {
            StatementSpec::Insert { entity, columns } => {
                let mut row = Row::new(key);
                for (column, value) in columns.iter().zip(values) {
                    row.set(*column, value.clone())?;
                }
                self.check_parent(txn, &row)?;
                let bytes = self.codec(*entity).encode(&row)?;

                let mut table = txn.open_table(table_of(*entity)).map_err(backend_err)?;
                if table.get(key).map_err(backend_err)?.is_some() {
                    return Err(StoreError::DuplicateKey {
                        entity: *entity,
                        id: key,
                    });
                }
                table.insert(key, bytes.as_slice()).map_err(backend_err)?;
                Ok(1)
            }
            StatementSpec::Update { entity, columns } => {
                let mut table = txn.open_table(table_of(*entity)).map_err(backend_err)?;
                let Some(mut row) = read_row(&table, self.codec(*entity), key)? else {
                    return Ok(0);
                };
                for (column, value) in columns.iter().zip(values) {
                    row.set(*column, value.clone())?;
                }
                if *entity == Entity::B {
                    self.check_parent(txn, &row)?;
                }
                let bytes = self.codec(*entity).encode(&row)?;
                table.insert(key, bytes.as_slice()).map_err(backend_err)?;
                Ok(1)
            }
            StatementSpec::Delete { entity } => {
                let mut table = txn.open_table(table_of(*entity)).map_err(backend_err)?;
                let removed = table.remove(key).map_err(backend_err)?.is_some();
                Ok(u64::from(removed))
            }
            other => Err(StoreError::InvalidStatement(format!(
                "{other} is not a keyed write"
            ))),
        }
    }

    fn issue_unkeyed(
        &mut self,
        tx: &mut RedbTx,
        statement: &RedbStatement,
    ) -> Result<u64, StoreError> {
        let StatementSpec::DeleteAll { entity } = &statement.spec else {
            return Err(StoreError::InvalidStatement(format!(
                "{} takes a key",
                statement.spec
            )));
        };
        let txn = active(tx)?;
        let mut table = txn.open_table(table_of(*entity)).map_err(backend_err)?;
        let keys = table
            .iter()
            .map_err(backend_err)?
            .map(|entry| entry.map(|(k, _)| k.value()))
            .collect::<Result<Vec<Id>, _>>()
            .map_err(backend_err)?;
        for key in &keys {
            table.remove(*key).map_err(backend_err)?;
        }
        Ok(keys.len() as u64)
    }

    fn fetch_one(
        &mut self,
        tx: &mut RedbTx,
        statement: &RedbStatement,
        key: Id,
    ) -> Result<Option<Row>, StoreError> {
        Ok(self.fetch_many(tx, statement, &[key])?.into_iter().next())
    }

    fn fetch_many(
        &mut self,
        tx: &mut RedbTx,
        statement: &RedbStatement,
        keys: &[Id],
    ) -> Result<Vec<Row>, StoreError> {
        let StatementSpec::Fetch {
            entity, columns, ..
        } = &statement.spec
        else {
            return Err(StoreError::InvalidStatement(format!(
                "{} is not a fetch",
                statement.spec
            )));
        };
        let txn = active(tx)?;
        let table = txn.open_table(table_of(*entity)).map_err(backend_err)?;
        let codec = self.codec(*entity);
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(row) = read_row(&table, codec, *key)? {
                rows.push(row.project(columns));
            }
        }
        rows.sort_by_key(|r| r.id);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use crund::{run_benchmark, Config, XMode};

    use super::*;

    fn small_config(path: impl AsRef<Path>) -> Config {
        let mut config = Config::new(path, 10);
        config.n_runs(2).max_varbinary_bytes(10).max_varchar_chars(10);
        config
    }

    #[test]
    fn full_run_in_memory() {
        let report = run_benchmark::<RedbWrapper>(&small_config(IN_MEMORY)).unwrap();
        assert_eq!(report.backend, "redb");
        let names: Vec<_> = report.rounds[0]
            .timers
            .timers()
            .iter()
            .map(|t| t.name().to_string())
            .collect();
        assert!(names.iter().any(|n| n == "B_getA_bulk"));
        assert!(names.iter().all(|n| !n.starts_with("A_getBs")));
    }

    #[test]
    fn file_store_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = small_config(dir.path().join("crund.redb"));
        config.renew_connection(true).modes(vec![XMode::Each]);
        assert!(run_benchmark::<RedbWrapper>(&config).is_ok());
    }

    #[test]
    fn missing_parent_is_refused() {
        let mut store = RedbWrapper::open(&small_config(IN_MEMORY)).unwrap();
        let insert = store
            .prepare(&StatementSpec::Insert {
                entity: Entity::B,
                columns: vec![crund::Column::Aid],
            })
            .unwrap();
        let mut tx = store.begin().unwrap();
        let err = store
            .issue_one(&mut tx, &insert, 1, &[Value::Int(7)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
        store.rollback(&mut tx).unwrap();
        store.close(tx);
        store.release(insert).unwrap();
    }

    #[test]
    fn foreign_key_fetches_are_unsupported() {
        let mut store = RedbWrapper::open(&small_config(IN_MEMORY)).unwrap();
        let spec = StatementSpec::Fetch {
            entity: Entity::B,
            columns: vec![],
            predicate: Predicate::ForeignKey,
        };
        assert!(!store.supports(&spec));
        assert!(matches!(
            store.prepare(&spec),
            Err(StoreError::Unsupported(_))
        ));
    }
}
