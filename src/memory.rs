// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! An in-process transactional store.
//!
//! Writes go to a per-transaction overlay and reach the tables on commit.
//! Bulk fetches walk a hash set of the requested keys, so their result order
//! is arbitrary, like a database answering an `IN` query without `ORDER BY`.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::backend::{check_arity, Backend, Predicate, StatementSpec};
use crate::config::Config;
use crate::error::StoreError;
use crate::model::{Column, Entity, Id, Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug)]
pub struct MemoryTx {
    id: u64,
    state: TxState,
    overlay: HashMap<(Entity, Id), Option<Row>>,
    unflushed: usize,
}

#[derive(Debug)]
pub struct MemoryStatement {
    id: u32,
    spec: StatementSpec,
}

/// Lifetime call counts of a [`MemoryStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub prepared: u64,
    pub released: u64,
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub closed: u64,
    pub flushes: u64,
    pub flushed_writes: u64,
}

#[derive(Debug)]
pub struct MemoryStore {
    tables: HashMap<Entity, HashMap<Id, Row>>,
    statements: HashSet<u32>,
    next_statement: u32,
    next_tx: u64,
    enforce_foreign_keys: bool,
    disable_one_to_many: bool,
    stats: MemoryStats,
}

impl MemoryStore {
    pub fn new(enforce_foreign_keys: bool) -> Self {
        Self {
            tables: HashMap::new(),
            statements: HashSet::new(),
            next_statement: 0,
            next_tx: 0,
            enforce_foreign_keys,
            disable_one_to_many: false,
            stats: MemoryStats::default(),
        }
    }

    /// Default: true
    ///
    /// If set to false, A-to-B navigation is reported as unsupported.
    pub fn with_one_to_many(mut self, enabled: bool) -> Self {
        self.disable_one_to_many = !enabled;
        self
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Prepared statements not yet released.
    pub fn open_statements(&self) -> usize {
        self.statements.len()
    }

    /// Committed rows of `entity`.
    pub fn len(&self, entity: Entity) -> usize {
        self.tables.get(&entity).map_or(0, HashMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(HashMap::is_empty)
    }

    /// Committed row of `entity` with `id`.
    pub fn row(&self, entity: Entity, id: Id) -> Option<&Row> {
        self.tables.get(&entity).and_then(|t| t.get(&id))
    }

    fn lookup(&self, tx: &MemoryTx, entity: Entity, id: Id) -> Option<Row> {
        match tx.overlay.get(&(entity, id)) {
            Some(pending) => pending.clone(),
            None => self.row(entity, id).cloned(),
        }
    }

    /// Every row of `entity` the transaction can see.
    fn visible(&self, tx: &MemoryTx, entity: Entity) -> Vec<Row> {
        let committed = self
            .tables
            .get(&entity)
            .into_iter()
            .flat_map(HashMap::values)
            .filter(|r| !tx.overlay.contains_key(&(entity, r.id)))
            .cloned();
        let pending = tx
            .overlay
            .iter()
            .filter(|((e, _), _)| *e == entity)
            .filter_map(|(_, row)| row.clone());
        committed.chain(pending).collect()
    }

    fn write(tx: &mut MemoryTx, entity: Entity, id: Id, row: Option<Row>) {
        tx.overlay.insert((entity, id), row);
        tx.unflushed += 1;
    }

    fn check_active(tx: &MemoryTx) -> Result<(), StoreError> {
        match tx.state {
            TxState::Active => Ok(()),
            state => Err(StoreError::Transaction(format!(
                "transaction {} is {state:?}",
                tx.id
            ))),
        }
    }

    fn check_parent(&self, tx: &MemoryTx, row: &Row) -> Result<(), StoreError> {
        if !self.enforce_foreign_keys {
            return Ok(());
        }
        match row.aid {
            Some(aid) if self.lookup(tx, Entity::A, aid).is_none() => Err(StoreError::Constraint(
                format!("B {} references missing A {aid}", row.id),
            )),
            _ => Ok(()),
        }
    }

    fn check_no_children(&self, tx: &MemoryTx, ids: &HashSet<Id>) -> Result<(), StoreError> {
        if !self.enforce_foreign_keys {
            return Ok(());
        }
        match self
            .visible(tx, Entity::B)
            .iter()
            .find(|b| b.aid.is_some_and(|aid| ids.contains(&aid)))
        {
            Some(b) => Err(StoreError::Constraint(format!(
                "A {} is still referenced by B {}",
                b.aid.unwrap_or_default(),
                b.id
            ))),
            None => Ok(()),
        }
    }

    fn fill(row: &mut Row, columns: &[Column], values: &[Value]) -> Result<(), StoreError> {
        for (column, value) in columns.iter().zip(values) {
            row.set(*column, value.clone())?;
        }
        Ok(())
    }
}

impl Backend for MemoryStore {
    type Statement = MemoryStatement;
    type Tx = MemoryTx;

    fn open(config: &Config) -> Result<Self, StoreError> {
        Ok(MemoryStore::new(config.enforce_foreign_keys))
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn supports(&self, spec: &StatementSpec) -> bool {
        !(self.disable_one_to_many
            && matches!(
                spec,
                StatementSpec::Fetch {
                    predicate: Predicate::ForeignKey,
                    ..
                }
            ))
    }

    fn prepare(&mut self, spec: &StatementSpec) -> Result<Self::Statement, StoreError> {
        spec.validate()?;
        if !self.supports(spec) {
            return Err(StoreError::Unsupported(spec.to_string()));
        }
        let id = self.next_statement;
        self.next_statement += 1;
        self.statements.insert(id);
        self.stats.prepared += 1;
        Ok(MemoryStatement {
            id,
            spec: spec.clone(),
        })
    }

    fn release(&mut self, statement: Self::Statement) -> Result<(), StoreError> {
        if !self.statements.remove(&statement.id) {
            return Err(StoreError::InvalidStatement(format!(
                "statement {} released twice",
                statement.id
            )));
        }
        self.stats.released += 1;
        Ok(())
    }

    fn begin(&mut self) -> Result<Self::Tx, StoreError> {
        self.next_tx += 1;
        self.stats.begun += 1;
        Ok(MemoryTx {
            id: self.next_tx,
            state: TxState::Active,
            overlay: HashMap::new(),
            unflushed: 0,
        })
    }

    fn commit(&mut self, tx: &mut Self::Tx) -> Result<(), StoreError> {
        Self::check_active(tx)?;
        for ((entity, id), row) in tx.overlay.drain() {
            let table = self.tables.entry(entity).or_default();
            match row {
                Some(row) => {
                    table.insert(id, row);
                }
                None => {
                    table.remove(&id);
                }
            }
        }
        tx.state = TxState::Committed;
        tx.unflushed = 0;
        self.stats.committed += 1;
        Ok(())
    }

    fn rollback(&mut self, tx: &mut Self::Tx) -> Result<(), StoreError> {
        match tx.state {
            TxState::Committed => Err(StoreError::Transaction(format!(
                "transaction {} already committed",
                tx.id
            ))),
            TxState::RolledBack => Ok(()),
            TxState::Active => {
                tx.overlay.clear();
                tx.unflushed = 0;
                tx.state = TxState::RolledBack;
                self.stats.rolled_back += 1;
                Ok(())
            }
        }
    }

    fn close(&mut self, tx: Self::Tx) {
        if tx.state == TxState::Active && !tx.overlay.is_empty() {
            debug!(tx = tx.id, pending = tx.overlay.len(), "discarding uncommitted writes");
        }
        self.stats.closed += 1;
    }

    fn flush(&mut self, tx: &mut Self::Tx) -> Result<(), StoreError> {
        Self::check_active(tx)?;
        self.stats.flushes += 1;
        self.stats.flushed_writes += tx.unflushed as u64;
        tx.unflushed = 0;
        Ok(())
    }

    fn issue_one(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        key: Id,
        values: &[Value],
    ) -> Result<u64, StoreError> {
        Self::check_active(tx)?;
        let spec = &statement.spec;
        check_arity(spec, values)?;
        match spec {
            StatementSpec::Insert { entity, columns } => {
                if self.lookup(tx, *entity, key).is_some() {
                    return Err(StoreError::DuplicateKey {
                        entity: *entity,
                        id: key,
                    });
                }
                let mut row = Row::new(key);
                Self::fill(&mut row, columns, values)?;
                self.check_parent(tx, &row)?;
                Self::write(tx, *entity, key, Some(row));
                Ok(1)
            }
            StatementSpec::Update { entity, columns } => {
                let Some(mut row) = self.lookup(tx, *entity, key) else {
                    return Ok(0);
                };
                Self::fill(&mut row, columns, values)?;
                self.check_parent(tx, &row)?;
                Self::write(tx, *entity, key, Some(row));
                Ok(1)
            }
            StatementSpec::Delete { entity } => {
                if self.lookup(tx, *entity, key).is_none() {
                    return Ok(0);
                }
                if *entity == Entity::A {
                    self.check_no_children(tx, &HashSet::from([key]))?;
                }
                Self::write(tx, *entity, key, None);
                Ok(1)
            }
            StatementSpec::DeleteAll { .. } | StatementSpec::Fetch { .. } => Err(
                StoreError::InvalidStatement(format!("{spec} cannot be issued per key")),
            ),
        }
    }

    fn issue_unkeyed(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
    ) -> Result<u64, StoreError> {
        Self::check_active(tx)?;
        let StatementSpec::DeleteAll { entity } = statement.spec else {
            return Err(StoreError::InvalidStatement(format!(
                "{} needs a key",
                statement.spec
            )));
        };
        let ids: HashSet<Id> = self.visible(tx, entity).iter().map(|r| r.id).collect();
        if entity == Entity::A {
            self.check_no_children(tx, &ids)?;
        }
        for id in &ids {
            Self::write(tx, entity, *id, None);
        }
        Ok(ids.len() as u64)
    }

    fn fetch_one(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        key: Id,
    ) -> Result<Option<Row>, StoreError> {
        Self::check_active(tx)?;
        match &statement.spec {
            StatementSpec::Fetch {
                entity,
                columns,
                predicate: Predicate::PrimaryKey | Predicate::KeyIn,
            } => Ok(self
                .lookup(tx, *entity, key)
                .map(|row| row.project(columns))),
            spec => Err(StoreError::InvalidStatement(format!(
                "{spec} does not fetch a single row"
            ))),
        }
    }

    fn fetch_many(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        keys: &[Id],
    ) -> Result<Vec<Row>, StoreError> {
        Self::check_active(tx)?;
        let StatementSpec::Fetch {
            entity,
            columns,
            predicate,
        } = &statement.spec
        else {
            return Err(StoreError::InvalidStatement(format!(
                "{} is not a fetch",
                statement.spec
            )));
        };
        let wanted: HashSet<Id> = keys.iter().copied().collect();
        let rows = match predicate {
            Predicate::PrimaryKey | Predicate::KeyIn => wanted
                .iter()
                .filter_map(|id| self.lookup(tx, *entity, *id))
                .map(|row| row.project(columns))
                .collect(),
            Predicate::ForeignKey => self
                .visible(tx, Entity::B)
                .into_iter()
                .filter(|b| b.aid.is_some_and(|aid| wanted.contains(&aid)))
                .map(|row| row.project(columns))
                .collect(),
        };
        Ok(rows)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        if !self.statements.is_empty() {
            warn!(
                open = self.statements.len(),
                "memory store closed with unreleased statements"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{attr_values, Sign};

    fn insert_a(store: &mut MemoryStore, ids: &[Id]) {
        let stmt = store
            .prepare(&StatementSpec::Insert {
                entity: Entity::A,
                columns: Column::SCALARS.to_vec(),
            })
            .unwrap();
        let mut tx = store.begin().unwrap();
        for id in ids {
            let n = store
                .issue_one(&mut tx, &stmt, *id, &attr_values(*id, Sign::Negative))
                .unwrap();
            assert_eq!(n, 1);
        }
        store.commit(&mut tx).unwrap();
        store.close(tx);
        store.release(stmt).unwrap();
    }

    #[test]
    fn writes_are_invisible_until_commit() {
        let mut store = MemoryStore::new(true);
        let stmt = store
            .prepare(&StatementSpec::Insert {
                entity: Entity::A,
                columns: Vec::new(),
            })
            .unwrap();

        let mut tx = store.begin().unwrap();
        store.issue_one(&mut tx, &stmt, 1, &[]).unwrap();
        assert_eq!(store.len(Entity::A), 0);
        store.rollback(&mut tx).unwrap();
        store.close(tx);
        assert_eq!(store.len(Entity::A), 0);

        let mut tx = store.begin().unwrap();
        store.issue_one(&mut tx, &stmt, 1, &[]).unwrap();
        assert!(matches!(
            store.issue_one(&mut tx, &stmt, 1, &[]),
            Err(StoreError::DuplicateKey { id: 1, .. })
        ));
        store.commit(&mut tx).unwrap();
        store.close(tx);
        assert_eq!(store.len(Entity::A), 1);
        store.release(stmt).unwrap();
        assert_eq!(store.open_statements(), 0);
    }

    #[test]
    fn update_of_missing_row_affects_nothing() {
        let mut store = MemoryStore::new(true);
        let stmt = store
            .prepare(&StatementSpec::Update {
                entity: Entity::A,
                columns: Column::SCALARS.to_vec(),
            })
            .unwrap();
        let mut tx = store.begin().unwrap();
        let n = store
            .issue_one(&mut tx, &stmt, 9, &attr_values(9, Sign::Positive))
            .unwrap();
        assert_eq!(n, 0);
        store.commit(&mut tx).unwrap();
        store.close(tx);
        store.release(stmt).unwrap();
    }

    #[test]
    fn foreign_keys_are_enforced_when_asked() {
        for enforce in [true, false] {
            let mut store = MemoryStore::new(enforce);
            let insert_b = store
                .prepare(&StatementSpec::Insert {
                    entity: Entity::B,
                    columns: vec![Column::Aid],
                })
                .unwrap();
            let mut tx = store.begin().unwrap();
            let result = store.issue_one(&mut tx, &insert_b, 0, &[Value::Int(0)]);
            assert_eq!(result.is_err(), enforce);
            store.rollback(&mut tx).unwrap();
            store.close(tx);
            store.release(insert_b).unwrap();
        }
    }

    #[test]
    fn delete_all_counts_visible_rows() {
        let mut store = MemoryStore::new(true);
        insert_a(&mut store, &[0, 1, 2]);
        let stmt = store
            .prepare(&StatementSpec::DeleteAll { entity: Entity::A })
            .unwrap();
        let mut tx = store.begin().unwrap();
        assert_eq!(store.issue_unkeyed(&mut tx, &stmt).unwrap(), 3);
        assert_eq!(store.issue_unkeyed(&mut tx, &stmt).unwrap(), 0);
        store.commit(&mut tx).unwrap();
        store.close(tx);
        assert!(store.is_empty());
        store.release(stmt).unwrap();
    }

    #[test]
    fn fetch_many_returns_each_row_once() {
        let mut store = MemoryStore::new(true);
        insert_a(&mut store, &[0, 1, 2, 3]);
        let stmt = store
            .prepare(&StatementSpec::Fetch {
                entity: Entity::A,
                columns: vec![Column::Cint],
                predicate: Predicate::KeyIn,
            })
            .unwrap();
        let mut tx = store.begin().unwrap();
        let mut rows = store.fetch_many(&mut tx, &stmt, &[3, 1, 1, 7]).unwrap();
        rows.sort_by_key(|r| r.id);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cint, Some(-1));
        assert_eq!(rows[1].cint, Some(-3));
        assert_eq!(rows[1].clong, None);
        store.commit(&mut tx).unwrap();
        store.close(tx);
        store.release(stmt).unwrap();
    }

    #[test]
    fn finished_transactions_reject_work() {
        let mut store = MemoryStore::new(true);
        let stmt = store
            .prepare(&StatementSpec::Delete { entity: Entity::A })
            .unwrap();
        let mut tx = store.begin().unwrap();
        store.commit(&mut tx).unwrap();
        assert!(store.commit(&mut tx).is_err());
        assert!(store.rollback(&mut tx).is_err());
        assert!(store.issue_one(&mut tx, &stmt, 0, &[]).is_err());
        store.close(tx);
        store.release(stmt).unwrap();
        assert_eq!(store.stats().begun, store.stats().closed);
    }

    #[test]
    fn one_to_many_can_be_disabled() {
        let store = MemoryStore::new(true).with_one_to_many(false);
        let spec = StatementSpec::Fetch {
            entity: Entity::B,
            columns: vec![Column::Aid],
            predicate: Predicate::ForeignKey,
        };
        assert!(!store.supports(&spec));
        assert!(MemoryStore::new(true).supports(&spec));
    }
}
