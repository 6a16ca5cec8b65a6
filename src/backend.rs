// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fmt;

use crate::config::Config;
use crate::error::StoreError;
use crate::model::{Column, Entity, Id, Row, Value};

/// How a fetch statement selects rows from its key argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Predicate {
    /// `id = key`, one lookup per key.
    PrimaryKey,
    /// `id IN (keys)`, one query for the whole key list.
    KeyIn,
    /// `aid IN (keys)` on B.
    ForeignKey,
}

/// Logical description of a statement, handed to [`Backend::prepare`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatementSpec {
    /// Values bind to `columns` in order; the key binds to `id`.
    Insert { entity: Entity, columns: Vec<Column> },
    Update { entity: Entity, columns: Vec<Column> },
    Delete { entity: Entity },
    DeleteAll { entity: Entity },
    Fetch {
        entity: Entity,
        columns: Vec<Column>,
        predicate: Predicate,
    },
}

impl StatementSpec {
    pub fn entity(&self) -> Entity {
        match self {
            StatementSpec::Insert { entity, .. }
            | StatementSpec::Update { entity, .. }
            | StatementSpec::Delete { entity }
            | StatementSpec::DeleteAll { entity }
            | StatementSpec::Fetch { entity, .. } => *entity,
        }
    }

    /// Columns bound from the caller's values, in bind order.
    pub fn bound_columns(&self) -> &[Column] {
        match self {
            StatementSpec::Insert { columns, .. } | StatementSpec::Update { columns, .. } => {
                columns
            }
            _ => &[],
        }
    }

    /// Rejects columns the entity lacks and predicates that make no sense for it.
    pub fn validate(&self) -> Result<(), StoreError> {
        let entity = self.entity();
        let columns = match self {
            StatementSpec::Insert { columns, .. }
            | StatementSpec::Update { columns, .. }
            | StatementSpec::Fetch { columns, .. } => columns.as_slice(),
            _ => &[],
        };
        if let Some(column) = columns.iter().find(|c| !entity.has_column(**c)) {
            return Err(StoreError::InvalidStatement(format!(
                "{entity} has no column {column}"
            )));
        }
        if let StatementSpec::Update { columns, .. } = self {
            if columns.is_empty() {
                return Err(StoreError::InvalidStatement(format!(
                    "update of {entity} sets no columns"
                )));
            }
        }
        if let StatementSpec::Fetch {
            predicate: Predicate::ForeignKey,
            ..
        } = self
        {
            if entity != Entity::B {
                return Err(StoreError::InvalidStatement(
                    "foreign key lookups only apply to B".into(),
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Display for StatementSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |columns: &[Column]| {
            columns
                .iter()
                .map(|c| c.name())
                .collect::<Vec<_>>()
                .join(",")
        };
        match self {
            StatementSpec::Insert { entity, columns } => {
                write!(f, "insert {entity}(id,{})", names(columns))
            }
            StatementSpec::Update { entity, columns } => {
                write!(f, "update {entity} set {} by id", names(columns))
            }
            StatementSpec::Delete { entity } => write!(f, "delete {entity} by id"),
            StatementSpec::DeleteAll { entity } => write!(f, "delete all {entity}"),
            StatementSpec::Fetch {
                entity,
                columns,
                predicate,
            } => write!(f, "fetch {entity}({}) by {predicate:?}", names(columns)),
        }
    }
}

/// Uniform interface of a data access layer that can be benchmarked by us.
///
/// One value of the implementing type is one session: it is opened with
/// [`Backend::open`] and closed when dropped. A session is driven by a single
/// thread; every call blocks until the backend answers.
pub trait Backend {
    /// Compiled, reusable form of a [`StatementSpec`].
    type Statement;

    /// An open unit of work.
    type Tx;

    fn open(config: &Config) -> Result<Self, StoreError>
    where
        Self: Sized;

    fn name(&self) -> &str;

    /// Whether this backend can execute `spec` at all.
    fn supports(&self, _spec: &StatementSpec) -> bool {
        true
    }

    /// Whether `fetch_many` returns rows in ascending id order.
    fn orders_results(&self) -> bool {
        false
    }

    fn prepare(&mut self, spec: &StatementSpec) -> Result<Self::Statement, StoreError>;

    fn release(&mut self, statement: Self::Statement) -> Result<(), StoreError>;

    fn begin(&mut self) -> Result<Self::Tx, StoreError>;

    fn commit(&mut self, tx: &mut Self::Tx) -> Result<(), StoreError>;

    /// Must be safe to call after a failed commit.
    fn rollback(&mut self, tx: &mut Self::Tx) -> Result<(), StoreError>;

    /// Releases the unit of work; an uncommitted one is discarded.
    fn close(&mut self, tx: Self::Tx);

    /// Pushes buffered work to the backend without ending the unit of work.
    fn flush(&mut self, _tx: &mut Self::Tx) -> Result<(), StoreError> {
        Ok(())
    }

    /// Executes a keyed write, returning the number of affected rows.
    fn issue_one(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        key: Id,
        values: &[Value],
    ) -> Result<u64, StoreError>;

    /// Executes a keyed write for every key as one batch.
    fn issue_many(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        keys: &[Id],
        values: &[Vec<Value>],
    ) -> Result<Vec<u64>, StoreError> {
        if !values.is_empty() && values.len() != keys.len() {
            return Err(StoreError::Arity {
                expected: keys.len(),
                actual: values.len(),
            });
        }
        keys.iter()
            .enumerate()
            .map(|(i, key)| {
                let row_values = values.get(i).map_or(&[][..], Vec::as_slice);
                self.issue_one(tx, statement, *key, row_values)
            })
            .collect()
    }

    /// Executes a statement that takes no key, such as delete-all.
    fn issue_unkeyed(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
    ) -> Result<u64, StoreError>;

    fn fetch_one(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        key: Id,
    ) -> Result<Option<Row>, StoreError>;

    /// All rows matching any of `keys`; order is backend defined unless
    /// [`Backend::orders_results`] says otherwise.
    fn fetch_many(
        &mut self,
        tx: &mut Self::Tx,
        statement: &Self::Statement,
        keys: &[Id],
    ) -> Result<Vec<Row>, StoreError>;
}

/// Checks that `values` lines up with the columns `spec` binds.
pub fn check_arity(spec: &StatementSpec, values: &[Value]) -> Result<(), StoreError> {
    let expected = spec.bound_columns().len();
    if values.len() != expected {
        return Err(StoreError::Arity {
            expected,
            actual: values.len(),
        });
    }
    Ok(())
}
