// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runs one catalog operation over a key set under its batching discipline.
//!
//! | Mode | Protocol |
//! |------|----------|
//! | `Indy` | per key: begin, issue, commit, close |
//! | `Each` | begin; per key: issue, flush; commit; close |
//! | `Bulk` | begin; one vectorized issue; commit; close |
//!
//! Every result is checked against the values the key implies. The first
//! failure rolls the unit of work back, closes it and aborts the dispatch.

use tracing::{debug, warn};

use crate::backend::{Backend, Predicate, StatementSpec};
use crate::catalog::{OpKind, Operation, Prepared, XMode};
use crate::error::{ExecError, StoreError, Violation};
use crate::metric::{Counter, CounterRecorder};
use crate::model::{
    attr_values, varbinary_value, varchar_value, Column, Entity, Id, KeySet, Row, Sign, Value,
};

/// What went wrong inside a unit of work, before it is tied to an operation.
#[derive(Debug)]
enum Fault {
    Store {
        key: Option<Id>,
        source: StoreError,
    },
    Verify {
        key: Option<Id>,
        violation: Violation,
    },
}

impl Fault {
    fn store(key: Option<Id>) -> impl FnOnce(StoreError) -> Fault {
        move |source| Fault::Store { key, source }
    }

    fn verify(key: Option<Id>, violation: Violation) -> Fault {
        Fault::Verify { key, violation }
    }

    /// Attributes a fault without a key to `key`.
    fn at(self, key: Id) -> Fault {
        match self {
            Fault::Store { key: None, source } => Fault::Store {
                key: Some(key),
                source,
            },
            Fault::Verify {
                key: None,
                violation,
            } => Fault::Verify {
                key: Some(key),
                violation,
            },
            other => other,
        }
    }

    fn into_error<S>(self, op: &Operation<S>) -> ExecError {
        let operation = op.name().to_string();
        let mode = op.mode();
        match self {
            Fault::Store { key, source } => ExecError::Backend {
                operation,
                mode,
                key,
                source,
            },
            Fault::Verify { key, violation } => ExecError::Verify {
                operation,
                mode,
                key,
                violation,
            },
        }
    }
}

/// Values a read expects besides the row identity.
#[derive(Debug, Clone, Copy, Default)]
struct Expect {
    sign: Option<Sign>,
    aid: bool,
    varbinary: Option<usize>,
    varchar: Option<usize>,
}

impl Expect {
    fn attrs(sign: Sign) -> Self {
        Self {
            sign: Some(sign),
            ..Self::default()
        }
    }

    fn check(&self, row: &Row) -> Result<(), Violation> {
        if let Some(sign) = self.sign {
            for (column, expected) in Column::SCALARS.iter().zip(attr_values(row.id, sign)) {
                let actual = row.get(*column);
                if actual != expected {
                    return Err(Violation::Attribute {
                        column: *column,
                        expected,
                        actual,
                    });
                }
            }
        }
        if self.aid && row.aid != Some(row.id) {
            return Err(Violation::Attribute {
                column: Column::Aid,
                expected: Value::Int(row.id),
                actual: row.get(Column::Aid),
            });
        }
        if let Some(len) = self.varbinary {
            let expected = varbinary_value(row.id, len);
            if row.cvarbinary.as_deref() != Some(expected.as_slice()) {
                return Err(Violation::Attribute {
                    column: Column::Cvarbinary,
                    expected: Value::Bytes(expected),
                    actual: row.get(Column::Cvarbinary),
                });
            }
        }
        if let Some(len) = self.varchar {
            let expected = varchar_value(row.id, len);
            if row.cvarchar.as_deref() != Some(expected.as_str()) {
                return Err(Violation::Attribute {
                    column: Column::Cvarchar,
                    expected: Value::Text(expected),
                    actual: row.get(Column::Cvarchar),
                });
            }
        }
        Ok(())
    }
}

/// Dispatches catalog operations to one backend session and counts the
/// calls it makes.
pub struct Executor<B: Backend> {
    backend: B,
    counters: CounterRecorder,
}

impl<B: Backend> Executor<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            counters: CounterRecorder::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn counters(&self) -> &CounterRecorder {
        &self.counters
    }

    /// Runs `op` over every key of `keys`.
    pub fn execute(&mut self, op: &Operation<B::Statement>, keys: &KeySet) -> Result<(), ExecError> {
        self.dispatch(op, keys.as_slice())
            .map_err(|fault| fault.into_error(op))
    }

    /// Removes every row of `entity` in a unit of work of its own, returning
    /// the number of rows removed. Nothing is verified.
    pub fn delete_all(&mut self, entity: Entity) -> Result<u64, StoreError> {
        let spec = StatementSpec::DeleteAll { entity };
        let statement = self.backend.prepare(&spec)?;
        let result = self.unit_of_work(|exec, tx| {
            exec.issue_unkeyed(tx, &statement)
                .map_err(Fault::store(None))
        });
        let result = result.map_err(|fault| match fault {
            Fault::Store { source, .. } => source,
            Fault::Verify { violation, .. } => StoreError::Backend(violation.to_string()),
        });
        if let Err(e) = self.backend.release(statement) {
            warn!(statement = %spec, error = %e, "failed to release statement");
        }
        result
    }

    fn dispatch(&mut self, op: &Operation<B::Statement>, keys: &[Id]) -> Result<(), Fault> {
        match op.discipline() {
            XMode::Indy => {
                for &key in keys {
                    self.unit_of_work(|exec, tx| exec.step(tx, op, &[key], false))
                        .map_err(|f| f.at(key))?;
                }
                Ok(())
            }
            XMode::Each => self.unit_of_work(|exec, tx| {
                for &key in keys {
                    exec.step(tx, op, &[key], false).map_err(|f| f.at(key))?;
                    exec.flush(tx).map_err(Fault::store(Some(key)))?;
                }
                Ok(())
            }),
            XMode::Bulk => self.unit_of_work(|exec, tx| exec.step(tx, op, keys, true)),
        }
    }

    /// begin, `body`, commit; rolls back on any failure and always closes.
    fn unit_of_work<T, F>(&mut self, body: F) -> Result<T, Fault>
    where
        F: FnOnce(&mut Self, &mut B::Tx) -> Result<T, Fault>,
    {
        let mut tx = self.begin().map_err(Fault::store(None))?;
        let result = body(self, &mut tx)
            .and_then(|v| self.commit(&mut tx).map(|_| v).map_err(Fault::store(None)));
        if result.is_err() {
            debug!(backend = self.backend.name(), "rolling back unit of work");
            if let Err(e) = self.rollback(&mut tx) {
                warn!(backend = self.backend.name(), error = %e, "rollback failed");
            }
        }
        self.close(tx);
        result
    }

    /// Applies `op` to `keys`: one vectorized call when `bulk`, otherwise
    /// `keys` holds a single key.
    fn step(
        &mut self,
        tx: &mut B::Tx,
        op: &Operation<B::Statement>,
        keys: &[Id],
        bulk: bool,
    ) -> Result<(), Fault> {
        let kind = op.kind();
        let first = statement(op, 0)?;
        match kind {
            OpKind::DeleteAll => {
                let affected = self.issue_unkeyed(tx, &first.handle).map_err(Fault::store(None))?;
                expect_affected(None, keys.len() as u64, affected)
            }
            kind if kind.is_write() => {
                if bulk {
                    let values: Vec<_> = keys.iter().map(|k| kind.values(*k)).collect();
                    let affected = self
                        .issue_many(tx, &first.handle, keys, &values)
                        .map_err(Fault::store(None))?;
                    if affected.len() != keys.len() {
                        return Err(Fault::verify(
                            None,
                            Violation::RowCount {
                                expected: keys.len(),
                                actual: affected.len(),
                            },
                        ));
                    }
                    for (key, n) in keys.iter().zip(affected) {
                        expect_affected(Some(*key), 1, n)?;
                    }
                    Ok(())
                } else {
                    for &key in keys {
                        let affected = self
                            .issue_one(tx, &first.handle, key, &kind.values(key))
                            .map_err(Fault::store(Some(key)))?;
                        expect_affected(Some(key), 1, affected)?;
                    }
                    Ok(())
                }
            }
            OpKind::ReadAttr(sign) | OpKind::ReadAttrWhereIn(sign) => {
                let expect = Expect {
                    sign,
                    ..Expect::default()
                };
                self.read(tx, first, keys, bulk, expect).map(|_| ())
            }
            OpKind::GetVarbinary { len, sign } => {
                let expect = Expect {
                    varbinary: Some(len),
                    ..Expect::attrs(sign)
                };
                self.read(tx, first, keys, bulk, expect).map(|_| ())
            }
            OpKind::GetVarchar { len, sign } => {
                let expect = Expect {
                    varchar: Some(len),
                    ..Expect::attrs(sign)
                };
                self.read(tx, first, keys, bulk, expect).map(|_| ())
            }
            OpKind::NavigateToParent { sign, .. } => {
                let expect = Expect {
                    aid: true,
                    ..Expect::attrs(sign)
                };
                let children = self.read(tx, first, keys, bulk, expect)?;
                let parents: Vec<Id> = children.iter().filter_map(|r| r.aid).collect();
                let parent = statement(op, 1)?;
                self.read(tx, parent, &parents, bulk, Expect::attrs(sign))
                    .map(|_| ())
            }
            OpKind::NavigateToChildren(sign) => {
                let expect = Expect {
                    aid: true,
                    ..Expect::attrs(sign)
                };
                self.read(tx, first, keys, bulk, expect).map(|_| ())
            }
            _ => Err(Fault::Store {
                key: None,
                source: StoreError::Unsupported(format!("{kind:?}")),
            }),
        }
    }

    /// Fetches one row per key and checks each, returning the rows in key
    /// order.
    fn read(
        &mut self,
        tx: &mut B::Tx,
        prepared: &Prepared<B::Statement>,
        keys: &[Id],
        bulk: bool,
        expect: Expect,
    ) -> Result<Vec<Row>, Fault> {
        let predicate = match &prepared.spec {
            StatementSpec::Fetch { predicate, .. } => *predicate,
            spec => {
                return Err(Fault::Store {
                    key: None,
                    source: StoreError::InvalidStatement(format!("{spec} is not a fetch")),
                })
            }
        };

        let rows = if predicate == Predicate::PrimaryKey && !bulk {
            let mut rows = Vec::with_capacity(keys.len());
            for &key in keys {
                match self
                    .fetch_one(tx, &prepared.handle, key)
                    .map_err(Fault::store(Some(key)))?
                {
                    Some(row) => rows.push(row),
                    None => return Err(Fault::verify(Some(key), Violation::Missing)),
                }
            }
            rows
        } else {
            let mut rows = self
                .fetch_many(tx, &prepared.handle, keys)
                .map_err(Fault::store(None))?;
            if !self.backend.orders_results() {
                match predicate {
                    Predicate::ForeignKey => rows.sort_by_key(|r| (r.aid, r.id)),
                    _ => rows.sort_by_key(|r| r.id),
                }
            }
            rows
        };

        let identity = |row: &Row| match predicate {
            Predicate::ForeignKey => row.aid,
            _ => Some(row.id),
        };

        if rows.len() != keys.len() {
            let missing = keys
                .iter()
                .find(|k| !rows.iter().any(|r| identity(r) == Some(**k)))
                .copied();
            return Err(Fault::verify(
                missing,
                Violation::RowCount {
                    expected: keys.len(),
                    actual: rows.len(),
                },
            ));
        }

        for (row, &key) in rows.iter().zip(keys) {
            if identity(row) != Some(key) {
                return Err(Fault::verify(
                    Some(key),
                    Violation::Identity {
                        expected: key,
                        actual: identity(row).unwrap_or(row.id),
                    },
                ));
            }
            expect
                .check(row)
                .map_err(|violation| Fault::verify(Some(key), violation))?;
        }
        Ok(rows)
    }

    fn begin(&mut self) -> Result<B::Tx, StoreError> {
        self.counters.increment(Counter::Begin, 1);
        self.backend.begin()
    }

    fn commit(&mut self, tx: &mut B::Tx) -> Result<(), StoreError> {
        self.counters.increment(Counter::Commit, 1);
        self.backend.commit(tx)
    }

    fn rollback(&mut self, tx: &mut B::Tx) -> Result<(), StoreError> {
        self.counters.increment(Counter::Rollback, 1);
        self.backend.rollback(tx)
    }

    fn close(&mut self, tx: B::Tx) {
        self.counters.increment(Counter::Close, 1);
        self.backend.close(tx)
    }

    fn flush(&mut self, tx: &mut B::Tx) -> Result<(), StoreError> {
        self.counters.increment(Counter::Flush, 1);
        self.backend.flush(tx)
    }

    fn issue_one(
        &mut self,
        tx: &mut B::Tx,
        statement: &B::Statement,
        key: Id,
        values: &[Value],
    ) -> Result<u64, StoreError> {
        self.counters.increment(Counter::IssueOne, 1);
        self.backend.issue_one(tx, statement, key, values)
    }

    fn issue_many(
        &mut self,
        tx: &mut B::Tx,
        statement: &B::Statement,
        keys: &[Id],
        values: &[Vec<Value>],
    ) -> Result<Vec<u64>, StoreError> {
        self.counters.increment(Counter::IssueMany, 1);
        self.backend.issue_many(tx, statement, keys, values)
    }

    fn issue_unkeyed(&mut self, tx: &mut B::Tx, statement: &B::Statement) -> Result<u64, StoreError> {
        self.counters.increment(Counter::IssueUnkeyed, 1);
        self.backend.issue_unkeyed(tx, statement)
    }

    fn fetch_one(
        &mut self,
        tx: &mut B::Tx,
        statement: &B::Statement,
        key: Id,
    ) -> Result<Option<Row>, StoreError> {
        self.counters.increment(Counter::FetchOne, 1);
        self.backend.fetch_one(tx, statement, key)
    }

    fn fetch_many(
        &mut self,
        tx: &mut B::Tx,
        statement: &B::Statement,
        keys: &[Id],
    ) -> Result<Vec<Row>, StoreError> {
        self.counters.increment(Counter::FetchMany, 1);
        self.backend.fetch_many(tx, statement, keys)
    }
}

fn statement<S>(op: &Operation<S>, i: usize) -> Result<&Prepared<S>, Fault> {
    op.statements.get(i).ok_or_else(|| Fault::Store {
        key: None,
        source: StoreError::InvalidStatement(format!("{} has no statement {i}", op.name())),
    })
}

fn expect_affected(key: Option<Id>, expected: u64, actual: u64) -> Result<(), Fault> {
    if expected != actual {
        return Err(Fault::verify(key, Violation::Affected { expected, actual }));
    }
    Ok(())
}
