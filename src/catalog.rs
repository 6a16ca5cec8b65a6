// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The ordered list of named operations a benchmark run executes.
//!
//! The list is built as data: [`templates`] yields one entry per logical
//! operation in execution order, and [`Catalog::build`] crosses it with the
//! enabled batching modes, preparing every statement up front.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Backend, Predicate, StatementSpec};
use crate::config::Config;
use crate::error::{CatalogError, ConfigError, StoreError};
use crate::model::{
    attr_values, length_variants, varbinary_value, varchar_value, Column, Entity, Id, Sign, Value,
};

/// Transaction batching discipline of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XMode {
    /// One unit of work per key.
    Indy,
    /// One unit of work, flushed after every key.
    Each,
    /// One unit of work, one vectorized call for all keys.
    Bulk,
}

impl XMode {
    pub const ALL: [XMode; 3] = [XMode::Indy, XMode::Each, XMode::Bulk];

    pub fn label(self) -> &'static str {
        match self {
            XMode::Indy => "indy",
            XMode::Each => "each",
            XMode::Bulk => "bulk",
        }
    }
}

impl fmt::Display for XMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for XMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "indy" => Ok(XMode::Indy),
            "each" => Ok(XMode::Each),
            "bulk" => Ok(XMode::Bulk),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// What an operation does to each key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Insert with the four scalars.
    InsertAttr(Sign),
    /// Insert the key alone, leaving every column NULL.
    InsertKey,
    /// Blind update of the four scalars.
    UpdateAttr(Sign),
    /// Point read; with a sign the four scalars are checked, without one
    /// only the identity.
    ReadAttr(Option<Sign>),
    /// Key list read, checked like [`OpKind::ReadAttr`].
    ReadAttrWhereIn(Option<Sign>),
    SetVarbinary(usize),
    GetVarbinary { len: usize, sign: Sign },
    ClearVarbinary,
    SetVarchar(usize),
    GetVarchar { len: usize, sign: Sign },
    ClearVarchar,
    /// `B.aid = B.id`.
    SetForeignKey,
    ClearForeignKey,
    /// B to its parent A, through `predicate` lookups on both tables.
    NavigateToParent { sign: Sign, predicate: Predicate },
    /// A to the B rows pointing at it.
    NavigateToChildren(Sign),
    Delete,
    DeleteAll,
}

impl OpKind {
    /// Statements this kind needs on `entity`, in the order the executor uses them.
    pub fn statements(self, entity: Entity) -> Vec<StatementSpec> {
        let fetch = |entity, columns: &[Column], predicate| StatementSpec::Fetch {
            entity,
            columns: columns.to_vec(),
            predicate,
        };
        let with = |extra: Column| {
            let mut columns = Column::SCALARS.to_vec();
            columns.push(extra);
            columns
        };
        match self {
            OpKind::InsertAttr(_) => vec![StatementSpec::Insert {
                entity,
                columns: Column::SCALARS.to_vec(),
            }],
            OpKind::InsertKey => vec![StatementSpec::Insert {
                entity,
                columns: Vec::new(),
            }],
            OpKind::UpdateAttr(_) => vec![StatementSpec::Update {
                entity,
                columns: Column::SCALARS.to_vec(),
            }],
            OpKind::ReadAttr(_) => vec![fetch(entity, &Column::SCALARS, Predicate::PrimaryKey)],
            OpKind::ReadAttrWhereIn(_) => vec![fetch(entity, &Column::SCALARS, Predicate::KeyIn)],
            OpKind::SetVarbinary(_) | OpKind::ClearVarbinary => vec![StatementSpec::Update {
                entity,
                columns: vec![Column::Cvarbinary],
            }],
            OpKind::GetVarbinary { .. } => {
                vec![fetch(entity, &with(Column::Cvarbinary), Predicate::PrimaryKey)]
            }
            OpKind::SetVarchar(_) | OpKind::ClearVarchar => vec![StatementSpec::Update {
                entity,
                columns: vec![Column::Cvarchar],
            }],
            OpKind::GetVarchar { .. } => {
                vec![fetch(entity, &with(Column::Cvarchar), Predicate::PrimaryKey)]
            }
            OpKind::SetForeignKey | OpKind::ClearForeignKey => vec![StatementSpec::Update {
                entity,
                columns: vec![Column::Aid],
            }],
            OpKind::NavigateToParent { predicate, .. } => vec![
                fetch(Entity::B, &with(Column::Aid), predicate),
                fetch(Entity::A, &Column::SCALARS, predicate),
            ],
            OpKind::NavigateToChildren(_) => {
                vec![fetch(Entity::B, &with(Column::Aid), Predicate::ForeignKey)]
            }
            OpKind::Delete => vec![StatementSpec::Delete { entity }],
            OpKind::DeleteAll => vec![StatementSpec::DeleteAll { entity }],
        }
    }

    /// Values a write binds for `key`; empty for reads and key-only writes.
    pub fn values(self, key: Id) -> Vec<Value> {
        match self {
            OpKind::InsertAttr(sign) | OpKind::UpdateAttr(sign) => attr_values(key, sign),
            OpKind::SetVarbinary(len) => vec![Value::Bytes(varbinary_value(key, len))],
            OpKind::SetVarchar(len) => vec![Value::Text(varchar_value(key, len))],
            OpKind::SetForeignKey => vec![Value::Int(key)],
            OpKind::ClearVarbinary | OpKind::ClearVarchar | OpKind::ClearForeignKey => {
                vec![Value::Null]
            }
            _ => Vec::new(),
        }
    }

    pub fn is_write(self) -> bool {
        matches!(
            self,
            OpKind::InsertAttr(_)
                | OpKind::InsertKey
                | OpKind::UpdateAttr(_)
                | OpKind::SetVarbinary(_)
                | OpKind::ClearVarbinary
                | OpKind::SetVarchar(_)
                | OpKind::ClearVarchar
                | OpKind::SetForeignKey
                | OpKind::ClearForeignKey
                | OpKind::Delete
        )
    }
}

/// A catalog entry before it is crossed with a mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub base: String,
    pub entity: Entity,
    pub kind: OpKind,
}

impl Template {
    pub fn new(base: impl Into<String>, entity: Entity, kind: OpKind) -> Self {
        Self {
            base: base.into(),
            entity,
            kind,
        }
    }
}

/// The logical operations of one mode, in execution order.
pub fn templates(settings: &CatalogSettings) -> Vec<Template> {
    use Entity::{A, B};
    use Sign::{Negative, Positive};

    let mut t = Vec::new();
    for e in Entity::ALL {
        t.push(Template::new(format!("{e}_insAttr"), e, OpKind::InsertAttr(Negative)));
    }
    for e in Entity::ALL {
        t.push(Template::new(format!("{e}_setAttr"), e, OpKind::UpdateAttr(Positive)));
    }
    for e in Entity::ALL {
        t.push(Template::new(format!("{e}_getAttr"), e, OpKind::ReadAttr(Some(Positive))));
    }
    for e in Entity::ALL {
        t.push(Template::new(
            format!("{e}_getAttr_wherein"),
            e,
            OpKind::ReadAttrWhereIn(Some(Positive)),
        ));
    }
    for &len in &settings.varbinary_lengths {
        t.push(Template::new(format!("B_setVarbin_{len}"), B, OpKind::SetVarbinary(len)));
        t.push(Template::new(
            format!("B_getVarbin_{len}"),
            B,
            OpKind::GetVarbinary {
                len,
                sign: Positive,
            },
        ));
        t.push(Template::new(format!("B_clearVarbin_{len}"), B, OpKind::ClearVarbinary));
    }
    for &len in &settings.varchar_lengths {
        t.push(Template::new(format!("B_setVarchar_{len}"), B, OpKind::SetVarchar(len)));
        t.push(Template::new(
            format!("B_getVarchar_{len}"),
            B,
            OpKind::GetVarchar {
                len,
                sign: Positive,
            },
        ));
        t.push(Template::new(format!("B_clearVarchar_{len}"), B, OpKind::ClearVarchar));
    }
    t.push(Template::new("B_setA", B, OpKind::SetForeignKey));
    t.push(Template::new(
        "B_getA",
        B,
        OpKind::NavigateToParent {
            sign: Positive,
            predicate: Predicate::PrimaryKey,
        },
    ));
    t.push(Template::new(
        "B_getA_wherein",
        B,
        OpKind::NavigateToParent {
            sign: Positive,
            predicate: Predicate::KeyIn,
        },
    ));
    t.push(Template::new("A_getBs", A, OpKind::NavigateToChildren(Positive)));
    t.push(Template::new("B_clearA", B, OpKind::ClearForeignKey));
    t.push(Template::new("B_del", B, OpKind::Delete));
    t.push(Template::new("A_del", A, OpKind::Delete));
    for e in Entity::ALL {
        if settings.reinsert_attributes {
            t.push(Template::new(format!("{e}_reinsAttr"), e, OpKind::InsertAttr(Negative)));
        } else {
            t.push(Template::new(format!("{e}_ins"), e, OpKind::InsertKey));
        }
    }
    t.push(Template::new("B_delAll", B, OpKind::DeleteAll));
    t.push(Template::new("A_delAll", A, OpKind::DeleteAll));
    t
}

/// Catalog construction parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSettings {
    pub modes: Vec<XMode>,
    pub varbinary_lengths: Vec<usize>,
    pub varchar_lengths: Vec<usize>,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub reinsert_attributes: bool,
}

impl From<&Config> for CatalogSettings {
    fn from(config: &Config) -> Self {
        Self {
            modes: config.modes.clone(),
            varbinary_lengths: length_variants(config.max_varbinary_bytes),
            varchar_lengths: length_variants(config.max_varchar_chars),
            include: config.include.clone(),
            exclude: config.exclude.clone(),
            reinsert_attributes: config.reinsert_attributes,
        }
    }
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl CatalogSettings {
    pub fn modes(mut self, modes: Vec<XMode>) -> Self {
        self.modes = modes;
        self
    }

    /// Include/exclude entries match the full name or the base name.
    pub fn selects(&self, name: &str, base: &str) -> bool {
        let hit = |list: &[String]| list.iter().any(|n| n == name || n == base);
        (self.include.is_empty() || hit(&self.include)) && !hit(&self.exclude)
    }
}

#[derive(Debug)]
pub(crate) struct Prepared<S> {
    pub(crate) spec: StatementSpec,
    pub(crate) handle: S,
}

/// A named operation with its prepared statements.
#[derive(Debug)]
pub struct Operation<S> {
    name: String,
    base: String,
    mode: XMode,
    entity: Entity,
    kind: OpKind,
    pub(crate) statements: Vec<Prepared<S>>,
}

impl<S> Operation<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn mode(&self) -> XMode {
        self.mode
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// The discipline the operation actually runs under. Delete-all has no
    /// per-key form and always runs in bulk.
    pub fn discipline(&self) -> XMode {
        match self.kind {
            OpKind::DeleteAll => XMode::Bulk,
            _ => self.mode,
        }
    }

    pub fn specs(&self) -> impl Iterator<Item = &StatementSpec> {
        self.statements.iter().map(|p| &p.spec)
    }
}

/// Every operation of one benchmark connection, in execution order.
///
/// A catalog owns prepared statements of one backend session and must be
/// handed back to it through [`Catalog::close`].
#[derive(Debug)]
pub struct Catalog<S> {
    operations: Vec<Operation<S>>,
    closed: bool,
}

impl<S> Catalog<S> {
    /// Builds the standard catalog for `settings`.
    pub fn build<B>(backend: &mut B, settings: &CatalogSettings) -> Result<Self, CatalogError>
    where
        B: Backend<Statement = S>,
    {
        Self::from_templates(backend, &templates(settings), settings)
    }

    /// Crosses `templates` with the enabled modes and prepares everything.
    /// On error every statement prepared so far is released.
    pub fn from_templates<B>(
        backend: &mut B,
        templates: &[Template],
        settings: &CatalogSettings,
    ) -> Result<Self, CatalogError>
    where
        B: Backend<Statement = S>,
    {
        let mut catalog = Catalog {
            operations: Vec::new(),
            closed: false,
        };
        let mut names = HashSet::new();

        for &mode in &settings.modes {
            for template in templates {
                let name = format!("{}_{}", template.base, mode.label());
                if !settings.selects(&name, &template.base) {
                    continue;
                }
                let specs = template.kind.statements(template.entity);
                if let Some(spec) = specs.iter().find(|s| !backend.supports(s)) {
                    debug!(operation = %name, statement = %spec, "backend does not support operation, skipped");
                    continue;
                }
                if !names.insert(name.clone()) {
                    catalog.release_all(backend);
                    return Err(CatalogError::DuplicateName(name));
                }

                let mut statements = Vec::with_capacity(specs.len());
                for spec in specs {
                    match spec.validate().and_then(|_| backend.prepare(&spec)) {
                        Ok(handle) => statements.push(Prepared { spec, handle }),
                        Err(source) => {
                            release_statements(backend, statements);
                            catalog.release_all(backend);
                            return Err(CatalogError::Prepare {
                                operation: name,
                                source,
                            });
                        }
                    }
                }

                catalog.operations.push(Operation {
                    name,
                    base: template.base.clone(),
                    mode,
                    entity: template.entity,
                    kind: template.kind,
                    statements,
                });
            }
        }

        debug!(backend = backend.name(), operations = catalog.len(), "catalog built");
        Ok(catalog)
    }

    pub fn operations(&self) -> &[Operation<S>] {
        &self.operations
    }

    pub fn names(&self) -> Vec<&str> {
        self.operations.iter().map(|o| o.name()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Operation<S>> {
        self.operations.iter().find(|o| o.name == name)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases every prepared statement. Closing twice is a no-op.
    ///
    /// Every statement is released even if some releases fail; the first
    /// failure is returned.
    pub fn close<B>(&mut self, backend: &mut B) -> Result<(), StoreError>
    where
        B: Backend<Statement = S>,
    {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first = None;
        for op in self.operations.drain(..) {
            for p in op.statements {
                if let Err(e) = backend.release(p.handle) {
                    first.get_or_insert(e);
                }
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn release_all<B>(&mut self, backend: &mut B)
    where
        B: Backend<Statement = S>,
    {
        if let Err(e) = self.close(backend) {
            warn!(error = %e, "failed to release statement");
        }
    }
}

fn release_statements<B: Backend>(backend: &mut B, statements: Vec<Prepared<B::Statement>>) {
    for p in statements {
        if let Err(e) = backend.release(p.handle) {
            warn!(statement = %p.spec, error = %e, "failed to release statement");
        }
    }
}

impl<S> Drop for Catalog<S> {
    fn drop(&mut self) {
        if !self.closed && !self.operations.is_empty() {
            warn!(
                operations = self.operations.len(),
                "catalog dropped without close, prepared statements leaked"
            );
            debug_assert!(std::thread::panicking(), "catalog dropped without close");
        }
    }
}
