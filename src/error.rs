// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::path::PathBuf;

use thiserror::Error;

use crate::catalog::XMode;
use crate::model::{Column, Entity, Id, Value};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("unknown batching mode `{0}`, expected one of indy, each, bulk")]
    UnknownMode(String),

    #[error("unknown charset `{0}`, expected utf8 or latin1")]
    UnknownCharset(String),

    #[error("invalid operation size: {0}")]
    OperationSize(String),

    #[error("invalid run count: {0}")]
    RunCount(String),

    #[error("invalid batching modes: {0}")]
    Modes(String),

    #[error("invalid field length: {0}")]
    FieldLength(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer truncated: needed {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("{column} length {len} exceeds maximum {max}")]
    TooLong { column: Column, len: usize, max: usize },

    #[error("character {0:?} cannot be encoded as latin1")]
    Unmappable(char),

    #[error("invalid utf8 in {0}")]
    InvalidUtf8(Column),

    #[error("unexpected trailing bytes: {0}")]
    Trailing(usize),

    #[error("null bitmap {0:#010b} names columns the entity does not have")]
    Bitmap(u8),

    #[error("i/o error: {0:?}")]
    Io(std::io::ErrorKind),
}

impl From<std::io::Error> for CodecError {
    fn from(e: std::io::Error) -> Self {
        CodecError::Io(e.kind())
    }
}

/// Errors raised by a backend while preparing or executing statements.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("duplicate key {id} in {entity}")]
    DuplicateKey { entity: Entity, id: Id },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("unsupported statement: {0}")]
    Unsupported(String),

    #[error("invalid statement: {0}")]
    InvalidStatement(String),

    #[error("expected {expected} values, got {actual}")]
    Arity { expected: usize, actual: usize },

    #[error("{column} cannot hold {value:?}")]
    ColumnType { column: Column, value: Value },

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to prepare `{operation}`: {source}")]
    Prepare {
        operation: String,
        #[source]
        source: StoreError,
    },

    #[error("duplicate operation name `{0}`")]
    DuplicateName(String),
}

/// The first invariant a dispatch found violated.
#[derive(Debug, Clone, PartialEq)]
pub enum Violation {
    Missing,
    Identity { expected: Id, actual: Id },
    Attribute { column: Column, expected: Value, actual: Value },
    Affected { expected: u64, actual: u64 },
    RowCount { expected: usize, actual: usize },
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Violation::Missing => write!(f, "record not found"),
            Violation::Identity { expected, actual } => {
                write!(f, "identity expected {expected}, got {actual}")
            }
            Violation::Attribute {
                column,
                expected,
                actual,
            } => write!(f, "{column} expected {expected}, got {actual}"),
            Violation::Affected { expected, actual } => {
                write!(f, "affected rows expected {expected}, got {actual}")
            }
            Violation::RowCount { expected, actual } => {
                write!(f, "fetched rows expected {expected}, got {actual}")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{operation} [{mode}] failed{}: {source}", at_key(.key))]
    Backend {
        operation: String,
        mode: XMode,
        key: Option<Id>,
        #[source]
        source: StoreError,
    },

    #[error("{operation} [{mode}] verification failed{}: {violation}", at_key(.key))]
    Verify {
        operation: String,
        mode: XMode,
        key: Option<Id>,
        violation: Violation,
    },
}

fn at_key(key: &Option<Id>) -> String {
    key.map(|k| format!(" at key {k}")).unwrap_or_default()
}

impl ExecError {
    pub fn operation(&self) -> &str {
        match self {
            ExecError::Backend { operation, .. } | ExecError::Verify { operation, .. } => {
                operation
            }
        }
    }

    pub fn mode(&self) -> XMode {
        match self {
            ExecError::Backend { mode, .. } | ExecError::Verify { mode, .. } => *mode,
        }
    }

    pub fn key(&self) -> Option<Id> {
        match self {
            ExecError::Backend { key, .. } | ExecError::Verify { key, .. } => *key,
        }
    }

    pub fn violation(&self) -> Option<&Violation> {
        match self {
            ExecError::Verify { violation, .. } => Some(violation),
            ExecError::Backend { .. } => None,
        }
    }
}

/// Anything that stops a backend's benchmark run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open backend: {0}")]
    Open(#[source] StoreError),

    #[error("backend error: {0}")]
    Store(#[source] StoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("failed to write results: {0}")]
    Report(#[from] std::io::Error),
}
