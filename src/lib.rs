// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![doc = include_str!("../README.md")]
mod backend;
mod catalog;
pub mod codec;
mod config;
mod driver;
mod error;
mod executor;
mod memory;
pub mod metric;
mod model;

#[cfg(test)]
mod tests;

pub use backend::{check_arity, Backend, Predicate, StatementSpec};
pub use catalog::{templates, Catalog, CatalogSettings, OpKind, Operation, Template, XMode};
pub use codec::{Charset, RowCodec, Transcoder};
pub use config::Config;
pub use driver::{run_benchmark, BenchReport, OperationCounters, RoundReport};
pub use error::{
    CatalogError, CodecError, ConfigError, ExecError, RunError, StoreError, Violation,
};
pub use executor::Executor;
pub use memory::{MemoryStats, MemoryStatement, MemoryStore, MemoryTx};
pub use model::{
    attr_values, length_variants, varbinary_value, varchar_value, Column, Entity, Id, KeySet,
    Row, Sign, Value,
};
