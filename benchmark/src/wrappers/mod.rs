// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#[cfg(feature = "redb")]
mod redb_wrapper;
#[cfg(feature = "sqlite")]
mod sqlite_wrapper;

#[cfg(feature = "redb")]
pub use redb_wrapper::RedbWrapper;
#[cfg(feature = "sqlite")]
pub use sqlite_wrapper::SqliteWrapper;

/// `file_path` value that selects a store kept in memory.
#[allow(dead_code)]
pub(crate) const IN_MEMORY: &str = ":memory:";
