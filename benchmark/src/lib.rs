// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fmt;
use std::fs;
use std::path::Path;

#[cfg(not(all(feature = "redb", feature = "sqlite")))]
use anyhow::bail;
use anyhow::Context;
use crund::{run_benchmark, BenchReport, Config, MemoryStore};
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod wrappers;

/// Data access layers the `crund` binary can drive.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SystemUnderTest {
    Memory,
    Redb,
    Sqlite,
}

impl SystemUnderTest {
    pub fn label(self) -> &'static str {
        match self {
            SystemUnderTest::Memory => "memory",
            SystemUnderTest::Redb => "redb",
            SystemUnderTest::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for SystemUnderTest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Gives every file-backed system its own store next to `file_path`,
/// removing whatever an earlier benchmark left there.
fn store_config(sut: SystemUnderTest, config: &Config) -> anyhow::Result<Config> {
    let path = config.get_file_path();
    if sut == SystemUnderTest::Memory || path == Path::new(":memory:") {
        return Ok(config.clone());
    }
    let path = path.with_extension(sut.label());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating store directory {}", parent.display()))?;
    }
    _ = fs::remove_file(&path);
    _ = fs::remove_dir_all(&path);

    let mut config = config.clone();
    config.file_path(path);
    Ok(config)
}

/// Runs the full benchmark against one system.
pub fn run_crund_bench(sut: SystemUnderTest, config: &Config) -> anyhow::Result<BenchReport> {
    let config = store_config(sut, config)?;
    info!(%sut, file_path = %config.get_file_path().display(), "starting benchmark");
    let report = match sut {
        SystemUnderTest::Memory => run_benchmark::<MemoryStore>(&config)?,
        SystemUnderTest::Redb => {
            #[cfg(feature = "redb")]
            {
                use crate::wrappers::RedbWrapper;
                run_benchmark::<RedbWrapper>(&config)?
            }
            #[cfg(not(feature = "redb"))]
            {
                bail!("redb is not enabled in the build, run with --features `redb`!")
            }
        }
        SystemUnderTest::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                use crate::wrappers::SqliteWrapper;
                run_benchmark::<SqliteWrapper>(&config)?
            }
            #[cfg(not(feature = "sqlite"))]
            {
                bail!("sqlite is not enabled in the build, run with --features `sqlite`!")
            }
        }
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backed_systems_get_their_own_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().join("data").join("crund.db"), 10);
        config.n_runs(1);

        let redb = store_config(SystemUnderTest::Redb, &config).unwrap();
        assert_eq!(
            redb.get_file_path(),
            dir.path().join("data").join("crund.redb")
        );
        assert!(dir.path().join("data").is_dir());

        let memory = store_config(SystemUnderTest::Memory, &config).unwrap();
        assert_eq!(memory.get_file_path(), config.get_file_path());
    }

    #[test]
    #[cfg(all(feature = "redb", feature = "sqlite"))]
    fn every_system_completes_a_small_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::new(dir.path().join("crund.db"), 5);
        config.max_varbinary_bytes(10).max_varchar_chars(10);
        for sut in [
            SystemUnderTest::Memory,
            SystemUnderTest::Redb,
            SystemUnderTest::Sqlite,
        ] {
            let report = run_crund_bench(sut, &config).unwrap();
            assert_eq!(report.backend, sut.label());
            assert_eq!(report.rounds.len(), 1);
        }
    }
}
