// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Drives a whole benchmark against one backend: every operation size, every
//! warm-up and measured run, every catalog operation.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::catalog::{Catalog, CatalogSettings};
use crate::config::Config;
use crate::error::RunError;
use crate::executor::Executor;
use crate::metric::{CounterRecorder, TimerRecorder};
use crate::model::{Entity, KeySet};

/// Backend calls one operation made, summed over the measured runs.
#[derive(Debug, Clone, Serialize)]
pub struct OperationCounters {
    pub operation: String,
    pub counters: CounterRecorder,
}

/// Results for one operation size.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub n_ops: usize,
    pub timers: TimerRecorder,
    pub counters: Vec<OperationCounters>,
}

impl RoundReport {
    fn new(n_ops: usize) -> Self {
        Self {
            n_ops,
            timers: TimerRecorder::default(),
            counters: Vec::new(),
        }
    }

    fn record(&mut self, operation: &str, elapsed: Duration, delta: CounterRecorder) {
        self.timers.record(operation, elapsed);
        match self.counters.iter_mut().find(|c| c.operation == operation) {
            Some(c) => c.counters += delta,
            None => self.counters.push(OperationCounters {
                operation: operation.to_string(),
                counters: delta,
            }),
        }
    }

    /// Total elapsed microseconds of every operation, per measured run.
    pub fn run_sums(&self) -> Vec<u64> {
        let runs = self
            .timers
            .timers()
            .iter()
            .map(|t| t.runs().len())
            .max()
            .unwrap_or(0);
        (0..runs)
            .map(|i| {
                self.timers
                    .timers()
                    .iter()
                    .filter_map(|t| t.runs().get(i))
                    .sum()
            })
            .collect()
    }
}

/// Everything one backend's benchmark produced.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub backend: String,
    pub started: String,
    pub log_sum_of_ops: bool,
    pub rounds: Vec<RoundReport>,
}

impl BenchReport {
    fn new(backend: &str, log_sum_of_ops: bool) -> Self {
        Self {
            backend: backend.to_string(),
            started: chrono::Local::now().to_rfc3339(),
            log_sum_of_ops,
            rounds: Vec::new(),
        }
    }

    /// Writes `<backend>.json` and `<backend>.log` into `dir`.
    pub fn write_to(&self, dir: &Path) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let json = fs::File::create(dir.join(format!("{}.json", self.backend)))?;
        serde_json::to_writer_pretty(io::BufWriter::new(json), self)?;
        let mut log = io::BufWriter::new(fs::File::create(
            dir.join(format!("{}.log", self.backend)),
        )?);
        write!(log, "{self}")?;
        log.flush()
    }

    /// Writes the report under `results_dir/<date>/<time>/`, returning that
    /// directory.
    pub fn write(&self, results_dir: &Path) -> io::Result<PathBuf> {
        let dir = results_dir.join(
            chrono::Local::now()
                .format("%Y-%m-%d/%H-%M-%S")
                .to_string(),
        );
        self.write_to(&dir)?;
        Ok(dir)
    }
}

/// Tab separated table per round: one line per operation, one column per
/// measured run, in microseconds.
impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for round in &self.rounds {
            let runs = round.run_sums().len();
            writeln!(f, "[{}] n_ops={}", self.backend, round.n_ops)?;
            write!(f, "operation")?;
            for i in 0..runs {
                write!(f, "\trun{}", i + 1)?;
            }
            writeln!(f)?;
            for timer in round.timers.timers() {
                write!(f, "{}", timer.name())?;
                for us in timer.runs() {
                    write!(f, "\t{us}")?;
                }
                writeln!(f)?;
            }
            if self.log_sum_of_ops {
                write!(f, "sum")?;
                for us in round.run_sums() {
                    write!(f, "\t{us}")?;
                }
                writeln!(f)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Runs the whole benchmark against backend `B`.
///
/// The first failing operation stops the run; the error carries the
/// operation name, mode and key. The catalog is closed on every path.
pub fn run_benchmark<B: Backend>(config: &Config) -> Result<BenchReport, RunError> {
    config.validate()?;
    let settings = CatalogSettings::from(config);

    let mut session = Session::<B>::open(config, &settings)?;
    let mut report = BenchReport::new(session.executor.backend().name(), config.log_sum_of_ops);
    info!(
        backend = %report.backend,
        operations = session.catalog.len(),
        "benchmark started"
    );

    let total_runs = config.warmup_runs + config.n_runs;
    let mut first = true;
    for n_ops in config.op_sizes() {
        let keys = KeySet::new(n_ops);
        let mut round = RoundReport::new(n_ops);

        for run in 0..total_runs {
            let measured = run >= config.warmup_runs;
            if !first {
                session = session.renew(config, &settings)?;
            }
            first = false;

            info!(
                backend = %report.backend,
                n_ops,
                run,
                warmup = !measured,
                "run started"
            );
            let outcome = session.run(&keys, measured.then_some(&mut round));
            if let Err(e) = outcome {
                if let Err(close) = session.close() {
                    warn!(backend = %report.backend, error = %close, "failed to close catalog");
                }
                return Err(e);
            }
        }

        report.rounds.push(round);
    }

    session.close()?;
    info!(backend = %report.backend, "benchmark finished");
    Ok(report)
}

/// One backend connection with the catalog prepared on it.
struct Session<B: Backend> {
    executor: Executor<B>,
    catalog: Catalog<B::Statement>,
}

impl<B: Backend> Session<B> {
    fn open(config: &Config, settings: &CatalogSettings) -> Result<Self, RunError> {
        let mut executor = Executor::new(B::open(config).map_err(RunError::Open)?);
        let catalog = Catalog::build(executor.backend_mut(), settings)?;
        Ok(Self { executor, catalog })
    }

    /// Releases the catalog; the connection closes when `self` drops.
    fn close(mut self) -> Result<(), RunError> {
        self.catalog
            .close(self.executor.backend_mut())
            .map_err(RunError::Store)
    }

    /// Reopens the connection or rebuilds the catalog between runs, as
    /// configured. The old connection is gone before the new one opens.
    fn renew(mut self, config: &Config, settings: &CatalogSettings) -> Result<Self, RunError> {
        if config.renew_connection {
            debug!("reopening backend");
            self.close()?;
            return Self::open(config, settings);
        }
        if config.renew_operations {
            debug!("rebuilding catalog");
            self.catalog
                .close(self.executor.backend_mut())
                .map_err(RunError::Store)?;
            self.catalog = Catalog::build(self.executor.backend_mut(), settings)?;
        }
        Ok(self)
    }

    /// Clears both tables, then executes every catalog operation once,
    /// recording into `round` when given.
    fn run(&mut self, keys: &KeySet, mut round: Option<&mut RoundReport>) -> Result<(), RunError> {
        for entity in [Entity::B, Entity::A] {
            let removed = self
                .executor
                .delete_all(entity)
                .map_err(RunError::Store)?;
            if removed > 0 {
                debug!(%entity, removed, "cleared table");
            }
        }

        for op in self.catalog.operations() {
            let before = self.executor.counters().clone();
            let start = Instant::now();
            let outcome = self.executor.execute(op, keys);
            let elapsed = start.elapsed();
            if let Err(e) = outcome {
                error!(
                    backend = self.executor.backend().name(),
                    operation = e.operation(),
                    mode = %e.mode(),
                    key = ?e.key(),
                    error = %e,
                    "operation failed"
                );
                return Err(e.into());
            }
            debug!(operation = op.name(), elapsed_us = elapsed.as_micros() as u64);
            if let Some(round) = round.as_deref_mut() {
                round.record(op.name(), elapsed, self.executor.counters() - &before);
            }
        }
        Ok(())
    }
}
