// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::HashMap;
use std::time::Duration;

use serde::{ser::SerializeStruct, Serialize, Serializer};

use tracing::warn;

use crate::metric::RecorderImpl;

const QUANTILE: [(&str, f64); 4] = [("50th", 0.5), ("90th", 0.9), ("99th", 0.99), ("99.9th", 0.999)];

/// Elapsed time of one operation over all measured runs, in microseconds.
#[derive(Clone, Debug)]
pub struct OperationTimer {
    name: String,
    runs: Vec<u64>,
    histogram: hdrhistogram::Histogram<u64>,
}

impl OperationTimer {
    fn new(name: &str) -> Self {
        let mut histogram = hdrhistogram::Histogram::<u64>::new(3)
            .expect("3 significant figures is a valid precision");
        histogram.auto(true);
        Self {
            name: name.to_string(),
            runs: Vec::new(),
            histogram,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.runs.push(micros);
        if let Err(e) = self.histogram.record(micros.max(1)) {
            warn!(operation = %self.name, micros, error = %e, "failed to record latency");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn runs(&self) -> &[u64] {
        &self.runs
    }

    pub fn mean(&self) -> f64 {
        if self.runs.is_empty() {
            return 0.0;
        }
        self.runs.iter().sum::<u64>() as f64 / self.runs.len() as f64
    }

    pub fn min(&self) -> u64 {
        self.runs.iter().copied().min().unwrap_or(0)
    }

    pub fn max(&self) -> u64 {
        self.runs.iter().copied().max().unwrap_or(0)
    }

    pub fn quantile(&self, q: f64) -> u64 {
        self.histogram.value_at_quantile(q)
    }
}

impl Serialize for OperationTimer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("timer", 5 + QUANTILE.len())?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("runs_us", &self.runs)?;
        state.serialize_field("min_us", &self.min())?;
        state.serialize_field("max_us", &self.max())?;
        state.serialize_field("mean_us", &self.mean())?;
        for (qs, q) in QUANTILE.iter() {
            state.serialize_field(qs, &self.quantile(*q))?;
        }
        state.end()
    }
}

/// Per-operation timers, kept in the order operations were first recorded.
#[derive(Clone, Debug, Default)]
pub struct TimerRecorder {
    timers: Vec<OperationTimer>,
    index: HashMap<String, usize>,
}

impl TimerRecorder {
    pub fn record(&mut self, operation: &str, elapsed: Duration) {
        let slot = match self.index.get(operation) {
            Some(slot) => *slot,
            None => {
                self.timers.push(OperationTimer::new(operation));
                self.index
                    .insert(operation.to_string(), self.timers.len() - 1);
                self.timers.len() - 1
            }
        };
        self.timers[slot].record(elapsed);
    }

    pub fn get(&self, operation: &str) -> Option<&OperationTimer> {
        self.index.get(operation).map(|slot| &self.timers[*slot])
    }

    pub fn timers(&self) -> &[OperationTimer] {
        &self.timers
    }
}

impl Serialize for TimerRecorder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.timers.serialize(serializer)
    }
}

impl RecorderImpl for TimerRecorder {
    fn reset(&mut self) {
        self.timers.clear();
        self.index.clear();
    }
}
