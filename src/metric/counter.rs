// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::metric::RecorderImpl;
use serde::{ser::SerializeMap, Serialize, Serializer};
use variant_count::VariantCount;

/// Calls the executor made into a backend.
#[repr(u8)]
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, VariantCount)]
pub enum Counter {
    Begin = 0,
    Commit = 1,
    Rollback = 2,
    Close = 3,
    Flush = 4,
    IssueOne = 5,
    IssueMany = 6,
    IssueUnkeyed = 7,
    FetchOne = 8,
    FetchMany = 9,
}

impl Counter {
    pub const ALL: [Counter; Counter::VARIANT_COUNT] = [
        Counter::Begin,
        Counter::Commit,
        Counter::Rollback,
        Counter::Close,
        Counter::Flush,
        Counter::IssueOne,
        Counter::IssueMany,
        Counter::IssueUnkeyed,
        Counter::FetchOne,
        Counter::FetchMany,
    ];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRecorder {
    counters: [u64; Counter::VARIANT_COUNT],
}

impl Default for CounterRecorder {
    fn default() -> Self {
        Self {
            counters: [0; Counter::VARIANT_COUNT],
        }
    }
}

impl CounterRecorder {
    const LENGTH: usize = Counter::VARIANT_COUNT;

    pub fn increment(&mut self, event: Counter, amount: u64) {
        self.counters[event as usize] += amount;
    }

    pub fn get(&self, event: Counter) -> u64 {
        self.counters[event as usize]
    }

    /// Backend calls that cost a round trip: everything but `Close`.
    pub fn round_trips(&self) -> u64 {
        Counter::ALL
            .iter()
            .filter(|c| **c != Counter::Close)
            .map(|c| self.get(*c))
            .sum()
    }
}

impl Serialize for CounterRecorder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_map(Some(Self::LENGTH))?;
        for key in Counter::ALL {
            state.serialize_key(&format!("{key:?}"))?;
            state.serialize_value(&self.get(key))?;
        }
        state.end()
    }
}

impl RecorderImpl for CounterRecorder {
    fn reset(&mut self) {
        for i in self.counters.iter_mut() {
            *i = 0;
        }
    }
}

use auto_ops::impl_op_ex;

impl_op_ex!(+= |a: &mut CounterRecorder, b: &CounterRecorder| {
    for i in 0..CounterRecorder::LENGTH {
        a.counters[i] += b.counters[i];
    }
});

impl_op_ex!(+ |a: &CounterRecorder, b: &CounterRecorder| -> CounterRecorder {
    let mut c_a = a.clone();
    c_a += b;
    c_a
});

impl_op_ex!(-|a: &CounterRecorder, b: &CounterRecorder| -> CounterRecorder {
    let mut c_a = a.clone();
    for i in 0..CounterRecorder::LENGTH {
        c_a.counters[i] = c_a.counters[i].saturating_sub(b.counters[i]);
    }
    c_a
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_and_round_trips() {
        let mut a = CounterRecorder::default();
        a.increment(Counter::Begin, 2);
        a.increment(Counter::Close, 2);
        a.increment(Counter::FetchMany, 1);

        let mut b = a.clone();
        b.increment(Counter::Commit, 2);

        let delta = &b - &a;
        assert_eq!(delta.get(Counter::Commit), 2);
        assert_eq!(delta.get(Counter::Begin), 0);
        assert_eq!(a.round_trips(), 3);

        let sum = &a + &b;
        assert_eq!(sum.get(Counter::Begin), 4);

        a.reset();
        assert_eq!(a, CounterRecorder::default());
    }

    #[test]
    fn serializes_by_name() {
        let mut c = CounterRecorder::default();
        c.increment(Counter::Flush, 5);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["Flush"], 5);
        assert_eq!(json["Begin"], 0);
    }
}
