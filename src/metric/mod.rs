// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use serde::Serialize;

pub(crate) mod counter;
pub mod timer;

pub use counter::{Counter, CounterRecorder};
pub use timer::{OperationTimer, TimerRecorder};

pub trait RecorderImpl: Serialize + Sized {
    fn reset(&mut self);
}
