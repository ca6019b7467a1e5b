use std::time::Instant;

use once_cell::sync::Lazy;

use crate::error::RuntimeError;
use crate::objects::object_native_function::{NativeObject, NativeReturn};
use crate::value::Value;
use crate::vm::NativeCtx;

static PROCESS_EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// `clock()`: seconds elapsed since the process first observed the clock.
pub struct ClockTime;

impl ClockTime {
    pub fn new() -> ClockTime {
        ClockTime {}
    }
}

impl NativeObject for ClockTime {
    fn invoke(&self, _ctx: &mut NativeCtx<'_>) -> Result<NativeReturn, RuntimeError> {
        let elapsed = PROCESS_EPOCH.elapsed().as_secs_f64();
        Ok(NativeReturn::Values(vec![Value::Number(elapsed)]))
    }
}

impl Default for ClockTime {
    fn default() -> Self {
        ClockTime::new()
    }
}
