use std::time::Duration;

use crate::error::{JmError, Result};
use crate::regs::MAX_JOB_SLOTS;

pub const DEFAULT_RESET_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_ZAP_TIMEOUT: Duration = Duration::from_millis(2000);
pub const DEFAULT_IRQ_THROTTLE_TIME: Duration = Duration::from_micros(20);
pub const DEFAULT_IRQ_THROTTLE_CYCLES: u32 = 10_000;
pub const DEFAULT_THREAD_PRIORITY: u8 = 8;

#[derive(Clone, Debug)]
pub struct JmConfig {
    pub nr_slots: usize,
    /// How long a committed reset waits for soft-stopped jobs to leave the GPU.
    pub reset_timeout: Duration,
    /// How long context teardown waits before escalating to a reset.
    pub zap_timeout: Duration,
    /// Interrupt coalescing window; subtracted from the IRQ time when refining start timestamps.
    pub irq_throttle_time: Duration,
    /// Value programmed into `JOB_IRQ_THROTTLE` on every job interrupt.
    pub irq_throttle_cycles: u32,
    /// The GPU is IO-coherent: skip the start/end cache flushes in `JS_CONFIG`.
    pub coherent: bool,
    pub thread_priority: u8,
}

impl Default for JmConfig {
    fn default() -> Self {
        Self {
            nr_slots: 3,
            reset_timeout: DEFAULT_RESET_TIMEOUT,
            zap_timeout: DEFAULT_ZAP_TIMEOUT,
            irq_throttle_time: DEFAULT_IRQ_THROTTLE_TIME,
            irq_throttle_cycles: DEFAULT_IRQ_THROTTLE_CYCLES,
            coherent: false,
            thread_priority: DEFAULT_THREAD_PRIORITY,
        }
    }
}

impl JmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.nr_slots == 0 || self.nr_slots > MAX_JOB_SLOTS {
            return Err(JmError::InvalidConfig("nr_slots must be in 1..=16"));
        }
        if self.reset_timeout.is_zero() {
            return Err(JmError::InvalidConfig("reset_timeout must be non-zero"));
        }
        if self.zap_timeout.is_zero() {
            return Err(JmError::InvalidConfig("zap_timeout must be non-zero"));
        }
        if self.thread_priority > 0xF {
            return Err(JmError::InvalidConfig("thread_priority must fit in 4 bits"));
        }
        Ok(())
    }
}
