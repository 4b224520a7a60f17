//! Performance-counter capture state as seen by the reset path.
//!
//! The capture layer drives [`InstrState`] through [`Instrumentation`]. A GPU reset clears the
//! counter registers, so the reset worker snapshots the counter setup before the reset, restores it
//! afterwards, and puts the state machine back where it was (waking anyone who was waiting on a
//! dump or cache clean that the reset cut short).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{debug, error};

use crate::atom::ContextId;
use crate::caps::{GpuCaps, HwIssue};
use crate::context::Context;
use crate::platform::RegisterIo;
use crate::regs::{gpu_control, gpu_control_reg, prfcnt};
use crate::sync::{lock, wait_timeout_while, wait_while};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrState {
    Disabled,
    Idle,
    Dumping,
    RequestClean,
    Cleaning,
    Cleaned,
    Resetting,
    Fault,
}

/// Counter registers that do not survive a reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HwcntSetup {
    pub dump_buffer: u64,
    pub jm_bm: u32,
    pub shader_bm: u32,
    pub tiler_bm: u32,
    pub mmu_l2_bm: u32,
}

impl HwcntSetup {
    pub fn read(regs: &dyn RegisterIo) -> Self {
        let lo = regs.read(gpu_control_reg(gpu_control::PRFCNT_BASE_LO));
        let hi = regs.read(gpu_control_reg(gpu_control::PRFCNT_BASE_HI));
        Self {
            dump_buffer: u64::from(lo) | (u64::from(hi) << 32),
            jm_bm: regs.read(gpu_control_reg(gpu_control::PRFCNT_JM_EN)),
            shader_bm: regs.read(gpu_control_reg(gpu_control::PRFCNT_SHADER_EN)),
            tiler_bm: regs.read(gpu_control_reg(gpu_control::PRFCNT_TILER_EN)),
            mmu_l2_bm: regs.read(gpu_control_reg(gpu_control::PRFCNT_MMU_L2_EN)),
        }
    }

    /// Reprograms the counters for address space `as_nr` and re-enables manual dumping.
    pub fn restore(&self, regs: &dyn RegisterIo, caps: GpuCaps, as_nr: u8) {
        let as_field = u32::from(as_nr) << prfcnt::AS_SHIFT;
        let write = |offset, value| regs.write(gpu_control_reg(offset), value);
        let tiler_workaround = caps.has_issue(HwIssue::ISSUE_8186);

        write(gpu_control::PRFCNT_CONFIG, as_field | prfcnt::MODE_OFF);
        write(gpu_control::PRFCNT_BASE_LO, self.dump_buffer as u32);
        write(gpu_control::PRFCNT_BASE_HI, (self.dump_buffer >> 32) as u32);
        write(gpu_control::PRFCNT_JM_EN, self.jm_bm);
        write(gpu_control::PRFCNT_SHADER_EN, self.shader_bm);
        write(gpu_control::PRFCNT_MMU_L2_EN, self.mmu_l2_bm);

        // The tiler counters must be off while manual mode is armed.
        if tiler_workaround {
            write(gpu_control::PRFCNT_TILER_EN, 0);
        } else {
            write(gpu_control::PRFCNT_TILER_EN, self.tiler_bm);
        }

        write(gpu_control::PRFCNT_CONFIG, as_field | prfcnt::MODE_MANUAL);

        if tiler_workaround {
            write(gpu_control::PRFCNT_TILER_EN, self.tiler_bm);
        }
    }
}

#[derive(Debug)]
struct Owner {
    ctx: Arc<Context>,
    as_nr: u8,
}

#[derive(Debug)]
struct InstrInner {
    state: InstrState,
    triggered: bool,
    owner: Option<Owner>,
}

/// What the reset worker carries across the physical reset.
#[derive(Debug)]
pub(crate) struct InstrSnapshot {
    backup: InstrState,
    saved: Option<(HwcntSetup, u8)>,
}

#[derive(Debug)]
pub struct Instrumentation {
    inner: Mutex<InstrInner>,
    wait: Condvar,
    cache_clean_wait: Condvar,
}

impl Default for Instrumentation {
    fn default() -> Self {
        Self::new()
    }
}

impl Instrumentation {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InstrInner {
                state: InstrState::Disabled,
                triggered: false,
                owner: None,
            }),
            wait: Condvar::new(),
            cache_clean_wait: Condvar::new(),
        }
    }

    /// Hands the counters to `ctx`, bound to address space `as_nr`.
    pub fn enable(&self, ctx: Arc<Context>, as_nr: u8) {
        let mut inner = lock(&self.inner);
        debug!(ctx = %ctx.id(), as_nr, "instrumentation enabled");
        inner.owner = Some(Owner { ctx, as_nr });
        inner.state = InstrState::Idle;
    }

    pub fn disable(&self) {
        let mut inner = lock(&self.inner);
        inner.owner = None;
        inner.state = InstrState::Disabled;
        inner.triggered = true;
        self.wait.notify_all();
    }

    pub fn state(&self) -> InstrState {
        lock(&self.inner).state
    }

    pub fn owner(&self) -> Option<ContextId> {
        lock(&self.inner).owner.as_ref().map(|o| o.ctx.id())
    }

    pub fn set_state(&self, state: InstrState) {
        let mut inner = lock(&self.inner);
        inner.state = state;
        match state {
            InstrState::Dumping => inner.triggered = false,
            InstrState::Idle | InstrState::Fault => {
                inner.triggered = true;
                self.wait.notify_all();
            }
            InstrState::Cleaned => self.cache_clean_wait.notify_all(),
            _ => {}
        }
    }

    /// Waits for a dump to finish. Returns `false` on timeout.
    pub fn wait_triggered(&self, timeout: Duration) -> bool {
        let inner = lock(&self.inner);
        let (_inner, timed_out) =
            wait_timeout_while(&self.wait, inner, timeout, |i| !i.triggered);
        !timed_out
    }

    /// Waits for an in-flight cache clean to settle and returns the resulting state.
    pub fn wait_clean(&self, timeout: Duration) -> InstrState {
        let inner = lock(&self.inner);
        let (inner, _) = wait_timeout_while(&self.cache_clean_wait, inner, timeout, |i| {
            matches!(
                i.state,
                InstrState::RequestClean | InstrState::Cleaning | InstrState::Resetting
            )
        });
        inner.state
    }

    /// Reads the counter setup if the owning context is still scheduled.
    pub fn save_setup(&self, regs: &dyn RegisterIo) -> Option<(HwcntSetup, u8)> {
        owner_setup(&lock(&self.inner), regs)
    }

    pub(crate) fn begin_reset(&self, regs: &dyn RegisterIo) -> InstrSnapshot {
        let inner = lock(&self.inner);
        // Another reset path may already own the counters.
        let mut inner = wait_while(&self.wait, inner, |i| {
            i.state == InstrState::Resetting && !i.triggered
        });

        let saved = owner_setup(&inner, regs);

        let backup = inner.state;
        inner.state = InstrState::Resetting;
        inner.triggered = false;
        InstrSnapshot { backup, saved }
    }

    pub(crate) fn finish_reset(&self, regs: &dyn RegisterIo, caps: GpuCaps, snapshot: InstrSnapshot) {
        let mut inner = lock(&self.inner);

        if let Some((setup, as_nr)) = snapshot.saved {
            setup.restore(regs, caps, as_nr);
        }

        inner.state = snapshot.backup;
        match inner.state {
            InstrState::Cleaned | InstrState::RequestClean => self.cache_clean_wait.notify_all(),
            InstrState::Cleaning => {
                inner.state = InstrState::Cleaned;
                self.cache_clean_wait.notify_all();
            }
            InstrState::Dumping => {
                inner.state = InstrState::Idle;
                inner.triggered = true;
                self.wait.notify_all();
            }
            InstrState::Disabled | InstrState::Idle | InstrState::Fault => {
                inner.triggered = true;
                self.wait.notify_all();
            }
            InstrState::Resetting => {
                error!("instrumentation was already resetting before the GPU reset");
                inner.state = InstrState::Idle;
                inner.triggered = true;
                self.wait.notify_all();
            }
        }
    }
}

fn owner_setup(inner: &InstrInner, regs: &dyn RegisterIo) -> Option<(HwcntSetup, u8)> {
    match &inner.owner {
        Some(owner) if owner.ctx.is_scheduled() => Some((HwcntSetup::read(regs), owner.as_nr)),
        _ => None,
    }
}
