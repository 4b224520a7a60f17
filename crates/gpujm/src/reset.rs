//! GPU reset state machine and worker.
//!
//! A reset moves through four states:
//!
//! ```text
//! NotPending --prepare--> Prepared --commit--> Committed --(watchdog | slots empty)--> Happening
//!      ^                                                                                  |
//!      +------------------------------------ worker done ---------------------------------+
//! ```
//!
//! Every edge is a compare-and-swap, so exactly one caller wins each step and at most one reset is
//! ever queued to the worker.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::atom::CompletionCode;
use crate::error::{JmError, Result};
use crate::manager::Inner;
use crate::regs::{
    gpu_control, gpu_control_reg, job_control, job_control_reg, job_slot_reg, mmu, mmu_reg, slot,
};
use crate::slots::Runpool;
use crate::stop::{StopFlags, StopKind};
use crate::sync::{lock, wait_timeout_while, wait_while};
use crate::timer::OneShotTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ResetState {
    NotPending = 0,
    /// All slots were soft-stopped; waiting for `commit_reset`.
    Prepared = 1,
    /// Watchdog armed; waiting for the slots to drain.
    Committed = 2,
    /// Queued to or running on the reset worker.
    Happening = 3,
}

impl ResetState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Prepared,
            2 => Self::Committed,
            3 => Self::Happening,
            _ => Self::NotPending,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ResetGate {
    state: AtomicU8,
    lock: Mutex<()>,
    idle: Condvar,
}

impl ResetGate {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(ResetState::NotPending as u8),
            lock: Mutex::new(()),
            idle: Condvar::new(),
        }
    }

    pub(crate) fn state(&self) -> ResetState {
        ResetState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn transition(&self, from: ResetState, to: ResetState) -> Result<()> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|actual| JmError::InvalidResetTransition {
                from: ResetState::from_raw(actual),
                to,
            })
    }

    /// Back to `NotPending`; wakes reset waiters.
    pub(crate) fn finish(&self) {
        {
            let _guard = lock(&self.lock);
            self.state
                .store(ResetState::NotPending as u8, Ordering::Release);
        }
        self.idle.notify_all();
    }

    pub(crate) fn wait_idle(&self) {
        let guard = lock(&self.lock);
        drop(wait_while(&self.idle, guard, |_| {
            self.state() != ResetState::NotPending
        }));
    }

    pub(crate) fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let guard = lock(&self.lock);
        let (_guard, timed_out) = wait_timeout_while(&self.idle, guard, timeout, |_| {
            self.state() != ResetState::NotPending
        });
        !timed_out
    }
}

/// Single worker thread that executes queued resets.
#[derive(Debug)]
pub(crate) struct ResetWorker {
    tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ResetWorker {
    pub(crate) fn new() -> Self {
        Self {
            tx: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, this: Weak<Inner>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("gpujm-reset".to_string())
            .spawn(move || {
                while rx.recv().is_ok() {
                    let Some(inner) = this.upgrade() else {
                        break;
                    };
                    inner.run_reset();
                }
                debug!("reset worker exiting");
            })
            .map_err(|source| JmError::Spawn {
                name: "gpujm-reset",
                source,
            })?;

        *lock(&self.tx) = Some(tx);
        *lock(&self.thread) = Some(handle);
        Ok(())
    }

    pub(crate) fn queue(&self) -> Result<()> {
        let tx = lock(&self.tx);
        let tx = tx.as_ref().ok_or(JmError::WorkerUnavailable)?;
        tx.send(()).map_err(|_| JmError::WorkerUnavailable)
    }

    pub(crate) fn stop(&self) {
        drop(lock(&self.tx).take());
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            // The worker may hold the last reference to the manager.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Inner {
    /// NotPending → Prepared. The winner soft-stops every slot.
    pub(crate) fn prepare_reset_locked(&self, rp: &mut Runpool) -> bool {
        if self
            .reset
            .transition(ResetState::NotPending, ResetState::Prepared)
            .is_err()
        {
            return false;
        }

        self.stats.inc_resets_prepared();
        self.disjoint.up();
        for slot in 0..rp.slots.len() {
            self.stop_locked(rp, slot, None, StopKind::Soft, StopFlags::empty());
        }
        true
    }

    /// Prepared → Committed, then arms the watchdog and tries the early path.
    pub(crate) fn commit_reset_locked(&self, rp: &mut Runpool) -> Result<()> {
        self.reset
            .transition(ResetState::Prepared, ResetState::Committed)?;

        error!(
            timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "preparing to soft-reset GPU: waiting for all jobs to complete soft-stop"
        );
        self.arm_watchdog();
        self.try_reset_early_locked(rp);
        Ok(())
    }

    fn arm_watchdog(&self) {
        let this = self.this.clone();
        let timer = OneShotTimer::start(
            "gpujm-reset-watchdog",
            self.config.reset_timeout,
            move || {
                if let Some(inner) = this.upgrade() {
                    inner.watchdog_expired();
                }
            },
        );

        match timer {
            Ok(timer) => {
                let stale = lock(&self.watchdog).replace(timer);
                drop(stale);
            }
            Err(err) => {
                error!(%err, "cannot arm reset watchdog; resetting now");
                self.watchdog_expired();
            }
        }
    }

    fn watchdog_expired(&self) {
        if self
            .reset
            .transition(ResetState::Committed, ResetState::Happening)
            .is_ok()
        {
            warn!("reset watchdog expired");
            self.stats.inc_watchdog_resets();
            self.queue_reset();
        }
    }

    pub(crate) fn try_reset_early(&self) {
        let rp = self.lock_runpool();
        self.try_reset_early_locked(&rp);
    }

    /// Committed → Happening once no slot holds an atom.
    fn try_reset_early_locked(&self, rp: &Runpool) {
        if self.reset.state() != ResetState::Committed || !rp.is_empty() {
            return;
        }
        if self
            .reset
            .transition(ResetState::Committed, ResetState::Happening)
            .is_ok()
        {
            debug!("all slots drained; resetting early");
            self.stats.inc_early_resets();
            self.queue_reset();
        }
    }

    fn queue_reset(&self) {
        if let Err(err) = self.worker.queue() {
            error!(%err, "cannot run GPU reset; abandoning it");
            self.disjoint.down();
            self.reset.finish();
        }
    }

    pub(crate) fn run_reset(&self) {
        let watchdog = lock(&self.watchdog).take();
        if let Some(timer) = watchdog {
            let pending = timer.cancel();
            debug!(fired = !pending, "reset watchdog cancelled");
        }

        if self.power.context_active_handle_suspend() {
            debug!("GPU idle or suspending; skipping reset");
            self.stats.inc_resets_aborted();
            self.disjoint.down();
            self.reset.finish();
            return;
        }

        self.irq_reset_flush.store(true, Ordering::Release);
        self.power.disable_interrupts();
        self.power.synchronize_irqs();
        self.mmu.flush_workqueues();
        self.irq_reset_flush.store(false, Ordering::Release);

        error!(
            timeout_ms = self.config.reset_timeout.as_millis() as u64,
            "resetting GPU"
        );
        let snapshot = self.instr.begin_reset(&*self.regs);
        self.dump_registers();

        let end_timestamp = Instant::now();
        if let Err(err) = self.power.reset_hw() {
            error!(%err, "hardware reset failed");
        }

        {
            let mut rp = self.lock_runpool();
            for js in 0..rp.slots.len() {
                while !rp.slots[js].atoms.is_empty() {
                    self.complete_hw_locked(
                        &mut rp,
                        js,
                        CompletionCode::Cancelled,
                        None,
                        end_timestamp,
                    );
                }
            }
        }

        for as_nr in 0..self.mmu.nr_address_spaces() {
            match self.mmu.bound_context(as_nr) {
                Some(ctx) => self.mmu.update(as_nr, ctx),
                None => self.mmu.disable(as_nr),
            }
        }

        self.power.enable_interrupts();
        self.disjoint.down();
        self.reset.finish();
        error!("reset complete");

        let try_schedule = self.dispatch.has_pullable_contexts() && !self.power.poweroff_pending();

        self.instr.finish_reset(&*self.regs, self.caps, snapshot);
        self.power.update_cores_state_sync();
        if try_schedule {
            self.dispatch.schedule_all();
        }
        self.power.context_idle();
        self.stats.inc_resets_completed();
    }

    fn dump_registers(&self) {
        let reg = |offset: u32| format!("{:#010x}", self.regs.read(offset));

        error!("register state:");
        error!(
            rawstat = %reg(job_control_reg(job_control::JOB_IRQ_RAWSTAT)),
            js_state = %reg(job_control_reg(job_control::JOB_IRQ_JS_STATE)),
            "job irq"
        );
        for js in 0..self.config.nr_slots {
            error!(
                slot = js,
                status = %reg(job_slot_reg(js, slot::STATUS)),
                head_lo = %reg(job_slot_reg(js, slot::HEAD_LO)),
                head_hi = %reg(job_slot_reg(js, slot::HEAD_HI)),
                "job slot"
            );
        }
        error!(
            mmu_rawstat = %reg(mmu_reg(mmu::MMU_IRQ_RAWSTAT)),
            gpu_faultstatus = %reg(gpu_control_reg(gpu_control::GPU_FAULTSTATUS)),
            "faults"
        );
        error!(
            gpu = %reg(gpu_control_reg(gpu_control::GPU_IRQ_MASK)),
            job = %reg(job_control_reg(job_control::JOB_IRQ_MASK)),
            mmu = %reg(mmu_reg(mmu::MMU_IRQ_MASK)),
            "irq masks"
        );
        error!(
            pwr_override0 = %reg(gpu_control_reg(gpu_control::PWR_OVERRIDE0)),
            pwr_override1 = %reg(gpu_control_reg(gpu_control::PWR_OVERRIDE1)),
            shader_config = %reg(gpu_control_reg(gpu_control::SHADER_CONFIG)),
            l2_mmu_config = %reg(gpu_control_reg(gpu_control::L2_MMU_CONFIG)),
            "config"
        );
    }
}
