use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tracing::{error, info};

use crate::atom::{Atom, AtomId, ContextId};
use crate::caps::{GpuCaps, HwFeature};
use crate::config::JmConfig;
use crate::context::Context;
use crate::disjoint::DisjointState;
use crate::error::Result;
use crate::instr::Instrumentation;
use crate::platform::{AddressSpaceControl, JobDispatch, Platform, PowerControl, RegisterIo};
use crate::regs::{gpu_control, gpu_control_reg};
use crate::reset::{ResetGate, ResetState, ResetWorker};
use crate::slots::{Runpool, SlotAccess};
use crate::stats::{JmStats, JmStatsSnapshot};
use crate::stop::{StopFlags, StopKind};
use crate::sync::lock;
use crate::timer::OneShotTimer;
use crate::zap::DrainOutcome;

pub(crate) struct Inner {
    pub(crate) config: JmConfig,
    pub(crate) caps: GpuCaps,
    pub(crate) regs: Arc<dyn RegisterIo>,
    pub(crate) dispatch: Arc<dyn JobDispatch>,
    pub(crate) power: Arc<dyn PowerControl>,
    pub(crate) mmu: Arc<dyn AddressSpaceControl>,

    pub(crate) runpool: Mutex<Runpool>,
    pub(crate) disjoint: DisjointState,
    pub(crate) reset: ResetGate,
    pub(crate) watchdog: Mutex<Option<OneShotTimer>>,
    pub(crate) worker: ResetWorker,
    pub(crate) irq_reset_flush: AtomicBool,
    pub(crate) instr: Arc<Instrumentation>,
    pub(crate) stats: JmStats,
    pub(crate) this: Weak<Inner>,
}

impl Inner {
    pub(crate) fn lock_runpool(&self) -> MutexGuard<'_, Runpool> {
        lock(&self.runpool)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.worker.stop();
    }
}

/// Job-slot scheduling and recovery core for one GPU.
///
/// Cheap to clone; all clones drive the same device. The reset worker thread is stopped when the
/// last clone is dropped or on [`JobManager::shutdown`].
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<Inner>,
}

impl JobManager {
    pub fn new(config: JmConfig, caps: GpuCaps, platform: Platform) -> Result<Self> {
        config.validate()?;
        let Platform {
            regs,
            dispatch,
            power,
            mmu,
        } = platform;

        let inner = Arc::new_cyclic(|this| Inner {
            runpool: Mutex::new(Runpool::new(config.nr_slots)),
            config,
            caps,
            regs,
            dispatch,
            power,
            mmu,
            disjoint: DisjointState::default(),
            reset: ResetGate::new(),
            watchdog: Mutex::new(None),
            worker: ResetWorker::new(),
            irq_reset_flush: AtomicBool::new(false),
            instr: Arc::new(Instrumentation::new()),
            stats: JmStats::default(),
            this: this.clone(),
        });
        inner.worker.start(Arc::downgrade(&inner))?;

        info!(
            nr_slots = inner.config.nr_slots,
            features = ?inner.caps.features,
            issues = ?inner.caps.issues,
            "job manager ready"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &JmConfig {
        &self.inner.config
    }

    pub fn caps(&self) -> GpuCaps {
        self.inner.caps
    }

    /// Writes `atom` into the "next" registers of `slot` and starts it.
    ///
    /// # Panics
    ///
    /// If `slot` is out of range, its next registers are occupied, or the dispatch layer reports an
    /// affinity violation.
    pub fn submit(&self, atom: Atom, slot: usize) {
        let mut rp = self.inner.lock_runpool();
        self.inner.submit_locked(&mut rp, atom, slot);
    }

    /// Runs `f` with the runpool locked.
    pub fn with_slots<R>(&self, f: impl FnOnce(&mut SlotAccess<'_>) -> R) -> R {
        let mut rp = self.inner.lock_runpool();
        f(&mut SlotAccess::new(&self.inner, &mut rp))
    }

    pub fn nr_atoms_submitted(&self, slot: usize) -> usize {
        self.inner.lock_runpool().nr_submitted(slot)
    }

    pub fn current_flush_id(&self) -> u32 {
        if !self.inner.caps.has_feature(HwFeature::FLUSH_REDUCTION) {
            return 0;
        }
        if !self.inner.power.is_gpu_powered() {
            return 0;
        }
        self.inner
            .regs
            .read(gpu_control_reg(gpu_control::LATEST_FLUSH))
    }

    /// Job interrupt entry point. `done` is the value of `JOB_IRQ_STATUS`.
    pub fn handle_job_irq(&self, done: u32) {
        self.inner.handle_job_irq(done);
    }

    pub fn soft_stop(&self, slot: usize, target: Option<AtomId>) -> bool {
        self.request_stop(slot, target, StopKind::Soft, StopFlags::empty())
    }

    pub fn soft_stop_with_flags(&self, slot: usize, target: Option<AtomId>, flags: StopFlags) -> bool {
        self.request_stop(slot, target, StopKind::Soft, flags)
    }

    pub fn hard_stop(&self, ctx: ContextId, slot: usize, target: Option<AtomId>) -> bool {
        let mut rp = self.inner.lock_runpool();
        self.inner.hard_stop_locked(&mut rp, ctx, slot, target)
    }

    /// Stops `target`, or the current atom of `slot` when `None`.
    ///
    /// A target still waiting in "next" is evicted and handed to
    /// [`crate::JobDispatch::atom_evicted`].
    pub fn request_stop(
        &self,
        slot: usize,
        target: Option<AtomId>,
        kind: StopKind,
        flags: StopFlags,
    ) -> bool {
        let mut rp = self.inner.lock_runpool();
        self.inner.stop_locked(&mut rp, slot, target, kind, flags)
    }

    /// Removes every resident atom of `ctx` from the hardware: atoms waiting in "next" go back to
    /// the dispatch layer, running ones are hard-stopped.
    pub fn kill_context_jobs(&self, ctx: ContextId) {
        let mut rp = self.inner.lock_runpool();
        for slot in 0..self.inner.config.nr_slots {
            self.inner.hard_stop_locked(&mut rp, ctx, slot, None);
        }
    }

    /// Soft-stops atoms of `ctx` on `target`'s slot that have lower priority than `target`.
    pub fn check_context_priority(&self, ctx: ContextId, target: &Atom) {
        let mut rp = self.inner.lock_runpool();
        self.inner.check_context_priority_locked(&mut rp, ctx, target);
    }

    pub fn enter_disjoint(&self, atom: &mut Atom, kind: StopKind, flags: StopFlags) {
        self.inner.enter_disjoint(atom, kind, flags);
    }

    pub fn leave_disjoint(&self, atom: &mut Atom) {
        self.inner.leave_disjoint(atom);
    }

    pub fn disjoint_count(&self) -> u32 {
        self.inner.disjoint.count()
    }

    /// Starts a reset if none is pending. Returns whether this caller won the race.
    pub fn prepare_reset(&self) -> bool {
        let mut rp = self.inner.lock_runpool();
        self.inner.prepare_reset_locked(&mut rp)
    }

    pub fn commit_reset(&self) -> Result<()> {
        let mut rp = self.inner.lock_runpool();
        self.inner.commit_reset_locked(&mut rp)
    }

    /// [`JobManager::prepare_reset`] followed by [`JobManager::commit_reset`].
    pub fn reset_gpu(&self) -> bool {
        if !self.prepare_reset() {
            return false;
        }
        if let Err(err) = self.commit_reset() {
            error!(%err, "failed to commit prepared reset");
            return false;
        }
        true
    }

    pub fn reset_state(&self) -> ResetState {
        self.inner.reset.state()
    }

    pub fn wait_reset_complete(&self) {
        self.inner.reset.wait_idle();
    }

    /// Returns `false` if the reset was still in progress after `timeout`.
    pub fn wait_reset_complete_timeout(&self, timeout: Duration) -> bool {
        self.inner.reset.wait_idle_timeout(timeout)
    }

    /// Set while the reset worker is quiescing interrupt handlers.
    pub fn is_reset_flushing(&self) -> bool {
        self.inner.irq_reset_flush.load(Ordering::Acquire)
    }

    /// Blocks until `ctx` has no jobs left, resetting the GPU if that takes longer than
    /// [`JmConfig::zap_timeout`].
    pub fn wait_for_drain(&self, ctx: &Context) -> Result<DrainOutcome> {
        self.inner.wait_for_drain(ctx)
    }

    pub fn instrumentation(&self) -> &Arc<Instrumentation> {
        &self.inner.instr
    }

    pub fn stats(&self) -> JmStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Stops the reset worker. Resets requested afterwards complete immediately without touching
    /// the hardware.
    pub fn shutdown(&self) {
        self.inner.worker.stop();
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("nr_slots", &self.inner.config.nr_slots)
            .field("reset_state", &self.inner.reset.state())
            .field("disjoint", &self.inner.disjoint.count())
            .finish_non_exhaustive()
    }
}
