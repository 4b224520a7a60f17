#![forbid(unsafe_code)]

mod config;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context as _};
use gpujm::sim::{SimGpu, SimPlatform};
use gpujm::{
    Atom, AtomId, Completion, CompletionCode, Context, ContextId, GpuCaps, HwFeature, HwIssue,
    JmStatsSnapshot, JobDispatch, JobManager, Platform, ResetState, SlotAccess, StopFlags,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

const FAULT_CODES: [u32; 4] = [0x40, 0x42, 0x48, 0x58];
const CONTEXTS: u32 = 2;
/// Context torn down halfway through the run.
const VICTIM: ContextId = ContextId(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct Outcomes {
    done: AtomicU64,
    stopped: AtomicU64,
    terminated: AtomicU64,
    cancelled: AtomicU64,
    faulted: AtomicU64,
    evicted: AtomicU64,
}

/// Dispatch queue for the synthetic workload.
///
/// Soft-stopped and evicted atoms go back to the front of their slot queue; a soft-stopped one
/// resumes from the reported tail. Every other outcome retires the atom on its context, as does
/// any outcome once the context is descheduled.
struct WorkloadDispatch {
    queues: Mutex<Vec<VecDeque<Atom>>>,
    contexts: Vec<Arc<Context>>,
    paused: AtomicBool,
    outcomes: Outcomes,
    reschedules: AtomicU64,
}

impl WorkloadDispatch {
    fn new(nr_slots: usize, contexts: Vec<Arc<Context>>) -> Self {
        Self {
            queues: Mutex::new(vec![VecDeque::new(); nr_slots]),
            contexts,
            paused: AtomicBool::new(false),
            outcomes: Outcomes::default(),
            reschedules: AtomicU64::new(0),
        }
    }

    fn context(&self, id: ContextId) -> Option<&Arc<Context>> {
        self.contexts.iter().find(|c| c.id() == id)
    }

    fn enqueue(&self, atom: Atom, slot: usize) {
        if let Some(ctx) = self.context(atom.ctx) {
            ctx.job_added();
        }
        lock(&self.queues)[slot].push_back(atom);
    }

    /// Drops queued atoms of `ctx` and retires them; they never reach the hardware again.
    ///
    /// Returned so the caller can end the disjoint period of atoms that were soft-stopped earlier.
    fn drop_queued(&self, ctx: ContextId) -> Vec<Atom> {
        let mut dropped = Vec::new();
        for queue in lock(&self.queues).iter_mut() {
            let (victims, kept): (Vec<Atom>, Vec<Atom>) =
                queue.drain(..).partition(|atom| atom.ctx == ctx);
            queue.extend(kept);
            dropped.extend(victims);
        }
        if let Some(ctx) = self.context(ctx) {
            for _ in 0..dropped.len() {
                ctx.job_retired();
            }
        }
        dropped
    }

    fn outstanding(&self) -> usize {
        self.contexts.iter().map(|c| c.outstanding_jobs()).sum()
    }

    fn kick(&self, slots: &mut SlotAccess<'_>) {
        if self.paused.load(Ordering::Acquire) {
            return;
        }
        let mut queues = lock(&self.queues);
        for (slot, queue) in queues.iter_mut().enumerate() {
            while slots.is_next_free(slot) {
                let Some(atom) = queue.pop_front() else {
                    break;
                };
                slots.submit(atom, slot);
            }
        }
    }
}

impl JobDispatch for WorkloadDispatch {
    fn atom_completed(&self, slots: &mut SlotAccess<'_>, mut atom: Atom, completion: Completion) {
        let counter = match completion.code {
            CompletionCode::Done => &self.outcomes.done,
            CompletionCode::Stopped => &self.outcomes.stopped,
            CompletionCode::Terminated => &self.outcomes.terminated,
            CompletionCode::Cancelled => &self.outcomes.cancelled,
            CompletionCode::Fault(_) => &self.outcomes.faulted,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let Some(ctx) = self.context(atom.ctx) else {
            return;
        };
        // A stopped atom resumes unless its context is being torn down.
        if completion.code == CompletionCode::Stopped && ctx.is_scheduled() {
            if let Some(tail) = completion.tail {
                atom.jc = tail;
            }
            let slot = atom.slot;
            lock(&self.queues)[slot].push_front(atom);
            return;
        }
        slots.leave_disjoint(&mut atom);
        ctx.job_retired();
    }

    fn atom_evicted(&self, atom: Atom) {
        self.outcomes.evicted.fetch_add(1, Ordering::Relaxed);
        let Some(ctx) = self.context(atom.ctx) else {
            return;
        };
        if ctx.is_scheduled() {
            let slot = atom.slot;
            lock(&self.queues)[slot].push_front(atom);
        } else {
            ctx.job_retired();
        }
    }

    fn try_kick(&self, slots: &mut SlotAccess<'_>) {
        self.kick(slots);
    }

    fn schedule_all(&self) {
        self.reschedules.fetch_add(1, Ordering::Relaxed);
    }

    fn has_pullable_contexts(&self) -> bool {
        lock(&self.queues).iter().any(|q| !q.is_empty())
    }
}

#[derive(Debug, Serialize)]
struct StatsSummary {
    atoms_submitted: u64,
    atoms_reaped: u64,
    atoms_evicted: u64,
    job_irqs: u64,
    spurious_irqs: u64,
    soft_stops: u64,
    hard_stops: u64,
    resets_prepared: u64,
    resets_completed: u64,
    resets_aborted: u64,
    early_resets: u64,
    watchdog_resets: u64,
    zap_escalations: u64,
}

impl From<JmStatsSnapshot> for StatsSummary {
    fn from(s: JmStatsSnapshot) -> Self {
        Self {
            atoms_submitted: s.atoms_submitted,
            atoms_reaped: s.atoms_reaped,
            atoms_evicted: s.atoms_evicted,
            job_irqs: s.job_irqs,
            spurious_irqs: s.spurious_irqs,
            soft_stops: s.soft_stops,
            hard_stops: s.hard_stops,
            resets_prepared: s.resets_prepared,
            resets_completed: s.resets_completed,
            resets_aborted: s.resets_aborted,
            early_resets: s.early_resets,
            watchdog_resets: s.watchdog_resets,
            zap_escalations: s.zap_escalations,
        }
    }
}

#[derive(Debug, Serialize)]
struct OutcomeSummary {
    done: u64,
    stopped: u64,
    terminated: u64,
    cancelled: u64,
    faulted: u64,
    evicted: u64,
}

#[derive(Debug, Serialize)]
struct Summary {
    seed: u64,
    slots: usize,
    jobs: u32,
    steps: u64,
    elapsed_ms: u64,
    gpu_resets: u32,
    dropped: usize,
    teardown_escalated: bool,
    disjoint_count: u32,
    reschedules: u64,
    outcomes: OutcomeSummary,
    stats: StatsSummary,
}

struct Workload {
    config: Config,
    gpu: Arc<SimGpu>,
    dispatch: Arc<WorkloadDispatch>,
    jm: JobManager,
    rng: StdRng,
    steps: u64,
}

impl Workload {
    fn new(config: Config) -> anyhow::Result<Self> {
        let nr_slots = config.jm.nr_slots;
        let gpu = Arc::new(SimGpu::new(nr_slots));
        let platform = Arc::new(SimPlatform::new(Arc::clone(&gpu), 8));

        let contexts: Vec<Arc<Context>> = (1..=CONTEXTS)
            .map(|id| {
                let ctx = Arc::new(Context::new(ContextId(id)));
                ctx.set_scheduled(true);
                platform.bind(id as usize, ctx.id());
                ctx
            })
            .collect();
        let dispatch = Arc::new(WorkloadDispatch::new(nr_slots, contexts));

        let caps = GpuCaps::new(
            HwFeature::JOBCHAIN_DISAMBIGUATION | HwFeature::FLUSH_REDUCTION,
            HwIssue::ISSUE_8316,
        );
        let jm = JobManager::new(
            config.jm.clone(),
            caps,
            Platform {
                regs: gpu.clone(),
                dispatch: dispatch.clone(),
                power: platform.clone(),
                mmu: platform,
            },
        )
        .context("failed to start job manager")?;

        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            gpu,
            dispatch,
            jm,
            rng,
            steps: 0,
        })
    }

    fn populate(&mut self) {
        let nr_slots = self.config.jm.nr_slots;
        for id in 1..=self.config.jobs {
            let ctx = ContextId(1 + id % CONTEXTS);
            let slot = self.rng.gen_range(0..nr_slots);
            let atom = Atom::new(AtomId(id), ctx, ctx.0 as u8, u64::from(id) << 16)
                .with_flush_id(self.jm.current_flush_id())
                .with_priority(self.rng.gen_range(0..4));
            self.dispatch.enqueue(atom, slot);
        }
    }

    /// One tick: feed the slots, let every running job complete, fault or stop, deliver the
    /// interrupt.
    fn step(&mut self) {
        self.steps += 1;

        let resetting = self.jm.reset_state() != ResetState::NotPending;
        self.dispatch.paused.store(resetting, Ordering::Release);
        if self.jm.reset_state() == ResetState::Happening {
            if !self.jm.wait_reset_complete_timeout(self.config.jm.reset_timeout * 4) {
                warn!("reset still running");
            }
            self.dispatch.paused.store(false, Ordering::Release);
        }

        let dispatch = Arc::clone(&self.dispatch);
        self.jm.with_slots(|slots| dispatch.kick(slots));

        for slot in 0..self.config.jm.nr_slots {
            let roll: f64 = self.rng.gen();
            if roll < self.config.fault_rate {
                let code = FAULT_CODES[self.rng.gen_range(0..FAULT_CODES.len())];
                self.gpu.fault_current(slot, code);
            } else if roll < self.config.fault_rate + self.config.stop_rate {
                self.jm
                    .soft_stop_with_flags(slot, None, StopFlags::CAUSES_DISJOINT);
            } else {
                self.gpu.complete_current(slot);
            }
        }

        let raw = self.gpu.raw_irq();
        if raw != 0 {
            self.jm.handle_job_irq(raw);
        }
    }

    fn run(mut self) -> anyhow::Result<Summary> {
        let started = Instant::now();
        self.populate();

        let max_steps = u64::from(self.config.jobs) * 50;
        let reset_at = (u64::from(self.config.jobs) / 4).max(1);
        let teardown_at = (u64::from(self.config.jobs) / 2).max(2);
        let mut dropped = 0;
        let mut teardown_escalated = false;
        let mut teardown = None;

        while self.dispatch.outstanding() > 0 || teardown.is_some() {
            if self.steps >= max_steps {
                bail!(
                    "workload did not finish after {max_steps} steps ({} jobs outstanding)",
                    self.dispatch.outstanding()
                );
            }
            self.step();

            if self.steps == reset_at {
                info!(step = self.steps, "forcing GPU reset");
                self.jm.reset_gpu();
            }

            if self.steps == teardown_at {
                info!(step = self.steps, ctx = %VICTIM, "tearing down context");
                let ctx = self
                    .dispatch
                    .context(VICTIM)
                    .cloned()
                    .context("victim context missing")?;
                // Descheduled first so stopped or evicted atoms are retired, not requeued.
                ctx.set_scheduled(false);

                let victims = self.dispatch.drop_queued(VICTIM);
                dropped = victims.len();
                for mut atom in victims {
                    self.jm.leave_disjoint(&mut atom);
                }
                self.jm.kill_context_jobs(VICTIM);

                let jm = self.jm.clone();
                teardown = Some(
                    thread::Builder::new()
                        .name("gpujm-teardown".to_string())
                        .spawn(move || jm.wait_for_drain(&ctx))
                        .context("failed to spawn teardown thread")?,
                );
            }

            if teardown.as_ref().is_some_and(|t| t.is_finished()) {
                if let Some(handle) = teardown.take() {
                    let outcome = handle
                        .join()
                        .map_err(|_| anyhow::anyhow!("teardown thread panicked"))??;
                    info!(escalated = outcome.escalated, "context torn down");
                    teardown_escalated = outcome.escalated;
                }
            }

            if self.dispatch.outstanding() == 0 && teardown.is_some() {
                thread::sleep(Duration::from_millis(1));
            }
        }

        self.jm.wait_reset_complete();
        self.jm.shutdown();

        let o = &self.dispatch.outcomes;
        Ok(Summary {
            seed: self.config.seed,
            slots: self.config.jm.nr_slots,
            jobs: self.config.jobs,
            steps: self.steps,
            elapsed_ms: started.elapsed().as_millis() as u64,
            gpu_resets: self.gpu.reset_count(),
            dropped,
            teardown_escalated,
            disjoint_count: self.jm.disjoint_count(),
            reschedules: self.dispatch.reschedules.load(Ordering::Relaxed),
            outcomes: OutcomeSummary {
                done: o.done.load(Ordering::Relaxed),
                stopped: o.stopped.load(Ordering::Relaxed),
                terminated: o.terminated.load(Ordering::Relaxed),
                cancelled: o.cancelled.load(Ordering::Relaxed),
                faulted: o.faulted.load(Ordering::Relaxed),
                evicted: o.evicted.load(Ordering::Relaxed),
            },
            stats: self.jm.stats().into(),
        })
    }
}

fn print_summary(summary: &Summary) {
    let s = &summary.stats;
    let o = &summary.outcomes;
    println!(
        "gpujm-sim: {} jobs on {} slots (seed {}) in {} steps, {} ms",
        summary.jobs, summary.slots, summary.seed, summary.steps, summary.elapsed_ms
    );
    println!(
        "  outcomes:  done={} stopped={} terminated={} cancelled={} faulted={} evicted={} dropped={}",
        o.done, o.stopped, o.terminated, o.cancelled, o.faulted, o.evicted, summary.dropped
    );
    println!(
        "  irqs:      total={} spurious={}  stops: soft={} hard={}",
        s.job_irqs, s.spurious_irqs, s.soft_stops, s.hard_stops
    );
    println!(
        "  resets:    completed={} (early={} watchdog={} aborted={}) gpu={} zap={}",
        s.resets_completed,
        s.early_resets,
        s.watchdog_resets,
        s.resets_aborted,
        summary.gpu_resets,
        s.zap_escalations
    );
    println!(
        "  teardown:  escalated={}  disjoint={}",
        summary.teardown_escalated, summary.disjoint_count
    );
}

fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    let filter = EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let json = config.json;
    let summary = Workload::new(config)?.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}
