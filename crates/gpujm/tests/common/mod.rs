//! Shared helpers for `gpujm` integration tests.
//!
//! Every test drives a real [`JobManager`] over [`SimGpu`]. Jobs never finish by themselves: tests
//! complete or fault them on the simulator and then deliver the interrupt with [`Harness::irq`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gpujm::regs::{job_slot_reg, slot, status};
use gpujm::sim::{SimGpu, SimPlatform};
use gpujm::{
    Atom, AtomId, Completion, CompletionCode, Context, ContextId, GpuCaps, JmConfig, JobDispatch,
    JobManager, Platform, RegisterIo, SlotAccess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEvent {
    Completed {
        atom: AtomId,
        code: CompletionCode,
        tail: Option<u64>,
    },
    Evicted(AtomId),
    Kick,
}

/// Dispatch double that records every callback.
///
/// Atoms queued with [`RecordingDispatch::queue`] are submitted from `try_kick` when their slot has
/// room. Completions retire a job on the tracked [`Context`] of the atom, except soft-stops.
/// Evicted atoms are kept aside unretired.
#[derive(Default)]
pub struct RecordingDispatch {
    events: Mutex<Vec<DispatchEvent>>,
    returned: Mutex<Vec<Atom>>,
    evicted: Mutex<Vec<Atom>>,
    pending: Mutex<VecDeque<(Atom, usize)>>,
    contexts: Mutex<Vec<Arc<Context>>>,
    schedule_all_calls: AtomicUsize,
    pullable: AtomicBool,
    violate_affinity: AtomicBool,
}

impl RecordingDispatch {
    pub fn events(&self) -> Vec<DispatchEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<(AtomId, CompletionCode)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                DispatchEvent::Completed { atom, code, .. } => Some((atom, code)),
                _ => None,
            })
            .collect()
    }

    pub fn kicks(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| **e == DispatchEvent::Kick)
            .count()
    }

    /// Atoms handed back so far, in completion order.
    pub fn returned(&self) -> Vec<Atom> {
        self.returned.lock().unwrap().clone()
    }

    pub fn take_returned(&self) -> Vec<Atom> {
        std::mem::take(&mut *self.returned.lock().unwrap())
    }

    /// Atoms pulled back out of "next", in eviction order.
    pub fn evicted(&self) -> Vec<Atom> {
        self.evicted.lock().unwrap().clone()
    }

    pub fn evicted_ids(&self) -> Vec<AtomId> {
        self.evicted().iter().map(|a| a.id).collect()
    }

    pub fn queue(&self, atom: Atom, slot: usize) {
        self.pending.lock().unwrap().push_back((atom, slot));
    }

    pub fn track(&self, ctx: Arc<Context>) {
        self.contexts.lock().unwrap().push(ctx);
    }

    pub fn set_pullable(&self, pullable: bool) {
        self.pullable.store(pullable, Ordering::SeqCst);
    }

    pub fn set_violate_affinity(&self, violate: bool) {
        self.violate_affinity.store(violate, Ordering::SeqCst);
    }

    pub fn schedule_all_calls(&self) -> usize {
        self.schedule_all_calls.load(Ordering::SeqCst)
    }
}

impl JobDispatch for RecordingDispatch {
    fn atom_completed(&self, _slots: &mut SlotAccess<'_>, atom: Atom, completion: Completion) {
        self.events.lock().unwrap().push(DispatchEvent::Completed {
            atom: atom.id,
            code: completion.code,
            tail: completion.tail,
        });
        if completion.code != CompletionCode::Stopped {
            if let Some(ctx) = self
                .contexts
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id() == atom.ctx)
            {
                ctx.job_retired();
            }
        }
        self.returned.lock().unwrap().push(atom);
    }

    fn atom_evicted(&self, atom: Atom) {
        self.events
            .lock()
            .unwrap()
            .push(DispatchEvent::Evicted(atom.id));
        self.evicted.lock().unwrap().push(atom);
    }

    fn try_kick(&self, slots: &mut SlotAccess<'_>) {
        self.events.lock().unwrap().push(DispatchEvent::Kick);
        let mut pending = self.pending.lock().unwrap();
        while let Some((_, slot)) = pending.front() {
            let slot = *slot;
            if !slots.is_next_free(slot) {
                break;
            }
            let Some((atom, slot)) = pending.pop_front() else {
                break;
            };
            slots.submit(atom, slot);
        }
    }

    fn schedule_all(&self) {
        self.schedule_all_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn has_pullable_contexts(&self) -> bool {
        self.pullable.load(Ordering::SeqCst)
    }

    fn affinity_would_violate(&self, _slot: usize, _affinity: u64) -> bool {
        self.violate_affinity.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub gpu: Arc<SimGpu>,
    pub platform: Arc<SimPlatform>,
    pub dispatch: Arc<RecordingDispatch>,
    pub jm: JobManager,
}

impl Harness {
    /// Delivers whatever the simulator has raised.
    pub fn irq(&self) {
        self.jm.handle_job_irq(self.gpu.raw_irq());
    }

    pub fn resident(&self, slot: usize) -> Vec<AtomId> {
        self.jm.with_slots(|s| {
            (0..s.nr_submitted(slot))
                .filter_map(|idx| s.inspect(slot, idx).map(|a| a.id))
                .collect()
        })
    }
}

pub fn test_config() -> JmConfig {
    JmConfig {
        reset_timeout: Duration::from_millis(200),
        zap_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn harness(caps: GpuCaps) -> Harness {
    harness_with(test_config(), caps)
}

pub fn harness_with(config: JmConfig, caps: GpuCaps) -> Harness {
    let gpu = Arc::new(SimGpu::new(config.nr_slots));
    harness_over(config, caps, Arc::clone(&gpu), gpu)
}

/// Harness whose job manager reaches `gpu` through `regs`.
pub fn harness_over(
    config: JmConfig,
    caps: GpuCaps,
    gpu: Arc<SimGpu>,
    regs: Arc<dyn RegisterIo>,
) -> Harness {
    let platform = Arc::new(SimPlatform::new(Arc::clone(&gpu), 4));
    let dispatch = Arc::new(RecordingDispatch::default());
    let jm = JobManager::new(
        config,
        caps,
        Platform {
            regs,
            dispatch: dispatch.clone(),
            power: platform.clone(),
            mmu: platform.clone(),
        },
    )
    .expect("job manager");

    Harness {
        gpu,
        platform,
        dispatch,
        jm,
    }
}

/// Register window that loses one completion interrupt on `slot`.
///
/// While armed, the first `JS_STATUS` read of `slot` finishes the running job without raising its
/// interrupt and reads back `NOT_STARTED`.
pub struct LostIrqRegs {
    gpu: Arc<SimGpu>,
    slot: usize,
    armed: AtomicBool,
}

impl LostIrqRegs {
    pub fn new(gpu: Arc<SimGpu>, slot: usize) -> Self {
        Self {
            gpu,
            slot,
            armed: AtomicBool::new(true),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl RegisterIo for LostIrqRegs {
    fn read(&self, offset: u32) -> u32 {
        if offset == job_slot_reg(self.slot, slot::STATUS) && self.armed.swap(false, Ordering::SeqCst)
        {
            self.gpu.complete_current_without_irq(self.slot);
            return status::NOT_STARTED;
        }
        self.gpu.read(offset)
    }

    fn write(&self, offset: u32, value: u32) {
        self.gpu.write(offset, value);
    }
}

/// Atom `id` of context `ctx` with a job chain at `id * 0x1_0000`.
pub fn atom(id: u32, ctx: u32) -> Atom {
    Atom::new(AtomId(id), ContextId(ctx), 1, u64::from(id) * 0x1_0000)
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
