//! Register-level model of the job-slot block.
//!
//! [`SimGpu`] implements [`RegisterIo`] over in-memory state that behaves like the hardware's job
//! slots closely enough to drive submission, interrupt reaping, stops and resets:
//!
//! - each slot has a "current" and a "next" job; writing `START` to `COMMAND_NEXT` latches the
//!   next registers and the job is promoted as soon as current is free, which clears `HEAD_NEXT`;
//! - writing `NOP` to `COMMAND_NEXT` drops a job that has not been promoted and leaves `HEAD_NEXT`
//!   as written;
//! - `JOB_IRQ_JS_STATE` bit `n` is set while slot `n` runs a job, bit `n + 16` while a job waits in
//!   next;
//! - a failed or stopped job stalls its slot until its failure bit is cleared through
//!   `JOB_IRQ_CLEAR`;
//! - `_0`/`_1` stop opcodes only act when the running job's chain flag matches.
//!
//! Jobs never finish on their own. Tests and the CLI complete or fault them explicitly.
//!
//! [`SimPlatform`] provides matching [`PowerControl`] and [`AddressSpaceControl`] implementations
//! that record what the job manager asked for.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::atom::{AtomId, ContextId};
use crate::error::{JmError, Result};
use crate::platform::{AddressSpaceControl, PowerControl, RegisterIo};
use crate::regs::{
    command, config, irq_done_bit, irq_fail_bit, job_control, job_control_reg, slot, status,
    JOB_CONTROL_BASE,
};
use crate::sync::lock;

/// Address a soft-stopped job reports as its resume point, relative to its head.
pub const SOFT_STOP_TAIL_OFFSET: u64 = 0x40;

#[derive(Debug, Clone, Copy, Default)]
struct SimJob {
    head: u64,
    affinity: u64,
    config: u32,
}

#[derive(Debug, Default)]
struct SimSlot {
    current: Option<SimJob>,
    next: Option<SimJob>,
    head_next: u64,
    affinity_next: u64,
    config_next: u32,
    flush_id_next: u32,
    status: u32,
    tail: u64,
    stalled: bool,
}

impl SimSlot {
    fn promote(&mut self) {
        if self.current.is_some() || self.stalled {
            return;
        }
        if let Some(job) = self.next.take() {
            self.current = Some(job);
            self.status = status::ACTIVE;
            self.head_next = 0;
        }
    }
}

#[derive(Debug)]
struct SimState {
    slots: Vec<SimSlot>,
    rawstat: u32,
    irq_mask: u32,
    other: HashMap<u32, u32>,
    writes: Vec<(u32, u32)>,
    resets: u32,
}

enum Decoded {
    JobControl(u32),
    Slot(usize, u32),
    Other,
}

fn set_lo(value: &mut u64, lo: u32) {
    *value = (*value & !0xFFFF_FFFF) | u64::from(lo);
}

fn set_hi(value: &mut u64, hi: u32) {
    *value = (*value & 0xFFFF_FFFF) | (u64::from(hi) << 32);
}

impl SimState {
    fn decode(&self, offset: u32) -> Decoded {
        let slots_base = JOB_CONTROL_BASE + slot::BASE;
        let slots_end = slots_base + slot::STRIDE * self.slots.len() as u32;
        if (slots_base..slots_end).contains(&offset) {
            let rel = offset - slots_base;
            Decoded::Slot((rel / slot::STRIDE) as usize, rel % slot::STRIDE)
        } else if (JOB_CONTROL_BASE..slots_base).contains(&offset) {
            Decoded::JobControl(offset - JOB_CONTROL_BASE)
        } else {
            Decoded::Other
        }
    }

    fn js_state(&self) -> u32 {
        let mut js_state = 0;
        for (js, s) in self.slots.iter().enumerate() {
            if s.current.is_some() {
                js_state |= 1 << js;
            }
            if s.next.is_some() {
                js_state |= 1 << (js + 16);
            }
        }
        js_state
    }

    fn read(&self, offset: u32) -> u32 {
        match self.decode(offset) {
            Decoded::JobControl(reg) => match reg {
                job_control::JOB_IRQ_RAWSTAT => self.rawstat,
                job_control::JOB_IRQ_STATUS => self.rawstat & self.irq_mask,
                job_control::JOB_IRQ_MASK => self.irq_mask,
                job_control::JOB_IRQ_JS_STATE => self.js_state(),
                _ => self.other.get(&offset).copied().unwrap_or(0),
            },
            Decoded::Slot(js, reg) => {
                let s = &self.slots[js];
                let current = s.current.unwrap_or_default();
                match reg {
                    slot::HEAD_LO => current.head as u32,
                    slot::HEAD_HI => (current.head >> 32) as u32,
                    slot::TAIL_LO => s.tail as u32,
                    slot::TAIL_HI => (s.tail >> 32) as u32,
                    slot::AFFINITY_LO => current.affinity as u32,
                    slot::AFFINITY_HI => (current.affinity >> 32) as u32,
                    slot::CONFIG => current.config,
                    slot::STATUS => s.status,
                    slot::HEAD_NEXT_LO => s.head_next as u32,
                    slot::HEAD_NEXT_HI => (s.head_next >> 32) as u32,
                    slot::AFFINITY_NEXT_LO => s.affinity_next as u32,
                    slot::AFFINITY_NEXT_HI => (s.affinity_next >> 32) as u32,
                    slot::CONFIG_NEXT => s.config_next,
                    slot::COMMAND_NEXT if s.next.is_some() => command::START,
                    slot::FLUSH_ID_NEXT => s.flush_id_next,
                    _ => 0,
                }
            }
            Decoded::Other => self.other.get(&offset).copied().unwrap_or(0),
        }
    }

    fn write(&mut self, offset: u32, value: u32) {
        self.writes.push((offset, value));
        match self.decode(offset) {
            Decoded::JobControl(reg) => match reg {
                job_control::JOB_IRQ_CLEAR => {
                    self.rawstat &= !value;
                    for (js, s) in self.slots.iter_mut().enumerate() {
                        if value & irq_fail_bit(js) != 0 && s.stalled {
                            s.stalled = false;
                            s.promote();
                        }
                    }
                }
                job_control::JOB_IRQ_MASK => self.irq_mask = value,
                _ => {
                    self.other.insert(offset, value);
                }
            },
            Decoded::Slot(js, reg) => self.write_slot(js, reg, value),
            Decoded::Other => {
                self.other.insert(offset, value);
            }
        }
    }

    fn write_slot(&mut self, js: usize, reg: u32, value: u32) {
        let s = &mut self.slots[js];
        match reg {
            slot::HEAD_NEXT_LO => set_lo(&mut s.head_next, value),
            slot::HEAD_NEXT_HI => set_hi(&mut s.head_next, value),
            slot::AFFINITY_NEXT_LO => set_lo(&mut s.affinity_next, value),
            slot::AFFINITY_NEXT_HI => set_hi(&mut s.affinity_next, value),
            slot::CONFIG_NEXT => s.config_next = value,
            slot::FLUSH_ID_NEXT => s.flush_id_next = value,
            slot::COMMAND_NEXT => match value & command::MASK {
                command::START => {
                    s.next = Some(SimJob {
                        head: s.head_next,
                        affinity: s.affinity_next,
                        config: s.config_next,
                    });
                    s.promote();
                }
                command::NOP => s.next = None,
                _ => {}
            },
            slot::COMMAND => self.stop(js, value & command::MASK),
            _ => {}
        }
    }

    fn stop(&mut self, js: usize, cmd: u32) {
        let s = &mut self.slots[js];
        let Some(job) = s.current else {
            return;
        };
        let chain = job.config & config::JOB_CHAIN_FLAG != 0;
        let soft = match cmd {
            command::SOFT_STOP => true,
            command::SOFT_STOP_0 if !chain => true,
            command::SOFT_STOP_1 if chain => true,
            command::HARD_STOP => false,
            command::HARD_STOP_0 if !chain => false,
            command::HARD_STOP_1 if chain => false,
            _ => return,
        };

        if soft {
            s.status = status::STOPPED;
            s.tail = job.head + SOFT_STOP_TAIL_OFFSET;
        } else {
            s.status = status::TERMINATED;
            s.tail = job.head;
        }
        s.current = None;
        s.stalled = true;
        self.rawstat |= irq_fail_bit(js);
    }
}

/// In-memory job-slot register model.
#[derive(Debug)]
pub struct SimGpu {
    state: Mutex<SimState>,
}

impl SimGpu {
    pub fn new(nr_slots: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                slots: (0..nr_slots).map(|_| SimSlot::default()).collect(),
                rawstat: 0,
                irq_mask: 0,
                other: HashMap::new(),
                writes: Vec::new(),
                resets: 0,
            }),
        }
    }

    pub fn nr_slots(&self) -> usize {
        lock(&self.state).slots.len()
    }

    /// The running job on `js` finishes successfully. Returns `false` if the slot was idle.
    pub fn complete_current(&self, js: usize) -> bool {
        let mut state = lock(&self.state);
        let s = &mut state.slots[js];
        if s.current.take().is_none() {
            return false;
        }
        s.status = status::DONE;
        s.promote();
        state.rawstat |= irq_done_bit(js);
        true
    }

    /// The running job on `js` finishes but its completion interrupt is lost.
    pub fn complete_current_without_irq(&self, js: usize) -> bool {
        let mut state = lock(&self.state);
        let s = &mut state.slots[js];
        if s.current.take().is_none() {
            return false;
        }
        s.status = status::DONE;
        s.promote();
        true
    }

    /// The running job on `js` fails with `JS_STATUS = code`. The slot stalls until the failure
    /// interrupt is cleared.
    pub fn fault_current(&self, js: usize, code: u32) -> bool {
        let mut state = lock(&self.state);
        let s = &mut state.slots[js];
        if s.current.take().is_none() {
            return false;
        }
        s.status = code;
        s.stalled = true;
        state.rawstat |= irq_fail_bit(js);
        true
    }

    pub fn raw_irq(&self) -> u32 {
        lock(&self.state).rawstat
    }

    /// Overrides `JS_STATUS` of `js`.
    pub fn set_status(&self, js: usize, value: u32) {
        lock(&self.state).slots[js].status = value;
    }

    /// Sets a register outside the job-slot block without logging a write.
    pub fn poke(&self, offset: u32, value: u32) {
        lock(&self.state).other.insert(offset, value);
    }

    pub fn is_running(&self, js: usize) -> bool {
        lock(&self.state).slots[js].current.is_some()
    }

    /// Jobs on `js` the hardware still holds (current + next).
    pub fn nr_resident(&self, js: usize) -> usize {
        let state = lock(&self.state);
        let s = &state.slots[js];
        usize::from(s.current.is_some()) + usize::from(s.next.is_some())
    }

    pub fn head_of_current(&self, js: usize) -> Option<u64> {
        lock(&self.state).slots[js].current.map(|j| j.head)
    }

    pub fn writes(&self) -> Vec<(u32, u32)> {
        lock(&self.state).writes.clone()
    }

    /// Values written to `offset`, oldest first.
    pub fn writes_to(&self, offset: u32) -> Vec<u32> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Drops all jobs and returns every register to its reset value.
    pub fn soft_reset(&self) {
        let mut state = lock(&self.state);
        for s in &mut state.slots {
            *s = SimSlot::default();
        }
        state.rawstat = 0;
        state.irq_mask = 0;
        state.other.clear();
        state.resets += 1;
    }

    pub fn reset_count(&self) -> u32 {
        lock(&self.state).resets
    }
}

impl RegisterIo for SimGpu {
    fn read(&self, offset: u32) -> u32 {
        lock(&self.state).read(offset)
    }

    fn write(&self, offset: u32, value: u32) {
        lock(&self.state).write(offset, value);
    }
}

/// What [`SimPlatform`] was asked to do, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    ContextActive,
    ContextIdle,
    DisableIrqs,
    SynchronizeIrqs,
    EnableIrqs,
    FlushMmu,
    ResetHw,
    UpdateCores,
    AsUpdate(usize, ContextId),
    AsDisable(usize),
    RetainPoking(ContextId, AtomId),
}

/// Power and MMU collaborators for a [`SimGpu`].
#[derive(Debug)]
pub struct SimPlatform {
    gpu: Arc<SimGpu>,
    powered: AtomicBool,
    suspending: AtomicBool,
    poweroff_pending: AtomicBool,
    fail_reset: AtomicBool,
    bindings: Mutex<Vec<Option<ContextId>>>,
    events: Mutex<Vec<PlatformEvent>>,
}

impl SimPlatform {
    pub fn new(gpu: Arc<SimGpu>, nr_address_spaces: usize) -> Self {
        Self {
            gpu,
            powered: AtomicBool::new(true),
            suspending: AtomicBool::new(false),
            poweroff_pending: AtomicBool::new(false),
            fail_reset: AtomicBool::new(false),
            bindings: Mutex::new(vec![None; nr_address_spaces]),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn gpu(&self) -> &Arc<SimGpu> {
        &self.gpu
    }

    pub fn bind(&self, as_nr: usize, ctx: ContextId) {
        lock(&self.bindings)[as_nr] = Some(ctx);
    }

    pub fn unbind(&self, as_nr: usize) {
        lock(&self.bindings)[as_nr] = None;
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    pub fn set_suspending(&self, suspending: bool) {
        self.suspending.store(suspending, Ordering::SeqCst);
    }

    pub fn set_poweroff_pending(&self, pending: bool) {
        self.poweroff_pending.store(pending, Ordering::SeqCst);
    }

    /// Makes every subsequent [`PowerControl::reset_hw`] fail.
    pub fn set_fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<PlatformEvent> {
        lock(&self.events).clone()
    }

    pub fn clear_events(&self) {
        lock(&self.events).clear();
    }

    fn record(&self, event: PlatformEvent) {
        lock(&self.events).push(event);
    }

    fn all_irqs(&self) -> u32 {
        let slots = (1u32 << self.gpu.nr_slots()) - 1;
        slots | (slots << 16)
    }
}

impl PowerControl for SimPlatform {
    fn is_gpu_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn context_active_handle_suspend(&self) -> bool {
        if self.suspending.load(Ordering::SeqCst) {
            return true;
        }
        self.record(PlatformEvent::ContextActive);
        false
    }

    fn context_idle(&self) {
        self.record(PlatformEvent::ContextIdle);
    }

    fn disable_interrupts(&self) {
        self.record(PlatformEvent::DisableIrqs);
        let mask = job_control_reg(job_control::JOB_IRQ_MASK);
        self.gpu.write(mask, 0);
    }

    fn enable_interrupts(&self) {
        self.record(PlatformEvent::EnableIrqs);
        let mask = job_control_reg(job_control::JOB_IRQ_MASK);
        self.gpu.write(mask, self.all_irqs());
    }

    fn synchronize_irqs(&self) {
        self.record(PlatformEvent::SynchronizeIrqs);
    }

    fn reset_hw(&self) -> Result<()> {
        self.record(PlatformEvent::ResetHw);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(JmError::HardwareReset(
                "simulated reset timeout".to_string(),
            ));
        }
        self.gpu.soft_reset();
        Ok(())
    }

    fn update_cores_state_sync(&self) {
        self.record(PlatformEvent::UpdateCores);
    }

    fn poweroff_pending(&self) -> bool {
        self.poweroff_pending.load(Ordering::SeqCst)
    }
}

impl AddressSpaceControl for SimPlatform {
    fn nr_address_spaces(&self) -> usize {
        lock(&self.bindings).len()
    }

    fn bound_context(&self, as_nr: usize) -> Option<ContextId> {
        lock(&self.bindings).get(as_nr).copied().flatten()
    }

    fn update(&self, as_nr: usize, ctx: ContextId) {
        self.record(PlatformEvent::AsUpdate(as_nr, ctx));
    }

    fn disable(&self, as_nr: usize) {
        self.record(PlatformEvent::AsDisable(as_nr));
    }

    fn retain_poking(&self, ctx: ContextId, atom: AtomId) {
        self.record(PlatformEvent::RetainPoking(ctx, atom));
    }

    fn flush_workqueues(&self) {
        self.record(PlatformEvent::FlushMmu);
    }
}
