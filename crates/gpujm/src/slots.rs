//! Slot residency and submission.

use std::collections::VecDeque;
use std::time::Instant;

use tracing::debug;

use crate::atom::{Atom, AtomFlags, AtomId, ContextId};
use crate::caps::HwFeature;
use crate::manager::Inner;
use crate::regs::{command, config, job_slot_reg, slot};
use crate::stop::{StopFlags, StopKind};

/// Hardware holds at most a current and a next job per slot.
pub(crate) const SLOT_DEPTH: usize = 2;

#[derive(Debug, Default)]
pub(crate) struct SlotRing {
    /// Oldest first: index 0 is in "current", index 1 in "next".
    pub(crate) atoms: VecDeque<Atom>,
    job_chain_flag: bool,
    last_context: Option<ContextId>,
}

impl SlotRing {
    pub(crate) fn position(&self, id: AtomId) -> Option<usize> {
        self.atoms.iter().position(|a| a.id == id)
    }
}

/// Everything the runpool lock protects.
#[derive(Debug)]
pub(crate) struct Runpool {
    pub(crate) slots: Vec<SlotRing>,
}

impl Runpool {
    pub(crate) fn new(nr_slots: usize) -> Self {
        Self {
            slots: (0..nr_slots).map(|_| SlotRing::default()).collect(),
        }
    }

    pub(crate) fn nr_submitted(&self, slot: usize) -> usize {
        self.slots[slot].atoms.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.atoms.is_empty())
    }
}

/// Slot state borrowed from a held runpool lock.
///
/// Handed to [`crate::JobDispatch`] callbacks and to [`crate::JobManager::with_slots`].
pub struct SlotAccess<'a> {
    inner: &'a Inner,
    rp: &'a mut Runpool,
}

impl<'a> SlotAccess<'a> {
    pub(crate) fn new(inner: &'a Inner, rp: &'a mut Runpool) -> Self {
        Self { inner, rp }
    }

    pub fn nr_slots(&self) -> usize {
        self.rp.slots.len()
    }

    pub fn nr_submitted(&self, slot: usize) -> usize {
        self.rp.nr_submitted(slot)
    }

    /// Resident atom `idx` on `slot` (0 = current, 1 = next).
    pub fn inspect(&self, slot: usize, idx: usize) -> Option<&Atom> {
        self.rp.slots.get(slot)?.atoms.get(idx)
    }

    /// Whether `slot` can take another submission right now.
    pub fn is_next_free(&self, slot: usize) -> bool {
        self.rp.slots[slot].atoms.len() < SLOT_DEPTH
            && self.inner.regs.read(job_slot_reg(slot, slot::COMMAND_NEXT)) == command::NOP
    }

    /// Context of the atom that last entered `slot` while it was empty.
    pub fn last_context(&self, slot: usize) -> Option<ContextId> {
        self.rp.slots[slot].last_context
    }

    pub fn submit(&mut self, atom: Atom, slot: usize) {
        self.inner.submit_locked(self.rp, atom, slot);
    }

    pub fn soft_stop(&mut self, slot: usize, target: Option<AtomId>) -> bool {
        self.inner
            .stop_locked(self.rp, slot, target, StopKind::Soft, StopFlags::empty())
    }

    pub fn hard_stop(&mut self, ctx: ContextId, slot: usize, target: Option<AtomId>) -> bool {
        self.inner.hard_stop_locked(self.rp, ctx, slot, target)
    }

    /// Ends the disjoint period of an atom the dispatch layer is dropping.
    pub fn leave_disjoint(&self, atom: &mut Atom) {
        self.inner.leave_disjoint(atom);
    }
}

impl Inner {
    fn job_config(&self, atom: &Atom) -> u32 {
        let mut cfg = u32::from(atom.as_nr) & config::AS_MASK;

        if self.caps.has_feature(HwFeature::FLUSH_REDUCTION) {
            cfg |= config::ENABLE_FLUSH_REDUCTION;
        }
        if !self.config.coherent {
            cfg |= config::START_FLUSH_CLEAN_INVALIDATE | config::END_FLUSH_CLEAN_INVALIDATE;
        }
        cfg |= config::START_MMU;
        cfg |= config::thread_pri(self.config.thread_priority);

        if self.caps.has_feature(HwFeature::PROTECTED_MODE) && atom.is_secure() {
            cfg |= config::DISABLE_DESCRIPTOR_WR_BK;
        }
        cfg
    }

    pub(crate) fn submit_locked(&self, rp: &mut Runpool, mut atom: Atom, slot: usize) {
        assert!(
            slot < rp.slots.len(),
            "submit to slot {slot} but only {} slots exist",
            rp.slots.len()
        );
        assert!(
            rp.slots[slot].atoms.len() < SLOT_DEPTH,
            "slot {slot} already holds {SLOT_DEPTH} atoms"
        );
        assert_eq!(
            self.regs.read(job_slot_reg(slot, slot::COMMAND_NEXT)),
            command::NOP,
            "slot {slot} next registers are busy"
        );
        assert!(
            !self.dispatch.affinity_would_violate(slot, atom.affinity),
            "affinity {:#x} of {} violates slot {slot}",
            atom.affinity,
            atom.id
        );

        let jc = atom.jc;
        let affinity = atom.affinity;
        self.regs
            .write(job_slot_reg(slot, slot::HEAD_NEXT_LO), jc as u32);
        self.regs
            .write(job_slot_reg(slot, slot::HEAD_NEXT_HI), (jc >> 32) as u32);
        self.regs
            .write(job_slot_reg(slot, slot::AFFINITY_NEXT_LO), affinity as u32);
        self.regs
            .write(job_slot_reg(slot, slot::AFFINITY_NEXT_HI), (affinity >> 32) as u32);

        let ring = &mut rp.slots[slot];
        let mut cfg = self.job_config(&atom);
        if self.caps.has_feature(HwFeature::JOBCHAIN_DISAMBIGUATION) {
            if ring.job_chain_flag {
                atom.flags.remove(AtomFlags::JOBCHAIN);
                ring.job_chain_flag = false;
            } else {
                cfg |= config::JOB_CHAIN_FLAG;
                atom.flags.insert(AtomFlags::JOBCHAIN);
                ring.job_chain_flag = true;
            }
        }
        self.regs.write(job_slot_reg(slot, slot::CONFIG_NEXT), cfg);

        if self.caps.has_feature(HwFeature::FLUSH_REDUCTION) {
            self.regs
                .write(job_slot_reg(slot, slot::FLUSH_ID_NEXT), atom.flush_id);
        }

        // Approximate: the job may sit in "next" for a while.
        atom.start_timestamp = Some(Instant::now());
        atom.slot = slot;
        atom.event_code = None;

        if ring.atoms.is_empty() {
            ring.last_context = Some(atom.ctx);
        }

        debug!(
            slot,
            atom = %atom.id,
            ctx = %atom.ctx,
            jc = format_args!("{jc:#x}"),
            affinity = format_args!("{affinity:#x}"),
            config = format_args!("{cfg:#x}"),
            "submitting job"
        );

        ring.atoms.push_back(atom);
        self.stats.inc_atoms_submitted();

        self.regs
            .write(job_slot_reg(slot, slot::COMMAND_NEXT), command::START);
    }

    /// Pulls the atom in "next" on `slot` back off the hardware and returns it to the dispatch
    /// layer unrun.
    ///
    /// Returns `false` if there is no second atom or the hardware already promoted it to current.
    pub(crate) fn evict_next_locked(&self, rp: &mut Runpool, slot: usize) -> bool {
        if rp.slots[slot].atoms.len() < SLOT_DEPTH {
            return false;
        }

        self.regs
            .write(job_slot_reg(slot, slot::COMMAND_NEXT), command::NOP);
        // HEAD_NEXT is cleared by the hardware when it takes the job.
        let head_lo = self.regs.read(job_slot_reg(slot, slot::HEAD_NEXT_LO));
        let head_hi = self.regs.read(job_slot_reg(slot, slot::HEAD_NEXT_HI));
        if head_lo == 0 && head_hi == 0 {
            debug!(slot, "next job already started; nothing to evict");
            return false;
        }

        let ring = &mut rp.slots[slot];
        let Some(mut atom) = ring.atoms.pop_back() else {
            return false;
        };
        if self.caps.has_feature(HwFeature::JOBCHAIN_DISAMBIGUATION) {
            ring.job_chain_flag = ring
                .atoms
                .front()
                .is_some_and(|current| current.flags.contains(AtomFlags::JOBCHAIN));
        }
        atom.flags.remove(AtomFlags::JOBCHAIN);
        atom.start_timestamp = None;
        self.leave_disjoint(&mut atom);
        self.stats.inc_atoms_evicted();

        debug!(slot, atom = %atom.id, ctx = %atom.ctx, "evicted job from next");
        self.dispatch.atom_evicted(atom);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runpool_tracks_residency() {
        let mut rp = Runpool::new(2);
        assert!(rp.is_empty());

        rp.slots[1]
            .atoms
            .push_back(Atom::new(AtomId(9), ContextId(1), 0, 0x100));
        assert_eq!(rp.nr_submitted(1), 1);
        assert_eq!(rp.slots[1].position(AtomId(9)), Some(0));
        assert_eq!(rp.slots[1].position(AtomId(10)), None);
        assert!(!rp.is_empty());
    }
}
