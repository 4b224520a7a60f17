//! Soft/hard stop issuing and disjoint accounting.

use bitflags::bitflags;
use tracing::{debug, error, warn};

use crate::atom::{Atom, AtomFlags, AtomId, ContextId, CoreReq};
use crate::caps::{HwFeature, HwIssue};
use crate::manager::Inner;
use crate::regs::{command, job_slot_reg, slot};
use crate::slots::Runpool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    /// Stop at the next resumable boundary; the job reports `STOPPED` and a tail pointer.
    Soft,
    /// Stop immediately; the job is lost.
    Hard,
}

bitflags! {
    /// Caller-supplied stop modifiers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StopFlags: u32 {
        /// The soft-stop interrupts the atom's progress (preemption rather than a scheduling
        /// tick), so GPU timing becomes unreliable.
        const CAUSES_DISJOINT = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopOutcome {
    Skipped,
    /// The atom was still in "next" and went back to the dispatch layer.
    Evicted,
    /// A stop command was written.
    Issued,
}

impl Inner {
    pub(crate) fn soft_stop_allowed(&self, atom: &Atom) -> bool {
        if atom.is_secure() {
            return false;
        }
        !(self.caps.has_issue(HwIssue::ISSUE_8408) && atom.core_req.contains(CoreReq::T))
    }

    pub(crate) fn hard_stop_allowed(&self, core_req: CoreReq) -> bool {
        !(self.caps.has_issue(HwIssue::ISSUE_8394) && core_req.contains(CoreReq::T))
    }

    /// Issues a stop against `target` (or the current atom) on `slot`.
    ///
    /// A target still waiting in "next" is evicted instead. Returns whether anything was stopped
    /// or evicted.
    pub(crate) fn stop_locked(
        &self,
        rp: &mut Runpool,
        slot: usize,
        target: Option<AtomId>,
        kind: StopKind,
        flags: StopFlags,
    ) -> bool {
        self.stop_target_locked(rp, slot, target, kind, flags) != StopOutcome::Skipped
    }

    fn stop_target_locked(
        &self,
        rp: &mut Runpool,
        slot: usize,
        target: Option<AtomId>,
        kind: StopKind,
        flags: StopFlags,
    ) -> StopOutcome {
        assert!(slot < rp.slots.len(), "stop on slot {slot} out of range");

        let ring = &rp.slots[slot];
        let idx = match target {
            Some(id) => ring.position(id),
            None => (!ring.atoms.is_empty()).then_some(0),
        };
        match idx {
            Some(0) => self.stop_index_locked(rp, slot, 0, kind, flags),
            Some(idx) => {
                if self.evict_next_locked(rp, slot) {
                    StopOutcome::Evicted
                } else {
                    // Current already finished on the hardware and the target is running.
                    self.stop_index_locked(rp, slot, idx, kind, flags)
                }
            }
            None => {
                debug!(slot, ?target, ?kind, "no atom to stop");
                StopOutcome::Skipped
            }
        }
    }

    /// Hard-stops every atom of `ctx` on `slot`: "next" is evicted, then current is stopped.
    fn stop_context_locked(&self, rp: &mut Runpool, ctx: ContextId, slot: usize) -> StopOutcome {
        let ring = &rp.slots[slot];
        let current_matches = ring.atoms.front().is_some_and(|a| a.ctx == ctx);
        let next_matches = ring.atoms.get(1).is_some_and(|a| a.ctx == ctx);

        let mut evicted = false;
        if next_matches {
            evicted = self.evict_next_locked(rp, slot);
            if !evicted {
                return self.stop_index_locked(rp, slot, 1, StopKind::Hard, StopFlags::empty());
            }
        }
        if !current_matches {
            if evicted {
                return StopOutcome::Evicted;
            }
            debug!(slot, %ctx, "no job of context on slot");
            return StopOutcome::Skipped;
        }

        match self.stop_index_locked(rp, slot, 0, StopKind::Hard, StopFlags::empty()) {
            StopOutcome::Skipped if evicted => StopOutcome::Evicted,
            outcome => outcome,
        }
    }

    /// Writes the stop command for the resident atom at `idx`, which the hardware is running.
    fn stop_index_locked(
        &self,
        rp: &mut Runpool,
        slot: usize,
        idx: usize,
        kind: StopKind,
        flags: StopFlags,
    ) -> StopOutcome {
        let disambiguate = self.caps.has_feature(HwFeature::JOBCHAIN_DISAMBIGUATION);
        let Some(atom) = rp.slots[slot].atoms.get_mut(idx) else {
            return StopOutcome::Skipped;
        };

        self.enter_disjoint(atom, kind, flags);

        let chain_flag = atom.flags.contains(AtomFlags::JOBCHAIN);
        let action = match kind {
            StopKind::Soft => {
                if !self.soft_stop_allowed(atom) {
                    debug!(slot, atom = %atom.id, core_req = ?atom.core_req, "soft-stop not allowed");
                    return StopOutcome::Skipped;
                }
                atom.flags.insert(AtomFlags::BEEN_SOFT_STOPPED);
                match (disambiguate, chain_flag) {
                    (false, _) => command::SOFT_STOP,
                    (true, false) => command::SOFT_STOP_0,
                    (true, true) => command::SOFT_STOP_1,
                }
            }
            StopKind::Hard => {
                if !self.hard_stop_allowed(atom.core_req) {
                    warn!(
                        slot,
                        atom = %atom.id,
                        core_req = ?atom.core_req,
                        "hard-stop not allowed; relying on the reset watchdog"
                    );
                    return StopOutcome::Skipped;
                }
                atom.flags.insert(AtomFlags::BEEN_HARD_STOPPED);
                match (disambiguate, chain_flag) {
                    (false, _) => command::HARD_STOP,
                    (true, false) => command::HARD_STOP_0,
                    (true, true) => command::HARD_STOP_1,
                }
            }
        };
        let id = atom.id;

        if kind == StopKind::Soft && self.caps.has_issue(HwIssue::ISSUE_8316) {
            for resident in &rp.slots[slot].atoms {
                self.mmu.retain_poking(resident.ctx, resident.id);
            }
        }

        self.regs.write(job_slot_reg(slot, slot::COMMAND), action);
        match kind {
            StopKind::Soft => self.stats.inc_soft_stops(),
            StopKind::Hard => self.stats.inc_hard_stops(),
        }
        debug!(slot, atom = %id, ?kind, action, "stop issued");
        StopOutcome::Issued
    }

    /// Hard-stops `target`, or with no target every atom of `ctx` on `slot`.
    ///
    /// On hardware where hard-stops leave the GPU in a bad state this also starts a reset.
    pub(crate) fn hard_stop_locked(
        &self,
        rp: &mut Runpool,
        ctx: ContextId,
        slot: usize,
        target: Option<AtomId>,
    ) -> bool {
        assert!(slot < rp.slots.len(), "hard-stop on slot {slot} out of range");

        let ring = &rp.slots[slot];
        let may_hit_afbc = self.caps.has_issue(HwIssue::ISSUE_T76X_3542)
            && match target {
                Some(id) => ring
                    .atoms
                    .iter()
                    .any(|a| a.id == id && a.core_req.contains(CoreReq::FS_AFBC)),
                None => ring
                    .atoms
                    .iter()
                    .any(|a| a.ctx == ctx && a.core_req.contains(CoreReq::FS_AFBC)),
            };

        let outcome = match target {
            Some(id) => {
                self.stop_target_locked(rp, slot, Some(id), StopKind::Hard, StopFlags::empty())
            }
            None => self.stop_context_locked(rp, ctx, slot),
        };

        let needs_reset = self.caps.has_issue(HwIssue::ISSUE_8401)
            || self.caps.has_issue(HwIssue::ISSUE_9510)
            || may_hit_afbc;
        if outcome == StopOutcome::Issued && needs_reset && self.prepare_reset_locked(rp) {
            error!(slot, %ctx, "issuing GPU soft-reset after hard-stopping jobs");
            if let Err(err) = self.commit_reset_locked(rp) {
                error!(%err, "failed to commit reset after hard-stop");
            }
        }
        outcome != StopOutcome::Skipped
    }

    pub(crate) fn check_context_priority_locked(
        &self,
        rp: &mut Runpool,
        ctx: ContextId,
        target: &Atom,
    ) {
        let Some(ring) = rp.slots.get(target.slot) else {
            return;
        };
        let lower: Vec<AtomId> = ring
            .atoms
            .iter()
            .filter(|a| a.ctx == ctx && a.sched_priority > target.sched_priority)
            .map(|a| a.id)
            .collect();

        // Evict "next" before stopping current.
        for id in lower.into_iter().rev() {
            debug!(slot = target.slot, atom = %id, by = %target.id, "soft-stopping lower priority job");
            self.stop_locked(rp, target.slot, Some(id), StopKind::Soft, StopFlags::empty());
        }
    }

    pub(crate) fn enter_disjoint(&self, atom: &mut Atom, kind: StopKind, flags: StopFlags) {
        let eligible = match kind {
            StopKind::Hard => self.hard_stop_allowed(atom.core_req),
            StopKind::Soft => {
                self.soft_stop_allowed(atom) && flags.contains(StopFlags::CAUSES_DISJOINT)
            }
        };
        if !eligible || atom.flags.contains(AtomFlags::IN_DISJOINT) {
            return;
        }
        atom.flags.insert(AtomFlags::IN_DISJOINT);
        self.disjoint.up();
    }

    pub(crate) fn leave_disjoint(&self, atom: &mut Atom) {
        if atom.flags.contains(AtomFlags::IN_DISJOINT) {
            atom.flags.remove(AtomFlags::IN_DISJOINT);
            self.disjoint.down();
        }
    }
}
