//! Job interrupt reaping.

use std::time::Instant;

use tracing::{debug, error, warn};

use crate::atom::{exception_name, Completion, CompletionCode};
use crate::caps::HwIssue;
use crate::manager::Inner;
use crate::regs::{
    irq_done_bit, irq_fail_bit, irq_slot_bits, job_control, job_control_reg, job_slot_reg, slot,
    status,
};
use crate::reset::ResetState;
use crate::slots::{Runpool, SlotAccess};

impl Inner {
    pub(crate) fn handle_job_irq(&self, mut done: u32) {
        let mut end_timestamp = Instant::now();
        self.stats.inc_job_irqs();
        debug!(done = format_args!("{done:#010x}"), "job irq");

        self.regs.write(
            job_control_reg(job_control::JOB_IRQ_THROTTLE),
            self.config.irq_throttle_cycles,
        );

        {
            let mut rp = self.lock_runpool();
            let nr_slots = rp.slots.len();

            while done != 0 {
                let pending = (done & 0xFFFF) | (done >> 16);
                let js = pending.trailing_zeros() as usize;

                if js >= nr_slots {
                    warn!(slot = js, "job irq for a slot that does not exist");
                    self.regs
                        .write(job_control_reg(job_control::JOB_IRQ_CLEAR), irq_slot_bits(js));
                    done &= !irq_slot_bits(js);
                    continue;
                }

                loop {
                    let (code, tail) = self.classify_slot(js, done);
                    if done & irq_fail_bit(js) != 0 {
                        self.evict_behind_failure_locked(&mut rp, js);
                    }

                    self.regs.write(
                        job_control_reg(job_control::JOB_IRQ_CLEAR),
                        done & irq_slot_bits(js),
                    );
                    let mut active =
                        self.regs.read(job_control_reg(job_control::JOB_IRQ_JS_STATE));

                    if active & irq_done_bit(js) == 0 && done & irq_fail_bit(js) == 0 {
                        // The next job may have started and failed before JS_STATE was read.
                        // Keep it resident so the failure is reaped on the next pass.
                        let rawstat =
                            self.regs.read(job_control_reg(job_control::JOB_IRQ_RAWSTAT));
                        if rawstat & irq_fail_bit(js) != 0 {
                            active |= irq_done_bit(js);
                        }
                    }

                    let submitted = rp.nr_submitted(js);
                    let current_active = active & (1 << js) != 0;
                    let next_pending = active & (1 << (js + 16)) != 0;
                    let still_active = usize::from(current_active) + usize::from(next_pending);
                    let mut nr_done = submitted.saturating_sub(still_active);

                    if nr_done == 0 {
                        warn!(
                            slot = js,
                            submitted,
                            active = format_args!("{active:#x}"),
                            "spurious job interrupt"
                        );
                        self.stats.inc_spurious_irqs();
                    }

                    while nr_done > 0 {
                        if nr_done == 1 {
                            self.complete_hw_locked(&mut rp, js, code, tail, end_timestamp);
                            self.dispatch
                                .try_kick(&mut SlotAccess::new(self, &mut rp));
                        } else {
                            // Only the last job of the pass can have failed.
                            self.complete_hw_locked(
                                &mut rp,
                                js,
                                CompletionCode::Done,
                                None,
                                end_timestamp,
                            );
                        }
                        nr_done -= 1;
                    }

                    done = self.regs.read(job_control_reg(job_control::JOB_IRQ_RAWSTAT));

                    if self.caps.has_issue(HwIssue::ISSUE_10883)
                        && active & irq_done_bit(js) != 0
                        && self.regs.read(job_slot_reg(js, slot::STATUS)) == status::NOT_STARTED
                    {
                        // The job finished without raising its interrupt.
                        done |= irq_done_bit(js);
                    }

                    if done != 0 {
                        end_timestamp = Instant::now();
                    }

                    let pending = (done & 0xFFFF) | (done >> 16);
                    if pending & (1 << js) == 0 {
                        break;
                    }
                }

                self.refine_head_start(&mut rp, js, end_timestamp);
            }
        }

        if self.reset.state() == ResetState::Committed {
            self.try_reset_early();
        }
    }

    /// Reads the slot status for a failure bit in `done`.
    fn classify_slot(&self, js: usize, done: u32) -> (CompletionCode, Option<u64>) {
        if done & irq_fail_bit(js) == 0 {
            return (CompletionCode::Done, None);
        }

        let raw = self.regs.read(job_slot_reg(js, slot::STATUS));
        match raw {
            status::STOPPED => {
                let lo = self.regs.read(job_slot_reg(js, slot::TAIL_LO));
                let hi = self.regs.read(job_slot_reg(js, slot::TAIL_HI));
                let tail = u64::from(lo) | (u64::from(hi) << 32);
                debug!(slot = js, tail = format_args!("{tail:#x}"), "job soft-stopped");
                (CompletionCode::Stopped, Some(tail))
            }
            status::NOT_STARTED => {
                // A terminated job can report NOT_STARTED; the fault bit is the only evidence.
                warn!(
                    slot = js,
                    code = "TERMINATED",
                    "job reported NOT_STARTED with a failure interrupt"
                );
                (CompletionCode::Terminated, None)
            }
            other => {
                warn!(
                    slot = js,
                    code = format_args!("{other:#x}"),
                    exception = exception_name(other),
                    "error detected from slot"
                );
                (CompletionCode::from_status(other), None)
            }
        }
    }

    /// Keeps a job of the same context from starting behind one that stopped or failed.
    ///
    /// Must run before the failure bit is cleared; clearing it lets the hardware promote "next".
    fn evict_behind_failure_locked(&self, rp: &mut Runpool, js: usize) {
        let ring = &rp.slots[js];
        let same_context = match (ring.atoms.front(), ring.atoms.get(1)) {
            (Some(current), Some(next)) => current.ctx == next.ctx,
            _ => false,
        };
        if same_context {
            self.evict_next_locked(rp, js);
        }
    }

    /// Pops the oldest atom of `js` and reports it.
    pub(crate) fn complete_hw_locked(
        &self,
        rp: &mut Runpool,
        js: usize,
        code: CompletionCode,
        tail: Option<u64>,
        end_time: Instant,
    ) {
        let Some(mut atom) = rp.slots[js].atoms.pop_front() else {
            error!(slot = js, "completion for an empty slot");
            return;
        };

        atom.event_code = Some(code);
        if code != CompletionCode::Stopped {
            self.leave_disjoint(&mut atom);
        }
        self.stats.inc_atoms_reaped();

        debug!(slot = js, atom = %atom.id, ctx = %atom.ctx, ?code, "job completed");
        self.dispatch.atom_completed(
            &mut SlotAccess::new(self, rp),
            atom,
            Completion {
                code,
                tail,
                end_time,
            },
        );
    }

    /// Moves the head atom's start time up to the interrupt time minus the throttle window.
    fn refine_head_start(&self, rp: &mut Runpool, js: usize, end_timestamp: Instant) {
        let Some(head) = rp.slots[js].atoms.front_mut() else {
            return;
        };
        let Some(refined) = end_timestamp.checked_sub(self.config.irq_throttle_time) else {
            return;
        };
        match head.start_timestamp {
            Some(prev) if refined < prev => {}
            _ => head.start_timestamp = Some(refined),
        }
    }
}
