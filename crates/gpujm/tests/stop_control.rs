mod common;

use std::time::Duration;

use common::{atom, harness, wait_until};
use gpujm::regs::{command, job_slot_reg, slot};
use gpujm::sim::PlatformEvent;
use gpujm::{
    AtomFlags, AtomId, CompletionCode, ContextId, CoreReq, GpuCaps, HwFeature, HwIssue,
    ResetState, StopFlags, StopKind,
};
use pretty_assertions::assert_eq;

fn commands(h: &common::Harness, js: usize) -> Vec<u32> {
    h.gpu.writes_to(job_slot_reg(js, slot::COMMAND))
}

fn next_commands(h: &common::Harness, js: usize) -> Vec<u32> {
    h.gpu.writes_to(job_slot_reg(js, slot::COMMAND_NEXT))
}

#[test]
fn secure_atom_is_never_soft_stopped() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1).secure(), 0);

    assert!(!h.jm.soft_stop(0, None));
    assert!(commands(&h, 0).is_empty());
    assert!(h.gpu.is_running(0));
}

#[test]
fn tiler_soft_stop_depends_on_erratum_8408() {
    let h = harness(GpuCaps::new(HwFeature::empty(), HwIssue::ISSUE_8408));
    h.jm.submit(atom(1, 1).with_core_req(CoreReq::T), 0);
    assert!(!h.jm.soft_stop(0, None));
    assert!(commands(&h, 0).is_empty());

    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1).with_core_req(CoreReq::T), 0);
    assert!(h.jm.soft_stop(0, None));
    assert_eq!(commands(&h, 0), vec![command::SOFT_STOP]);
}

#[test]
fn tiler_hard_stop_dropped_on_erratum_8394() {
    let h = harness(GpuCaps::new(HwFeature::empty(), HwIssue::ISSUE_8394));
    h.jm.submit(atom(1, 1).with_core_req(CoreReq::T), 0);

    assert!(!h.jm.hard_stop(ContextId(1), 0, None));
    assert!(commands(&h, 0).is_empty());
    assert_eq!(h.jm.disjoint_count(), 0);
}

#[test]
fn disambiguated_stops_follow_job_chain_flag() {
    let h = harness(GpuCaps::new(
        HwFeature::JOBCHAIN_DISAMBIGUATION,
        HwIssue::empty(),
    ));
    h.jm.submit(atom(1, 1), 0);
    h.jm.submit(atom(2, 2), 0);

    assert!(h.jm.soft_stop(0, None));
    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Stopped)]
    );

    // Atom 2 was submitted without the chain flag and is now current.
    assert!(h.jm.hard_stop(ContextId(2), 0, Some(AtomId(2))));
    assert_eq!(
        commands(&h, 0),
        vec![command::SOFT_STOP_1, command::HARD_STOP_0]
    );
}

#[test]
fn stop_flags_are_recorded_on_the_atom() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1), 0);
    h.jm.soft_stop(0, Some(AtomId(1)));
    h.irq();

    let returned = h.dispatch.returned();
    assert!(returned[0].flags.contains(AtomFlags::BEEN_SOFT_STOPPED));
    assert!(!returned[0].flags.contains(AtomFlags::BEEN_HARD_STOPPED));
}

#[test]
fn queued_target_is_evicted_instead_of_stopped() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1), 0);
    h.jm.submit(atom(2, 1), 0);

    assert!(h.jm.soft_stop(0, Some(AtomId(2))));
    assert!(commands(&h, 0).is_empty());
    assert_eq!(
        next_commands(&h, 0),
        vec![command::START, command::START, command::NOP]
    );
    assert_eq!(h.dispatch.evicted_ids(), vec![AtomId(2)]);
    assert!(!h.dispatch.evicted()[0]
        .flags
        .contains(AtomFlags::BEEN_SOFT_STOPPED));
    assert_eq!(h.resident(0), vec![AtomId(1)]);
    assert_eq!(h.gpu.nr_resident(0), 1);
    assert_eq!(h.jm.stats().atoms_evicted, 1);

    assert!(!h.jm.soft_stop(0, Some(AtomId(99))));

    h.gpu.complete_current(0);
    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Done)]
    );
    assert!(!h.gpu.is_running(0));
}

#[test]
fn promoted_target_is_stopped_on_the_hardware() {
    let h = harness(GpuCaps::new(
        HwFeature::JOBCHAIN_DISAMBIGUATION,
        HwIssue::empty(),
    ));
    h.jm.submit(atom(1, 1), 0);
    h.jm.submit(atom(2, 1), 0);
    // Atom 1 finished and atom 2 started; the interrupt is still pending.
    h.gpu.complete_current(0);

    assert!(h.jm.hard_stop(ContextId(1), 0, Some(AtomId(2))));
    assert!(h.dispatch.evicted().is_empty());
    assert_eq!(commands(&h, 0), vec![command::HARD_STOP_0]);

    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![
            (AtomId(1), CompletionCode::Done),
            (AtomId(2), CompletionCode::Terminated),
        ]
    );
    assert_eq!(h.jm.nr_atoms_submitted(0), 0);
}

#[test]
fn soft_stop_keeps_mmu_poking_on_erratum_8316() {
    let h = harness(GpuCaps::new(HwFeature::empty(), HwIssue::ISSUE_8316));
    h.jm.submit(atom(1, 1), 0);
    h.jm.submit(atom(2, 3), 0);
    h.jm.soft_stop(0, None);

    let pokes: Vec<PlatformEvent> = h
        .platform
        .events()
        .into_iter()
        .filter(|e| matches!(e, PlatformEvent::RetainPoking(..)))
        .collect();
    assert_eq!(
        pokes,
        vec![
            PlatformEvent::RetainPoking(ContextId(1), AtomId(1)),
            PlatformEvent::RetainPoking(ContextId(3), AtomId(2)),
        ]
    );
}

#[test]
fn soft_stop_enters_disjoint_only_when_asked() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1), 0);
    h.jm.soft_stop(0, None);
    assert_eq!(h.jm.disjoint_count(), 0);
    h.irq();

    h.jm.submit(atom(2, 1), 0);
    h.jm.soft_stop_with_flags(0, None, StopFlags::CAUSES_DISJOINT);
    assert_eq!(h.jm.disjoint_count(), 1);
    h.irq();

    // Soft-stopped atoms stay disjoint until their final outcome.
    assert_eq!(h.jm.disjoint_count(), 1);
    let stopped = h.dispatch.take_returned().pop().expect("stopped atom");
    assert!(stopped.flags.contains(AtomFlags::IN_DISJOINT));

    h.jm.submit(stopped, 0);
    h.gpu.complete_current(0);
    h.irq();
    assert_eq!(h.jm.disjoint_count(), 0);

    let mut done = h.dispatch.take_returned().pop().expect("finished atom");
    assert!(!done.flags.contains(AtomFlags::IN_DISJOINT));
    h.jm.leave_disjoint(&mut done);
    assert_eq!(h.jm.disjoint_count(), 0);
}

#[test]
fn enter_disjoint_is_idempotent_per_atom() {
    let h = harness(GpuCaps::default());
    let mut a = atom(1, 1);

    h.jm.enter_disjoint(&mut a, StopKind::Hard, StopFlags::empty());
    h.jm.enter_disjoint(&mut a, StopKind::Hard, StopFlags::empty());
    assert_eq!(h.jm.disjoint_count(), 1);

    h.jm.leave_disjoint(&mut a);
    h.jm.leave_disjoint(&mut a);
    assert_eq!(h.jm.disjoint_count(), 0);

    let mut secure = atom(2, 1).secure();
    h.jm.enter_disjoint(&mut secure, StopKind::Soft, StopFlags::CAUSES_DISJOINT);
    assert_eq!(h.jm.disjoint_count(), 0);
}

#[test]
fn hard_stop_disjoint_ends_on_termination() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1), 0);
    assert!(h.jm.hard_stop(ContextId(1), 0, None));
    assert_eq!(h.jm.disjoint_count(), 1);

    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Terminated)]
    );
    assert_eq!(h.jm.disjoint_count(), 0);
    assert!(h.dispatch.returned()[0]
        .flags
        .contains(AtomFlags::BEEN_HARD_STOPPED));
}

#[test]
fn context_hard_stop_ignores_other_contexts() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 2), 0);
    assert!(!h.jm.hard_stop(ContextId(1), 0, None));
    assert!(commands(&h, 0).is_empty());
}

#[test]
fn hard_stop_on_erratum_8401_resets_the_gpu() {
    let h = harness(GpuCaps::new(HwFeature::empty(), HwIssue::ISSUE_8401));
    h.jm.submit(atom(1, 1), 0);
    assert!(h.jm.hard_stop(ContextId(1), 0, None));
    assert_eq!(h.jm.reset_state(), ResetState::Committed);

    h.irq();
    assert!(h.jm.wait_reset_complete_timeout(Duration::from_secs(5)));
    assert!(wait_until(Duration::from_secs(5), || h.jm.stats().resets_completed == 1));
    assert_eq!(h.jm.stats().early_resets, 1);
    assert_eq!(h.gpu.reset_count(), 1);
    assert_eq!(h.jm.disjoint_count(), 0);
}

#[test]
fn afbc_hard_stop_resets_only_when_afbc_may_be_hit() {
    let caps = GpuCaps::new(HwFeature::empty(), HwIssue::ISSUE_T76X_3542);

    let h = harness(caps);
    h.jm.submit(atom(1, 1).with_core_req(CoreReq::FS), 0);
    assert!(h.jm.hard_stop(ContextId(1), 0, None));
    assert_eq!(h.jm.reset_state(), ResetState::NotPending);

    let h = harness(caps);
    h.jm.submit(atom(1, 1).with_core_req(CoreReq::FS | CoreReq::FS_AFBC), 0);
    assert!(h.jm.hard_stop(ContextId(1), 0, None));
    assert_ne!(h.jm.reset_state(), ResetState::NotPending);
    h.irq();
    assert!(h.jm.wait_reset_complete_timeout(Duration::from_secs(5)));
}

#[test]
fn kill_context_jobs_hard_stops_only_that_context() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1), 0);
    h.jm.submit(atom(2, 1), 1);
    h.jm.submit(atom(3, 2), 2);

    h.jm.kill_context_jobs(ContextId(1));
    assert_eq!(commands(&h, 0), vec![command::HARD_STOP]);
    assert_eq!(commands(&h, 1), vec![command::HARD_STOP]);
    assert!(commands(&h, 2).is_empty());
}

#[test]
fn kill_context_jobs_evicts_its_atom_queued_behind_another_context() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 2), 0);
    h.jm.submit(atom(2, 1), 0);

    h.jm.kill_context_jobs(ContextId(1));
    assert!(commands(&h, 0).is_empty());
    assert_eq!(
        next_commands(&h, 0),
        vec![command::START, command::START, command::NOP]
    );
    assert_eq!(h.dispatch.evicted_ids(), vec![AtomId(2)]);
    assert_eq!(h.resident(0), vec![AtomId(1)]);

    h.gpu.complete_current(0);
    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Done)]
    );
    assert!(!h.gpu.is_running(0));
    assert_eq!(h.jm.nr_atoms_submitted(0), 0);
}

#[test]
fn kill_context_jobs_evicts_next_before_stopping_current() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1), 0);
    h.jm.submit(atom(2, 1), 0);

    h.jm.kill_context_jobs(ContextId(1));
    let writes = h.gpu.writes();
    let nop = writes
        .iter()
        .position(|w| *w == (job_slot_reg(0, slot::COMMAND_NEXT), command::NOP))
        .expect("next evicted");
    let stop = writes
        .iter()
        .position(|w| *w == (job_slot_reg(0, slot::COMMAND), command::HARD_STOP))
        .expect("current stopped");
    assert!(nop < stop);
    assert_eq!(h.dispatch.evicted_ids(), vec![AtomId(2)]);

    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Terminated)]
    );
    assert_eq!(h.gpu.nr_resident(0), 0);
    assert_eq!(h.jm.nr_atoms_submitted(0), 0);
}

#[test]
fn kill_context_jobs_stops_its_atom_once_promoted() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 2), 0);
    h.jm.submit(atom(2, 1), 0);
    h.gpu.complete_current(0);

    h.jm.kill_context_jobs(ContextId(1));
    assert!(h.dispatch.evicted().is_empty());
    assert_eq!(commands(&h, 0), vec![command::HARD_STOP]);

    h.irq();
    assert_eq!(
        h.dispatch.completions(),
        vec![
            (AtomId(1), CompletionCode::Done),
            (AtomId(2), CompletionCode::Terminated),
        ]
    );
}

#[test]
fn higher_priority_atom_evicts_lower_priority_sibling_in_next() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1).with_priority(0), 0);
    h.jm.submit(atom(2, 1).with_priority(5), 0);

    let mut urgent = atom(3, 1).with_priority(1);
    urgent.slot = 0;
    h.jm.check_context_priority(ContextId(1), &urgent);

    assert!(commands(&h, 0).is_empty());
    assert_eq!(h.dispatch.evicted_ids(), vec![AtomId(2)]);
    assert_eq!(h.resident(0), vec![AtomId(1)]);
}

#[test]
fn higher_priority_atom_soft_stops_lower_priority_sibling() {
    let h = harness(GpuCaps::default());
    h.jm.submit(atom(1, 1).with_priority(5), 0);

    let mut other_ctx = atom(9, 2).with_priority(0);
    other_ctx.slot = 0;
    h.jm.check_context_priority(ContextId(2), &other_ctx);
    assert!(commands(&h, 0).is_empty());

    let mut urgent = atom(2, 1).with_priority(1);
    urgent.slot = 0;
    h.jm.check_context_priority(ContextId(1), &urgent);
    assert_eq!(commands(&h, 0), vec![command::SOFT_STOP]);
}
