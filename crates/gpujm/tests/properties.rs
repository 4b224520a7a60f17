#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::collections::{HashMap, HashSet};

use common::{atom, harness, Harness};
use gpujm::{AtomId, ContextId, GpuCaps, HwFeature, HwIssue, StopFlags};
use proptest::prelude::*;

const NR_SLOTS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Submit { slot: usize, ctx: u32 },
    Complete(usize),
    Fault { slot: usize, code: u32 },
    SoftStop { slot: usize, disjoint: bool },
    HardStop(usize),
    Irq,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    let slot = 0..NR_SLOTS;
    prop_oneof![
        3 => (slot.clone(), 1u32..3).prop_map(|(slot, ctx)| Op::Submit { slot, ctx }),
        3 => slot.clone().prop_map(Op::Complete),
        1 => (slot.clone(), prop_oneof![Just(0x40u32), Just(0x42), Just(0x58), Just(0x60)])
            .prop_map(|(slot, code)| Op::Fault { slot, code }),
        1 => (slot.clone(), any::<bool>()).prop_map(|(slot, disjoint)| Op::SoftStop { slot, disjoint }),
        1 => slot.prop_map(Op::HardStop),
        3 => Just(Op::Irq),
    ]
}

fn caps_strategy() -> impl Strategy<Value = GpuCaps> {
    prop_oneof![
        Just(GpuCaps::default()),
        Just(GpuCaps::new(
            HwFeature::JOBCHAIN_DISAMBIGUATION,
            HwIssue::empty()
        )),
    ]
}

struct Model {
    next_id: u32,
    submitted: HashMap<usize, Vec<AtomId>>,
    slot_of: HashMap<AtomId, usize>,
}

impl Model {
    fn new() -> Self {
        Self {
            next_id: 1,
            submitted: HashMap::new(),
            slot_of: HashMap::new(),
        }
    }
}

fn check_after_irq(h: &Harness, model: &Model) -> Result<(), TestCaseError> {
    let stats = h.jm.stats();
    prop_assert!(stats.atoms_reaped + stats.atoms_evicted <= stats.atoms_submitted);

    for slot in 0..NR_SLOTS {
        prop_assert_eq!(
            h.jm.nr_atoms_submitted(slot),
            h.gpu.nr_resident(slot),
            "slot {} residency diverged",
            slot
        );
    }

    let mut reaped: HashMap<usize, Vec<AtomId>> = HashMap::new();
    for (id, _) in h.dispatch.completions() {
        reaped.entry(model.slot_of[&id]).or_default().push(id);
    }
    // Evicted atoms leave "next" without running; everything else retires in submission order.
    let evicted: HashSet<AtomId> = h.dispatch.evicted_ids().into_iter().collect();
    for (slot, ids) in &reaped {
        let order: Vec<AtomId> = model.submitted[slot]
            .iter()
            .copied()
            .filter(|id| !evicted.contains(id))
            .collect();
        prop_assert!(ids.len() <= order.len());
        prop_assert_eq!(ids.as_slice(), &order[..ids.len()], "slot {} reaped out of order", slot);
    }
    Ok(())
}

fn drain(h: &Harness) {
    for _ in 0..4 {
        for slot in 0..NR_SLOTS {
            while h.gpu.complete_current(slot) {}
        }
        h.irq();
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]
    #[test]
    fn slots_stay_consistent_under_random_traffic(
        caps in caps_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..60),
    ) {
        let h = harness(caps);
        let mut model = Model::new();

        for op in &ops {
            match *op {
                Op::Submit { slot, ctx } => {
                    if !h.jm.with_slots(|s| s.is_next_free(slot)) {
                        continue;
                    }
                    let id = model.next_id;
                    model.next_id += 1;
                    h.jm.submit(atom(id, ctx), slot);
                    model.submitted.entry(slot).or_default().push(AtomId(id));
                    model.slot_of.insert(AtomId(id), slot);
                }
                Op::Complete(slot) => {
                    h.gpu.complete_current(slot);
                }
                Op::Fault { slot, code } => {
                    h.gpu.fault_current(slot, code);
                }
                Op::SoftStop { slot, disjoint } => {
                    let flags = if disjoint { StopFlags::CAUSES_DISJOINT } else { StopFlags::empty() };
                    h.jm.soft_stop_with_flags(slot, None, flags);
                }
                Op::HardStop(slot) => {
                    let ctx = h.jm.with_slots(|s| s.inspect(slot, 0).map(|a| a.ctx));
                    h.jm.hard_stop(ctx.unwrap_or(ContextId(1)), slot, None);
                }
                Op::Irq => {
                    h.irq();
                    check_after_irq(&h, &model)?;
                }
            }
        }

        drain(&h);
        check_after_irq(&h, &model)?;
        for slot in 0..NR_SLOTS {
            prop_assert_eq!(h.jm.nr_atoms_submitted(slot), 0);
        }

        let stats = h.jm.stats();
        prop_assert_eq!(stats.atoms_reaped + stats.atoms_evicted, stats.atoms_submitted);
        prop_assert_eq!(stats.atoms_evicted as usize, h.dispatch.evicted().len());
        prop_assert_eq!(stats.resets_prepared, 0);

        // Soft-stopped atoms keep their disjoint period until the owner retires them.
        for mut returned in h.dispatch.take_returned() {
            h.jm.leave_disjoint(&mut returned);
        }
        prop_assert_eq!(h.jm.disjoint_count(), 0);
    }
}
