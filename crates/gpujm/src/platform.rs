//! Collaborator boundaries.
//!
//! The job manager never talks to the rest of the driver directly. Register access, the dispatch
//! queue, power management and the MMU are reached only through these traits so the core can run
//! against real hardware, the [`crate::sim`] model, or test doubles.

use std::sync::Arc;

use crate::atom::{Atom, AtomId, Completion, ContextId};
use crate::error::Result;
use crate::slots::SlotAccess;

/// 32-bit register window.
///
/// Offsets are absolute byte offsets built with the helpers in [`crate::regs`].
pub trait RegisterIo: Send + Sync {
    fn read(&self, offset: u32) -> u32;
    fn write(&self, offset: u32, value: u32);
}

/// The job dispatch queue that owns atoms and decides what runs next.
///
/// `atom_completed` and `try_kick` are called with the runpool lock held. They receive a
/// [`SlotAccess`] for submitting or inspecting slots and must not block or call back into
/// [`crate::JobManager`].
pub trait JobDispatch: Send + Sync {
    /// An atom left the hardware. Ownership of `atom` returns to the dispatch layer.
    fn atom_completed(&self, slots: &mut SlotAccess<'_>, atom: Atom, completion: Completion);

    /// `atom` was pulled back out of the "next" registers before it started.
    ///
    /// Called with the runpool lock held, possibly from inside `atom_completed` or `try_kick` when
    /// those stop atoms through their [`SlotAccess`]. The atom has not run and can be submitted
    /// again.
    fn atom_evicted(&self, atom: Atom);

    /// The last completion of an interrupt pass was reported; refill the slots.
    fn try_kick(&self, slots: &mut SlotAccess<'_>);

    /// Resubmit everything runnable after a reset. Called without locks held.
    fn schedule_all(&self);

    fn has_pullable_contexts(&self) -> bool;

    /// Whether running `affinity` on `slot` would conflict with atoms on other slots.
    fn affinity_would_violate(&self, _slot: usize, _affinity: u64) -> bool {
        false
    }
}

/// Power management hooks used around a reset.
pub trait PowerControl: Send + Sync {
    fn is_gpu_powered(&self) -> bool;

    /// Takes an active reference for the duration of a reset.
    ///
    /// Returns `true` if the GPU is idle or suspending, in which case no reference was taken and
    /// the reset must be abandoned.
    fn context_active_handle_suspend(&self) -> bool;

    /// Drops the reference taken by [`PowerControl::context_active_handle_suspend`].
    fn context_idle(&self);

    fn disable_interrupts(&self);
    fn enable_interrupts(&self);

    /// Waits for interrupt handlers that are already running to return.
    fn synchronize_irqs(&self);

    /// Physically resets the GPU.
    fn reset_hw(&self) -> Result<()>;

    fn update_cores_state_sync(&self);

    fn poweroff_pending(&self) -> bool {
        false
    }
}

/// MMU address-space manager.
pub trait AddressSpaceControl: Send + Sync {
    fn nr_address_spaces(&self) -> usize;

    /// Context currently bound to `as_nr`, if any.
    fn bound_context(&self, as_nr: usize) -> Option<ContextId>;

    /// Reprogram `as_nr` with the page tables of `ctx`.
    fn update(&self, as_nr: usize, ctx: ContextId);

    fn disable(&self, as_nr: usize);

    /// Keep poking the MMU on behalf of `atom` while its slot is soft-stopped.
    fn retain_poking(&self, ctx: ContextId, atom: AtomId);

    /// Drain deferred MMU fault work before a reset.
    fn flush_workqueues(&self) {}
}

/// The set of collaborators a [`crate::JobManager`] is built over.
#[derive(Clone)]
pub struct Platform {
    pub regs: Arc<dyn RegisterIo>,
    pub dispatch: Arc<dyn JobDispatch>,
    pub power: Arc<dyn PowerControl>,
    pub mmu: Arc<dyn AddressSpaceControl>,
}
