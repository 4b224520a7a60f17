//! GPU job-slot scheduling and hardware recovery.
//!
//! This crate drives the job-manager block of a tile-based GPU: it writes job chains into the
//! hardware slots, reaps completion and fault interrupts, issues soft/hard stops, and runs the
//! full-device reset sequence when the hardware misbehaves or a context will not drain.
//!
//! Everything outside that core is reached through the traits in [`platform`]: register access
//! ([`RegisterIo`]), the dispatch queue that owns atoms ([`JobDispatch`]), power management
//! ([`PowerControl`]) and the MMU ([`AddressSpaceControl`]). [`sim`] contains a register-level
//! model of the job slots for tests and the `gpujm-sim` driver.
//!
//! ## Locking
//!
//! One mutex (the runpool lock) protects slot residency. The interrupt path holds it while it
//! reports completions, so [`JobDispatch::atom_completed`] and [`JobDispatch::try_kick`] receive a
//! [`SlotAccess`] instead of re-entering [`JobManager`]. Resets run on a dedicated worker thread;
//! the reset and context-teardown watchdogs run on short-lived timer threads.

#![forbid(unsafe_code)]

pub mod atom;
pub mod caps;
pub mod config;
pub mod context;
pub mod error;
pub mod instr;
pub mod platform;
pub mod regs;
pub mod reset;
pub mod sim;
pub mod stats;
pub mod stop;
pub mod zap;

mod disjoint;
mod irq;
mod manager;
mod slots;
mod sync;
mod timer;

pub use atom::{Atom, AtomFlags, AtomId, Completion, CompletionCode, ContextId, CoreReq};
pub use caps::{GpuCaps, HwFeature, HwIssue};
pub use config::JmConfig;
pub use context::Context;
pub use error::{JmError, Result};
pub use instr::{HwcntSetup, InstrState, Instrumentation};
pub use manager::JobManager;
pub use platform::{AddressSpaceControl, JobDispatch, Platform, PowerControl, RegisterIo};
pub use reset::ResetState;
pub use slots::SlotAccess;
pub use stats::JmStatsSnapshot;
pub use stop::{StopFlags, StopKind};
pub use zap::{DrainOutcome, ZapStage};
