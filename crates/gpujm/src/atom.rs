use std::fmt;
use std::time::Instant;

use bitflags::bitflags;

use crate::regs::status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtomId(pub u32);

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "atom#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

bitflags! {
    /// Core requirements declared by the submitter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CoreReq: u16 {
        const FS = 1 << 0;
        const CS = 1 << 1;
        /// Tiler job.
        const T = 1 << 2;
        /// Fragment job writing an AFBC-compressed framebuffer.
        const FS_AFBC = 1 << 13;
    }
}

bitflags! {
    /// Flags the job manager keeps on an atom.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AtomFlags: u32 {
        const BEEN_SOFT_STOPPED = 1 << 0;
        const BEEN_HARD_STOPPED = 1 << 1;
        const IN_DISJOINT = 1 << 2;
        /// The atom was submitted with `JS_CONFIG.JOB_CHAIN_FLAG` set.
        const JOBCHAIN = 1 << 3;
        /// Protected-mode atom; never soft-stopped.
        const SECURE = 1 << 4;
    }
}

/// Outcome of an atom as reported to the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    Done,
    /// Soft-stopped at a resumable boundary; resubmit from the tail pointer.
    Stopped,
    /// Hard-stopped.
    Terminated,
    /// Removed from the hardware by a GPU reset.
    Cancelled,
    /// Any other hardware status (job or instruction fault).
    Fault(u32),
}

impl CompletionCode {
    pub const JOB_CANCELLED_RAW: u32 = 0x4002;

    pub fn from_status(raw: u32) -> Self {
        match raw {
            status::DONE => Self::Done,
            status::STOPPED => Self::Stopped,
            status::TERMINATED => Self::Terminated,
            Self::JOB_CANCELLED_RAW => Self::Cancelled,
            other => Self::Fault(other),
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Done => status::DONE,
            Self::Stopped => status::STOPPED,
            Self::Terminated => status::TERMINATED,
            Self::Cancelled => Self::JOB_CANCELLED_RAW,
            Self::Fault(raw) => raw,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Done
    }
}

/// Human-readable name for a `JS_STATUS` value.
pub fn exception_name(raw: u32) -> &'static str {
    match raw {
        0x00 => "NOT_STARTED",
        0x01 => "DONE",
        0x03 => "STOPPED",
        0x04 => "TERMINATED",
        0x08 => "ACTIVE",
        0x40 => "JOB_CONFIG_FAULT",
        0x41 => "JOB_POWER_FAULT",
        0x42 => "JOB_READ_FAULT",
        0x43 => "JOB_WRITE_FAULT",
        0x44 => "JOB_AFFINITY_FAULT",
        0x48 => "JOB_BUS_FAULT",
        0x50 => "INSTR_INVALID_PC",
        0x51 => "INSTR_INVALID_ENC",
        0x52 => "INSTR_TYPE_MISMATCH",
        0x53 => "INSTR_OPERAND_FAULT",
        0x54 => "INSTR_TLS_FAULT",
        0x55 => "INSTR_BARRIER_FAULT",
        0x56 => "INSTR_ALIGN_FAULT",
        0x58 => "DATA_INVALID_FAULT",
        0x59 => "TILE_RANGE_FAULT",
        0x5A => "ADDR_RANGE_FAULT",
        0x60 => "OUT_OF_MEMORY",
        _ => "UNKNOWN",
    }
}

/// Completion details passed to [`crate::JobDispatch::atom_completed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub code: CompletionCode,
    /// Resume address for a soft-stopped job chain.
    pub tail: Option<u64>,
    pub end_time: Instant,
}

/// One job chain submitted to a job slot.
///
/// The dispatch layer owns atoms; the job manager holds an atom by value from [`crate::JobManager::submit`]
/// until it hands it back through [`crate::JobDispatch::atom_completed`].
#[derive(Debug, Clone)]
pub struct Atom {
    pub id: AtomId,
    pub ctx: ContextId,
    /// Address space the owning context is bound to.
    pub as_nr: u8,
    /// Job chain head GPU address.
    pub jc: u64,
    pub affinity: u64,
    pub core_req: CoreReq,
    pub flags: AtomFlags,
    /// Lower value = higher priority.
    pub sched_priority: i32,
    pub flush_id: u32,
    pub slot: usize,
    pub start_timestamp: Option<Instant>,
    pub event_code: Option<CompletionCode>,
}

impl Atom {
    pub fn new(id: AtomId, ctx: ContextId, as_nr: u8, jc: u64) -> Self {
        Self {
            id,
            ctx,
            as_nr,
            jc,
            affinity: 1,
            core_req: CoreReq::empty(),
            flags: AtomFlags::empty(),
            sched_priority: 0,
            flush_id: 0,
            slot: 0,
            start_timestamp: None,
            event_code: None,
        }
    }

    pub fn with_affinity(mut self, affinity: u64) -> Self {
        self.affinity = affinity;
        self
    }

    pub fn with_core_req(mut self, core_req: CoreReq) -> Self {
        self.core_req = core_req;
        self
    }

    pub fn with_priority(mut self, sched_priority: i32) -> Self {
        self.sched_priority = sched_priority;
        self
    }

    pub fn with_flush_id(mut self, flush_id: u32) -> Self {
        self.flush_id = flush_id;
        self
    }

    pub fn secure(mut self) -> Self {
        self.flags |= AtomFlags::SECURE;
        self
    }

    pub fn is_secure(&self) -> bool {
        self.flags.contains(AtomFlags::SECURE)
    }
}
