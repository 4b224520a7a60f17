//! Job-manager register map.
//!
//! Offsets are byte offsets into the GPU register window. Job-slot registers live in a block of
//! [`slot::STRIDE`] bytes per slot starting at [`slot::BASE`]; use [`job_slot_reg`],
//! [`job_control_reg`] and [`gpu_control_reg`] to build absolute offsets for
//! [`crate::RegisterIo`].

/// Maximum number of job slots the register map can address (one done/fail bit pair per slot in
/// the 32-bit IRQ registers).
pub const MAX_JOB_SLOTS: usize = 16;

pub const GPU_CONTROL_BASE: u32 = 0x0000;
pub const JOB_CONTROL_BASE: u32 = 0x1000;
pub const MMU_BASE: u32 = 0x2000;

pub const fn gpu_control_reg(offset: u32) -> u32 {
    GPU_CONTROL_BASE + offset
}

pub const fn job_control_reg(offset: u32) -> u32 {
    JOB_CONTROL_BASE + offset
}

pub const fn mmu_reg(offset: u32) -> u32 {
    MMU_BASE + offset
}

pub const fn job_slot_reg(slot: usize, offset: u32) -> u32 {
    JOB_CONTROL_BASE + slot::BASE + (slot as u32) * slot::STRIDE + offset
}

pub mod gpu_control {
    pub const GPU_IRQ_RAWSTAT: u32 = 0x020;
    pub const GPU_IRQ_MASK: u32 = 0x028;
    pub const GPU_STATUS: u32 = 0x034;
    pub const LATEST_FLUSH: u32 = 0x038;
    pub const GPU_FAULTSTATUS: u32 = 0x03C;
    pub const PWR_OVERRIDE0: u32 = 0x054;
    pub const PWR_OVERRIDE1: u32 = 0x058;
    pub const PRFCNT_BASE_LO: u32 = 0x060;
    pub const PRFCNT_BASE_HI: u32 = 0x064;
    pub const PRFCNT_CONFIG: u32 = 0x068;
    pub const PRFCNT_JM_EN: u32 = 0x06C;
    pub const PRFCNT_SHADER_EN: u32 = 0x070;
    pub const PRFCNT_TILER_EN: u32 = 0x074;
    pub const PRFCNT_MMU_L2_EN: u32 = 0x07C;
    pub const SHADER_CONFIG: u32 = 0xF04;
    pub const L2_MMU_CONFIG: u32 = 0xF0C;
}

pub mod job_control {
    pub const JOB_IRQ_RAWSTAT: u32 = 0x000;
    pub const JOB_IRQ_CLEAR: u32 = 0x004;
    pub const JOB_IRQ_MASK: u32 = 0x008;
    pub const JOB_IRQ_STATUS: u32 = 0x00C;
    /// Bit `n`: slot `n` has an active job. Bit `n + 16`: slot `n` has a job queued in "next".
    pub const JOB_IRQ_JS_STATE: u32 = 0x010;
    pub const JOB_IRQ_THROTTLE: u32 = 0x014;
}

pub mod mmu {
    pub const MMU_IRQ_RAWSTAT: u32 = 0x000;
    pub const MMU_IRQ_MASK: u32 = 0x008;
}

/// Per-slot register offsets (relative to the slot block).
pub mod slot {
    pub const BASE: u32 = 0x800;
    pub const STRIDE: u32 = 0x80;

    pub const HEAD_LO: u32 = 0x00;
    pub const HEAD_HI: u32 = 0x04;
    pub const TAIL_LO: u32 = 0x08;
    pub const TAIL_HI: u32 = 0x0C;
    pub const AFFINITY_LO: u32 = 0x10;
    pub const AFFINITY_HI: u32 = 0x14;
    pub const CONFIG: u32 = 0x18;
    pub const COMMAND: u32 = 0x20;
    pub const STATUS: u32 = 0x24;

    pub const HEAD_NEXT_LO: u32 = 0x40;
    pub const HEAD_NEXT_HI: u32 = 0x44;
    pub const AFFINITY_NEXT_LO: u32 = 0x50;
    pub const AFFINITY_NEXT_HI: u32 = 0x54;
    pub const CONFIG_NEXT: u32 = 0x58;
    pub const COMMAND_NEXT: u32 = 0x60;
    pub const FLUSH_ID_NEXT: u32 = 0x70;
}

/// `JS_COMMAND` / `JS_COMMAND_NEXT` opcodes.
pub mod command {
    pub const NOP: u32 = 0x00;
    pub const START: u32 = 0x01;
    pub const SOFT_STOP: u32 = 0x02;
    pub const HARD_STOP: u32 = 0x03;
    /// Soft-stop only if the current job chain flag is 0.
    pub const SOFT_STOP_0: u32 = 0x04;
    /// Hard-stop only if the current job chain flag is 0.
    pub const HARD_STOP_0: u32 = 0x05;
    pub const SOFT_STOP_1: u32 = 0x06;
    pub const HARD_STOP_1: u32 = 0x07;
    pub const MASK: u32 = 0x07;
}

/// `JS_CONFIG` bits.
pub mod config {
    pub const START_FLUSH_CLEAN_INVALIDATE: u32 = 3 << 8;
    pub const START_MMU: u32 = 1 << 10;
    pub const JOB_CHAIN_FLAG: u32 = 1 << 11;
    pub const END_FLUSH_CLEAN_INVALIDATE: u32 = 3 << 12;
    pub const ENABLE_FLUSH_REDUCTION: u32 = 1 << 14;
    pub const DISABLE_DESCRIPTOR_WR_BK: u32 = 1 << 15;
    pub const THREAD_PRI_SHIFT: u32 = 16;
    pub const AS_MASK: u32 = 0xFF;

    pub const fn thread_pri(pri: u8) -> u32 {
        (pri as u32) << THREAD_PRI_SHIFT
    }
}

/// `PRFCNT_CONFIG` fields.
pub mod prfcnt {
    pub const MODE_OFF: u32 = 0;
    pub const MODE_MANUAL: u32 = 1;
    pub const AS_SHIFT: u32 = 4;
}

/// `JS_STATUS` values written by hardware.
pub mod status {
    pub const NOT_STARTED: u32 = 0x00;
    pub const DONE: u32 = 0x01;
    pub const STOPPED: u32 = 0x03;
    pub const TERMINATED: u32 = 0x04;
    pub const ACTIVE: u32 = 0x08;
}

/// Done bit for `slot` in the RAWSTAT/CLEAR/MASK registers.
pub const fn irq_done_bit(slot: usize) -> u32 {
    1 << slot
}

/// Failure bit for `slot` in the RAWSTAT/CLEAR/MASK registers.
pub const fn irq_fail_bit(slot: usize) -> u32 {
    1 << (slot + 16)
}

/// Both IRQ bits belonging to `slot`.
pub const fn irq_slot_bits(slot: usize) -> u32 {
    irq_done_bit(slot) | irq_fail_bit(slot)
}
