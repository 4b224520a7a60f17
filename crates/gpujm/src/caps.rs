//! Static per-device feature and erratum table.

use bitflags::bitflags;

bitflags! {
    /// Hardware features relevant to job submission.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HwFeature: u32 {
        /// `FLUSH_ID_NEXT` / `LATEST_FLUSH` are implemented and cache flushes can be elided.
        const FLUSH_REDUCTION = 1 << 0;
        /// Protected (secure) mode is available.
        const PROTECTED_MODE = 1 << 1;
        /// `JS_CONFIG.JOB_CHAIN_FLAG` and the `_0`/`_1` stop opcodes exist.
        const JOBCHAIN_DISAMBIGUATION = 1 << 2;
    }
}

bitflags! {
    /// Known hardware defects that need a software workaround.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HwIssue: u32 {
        /// Perf counter dump must be armed with the tiler counters disabled.
        const ISSUE_8186 = 1 << 0;
        /// A uTLB lock-up from a bad job can starve other address spaces; poke the MMU while a
        /// slot is soft-stopped.
        const ISSUE_8316 = 1 << 1;
        /// `T` jobs cannot be hard-stopped.
        const ISSUE_8394 = 1 << 2;
        /// Hard-stops leave state behind; always follow with a reset.
        const ISSUE_8401 = 1 << 3;
        /// `T` jobs cannot be soft-stopped.
        const ISSUE_8408 = 1 << 4;
        /// Hard-stops can hang the GPU; always follow with a reset.
        const ISSUE_9510 = 1 << 5;
        /// Terminated jobs may report `NOT_STARTED` (only detectable via the fault IRQ).
        const ISSUE_10673 = 1 << 6;
        /// A job completion may not raise its interrupt.
        const ISSUE_10883 = 1 << 7;
        /// Hard-stopping an AFBC fragment job corrupts GPU state.
        const ISSUE_T76X_3542 = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuCaps {
    pub features: HwFeature,
    pub issues: HwIssue,
}

impl GpuCaps {
    pub fn new(features: HwFeature, issues: HwIssue) -> Self {
        Self { features, issues }
    }

    pub fn has_feature(&self, feature: HwFeature) -> bool {
        self.features.contains(feature)
    }

    pub fn has_issue(&self, issue: HwIssue) -> bool {
        self.issues.contains(issue)
    }
}
