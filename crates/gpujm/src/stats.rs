use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of [`JmStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JmStatsSnapshot {
    pub atoms_submitted: u64,
    pub atoms_reaped: u64,
    pub atoms_evicted: u64,
    pub job_irqs: u64,
    pub spurious_irqs: u64,
    pub soft_stops: u64,
    pub hard_stops: u64,

    pub resets_prepared: u64,
    pub resets_completed: u64,
    pub resets_aborted: u64,
    pub early_resets: u64,
    pub watchdog_resets: u64,
    pub zap_escalations: u64,
}

/// Job manager telemetry counters.
///
/// Updated from the IRQ path and the reset worker; readable from any thread.
#[derive(Debug, Default)]
pub struct JmStats {
    atoms_submitted: AtomicU64,
    atoms_reaped: AtomicU64,
    atoms_evicted: AtomicU64,
    job_irqs: AtomicU64,
    spurious_irqs: AtomicU64,
    soft_stops: AtomicU64,
    hard_stops: AtomicU64,

    resets_prepared: AtomicU64,
    resets_completed: AtomicU64,
    resets_aborted: AtomicU64,
    early_resets: AtomicU64,
    watchdog_resets: AtomicU64,
    zap_escalations: AtomicU64,
}

macro_rules! counters {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl JmStats {
            $(
                pub(crate) fn $inc(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> JmStatsSnapshot {
                JmStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    inc_atoms_submitted => atoms_submitted,
    inc_atoms_reaped => atoms_reaped,
    inc_atoms_evicted => atoms_evicted,
    inc_job_irqs => job_irqs,
    inc_spurious_irqs => spurious_irqs,
    inc_soft_stops => soft_stops,
    inc_hard_stops => hard_stops,
    inc_resets_prepared => resets_prepared,
    inc_resets_completed => resets_completed,
    inc_resets_aborted => resets_aborted,
    inc_early_resets => early_resets,
    inc_watchdog_resets => watchdog_resets,
    inc_zap_escalations => zap_escalations,
}
