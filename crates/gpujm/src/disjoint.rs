use std::sync::atomic::{AtomicU32, Ordering};

/// Device-wide count of open disjoint periods.
///
/// While non-zero, GPU timing is unreliable (jobs were interrupted or a reset is in flight).
#[derive(Debug, Default)]
pub(crate) struct DisjointState {
    count: AtomicU32,
}

impl DisjointState {
    pub(crate) fn up(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_add(1)));
    }

    pub(crate) fn down(&self) {
        let prev = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)));
        debug_assert_ne!(prev, Ok(0), "disjoint state underflow");
    }

    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}
