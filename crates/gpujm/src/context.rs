use std::sync::{Condvar, Mutex};

use crate::atom::ContextId;
use crate::sync::{lock, wait_while};

#[derive(Debug, Default)]
struct ContextJobs {
    job_nr: usize,
    scheduled: bool,
}

/// Per-context job accounting that context teardown waits on.
///
/// The dispatch layer maintains these counters; [`crate::JobManager::wait_for_drain`] blocks until
/// the context has no outstanding jobs and is no longer scheduled.
#[derive(Debug)]
pub struct Context {
    id: ContextId,
    jobs: Mutex<ContextJobs>,
    changed: Condvar,
}

impl Context {
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            jobs: Mutex::new(ContextJobs::default()),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn job_added(&self) {
        lock(&self.jobs).job_nr += 1;
    }

    pub fn job_retired(&self) {
        let mut jobs = lock(&self.jobs);
        jobs.job_nr = jobs.job_nr.saturating_sub(1);
        if jobs.job_nr == 0 {
            self.changed.notify_all();
        }
    }

    pub fn set_scheduled(&self, scheduled: bool) {
        lock(&self.jobs).scheduled = scheduled;
        self.changed.notify_all();
    }

    pub fn outstanding_jobs(&self) -> usize {
        lock(&self.jobs).job_nr
    }

    pub fn is_scheduled(&self) -> bool {
        lock(&self.jobs).scheduled
    }

    /// Blocks until the context has zero jobs, then until it is descheduled.
    pub(crate) fn wait_drained(&self) {
        let jobs = lock(&self.jobs);
        let jobs = wait_while(&self.changed, jobs, |jobs| jobs.job_nr != 0);
        drop(wait_while(&self.changed, jobs, |jobs| jobs.scheduled));
    }
}
