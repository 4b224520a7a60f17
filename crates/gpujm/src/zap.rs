//! Context teardown wait with reset escalation.

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use crate::context::Context;
use crate::error::Result;
use crate::manager::Inner;
use crate::sync::lock;
use crate::timer::OneShotTimer;

/// Progress of one teardown's zap timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZapStage {
    /// The timer has not fired.
    Armed,
    /// The timer fired and started (or joined) a GPU reset.
    FiredAndEscalated,
    /// The context drained first; the timer must do nothing.
    Cancelled,
}

impl ZapStage {
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Armed => 1,
            Self::FiredAndEscalated => 2,
            Self::Cancelled => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    /// The zap timeout fired and the GPU was reset before the context drained.
    pub escalated: bool,
}

fn zap_timeout(this: &Weak<Inner>, stage: &Mutex<ZapStage>) {
    let mut stage = lock(stage);
    if *stage == ZapStage::Cancelled {
        return;
    }

    if let Some(inner) = this.upgrade() {
        inner.stats.inc_zap_escalations();
        if inner.prepare_reset_from_zap() {
            error!(
                timeout_ms = inner.config.zap_timeout.as_millis() as u64,
                "context teardown timed out; resetting GPU"
            );
            if let Err(err) = inner.commit_reset_from_zap() {
                error!(%err, "failed to commit reset after zap timeout");
            }
        }
    }
    *stage = ZapStage::FiredAndEscalated;
}

impl Inner {
    fn prepare_reset_from_zap(&self) -> bool {
        let mut rp = self.lock_runpool();
        self.prepare_reset_locked(&mut rp)
    }

    fn commit_reset_from_zap(&self) -> Result<()> {
        let mut rp = self.lock_runpool();
        self.commit_reset_locked(&mut rp)
    }

    pub(crate) fn wait_for_drain(&self, ctx: &Context) -> Result<DrainOutcome> {
        let stage = Arc::new(Mutex::new(ZapStage::Armed));
        let timer = {
            let this = self.this.clone();
            let stage = Arc::clone(&stage);
            OneShotTimer::start("gpujm-zap", self.config.zap_timeout, move || {
                zap_timeout(&this, &stage)
            })?
        };

        debug!(ctx = %ctx.id(), "waiting for context jobs to drain");
        ctx.wait_drained();

        {
            let mut stage = lock(&stage);
            if *stage == ZapStage::Armed {
                *stage = ZapStage::Cancelled;
            }
        }
        timer.cancel();

        let escalated = *lock(&stage) == ZapStage::FiredAndEscalated;
        if escalated {
            self.reset.wait_idle();
        }
        debug!(ctx = %ctx.id(), escalated, "context drained");
        Ok(DrainOutcome { escalated })
    }
}
