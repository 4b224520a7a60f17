mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{atom, harness, harness_with, test_config, wait_until};
use gpujm::{AtomId, CompletionCode, Context, ContextId, GpuCaps, JmConfig, ResetState};
use pretty_assertions::assert_eq;

fn tracked_context(h: &common::Harness, id: u32, jobs: usize) -> Arc<Context> {
    let ctx = Arc::new(Context::new(ContextId(id)));
    for _ in 0..jobs {
        ctx.job_added();
    }
    h.dispatch.track(Arc::clone(&ctx));
    ctx
}

#[test]
fn idle_context_drains_immediately() {
    let h = harness(GpuCaps::default());
    let ctx = tracked_context(&h, 1, 0);

    let outcome = h.jm.wait_for_drain(&ctx).expect("drain");
    assert!(!outcome.escalated);
    assert_eq!(h.jm.stats().zap_escalations, 0);
}

#[test]
fn drain_before_timeout_does_not_reset() {
    let config = JmConfig {
        zap_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let h = harness_with(config, GpuCaps::default());
    let ctx = tracked_context(&h, 1, 1);
    ctx.set_scheduled(true);
    h.jm.submit(atom(1, 1), 0);

    let outcome = thread::scope(|scope| {
        let waiter = scope.spawn(|| h.jm.wait_for_drain(&ctx));

        h.jm.kill_context_jobs(ContextId(1));
        h.irq();
        assert_eq!(ctx.outstanding_jobs(), 0);
        ctx.set_scheduled(false);

        waiter.join().expect("drain thread").expect("drain")
    });

    assert!(!outcome.escalated);
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Terminated)]
    );
    let stats = h.jm.stats();
    assert_eq!(stats.zap_escalations, 0);
    assert_eq!(stats.resets_prepared, 0);
    assert_eq!(h.gpu.reset_count(), 0);
}

#[test]
fn stuck_context_escalates_to_reset() {
    let h = harness(GpuCaps::default());
    let ctx = tracked_context(&h, 1, 1);

    // Neither the zap's soft-stop sweep nor an early reset can move a secure atom.
    h.jm.submit(atom(1, 1).secure(), 0);

    let outcome = h.jm.wait_for_drain(&ctx).expect("drain");
    assert!(outcome.escalated);
    assert_eq!(h.jm.reset_state(), ResetState::NotPending);

    let stats = h.jm.stats();
    assert_eq!(stats.zap_escalations, 1);
    assert_eq!(stats.watchdog_resets, 1);
    assert_eq!(
        h.dispatch.completions(),
        vec![(AtomId(1), CompletionCode::Cancelled)]
    );
    assert_eq!(ctx.outstanding_jobs(), 0);
    assert!(wait_until(Duration::from_secs(5), || h.gpu.reset_count() == 1));
}

#[test]
fn zap_joins_a_reset_that_is_already_running() {
    let config = JmConfig {
        zap_timeout: Duration::from_millis(20),
        reset_timeout: Duration::from_millis(400),
        ..test_config()
    };
    let h = harness_with(config, GpuCaps::default());
    let ctx = tracked_context(&h, 2, 1);
    h.jm.submit(atom(1, 2).secure(), 0);

    assert!(h.jm.reset_gpu());
    let outcome = h.jm.wait_for_drain(&ctx).expect("drain");

    assert!(outcome.escalated);
    let stats = h.jm.stats();
    assert_eq!(stats.zap_escalations, 1);
    assert_eq!(stats.resets_prepared, 1);
    assert_eq!(ctx.outstanding_jobs(), 0);
}
