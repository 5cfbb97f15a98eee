// Copyright 2025 Oxide Computer Company

use std::sync::Arc;
use std::time::Instant;

use slog::{info, warn};

use crate::state::mirror_id_of;
use crate::Context;

/// Before the VM's disk is deactivated, wait for the tap-disk to drain its
/// outstanding requests so the destination has everything.  Failure to
/// drain, a stats error, or a dead mirror all latch `failed` on the send
/// record; nothing propagates to the caller.
pub fn pre_deactivate_hook(ctx: &Context, sr: &str, vdi: &str) {
    let log = &ctx.log;
    let id = mirror_id_of(sr, vdi);
    let Some(state) = ctx.state.find_active_local_mirror(&id) else {
        return;
    };
    let Some(tapdev) = state.tapdev else {
        return;
    };

    let started = Instant::now();
    let mut failed = false;
    let mut drained = None;
    loop {
        match ctx.tapdisk.stats(&tapdev) {
            Ok(stats) => {
                let outstanding = stats.reqs_outstanding;
                drained = Some(stats);
                if outstanding == 0 {
                    break;
                }
                if started.elapsed() >= ctx.config.drain_timeout {
                    warn!(
                        log,
                        "mirror {}: drain timed out with {} outstanding",
                        id,
                        outstanding
                    );
                    failed = true;
                    break;
                }
            }
            Err(e) => {
                warn!(log, "mirror {}: drain stats failed: {}", id, e);
                failed = true;
                break;
            }
        }
        std::thread::sleep(ctx.config.drain_interval);
    }

    if let Some(stats) = drained {
        if stats.nbd_mirror_failed == 1 {
            warn!(log, "mirror {}: tap-disk reports dead mirror", id);
            failed = true;
        }
    }

    if failed {
        if let Err(e) = ctx.state.update_send(&id, |s| s.failed = true) {
            warn!(log, "mirror {}: recording failure failed: {}", id, e);
        }
    } else {
        info!(
            log,
            "mirror {}: drained in {:?}",
            id,
            started.elapsed()
        );
    }
}

/// After the VM's disk is detached the mirror is over: unarm the watchdog
/// and let a detached worker finalize the remote side and drop the send
/// record.  Best effort throughout.
pub fn post_detach_hook(
    ctx: &Arc<Context>,
    sr: &str,
    vdi: &str,
) -> Option<std::thread::JoinHandle<()>> {
    let id = mirror_id_of(sr, vdi);
    let state = ctx.state.find_active_local_mirror(&id)?;

    if let Some(handle) = state.watchdog {
        ctx.scheduler.cancel(handle);
    }

    let ctx = Arc::clone(ctx);
    Some(std::thread::spawn(move || {
        let log = &ctx.log;
        if let Some(remote_info) = state.remote_info {
            match ctx
                .remote
                .connect(&remote_info.url, remote_info.verify_dest)
            {
                Ok(remote) => {
                    if let Err(e) = remote.mirror_receive_finalize(&id) {
                        warn!(
                            log,
                            "remote receive_finalize {} failed: {}", id, e
                        );
                    }
                }
                Err(e) => {
                    warn!(log, "connect {} failed: {}", remote_info.url, e)
                }
            }
        }
        if let Err(e) = ctx.state.remove_local_mirror(&id) {
            warn!(log, "drop send state {} failed: {}", id, e);
        }
        info!(log, "mirror {}: detached and finalized", id);
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scheduler::Scheduler;
    use crate::sparse_dd::TestCopierMode;
    use crate::state::{Operation, RemoteMirrorInfo, SendState};
    use crate::tapctl::{Tapdev, TapdiskStats};
    use crate::test_support::test_context;
    use std::time::Duration;

    fn seed_send(
        tc: &crate::test_support::TestContext,
        tapdev: Option<Tapdev>,
        watchdog: Option<crate::scheduler::SchedulerHandle>,
    ) {
        tc.ctx
            .state
            .add(
                "s1/v1",
                Operation::Send(SendState {
                    url: "https://h2".to_string(),
                    dest_sr: "s2".to_string(),
                    remote_info: Some(RemoteMirrorInfo {
                        dp: "dp-remote".to_string(),
                        vdi: "v-mirror".to_string(),
                        url: "https://h2".to_string(),
                        verify_dest: false,
                    }),
                    local_dp: "dp0".to_string(),
                    tapdev,
                    failed: false,
                    watchdog,
                }),
            )
            .unwrap();
    }

    #[test]
    fn drain_completes_without_failure() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_send(&tc, Some(Tapdev { pid: 1, minor: 0 }), None);
        for outstanding in [5u64, 2, 0] {
            tc.tapdisk.push_stats(TapdiskStats {
                reqs_outstanding: outstanding,
                nbd_mirror_failed: 0,
            });
        }

        pre_deactivate_hook(&tc.ctx, "s1", "v1");

        let s = tc.ctx.state.find_active_local_mirror("s1/v1").unwrap();
        assert!(!s.failed);
    }

    #[test]
    fn drain_timeout_sets_failed() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_send(&tc, Some(Tapdev { pid: 1, minor: 0 }), None);
        // Never drains: the last reading repeats forever.
        tc.tapdisk.push_stats(TapdiskStats {
            reqs_outstanding: 5,
            nbd_mirror_failed: 0,
        });

        let started = Instant::now();
        pre_deactivate_hook(&tc.ctx, "s1", "v1");
        assert!(started.elapsed() >= tc.ctx.config.drain_timeout);

        let s = tc.ctx.state.find_active_local_mirror("s1/v1").unwrap();
        assert!(s.failed);
    }

    #[test]
    fn drained_but_dead_mirror_sets_failed() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_send(&tc, Some(Tapdev { pid: 1, minor: 0 }), None);
        tc.tapdisk.push_stats(TapdiskStats {
            reqs_outstanding: 0,
            nbd_mirror_failed: 1,
        });

        pre_deactivate_hook(&tc.ctx, "s1", "v1");

        let s = tc.ctx.state.find_active_local_mirror("s1/v1").unwrap();
        assert!(s.failed);
    }

    #[test]
    fn hooks_ignore_unknown_vdis() {
        let tc = test_context(TestCopierMode::Succeed);
        pre_deactivate_hook(&tc.ctx, "s1", "v-unknown");
        assert!(post_detach_hook(&tc.ctx, "s1", "v-unknown").is_none());
    }

    #[test]
    fn post_detach_finalizes_and_disarms() {
        let tc = test_context(TestCopierMode::Succeed);
        let handle = tc.ctx.scheduler.one_shot(
            Duration::from_secs(5),
            "mirror checker s1/v1",
            Box::new(|| ()),
        );
        seed_send(&tc, Some(Tapdev { pid: 1, minor: 0 }), Some(handle));

        let worker =
            post_detach_hook(&tc.ctx, "s1", "v1").expect("worker spawned");
        worker.join().unwrap();

        // Remote finalized, record gone, watchdog unarmed.
        assert!(tc
            .remote
            .calls()
            .iter()
            .any(|c| c == "mirror_receive_finalize s1/v1"));
        assert!(tc.ctx.state.find_active_local_mirror("s1/v1").is_none());
        assert!(tc.scheduler.armed().is_empty());
    }
}
