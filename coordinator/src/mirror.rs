// Copyright 2025 Oxide Computer Company

use std::os::fd::AsRawFd;
use std::sync::Arc;

use slog::{info, warn};

use sxm_common::SxmError;

use crate::cleanup::CleanupStack;
use crate::copy::{copy_into_vdi, nbd_sink_url, similars_of};
use crate::datapath::tapdisk_of_attach_info;
use crate::state::{
    mirror_id_of, of_mirror_id, Operation, RemoteMirrorInfo, SendState,
};
use crate::storage::VdiInfo;
use crate::tapctl::nbd_client_socket;
use crate::tasks::TaskHandle;
use crate::updates::Event;
use crate::Context;

/// Backend code the storage driver raises when the destination SR runs
/// out of room while the mirror snapshot is being taken.
const SR_FULL: &str = "SR_BACKEND_FAILURE_44";

fn find_vdi(vdis: &[VdiInfo], vdi: &str) -> Result<VdiInfo, SxmError> {
    vdis.iter()
        .find(|v| v.vdi == vdi)
        .cloned()
        .ok_or_else(|| SxmError::NotFound("vdi".to_string(), vdi.to_string()))
}

/// Establish a live mirror of `sr/vdi` onto the destination, then bring
/// the destination up to date: remote receive, NBD fd-handoff into the
/// local tap-disk, snapshot, copy of the snapshot, and a final compose.
/// On success the mirror stays live until `stop` or the detach hooks run.
#[allow(clippy::too_many_arguments)]
pub fn start(
    ctx: &Arc<Context>,
    task: &TaskHandle,
    sr: &str,
    vdi: &str,
    dp: &str,
    mirror_vm: &str,
    copy_vm: &str,
    url: &str,
    dest_sr: &str,
    verify_dest: bool,
) -> Result<String, SxmError> {
    let log = &ctx.log;
    let id = mirror_id_of(sr, vdi);
    info!(log, "mirror {}: starting towards {} {}", id, url, dest_sr);

    // One active mirror per source VDI; a second start must see the first.
    if ctx.state.find_active_local_mirror(&id).is_some() {
        return Err(SxmError::InternalError(format!(
            "mirror {} already active",
            id
        )));
    }

    // Register before any remote traffic so recovery can see the attempt.
    ctx.state.add(
        &id,
        Operation::Send(SendState {
            url: url.to_string(),
            dest_sr: dest_sr.to_string(),
            remote_info: None,
            local_dp: dp.to_string(),
            tapdev: None,
            failed: false,
            watchdog: None,
        }),
    )?;

    let mut cleanup = CleanupStack::new();
    let result = (|| -> Result<String, SxmError> {
        let local_vdis = ctx.local.sr_scan(sr)?;
        let local_vdi = find_vdi(&local_vdis, vdi)?;
        let similars = similars_of(ctx.local.as_ref(), sr, vdi)?;

        let remote = ctx.remote.connect(url, verify_dest)?;
        let receive = remote.mirror_receive_start2(
            dest_sr,
            &local_vdi,
            &id,
            &similars,
            mirror_vm,
        )?;
        {
            let remote = Arc::clone(&remote);
            let id = id.clone();
            cleanup.add("cancel remote receive", move || {
                remote.mirror_receive_cancel(&id)
            });
        }
        ctx.state.update_send(&id, |s| {
            s.remote_info = Some(RemoteMirrorInfo {
                dp: receive.mirror_datapath.clone(),
                vdi: receive.mirror_vdi.clone(),
                url: url.to_string(),
                verify_dest,
            })
        })?;

        // Do the HTTP handshake ourselves, then donate the socket to the
        // tap-disk serving the VM's data-path.  No tap-disk means the disk
        // is not attached the way a live mirror needs.
        let sink = nbd_sink_url(
            url,
            mirror_vm,
            dest_sr,
            &receive.mirror_vdi,
            &receive.mirror_datapath,
        )?;
        let nbd_socket = ctx.nbd.handshake(&sink)?;
        let attach = ctx.local.dp_attach_info(sr, vdi, dp, mirror_vm)?;
        let tapdev =
            tapdisk_of_attach_info(ctx.tapdisk.as_ref(), &attach, dp)?;
        let control =
            nbd_client_socket(&ctx.config.blktap_control_dir, tapdev.pid);
        ctx.tapdisk.send_fd(&control, dp, nbd_socket.as_raw_fd())?;
        // tap-disk holds its own duplicate now; ours closes here.
        drop(nbd_socket);

        ctx.state.update_send(&id, |s| s.tapdev = Some(tapdev))?;
        arm_watchdog(ctx, &id);
        info!(log, "mirror {}: mirroring via tap-disk {:?}", id, tapdev);

        task.check_cancelled()?;

        // Snapshot the source under the mirror so every write from here on
        // goes to both hosts while the snapshot is copied across.
        let mut snap_src = local_vdi.clone();
        snap_src
            .sm_config
            .insert("mirror".to_string(), format!("nbd:{}", dp));
        snap_src
            .sm_config
            .insert("base_mirror".to_string(), id.clone());
        let snapshot = match ctx.local.vdi_snapshot(sr, &snap_src) {
            Err(SxmError::BackendError { code, .. }) if code == SR_FULL => {
                let available = remote
                    .sr_scan2(dest_sr)
                    .map(|(_, info)| info.free_space)
                    .unwrap_or(0);
                return Err(SxmError::CapacityExceeded {
                    needed: local_vdi.virtual_size,
                    available,
                });
            }
            other => other?,
        };
        {
            let local = Arc::clone(&ctx.local);
            let sr = sr.to_string();
            let snap = snapshot.vdi.clone();
            cleanup.add("destroy mirror snapshot", move || {
                local.vdi_destroy(&sr, &snap)
            });
        }
        info!(log, "mirror {}: snapshotted as {}", id, snapshot.vdi);

        copy_into_vdi(
            ctx,
            task,
            sr,
            &snapshot.vdi,
            copy_vm,
            url,
            dest_sr,
            &receive.copy_diffs_to,
            verify_dest,
        )?;

        // Glue the copied snapshot under the live mirror leaf.
        remote.vdi_compose(
            dest_sr,
            &receive.mirror_vdi,
            &receive.copy_diffs_to,
        )?;
        info!(log, "mirror {}: composed, mirror is live", id);

        Ok(id.clone())
    })();

    match result {
        Ok(id) => Ok(id),
        Err(e) => {
            warn!(log, "mirror {} failed: {}", id, e);
            cleanup.perform_actions(log);
            if let Some(s) = ctx.state.find_active_local_mirror(&id) {
                if let Some(h) = s.watchdog {
                    ctx.scheduler.cancel(h);
                }
            }
            if let Err(e) = ctx.state.remove_local_mirror(&id) {
                warn!(log, "drop send state {} failed: {}", id, e);
            }
            Err(e)
        }
    }
}

/// Arm (or re-arm) the periodic mirror-health check, storing the new
/// handle before the timer can fire.
pub(crate) fn arm_watchdog(ctx: &Arc<Context>, id: &str) {
    let cb = {
        let ctx = Arc::clone(ctx);
        let id = id.to_string();
        Box::new(move || mirror_checker(&ctx, &id))
    };
    let handle = ctx.scheduler.one_shot(
        ctx.config.watchdog_interval,
        &format!("mirror checker {}", id),
        cb,
    );
    match ctx.state.update_send(id, |s| s.watchdog = Some(handle)) {
        Ok(true) => (),
        // The mirror went away between arming and storing; unarm again.
        Ok(false) => ctx.scheduler.cancel(handle),
        Err(e) => warn!(ctx.log, "storing watchdog for {} failed: {}", id, e),
    }
}

/// One watchdog firing: read tap-disk stats and report a dead mirror on
/// the updates bus.  Exits silently once the mirror record is gone and
/// never lets an error escape into the scheduler.
fn mirror_checker(ctx: &Arc<Context>, id: &str) {
    let Some(state) = ctx.state.find_active_local_mirror(id) else {
        return;
    };

    if let Some(tapdev) = state.tapdev {
        match ctx.tapdisk.stats(&tapdev) {
            Ok(stats) if stats.nbd_mirror_failed == 1 => {
                warn!(ctx.log, "mirror {}: tap-disk reports failure", id);
                ctx.updates.post(Event::Mirror(id.to_string()));
            }
            Ok(_) => (),
            Err(e) => {
                warn!(ctx.log, "mirror {}: stats unavailable: {}", id, e)
            }
        }
    }

    arm_watchdog(ctx, id);
}

/// Tear down an active outbound mirror.
pub fn stop(ctx: &Context, id: &str) -> Result<(), SxmError> {
    let log = &ctx.log;
    let state = ctx.state.find_active_local_mirror(id).ok_or_else(|| {
        SxmError::DoesNotExist("mirror".to_string(), id.to_string())
    })?;
    info!(log, "mirror {}: stopping", id);

    if let Some(remote_info) = &state.remote_info {
        let (sr, vdi) = of_mirror_id(id)?;
        let vdis = ctx.local.sr_scan(&sr)?;
        let local_vdi = find_vdi(&vdis, &vdi)?;

        // Snapshot with the mirror turned off, then throw the snapshot
        // away.  The driver only commits the sm-config change on a
        // snapshot boundary, so the dance is required.
        let mut flush_src = local_vdi.clone();
        flush_src.sm_config.remove("base_mirror");
        flush_src
            .sm_config
            .insert("mirror".to_string(), "null".to_string());
        let flush = ctx.local.vdi_snapshot(&sr, &flush_src)?;
        ctx.local.vdi_destroy(&sr, &flush.vdi)?;

        // The snapshot `start` copied across is no longer needed either.
        for v in &vdis {
            if v.sm_config.get("base_mirror").map(|m| m.as_str())
                == Some(id)
            {
                ctx.local.vdi_destroy(&sr, &v.vdi)?;
            }
        }

        match ctx.remote.connect(&remote_info.url, remote_info.verify_dest)
        {
            Ok(remote) => {
                if let Err(e) = remote.mirror_receive_cancel(id) {
                    warn!(log, "remote receive_cancel {} failed: {}", id, e);
                }
            }
            Err(e) => {
                warn!(log, "connect {} failed: {}", remote_info.url, e)
            }
        }
    }

    ctx.state.remove_local_mirror(id)
}

/// Recovery sweep: tear down whatever each table still references, best
/// effort throughout, then clear all three tables.
pub fn killall(ctx: &Context) {
    let log = &ctx.log;
    let (send, recv, copy) = ctx.state.map_of();

    for (id, s) in send {
        info!(log, "killall: send {}", id);
        if let Err(e) = ctx.local.dp_destroy(&s.local_dp, true) {
            warn!(log, "killall: destroy dp {} failed: {}", s.local_dp, e);
        }
        if let Some(ri) = s.remote_info {
            match ctx.remote.connect(&ri.url, ri.verify_dest) {
                Ok(remote) => {
                    if let Err(e) = remote.mirror_receive_cancel(&id) {
                        warn!(
                            log,
                            "killall: receive_cancel {} failed: {}", id, e
                        );
                    }
                }
                Err(e) => warn!(log, "killall: connect {}: {}", ri.url, e),
            }
        }
    }

    for (id, _) in recv {
        info!(log, "killall: recv {}", id);
        if let Err(e) = crate::receive::receive_cancel(ctx, &id) {
            warn!(log, "killall: receive_cancel {} failed: {}", id, e);
        }
    }

    for (id, c) in copy {
        info!(log, "killall: copy {}", id);
        for dp in [&c.base_dp, &c.leaf_dp] {
            if let Err(e) = ctx.local.dp_destroy(dp, true) {
                warn!(log, "killall: destroy dp {} failed: {}", dp, e);
            }
        }
        match ctx.remote.connect(&c.remote_url, c.verify_dest) {
            Ok(remote) => {
                if let Err(e) = remote.dp_destroy(&c.remote_dp, false) {
                    warn!(
                        log,
                        "killall: destroy remote dp {} failed: {}",
                        c.remote_dp,
                        e
                    );
                }
                if let Err(e) = remote.vdi_destroy(&c.dest_sr, &c.copy_vdi)
                {
                    warn!(
                        log,
                        "killall: destroy remote vdi {} failed: {}",
                        c.copy_vdi,
                        e
                    );
                }
            }
            Err(e) => warn!(log, "killall: connect {}: {}", c.remote_url, e),
        }
    }

    if let Err(e) = ctx.state.clear() {
        warn!(log, "killall: clearing state failed: {}", e);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sparse_dd::TestCopierMode;
    use crate::state::CopyState;
    use crate::storage::{BlockBackend, TestAttachment};
    use crate::tapctl::{Tapdev, TapdiskStats};
    use crate::tasks::{TaskResult, TaskStatus};
    use crate::test_support::{test_context, TestContext};
    use std::time::Duration;

    const TAP_DEVICE: &str = "/dev/xen/blktap-2/tapdev3";
    const TAPDEV: Tapdev = Tapdev { pid: 4242, minor: 3 };

    fn seed_source(tc: &TestContext) {
        tc.local.insert_vdi(
            "s1",
            VdiInfo {
                vdi: "v1".to_string(),
                content_id: "c1".to_string(),
                virtual_size: 100,
                ..Default::default()
            },
        );
        tc.local.insert_attachment(
            "dp0",
            TestAttachment {
                sr: "s1".to_string(),
                vdi: "v1".to_string(),
                vm: "vm0".to_string(),
                read_write: true,
                activated: true,
                backend: BlockBackend::BlockDevice {
                    path: TAP_DEVICE.to_string(),
                },
            },
        );
        tc.tapdisk.insert_device(TAP_DEVICE, TAPDEV);
    }

    fn run_start(tc: &TestContext) -> TaskStatus {
        let ctx = Arc::clone(&tc.ctx);
        let id = ctx.tasks.clone().spawn("mirror", move |task| {
            let id = start(
                &ctx, &task, "s1", "v1", "dp0", "vm0", "vm0",
                "https://h2", "s2", false,
            )?;
            Ok(TaskResult::Mirror(id))
        });
        tc.ctx.tasks.wait(&id, Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn start_happy_path() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);

        let status = run_start(&tc);
        assert_eq!(
            status,
            TaskStatus::Completed(TaskResult::Mirror("s1/v1".to_string()))
        );

        // The send record is live with remote coordinates and a tapdev.
        let s = tc.ctx.state.find_active_local_mirror("s1/v1").unwrap();
        let ri = s.remote_info.unwrap();
        assert_eq!(ri.url, "https://h2");
        assert_eq!(s.tapdev, Some(TAPDEV));
        assert!(!s.failed);
        assert!(s.watchdog.is_some());
        assert_eq!(tc.scheduler.armed(), vec![s.watchdog.unwrap()]);

        // The handshaken socket went to this tap-disk's control socket
        // with the mirrored data-path's name.
        let handoffs = tc.tapdisk.handoffs();
        assert_eq!(handoffs.len(), 1);
        assert_eq!(
            handoffs[0].0,
            tc.ctx.config.blktap_control_dir.join("nbdclient4242")
        );
        assert_eq!(handoffs[0].1, "dp0");
        assert_eq!(tc.nbd_urls(), 1);

        // A snapshot tagged with the mirror id exists locally and was the
        // source of the copy.
        let snapshot = tc
            .local
            .sr_vdis("s1")
            .into_iter()
            .find(|v| {
                v.sm_config.get("base_mirror").map(|m| m.as_str())
                    == Some("s1/v1")
            })
            .expect("mirror snapshot");
        assert_eq!(
            snapshot.sm_config.get("mirror").unwrap(),
            "nbd:dp0"
        );
        let inv = tc.copier.invocations.lock().unwrap();
        assert_eq!(inv.len(), 1);
        assert_eq!(
            inv[0].0.to_string_lossy(),
            format!("/dev/sm/backend/s1/{}", snapshot.vdi)
        );

        // The remote end saw receive_start2 and the final compose of the
        // diff copy under the mirror leaf.
        let remote_calls = tc.remote.calls();
        assert!(remote_calls
            .iter()
            .any(|c| c.starts_with("mirror_receive_start2 s2 v1 s1/v1")));
        assert!(remote_calls
            .iter()
            .any(|c| c.starts_with(&format!(
                "vdi_compose s2 {} ",
                ri.vdi
            ))));
    }

    #[test]
    fn start_twice_is_rejected() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);

        assert!(matches!(run_start(&tc), TaskStatus::Completed(_)));
        let status = run_start(&tc);
        assert!(matches!(status, TaskStatus::Failed(_)));
        // The first mirror's record is untouched.
        assert!(tc.ctx.state.find_active_local_mirror("s1/v1").is_some());
    }

    #[test]
    fn remote_receive_failure_unwinds_cleanly() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        tc.remote.fail_next(
            "mirror_receive_start2",
            SxmError::BackendError {
                code: "SR_HAS_NO_PBDS".to_string(),
                params: vec![],
            },
        );

        let status = run_start(&tc);
        assert_eq!(
            status,
            TaskStatus::Failed(SxmError::BackendError {
                code: "SR_HAS_NO_PBDS".to_string(),
                params: vec![],
            })
        );

        // Nothing armed, nothing recorded, no local snapshot taken.
        assert!(tc.ctx.state.find_active_local_mirror("s1/v1").is_none());
        assert!(tc.scheduler.armed().is_empty());
        assert!(!tc
            .local
            .calls()
            .iter()
            .any(|c| c.starts_with("vdi_snapshot")));
    }

    #[test]
    fn unattached_source_cancels_remote_receive() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        // Make the attachment unrecognisable as a tap-disk.
        tc.local.insert_attachment(
            "dp0",
            TestAttachment {
                sr: "s1".to_string(),
                vdi: "v1".to_string(),
                vm: "vm0".to_string(),
                read_write: true,
                activated: true,
                backend: BlockBackend::File {
                    path: "/img/v1.vhd".to_string(),
                },
            },
        );

        let status = run_start(&tc);
        assert_eq!(
            status,
            TaskStatus::Failed(SxmError::Unattached("dp0".to_string()))
        );

        // The remote receive that had already been set up was cancelled.
        assert!(tc
            .remote
            .calls()
            .iter()
            .any(|c| c == "mirror_receive_cancel s1/v1"));
        assert!(tc.ctx.state.find_active_local_mirror("s1/v1").is_none());
    }

    #[test]
    fn snapshot_sr_full_becomes_capacity_error() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        tc.local.fail_next(
            "vdi_snapshot",
            SxmError::BackendError {
                code: SR_FULL.to_string(),
                params: vec!["insufficient space".to_string()],
            },
        );

        let status = run_start(&tc);
        match status {
            TaskStatus::Failed(SxmError::CapacityExceeded {
                needed, ..
            }) => assert_eq!(needed, 100),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn watchdog_posts_failure_and_rearms() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        assert!(matches!(run_start(&tc), TaskStatus::Completed(_)));

        let first = tc
            .ctx
            .state
            .find_active_local_mirror("s1/v1")
            .unwrap()
            .watchdog
            .unwrap();

        tc.tapdisk.push_stats(TapdiskStats {
            reqs_outstanding: 0,
            nbd_mirror_failed: 1,
        });
        assert!(tc.scheduler.fire(first));

        let (events, _) =
            tc.ctx.updates.next(0, Duration::from_millis(10));
        assert_eq!(events, vec![Event::Mirror("s1/v1".to_string())]);

        // Re-armed with a fresh handle, stored back in the record.
        let second = tc
            .ctx
            .state
            .find_active_local_mirror("s1/v1")
            .unwrap()
            .watchdog
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(tc.scheduler.armed(), vec![second]);
    }

    #[test]
    fn watchdog_exits_silently_without_record() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        assert!(matches!(run_start(&tc), TaskStatus::Completed(_)));

        let handle = tc
            .ctx
            .state
            .find_active_local_mirror("s1/v1")
            .unwrap()
            .watchdog
            .unwrap();
        tc.ctx.state.remove_local_mirror("s1/v1").unwrap();

        assert!(tc.scheduler.fire(handle));
        // Nothing re-armed, nothing posted.
        assert!(tc.scheduler.armed().is_empty());
        let (events, _) = tc.ctx.updates.next(0, Duration::from_millis(10));
        assert!(events.is_empty());
    }

    #[test]
    fn stop_flushes_and_cancels_remote() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        assert!(matches!(run_start(&tc), TaskStatus::Completed(_)));

        let before = tc.local.calls().len();
        stop(&tc.ctx, "s1/v1").unwrap();

        let mut calls = tc.local.calls();
        let calls = calls.split_off(before);
        // One flush snapshot, destroyed again, plus the leftover mirror
        // snapshot from start.
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.starts_with("vdi_snapshot"))
                .count(),
            1
        );
        assert_eq!(
            calls
                .iter()
                .filter(|c| c.starts_with("vdi_destroy"))
                .count(),
            2
        );
        assert!(tc
            .remote
            .calls()
            .iter()
            .any(|c| c == "mirror_receive_cancel s1/v1"));
        assert!(tc.ctx.state.find_active_local_mirror("s1/v1").is_none());

        assert!(matches!(
            stop(&tc.ctx, "s1/v1"),
            Err(SxmError::DoesNotExist(_, _))
        ));
    }

    #[test]
    fn stop_before_remote_receive_skips_remote() {
        let tc = test_context(TestCopierMode::Succeed);
        tc.ctx
            .state
            .add(
                "s1/v1",
                Operation::Send(SendState {
                    url: "https://h2".to_string(),
                    dest_sr: "s2".to_string(),
                    remote_info: None,
                    local_dp: "dp0".to_string(),
                    tapdev: None,
                    failed: false,
                    watchdog: None,
                }),
            )
            .unwrap();

        stop(&tc.ctx, "s1/v1").unwrap();
        assert!(tc.remote.calls().is_empty());
        assert!(tc.ctx.state.find_active_local_mirror("s1/v1").is_none());
    }

    #[test]
    fn killall_clears_every_table() {
        let tc = test_context(TestCopierMode::Succeed);
        seed_source(&tc);
        assert!(matches!(run_start(&tc), TaskStatus::Completed(_)));

        // A recovered-from-disk copy record and a half-set-up send record
        // with no remote info.
        tc.ctx
            .state
            .add(
                "copy/s1/v7",
                Operation::Copy(CopyState {
                    base_dp: "b".to_string(),
                    leaf_dp: "l".to_string(),
                    remote_dp: "r".to_string(),
                    dest_sr: "s2".to_string(),
                    copy_vdi: "v9".to_string(),
                    remote_url: "https://h2".to_string(),
                    verify_dest: false,
                }),
            )
            .unwrap();
        tc.ctx
            .state
            .add(
                "s1/v8",
                Operation::Send(SendState {
                    url: "https://h2".to_string(),
                    dest_sr: "s2".to_string(),
                    remote_info: None,
                    local_dp: "dp8".to_string(),
                    tapdev: None,
                    failed: false,
                    watchdog: None,
                }),
            )
            .unwrap();

        killall(&tc.ctx);

        let (send, recv, copy) = tc.ctx.state.map_of();
        assert!(send.is_empty() && recv.is_empty() && copy.is_empty());

        // The full send record cancelled its remote receive; the bare one
        // only destroyed its local datapath.
        let remote_calls = tc.remote.calls();
        assert!(remote_calls
            .iter()
            .any(|c| c == "mirror_receive_cancel s1/v1"));
        assert!(!remote_calls
            .iter()
            .any(|c| c == "mirror_receive_cancel s1/v8"));
        assert!(tc
            .local
            .calls()
            .iter()
            .any(|c| c.starts_with("dp_destroy dp8 true")));
    }
}
