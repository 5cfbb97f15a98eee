// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::sync::Arc;

use slog::{info, warn};
use url::Url;
use uuid::Uuid;

use sxm_common::SxmError;

use crate::cleanup::CleanupStack;
use crate::datapath::with_activated_disk;
use crate::sparse_dd::CopyArgs;
use crate::state::{copy_id_of, CopyState, Operation};
use crate::storage::{StorageApi, VdiInfo};
use crate::tasks::TaskHandle;
use crate::Context;

/// Pick the remote VDI closest to the source: its content id must appear
/// in `similars` and it must not be larger than the source.  Earlier
/// entries in `similars` win ties.
pub fn nearest_vdi<'a>(
    remote_vdis: &'a [VdiInfo],
    similars: &[String],
    source_size: u64,
) -> Option<&'a VdiInfo> {
    similars.iter().find_map(|content_id| {
        remote_vdis.iter().find(|v| {
            v.content_id == *content_id && v.virtual_size <= source_size
        })
    })
}

/// Non-empty content ids of VDIs the local SR considers similar to the
/// source, most similar first.
pub fn similars_of(
    api: &dyn StorageApi,
    sr: &str,
    vdi: &str,
) -> Result<Vec<String>, SxmError> {
    let mut out: Vec<String> = Vec::new();
    for v in api.vdi_similar_content(sr, vdi)? {
        if !v.content_id.is_empty() && !out.contains(&v.content_id) {
            out.push(v.content_id);
        }
    }
    Ok(out)
}

/// Clone the nearest base and grow it to the source size, or create a
/// blank VDI shaped like the source.  `sm_config` is applied to whichever
/// is made; a clone keeps the base's existing keys as well.
pub fn clone_or_create(
    api: &dyn StorageApi,
    sr: &str,
    source: &VdiInfo,
    nearest: Option<&VdiInfo>,
    sm_config: BTreeMap<String, String>,
) -> Result<VdiInfo, SxmError> {
    match nearest {
        Some(base) => {
            let mut info = base.clone();
            info.sm_config.extend(sm_config);
            let mut cloned = api.vdi_clone(sr, &info)?;
            if cloned.virtual_size < source.virtual_size {
                cloned.virtual_size =
                    api.vdi_resize(sr, &cloned.vdi, source.virtual_size)?;
            }
            Ok(cloned)
        }
        None => {
            let mut info = source.clone();
            info.sm_config = sm_config;
            api.vdi_create(sr, &info)
        }
    }
}

fn find_vdi<'a>(
    vdis: &'a [VdiInfo],
    vdi: &str,
) -> Result<&'a VdiInfo, SxmError> {
    vdis.iter().find(|v| v.vdi == vdi).ok_or_else(|| {
        SxmError::NotFound("vdi".to_string(), vdi.to_string())
    })
}

/// Build the NBD sink URL for one remote data-path, URL-encoding each
/// segment.
pub(crate) fn nbd_sink_url(
    base: &str,
    vm: &str,
    sr: &str,
    vdi: &str,
    dp: &str,
) -> Result<Url, SxmError> {
    let mut url = Url::parse(base).map_err(|e| {
        SxmError::InternalError(format!("parse url {}: {}", base, e))
    })?;
    url.path_segments_mut()
        .map_err(|_| {
            SxmError::InternalError(format!("url {} cannot carry a path", base))
        })?
        .pop_if_empty()
        .extend(["services", "SM", "nbd", vm, sr, vdi, dp]);
    Ok(url)
}

/// Copy a local VDI into an existing remote VDI over NBD, differentially
/// when a local base matching the destination's content can be found.
#[allow(clippy::too_many_arguments)]
pub fn copy_into_vdi(
    ctx: &Arc<Context>,
    task: &TaskHandle,
    sr: &str,
    vdi: &str,
    vm: &str,
    url: &str,
    dest_sr: &str,
    dest_vdi: &str,
    verify_dest: bool,
) -> Result<VdiInfo, SxmError> {
    let log = &ctx.log;
    let remote = ctx.remote.connect(url, verify_dest)?;

    // Probe both ends before touching anything.
    if !remote.sr_list()?.iter().any(|s| s == dest_sr) {
        return Err(SxmError::NotFound(
            "sr".to_string(),
            dest_sr.to_string(),
        ));
    }
    let remote_vdis = remote.sr_scan(dest_sr)?;
    let remote_dest = find_vdi(&remote_vdis, dest_vdi)?.clone();
    let local_vdis = ctx.local.sr_scan(sr)?;
    let local_vdi = find_vdi(&local_vdis, vdi)?.clone();

    if local_vdi.virtual_size > remote_dest.virtual_size {
        return Err(SxmError::CapacityExceeded {
            needed: local_vdi.virtual_size,
            available: remote_dest.virtual_size,
        });
    }

    // A local VDI already carrying the destination's content serves as the
    // base of a differential copy.
    let base = if remote_dest.content_id.is_empty() {
        None
    } else {
        local_vdis
            .iter()
            .find(|v| v.content_id == remote_dest.content_id)
            .cloned()
    };
    match &base {
        Some(b) => info!(
            log,
            "copy {}/{}: differential from base {}", sr, vdi, b.vdi
        ),
        None => info!(log, "copy {}/{}: full copy", sr, vdi),
    }

    let remote_dp = Uuid::new_v4().to_string();
    let base_dp = Uuid::new_v4().to_string();
    let leaf_dp = Uuid::new_v4().to_string();
    let sink =
        nbd_sink_url(url, vm, dest_sr, dest_vdi, &remote_dp)?;

    let copy_id = copy_id_of(dest_sr, vdi);
    ctx.state.add(
        &copy_id,
        Operation::Copy(CopyState {
            base_dp: base_dp.clone(),
            leaf_dp: leaf_dp.clone(),
            remote_dp: remote_dp.clone(),
            dest_sr: dest_sr.to_string(),
            copy_vdi: dest_vdi.to_string(),
            remote_url: url.to_string(),
            verify_dest,
        }),
    )?;

    let result = (|| -> Result<VdiInfo, SxmError> {
        remote.vdi_attach3(&remote_dp, dest_sr, dest_vdi, vm, true)?;
        remote.vdi_activate3(&remote_dp, dest_sr, dest_vdi, vm)?;
        task.check_cancelled()?;

        let base_vdi = base.as_ref().map(|b| b.vdi.clone());
        let copier = Arc::clone(&ctx.copier);
        let cancel = task.cancel_token();
        let size = local_vdi.virtual_size;
        with_activated_disk(
            ctx.local.as_ref(),
            ctx.tapdisk.as_ref(),
            log,
            sr,
            base_vdi.as_deref(),
            &base_dp,
            vm,
            false,
            |base_path| {
                with_activated_disk(
                    ctx.local.as_ref(),
                    ctx.tapdisk.as_ref(),
                    log,
                    sr,
                    Some(vdi),
                    &leaf_dp,
                    vm,
                    false,
                    |leaf_path| {
                        let leaf = leaf_path.ok_or_else(|| {
                            SxmError::InternalError(
                                "leaf VDI attached with no path".to_string(),
                            )
                        })?;
                        copier.run(
                            &CopyArgs {
                                src: leaf,
                                dest_url: sink.as_str(),
                                base: base_path,
                                size,
                            },
                            &mut |p| task.set_progress(0.05 + 0.9 * p),
                            &cancel,
                        )
                    },
                )
            },
        )?;

        // The destination now carries the source's content.  A source with
        // no content id yet gets a fresh one so future copies can find it.
        let content_id = if local_vdi.content_id.is_empty() {
            let fresh = Uuid::new_v4().to_string();
            ctx.local.vdi_set_content_id(sr, vdi, &fresh)?;
            fresh
        } else {
            local_vdi.content_id.clone()
        };
        remote.vdi_set_content_id(dest_sr, dest_vdi, &content_id)?;

        let mut copied = remote_dest.clone();
        copied.content_id = content_id;
        Ok(copied)
    })();

    // The remote data-path and the registry record go away whatever the
    // outcome of the transfer.
    if let Err(e) = remote.dp_destroy(&remote_dp, false) {
        warn!(log, "destroy remote dp {} failed: {}", remote_dp, e);
    }
    if let Err(e) = ctx.state.remove_copy(&copy_id) {
        warn!(log, "drop copy state {} failed: {}", copy_id, e);
    }

    result
}

/// Copy a local VDI to a remote SR, choosing or creating the destination:
/// clone the nearest similar VDI when one exists, otherwise create a blank
/// one.  The returned record is a snapshot of the copy, the copy itself is
/// destroyed.
#[allow(clippy::too_many_arguments)]
pub fn copy_into_sr(
    ctx: &Arc<Context>,
    task: &TaskHandle,
    sr: &str,
    vdi: &str,
    vm: &str,
    url: &str,
    dest_sr: &str,
    verify_dest: bool,
) -> Result<VdiInfo, SxmError> {
    let log = &ctx.log;
    let remote = ctx.remote.connect(url, verify_dest)?;

    let remote_vdis: Vec<VdiInfo> = remote
        .sr_scan(dest_sr)?
        .into_iter()
        .filter(|v| v.ty != "cbt_metadata")
        .collect();
    let local_vdis = ctx.local.sr_scan(sr)?;
    let source = find_vdi(&local_vdis, vdi)?.clone();

    let similars = similars_of(ctx.local.as_ref(), sr, vdi)?;
    let nearest = nearest_vdi(&remote_vdis, &similars, source.virtual_size);
    info!(
        log,
        "copy {}/{} to {}: nearest {:?}",
        sr,
        vdi,
        dest_sr,
        nearest.map(|n| &n.vdi)
    );

    let copy_target = clone_or_create(
        remote.as_ref(),
        dest_sr,
        &source,
        nearest,
        BTreeMap::new(),
    )?;

    let mut cleanup = CleanupStack::new();
    {
        let remote = Arc::clone(&remote);
        let dest_sr = dest_sr.to_string();
        let target = copy_target.vdi.clone();
        cleanup.add("destroy copy target", move || {
            remote.vdi_destroy(&dest_sr, &target)
        });
    }

    let result = (|| -> Result<VdiInfo, SxmError> {
        let copied = copy_into_vdi(
            ctx,
            task,
            sr,
            vdi,
            vm,
            url,
            dest_sr,
            &copy_target.vdi,
            verify_dest,
        )?;

        // Hand back an immutable image: snapshot the copy, drop the
        // mutable original.
        let snapshot = remote.vdi_snapshot(dest_sr, &copied)?;
        remote.vdi_destroy(dest_sr, &copied.vdi)?;
        Ok(snapshot)
    })();

    match result {
        Ok(v) => Ok(v),
        Err(e) => {
            cleanup.perform_actions(log);
            Err(e)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sparse_dd::{TestCopier, TestCopierMode};
    use crate::state::of_copy_id;
    use crate::tasks::{TaskResult, TaskStatus};
    use crate::test_support::{test_context, TestContext};
    use std::time::Duration;

    fn vdi(id: &str, content: &str, size: u64) -> VdiInfo {
        VdiInfo {
            vdi: id.to_string(),
            content_id: content.to_string(),
            virtual_size: size,
            ..Default::default()
        }
    }

    #[test]
    fn nearest_prefers_similar_order() {
        let remote = vec![
            vdi("r1", "c2", 100),
            vdi("r2", "c1", 100),
            vdi("r3", "c1", 100),
        ];
        let similars = vec!["c1".to_string(), "c2".to_string()];
        assert_eq!(nearest_vdi(&remote, &similars, 100).unwrap().vdi, "r2");
    }

    #[test]
    fn nearest_skips_oversized() {
        let remote = vec![vdi("r1", "c1", 200), vdi("r2", "c1", 50)];
        let similars = vec!["c1".to_string()];
        assert_eq!(nearest_vdi(&remote, &similars, 100).unwrap().vdi, "r2");
        assert!(nearest_vdi(&remote, &similars, 10).is_none());
    }

    #[test]
    fn clone_or_create_resizes_clone_up() {
        let api = crate::storage::TestStorage::new(&["s2"]);
        let base = vdi("r1", "c1", 50);
        api.insert_vdi("s2", base.clone());

        let source = vdi("v1", "c9", 100);
        let got = clone_or_create(
            &api,
            "s2",
            &source,
            Some(&base),
            BTreeMap::from([("base_mirror".to_string(), "id1".to_string())]),
        )
        .unwrap();
        assert_eq!(got.virtual_size, 100);
        assert_eq!(got.sm_config.get("base_mirror").unwrap(), "id1");

        let calls = api.calls();
        assert!(calls.iter().any(|c| c.starts_with("vdi_clone")));
        assert!(calls.iter().any(|c| c.starts_with("vdi_resize")));
    }

    #[test]
    fn clone_or_create_blank_clears_sm_config() {
        let api = crate::storage::TestStorage::new(&["s2"]);
        let mut source = vdi("v1", "c9", 100);
        source
            .sm_config
            .insert("mirror".to_string(), "nbd:dp0".to_string());

        let got =
            clone_or_create(&api, "s2", &source, None, BTreeMap::new())
                .unwrap();
        assert!(got.sm_config.is_empty());
        assert_eq!(got.virtual_size, 100);
    }

    fn run_copy_into_vdi(
        tc: &TestContext,
        mode_check: impl FnOnce(TaskStatus) + Send + 'static,
    ) {
        let ctx = Arc::clone(&tc.ctx);
        let id = ctx.tasks.clone().spawn("copy", move |task| {
            let v = copy_into_vdi(
                &ctx, &task, "s1", "v1", "vm0", "https://h2", "s2", "v9",
                false,
            )?;
            Ok(TaskResult::Vdi(Box::new(v)))
        });
        let status = tc
            .ctx
            .tasks
            .wait(&id, Duration::from_secs(10))
            .expect("task exists");
        mode_check(status);
    }

    #[test]
    fn copy_into_vdi_full_copy() {
        let tc = test_context(TestCopierMode::Succeed);
        tc.local.insert_vdi("s1", vdi("v1", "", 100));
        tc.remote.insert_vdi("s2", vdi("v9", "", 100));

        run_copy_into_vdi(&tc, |status| {
            let TaskStatus::Completed(TaskResult::Vdi(v)) = status else {
                panic!("unexpected status");
            };
            assert!(!v.content_id.is_empty());
        });

        // One full-copy invocation, no base.
        let inv = tc.copier.invocations.lock().unwrap();
        assert_eq!(inv.len(), 1);
        let (src, dest, base, size) = &inv[0];
        assert_eq!(src.to_string_lossy(), "/dev/sm/backend/s1/v1");
        assert!(dest.starts_with("https://h2/services/SM/nbd/vm0/s2/v9/"));
        assert!(base.is_none());
        assert_eq!(*size, 100);
        drop(inv);

        // Copy record dropped, remote datapath destroyed, content id
        // propagated to both ends.
        assert!(tc.ctx.state.find_active_copy("copy/s2/v1").is_none());
        let remote_calls = tc.remote.calls();
        assert!(remote_calls.iter().any(|c| c.starts_with("dp_destroy")));
        let local = tc.local.get_vdi("s1", "v1").unwrap();
        let remote = tc.remote.get_vdi("s2", "v9").unwrap();
        assert!(!local.content_id.is_empty());
        assert_eq!(local.content_id, remote.content_id);
    }

    #[test]
    fn copy_into_vdi_differential_uses_base() {
        let tc = test_context(TestCopierMode::Succeed);
        tc.local.insert_vdi("s1", vdi("v1", "c-leaf", 100));
        tc.local.insert_vdi("s1", vdi("v0", "c-shared", 100));
        tc.remote.insert_vdi("s2", vdi("v9", "c-shared", 100));

        run_copy_into_vdi(&tc, |status| {
            assert!(matches!(status, TaskStatus::Completed(_)));
        });

        let inv = tc.copier.invocations.lock().unwrap();
        let (_, _, base, _) = &inv[0];
        assert_eq!(
            base.as_ref().unwrap().to_string_lossy(),
            "/dev/sm/backend/s1/v0"
        );
    }

    #[test]
    fn copy_into_vdi_rejects_larger_source() {
        let tc = test_context(TestCopierMode::Succeed);
        tc.local.insert_vdi("s1", vdi("v1", "", 200));
        tc.remote.insert_vdi("s2", vdi("v9", "", 100));

        run_copy_into_vdi(&tc, |status| {
            assert_eq!(
                status,
                TaskStatus::Failed(SxmError::CapacityExceeded {
                    needed: 200,
                    available: 100,
                })
            );
        });

        // Failed before any remote mutation.
        let remote_calls = tc.remote.calls();
        assert!(!remote_calls.iter().any(|c| c.starts_with("vdi_attach3")));
        assert!(tc.ctx.state.find_active_copy("copy/s2/v1").is_none());
    }

    #[test]
    fn copy_cancellation_cleans_up() {
        let tc = test_context(TestCopierMode::BlockUntilCancelled);
        tc.local.insert_vdi("s1", vdi("v1", "", 100));
        tc.remote.insert_vdi("s2", vdi("v9", "", 100));

        let ctx = Arc::clone(&tc.ctx);
        let id = ctx.tasks.clone().spawn("copy", move |task| {
            let v = copy_into_vdi(
                &ctx, &task, "s1", "v1", "vm0", "https://h2", "s2", "v9",
                false,
            )?;
            Ok(TaskResult::Vdi(Box::new(v)))
        });

        // Give the worker a moment to reach the transfer, then cancel.
        while tc.copier.invocations.lock().unwrap().is_empty() {
            std::thread::sleep(Duration::from_millis(5));
        }
        tc.ctx.tasks.cancel(&id).unwrap();

        let status =
            tc.ctx.tasks.wait(&id, Duration::from_secs(10)).unwrap();
        assert_eq!(status, TaskStatus::Cancelled);

        assert!(tc.ctx.state.find_active_copy("copy/s2/v1").is_none());
        let remote_calls = tc.remote.calls();
        assert!(remote_calls.iter().any(|c| c.starts_with("dp_destroy")));
    }

    #[test]
    fn copy_into_sr_snapshots_and_destroys_copy() {
        let tc = test_context(TestCopierMode::Succeed);
        tc.local.insert_vdi("s1", vdi("v1", "c1", 100));

        let ctx = Arc::clone(&tc.ctx);
        let id = ctx.tasks.clone().spawn("copy", move |task| {
            let v = copy_into_sr(
                &ctx, &task, "s1", "v1", "vm0", "https://h2", "s2", false,
            )?;
            Ok(TaskResult::Vdi(Box::new(v)))
        });
        let status =
            tc.ctx.tasks.wait(&id, Duration::from_secs(10)).unwrap();
        let TaskStatus::Completed(TaskResult::Vdi(snapshot)) = status else {
            panic!("copy failed");
        };

        // The surviving object is the snapshot; the mutable copy is gone.
        assert!(snapshot.is_a_snapshot);
        assert!(tc.remote.get_vdi("s2", &snapshot.vdi).is_some());
        assert!(tc.remote.get_vdi("s2", &snapshot.snapshot_of).is_none());
    }

    #[test]
    fn copy_ids_decode() {
        let id = copy_id_of("s1", "v1");
        assert_eq!(
            of_copy_id(&id).unwrap(),
            ("s1".to_string(), "v1".to_string())
        );
    }
}
