// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use slog::{info, warn};
use uuid::Uuid;

use sxm_common::SxmError;

use crate::cleanup::CleanupStack;
use crate::copy::{clone_or_create, nearest_vdi};
use crate::state::{Operation, ReceiveState};
use crate::storage::{MirrorReceiveResult, VdiInfo};
use crate::Context;

/// Prepare this host to receive a mirror: create the writable leaf the
/// source will stream into, pin its base with a snapshot, and set up a
/// parent VDI for the snapshot diffs that follow.
pub fn receive_start2(
    ctx: &Context,
    sr: &str,
    vdi_info: &VdiInfo,
    id: &str,
    similars: &[String],
    vm: &str,
) -> Result<MirrorReceiveResult, SxmError> {
    let log = &ctx.log;
    let api = &ctx.local;

    let vdis: Vec<VdiInfo> = api
        .sr_scan(sr)?
        .into_iter()
        .filter(|v| v.ty != "cbt_metadata")
        .collect();

    let leaf_dp = api.dp_create(&Uuid::new_v4().to_string())?;

    let mut cleanup = CleanupStack::new();
    let result = (|| -> Result<(MirrorReceiveResult, ReceiveState), SxmError> {
        let mut leaf_info = vdi_info.clone();
        leaf_info.sm_config =
            BTreeMap::from([("base_mirror".to_string(), id.to_string())]);
        let leaf = api.vdi_create(sr, &leaf_info)?;
        {
            let api = Arc::clone(api);
            let sr = sr.to_string();
            let vdi = leaf.vdi.clone();
            cleanup.add("destroy leaf", move || api.vdi_destroy(&sr, &vdi));
        }
        info!(log, "receive {}: created leaf {}", id, leaf.vdi);

        let dummy = api.vdi_snapshot(sr, &leaf)?;
        {
            let api = Arc::clone(api);
            let sr = sr.to_string();
            let vdi = dummy.vdi.clone();
            cleanup.add("destroy dummy", move || api.vdi_destroy(&sr, &vdi));
        }

        api.vdi_attach3(&leaf_dp, sr, &leaf.vdi, vm, true)?;
        {
            let api = Arc::clone(api);
            let dp = leaf_dp.clone();
            cleanup
                .add("destroy leaf dp", move || api.dp_destroy(&dp, false));
        }
        api.vdi_activate3(&leaf_dp, sr, &leaf.vdi, vm)?;

        let nearest = nearest_vdi(&vdis, similars, vdi_info.virtual_size);
        let parent = clone_or_create(
            api.as_ref(),
            sr,
            vdi_info,
            nearest,
            BTreeMap::from([("base_mirror".to_string(), id.to_string())]),
        )?;
        {
            let api = Arc::clone(api);
            let sr = sr.to_string();
            let vdi = parent.vdi.clone();
            cleanup.add("destroy parent", move || api.vdi_destroy(&sr, &vdi));
        }
        info!(
            log,
            "receive {}: leaf {} dummy {} parent {}",
            id,
            leaf.vdi,
            dummy.vdi,
            parent.vdi
        );

        let record = ReceiveState {
            sr: sr.to_string(),
            dummy_vdi: dummy.vdi.clone(),
            leaf_vdi: leaf.vdi.clone(),
            leaf_dp: leaf_dp.clone(),
            parent_vdi: parent.vdi.clone(),
            remote_vdi: vdi_info.vdi.clone(),
            vm: vm.to_string(),
        };
        let result = MirrorReceiveResult {
            mirror_vdi: leaf.vdi,
            mirror_datapath: leaf_dp.clone(),
            copy_diffs_from: nearest.map(|n| n.content_id.clone()),
            copy_diffs_to: parent.vdi,
            dummy_vdi: dummy.vdi,
        };
        Ok((result, record))
    })();

    match result {
        Ok((result, record)) => {
            ctx.state.add(id, Operation::Recv(record))?;
            Ok(result)
        }
        Err(e) => {
            cleanup.perform_actions(log);
            Err(e)
        }
    }
}

/// Single-similar compatibility entry; receives under the control domain.
pub fn receive_start(
    ctx: &Context,
    sr: &str,
    vdi_info: &VdiInfo,
    id: &str,
    similar: &[String],
) -> Result<MirrorReceiveResult, SxmError> {
    receive_start2(ctx, sr, vdi_info, id, similar, "0")
}

/// The mirror is complete: release the leaf data-path but keep the leaf,
/// dummy, and parent VDIs for the compose step and the VM migration that
/// follows.
pub fn receive_finalize(ctx: &Context, id: &str) -> Result<(), SxmError> {
    let record = ctx.state.find_active_receive_mirror(id).ok_or_else(|| {
        SxmError::DoesNotExist("mirror".to_string(), id.to_string())
    })?;

    ctx.local.dp_destroy(&record.leaf_dp, false)?;
    if let Err(e) = ctx.local.vdi_deactivate(
        &record.leaf_dp,
        &record.sr,
        &record.leaf_vdi,
        &record.vm,
    ) {
        warn!(ctx.log, "deactivate leaf {} failed: {}", record.leaf_vdi, e);
    }
    ctx.state.remove_receive_mirror(id)
}

/// Abandon an inbound mirror, destroying everything `receive_start2`
/// created.  Every step is best-effort so a half-broken destination still
/// gets as clean as it can.
pub fn receive_cancel(ctx: &Context, id: &str) -> Result<(), SxmError> {
    let log = &ctx.log;
    let record = match ctx.state.find_active_receive_mirror(id) {
        Some(r) => r,
        None => return Ok(()),
    };

    if let Err(e) = ctx.local.dp_destroy(&record.leaf_dp, false) {
        warn!(log, "destroy dp {} failed: {}", record.leaf_dp, e);
    }
    for vdi in [&record.dummy_vdi, &record.leaf_vdi, &record.parent_vdi] {
        if let Err(e) = ctx.local.vdi_destroy(&record.sr, vdi) {
            warn!(log, "destroy vdi {} failed: {}", vdi, e);
        }
    }
    ctx.state.remove_receive_mirror(id)
}

/// Destination half of the NBD channel: activate the import path for the
/// mirror target and donate the already-handshaken HTTP socket to the
/// sink tap-disk.
pub fn nbd_handler(
    ctx: &Context,
    sr: &str,
    vdi: &str,
    dp: &str,
    vm: &str,
    fd: RawFd,
) -> Result<(), SxmError> {
    let control = ctx.local.mirror_import_activate(sr, vdi, dp, vm)?;
    ctx.tapdisk.send_fd(&PathBuf::from(control), dp, fd)
}
