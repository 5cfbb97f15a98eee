// Copyright 2025 Oxide Computer Company

use std::path::{Path, PathBuf};

use slog::{warn, Logger};

use sxm_common::SxmError;

use crate::storage::{AttachInfo, BlockBackend, StorageApi};
use crate::tapctl::{Tapdev, TapdiskInterface};

/// Split an NBD URI of the form `nbd:unix:{socket}:exportname={name}`.
pub fn parse_nbd_uri(uri: &str) -> Result<(PathBuf, String), SxmError> {
    let rest = uri.strip_prefix("nbd:unix:").ok_or_else(|| {
        SxmError::InternalError(format!("unsupported NBD URI: {}", uri))
    })?;
    match rest.split_once(":exportname=") {
        Some((socket, export)) if !socket.is_empty() && !export.is_empty() => {
            Ok((PathBuf::from(socket), export.to_string()))
        }
        _ => Err(SxmError::InternalError(format!(
            "unsupported NBD URI: {}",
            uri
        ))),
    }
}

/// Tap-disk address from an NBD socket basename shaped `nbd{pid}.{minor}`.
fn tapdev_of_nbd_basename(base: &str) -> Option<Tapdev> {
    let rest = base.strip_prefix("nbd")?;
    let (pid, minor) = rest.split_once('.')?;
    Some(Tapdev {
        pid: pid.parse().ok()?,
        minor: minor.parse().ok()?,
    })
}

/// Work out which tap-disk serves an attached VDI.  Block devices resolve
/// through the tap-disk control plane; NBD backends encode the address in
/// the socket basename.  A backend with neither means the data-path is not
/// served by a tap-disk at all.
pub fn tapdisk_of_attach_info(
    tapdisk: &dyn TapdiskInterface,
    attach: &AttachInfo,
    dp: &str,
) -> Result<Tapdev, SxmError> {
    for imp in &attach.implementations {
        match imp {
            BlockBackend::BlockDevice { path } => {
                return tapdisk.of_device(path);
            }
            BlockBackend::Nbd { uri } => {
                let (socket, _) = parse_nbd_uri(uri)?;
                if let Some(t) = socket
                    .file_name()
                    .and_then(|b| b.to_str())
                    .and_then(tapdev_of_nbd_basename)
                {
                    return Ok(t);
                }
            }
            BlockBackend::File { .. } => (),
        }
    }
    Err(SxmError::Unattached(dp.to_string()))
}

/// Run `f` with the VDI attached and activated on `dp`, tearing the
/// data-path down again on every exit path.  With no VDI, `f` simply runs
/// with no path.  Backends are resolved in order of preference: plain
/// file, block device, then NBD via a local client for the duration.
pub fn with_activated_disk<T, F>(
    api: &dyn StorageApi,
    tapdisk: &dyn TapdiskInterface,
    log: &Logger,
    sr: &str,
    vdi: Option<&str>,
    dp: &str,
    vm: &str,
    read_write: bool,
    f: F,
) -> Result<T, SxmError>
where
    F: FnOnce(Option<&Path>) -> Result<T, SxmError>,
{
    let vdi = match vdi {
        None => return f(None),
        Some(v) => v,
    };

    let attach = api.vdi_attach3(dp, sr, vdi, vm, read_write)?;

    let mut activated = false;
    let result = api.vdi_activate3(dp, sr, vdi, vm).and_then(|()| {
        activated = true;
        run_with_backend(tapdisk, log, &attach, f)
    });

    // Teardown happens even when activation failed mid-way.
    if activated {
        if let Err(e) = api.vdi_deactivate(dp, sr, vdi, vm) {
            warn!(log, "deactivate {} failed: {}", dp, e);
        }
    }
    if let Err(e) = api.vdi_detach(dp, sr, vdi, vm) {
        warn!(log, "detach {} failed: {}", dp, e);
    }

    result
}

fn run_with_backend<T, F>(
    tapdisk: &dyn TapdiskInterface,
    log: &Logger,
    attach: &AttachInfo,
    f: F,
) -> Result<T, SxmError>
where
    F: FnOnce(Option<&Path>) -> Result<T, SxmError>,
{
    let by_kind = |want: fn(&BlockBackend) -> bool| {
        attach.implementations.iter().find(|b| want(b))
    };

    if let Some(BlockBackend::File { path }) =
        by_kind(|b| matches!(b, BlockBackend::File { .. }))
    {
        return f(Some(Path::new(path)));
    }
    if let Some(BlockBackend::BlockDevice { path }) =
        by_kind(|b| matches!(b, BlockBackend::BlockDevice { .. }))
    {
        return f(Some(Path::new(path)));
    }
    if let Some(BlockBackend::Nbd { uri }) =
        by_kind(|b| matches!(b, BlockBackend::Nbd { .. }))
    {
        let (socket, export) = parse_nbd_uri(uri)?;
        let device = tapdisk.nbd_client_attach(&socket, &export)?;
        let result = f(Some(&device));
        if let Err(e) = tapdisk.nbd_client_detach(&device) {
            warn!(log, "nbd client detach {:?} failed: {}", device, e);
        }
        return result;
    }

    Err(SxmError::InternalError(format!(
        "no usable backend in {:?}",
        attach
    )))
}
