// Copyright 2025 Oxide Computer Company

//! Storage motion coordinator: live migration of attached virtual disks
//! between storage repositories while the owning VM keeps running.
//!
//! The coordinator drives a three-phase protocol against two hosts: a
//! mirror is established into a remote leaf VDI (with the NBD socket
//! donated to the local tap-disk), a snapshot of the source is copied
//! across, and the two are composed on the destination.  Every in-flight
//! operation is recorded in a registry persisted as JSON so a restarted
//! host can recover, and every multi-step operation unwinds through an
//! explicit cleanup stack.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use slog::{o, Logger};

use sxm_common::SxmError;

pub mod cleanup;
pub mod copy;
pub mod datapath;
pub mod hooks;
pub mod mirror;
pub mod receive;
pub mod remote;
pub mod scheduler;
pub mod sparse_dd;
pub mod state;
pub mod storage;
pub mod tapctl;
pub mod tasks;
pub mod updates;

#[cfg(test)]
pub mod test_support;

use remote::{HttpNbdConnector, HttpRemoteFactory, NbdConnector, RemoteFactory};
use scheduler::{Scheduler, ThreadScheduler};
use sparse_dd::{CopyProgram, SparseDd};
use state::{of_copy_id, of_mirror_id, Registry};
use storage::{StorageApi, VdiInfo};
use tapctl::{Blktap, TapdiskInterface};
use tasks::{TaskResult, TaskService};
use updates::UpdateBus;

/// Tunables and paths.  The intervals exist mainly so tests can drain in
/// milliseconds instead of minutes.
#[derive(Debug, Clone)]
pub struct Config {
    pub persist_root: PathBuf,
    pub blktap_control_dir: PathBuf,
    pub drain_interval: Duration,
    pub drain_timeout: Duration,
    pub watchdog_interval: Duration,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            persist_root: PathBuf::from("/var/run/nonpersistent"),
            blktap_control_dir: PathBuf::from("/var/run/blktap-control"),
            drain_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(150),
            watchdog_interval: Duration::from_secs(5),
        }
    }
}

/// Everything the engines need, behind trait seams so tests can replace
/// the storage stack, the copier, tap-disk, the timer, and the network.
pub struct Context {
    pub log: Logger,
    pub config: Config,
    pub state: Arc<Registry>,
    pub local: Arc<dyn StorageApi>,
    pub remote: Arc<dyn RemoteFactory>,
    pub tapdisk: Arc<dyn TapdiskInterface>,
    pub copier: Arc<dyn CopyProgram>,
    pub nbd: Arc<dyn NbdConnector>,
    pub scheduler: Arc<dyn Scheduler>,
    pub tasks: Arc<TaskService>,
    pub updates: Arc<UpdateBus>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MirrorState {
    Sending,
    Receiving,
    Copying,
}

/// What `stat` reports for one operation id, aggregated over however many
/// tables the id appears in.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorStat {
    pub source_vdi: String,
    pub dest_vdi: String,
    pub state: Vec<MirrorState>,
    pub failed: bool,
}

/// The coordinator façade the surrounding storage stack calls.
pub struct Sxm {
    ctx: Arc<Context>,
}

impl Sxm {
    /// Production wiring: real RPC clients, `tap-ctl`, `sparse_dd`, and a
    /// thread-backed timer.
    pub fn new(
        log: Logger,
        config: Config,
        local: Arc<dyn StorageApi>,
    ) -> Sxm {
        let ctx = Arc::new(Context {
            state: Arc::new(Registry::new(
                log.new(o!("component" => "state")),
                config.persist_root.clone(),
            )),
            local,
            remote: Arc::new(HttpRemoteFactory::new(
                log.new(o!("component" => "remote")),
            )),
            tapdisk: Arc::new(Blktap::new(
                log.new(o!("component" => "tapctl")),
            )),
            copier: Arc::new(SparseDd::new(
                log.new(o!("component" => "sparse_dd")),
            )),
            nbd: Arc::new(HttpNbdConnector),
            scheduler: Arc::new(ThreadScheduler::new(
                log.new(o!("component" => "scheduler")),
            )),
            tasks: Arc::new(TaskService::new(
                log.new(o!("component" => "tasks")),
            )),
            updates: Arc::new(UpdateBus::new()),
            config,
            log,
        });
        Sxm { ctx }
    }

    /// Assemble a coordinator around an existing context, e.g. with some
    /// collaborators replaced.
    pub fn with_context(ctx: Arc<Context>) -> Sxm {
        Sxm { ctx }
    }

    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.ctx.tasks
    }

    pub fn updates(&self) -> &Arc<UpdateBus> {
        &self.ctx.updates
    }

    /// Begin mirroring `sr/vdi` to the destination.  Returns a task id;
    /// the task completes with the mirror id once the mirror is live and
    /// composed.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        mirror_vm: &str,
        copy_vm: &str,
        url: &str,
        dest_sr: &str,
        verify_dest: bool,
    ) -> String {
        let ctx = Arc::clone(&self.ctx);
        let name = format!("mirror {}/{}", sr, vdi);
        let (sr, vdi, dp, mirror_vm, copy_vm, url, dest_sr) = (
            sr.to_string(),
            vdi.to_string(),
            dp.to_string(),
            mirror_vm.to_string(),
            copy_vm.to_string(),
            url.to_string(),
            dest_sr.to_string(),
        );
        self.ctx.tasks.spawn(&name, move |task| {
            mirror::start(
                &ctx, &task, &sr, &vdi, &dp, &mirror_vm, &copy_vm, &url,
                &dest_sr, verify_dest,
            )
            .map(TaskResult::Mirror)
        })
    }

    pub fn stop(&self, id: &str) -> Result<(), SxmError> {
        mirror::stop(&self.ctx, id)
    }

    /// Copy `sr/vdi` to the destination SR.  Returns a task id; the task
    /// completes with the info of the snapshot left on the destination.
    pub fn copy(
        &self,
        sr: &str,
        vdi: &str,
        vm: &str,
        url: &str,
        dest_sr: &str,
        verify_dest: bool,
    ) -> String {
        let ctx = Arc::clone(&self.ctx);
        let name = format!("copy {}/{}", sr, vdi);
        let (sr, vdi, vm, url, dest_sr) = (
            sr.to_string(),
            vdi.to_string(),
            vm.to_string(),
            url.to_string(),
            dest_sr.to_string(),
        );
        self.ctx.tasks.spawn(&name, move |task| {
            copy::copy_into_sr(
                &ctx, &task, &sr, &vdi, &vm, &url, &dest_sr, verify_dest,
            )
            .map(|v| TaskResult::Vdi(Box::new(v)))
        })
    }

    pub fn stat(&self, id: &str) -> Result<MirrorStat, SxmError> {
        let send = self.ctx.state.find_active_local_mirror(id);
        let recv = self.ctx.state.find_active_receive_mirror(id);
        let copy = self.ctx.state.find_active_copy(id);
        if send.is_none() && recv.is_none() && copy.is_none() {
            return Err(SxmError::DoesNotExist(
                "mirror".to_string(),
                id.to_string(),
            ));
        }

        let mut stat = MirrorStat {
            source_vdi: String::new(),
            dest_vdi: String::new(),
            state: Vec::new(),
            failed: false,
        };
        if let Some(s) = send {
            stat.state.push(MirrorState::Sending);
            stat.source_vdi = of_mirror_id(id)?.1;
            if let Some(ri) = s.remote_info {
                stat.dest_vdi = ri.vdi;
            }
            stat.failed = s.failed;
        }
        if let Some(r) = recv {
            stat.state.push(MirrorState::Receiving);
            if stat.source_vdi.is_empty() {
                stat.source_vdi = r.remote_vdi;
            }
            if stat.dest_vdi.is_empty() {
                stat.dest_vdi = r.leaf_vdi;
            }
        }
        if let Some(c) = copy {
            stat.state.push(MirrorState::Copying);
            if stat.source_vdi.is_empty() {
                stat.source_vdi = of_copy_id(id)?.1;
            }
            if stat.dest_vdi.is_empty() {
                stat.dest_vdi = c.copy_vdi;
            }
        }
        Ok(stat)
    }

    /// Every operation id across all three tables, with its stat.
    pub fn list(&self) -> Vec<(String, MirrorStat)> {
        let (send, recv, copy) = self.ctx.state.map_of();
        let mut ids: Vec<String> = Vec::new();
        for id in send
            .iter()
            .map(|(id, _)| id)
            .chain(recv.iter().map(|(id, _)| id))
            .chain(copy.iter().map(|(id, _)| id))
        {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.stat(&id).ok().map(|s| (id, s)))
            .collect()
    }

    pub fn receive_start(
        &self,
        sr: &str,
        vdi_info: &VdiInfo,
        id: &str,
        similar: &[String],
    ) -> Result<storage::MirrorReceiveResult, SxmError> {
        receive::receive_start(&self.ctx, sr, vdi_info, id, similar)
    }

    pub fn receive_start2(
        &self,
        sr: &str,
        vdi_info: &VdiInfo,
        id: &str,
        similars: &[String],
        vm: &str,
    ) -> Result<storage::MirrorReceiveResult, SxmError> {
        receive::receive_start2(&self.ctx, sr, vdi_info, id, similars, vm)
    }

    pub fn receive_finalize(&self, id: &str) -> Result<(), SxmError> {
        receive::receive_finalize(&self.ctx, id)
    }

    pub fn receive_cancel(&self, id: &str) -> Result<(), SxmError> {
        receive::receive_cancel(&self.ctx, id)
    }

    pub fn nbd_handler(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
        fd: std::os::fd::RawFd,
    ) -> Result<(), SxmError> {
        receive::nbd_handler(&self.ctx, sr, vdi, dp, vm, fd)
    }

    pub fn pre_deactivate_hook(&self, sr: &str, vdi: &str) {
        hooks::pre_deactivate_hook(&self.ctx, sr, vdi)
    }

    pub fn post_detach_hook(
        &self,
        sr: &str,
        vdi: &str,
    ) -> Option<std::thread::JoinHandle<()>> {
        hooks::post_detach_hook(&self.ctx, sr, vdi)
    }

    /// Map local snapshot info onto the destination's copies after a
    /// completed migration.
    #[allow(clippy::too_many_arguments)]
    pub fn update_snapshot_info_src(
        &self,
        sr: &str,
        vdi: &str,
        url: &str,
        dest_sr: &str,
        dest_vdi: &str,
        snapshot_pairs: &[(String, String)],
        verify_dest: bool,
    ) -> Result<(), SxmError> {
        let remote = self.ctx.remote.connect(url, verify_dest)?;
        let vdis = self.ctx.local.sr_scan(sr)?;
        let find = |wanted: &str| {
            vdis.iter().find(|v| v.vdi == wanted).cloned().ok_or_else(|| {
                SxmError::NotFound("vdi".to_string(), wanted.to_string())
            })
        };

        let src_vdi = find(vdi)?;
        let pairs = snapshot_pairs
            .iter()
            .map(|(local_snapshot, remote_vdi)| {
                Ok((remote_vdi.clone(), find(local_snapshot)?))
            })
            .collect::<Result<Vec<_>, SxmError>>()?;

        remote.sr_update_snapshot_info_dest(dest_sr, dest_vdi, &src_vdi, &pairs)
    }

    pub fn killall(&self) {
        mirror::killall(&self.ctx)
    }
}
