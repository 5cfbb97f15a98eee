// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};

use sxm_common::{mkdir_private, read_json_maybe, write_json, SxmError};

use crate::scheduler::SchedulerHandle;
use crate::tapctl::Tapdev;

pub const SEND_FILE: &str = "storage_mirrors_send.json";
pub const RECV_FILE: &str = "storage_mirrors_recv.json";
pub const COPY_FILE: &str = "storage_mirrors_copy.json";

/// Remote-side coordinates of an established mirror.  Absent until the
/// destination has acknowledged `receive_start2`; while absent there is
/// nothing on the far side for `stop` to cancel.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct RemoteMirrorInfo {
    pub dp: String,
    pub vdi: String,
    pub url: String,
    #[serde(default)]
    pub verify_dest: bool,
}

/// One active outbound mirror, keyed by mirror id in the send table.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct SendState {
    pub url: String,
    pub dest_sr: String,
    #[serde(default)]
    pub remote_info: Option<RemoteMirrorInfo>,
    pub local_dp: String,
    #[serde(default)]
    pub tapdev: Option<Tapdev>,
    /// Latched by the drain hook and the watchdog; once set, never cleared.
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub watchdog: Option<SchedulerHandle>,
}

/// One active inbound mirror, held on the destination host.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ReceiveState {
    pub sr: String,
    /// Snapshot of the leaf taken right after creation, pinning its base
    /// until finalize.
    pub dummy_vdi: String,
    pub leaf_vdi: String,
    pub leaf_dp: String,
    pub parent_vdi: String,
    pub remote_vdi: String,
    pub vm: String,
}

/// One standalone copy in flight, keyed by copy id.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct CopyState {
    pub base_dp: String,
    pub leaf_dp: String,
    pub remote_dp: String,
    pub dest_sr: String,
    pub copy_vdi: String,
    pub remote_url: String,
    #[serde(default)]
    pub verify_dest: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Send(SendState),
    Recv(ReceiveState),
    Copy(CopyState),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Table {
    Send,
    Recv,
    Copy,
}

pub fn mirror_id_of(sr: &str, vdi: &str) -> String {
    format!("{}/{}", sr, vdi)
}

/// Split a mirror id back into `(sr, vdi)`.  Only the first separator
/// counts; the VDI part may itself contain `/`.
pub fn of_mirror_id(id: &str) -> Result<(String, String), SxmError> {
    match id.split_once('/') {
        Some((sr, vdi)) if !sr.is_empty() && !vdi.is_empty() => {
            Ok((sr.to_string(), vdi.to_string()))
        }
        _ => Err(SxmError::InternalError(format!("bad mirror id: {}", id))),
    }
}

pub fn copy_id_of(sr: &str, vdi: &str) -> String {
    format!("copy/{}/{}", sr, vdi)
}

pub fn of_copy_id(id: &str) -> Result<(String, String), SxmError> {
    match id.strip_prefix("copy/") {
        Some(rest) => of_mirror_id(rest),
        None => Err(SxmError::InternalError(format!("bad copy id: {}", id))),
    }
}

/// The operation registry: three typed tables mirrored to three JSON files
/// under `persist_root`.  A single mutex serialises every entry point, and
/// each mutation rewrites all three files before the lock is released.
pub struct Registry {
    log: Logger,
    persist_root: PathBuf,
    inner: Mutex<Inner>,
}

struct Inner {
    loaded: bool,
    send: BTreeMap<String, SendState>,
    recv: BTreeMap<String, ReceiveState>,
    copy: BTreeMap<String, CopyState>,
}

impl Registry {
    pub fn new(log: Logger, persist_root: PathBuf) -> Registry {
        Registry {
            log,
            persist_root,
            inner: Mutex::new(Inner {
                loaded: false,
                send: BTreeMap::new(),
                recv: BTreeMap::new(),
                copy: BTreeMap::new(),
            }),
        }
    }

    /// Merge the on-disk tables into memory, once per process.  The store
    /// is advisory: a missing or undecodable file is logged and treated as
    /// empty, never propagated.
    fn load(&self, inner: &mut Inner) {
        if inner.loaded {
            return;
        }
        inner.loaded = true;

        fn merge<T>(
            log: &Logger,
            root: &PathBuf,
            file: &str,
            table: &mut BTreeMap<String, T>,
        ) where
            for<'de> T: Deserialize<'de>,
        {
            let path = root.join(file);
            match read_json_maybe::<_, BTreeMap<String, T>>(&path) {
                Ok(Some(loaded)) => {
                    info!(log, "loaded {} entries from {:?}", loaded.len(), path);
                    table.extend(loaded);
                }
                Ok(None) => (),
                Err(e) => {
                    error!(log, "ignoring corrupt {:?}: {:?}", path, e);
                }
            }
        }

        merge(&self.log, &self.persist_root, SEND_FILE, &mut inner.send);
        merge(&self.log, &self.persist_root, RECV_FILE, &mut inner.recv);
        merge(&self.log, &self.persist_root, COPY_FILE, &mut inner.copy);
    }

    /// Rewrite all three files from the in-memory tables.  Runs inside the
    /// caller's critical section so readers never observe a file ahead of
    /// or behind memory.
    fn store(&self, inner: &MutexGuard<Inner>) -> Result<(), SxmError> {
        mkdir_private(&self.persist_root)?;
        write_json(self.persist_root.join(SEND_FILE), &inner.send, true)?;
        write_json(self.persist_root.join(RECV_FILE), &inner.recv, true)?;
        write_json(self.persist_root.join(COPY_FILE), &inner.copy, true)?;
        Ok(())
    }

    pub fn add(&self, id: &str, op: Operation) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner);
        match op {
            Operation::Send(s) => {
                inner.send.insert(id.to_string(), s);
            }
            Operation::Recv(r) => {
                inner.recv.insert(id.to_string(), r);
            }
            Operation::Copy(c) => {
                inner.copy.insert(id.to_string(), c);
            }
        }
        self.store(&inner)
    }

    pub fn find(&self, id: &str, table: Table) -> Option<Operation> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner);
        match table {
            Table::Send => inner.send.get(id).cloned().map(Operation::Send),
            Table::Recv => inner.recv.get(id).cloned().map(Operation::Recv),
            Table::Copy => inner.copy.get(id).cloned().map(Operation::Copy),
        }
    }

    pub fn remove(&self, id: &str, table: Table) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner);
        match table {
            Table::Send => {
                inner.send.remove(id);
            }
            Table::Recv => {
                inner.recv.remove(id);
            }
            Table::Copy => {
                inner.copy.remove(id);
            }
        }
        self.store(&inner)
    }

    pub fn clear(&self) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner);
        inner.send.clear();
        inner.recv.clear();
        inner.copy.clear();
        self.store(&inner)
    }

    /// Snapshot of all three tables as ordered key/value lists.
    #[allow(clippy::type_complexity)]
    pub fn map_of(
        &self,
    ) -> (
        Vec<(String, SendState)>,
        Vec<(String, ReceiveState)>,
        Vec<(String, CopyState)>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner);
        (
            inner.send.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            inner.recv.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            inner.copy.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        )
    }

    /// Mutate one send record in place, persisting the result.  Returns
    /// false if the id has no record.
    pub fn update_send<F>(&self, id: &str, f: F) -> Result<bool, SxmError>
    where
        F: FnOnce(&mut SendState),
    {
        let mut inner = self.inner.lock().unwrap();
        self.load(&mut inner);
        match inner.send.get_mut(id) {
            Some(s) => {
                f(s);
                self.store(&inner)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn find_active_local_mirror(&self, id: &str) -> Option<SendState> {
        match self.find(id, Table::Send) {
            Some(Operation::Send(s)) => Some(s),
            _ => None,
        }
    }

    pub fn find_active_receive_mirror(&self, id: &str) -> Option<ReceiveState> {
        match self.find(id, Table::Recv) {
            Some(Operation::Recv(r)) => Some(r),
            _ => None,
        }
    }

    pub fn find_active_copy(&self, id: &str) -> Option<CopyState> {
        match self.find(id, Table::Copy) {
            Some(Operation::Copy(c)) => Some(c),
            _ => None,
        }
    }

    pub fn remove_local_mirror(&self, id: &str) -> Result<(), SxmError> {
        self.remove(id, Table::Send)
    }

    pub fn remove_receive_mirror(&self, id: &str) -> Result<(), SxmError> {
        self.remove(id, Table::Recv)
    }

    pub fn remove_copy(&self, id: &str) -> Result<(), SxmError> {
        self.remove(id, Table::Copy)
    }
}
