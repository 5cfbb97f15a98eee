// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use sxm_common::SxmError;

#[cfg(test)]
use std::sync::Mutex;

/// Everything the storage stack reports about one VDI.  The same shape is
/// used for local records, remote records, and RPC bodies.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct VdiInfo {
    pub vdi: String,

    /// Opaque tag identifying the data content.  Two VDIs with equal,
    /// non-empty content ids may serve as incremental bases for each other.
    #[serde(default)]
    pub content_id: String,

    #[serde(default)]
    pub name_label: String,

    #[serde(default)]
    pub name_description: String,

    /// Backend VDI type; `cbt_metadata` VDIs carry no disk data and are
    /// excluded from migration.
    #[serde(default, rename = "type")]
    pub ty: String,

    #[serde(default)]
    pub is_a_snapshot: bool,

    #[serde(default)]
    pub snapshot_time: String,

    #[serde(default)]
    pub snapshot_of: String,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default)]
    pub virtual_size: u64,

    #[serde(default)]
    pub physical_utilisation: u64,

    #[serde(default)]
    pub sharable: bool,

    #[serde(default = "default_persistent")]
    pub persistent: bool,

    #[serde(default)]
    pub sm_config: BTreeMap<String, String>,
}

fn default_persistent() -> bool {
    true
}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct SrInfo {
    pub sr: String,

    #[serde(default)]
    pub name_label: String,

    #[serde(default)]
    pub total_space: u64,

    #[serde(default)]
    pub free_space: u64,
}

/// One way the backend can expose an attached VDI to a consumer.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockBackend {
    File { path: String },
    BlockDevice { path: String },
    Nbd { uri: String },
}

#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct AttachInfo {
    pub implementations: Vec<BlockBackend>,
}

/// What the destination host hands back from `mirror_receive_start2`: the
/// live mirror target, its data-path, and where snapshot diffs should be
/// copied while the mirror runs.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct MirrorReceiveResult {
    pub mirror_vdi: String,
    pub mirror_datapath: String,
    pub copy_diffs_from: Option<String>,
    pub copy_diffs_to: String,
    pub dummy_vdi: String,
}

/// The storage control interface the coordinator drives, on this host and
/// (through the RPC client) on the destination.  Implementations must be
/// safe to call from multiple worker threads.
pub trait StorageApi: Sync + Send {
    fn sr_list(&self) -> Result<Vec<String>, SxmError>;
    fn sr_scan(&self, sr: &str) -> Result<Vec<VdiInfo>, SxmError>;
    fn sr_scan2(&self, sr: &str) -> Result<(Vec<VdiInfo>, SrInfo), SxmError>;
    fn sr_update_snapshot_info_dest(
        &self,
        sr: &str,
        vdi: &str,
        src_vdi: &VdiInfo,
        snapshot_pairs: &[(String, VdiInfo)],
    ) -> Result<(), SxmError>;

    fn vdi_create(&self, sr: &str, info: &VdiInfo) -> Result<VdiInfo, SxmError>;
    fn vdi_clone(&self, sr: &str, info: &VdiInfo) -> Result<VdiInfo, SxmError>;
    fn vdi_snapshot(
        &self,
        sr: &str,
        info: &VdiInfo,
    ) -> Result<VdiInfo, SxmError>;
    fn vdi_destroy(&self, sr: &str, vdi: &str) -> Result<(), SxmError>;
    fn vdi_resize(
        &self,
        sr: &str,
        vdi: &str,
        new_size: u64,
    ) -> Result<u64, SxmError>;
    fn vdi_attach3(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
        read_write: bool,
    ) -> Result<AttachInfo, SxmError>;
    fn vdi_activate3(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError>;
    fn vdi_deactivate(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError>;
    fn vdi_detach(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError>;
    fn vdi_set_content_id(
        &self,
        sr: &str,
        vdi: &str,
        content_id: &str,
    ) -> Result<(), SxmError>;
    fn vdi_similar_content(
        &self,
        sr: &str,
        vdi: &str,
    ) -> Result<Vec<VdiInfo>, SxmError>;
    fn vdi_compose(
        &self,
        sr: &str,
        vdi1: &str,
        vdi2: &str,
    ) -> Result<(), SxmError>;

    fn dp_create(&self, id: &str) -> Result<String, SxmError>;
    fn dp_attach_info(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
    ) -> Result<AttachInfo, SxmError>;
    fn dp_destroy(&self, dp: &str, allow_leak: bool) -> Result<(), SxmError>;

    fn mirror_receive_start2(
        &self,
        sr: &str,
        vdi_info: &VdiInfo,
        id: &str,
        similars: &[String],
        vm: &str,
    ) -> Result<MirrorReceiveResult, SxmError>;
    fn mirror_receive_cancel(&self, id: &str) -> Result<(), SxmError>;
    fn mirror_receive_finalize(&self, id: &str) -> Result<(), SxmError>;
    fn mirror_import_activate(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
    ) -> Result<String, SxmError>;
}

/// In-memory storage stack for tests.  Tracks SRs, VDIs, and attachments,
/// records every call in order, and can be scripted to fail a method.
#[cfg(test)]
pub struct TestStorage {
    inner: Mutex<TestStorageInner>,
}

#[cfg(test)]
struct TestStorageInner {
    srs: BTreeMap<String, TestSr>,
    attachments: BTreeMap<String, TestAttachment>,
    calls: Vec<String>,
    fail: BTreeMap<String, SxmError>,
    next_vdi: u64,
    receives: BTreeMap<String, MirrorReceiveResult>,
}

#[cfg(test)]
struct TestSr {
    info: SrInfo,
    vdis: BTreeMap<String, VdiInfo>,
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub struct TestAttachment {
    pub sr: String,
    pub vdi: String,
    pub vm: String,
    pub read_write: bool,
    pub activated: bool,
    pub backend: BlockBackend,
}

#[cfg(test)]
impl TestStorage {
    pub fn new(srs: &[&str]) -> TestStorage {
        let srs = srs
            .iter()
            .map(|sr| {
                (
                    sr.to_string(),
                    TestSr {
                        info: SrInfo {
                            sr: sr.to_string(),
                            name_label: sr.to_string(),
                            total_space: 1 << 40,
                            free_space: 1 << 39,
                        },
                        vdis: BTreeMap::new(),
                    },
                )
            })
            .collect();

        TestStorage {
            inner: Mutex::new(TestStorageInner {
                srs,
                attachments: BTreeMap::new(),
                calls: Vec::new(),
                fail: BTreeMap::new(),
                next_vdi: 0,
                receives: BTreeMap::new(),
            }),
        }
    }

    /// Seed an attachment as if the surrounding stack had already
    /// attached the disk, e.g. the running VM's own data-path.
    pub fn insert_attachment(&self, dp: &str, attachment: TestAttachment) {
        self.inner
            .lock()
            .unwrap()
            .attachments
            .insert(dp.to_string(), attachment);
    }

    /// Insert a VDI directly, bypassing call recording.
    pub fn insert_vdi(&self, sr: &str, info: VdiInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .srs
            .get_mut(sr)
            .expect("test SR exists")
            .vdis
            .insert(info.vdi.clone(), info);
    }

    pub fn get_vdi(&self, sr: &str, vdi: &str) -> Option<VdiInfo> {
        let inner = self.inner.lock().unwrap();
        inner.srs.get(sr).and_then(|s| s.vdis.get(vdi)).cloned()
    }

    /// Every VDI in an SR, without recording a scan.
    pub fn sr_vdis(&self, sr: &str) -> Vec<VdiInfo> {
        let inner = self.inner.lock().unwrap();
        inner
            .srs
            .get(sr)
            .map(|s| s.vdis.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn attachment(&self, dp: &str) -> Option<TestAttachment> {
        self.inner.lock().unwrap().attachments.get(dp).cloned()
    }

    /// Arrange for the named method to fail on its next invocation.
    pub fn fail_next(&self, method: &str, e: SxmError) {
        self.inner
            .lock()
            .unwrap()
            .fail
            .insert(method.to_string(), e);
    }

    fn enter(
        inner: &mut TestStorageInner,
        call: String,
        method: &str,
    ) -> Result<(), SxmError> {
        inner.calls.push(call);
        match inner.fail.remove(method) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn fresh_vdi(inner: &mut TestStorageInner) -> String {
        inner.next_vdi += 1;
        format!("vdi-{}", inner.next_vdi)
    }
}

#[cfg(test)]
impl StorageApi for TestStorage {
    fn sr_list(&self) -> Result<Vec<String>, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(&mut inner, "sr_list".to_string(), "sr_list")?;
        Ok(inner.srs.keys().cloned().collect())
    }

    fn sr_scan(&self, sr: &str) -> Result<Vec<VdiInfo>, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(&mut inner, format!("sr_scan {}", sr), "sr_scan")?;
        let s = inner
            .srs
            .get(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        Ok(s.vdis.values().cloned().collect())
    }

    fn sr_scan2(&self, sr: &str) -> Result<(Vec<VdiInfo>, SrInfo), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(&mut inner, format!("sr_scan2 {}", sr), "sr_scan2")?;
        let s = inner
            .srs
            .get(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        Ok((s.vdis.values().cloned().collect(), s.info.clone()))
    }

    fn sr_update_snapshot_info_dest(
        &self,
        sr: &str,
        vdi: &str,
        _src_vdi: &VdiInfo,
        snapshot_pairs: &[(String, VdiInfo)],
    ) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!(
                "sr_update_snapshot_info_dest {} {} {}",
                sr,
                vdi,
                snapshot_pairs.len()
            ),
            "sr_update_snapshot_info_dest",
        )
    }

    fn vdi_create(&self, sr: &str, info: &VdiInfo) -> Result<VdiInfo, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(&mut inner, format!("vdi_create {}", sr), "vdi_create")?;
        let vdi = Self::fresh_vdi(&mut inner);
        let mut created = info.clone();
        created.vdi = vdi.clone();
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        s.vdis.insert(vdi, created.clone());
        Ok(created)
    }

    fn vdi_clone(&self, sr: &str, info: &VdiInfo) -> Result<VdiInfo, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_clone {} {}", sr, info.vdi),
            "vdi_clone",
        )?;
        let vdi = Self::fresh_vdi(&mut inner);
        let mut cloned = info.clone();
        cloned.vdi = vdi.clone();
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        s.vdis.insert(vdi, cloned.clone());
        Ok(cloned)
    }

    fn vdi_snapshot(
        &self,
        sr: &str,
        info: &VdiInfo,
    ) -> Result<VdiInfo, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_snapshot {} {}", sr, info.vdi),
            "vdi_snapshot",
        )?;
        let vdi = Self::fresh_vdi(&mut inner);
        let mut snap = info.clone();
        snap.vdi = vdi.clone();
        snap.is_a_snapshot = true;
        snap.snapshot_of = info.vdi.clone();
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        s.vdis.insert(vdi, snap.clone());
        Ok(snap)
    }

    fn vdi_destroy(&self, sr: &str, vdi: &str) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_destroy {} {}", sr, vdi),
            "vdi_destroy",
        )?;
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        s.vdis.remove(vdi);
        Ok(())
    }

    fn vdi_resize(
        &self,
        sr: &str,
        vdi: &str,
        new_size: u64,
    ) -> Result<u64, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_resize {} {} {}", sr, vdi, new_size),
            "vdi_resize",
        )?;
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        let v = s.vdis.get_mut(vdi).ok_or_else(|| {
            SxmError::NotFound("vdi".to_string(), vdi.to_string())
        })?;
        v.virtual_size = new_size;
        Ok(new_size)
    }

    fn vdi_attach3(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
        read_write: bool,
    ) -> Result<AttachInfo, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_attach3 {} {} {} {}", dp, sr, vdi, vm),
            "vdi_attach3",
        )?;
        let backend = BlockBackend::File {
            path: format!("/dev/sm/backend/{}/{}", sr, vdi),
        };
        inner.attachments.insert(
            dp.to_string(),
            TestAttachment {
                sr: sr.to_string(),
                vdi: vdi.to_string(),
                vm: vm.to_string(),
                read_write,
                activated: false,
                backend: backend.clone(),
            },
        );
        Ok(AttachInfo {
            implementations: vec![backend],
        })
    }

    fn vdi_activate3(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_activate3 {} {} {} {}", dp, sr, vdi, vm),
            "vdi_activate3",
        )?;
        match inner.attachments.get_mut(dp) {
            Some(a) => {
                a.activated = true;
                Ok(())
            }
            None => Err(SxmError::Unattached(dp.to_string())),
        }
    }

    fn vdi_deactivate(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_deactivate {} {} {} {}", dp, sr, vdi, vm),
            "vdi_deactivate",
        )?;
        if let Some(a) = inner.attachments.get_mut(dp) {
            a.activated = false;
        }
        Ok(())
    }

    fn vdi_detach(
        &self,
        dp: &str,
        sr: &str,
        vdi: &str,
        vm: &str,
    ) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_detach {} {} {} {}", dp, sr, vdi, vm),
            "vdi_detach",
        )?;
        inner.attachments.remove(dp);
        Ok(())
    }

    fn vdi_set_content_id(
        &self,
        sr: &str,
        vdi: &str,
        content_id: &str,
    ) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_set_content_id {} {} {}", sr, vdi, content_id),
            "vdi_set_content_id",
        )?;
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        let v = s.vdis.get_mut(vdi).ok_or_else(|| {
            SxmError::NotFound("vdi".to_string(), vdi.to_string())
        })?;
        v.content_id = content_id.to_string();
        Ok(())
    }

    fn vdi_similar_content(
        &self,
        sr: &str,
        vdi: &str,
    ) -> Result<Vec<VdiInfo>, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_similar_content {} {}", sr, vdi),
            "vdi_similar_content",
        )?;
        // Similarity in the fake is sharing a snapshot lineage or being the
        // VDI itself, ordered with the VDI first.
        let s = inner
            .srs
            .get(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        let mut out = Vec::new();
        if let Some(me) = s.vdis.get(vdi) {
            out.push(me.clone());
            for v in s.vdis.values() {
                if v.vdi != vdi
                    && (v.snapshot_of == vdi || me.snapshot_of == v.vdi)
                {
                    out.push(v.clone());
                }
            }
        }
        Ok(out)
    }

    fn vdi_compose(
        &self,
        sr: &str,
        vdi1: &str,
        vdi2: &str,
    ) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("vdi_compose {} {} {}", sr, vdi1, vdi2),
            "vdi_compose",
        )
    }

    fn dp_create(&self, id: &str) -> Result<String, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(&mut inner, format!("dp_create {}", id), "dp_create")?;
        Ok(id.to_string())
    }

    fn dp_attach_info(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
    ) -> Result<AttachInfo, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("dp_attach_info {} {} {} {}", sr, vdi, dp, vm),
            "dp_attach_info",
        )?;
        match inner.attachments.get(dp) {
            Some(a) => Ok(AttachInfo {
                implementations: vec![a.backend.clone()],
            }),
            None => Err(SxmError::Unattached(dp.to_string())),
        }
    }

    fn dp_destroy(&self, dp: &str, allow_leak: bool) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("dp_destroy {} {}", dp, allow_leak),
            "dp_destroy",
        )?;
        inner.attachments.remove(dp);
        Ok(())
    }

    fn mirror_receive_start2(
        &self,
        sr: &str,
        vdi_info: &VdiInfo,
        id: &str,
        similars: &[String],
        vm: &str,
    ) -> Result<MirrorReceiveResult, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("mirror_receive_start2 {} {} {}", sr, vdi_info.vdi, id),
            "mirror_receive_start2",
        )?;

        // Fabricate the destination objects the real receive engine would
        // create: a writable leaf, its pinning snapshot, and a parent to
        // copy diffs into.
        let leaf = Self::fresh_vdi(&mut inner);
        let dummy = Self::fresh_vdi(&mut inner);
        let parent = Self::fresh_vdi(&mut inner);
        let s = inner
            .srs
            .get_mut(sr)
            .ok_or_else(|| SxmError::NotFound("sr".to_string(), sr.to_string()))?;
        for (vdi, label) in
            [(&leaf, "leaf"), (&dummy, "dummy"), (&parent, "parent")]
        {
            s.vdis.insert(
                vdi.clone(),
                VdiInfo {
                    vdi: vdi.clone(),
                    name_label: format!("{} for {}", label, id),
                    virtual_size: vdi_info.virtual_size,
                    ..Default::default()
                },
            );
        }

        let result = MirrorReceiveResult {
            mirror_vdi: leaf,
            mirror_datapath: format!("dp-recv-{}", id),
            copy_diffs_from: similars.first().cloned(),
            copy_diffs_to: parent,
            dummy_vdi: dummy,
        };
        inner.receives.insert(id.to_string(), result.clone());
        let _ = vm;
        Ok(result)
    }

    fn mirror_receive_cancel(&self, id: &str) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("mirror_receive_cancel {}", id),
            "mirror_receive_cancel",
        )?;
        inner.receives.remove(id);
        Ok(())
    }

    fn mirror_receive_finalize(&self, id: &str) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("mirror_receive_finalize {}", id),
            "mirror_receive_finalize",
        )?;
        inner.receives.remove(id);
        Ok(())
    }

    fn mirror_import_activate(
        &self,
        sr: &str,
        vdi: &str,
        dp: &str,
        vm: &str,
    ) -> Result<String, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        Self::enter(
            &mut inner,
            format!("mirror_import_activate {} {} {} {}", sr, vdi, dp, vm),
            "mirror_import_activate",
        )?;
        Ok(format!("/var/run/blktap-control/import-{}", dp))
    }
}
