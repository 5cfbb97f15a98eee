// Copyright 2025 Oxide Computer Company

use std::io::IoSlice;
use std::os::fd::RawFd;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use slog::{error, info, Logger};

use sxm_common::{sxm_bail, SxmError};

/// A running tap-disk instance, addressed by process and minor number.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Copy)]
pub struct Tapdev {
    pub pid: i32,
    pub minor: i32,
}

/// The subset of tap-disk statistics the coordinator reads: the drain hook
/// waits for `reqs_outstanding` to hit zero, and the watchdog checks
/// `nbd_mirror_failed`.
#[allow(clippy::derive_partial_eq_without_eq)]
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct TapdiskStats {
    #[serde(default)]
    pub reqs_outstanding: u64,
    #[serde(default)]
    pub nbd_mirror_failed: u8,
}

/// Control surface of the tap-disk daemon: device resolution, statistics,
/// socket handoff, and the local NBD client used by scoped activation.
pub trait TapdiskInterface: Sync + Send {
    fn of_device(&self, path: &str) -> Result<Tapdev, SxmError>;
    fn stats(&self, tapdev: &Tapdev) -> Result<TapdiskStats, SxmError>;

    /// Donate `fd` to the tap-disk listening on `control_path`, with the
    /// data-path name as the payload.  A short write means tap-disk did
    /// not take ownership and the operation must fail.
    fn send_fd(
        &self,
        control_path: &Path,
        dp: &str,
        fd: RawFd,
    ) -> Result<(), SxmError>;

    fn nbd_client_attach(
        &self,
        socket: &Path,
        export: &str,
    ) -> Result<PathBuf, SxmError>;
    fn nbd_client_detach(&self, device: &Path) -> Result<(), SxmError>;
}

/// Path of the NBD fd-receiver socket for the tap-disk with this pid.
pub fn nbd_client_socket(control_dir: &Path, pid: i32) -> PathBuf {
    control_dir.join(format!("nbdclient{}", pid))
}

/// Production implementation backed by `tap-ctl` and `nbd-client`.
pub struct Blktap {
    log: Logger,
}

impl Blktap {
    pub fn new(log: Logger) -> Blktap {
        Blktap { log }
    }
}

/// Parse one `tap-ctl list` line of `key=value` tokens.
fn parse_list_line(line: &str) -> Option<Tapdev> {
    let mut pid = None;
    let mut minor = None;
    for token in line.split_whitespace() {
        match token.split_once('=') {
            Some(("pid", v)) => pid = v.parse().ok(),
            Some(("minor", v)) => minor = v.parse().ok(),
            _ => (),
        }
    }
    Some(Tapdev {
        pid: pid?,
        minor: minor?,
    })
}

/// Minor number from a device node like `/dev/xen/blktap-2/tapdev3`.
fn minor_of_device(path: &str) -> Option<i32> {
    let base = Path::new(path).file_name()?.to_str()?;
    base.strip_prefix("tapdev")?.parse().ok()
}

impl TapdiskInterface for Blktap {
    fn of_device(&self, path: &str) -> Result<Tapdev, SxmError> {
        let minor = minor_of_device(path).ok_or_else(|| {
            SxmError::InternalError(format!("not a tap device: {}", path))
        })?;

        let out = Command::new("tap-ctl")
            .args(["list", "-m", &minor.to_string()])
            .output()?;
        if !out.status.success() {
            error!(
                self.log,
                "tap-ctl list -m {} failed: {:?}",
                minor,
                String::from_utf8_lossy(&out.stderr)
            );
            return Err(SxmError::InternalError(format!(
                "tap-ctl list failed for minor {}",
                minor
            )));
        }

        String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(parse_list_line)
            .find(|t| t.minor == minor)
            .ok_or_else(|| {
                SxmError::InternalError(format!(
                    "no tap-disk for minor {}",
                    minor
                ))
            })
    }

    fn stats(&self, tapdev: &Tapdev) -> Result<TapdiskStats, SxmError> {
        let out = Command::new("tap-ctl")
            .args([
                "stats",
                "-p",
                &tapdev.pid.to_string(),
                "-m",
                &tapdev.minor.to_string(),
            ])
            .output()?;
        if !out.status.success() {
            sxm_bail!(
                InternalError,
                "tap-ctl stats failed for {:?}: {:?}",
                tapdev,
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(serde_json::from_slice(&out.stdout)?)
    }

    fn send_fd(
        &self,
        control_path: &Path,
        dp: &str,
        fd: RawFd,
    ) -> Result<(), SxmError> {
        let stream = UnixStream::connect(control_path).map_err(|e| {
            SxmError::InternalError(format!(
                "connect {:?}: {:?}",
                control_path, e
            ))
        })?;

        let iov = [IoSlice::new(dp.as_bytes())];
        let fds = [fd];
        let cmsg = [nix::sys::socket::ControlMessage::ScmRights(&fds)];
        let n = nix::sys::socket::sendmsg::<()>(
            stream.as_raw_fd(),
            &iov,
            &cmsg,
            nix::sys::socket::MsgFlags::empty(),
            None,
        )
        .map_err(|e| {
            SxmError::InternalError(format!(
                "sendmsg to {:?}: {}",
                control_path, e
            ))
        })?;

        if n != dp.len() {
            sxm_bail!(
                InternalError,
                "short transfer to {:?}: sent {} of {} bytes",
                control_path,
                n,
                dp.len()
            );
        }

        info!(
            self.log,
            "handed fd to tap-disk at {:?} for datapath {}", control_path, dp
        );
        Ok(())
    }

    fn nbd_client_attach(
        &self,
        socket: &Path,
        export: &str,
    ) -> Result<PathBuf, SxmError> {
        let device = free_nbd_device()?;
        let out = Command::new("nbd-client")
            .arg("-unix")
            .arg(socket)
            .arg(&device)
            .args(["-name", export])
            .output()?;
        if !out.status.success() {
            return Err(SxmError::InternalError(format!(
                "nbd-client {:?} {}: {:?}",
                socket,
                export,
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        wait_nbd_connected(&device, Duration::from_secs(30))?;
        info!(self.log, "nbd client on {:?} for export {}", device, export);
        Ok(device)
    }

    fn nbd_client_detach(&self, device: &Path) -> Result<(), SxmError> {
        let out = Command::new("nbd-client").arg("-d").arg(device).output()?;
        if !out.status.success() {
            return Err(SxmError::InternalError(format!(
                "nbd-client -d {:?}: {:?}",
                device,
                String::from_utf8_lossy(&out.stderr)
            )));
        }
        Ok(())
    }
}

/// An nbd device is free when the kernel exposes no connected pid for it.
fn free_nbd_device() -> Result<PathBuf, SxmError> {
    for entry in std::fs::read_dir("/sys/block")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("nbd") {
            continue;
        }
        if !entry.path().join("pid").exists() {
            return Ok(PathBuf::from(format!("/dev/{}", name)));
        }
    }
    Err(SxmError::InternalError(
        "no free nbd device".to_string(),
    ))
}

fn wait_nbd_connected(device: &Path, timeout: Duration) -> Result<(), SxmError> {
    let name = device
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            SxmError::InternalError(format!("bad nbd device {:?}", device))
        })?;
    let pid_path = PathBuf::from(format!("/sys/block/{}/pid", name));
    let deadline = Instant::now() + timeout;
    while !pid_path.exists() {
        if Instant::now() >= deadline {
            return Err(SxmError::InternalError(format!(
                "nbd device {:?} did not connect",
                device
            )));
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

/// Scripted tap-disk for tests: canned stats, recorded handoffs, and a
/// fixed device table.
#[cfg(test)]
pub struct TestTapdisk {
    inner: std::sync::Mutex<TestTapdiskInner>,
}

#[cfg(test)]
struct TestTapdiskInner {
    devices: std::collections::BTreeMap<String, Tapdev>,
    stats: std::collections::VecDeque<TapdiskStats>,
    last_stats: TapdiskStats,
    handoffs: Vec<(PathBuf, String)>,
    nbd_attached: Vec<PathBuf>,
}

#[cfg(test)]
impl TestTapdisk {
    pub fn new() -> TestTapdisk {
        TestTapdisk {
            inner: std::sync::Mutex::new(TestTapdiskInner {
                devices: std::collections::BTreeMap::new(),
                stats: std::collections::VecDeque::new(),
                last_stats: TapdiskStats::default(),
                handoffs: Vec::new(),
                nbd_attached: Vec::new(),
            }),
        }
    }

    pub fn insert_device(&self, path: &str, tapdev: Tapdev) {
        self.inner
            .lock()
            .unwrap()
            .devices
            .insert(path.to_string(), tapdev);
    }

    /// Queue stats readings; the final one repeats forever.
    pub fn push_stats(&self, stats: TapdiskStats) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_stats = stats.clone();
        inner.stats.push_back(stats);
    }

    pub fn handoffs(&self) -> Vec<(PathBuf, String)> {
        self.inner.lock().unwrap().handoffs.clone()
    }
}

#[cfg(test)]
impl TapdiskInterface for TestTapdisk {
    fn of_device(&self, path: &str) -> Result<Tapdev, SxmError> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .get(path)
            .copied()
            .ok_or_else(|| {
                SxmError::InternalError(format!("not a tap device: {}", path))
            })
    }

    fn stats(&self, _tapdev: &Tapdev) -> Result<TapdiskStats, SxmError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.stats.pop_front() {
            Some(s) => Ok(s),
            None => Ok(inner.last_stats.clone()),
        }
    }

    fn send_fd(
        &self,
        control_path: &Path,
        dp: &str,
        _fd: RawFd,
    ) -> Result<(), SxmError> {
        self.inner
            .lock()
            .unwrap()
            .handoffs
            .push((control_path.to_path_buf(), dp.to_string()));
        Ok(())
    }

    fn nbd_client_attach(
        &self,
        socket: &Path,
        _export: &str,
    ) -> Result<PathBuf, SxmError> {
        let device = PathBuf::from(format!(
            "/dev/nbd-test-{}",
            socket.file_name().unwrap().to_string_lossy()
        ));
        self.inner.lock().unwrap().nbd_attached.push(device.clone());
        Ok(device)
    }

    fn nbd_client_detach(&self, device: &Path) -> Result<(), SxmError> {
        let mut inner = self.inner.lock().unwrap();
        inner.nbd_attached.retain(|d| d != device);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn csl() -> Logger {
        sxm_common::build_logger()
    }

    #[test]
    fn parse_tap_ctl_list() {
        let t =
            parse_list_line("pid=4242 minor=3 state=0 args=vhd:/a.vhd")
                .unwrap();
        assert_eq!(t, Tapdev { pid: 4242, minor: 3 });

        assert!(parse_list_line("garbage").is_none());
        assert!(parse_list_line("pid=1 state=0").is_none());
    }

    #[test]
    fn minor_from_device_path() {
        assert_eq!(minor_of_device("/dev/xen/blktap-2/tapdev7"), Some(7));
        assert_eq!(minor_of_device("/dev/xen/blktap-2/xvda"), None);
    }

    #[test]
    fn stats_parse_ignores_unknown_fields() {
        let raw = r#"{
            "reqs_outstanding": 5,
            "nbd_mirror_failed": 1,
            "read_reqs_submitted": 100,
            "name": "vhd:/a.vhd"
        }"#;
        let s: TapdiskStats = serde_json::from_str(raw).unwrap();
        assert_eq!(s.reqs_outstanding, 5);
        assert_eq!(s.nbd_mirror_failed, 1);
    }

    #[test]
    fn control_socket_path() {
        assert_eq!(
            nbd_client_socket(Path::new("/var/run/blktap-control"), 4242),
            PathBuf::from("/var/run/blktap-control/nbdclient4242")
        );
    }

    // End-to-end fd handoff over a real unix socket: the receiver must see
    // the data-path name and a usable duplicate of the donated fd.
    #[test]
    fn send_fd_delivers_payload_and_fd() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("nbdclient4242");
        let listener = UnixListener::bind(&sock).unwrap();

        let donated = tempfile::tempfile().unwrap();
        let blktap = Blktap::new(csl());
        let dp = "dp-one";

        let receiver = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let mut cmsg = nix::cmsg_space!([RawFd; 1]);
            let mut iov = [std::io::IoSliceMut::new(&mut buf)];
            let msg = nix::sys::socket::recvmsg::<()>(
                stream.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg),
                nix::sys::socket::MsgFlags::empty(),
            )
            .unwrap();
            let n = msg.bytes;
            let fds: Vec<RawFd> = msg
                .cmsgs()
                .unwrap()
                .filter_map(|c| match c {
                    nix::sys::socket::ControlMessageOwned::ScmRights(f) => {
                        Some(f)
                    }
                    _ => None,
                })
                .flatten()
                .collect();
            (n, buf, fds)
        });

        blktap.send_fd(&sock, dp, donated.as_raw_fd()).unwrap();

        let (n, buf, fds) = receiver.join().unwrap();
        assert_eq!(n, dp.len());
        assert_eq!(&buf[..n], dp.as_bytes());
        assert_eq!(fds.len(), 1);
    }
}
