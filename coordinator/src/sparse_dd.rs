// Copyright 2025 Oxide Computer Company

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{debug, info, Logger};

use sxm_common::SxmError;

use crate::tasks::CancelToken;

/// One invocation of the block copier: source disk, NBD sink, and an
/// optional base disk for a differential copy.
#[derive(Debug)]
pub struct CopyArgs<'a> {
    pub src: &'a Path,
    pub dest_url: &'a str,
    pub base: Option<&'a Path>,
    pub size: u64,
}

/// The copy engine drives the copier through this seam so tests can script
/// transfers without a data path.
pub trait CopyProgram: Sync + Send {
    fn run(
        &self,
        args: &CopyArgs,
        progress: &mut dyn FnMut(f64),
        cancel: &CancelToken,
    ) -> Result<(), SxmError>;
}

/// Runs the real `sparse_dd` binary in machine-readable mode, relaying
/// progress lines and killing the child if the owning task is cancelled.
pub struct SparseDd {
    log: Logger,
    binary: PathBuf,
}

impl SparseDd {
    pub fn new(log: Logger) -> SparseDd {
        SparseDd {
            log,
            binary: PathBuf::from("/usr/libexec/xapi/sparse_dd"),
        }
    }

    pub fn with_binary(log: Logger, binary: PathBuf) -> SparseDd {
        SparseDd { log, binary }
    }
}

/// `-machine` output is one progress report per line, `Progress: {percent}`.
fn parse_progress_line(line: &str) -> Option<f64> {
    let percent: f64 = line.strip_prefix("Progress:")?.trim().parse().ok()?;
    if (0.0..=100.0).contains(&percent) {
        Some(percent / 100.0)
    } else {
        None
    }
}

impl CopyProgram for SparseDd {
    fn run(
        &self,
        args: &CopyArgs,
        progress: &mut dyn FnMut(f64),
        cancel: &CancelToken,
    ) -> Result<(), SxmError> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-machine")
            .arg("-src")
            .arg(args.src)
            .arg("-dest")
            .arg(args.dest_url)
            .args(["-size", &args.size.to_string()]);
        if let Some(base) = args.base {
            cmd.arg("-base").arg(base);
        }

        info!(self.log, "spawning {:?}", cmd);
        let mut child = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SxmError::InternalError(format!(
                    "spawn {:?}: {:?}",
                    self.binary, e
                ))
            })?;

        let stdout = child.stdout.take().unwrap();
        let mut stderr = child.stderr.take().unwrap();

        // The watcher owns the child so it can kill it the moment the
        // cancel token trips; the main thread keeps draining stdout.
        let child = Arc::new(Mutex::new(child));
        let done = Arc::new(AtomicBool::new(false));
        let watcher = {
            let child = Arc::clone(&child);
            let done = Arc::clone(&done);
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    if cancel.cancelled() {
                        let _ = child.lock().unwrap().kill();
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            })
        };

        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            match parse_progress_line(&line) {
                Some(fraction) => progress(fraction),
                None => debug!(self.log, "sparse_dd: {}", line),
            }
        }

        let status = child.lock().unwrap().wait();
        done.store(true, Ordering::SeqCst);
        let _ = watcher.join();

        if cancel.cancelled() {
            return Err(SxmError::Cancelled("sparse_dd".to_string()));
        }

        let status = status.map_err(|e| {
            SxmError::InternalError(format!("wait sparse_dd: {:?}", e))
        })?;
        if !status.success() {
            let mut err = String::new();
            let _ = stderr.read_to_string(&mut err);
            return Err(SxmError::InternalError(format!(
                "sparse_dd exited {}: {}",
                status,
                err.trim()
            )));
        }
        Ok(())
    }
}

/// Scripted copier for tests.
#[cfg(test)]
pub struct TestCopier {
    pub mode: TestCopierMode,
    pub invocations: Mutex<Vec<(PathBuf, String, Option<PathBuf>, u64)>>,
}

#[cfg(test)]
pub enum TestCopierMode {
    Succeed,
    Fail(SxmError),
    BlockUntilCancelled,
}

#[cfg(test)]
impl TestCopier {
    pub fn new(mode: TestCopierMode) -> TestCopier {
        TestCopier {
            mode,
            invocations: Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
impl CopyProgram for TestCopier {
    fn run(
        &self,
        args: &CopyArgs,
        progress: &mut dyn FnMut(f64),
        cancel: &CancelToken,
    ) -> Result<(), SxmError> {
        self.invocations.lock().unwrap().push((
            args.src.to_path_buf(),
            args.dest_url.to_string(),
            args.base.map(|b| b.to_path_buf()),
            args.size,
        ));
        match &self.mode {
            TestCopierMode::Succeed => {
                progress(0.5);
                progress(1.0);
                Ok(())
            }
            TestCopierMode::Fail(e) => Err(e.clone()),
            TestCopierMode::BlockUntilCancelled => {
                while !cancel.cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(SxmError::Cancelled("sparse_dd".to_string()))
            }
        }
    }
}
