// Copyright 2025 Oxide Computer Company
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;

/// Failures surfaced by the migration coordinator.
///
/// Structured storage-backend failures keep their code and parameters
/// verbatim across host boundaries; everything unrecognised is flattened
/// into `InternalError` with a stringified description.
#[derive(thiserror::Error, Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum SxmError {
    #[error("{0} {1} not found")]
    NotFound(String, String),

    #[error("not enough space: needed {needed}, available {available}")]
    CapacityExceeded { needed: u64, available: u64 },

    #[error("datapath {0} has no tap-disk attached")]
    Unattached(String),

    #[error("backend error {code}: {params:?}")]
    BackendError { code: String, params: Vec<String> },

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("task {0} cancelled")]
    Cancelled(String),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("{0} {1} does not exist")]
    DoesNotExist(String, String),

    #[error("resource closed")]
    ResourceClosed,

    #[error("unimplemented: {0}")]
    Unimplemented(String),
}

impl From<std::io::Error> for SxmError {
    fn from(e: std::io::Error) -> Self {
        SxmError::InternalError(format!("{:?}", e))
    }
}

impl From<anyhow::Error> for SxmError {
    fn from(e: anyhow::Error) -> Self {
        SxmError::InternalError(format!("{:?}", e))
    }
}

impl From<serde_json::Error> for SxmError {
    fn from(e: serde_json::Error) -> Self {
        SxmError::InternalError(format!("{:?}", e))
    }
}

#[macro_export]
macro_rules! sxm_bail {
    ($i:ident) => { return Err($crate::SxmError::$i) };
    ($i:ident, $str:expr) => { return Err($crate::SxmError::$i($str.to_string())) };
    ($i:ident, $fmt:expr, $($arg:tt)*) => { return Err($crate::SxmError::$i(format!($fmt, $($arg)*))) };
}

/// Decode one persisted table.  `None` means the file has never been
/// written; an unreadable or undecodable file is an error the caller
/// decides how to treat.
pub fn read_json_maybe<P, T>(path: P) -> Result<Option<T>, SxmError>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let path = path.as_ref();
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => sxm_bail!(InternalError, "read {:?}: {}", path, e),
    };
    match serde_json::from_slice(&bytes) {
        Ok(decoded) => Ok(Some(decoded)),
        Err(e) => sxm_bail!(InternalError, "decode {:?}: {}", path, e),
    }
}

pub fn read_json<P, T>(path: P) -> Result<T, SxmError>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let path = path.as_ref();
    match read_json_maybe(path)? {
        Some(decoded) => Ok(decoded),
        None => {
            Err(SxmError::NotFound("file".to_string(), format!("{:?}", path)))
        }
    }
}

/// Serialise a table to `path` through a temporary file in the same
/// directory, renamed into place so readers only ever observe a complete
/// document.
pub fn write_json<P, T>(path: P, data: &T, clobber: bool) -> Result<(), SxmError>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let path = path.as_ref();
    let dir = path.parent().ok_or_else(|| {
        SxmError::InternalError(format!("no directory to hold {:?}", path))
    })?;

    let mut tmp = match NamedTempFile::new_in(dir) {
        Ok(tmp) => tmp,
        Err(e) => sxm_bail!(InternalError, "tempfile in {:?}: {}", dir, e),
    };
    serde_json::to_writer_pretty(&mut tmp, data)?;
    tmp.write_all(b"\n")?;
    tmp.flush()?;

    let renamed = if clobber {
        tmp.persist(path)
    } else {
        tmp.persist_noclobber(path)
    };
    if let Err(e) = renamed {
        sxm_bail!(InternalError, "persist {:?}: {}", path, e.error);
    }
    Ok(())
}

/// Create the persistence directory with owner-only access.  Records hold
/// data-path names and remote URLs, so the directory must not be world
/// readable.
pub fn mkdir_private(dir: &Path) -> Result<(), SxmError> {
    use std::os::unix::fs::DirBuilderExt;

    match std::fs::DirBuilder::new().mode(0o700).recursive(true).create(dir)
    {
        Ok(()) => Ok(()),
        Err(e) => sxm_bail!(InternalError, "create {:?}: {}", dir, e),
    }
}

/// Stderr logger shared by the embedding binaries and the test suites.
pub fn build_logger() -> Logger {
    let term = slog_term::TermDecorator::new().stderr().build();
    let format = slog_term::FullFormat::new(term)
        .use_original_order()
        .build()
        .fuse();
    let drain = slog_async::Async::new(format).chan_size(4096).build().fuse();
    Logger::root(drain, o!("sxm" => env!("CARGO_PKG_VERSION")))
}
