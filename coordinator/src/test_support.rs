// Copyright 2025 Oxide Computer Company

//! Shared wiring for the engine tests: a coordinator context whose seams
//! are all in-memory doubles.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::o;
use url::Url;

use sxm_common::SxmError;

use crate::remote::{NbdConnector, RemoteFactory};
use crate::scheduler::TestScheduler;
use crate::sparse_dd::{TestCopier, TestCopierMode};
use crate::state::Registry;
use crate::storage::{StorageApi, TestStorage};
use crate::tapctl::TestTapdisk;
use crate::tasks::TaskService;
use crate::updates::UpdateBus;
use crate::{Config, Context};

/// Hands out the same fake remote storage for every connection, recording
/// the url and `verify_dest` of each.
pub struct TestRemoteFactory {
    target: Arc<TestStorage>,
    pub connects: Mutex<Vec<(String, bool)>>,
}

impl RemoteFactory for TestRemoteFactory {
    fn connect(
        &self,
        url: &str,
        verify_dest: bool,
    ) -> Result<Arc<dyn StorageApi>, SxmError> {
        self.connects
            .lock()
            .unwrap()
            .push((url.to_string(), verify_dest));
        let api: Arc<dyn StorageApi> = Arc::clone(&self.target) as Arc<dyn StorageApi>;
        Ok(api)
    }
}

/// Skips the HTTP handshake and hands back one end of a socketpair.
pub struct TestNbdConnector {
    pub urls: Mutex<Vec<String>>,
}

impl NbdConnector for TestNbdConnector {
    fn handshake(&self, url: &Url) -> Result<OwnedFd, SxmError> {
        self.urls.lock().unwrap().push(url.to_string());
        let (ours, _theirs) = UnixStream::pair()?;
        Ok(ours.into())
    }
}

pub struct TestContext {
    pub ctx: Arc<Context>,
    pub local: Arc<TestStorage>,
    pub remote: Arc<TestStorage>,
    pub copier: Arc<TestCopier>,
    pub tapdisk: Arc<TestTapdisk>,
    pub scheduler: Arc<TestScheduler>,
    pub nbd: Arc<TestNbdConnector>,
    pub factory: Arc<TestRemoteFactory>,
    _persist: tempfile::TempDir,
}

impl TestContext {
    pub fn nbd_urls(&self) -> usize {
        self.nbd.urls.lock().unwrap().len()
    }
}

pub fn test_context(mode: TestCopierMode) -> TestContext {
    let log = sxm_common::build_logger();
    let persist = tempfile::tempdir().unwrap();

    let local = Arc::new(TestStorage::new(&["s1", "s2"]));
    let remote = Arc::new(TestStorage::new(&["s2"]));
    let copier = Arc::new(TestCopier::new(mode));
    let tapdisk = Arc::new(TestTapdisk::new());
    let scheduler = Arc::new(TestScheduler::new());
    let nbd = Arc::new(TestNbdConnector {
        urls: Mutex::new(Vec::new()),
    });
    let factory = Arc::new(TestRemoteFactory {
        target: Arc::clone(&remote),
        connects: Mutex::new(Vec::new()),
    });

    let config = Config {
        persist_root: persist.path().to_path_buf(),
        blktap_control_dir: "/var/run/blktap-control".into(),
        drain_interval: Duration::from_millis(1),
        drain_timeout: Duration::from_millis(100),
        watchdog_interval: Duration::from_secs(5),
    };

    let ctx = Arc::new(Context {
        state: Arc::new(Registry::new(
            log.new(o!("component" => "state")),
            config.persist_root.clone(),
        )),
        local: Arc::clone(&local) as Arc<dyn StorageApi>,
        remote: Arc::clone(&factory) as Arc<dyn RemoteFactory>,
        tapdisk: Arc::clone(&tapdisk) as _,
        copier: Arc::clone(&copier) as _,
        nbd: Arc::clone(&nbd) as _,
        scheduler: Arc::clone(&scheduler) as _,
        tasks: Arc::new(TaskService::new(log.new(o!("component" => "tasks")))),
        updates: Arc::new(UpdateBus::new()),
        config,
        log,
    });

    TestContext {
        ctx,
        local,
        remote,
        copier,
        tapdisk,
        scheduler,
        nbd,
        factory,
        _persist: persist,
    }
}
