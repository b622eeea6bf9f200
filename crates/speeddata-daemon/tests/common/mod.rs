//! Shared fixtures: an in-memory registry and a fake worker launcher.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::io;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use speeddata_core::channel::{
    DecimationSettings, MulticastSettings, RelayDefaults, RotationSettings,
};
use speeddata_daemon::storage::Database;
use speeddata_daemon::supervisor::{
    Launcher, Process, ProcessExit, Supervisor, SupervisorPolicy, WorkerCommand,
};

/// Test-side handle on one fake worker.
#[derive(Default)]
pub struct FakeControl {
    exit: Mutex<Option<ProcessExit>>,
    terminated: AtomicBool,
    fail_terminate: AtomicBool,
}

impl FakeControl {
    /// Make the worker look like it exited with `code`.
    pub fn crash(&self, code: i32) {
        *self.exit.lock().unwrap() = Some(ProcessExit {
            code: Some(code),
            signal: None,
        });
    }

    pub fn fail_terminate(&self) {
        self.fail_terminate.store(true, Ordering::SeqCst);
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

struct FakeProcess {
    pid: u32,
    control: Arc<FakeControl>,
}

#[async_trait]
impl Process for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn poll(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.control.exit.lock().unwrap())
    }

    async fn terminate(&mut self, _timeout: Duration) -> io::Result<ProcessExit> {
        if self.control.fail_terminate.load(Ordering::SeqCst) {
            return Err(io::Error::other("permission denied"));
        }
        self.kill().await
    }

    async fn kill(&mut self) -> io::Result<ProcessExit> {
        self.control.terminated.store(true, Ordering::SeqCst);
        let exit = ProcessExit {
            code: None,
            signal: Some(15),
        };
        *self.control.exit.lock().unwrap() = Some(exit);
        Ok(exit)
    }

    fn output_tail(&self) -> Vec<String> {
        vec!["fake worker: bind failed".to_string()]
    }
}

/// Launcher that records every command and hands out [`FakeProcess`]es.
pub struct FakeLauncher {
    next_pid: AtomicU32,
    fail: AtomicBool,
    started: Mutex<Vec<(WorkerCommand, Arc<FakeControl>)>>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            fail: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
        }
    }
}

impl FakeLauncher {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// Control handle of the most recent worker started for `channel`.
    pub fn latest(&self, channel: &str) -> Arc<FakeControl> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(cmd, _)| cmd.channel == channel)
            .map(|(_, control)| Arc::clone(control))
            .expect("no worker started for channel")
    }

    pub fn commands(&self) -> Vec<WorkerCommand> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn start(&self, command: &WorkerCommand) -> io::Result<Box<dyn Process>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "worker binary not found",
            ));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let control = Arc::new(FakeControl::default());
        self.started
            .lock()
            .unwrap()
            .push((command.clone(), Arc::clone(&control)));
        Ok(Box::new(FakeProcess { pid, control }))
    }
}

/// Policy with no waiting and a low restart ceiling.
pub fn fast_policy() -> SupervisorPolicy {
    SupervisorPolicy {
        max_restarts: 2,
        restart_backoff: Duration::ZERO,
        check_interval: Duration::from_millis(10),
        stagger: Duration::ZERO,
        settle: Duration::ZERO,
        terminate_timeout: Duration::from_millis(100),
    }
}

pub fn relay_defaults() -> RelayDefaults {
    RelayDefaults {
        bind_addr: Ipv4Addr::LOCALHOST,
        output_dir: PathBuf::from("/tmp/speeddata-test"),
        decimation: DecimationSettings::default(),
        rotation: RotationSettings::default(),
        multicast: MulticastSettings::default(),
    }
}

pub struct Fleet {
    pub db: Database,
    pub launcher: Arc<FakeLauncher>,
    pub supervisor: Arc<Supervisor>,
}

pub async fn fleet(policy: SupervisorPolicy) -> Fleet {
    let db = Database::open_in_memory().await.unwrap();
    let launcher = Arc::new(FakeLauncher::default());
    let supervisor = Arc::new(Supervisor::new(
        db.clone(),
        Arc::clone(&launcher) as Arc<dyn Launcher>,
        PathBuf::from("speeddata-relay"),
        relay_defaults(),
        policy,
    ));
    Fleet {
        db,
        launcher,
        supervisor,
    }
}

/// Write `schema` as JSON into `dir` and return its path as a string.
pub fn write_schema(dir: &Path, file: &str, schema: &serde_json::Value) -> String {
    let path = dir.join(file);
    std::fs::write(&path, serde_json::to_vec_pretty(schema).unwrap()).unwrap();
    path.display().to_string()
}

/// Make every registry update that moves `name` to `status` fail.
pub async fn fail_status_writes(db: &Database, name: &str, status: &str) {
    let sql = format!(
        "CREATE TRIGGER fail_{name}_{status} BEFORE UPDATE OF status ON channels \
         WHEN OLD.name = '{name}' AND NEW.status = '{status}' \
         BEGIN SELECT RAISE(ABORT, 'registry write failed'); END"
    );
    sqlx::query(&sql).execute(db.pool()).await.unwrap();
}

/// Undo [`fail_status_writes`].
pub async fn allow_status_writes(db: &Database, name: &str, status: &str) {
    let sql = format!("DROP TRIGGER fail_{name}_{status}");
    sqlx::query(&sql).execute(db.pool()).await.unwrap();
}
