//! Relay fleet supervisor.
//!
//! Owns the channel → worker map. Every mutation (spawn, stop, health-driven
//! restart) happens through a [`FleetGuard`], which holds the one fleet lock
//! for as long as it lives. The registry stays the durable record; the map is
//! rebuilt from it by [`Supervisor::start_all`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use speeddata_core::config::{BaselineChannel, SupervisorConfig};
use speeddata_core::{ChannelOverrides, RelayDefaults, WorkerSettings};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use super::process::{Launcher, Process, WorkerCommand};
use crate::storage::{Channel, ChannelStatus, Database, DatabaseError};

/// Restart and timing policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorPolicy {
    pub max_restarts: u32,
    pub restart_backoff: Duration,
    pub check_interval: Duration,
    /// Delay between consecutive spawns at startup.
    pub stagger: Duration,
    /// Pause between stopping a crashed worker and starting its replacement.
    pub settle: Duration,
    pub terminate_timeout: Duration,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for SupervisorPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            restart_backoff: Duration::from_secs(config.restart_backoff_secs),
            check_interval: Duration::from_secs(config.check_interval_secs),
            stagger: Duration::from_millis(config.stagger_ms),
            settle: Duration::from_millis(config.settle_ms),
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
        }
    }
}

/// What the supervisor needs to know to (re)start a channel's worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSpec {
    pub name: String,
    pub port: u16,
    pub schema_path: String,
    pub config: Value,
}

impl From<&Channel> for ChannelSpec {
    fn from(ch: &Channel) -> Self {
        Self {
            name: ch.name.clone(),
            port: ch.port,
            schema_path: ch.schema_path.clone(),
            config: ch.config.clone(),
        }
    }
}

/// Lifecycle state of a tracked channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Running,
    /// Exited; waiting for the restart backoff to elapse.
    Crashed,
    /// Restart ceiling reached. Stays down until stopped or re-registered.
    Exhausted,
}

/// Per-channel snapshot reported by [`Supervisor::statuses`].
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub port: u16,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub uptime_secs: u64,
}

pub(super) struct ProcessHandle {
    pub(super) spec: ChannelSpec,
    pub(super) process: Option<Box<dyn Process>>,
    pub(super) restart_count: u32,
    pub(super) last_start: Instant,
    pub(super) state: ProcessState,
}

/// Supervisor errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Channel {0} already has a tracked worker")]
    AlreadyRunning(String),

    #[error("Channel {0} has no tracked worker")]
    NotTracked(String),

    #[error("Failed to spawn worker for {name}: {reason}")]
    SpawnFailed { name: String, reason: String },

    #[error("Failed to stop worker for {name}: {reason}")]
    TerminateFailed { name: String, reason: String },

    #[error("Registry error: {0}")]
    Registry(#[from] DatabaseError),
}

/// Supervises one relay worker per registered channel.
pub struct Supervisor {
    db: Database,
    launcher: Arc<dyn Launcher>,
    worker_bin: PathBuf,
    defaults: RelayDefaults,
    policy: SupervisorPolicy,
    fleet: Mutex<HashMap<String, ProcessHandle>>,
}

impl Supervisor {
    pub fn new(
        db: Database,
        launcher: Arc<dyn Launcher>,
        worker_bin: PathBuf,
        defaults: RelayDefaults,
        policy: SupervisorPolicy,
    ) -> Self {
        Self {
            db,
            launcher,
            worker_bin,
            defaults,
            policy,
            fleet: Mutex::new(HashMap::new()),
        }
    }

    pub const fn policy(&self) -> &SupervisorPolicy {
        &self.policy
    }

    pub const fn db(&self) -> &Database {
        &self.db
    }

    /// Fleet-wide relay defaults channel overrides are layered over.
    pub const fn defaults(&self) -> &RelayDefaults {
        &self.defaults
    }

    /// Take the fleet lock.
    pub async fn lock(&self) -> FleetGuard<'_> {
        FleetGuard {
            supervisor: self,
            fleet: self.fleet.lock().await,
        }
    }

    /// Spawn a worker for `spec`. See [`FleetGuard::spawn`].
    pub async fn spawn(&self, spec: &ChannelSpec) -> Result<u32, SupervisorError> {
        self.lock().await.spawn(spec).await
    }

    /// Stop the worker for `name`. See [`FleetGuard::stop`].
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        self.lock().await.stop(name).await
    }

    /// Merge the baseline into the registry, then start a worker for every
    /// registered channel.
    ///
    /// A channel that fails to start is logged and skipped. Returns how many
    /// workers are running afterwards.
    pub async fn start_all(&self, baseline: &[BaselineChannel]) -> Result<usize, SupervisorError> {
        let inserted = self.db.load_baseline(baseline).await?;
        info!(
            baseline = baseline.len(),
            inserted, "Baseline merged into registry"
        );

        let channels = self.db.list_channels(None).await?;
        let mut started = 0;

        let mut fleet = self.lock().await;
        for (i, ch) in channels.iter().enumerate() {
            if i > 0 && !self.policy.stagger.is_zero() {
                tokio::time::sleep(self.policy.stagger).await;
            }

            let spec = ChannelSpec::from(ch);
            match fleet.spawn(&spec).await {
                Ok(pid) => match self
                    .db
                    .update_process_info(&ch.name, pid, ChannelStatus::Active)
                    .await
                {
                    Ok(()) => started += 1,
                    Err(e) => {
                        error!(channel = %ch.name, pid, error = %e, "Failed to record worker, stopping it");
                        if let Err(e) = fleet.stop(&ch.name).await {
                            warn!(channel = %ch.name, error = %e, "Failed to stop unrecorded worker");
                        }
                    }
                },
                Err(e) => {
                    error!(channel = %ch.name, port = ch.port, error = %e, "Failed to start worker");
                    if let Err(e) = self.db.clear_process_info(&ch.name).await {
                        warn!(channel = %ch.name, error = %e, "Failed to reset registry row");
                    }
                }
            }
        }

        info!(started, total = channels.len(), "Fleet started");
        Ok(started)
    }

    /// Stop every tracked worker. Errors are logged, not returned.
    pub async fn stop_all(&self) {
        let mut fleet = self.lock().await;
        let names: Vec<String> = fleet.fleet.keys().cloned().collect();
        for name in names {
            if let Err(e) = fleet.stop(&name).await {
                warn!(channel = %name, error = %e, "Failed to stop worker during shutdown");
            }
        }
        info!("All workers stopped");
    }

    /// Snapshot of every tracked channel, sorted by name.
    pub async fn statuses(&self) -> Vec<ProcessStatus> {
        let fleet = self.fleet.lock().await;
        let mut out: Vec<ProcessStatus> = fleet
            .values()
            .map(|h| ProcessStatus {
                name: h.spec.name.clone(),
                port: h.spec.port,
                state: h.state,
                pid: h.process.as_ref().and_then(|p| p.pid()),
                restart_count: h.restart_count,
                uptime_secs: h.last_start.elapsed().as_secs(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Resolve the worker settings for `spec` and start the process.
    pub(super) async fn launch(
        &self,
        spec: &ChannelSpec,
    ) -> Result<Box<dyn Process>, SupervisorError> {
        let overrides =
            ChannelOverrides::from_value(&spec.config).map_err(|e| SupervisorError::SpawnFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;
        let settings = WorkerSettings::resolve(&spec.name, spec.port, &self.defaults, &overrides);
        settings
            .validate()
            .map_err(|e| SupervisorError::SpawnFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })?;

        let command = WorkerCommand {
            program: self.worker_bin.clone(),
            channel: spec.name.clone(),
            env: settings
                .env_vars()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        };

        self.launcher
            .start(&command)
            .await
            .map_err(|e| SupervisorError::SpawnFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            })
    }
}

/// Exclusive access to the fleet map.
///
/// Held by the API across its registry-then-spawn and stop-then-delete
/// sequences, and by the health loop while it inspects one channel.
pub struct FleetGuard<'a> {
    pub(super) supervisor: &'a Supervisor,
    pub(super) fleet: MutexGuard<'a, HashMap<String, ProcessHandle>>,
}

impl FleetGuard<'_> {
    /// Whether `name` has a tracked entry, running or not.
    pub fn is_tracked(&self, name: &str) -> bool {
        self.fleet.contains_key(name)
    }

    /// Start a worker and start tracking it. Returns the OS pid.
    ///
    /// Does not touch the registry; callers record the pid themselves.
    pub async fn spawn(&mut self, spec: &ChannelSpec) -> Result<u32, SupervisorError> {
        if self.fleet.contains_key(&spec.name) {
            return Err(SupervisorError::AlreadyRunning(spec.name.clone()));
        }

        let mut process = self.supervisor.launch(spec).await?;
        let Some(pid) = process.pid() else {
            let exit = process.kill().await.ok();
            return Err(SupervisorError::SpawnFailed {
                name: spec.name.clone(),
                reason: format!("worker exited immediately ({exit:?})"),
            });
        };

        info!(channel = %spec.name, port = spec.port, pid, "Worker spawned");
        self.fleet.insert(
            spec.name.clone(),
            ProcessHandle {
                spec: spec.clone(),
                process: Some(process),
                restart_count: 0,
                last_start: Instant::now(),
                state: ProcessState::Running,
            },
        );
        Ok(pid)
    }

    /// Clear the registry process info for `name`, then terminate its
    /// worker and stop tracking it.
    ///
    /// A registry error leaves both the worker and its row untouched. On a
    /// termination error the entry stays tracked and the row is marked
    /// active again.
    pub async fn stop(&mut self, name: &str) -> Result<(), SupervisorError> {
        let supervisor = self.supervisor;
        let timeout = supervisor.policy.terminate_timeout;
        let db = &supervisor.db;
        let handle = self
            .fleet
            .get_mut(name)
            .ok_or_else(|| SupervisorError::NotTracked(name.to_string()))?;

        db.clear_process_info(name).await?;

        if let Some(process) = handle.process.as_mut() {
            match process.terminate(timeout).await {
                Ok(exit) => info!(channel = name, %exit, "Worker stopped"),
                Err(e) => {
                    if let Some(pid) = process.pid() {
                        if let Err(db_err) =
                            db.update_process_info(name, pid, ChannelStatus::Active).await
                        {
                            warn!(channel = name, error = %db_err, "Failed to restore process info");
                        }
                    }
                    return Err(SupervisorError::TerminateFailed {
                        name: name.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.fleet.remove(name);
        Ok(())
    }
}
