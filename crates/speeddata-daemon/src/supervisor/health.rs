//! Health loop: detect exited workers and restart them per policy.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::manager::{FleetGuard, ProcessState, Supervisor};
use super::process::Process;
use crate::storage::ChannelStatus;

/// A restart decided under the fleet lock and carried out after it is
/// released.
struct PendingRestart {
    name: String,
    attempt: u32,
    previous: Option<Box<dyn Process>>,
}

impl Supervisor {
    /// Run one health pass over every tracked channel.
    ///
    /// Never fails: exits, restarts and registry errors are logged and only
    /// show up as state changes. The fleet lock is taken per channel and is
    /// not held across the settle delay or a terminate wait.
    pub async fn check_health(&self) {
        let mut names: Vec<String> = self.lock().await.fleet.keys().cloned().collect();
        names.sort();

        for name in names {
            let pending = self.lock().await.check_one(&name).await;
            if let Some(pending) = pending {
                self.restart(pending).await;
            }
        }
    }

    /// Stop what is left of the old worker, settle, then spawn again.
    async fn restart(&self, pending: PendingRestart) {
        let PendingRestart {
            name,
            attempt,
            previous,
        } = pending;
        let policy = self.policy().clone();

        if let Some(mut process) = previous {
            if let Err(e) = process.terminate(policy.terminate_timeout).await {
                warn!(channel = %name, error = %e, "Failed to stop worker before restart");
            }
        }
        info!(
            channel = %name,
            attempt,
            max = policy.max_restarts,
            "Restarting worker"
        );

        if !policy.settle.is_zero() {
            tokio::time::sleep(policy.settle).await;
        }

        let mut fleet = self.lock().await;
        let spec = match fleet.fleet.get(&name) {
            Some(h) if h.restart_count == attempt && h.process.is_none() => h.spec.clone(),
            _ => {
                debug!(channel = %name, "Channel changed while settling, skipping restart");
                return;
            }
        };

        let launched = self.launch(&spec).await;
        let Some(handle) = fleet.fleet.get_mut(&name) else {
            return;
        };
        handle.last_start = Instant::now();
        match launched {
            Ok(process) => {
                let pid = process.pid();
                handle.process = Some(process);
                handle.state = ProcessState::Running;
                if let Some(pid) = pid {
                    if let Err(e) = self
                        .db()
                        .update_process_info(&name, pid, ChannelStatus::Active)
                        .await
                    {
                        warn!(channel = %name, error = %e, "Failed to record restarted worker");
                    }
                }
                info!(channel = %name, pid = ?pid, "Worker restarted");
            }
            Err(e) => {
                error!(channel = %name, error = %e, "Restart failed");
                handle.state = ProcessState::Crashed;
            }
        }
    }
}

impl FleetGuard<'_> {
    /// Poll one channel and apply the restart policy. Returns the restart to
    /// perform, with the restart counter already bumped.
    async fn check_one(&mut self, name: &str) -> Option<PendingRestart> {
        let db = self.supervisor.db().clone();
        let handle = self.fleet.get_mut(name)?;

        match handle.state {
            ProcessState::Exhausted => return None,
            ProcessState::Crashed => {}
            ProcessState::Running => {
                let Some(process) = handle.process.as_mut() else {
                    handle.state = ProcessState::Crashed;
                    return None;
                };
                match process.poll() {
                    Ok(None) => {
                        if let Err(e) = db.touch_heartbeat(name).await {
                            warn!(channel = name, error = %e, "Failed to record heartbeat");
                        }
                        return None;
                    }
                    Ok(Some(exit)) => {
                        let tail = process.output_tail();
                        warn!(
                            channel = name,
                            %exit,
                            restarts = handle.restart_count,
                            "Worker exited"
                        );
                        for line in &tail {
                            warn!(channel = name, "  | {}", line);
                        }
                        handle.process = None;
                        handle.state = ProcessState::Crashed;
                        if let Err(e) = db.clear_process_info(name).await {
                            warn!(channel = name, error = %e, "Failed to clear process info");
                        }
                    }
                    Err(e) => {
                        warn!(channel = name, error = %e, "Failed to poll worker");
                        return None;
                    }
                }
            }
        }

        let policy = self.supervisor.policy();
        if handle.restart_count >= policy.max_restarts {
            error!(
                channel = name,
                restarts = handle.restart_count,
                "Restart limit reached, leaving worker stopped"
            );
            handle.state = ProcessState::Exhausted;
            return None;
        }
        if handle.last_start.elapsed() < policy.restart_backoff {
            debug!(channel = name, "Restart backoff not elapsed yet");
            return None;
        }

        handle.restart_count += 1;
        Some(PendingRestart {
            name: name.to_string(),
            attempt: handle.restart_count,
            previous: handle.process.take(),
        })
    }
}

/// Run [`Supervisor::check_health`] every `check_interval` until `shutdown`
/// flips.
pub fn spawn_health_loop(
    supervisor: Arc<Supervisor>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(supervisor.policy().check_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = timer.tick() => supervisor.check_health().await,
                _ = shutdown.changed() => {
                    info!("Health loop shutting down");
                    return;
                }
            }
        }
    })
}
