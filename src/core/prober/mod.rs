//! Server Prober: liveness checks over SSH with bounded retries.
//!
//! `Reachable -> Probing -> {Reachable, Unreachable}`. Unreachable servers
//! stay out of rotation until reactivated.

pub mod retry;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::locks::{EntityLocks, server_key};
use crate::core::ssh::{SshConnector, SshError, SshTarget};
use crate::core::store::{ConfigStore, ServerState, StoreError, active};
use retry::{Delay, RetryPolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Reachable { attempts: u32 },
    Unreachable { attempts: u32, reason: String },
    /// The server record was deleted before or during the probe.
    Removed,
    /// Shutdown interrupted a retry wait; the server stays `Probing` with
    /// `last_check` stamped.
    Cancelled,
}

#[derive(Debug, Default)]
pub struct ProbeReport {
    pub outcomes: Vec<(String, ProbeOutcome)>,
    pub skipped: Vec<String>,
    pub errors: Vec<(String, String)>,
}

pub struct ServerProber {
    store: Arc<ConfigStore>,
    ssh: Arc<dyn SshConnector>,
    delay: Arc<dyn Delay>,
    locks: EntityLocks,
    policy: RetryPolicy,
    connect_timeout: Duration,
    liveness_command: String,
}

impl ServerProber {
    pub fn new(
        store: Arc<ConfigStore>,
        ssh: Arc<dyn SshConnector>,
        delay: Arc<dyn Delay>,
        locks: EntityLocks,
        policy: RetryPolicy,
        connect_timeout: Duration,
        liveness_command: impl Into<String>,
    ) -> Self {
        Self {
            store,
            ssh,
            delay,
            locks,
            policy,
            connect_timeout,
            liveness_command: liveness_command.into(),
        }
    }

    /// Probe every server not marked `Unreachable`, one at a time.
    pub async fn run_cycle(&self) -> Result<ProbeReport, StoreError> {
        let cfg = self.store.snapshot()?;
        let hosts: Vec<String> = active(&cfg.servers).map(|s| s.host.clone()).collect();
        info!(target: "connectivity", "server check started for {} server(s)", hosts.len());

        let mut report = ProbeReport::default();
        for host in hosts {
            let Some(_guard) = self.locks.try_lock(server_key(&host))? else {
                info!(target: "connectivity", "{}: probe already in progress, skipping", host);
                report.skipped.push(host);
                continue;
            };
            match self.probe_locked(&host).await {
                Ok(outcome) => report.outcomes.push((host, outcome)),
                Err(e) => {
                    warn!(target: "connectivity", "{}: probe bookkeeping failed: {}", host, e);
                    report.errors.push((host, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Probe one server now, waiting for any probe already running on it.
    pub async fn probe_server(&self, host: &str) -> Result<ProbeOutcome, StoreError> {
        let _guard = self.locks.lock(server_key(host)).await?;
        self.probe_locked(host).await
    }

    async fn probe_locked(&self, host: &str) -> Result<ProbeOutcome, StoreError> {
        let cfg = self.store.snapshot()?;
        let Some(target) = cfg.server(host).map(SshTarget::from) else {
            return Ok(ProbeOutcome::Removed);
        };
        if !self.store.set_server_state(host, ServerState::Probing, None).await? {
            return Ok(ProbeOutcome::Removed);
        }

        let attempts = self.policy.attempts();
        let mut reason = String::new();
        let mut outcome = None;
        for attempt in 1..=attempts {
            match self.check(&target).await {
                Ok(()) => {
                    info!(target: "connectivity", "{}: reachable (attempt {}/{})", host, attempt, attempts);
                    outcome = Some(ProbeOutcome::Reachable { attempts: attempt });
                    break;
                }
                Err(e) => {
                    warn!(target: "connectivity", "{}: attempt {}/{} failed: {}", host, attempt, attempts, e);
                    reason = e;
                }
            }
            if attempt < attempts {
                let wait = self.policy.delay_after(attempt);
                if self.delay.wait(wait).await.is_err() {
                    info!(target: "connectivity", "{}: probe cancelled during retry wait", host);
                    self.store
                        .set_server_state(host, ServerState::Probing, Some(Utc::now()))
                        .await?;
                    return Ok(ProbeOutcome::Cancelled);
                }
            }
        }

        let outcome = outcome.unwrap_or(ProbeOutcome::Unreachable { attempts, reason });
        let state = match outcome {
            ProbeOutcome::Reachable { .. } => ServerState::Reachable,
            _ => ServerState::Unreachable,
        };
        if !self.store.set_server_state(host, state, Some(Utc::now())).await? {
            info!(target: "connectivity", "{}: removed while being probed", host);
            return Ok(ProbeOutcome::Removed);
        }
        if state == ServerState::Unreachable {
            warn!(
                target: "connectivity",
                "{}: marked unreachable after {} attempt(s); reactivate to resume probing",
                host, attempts
            );
        }
        Ok(outcome)
    }

    async fn check(&self, target: &SshTarget) -> Result<(), String> {
        let mut session = self
            .ssh
            .open(target, self.connect_timeout)
            .await
            .map_err(|e| e.to_string())?;
        let result = session
            .exec(&self.liveness_command, Some(self.connect_timeout))
            .await;
        session.close().await;
        match result {
            Ok(out) if out.success() => Ok(()),
            Ok(out) => Err(format!(
                "liveness command exited with {}: {}",
                out.exit_code,
                out.diagnostics()
            )),
            Err(SshError::ExecTimeout(d)) => Err(format!("liveness command hung for {:?}", d)),
            Err(e) => Err(e.to_string()),
        }
    }
}
