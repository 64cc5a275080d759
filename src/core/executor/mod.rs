//! Command Executor: materialize the working copy at the branch head on the
//! bound server and run the command from it.

pub mod script;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::github::{CommitLookup, CommitLookupError};
use crate::core::locks::{EntityLocks, command_key, workdir_key};
use crate::core::ssh::{ExecOutput, SshConnector, SshError, SshSession, SshTarget};
use crate::core::store::{ConfigStore, StoreError};
use crate::core::vault::{SecretsVault, VaultError};
use script::{CloneUrls, RemoteLayout, ScriptError};

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },
    #[error("command {0} is inactive")]
    Inactive(String),
    #[error("secret {name} is unavailable: {source}")]
    Secret {
        name: String,
        #[source]
        source: VaultError,
    },
    #[error(transparent)]
    CommitLookup(#[from] CommitLookupError),
    #[error(transparent)]
    Transport(SshError),
    #[error("setup failed with exit code {exit_code}: {output}")]
    SetupFailed { exit_code: i32, output: String },
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SshError> for ExecError {
    fn from(e: SshError) -> Self {
        match e {
            SshError::ExecTimeout(d) => ExecError::Timeout(d),
            other => ExecError::Transport(other),
        }
    }
}

impl ExecError {
    fn not_found(kind: &'static str, key: &str) -> Self {
        ExecError::NotFound {
            kind,
            key: key.to_string(),
        }
    }
}

/// Outcome of a run that got as far as the user command. A non-zero
/// `exit_code` is reported here, not raised.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub command_id: String,
    pub repo: String,
    pub server: String,
    pub commit: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
    pub remote_base_dir: String,
    pub clone_base_url: String,
}

pub struct CommandExecutor {
    store: Arc<ConfigStore>,
    vault: Arc<SecretsVault>,
    lookup: Arc<dyn CommitLookup>,
    ssh: Arc<dyn SshConnector>,
    locks: EntityLocks,
    options: ExecutorOptions,
}

struct Plan {
    target: SshTarget,
    layout: RemoteLayout,
    urls: CloneUrls,
    env: Vec<(String, String)>,
    command: String,
}

impl CommandExecutor {
    pub fn new(
        store: Arc<ConfigStore>,
        vault: Arc<SecretsVault>,
        lookup: Arc<dyn CommitLookup>,
        ssh: Arc<dyn SshConnector>,
        locks: EntityLocks,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            store,
            vault,
            lookup,
            ssh,
            locks,
            options,
        }
    }

    pub async fn run(&self, command_id: &str) -> Result<RunReport, ExecError> {
        let _command = self.locks.lock(command_key(command_id)).await?;

        let cfg = self.store.snapshot()?;
        let cmd = cfg
            .command(command_id)
            .ok_or_else(|| ExecError::not_found("command", command_id))?;
        if !cmd.active {
            return Err(ExecError::Inactive(command_id.to_string()));
        }
        let repo = cfg
            .repository(&cmd.repo)
            .ok_or_else(|| ExecError::not_found("repository", &cmd.repo))?;
        let server = cfg
            .server(&cmd.server)
            .ok_or_else(|| ExecError::not_found("server", &cmd.server))?;

        let _workdir = self.locks.lock(workdir_key(&server.host, &repo.name)).await?;

        let credential = match &repo.credential {
            Some(id) => Some(self.vault.get(id).await.map_err(|source| ExecError::Secret {
                name: format!("credential for {}", repo.name),
                source,
            })?),
            None => None,
        };
        let mut env = Vec::with_capacity(cmd.secrets.len());
        for (key, id) in &cmd.secrets {
            let value = self.vault.get(id).await.map_err(|source| ExecError::Secret {
                name: key.clone(),
                source,
            })?;
            env.push((key.clone(), value));
        }

        // The cached last_commit may be stale; deploy the live head.
        let commit = self
            .lookup
            .latest_commit(&repo.name, &repo.branch, credential.as_deref())
            .await?;

        let plan = Plan {
            target: SshTarget::from(server),
            layout: RemoteLayout::new(&self.options.remote_base_dir, repo),
            urls: CloneUrls::new(&self.options.clone_base_url, &repo.name, credential.as_deref()),
            env,
            command: cmd.command.clone(),
        };
        info!(
            target: "activity",
            "command {}: deploying {}@{} to {}",
            command_id, repo.name, commit, plan.target
        );

        let mut session = self
            .ssh
            .open(&plan.target, self.options.connect_timeout)
            .await
            .inspect_err(|e| warn!(target: "activity", "command {}: {}", command_id, e))?;
        let result = self.deploy(session.as_mut(), command_id, &plan, &commit).await;
        session.close().await;
        let output = result?;

        let finished_at = Utc::now();
        self.store
            .record_command_run(command_id, &repo.name, &commit, finished_at)
            .await?;

        Ok(RunReport {
            command_id: command_id.to_string(),
            repo: repo.name.clone(),
            server: server.host.clone(),
            commit,
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            finished_at,
        })
    }

    async fn deploy(
        &self,
        session: &mut dyn SshSession,
        command_id: &str,
        plan: &Plan,
        commit: &str,
    ) -> Result<ExecOutput, ExecError> {
        let timeout = Some(self.options.exec_timeout);

        let setup = script::setup_script(&plan.layout, &plan.urls, commit)?;
        debug!(target: "activity", "command {}: setup: {}", command_id, setup.redacted);
        let out = session.exec(&setup.script, timeout).await.inspect_err(|e| {
            warn!(target: "activity", "command {}: setup aborted: {}", command_id, e)
        })?;
        if !out.success() {
            let output = out.diagnostics();
            warn!(
                target: "activity",
                "command {}: setup failed with exit code {}: {}",
                command_id, out.exit_code, output
            );
            return Err(ExecError::SetupFailed {
                exit_code: out.exit_code,
                output,
            });
        }

        let user = script::command_script(&plan.layout, &plan.env, &plan.command)?;
        let out = session.exec(&user, timeout).await.inspect_err(|e| {
            warn!(target: "activity", "command {}: aborted: {}", command_id, e)
        })?;
        if out.success() {
            info!(target: "activity", "command {}: finished: {}", command_id, out.stdout.trim());
        } else {
            warn!(
                target: "activity",
                "command {}: exited with {}: {}",
                command_id, out.exit_code, out.diagnostics()
            );
        }
        Ok(out)
    }
}
