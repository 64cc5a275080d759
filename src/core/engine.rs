//! Wires the stores, collaborators and loops for one data directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::enrollment::{Enrollment, EnrollmentError};
use crate::core::executor::{CommandExecutor, ExecError, ExecutorOptions, RunReport};
use crate::core::github::{CommitLookup, GithubClient};
use crate::core::lifecycle::{JobKind, Scheduler, SchedulerError, task};
use crate::core::locks::EntityLocks;
use crate::core::monitor::{CycleReport, RepositoryMonitor};
use crate::core::prober::retry::{Delay, TokioDelay};
use crate::core::prober::{ProbeOutcome, ProbeReport, ServerProber};
use crate::core::settings::Settings;
use crate::core::ssh::{OpenSshConnector, SshConnector};
use crate::core::store::{ConfigStore, ServerState, StoreError};
use crate::core::vault::{KeyMaterial, SecretsVault, VaultError};
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_FILE: &str = "config.json";
pub const KEYS_FILE: &str = "keys.json";
pub const SECRETS_FILE: &str = "secrets.json";
pub const LOCKS_DIR: &str = "locks";

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to prepare data directory {}: {source}", path.display())]
    DataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Create the data directory with owner-only permissions.
pub fn prepare_data_dir(path: &Path) -> Result<(), EngineError> {
    std::fs::create_dir_all(path).map_err(|source| EngineError::DataDir {
        path: path.to_path_buf(),
        source,
    })?;
    NativePlatform::restrict_dir_permissions(path);
    Ok(())
}

pub struct Engine {
    settings: Settings,
    store: Arc<ConfigStore>,
    enrollment: Enrollment,
    monitor: Arc<RepositoryMonitor>,
    prober: Arc<ServerProber>,
    executor: Arc<CommandExecutor>,
    cancel: CancellationToken,
}

impl Engine {
    /// Open with the production collaborators: GitHub over HTTPS and the
    /// system OpenSSH client.
    pub fn open(data_dir: &Path, settings: Settings) -> Result<Self, EngineError> {
        let lookup = Arc::new(GithubClient::new(
            &settings.github.api_base_url,
            settings.request_timeout(),
        )?);
        let cancel = CancellationToken::new();
        let delay = Arc::new(TokioDelay::new(cancel.clone()));
        Self::with_collaborators(
            data_dir,
            settings,
            lookup,
            Arc::new(OpenSshConnector::new()),
            delay,
            cancel,
        )
    }

    pub fn with_collaborators(
        data_dir: &Path,
        settings: Settings,
        lookup: Arc<dyn CommitLookup>,
        ssh: Arc<dyn SshConnector>,
        delay: Arc<dyn Delay>,
        cancel: CancellationToken,
    ) -> Result<Self, EngineError> {
        prepare_data_dir(data_dir)?;
        // Corrupt key material stops here; nothing could be decrypted.
        let keys = KeyMaterial::load_or_create(&data_dir.join(KEYS_FILE))?;
        let vault = Arc::new(SecretsVault::new(data_dir.join(SECRETS_FILE), &keys)?);
        let store = Arc::new(ConfigStore::open(data_dir.join(CONFIG_FILE))?);
        let locks = EntityLocks::new(data_dir.join(LOCKS_DIR));

        let executor = Arc::new(CommandExecutor::new(
            store.clone(),
            vault.clone(),
            lookup.clone(),
            ssh.clone(),
            locks.clone(),
            ExecutorOptions {
                connect_timeout: settings.connect_timeout(),
                exec_timeout: settings.execution_timeout(),
                remote_base_dir: settings.execution.remote_base_dir.clone(),
                clone_base_url: settings.github.clone_base_url.clone(),
            },
        ));
        let monitor = Arc::new(RepositoryMonitor::new(
            store.clone(),
            vault.clone(),
            lookup,
            executor.clone(),
            locks.clone(),
        ));
        let prober = Arc::new(ServerProber::new(
            store.clone(),
            ssh,
            delay,
            locks,
            settings.retry_policy(),
            settings.connect_timeout(),
            settings.probe.liveness_command.clone(),
        ));

        Ok(Self {
            enrollment: Enrollment::new(store.clone(), vault),
            settings,
            store,
            monitor,
            prober,
            executor,
            cancel,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    pub fn enrollment(&self) -> &Enrollment {
        &self.enrollment
    }

    pub async fn check_repositories(&self) -> Result<CycleReport, StoreError> {
        self.monitor.run_cycle().await
    }

    pub async fn check_servers(&self) -> Result<ProbeReport, StoreError> {
        self.prober.run_cycle().await
    }

    pub async fn run_command(&self, id: &str) -> Result<RunReport, ExecError> {
        self.executor.run(id).await
    }

    /// Put an unreachable server back into rotation and probe it at once.
    /// Servers that were not unreachable are left alone.
    pub async fn reactivate_server(&self, host: &str) -> Result<Option<ProbeOutcome>, EnrollmentError> {
        let previous = self.enrollment.reactivate_server(host).await?;
        if previous != ServerState::Unreachable {
            return Ok(None);
        }
        Ok(Some(self.prober.probe_server(host).await?))
    }

    /// Register both background cycles on `scheduler`.
    pub async fn schedule(&self, scheduler: &Scheduler) -> Result<(), SchedulerError> {
        let monitor = self.monitor.clone();
        scheduler
            .register(
                JobKind::RepositoryCheck,
                self.settings.repo_check_interval(),
                task(move || {
                    let monitor = monitor.clone();
                    async move {
                        if let Err(e) = monitor.run_cycle().await {
                            error!(target: "activity", "repository check aborted: {}", e);
                        }
                    }
                }),
            )
            .await?;

        let prober = self.prober.clone();
        scheduler
            .register(
                JobKind::ServerCheck,
                self.settings.server_check_interval(),
                task(move || {
                    let prober = prober.clone();
                    async move {
                        if let Err(e) = prober.run_cycle().await {
                            error!(target: "connectivity", "server check aborted: {}", e);
                        }
                    }
                }),
            )
            .await
    }

    /// Apply new intervals to an already scheduled engine.
    pub async fn apply_schedule(
        &mut self,
        scheduler: &Scheduler,
        settings: Settings,
    ) -> Result<(), SchedulerError> {
        scheduler
            .reschedule(JobKind::RepositoryCheck, settings.repo_check_interval())
            .await?;
        scheduler
            .reschedule(JobKind::ServerCheck, settings.server_check_interval())
            .await?;
        self.settings.schedule = settings.schedule;
        Ok(())
    }

    /// Interrupt pending retry waits.
    pub fn shutdown(&self) {
        info!("engine shutting down");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fakes::{FakeSsh, RecordingDelay, ScriptedLookup, unreachable};
    use crate::core::store::{CommandRecord, RepositoryRecord, ServerRecord};
    use std::time::Duration;

    fn engine(dir: &Path, ssh: FakeSsh) -> Engine {
        Engine::with_collaborators(
            dir,
            Settings::default(),
            Arc::new(ScriptedLookup::default()),
            Arc::new(ssh),
            Arc::new(RecordingDelay::default()),
            CancellationToken::new(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn first_open_creates_owner_only_key_material() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("data");
        let _engine = engine(&root, FakeSsh::new());

        assert!(root.join(KEYS_FILE).is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(root.join(KEYS_FILE)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let mode = std::fs::metadata(&root).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn corrupt_key_material_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(KEYS_FILE), "{not json").unwrap();
        let result = Engine::with_collaborators(
            dir.path(),
            Settings::default(),
            Arc::new(ScriptedLookup::default()),
            Arc::new(FakeSsh::new()),
            Arc::new(RecordingDelay::default()),
            CancellationToken::new(),
        );
        assert!(matches!(
            result,
            Err(EngineError::Vault(VaultError::KeyMaterial { .. }))
        ));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(KEYS_FILE)).unwrap(),
            "{not json"
        );
    }

    #[tokio::test]
    async fn reactivation_probes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = FakeSsh::new();
        let engine = engine(dir.path(), ssh.clone());
        engine
            .store()
            .add_server(ServerRecord::new("web1", "deploy", "~/.ssh/id"))
            .await
            .unwrap();
        engine
            .store()
            .set_server_state("web1", ServerState::Unreachable, None)
            .await
            .unwrap();

        let outcome = engine.reactivate_server("web1").await.unwrap();

        assert_eq!(outcome, Some(ProbeOutcome::Reachable { attempts: 1 }));
        assert_eq!(ssh.log().opened, 1);
        assert_eq!(engine.reactivate_server("web1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reactivated_server_that_still_fails_goes_back_to_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path(), FakeSsh::new().on_open(|_| Err(unreachable("web1"))));
        engine
            .store()
            .add_server(ServerRecord::new("web1", "deploy", "~/.ssh/id"))
            .await
            .unwrap();
        engine
            .store()
            .set_server_state("web1", ServerState::Unreachable, None)
            .await
            .unwrap();

        let outcome = engine.reactivate_server("web1").await.unwrap();

        assert!(matches!(outcome, Some(ProbeOutcome::Unreachable { .. })));
        assert_eq!(
            engine.store().snapshot().unwrap().servers[0].state,
            ServerState::Unreachable
        );
    }

    #[tokio::test]
    async fn engines_sharing_a_data_dir_never_overlap_on_one_command() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = FakeSsh::new().exec_delay(Duration::from_millis(100));
        let open = || {
            let lookup = Arc::new(ScriptedLookup::default());
            lookup.set("octo/app", Ok("bbbbbbb"));
            Engine::with_collaborators(
                dir.path(),
                Settings::default(),
                lookup,
                Arc::new(ssh.clone()),
                Arc::new(RecordingDelay::default()),
                CancellationToken::new(),
            )
            .unwrap()
        };
        let daemon = open();
        let cli = open();

        daemon
            .store()
            .add_repository(RepositoryRecord::new("octo/app", "main"))
            .await
            .unwrap();
        daemon
            .store()
            .add_server(ServerRecord::new("web1", "deploy", "~/.ssh/id"))
            .await
            .unwrap();
        let cmd = CommandRecord::new("octo/app", "web1", "make deploy");
        let id = cmd.id.clone();
        daemon.store().add_command(cmd).await.unwrap();

        let (a, b) = tokio::join!(daemon.run_command(&id), cli.run_command(&id));

        assert!(a.is_ok() && b.is_ok());
        let log = ssh.log();
        assert_eq!(log.commands.len(), 4);
        assert_eq!(log.max_in_flight, 1);
        assert!(dir.path().join(LOCKS_DIR).is_dir());
    }
}
