//! In-process stand-ins for the commit API, SSH and the retry timer.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::github::{CommitLookup, CommitLookupError};
use crate::core::locks::EntityLocks;
use crate::core::prober::retry::{Cancelled, Delay};
use crate::core::ssh::{ExecOutput, SshConnector, SshError, SshSession, SshTarget};
use crate::core::store::ConfigStore;
use crate::core::vault::{KeyMaterial, SecretsVault};

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub store: Arc<ConfigStore>,
    pub vault: Arc<SecretsVault>,
}

impl Fixture {
    /// A lock registry over this fixture's data directory. Registries made
    /// by separate calls behave like separate processes.
    pub fn locks(&self) -> EntityLocks {
        EntityLocks::new(self.dir.path().join("locks"))
    }
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::open(dir.path().join("config.json")).unwrap();
    let vault = SecretsVault::new(dir.path().join("secrets.json"), &KeyMaterial::generate())
        .unwrap()
        .with_iterations(1_000);
    Fixture {
        dir,
        store: Arc::new(store),
        vault: Arc::new(vault),
    }
}

#[derive(Default)]
pub struct ScriptedLookup {
    heads: Mutex<HashMap<String, Result<String, CommitLookupError>>>,
    calls: Mutex<Vec<(String, Option<String>)>>,
}

impl ScriptedLookup {
    pub fn set(&self, repo: &str, head: Result<&str, CommitLookupError>) {
        self.heads
            .lock()
            .unwrap()
            .insert(repo.to_string(), head.map(str::to_string));
    }

    /// `(repo, credential)` per call, in order.
    pub fn calls(&self) -> Vec<(String, Option<String>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommitLookup for ScriptedLookup {
    async fn latest_commit(
        &self,
        repo: &str,
        branch: &str,
        credential: Option<&str>,
    ) -> Result<String, CommitLookupError> {
        self.calls
            .lock()
            .unwrap()
            .push((repo.to_string(), credential.map(str::to_string)));
        self.heads
            .lock()
            .unwrap()
            .get(repo)
            .cloned()
            .unwrap_or_else(|| {
                Err(CommitLookupError::NotFound {
                    repo: repo.to_string(),
                    branch: branch.to_string(),
                })
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SshLog {
    pub opened: u32,
    pub closed: u32,
    pub commands: Vec<String>,
    pub in_flight: u32,
    pub max_in_flight: u32,
}

type OpenFn = dyn Fn(u32) -> Result<(), SshError> + Send + Sync;
type ExecFn = dyn Fn(&str) -> Result<ExecOutput, SshError> + Send + Sync;

/// Scripted SSH. `open` sees the 1-based number of the open attempt; `exec`
/// sees each remote command.
#[derive(Clone)]
pub struct FakeSsh {
    log: Arc<Mutex<SshLog>>,
    open: Arc<OpenFn>,
    exec: Arc<ExecFn>,
    exec_delay: Duration,
}

pub fn ok_output(stdout: &str) -> Result<ExecOutput, SshError> {
    Ok(ExecOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn unreachable(host: &str) -> SshError {
    SshError::Unreachable {
        host: host.to_string(),
        detail: "connection refused".to_string(),
    }
}

impl FakeSsh {
    pub fn new() -> Self {
        Self {
            log: Arc::default(),
            open: Arc::new(|_| Ok(())),
            exec: Arc::new(|_| ok_output("")),
            exec_delay: Duration::ZERO,
        }
    }

    pub fn on_open(mut self, f: impl Fn(u32) -> Result<(), SshError> + Send + Sync + 'static) -> Self {
        self.open = Arc::new(f);
        self
    }

    pub fn on_exec(
        mut self,
        f: impl Fn(&str) -> Result<ExecOutput, SshError> + Send + Sync + 'static,
    ) -> Self {
        self.exec = Arc::new(f);
        self
    }

    pub fn exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    pub fn log(&self) -> SshLog {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SshConnector for FakeSsh {
    async fn open(
        &self,
        _target: &SshTarget,
        _connect_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, SshError> {
        let attempt = {
            let mut log = self.log.lock().unwrap();
            log.opened += 1;
            log.opened
        };
        (self.open)(attempt)?;
        Ok(Box::new(FakeSession {
            log: self.log.clone(),
            exec: self.exec.clone(),
            exec_delay: self.exec_delay,
        }))
    }
}

struct FakeSession {
    log: Arc<Mutex<SshLog>>,
    exec: Arc<ExecFn>,
    exec_delay: Duration,
}

#[async_trait]
impl SshSession for FakeSession {
    async fn exec(
        &mut self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<ExecOutput, SshError> {
        {
            let mut log = self.log.lock().unwrap();
            log.commands.push(command.to_string());
            log.in_flight += 1;
            log.max_in_flight = log.max_in_flight.max(log.in_flight);
        }
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        self.log.lock().unwrap().in_flight -= 1;
        (self.exec)(command)
    }

    async fn close(self: Box<Self>) {
        self.log.lock().unwrap().closed += 1;
    }
}

#[derive(Default)]
pub struct RecordingDelay {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delay for RecordingDelay {
    async fn wait(&self, duration: Duration) -> Result<(), Cancelled> {
        self.waits.lock().unwrap().push(duration);
        Ok(())
    }
}
