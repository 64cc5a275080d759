//! SSH Session Client seam.
//!
//! The engine only needs "open a session, run commands on it, close it".
//! [`OpenSshConnector`] provides that over the system OpenSSH client; tests
//! substitute scripted sessions.

mod openssh;

pub use openssh::OpenSshConnector;

use async_trait::async_trait;
use std::time::Duration;

use crate::core::store::ServerRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub key_path: String,
}

impl From<&ServerRecord> for SshTarget {
    fn from(srv: &ServerRecord) -> Self {
        Self {
            host: srv.host.clone(),
            user: srv.user.clone(),
            key_path: srv.key.clone(),
        }
    }
}

impl std::fmt::Display for SshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.host)
    }
}

/// Captured result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr and stdout combined, for failure reports.
    pub fn diagnostics(&self) -> String {
        let stderr = self.stderr.trim();
        let stdout = self.stdout.trim();
        match (stderr.is_empty(), stdout.is_empty()) {
            (false, false) => format!("{}\n{}", stderr, stdout),
            (false, true) => stderr.to_string(),
            (true, _) => stdout.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("authentication rejected by {host}: {detail}")]
    Auth { host: String, detail: String },
    #[error("connection to {host} timed out")]
    ConnectTimeout { host: String },
    #[error("{host} is unreachable: {detail}")]
    Unreachable { host: String, detail: String },
    #[error("remote command did not finish within {0:?}")]
    ExecTimeout(Duration),
    #[error("failed to run ssh client: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn open(
        &self,
        target: &SshTarget,
        connect_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, SshError>;
}

/// An open session. Callers must `close` it on every path; implementations
/// still clean up on drop as a last resort.
#[async_trait]
pub trait SshSession: Send {
    /// Run `command` and wait for it. `timeout` bounds the whole execution;
    /// on expiry the remote command is torn down.
    async fn exec(&mut self, command: &str, timeout: Option<Duration>)
    -> Result<ExecOutput, SshError>;

    async fn close(self: Box<Self>);
}
