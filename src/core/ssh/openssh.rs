//! Sessions over the system OpenSSH client.
//!
//! Where supported, a session is a ControlMaster connection owned by the
//! session: `open` authenticates once, every `exec` is multiplexed over the
//! control socket, and closing (or dropping) the session ends the master,
//! which hangs up anything still running remotely.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ExecOutput, SshConnector, SshError, SshSession, SshTarget};
use crate::platform::{NativePlatform, Platform};

/// Extra time granted to the ssh client on top of its own ConnectTimeout.
const CONNECT_GRACE: Duration = Duration::from_secs(5);
const MASTER_POLL: Duration = Duration::from_millis(100);
const MASTER_EXIT_WAIT: Duration = Duration::from_secs(5);
/// Exit status OpenSSH reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

#[derive(Debug, Clone, Default)]
pub struct OpenSshConnector;

impl OpenSshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn open(
        &self,
        target: &SshTarget,
        connect_timeout: Duration,
    ) -> Result<Box<dyn SshSession>, SshError> {
        let control_dir = if NativePlatform::supports_control_master() {
            let dir = tempfile::Builder::new().prefix("rpr-ssh-").tempdir()?;
            NativePlatform::restrict_dir_permissions(dir.path());
            Some(dir)
        } else {
            None
        };

        let mut session = OpenSshSession {
            target: target.clone(),
            connect_timeout,
            control_path: control_dir.as_ref().map(|d| d.path().join("ctl")),
            _control_dir: control_dir,
            master: None,
        };

        let deadline = Instant::now() + connect_timeout + CONNECT_GRACE;
        if session.control_path.is_some() {
            session.start_master(deadline).await?;
        } else {
            session.check_reachable(deadline).await?;
        }

        debug!("Opened ssh session to {}", target);
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    target: SshTarget,
    connect_timeout: Duration,
    control_path: Option<PathBuf>,
    // Keeps the socket directory alive for the session's lifetime.
    _control_dir: Option<tempfile::TempDir>,
    /// Spawned with `kill_on_drop`, so dropping the session ends it.
    master: Option<Child>,
}

impl OpenSshSession {
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            expand_home(&self.target.key_path),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
        ];
        if let Some(path) = &self.control_path {
            args.push("-o".to_string());
            args.push(format!("ControlPath={}", path.display()));
        }
        args
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.target.user, self.target.host)
    }

    fn command(&self) -> tokio::process::Command {
        let mut cmd = NativePlatform::ssh_command();
        cmd.args(self.base_args());
        cmd
    }

    async fn start_master(&mut self, deadline: Instant) -> Result<(), SshError> {
        let mut master = self
            .command()
            .args(["-o", "ControlMaster=yes", "-N"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        loop {
            if master.try_wait()?.is_some() {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(classify_failure(&self.target.host, &stderr));
            }
            if self.master_alive().await {
                self.master = Some(master);
                return Ok(());
            }
            if Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(SshError::ConnectTimeout {
                    host: self.target.host.clone(),
                });
            }
            tokio::time::sleep(MASTER_POLL).await;
        }
    }

    /// Without multiplexing every exec reconnects; opening only proves the
    /// host accepts us.
    async fn check_reachable(&self, deadline: Instant) -> Result<(), SshError> {
        let mut cmd = self.command();
        cmd.arg(self.destination())
            .arg("true")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = tokio::time::timeout_at(deadline, cmd.output())
            .await
            .map_err(|_| SshError::ConnectTimeout {
                host: self.target.host.clone(),
            })??;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                &self.target.host,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn master_alive(&self) -> bool {
        if self.control_path.is_none() {
            return false;
        }
        let mut cmd = self.command();
        cmd.args(["-O", "check"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(cmd.status().await, Ok(status) if status.success())
    }

    async fn stop_master(&mut self) {
        let Some(mut master) = self.master.take() else {
            return;
        };
        let mut cmd = self.command();
        cmd.args(["-O", "exit"])
            .arg(self.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Err(e) = cmd.status().await {
            warn!("Failed to close ssh session to {}: {}", self.target, e);
        }
        if tokio::time::timeout(MASTER_EXIT_WAIT, master.wait())
            .await
            .is_err()
        {
            let _ = master.kill().await;
        }
    }
}

#[async_trait]
impl SshSession for OpenSshSession {
    async fn exec(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecOutput, SshError> {
        let mut cmd = self.command();
        cmd.arg(self.destination())
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, cmd.output()).await {
                Ok(res) => res?,
                Err(_) => {
                    // The local client is already gone; ending the master
                    // hangs up the remote command too.
                    self.stop_master().await;
                    return Err(SshError::ExecTimeout(limit));
                }
            },
            None => cmd.output().await?,
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == SSH_CLIENT_FAILURE && !self.master_alive().await {
            return Err(classify_failure(&self.target.host, &stderr));
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    async fn close(mut self: Box<Self>) {
        self.stop_master().await;
        debug!("Closed ssh session to {}", self.target);
    }
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).display().to_string(),
        _ => path.to_string(),
    }
}

fn classify_failure(host: &str, stderr: &str) -> SshError {
    let detail = stderr.trim().to_string();
    let lower = detail.to_lowercase();
    if lower.contains("permission denied")
        || lower.contains("authentication failed")
        || lower.contains("host key verification failed")
        || lower.contains("no such identity")
    {
        SshError::Auth {
            host: host.to_string(),
            detail,
        }
    } else if lower.contains("timed out") {
        SshError::ConnectTimeout {
            host: host.to_string(),
        }
    } else {
        SshError::Unreachable {
            host: host.to_string(),
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_client_failures() {
        assert!(matches!(
            classify_failure("h", "deploy@h: Permission denied (publickey)."),
            SshError::Auth { .. }
        ));
        assert!(matches!(
            classify_failure("h", "ssh: connect to host h port 22: Connection timed out"),
            SshError::ConnectTimeout { .. }
        ));
        assert!(matches!(
            classify_failure("h", "ssh: Could not resolve hostname h: Name or service not known"),
            SshError::Unreachable { .. }
        ));
    }

    #[test]
    fn expands_home_relative_key_paths() {
        let expanded = expand_home("~/.ssh/id_ed25519");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with(".ssh/id_ed25519"));
        assert_eq!(expand_home("/etc/keys/deploy"), "/etc/keys/deploy");
    }
}
