//! Config Store: repositories, servers and commands in one JSON document.

mod document;
pub mod query;
mod types;

pub use document::JsonDocument;
pub use query::{Activatable, active};
pub use types::{CommandRecord, ConfigState, RepositoryRecord, ServerRecord, ServerState};

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is corrupted: {source}", path.display())]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },
    #[error("{kind} '{key}' already exists")]
    AlreadyExists { kind: &'static str, key: String },
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn not_found(kind: &'static str, key: &str) -> Self {
        StoreError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    fn exists(kind: &'static str, key: &str) -> Self {
        StoreError::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }
}

pub struct ConfigStore {
    doc: JsonDocument<ConfigState>,
}

impl ConfigStore {
    /// Open the store at `path`, failing early if an existing file is unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let doc = JsonDocument::new(path);
        doc.load()?;
        Ok(Self { doc })
    }

    pub fn path(&self) -> &Path {
        self.doc.path()
    }

    /// A consistent copy of the whole document.
    pub fn snapshot(&self) -> Result<ConfigState, StoreError> {
        self.doc.load()
    }

    /// Atomic read-modify-write of the whole document.
    pub async fn update<R>(
        &self,
        f: impl FnOnce(&mut ConfigState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.doc.update(f).await
    }

    /// Record the outcome of a repository check. `observed` is `None` when the
    /// lookup failed, in which case only `last_check` moves.
    ///
    /// Returns `false` when the repository was removed in the meantime.
    pub async fn record_repository_check(
        &self,
        name: &str,
        observed: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update(|cfg| {
            let Some(repo) = cfg.repository_mut(name) else {
                debug!("repository {} vanished before its check was recorded", name);
                return Ok(false);
            };
            if let Some(commit) = observed {
                repo.last_commit = commit.to_string();
            }
            repo.last_check = at;
            Ok(true)
        })
        .await
    }

    /// Returns `false` when the server was removed in the meantime.
    pub async fn set_server_state(
        &self,
        host: &str,
        state: ServerState,
        checked_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        self.update(|cfg| {
            let Some(srv) = cfg.server_mut(host) else {
                return Ok(false);
            };
            srv.state = state;
            if let Some(at) = checked_at {
                srv.last_check = at;
            }
            Ok(true)
        })
        .await
    }

    /// Persist a successful run: the command's `last_run` and the bound
    /// repository's `last_commit` move together.
    pub async fn record_command_run(
        &self,
        command_id: &str,
        repo: &str,
        commit: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update(|cfg| {
            let cmd = cfg
                .command_mut(command_id)
                .ok_or_else(|| StoreError::not_found("command", command_id))?;
            cmd.last_run = at;
            if let Some(repo) = cfg.repository_mut(repo) {
                repo.last_commit = commit.to_string();
            }
            Ok(())
        })
        .await
    }

    pub async fn add_repository(&self, record: RepositoryRecord) -> Result<(), StoreError> {
        self.update(|cfg| {
            if cfg.repository(&record.name).is_some() {
                return Err(StoreError::exists("repository", &record.name));
            }
            cfg.repos.push(record);
            Ok(())
        })
        .await
    }

    pub async fn remove_repository(&self, name: &str) -> Result<RepositoryRecord, StoreError> {
        self.update(|cfg| {
            let idx = cfg
                .repos
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| StoreError::not_found("repository", name))?;
            Ok(cfg.repos.remove(idx))
        })
        .await
    }

    pub async fn set_repository_active(&self, name: &str, active: bool) -> Result<(), StoreError> {
        self.update(|cfg| {
            let repo = cfg
                .repository_mut(name)
                .ok_or_else(|| StoreError::not_found("repository", name))?;
            repo.active = active;
            Ok(())
        })
        .await
    }

    pub async fn add_server(&self, record: ServerRecord) -> Result<(), StoreError> {
        self.update(|cfg| {
            if cfg.server(&record.host).is_some() {
                return Err(StoreError::exists("server", &record.host));
            }
            cfg.servers.push(record);
            Ok(())
        })
        .await
    }

    pub async fn remove_server(&self, host: &str) -> Result<ServerRecord, StoreError> {
        self.update(|cfg| {
            let idx = cfg
                .servers
                .iter()
                .position(|s| s.host == host)
                .ok_or_else(|| StoreError::not_found("server", host))?;
            Ok(cfg.servers.remove(idx))
        })
        .await
    }

    /// Put an `Unreachable` server back into the probe rotation.
    pub async fn reactivate_server(&self, host: &str) -> Result<ServerState, StoreError> {
        self.update(|cfg| {
            let srv = cfg
                .server_mut(host)
                .ok_or_else(|| StoreError::not_found("server", host))?;
            let previous = srv.state;
            if previous == ServerState::Unreachable {
                srv.state = ServerState::Reachable;
            }
            Ok(previous)
        })
        .await
    }

    pub async fn add_command(&self, record: CommandRecord) -> Result<(), StoreError> {
        self.update(|cfg| {
            if cfg.command(&record.id).is_some() {
                return Err(StoreError::exists("command", &record.id));
            }
            cfg.commands.push(record);
            Ok(())
        })
        .await
    }

    pub async fn remove_command(&self, id: &str) -> Result<CommandRecord, StoreError> {
        self.update(|cfg| {
            let idx = cfg
                .commands
                .iter()
                .position(|c| c.id == id)
                .ok_or_else(|| StoreError::not_found("command", id))?;
            Ok(cfg.commands.remove(idx))
        })
        .await
    }

    pub async fn set_command_active(&self, id: &str, active: bool) -> Result<(), StoreError> {
        self.update(|cfg| {
            let cmd = cfg
                .command_mut(id)
                .ok_or_else(|| StoreError::not_found("command", id))?;
            cmd.active = active;
            Ok(())
        })
        .await
    }
}
