use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    /// `owner/name`
    pub name: String,
    pub branch: String,
    pub active: bool,
    /// Empty until the first successful check.
    #[serde(default)]
    pub last_commit: String,
    #[serde(default = "epoch")]
    pub last_check: DateTime<Utc>,
    /// Secret id of the access token, if the repository is private.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl RepositoryRecord {
    pub fn new(name: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            branch: branch.into(),
            active: true,
            last_commit: String::new(),
            last_check: epoch(),
            credential: None,
        }
    }

    /// Directory name of the working copy on remote hosts.
    pub fn working_copy_dir(&self) -> String {
        self.name.replace('/', "_")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Reachable,
    Probing,
    Unreachable,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Reachable => "reachable",
            ServerState::Probing => "probing",
            ServerState::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub host: String,
    pub user: String,
    /// Path to the private key used for this host.
    pub key: String,
    pub state: ServerState,
    #[serde(default = "epoch")]
    pub last_check: DateTime<Utc>,
}

impl ServerRecord {
    pub fn new(host: impl Into<String>, user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key: key.into(),
            state: ServerState::Reachable,
            last_check: epoch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    /// Name of the bound repository, resolved at use time.
    pub repo: String,
    /// Host of the bound server, resolved at use time.
    pub server: String,
    pub command: String,
    pub active: bool,
    #[serde(default = "epoch")]
    pub last_run: DateTime<Utc>,
    /// Environment variable name -> secret id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

impl CommandRecord {
    pub fn new(
        repo: impl Into<String>,
        server: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            repo: repo.into(),
            server: server.into(),
            command: command.into(),
            active: true,
            last_run: epoch(),
            secrets: BTreeMap::new(),
        }
    }
}

/// The whole Config Store document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigState {
    #[serde(default)]
    pub repos: Vec<RepositoryRecord>,
    #[serde(default)]
    pub servers: Vec<ServerRecord>,
    #[serde(default)]
    pub commands: Vec<CommandRecord>,
}

impl ConfigState {
    pub fn repository(&self, name: &str) -> Option<&RepositoryRecord> {
        self.repos.iter().find(|r| r.name == name)
    }

    pub fn repository_mut(&mut self, name: &str) -> Option<&mut RepositoryRecord> {
        self.repos.iter_mut().find(|r| r.name == name)
    }

    pub fn server(&self, host: &str) -> Option<&ServerRecord> {
        self.servers.iter().find(|s| s.host == host)
    }

    pub fn server_mut(&mut self, host: &str) -> Option<&mut ServerRecord> {
        self.servers.iter_mut().find(|s| s.host == host)
    }

    pub fn command(&self, id: &str) -> Option<&CommandRecord> {
        self.commands.iter().find(|c| c.id == id)
    }

    pub fn command_mut(&mut self, id: &str) -> Option<&mut CommandRecord> {
        self.commands.iter_mut().find(|c| c.id == id)
    }
}
