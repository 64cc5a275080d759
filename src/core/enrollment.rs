//! Enrollment of repositories, servers and commands. Coordinates the
//! Config Store with the Secrets Store so referenced secrets live and die
//! with their owner.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::executor::script::is_env_key;
use crate::core::github::normalize_repo_name;
use crate::core::store::{
    CommandRecord, ConfigStore, RepositoryRecord, ServerRecord, ServerState, StoreError,
};
use crate::core::vault::{SecretsVault, VaultError, mask};

pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, thiserror::Error)]
pub enum EnrollmentError {
    #[error("{0:?} is not a GitHub repository (expected owner/name or a github.com URL)")]
    InvalidRepository(String),
    #[error("{0:?} is not a valid environment variable name")]
    InvalidSecretKey(String),
    #[error("secret key {0} given more than once")]
    DuplicateSecretKey(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Vault(#[from] VaultError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandView {
    #[serde(flatten)]
    pub record: CommandRecord,
    /// Key -> masked value.
    pub masked: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub repos: Vec<RepositoryRecord>,
    pub servers: Vec<ServerRecord>,
    pub commands: Vec<CommandView>,
}

pub struct Enrollment {
    store: Arc<ConfigStore>,
    vault: Arc<SecretsVault>,
}

impl Enrollment {
    pub fn new(store: Arc<ConfigStore>, vault: Arc<SecretsVault>) -> Self {
        Self { store, vault }
    }

    pub async fn add_repository(
        &self,
        name_or_url: &str,
        branch: Option<&str>,
        credential: Option<&str>,
    ) -> Result<RepositoryRecord, EnrollmentError> {
        let name = normalize_repo_name(name_or_url)
            .ok_or_else(|| EnrollmentError::InvalidRepository(name_or_url.to_string()))?;
        let branch = branch
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BRANCH);
        let mut record = RepositoryRecord::new(&name, branch);

        if let Some(token) = credential.filter(|t| !t.is_empty()) {
            record.credential = Some(
                self.vault
                    .store(&format!("repository {name} credential"), token)
                    .await?,
            );
        }
        if let Err(e) = self.store.add_repository(record.clone()).await {
            self.discard_secrets(record.credential.iter()).await;
            return Err(e.into());
        }
        info!(target: "activity", "repository {}@{} enrolled", record.name, record.branch);
        Ok(record)
    }

    /// Dependent commands are kept; they fail with NotFound when run.
    pub async fn remove_repository(&self, name: &str) -> Result<RepositoryRecord, EnrollmentError> {
        let record = self.store.remove_repository(name).await?;
        self.discard_secrets(record.credential.iter()).await;
        info!(target: "activity", "repository {} removed", name);
        Ok(record)
    }

    pub async fn set_repository_active(&self, name: &str, active: bool) -> Result<(), EnrollmentError> {
        self.store.set_repository_active(name, active).await?;
        Ok(())
    }

    pub async fn add_server(
        &self,
        host: &str,
        user: &str,
        key_path: &str,
    ) -> Result<ServerRecord, EnrollmentError> {
        let record = ServerRecord::new(host.trim(), user.trim(), key_path.trim());
        self.store.add_server(record.clone()).await?;
        info!(target: "connectivity", "server {} enrolled", record.host);
        Ok(record)
    }

    pub async fn remove_server(&self, host: &str) -> Result<ServerRecord, EnrollmentError> {
        let record = self.store.remove_server(host).await?;
        info!(target: "connectivity", "server {} removed", host);
        Ok(record)
    }

    /// Returns the state the server was in before reactivation.
    pub async fn reactivate_server(&self, host: &str) -> Result<ServerState, EnrollmentError> {
        let previous = self.store.reactivate_server(host).await?;
        if previous == ServerState::Unreachable {
            info!(target: "connectivity", "server {} reactivated", host);
        }
        Ok(previous)
    }

    pub async fn add_command(
        &self,
        repo: &str,
        server: &str,
        command: &str,
        secrets: &[(String, String)],
    ) -> Result<CommandRecord, EnrollmentError> {
        let repo = normalize_repo_name(repo).unwrap_or_else(|| repo.trim().to_string());
        let mut record = CommandRecord::new(repo, server.trim(), command);
        for (key, _) in secrets {
            if !is_env_key(key) {
                return Err(EnrollmentError::InvalidSecretKey(key.clone()));
            }
            if record.secrets.insert(key.clone(), String::new()).is_some() {
                return Err(EnrollmentError::DuplicateSecretKey(key.clone()));
            }
        }

        let mut stored = Vec::with_capacity(secrets.len());
        for (key, value) in secrets {
            let name = format!("command {} {}", record.id, key);
            match self.vault.store(&name, value).await {
                Ok(id) => {
                    record.secrets.insert(key.clone(), id.clone());
                    stored.push(id);
                }
                Err(e) => {
                    self.discard_secrets(stored.iter()).await;
                    return Err(e.into());
                }
            }
        }
        if let Err(e) = self.store.add_command(record.clone()).await {
            self.discard_secrets(stored.iter()).await;
            return Err(e.into());
        }
        info!(
            target: "activity",
            "command {} enrolled for {} on {}",
            record.id, record.repo, record.server
        );
        Ok(record)
    }

    /// Removes the command and every secret it references.
    pub async fn remove_command(&self, id: &str) -> Result<CommandRecord, EnrollmentError> {
        let record = self.store.remove_command(id).await?;
        self.discard_secrets(record.secrets.values()).await;
        info!(target: "activity", "command {} removed", id);
        Ok(record)
    }

    pub async fn set_command_active(&self, id: &str, active: bool) -> Result<(), EnrollmentError> {
        self.store.set_command_active(id, active).await?;
        Ok(())
    }

    pub async fn list(&self) -> Result<Listing, EnrollmentError> {
        let cfg = self.store.snapshot()?;
        let mut commands = Vec::with_capacity(cfg.commands.len());
        for record in cfg.commands {
            let mut masked = BTreeMap::new();
            for (key, id) in &record.secrets {
                let shown = match self.vault.get(id).await {
                    Ok(plain) => mask(&plain),
                    Err(VaultError::NotFound(_)) => "<missing>".to_string(),
                    Err(_) => "<unreadable>".to_string(),
                };
                masked.insert(key.clone(), shown);
            }
            commands.push(CommandView { record, masked });
        }
        Ok(Listing {
            repos: cfg.repos,
            servers: cfg.servers,
            commands,
        })
    }

    async fn discard_secrets<'a>(&self, ids: impl Iterator<Item = &'a String>) {
        for id in ids {
            if let Err(e) = self.vault.delete(id).await {
                warn!("failed to delete secret {}: {}", id, e);
            }
        }
    }
}
