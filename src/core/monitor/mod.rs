//! Repository Monitor: polls branch heads and auto-deploys on change.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::executor::{CommandExecutor, ExecError, RunReport};
use crate::core::github::CommitLookup;
use crate::core::locks::{EntityLocks, repo_key};
use crate::core::store::{ConfigStore, RepositoryRecord, StoreError, active};
use crate::core::vault::SecretsVault;

#[derive(Debug)]
pub enum RepoOutcome {
    /// First observation; recorded without triggering.
    Baseline { commit: String },
    Unchanged { commit: String },
    Changed {
        from: String,
        to: String,
        runs: Vec<(String, Result<RunReport, ExecError>)>,
    },
    /// Lookup or credential failure; only `last_check` moved.
    Failed { reason: String },
    /// Busy with a concurrent check.
    Skipped,
}

#[derive(Debug, Default)]
pub struct CycleReport {
    pub repos: Vec<(String, RepoOutcome)>,
}

impl CycleReport {
    pub fn changed(&self) -> usize {
        self.repos
            .iter()
            .filter(|(_, o)| matches!(o, RepoOutcome::Changed { .. }))
            .count()
    }
}

pub struct RepositoryMonitor {
    store: Arc<ConfigStore>,
    vault: Arc<SecretsVault>,
    lookup: Arc<dyn CommitLookup>,
    executor: Arc<CommandExecutor>,
    locks: EntityLocks,
}

impl RepositoryMonitor {
    pub fn new(
        store: Arc<ConfigStore>,
        vault: Arc<SecretsVault>,
        lookup: Arc<dyn CommitLookup>,
        executor: Arc<CommandExecutor>,
        locks: EntityLocks,
    ) -> Self {
        Self {
            store,
            vault,
            lookup,
            executor,
            locks,
        }
    }

    /// Check every active repository in enrollment order. Per-repository
    /// failures are logged and recorded in the report.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let cfg = self.store.snapshot()?;
        let repos: Vec<RepositoryRecord> = active(&cfg.repos).cloned().collect();
        info!(target: "activity", "repository check started for {} repo(s)", repos.len());

        let mut report = CycleReport::default();
        for repo in repos {
            let Some(_guard) = self.locks.try_lock(repo_key(&repo.name))? else {
                info!(target: "activity", "{}: check already in progress, skipping", repo.name);
                report.repos.push((repo.name, RepoOutcome::Skipped));
                continue;
            };
            let outcome = match self.check(&repo).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(target: "activity", "{}: failed to record check: {}", repo.name, e);
                    RepoOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            report.repos.push((repo.name, outcome));
        }
        info!(
            target: "activity",
            "repository check finished: {} change event(s)",
            report.changed()
        );
        Ok(report)
    }

    async fn check(&self, repo: &RepositoryRecord) -> Result<RepoOutcome, StoreError> {
        let observed = match self.observe(repo).await {
            Ok(commit) => commit,
            Err(reason) => {
                warn!(target: "activity", "{}@{}: check failed: {}", repo.name, repo.branch, reason);
                self.store
                    .record_repository_check(&repo.name, None, Utc::now())
                    .await?;
                return Ok(RepoOutcome::Failed { reason });
            }
        };

        let previous = repo.last_commit.as_str();
        let outcome = if previous.is_empty() {
            info!(target: "activity", "{}@{}: baseline {}", repo.name, repo.branch, observed);
            RepoOutcome::Baseline {
                commit: observed.clone(),
            }
        } else if previous == observed {
            RepoOutcome::Unchanged {
                commit: observed.clone(),
            }
        } else {
            info!(
                target: "activity",
                "{}@{}: new commit {} (was {})",
                repo.name, repo.branch, observed, previous
            );
            RepoOutcome::Changed {
                from: previous.to_string(),
                to: observed.clone(),
                runs: self.deploy(&repo.name).await,
            }
        };

        // Recorded even when deployments failed, so one commit triggers once.
        if !self
            .store
            .record_repository_check(&repo.name, Some(&observed), Utc::now())
            .await?
        {
            info!(target: "activity", "{}: removed during check", repo.name);
        }
        Ok(outcome)
    }

    async fn observe(&self, repo: &RepositoryRecord) -> Result<String, String> {
        let credential = match &repo.credential {
            Some(id) => Some(
                self.vault
                    .get(id)
                    .await
                    .map_err(|e| format!("credential unavailable: {e}"))?,
            ),
            None => None,
        };
        self.lookup
            .latest_commit(&repo.name, &repo.branch, credential.as_deref())
            .await
            .map_err(|e| e.to_string())
    }

    async fn deploy(&self, repo: &str) -> Vec<(String, Result<RunReport, ExecError>)> {
        let ids: Vec<String> = match self.store.snapshot() {
            Ok(cfg) => cfg
                .active_commands_for(repo)
                .into_iter()
                .map(|c| c.id.clone())
                .collect(),
            Err(e) => {
                error!(target: "activity", "{}: cannot list bound commands: {}", repo, e);
                return Vec::new();
            }
        };

        let mut runs = Vec::with_capacity(ids.len());
        for id in ids {
            let result = self.executor.run(&id).await;
            match &result {
                Ok(r) if r.success() => {
                    info!(target: "activity", "{}: command {} deployed {}", repo, id, r.commit)
                }
                Ok(r) => warn!(
                    target: "activity",
                    "{}: command {} exited with {}",
                    repo, id, r.exit_code
                ),
                Err(e) => error!(target: "activity", "{}: command {} failed: {}", repo, id, e),
            }
            runs.push((id, result));
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::ExecutorOptions;
    use crate::core::fakes::{FakeSsh, Fixture, ScriptedLookup, fixture};
    use crate::core::github::CommitLookupError;
    use crate::core::store::{CommandRecord, ServerRecord};
    use std::time::Duration;

    struct Harness {
        fx: Fixture,
        lookup: Arc<ScriptedLookup>,
        ssh: FakeSsh,
        monitor: RepositoryMonitor,
    }

    fn harness() -> Harness {
        let fx = fixture();
        let lookup = Arc::new(ScriptedLookup::default());
        let ssh = FakeSsh::new();
        let locks = fx.locks();
        let executor = Arc::new(CommandExecutor::new(
            fx.store.clone(),
            fx.vault.clone(),
            lookup.clone(),
            Arc::new(ssh.clone()),
            locks.clone(),
            ExecutorOptions {
                connect_timeout: Duration::from_secs(10),
                exec_timeout: Duration::from_secs(60),
                remote_base_dir: "~/rpr".to_string(),
                clone_base_url: "https://github.com".to_string(),
            },
        ));
        let monitor = RepositoryMonitor::new(
            fx.store.clone(),
            fx.vault.clone(),
            lookup.clone(),
            executor,
            locks,
        );
        Harness {
            fx,
            lookup,
            ssh,
            monitor,
        }
    }

    async fn enroll(h: &Harness, last_commit: &str, commands: &[(&str, bool)]) -> Vec<String> {
        let mut repo = RepositoryRecord::new("octo/app", "main");
        repo.last_commit = last_commit.to_string();
        h.fx.store.add_repository(repo).await.unwrap();
        h.fx.store
            .add_server(ServerRecord::new("web1", "deploy", "~/.ssh/id"))
            .await
            .unwrap();
        let mut ids = Vec::new();
        for (command, enabled) in commands {
            let mut cmd = CommandRecord::new("octo/app", "web1", *command);
            cmd.active = *enabled;
            ids.push(cmd.id.clone());
            h.fx.store.add_command(cmd).await.unwrap();
        }
        ids
    }

    fn user_commands(h: &Harness) -> Vec<String> {
        h.ssh
            .log()
            .commands
            .into_iter()
            .filter(|c| !c.starts_with("mkdir -p"))
            .collect()
    }

    #[tokio::test]
    async fn first_observation_records_without_deploying() {
        let h = harness();
        enroll(&h, "", &[("make deploy", true)]).await;
        h.lookup.set("octo/app", Ok("aaaa"));

        let report = h.monitor.run_cycle().await.unwrap();

        assert!(matches!(report.repos[0].1, RepoOutcome::Baseline { .. }));
        assert_eq!(h.ssh.log().opened, 0);
        let repo = &h.fx.store.snapshot().unwrap().repos[0];
        assert_eq!(repo.last_commit, "aaaa");
        assert!(repo.last_check.timestamp() > 0);
    }

    #[tokio::test]
    async fn change_event_runs_each_active_command_once_in_order() {
        let h = harness();
        let ids = enroll(
            &h,
            "aaaa",
            &[("make one", true), ("make skipped", false), ("make two", true)],
        )
        .await;
        h.lookup.set("octo/app", Ok("bbbb"));

        let report = h.monitor.run_cycle().await.unwrap();

        match &report.repos[0].1 {
            RepoOutcome::Changed { from, to, runs } => {
                assert_eq!((from.as_str(), to.as_str()), ("aaaa", "bbbb"));
                let ran: Vec<_> = runs.iter().map(|(id, _)| id.clone()).collect();
                assert_eq!(ran, vec![ids[0].clone(), ids[2].clone()]);
                assert!(runs.iter().all(|(_, r)| r.is_ok()));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        let user = user_commands(&h);
        assert_eq!(user.len(), 2);
        assert!(user[0].ends_with("make one"));
        assert!(user[1].ends_with("make two"));
        assert_eq!(h.fx.store.snapshot().unwrap().repos[0].last_commit, "bbbb");

        // Same head on the next cycle: nothing runs again.
        let report = h.monitor.run_cycle().await.unwrap();
        assert!(matches!(report.repos[0].1, RepoOutcome::Unchanged { .. }));
        assert_eq!(user_commands(&h).len(), 2);
    }

    #[tokio::test]
    async fn failed_deploy_still_advances_last_commit() {
        let h = harness();
        let ids = enroll(&h, "aaaa", &[("make one", true), ("make two", true)]).await;
        // A dangling server fails the first command; the second still runs.
        h.fx.store
            .update(|cfg| {
                cfg.command_mut(&ids[0]).unwrap().server = "gone".to_string();
                Ok(())
            })
            .await
            .unwrap();
        h.lookup.set("octo/app", Ok("bbbb"));

        let report = h.monitor.run_cycle().await.unwrap();

        let RepoOutcome::Changed { runs, .. } = &report.repos[0].1 else {
            panic!("expected a change event");
        };
        assert!(matches!(runs[0].1, Err(ExecError::NotFound { kind: "server", .. })));
        assert!(runs[1].1.is_ok());
        assert_eq!(h.fx.store.snapshot().unwrap().repos[0].last_commit, "bbbb");
    }

    #[tokio::test]
    async fn lookup_failure_only_moves_last_check() {
        let h = harness();
        enroll(&h, "aaaa", &[("make deploy", true)]).await;
        h.lookup.set(
            "octo/app",
            Err(CommitLookupError::RateLimited {
                repo: "octo/app".into(),
            }),
        );

        let report = h.monitor.run_cycle().await.unwrap();

        assert!(matches!(report.repos[0].1, RepoOutcome::Failed { .. }));
        let repo = &h.fx.store.snapshot().unwrap().repos[0];
        assert_eq!(repo.last_commit, "aaaa");
        assert!(repo.last_check.timestamp() > 0);
        assert_eq!(h.ssh.log().opened, 0);
    }

    #[tokio::test]
    async fn inactive_and_busy_repositories_are_not_checked() {
        let h = harness();
        enroll(&h, "aaaa", &[]).await;
        let mut other = RepositoryRecord::new("octo/lib", "main");
        other.active = false;
        h.fx.store.add_repository(other).await.unwrap();
        h.lookup.set("octo/app", Ok("bbbb"));

        let held = h.monitor.locks.try_lock(repo_key("octo/app")).unwrap().unwrap();
        let report = h.monitor.run_cycle().await.unwrap();
        drop(held);

        assert_eq!(report.repos.len(), 1);
        assert!(matches!(report.repos[0].1, RepoOutcome::Skipped));
        assert!(h.lookup.calls().is_empty());
    }
}
