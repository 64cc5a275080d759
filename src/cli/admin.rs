use anyhow::{Context, Result};
use console::style;

use super::{CommandAction, RepoCommand, ServerCommand};
use crate::core::engine::Engine;
use crate::core::prober::ProbeOutcome;
use crate::core::store::ServerState;
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn};

/// `KEY=value`, or a bare `KEY` read from the environment.
fn parse_secret(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((key, value)) => Ok((key.trim().to_string(), value.to_string())),
        None => {
            let key = arg.trim();
            let value = std::env::var(key)
                .with_context(|| format!("secret {key} has no value and ${key} is not set"))?;
            Ok((key.to_string(), value))
        }
    }
}

pub(super) async fn repo(engine: &Engine, cmd: RepoCommand) -> Result<()> {
    let enrollment = engine.enrollment();
    match cmd {
        RepoCommand::Add {
            repo,
            branch,
            credential_env,
        } => {
            let credential = match credential_env {
                Some(var) => Some(
                    std::env::var(&var)
                        .with_context(|| format!("credential variable ${var} is not set"))?,
                ),
                None => None,
            };
            let record = enrollment
                .add_repository(&repo, branch.as_deref(), credential.as_deref())
                .await?;
            print_success(&format!("Repository {}@{} added", record.name, record.branch));
            if record.credential.is_some() {
                print_info("Access token stored encrypted");
            }
        }
        RepoCommand::Remove { name } => {
            enrollment.remove_repository(&name).await?;
            print_success(&format!("Repository {name} removed"));
        }
        RepoCommand::Enable { name } => {
            enrollment.set_repository_active(&name, true).await?;
            print_success(&format!("Repository {name} enabled"));
        }
        RepoCommand::Disable { name } => {
            enrollment.set_repository_active(&name, false).await?;
            print_success(&format!("Repository {name} disabled"));
        }
    }
    Ok(())
}

pub(super) async fn server(engine: &Engine, cmd: ServerCommand) -> Result<()> {
    match cmd {
        ServerCommand::Add { host, user, key } => {
            let record = engine.enrollment().add_server(&host, &user, &key).await?;
            print_success(&format!("Server {}@{} added", record.user, record.host));
        }
        ServerCommand::Remove { host } => {
            engine.enrollment().remove_server(&host).await?;
            print_success(&format!("Server {host} removed"));
        }
        ServerCommand::Reactivate { host } => match engine.reactivate_server(&host).await? {
            None => print_info(&format!("Server {host} was not unreachable; nothing to do")),
            Some(ProbeOutcome::Reachable { attempts }) => print_success(&format!(
                "Server {host} is reachable again (attempt {attempts})"
            )),
            Some(ProbeOutcome::Unreachable { reason, .. }) => {
                print_warn(&format!("Server {host} is still unreachable: {reason}"))
            }
            Some(ProbeOutcome::Removed) => print_warn(&format!("Server {host} was removed")),
            Some(ProbeOutcome::Cancelled) => print_warn("Probe cancelled"),
        },
    }
    Ok(())
}

pub(super) async fn command(engine: &Engine, cmd: CommandAction) -> Result<()> {
    let enrollment = engine.enrollment();
    match cmd {
        CommandAction::Add(add) => {
            let secrets = add
                .secrets
                .iter()
                .map(|s| parse_secret(s))
                .collect::<Result<Vec<_>>>()?;
            let record = enrollment
                .add_command(&add.repo, &add.server, &add.command, &secrets)
                .await?;
            print_success(&format!("Command {} added", record.id));
            let snapshot = engine.store().snapshot()?;
            if snapshot.repository(&record.repo).is_none() {
                print_warn(&format!("Repository {} is not enrolled yet", record.repo));
            }
            if snapshot.server(&record.server).is_none() {
                print_warn(&format!("Server {} is not enrolled yet", record.server));
            }
        }
        CommandAction::Remove { id } => {
            let record = enrollment.remove_command(&id).await?;
            print_success(&format!(
                "Command {id} removed along with {} secret(s)",
                record.secrets.len()
            ));
        }
        CommandAction::Enable { id } => {
            enrollment.set_command_active(&id, true).await?;
            print_success(&format!("Command {id} enabled"));
        }
        CommandAction::Disable { id } => {
            enrollment.set_command_active(&id, false).await?;
            print_success(&format!("Command {id} disabled"));
        }
    }
    Ok(())
}

fn on_off(active: bool) -> String {
    if active {
        style("active").green().to_string()
    } else {
        style("inactive").dim().to_string()
    }
}

fn state_label(state: ServerState) -> String {
    match state {
        ServerState::Reachable => style(state).green().to_string(),
        ServerState::Probing => style(state).yellow().to_string(),
        ServerState::Unreachable => style(state).red().bold().to_string(),
    }
}

pub(super) async fn list(engine: &Engine, json: bool) -> Result<()> {
    let listing = engine.enrollment().list().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }
    if listing.repos.is_empty() && listing.servers.is_empty() && listing.commands.is_empty() {
        print_info("Nothing enrolled yet. Start with `rpr repo add owner/name`.");
        return Ok(());
    }

    let mut repos = GuideSection::new("Repositories");
    for r in &listing.repos {
        let commit = if r.last_commit.is_empty() {
            "-".to_string()
        } else {
            r.last_commit.chars().take(12).collect()
        };
        repos = repos.status(
            &format!("{}@{}", r.name, r.branch),
            &format!("{} {} checked {}", on_off(r.active), commit, r.last_check.to_rfc3339()),
        );
    }
    repos.print();

    let mut servers = GuideSection::new("Servers");
    for s in &listing.servers {
        servers = servers.status(
            &s.host,
            &format!("{} as {} checked {}", state_label(s.state), s.user, s.last_check.to_rfc3339()),
        );
    }
    servers.print();

    let mut commands = GuideSection::new("Commands");
    for c in &listing.commands {
        let secrets = c
            .masked
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        commands = commands.status(
            &c.record.id,
            &format!(
                "{} {} -> {}: {} {}",
                on_off(c.record.active),
                c.record.repo,
                c.record.server,
                style(&c.record.command).bold(),
                style(secrets).dim()
            ),
        );
    }
    commands.print();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_specs_split_on_first_equals() {
        assert_eq!(
            parse_secret("URL=postgres://u:p@h/db?x=1").unwrap(),
            ("URL".to_string(), "postgres://u:p@h/db?x=1".to_string())
        );
        assert_eq!(parse_secret("EMPTY=").unwrap().1, "");
    }

    #[test]
    fn bare_secret_keys_need_the_variable() {
        assert!(parse_secret("RPR_TEST_SURELY_UNSET_VARIABLE").is_err());
    }
}
