use anyhow::{Result, bail};
use console::style;

use super::CheckTarget;
use crate::core::engine::Engine;
use crate::core::monitor::RepoOutcome;
use crate::core::prober::ProbeOutcome;
use crate::core::terminal::{GuideSection, ROCKET, print_block, print_error, print_success, print_warn};

pub(super) async fn check(engine: &Engine, what: CheckTarget) -> Result<()> {
    match what {
        CheckTarget::Repos => {
            let report = engine.check_repositories().await?;
            let mut section = GuideSection::new("Repository check");
            for (name, outcome) in &report.repos {
                let line = match outcome {
                    RepoOutcome::Baseline { commit } => format!("recorded {commit}"),
                    RepoOutcome::Unchanged { commit } => format!("unchanged at {commit}"),
                    RepoOutcome::Changed { from, to, runs } => {
                        let ok = runs.iter().filter(|(_, r)| matches!(r, Ok(r) if r.success())).count();
                        format!("{from} -> {to}, {ok}/{} command(s) succeeded", runs.len())
                    }
                    RepoOutcome::Failed { reason } => style(reason).red().to_string(),
                    RepoOutcome::Skipped => "busy, skipped".to_string(),
                };
                section = section.status(name, &line);
            }
            section.print();
            print_success(&format!(
                "{} repositor(ies) checked, {} change event(s)",
                report.repos.len(),
                report.changed()
            ));
        }
        CheckTarget::Servers => {
            let report = engine.check_servers().await?;
            let mut section = GuideSection::new("Server check");
            for (host, outcome) in &report.outcomes {
                let line = match outcome {
                    ProbeOutcome::Reachable { attempts } => {
                        style(format!("reachable (attempt {attempts})")).green().to_string()
                    }
                    ProbeOutcome::Unreachable { reason, .. } => {
                        style(format!("unreachable: {reason}")).red().to_string()
                    }
                    ProbeOutcome::Removed => "removed during probe".to_string(),
                    ProbeOutcome::Cancelled => "cancelled".to_string(),
                };
                section = section.status(host, &line);
            }
            for host in &report.skipped {
                section = section.status(host, "busy, skipped");
            }
            for (host, err) in &report.errors {
                section = section.status(host, &style(err).red().to_string());
            }
            section.print();
        }
    }
    Ok(())
}

pub(super) async fn run(engine: &Engine, id: &str, json: bool) -> Result<()> {
    println!("{} Running command {}", ROCKET, style(id).bold());
    let report = match engine.run_command(id).await {
        Ok(report) => report,
        Err(e) => {
            print_error(&e.to_string());
            bail!("command {id} failed");
        }
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        GuideSection::new("Result")
            .status("Repository", &report.repo)
            .status("Server", &report.server)
            .status("Commit", &report.commit)
            .status("Exit code", &report.exit_code.to_string())
            .print();
        print_block("stdout:", &report.stdout);
        print_block("stderr:", &report.stderr);
    }
    if report.success() {
        print_success("Deployment finished");
        Ok(())
    } else {
        print_warn(&format!("Command exited with {}", report.exit_code));
        bail!("command {id} exited with {}", report.exit_code)
    }
}
