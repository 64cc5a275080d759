use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::core::engine::Engine;
use crate::core::lifecycle::{JobKind, Scheduler};
use crate::core::settings::Settings;
use crate::core::terminal::{GuideSection, print_info, print_warn};

#[cfg(unix)]
struct Hangup(tokio::signal::unix::Signal);

#[cfg(unix)]
impl Hangup {
    fn new() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self(signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?))
    }

    async fn recv(&mut self) {
        if self.0.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
struct Hangup;

#[cfg(not(unix))]
impl Hangup {
    fn new() -> Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}

async fn log_next_runs(scheduler: &Scheduler) {
    for kind in [JobKind::RepositoryCheck, JobKind::ServerCheck] {
        match scheduler.next_run(kind).await {
            Ok(Some(at)) => info!("next {} at {}", kind, at.to_rfc3339()),
            Ok(None) => info!("{} has no upcoming run", kind),
            Err(e) => warn!("cannot read next run of {}: {}", kind, e),
        }
    }
}

pub(super) async fn run(data_dir: &Path, settings: Settings) -> Result<()> {
    let mut engine = Engine::open(data_dir, settings)
        .with_context(|| format!("failed to start daemon in {}", data_dir.display()))?;
    let scheduler = Scheduler::new().await?;
    engine.schedule(&scheduler).await?;
    scheduler.start().await?;

    GuideSection::new("Daemon Started")
        .status("Data directory", &data_dir.display().to_string())
        .status(
            "Repository check",
            &format!("every {}s", engine.settings().schedule.repo_check_interval_secs),
        )
        .status(
            "Server check",
            &format!("every {}s", engine.settings().schedule.server_check_interval_secs),
        )
        .print();
    print_info("Press Ctrl-C to stop; send SIGHUP to reload settings.toml");
    info!("daemon started with data directory {}", data_dir.display());
    log_next_runs(&scheduler).await;

    let mut hangup = Hangup::new()?;
    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed to listen for Ctrl-C")?;
                break;
            }
            _ = hangup.recv() => {
                match Settings::load(data_dir) {
                    Ok(new) => {
                        engine.apply_schedule(&scheduler, new).await?;
                        info!("settings reloaded");
                        log_next_runs(&scheduler).await;
                    }
                    Err(e) => {
                        warn!("settings reload failed, keeping current schedule: {}", e);
                        print_warn(&format!("Reload failed: {e}"));
                    }
                }
            }
        }
    }

    info!("daemon stopping");
    engine.shutdown();
    scheduler.shutdown().await?;
    Ok(())
}
