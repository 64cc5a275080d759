mod admin;
mod daemon;
mod logs;
mod trigger;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::core::engine::{Engine, prepare_data_dir};
use crate::core::settings::Settings;
use crate::logging::{self, LogOptions};
use crate::platform::{NativePlatform, Platform};

#[derive(Parser, Debug)]
#[command(
    name = "rpr",
    version,
    about = "Deploy repositories to SSH hosts when their branch moves"
)]
pub(crate) struct Cli {
    /// Data directory (defaults to $RPR_DATA_DIR, then ~/.remote-pull-runner)
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Commands {
    /// Run the scheduler until interrupted
    Daemon,
    /// Run one check cycle now
    Check {
        #[command(subcommand)]
        what: CheckTarget,
    },
    /// Run one command now
    Run {
        id: String,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage monitored repositories
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Manage deployment servers
    #[command(subcommand)]
    Server(ServerCommand),
    /// Manage deployment commands
    #[command(subcommand)]
    Command(CommandAction),
    /// Show everything that is enrolled
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show the tail of a log stream
    Logs {
        #[arg(value_parser = ["activity", "connectivity"])]
        stream: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}

#[derive(Subcommand, Debug, Clone, Copy)]
pub(crate) enum CheckTarget {
    Repos,
    Servers,
}

#[derive(Subcommand, Debug)]
pub(crate) enum RepoCommand {
    /// Enroll `owner/name` or a github.com URL
    Add {
        repo: String,
        #[arg(long)]
        branch: Option<String>,
        /// Read an access token from this environment variable
        #[arg(long, value_name = "VAR")]
        credential_env: Option<String>,
    },
    Remove {
        name: String,
    },
    Enable {
        name: String,
    },
    Disable {
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub(crate) enum ServerCommand {
    Add {
        host: String,
        #[arg(long)]
        user: String,
        /// Private key file used for this host
        #[arg(long, default_value = "~/.ssh/id_rsa")]
        key: String,
    },
    Remove {
        host: String,
    },
    /// Return an unreachable server to rotation and probe it
    Reactivate {
        host: String,
    },
}

#[derive(Args, Debug)]
pub(crate) struct CmdAdd {
    #[arg(long)]
    repo: String,
    #[arg(long)]
    server: String,
    /// `KEY=value`, or `KEY` to take the value from the environment
    #[arg(long = "secret", value_name = "KEY[=VALUE]")]
    secrets: Vec<String>,
    /// Shell command run from the working copy
    command: String,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CommandAction {
    Add(CmdAdd),
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
}

fn open_engine(data_dir: &std::path::Path, settings: Settings) -> Result<Engine> {
    Engine::open(data_dir, settings)
        .with_context(|| format!("failed to open data directory {}", data_dir.display()))
}

pub async fn run_main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(NativePlatform::data_dir);

    if let Commands::Logs { stream, lines } = &cli.command {
        let settings = Settings::load(&data_dir)?;
        return logs::tail(&settings.log_dir(&data_dir), stream, *lines);
    }

    prepare_data_dir(&data_dir)?;
    let settings = Settings::load(&data_dir)?;
    let stdout_level = match cli.command {
        Commands::Daemon => settings.logging.level.clone(),
        Commands::Check { .. } | Commands::Run { .. } => "info".to_string(),
        _ => "warn".to_string(),
    };
    let log_dir = settings.log_dir(&data_dir);
    let _log = logging::init(LogOptions {
        stdout_level: &stdout_level,
        files: Some(&log_dir),
        retention_days: settings.logging.retention_days,
    });

    match cli.command {
        Commands::Daemon => daemon::run(&data_dir, settings).await,
        Commands::Check { what } => {
            let engine = open_engine(&data_dir, settings)?;
            trigger::check(&engine, what).await
        }
        Commands::Run { id, json } => {
            let engine = open_engine(&data_dir, settings)?;
            trigger::run(&engine, &id, json).await
        }
        Commands::Repo(cmd) => admin::repo(&open_engine(&data_dir, settings)?, cmd).await,
        Commands::Server(cmd) => admin::server(&open_engine(&data_dir, settings)?, cmd).await,
        Commands::Command(cmd) => admin::command(&open_engine(&data_dir, settings)?, cmd).await,
        Commands::List { json } => admin::list(&open_engine(&data_dir, settings)?, json).await,
        Commands::Logs { .. } => Ok(()),
    }
}
