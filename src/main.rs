//! Mount a tree of composed storage backends as one filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, error, info};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("VERGEN_GIT_SHA"), ")"),
    about = "A FUSE filesystem composed from RAID, cache, encryption and replica layers."
)]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a mount0 config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Spawn the filesystem as a daemon process.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,
    },

    /// Load and validate the configuration, then print the mapped paths.
    Check,
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();
    let command = args.command.unwrap_or(Command::Run { daemonize: false });

    let trc = match command {
        Command::Run { daemonize: true } => Trc::daemon(),
        Command::Run { daemonize: false } | Command::Check => Trc::foreground(),
    };
    if let Err(e) = trc.init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }

    let config = Config::load_or_default(args.config_path.as_deref()).unwrap_or_else(|e| {
        error!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        error!("Configuration is invalid.");
        for msg in &error_messages {
            error!(" - {msg}");
        }
        std::process::exit(1);
    }

    match command {
        Command::Check => match config.mount.build() {
            Ok(router) => {
                for path in router.mount_paths() {
                    info!(path = %path.display(), "Mapped.");
                }
            }
            Err(e) => {
                error!("{e}");
                std::process::exit(1);
            }
        },
        Command::Run { daemonize } => {
            if let Err(e) = fuse_check::ensure_fuse() {
                error!("{e}");
                std::process::exit(1);
            }
            let result = if daemonize {
                detach(config)
            } else {
                daemon::spawn(config).map_err(|e| format!("Daemon failed: {e}"))
            };
            if let Err(e) = result {
                error!("{e}");
                std::process::exit(1);
            }
        }
    }
}

/// Fork into the background, write the pid file and serve from the child.
fn detach(config: Config) -> Result<(), String> {
    debug!(config = ?config, "Initializing daemon with configuration...");
    let pid_dir = config
        .daemon
        .pid_file
        .parent()
        .ok_or("pid file has no parent directory")?;
    std::fs::create_dir_all(pid_dir)
        .map_err(|e| format!("Failed to create PID file directory: {e}"))?;

    let mut daemonizer = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid);
    if let Some(log) = config
        .daemon
        .open_log_file()
        .map_err(|e| format!("Failed to open log file: {e}"))?
    {
        let err = log
            .try_clone()
            .map_err(|e| format!("Failed to clone log file handle: {e}"))?;
        daemonizer = daemonizer.stdout(log).stderr(err);
    }

    daemonizer
        .start()
        .map_err(|e| format!("Failed to spawn the daemon: {e}"))?;
    daemon::spawn(config).map_err(|e| format!("Daemon failed: {e}"))
}
