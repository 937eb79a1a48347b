use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Ding CI server - self-hosted continuous integration
#[derive(Parser, Debug)]
#[command(name = "dingd")]
#[command(version = ding_core::VERSION)]
#[command(about = "Ding CI server daemon", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Default)]
pub enum Commands {
    /// Start the server in the foreground (default if no command given).
    /// With isolation disabled this is the whole process; with isolation
    /// enabled it becomes the privileged root process that forks/execs a
    /// `serve-http` worker dropped to the configured build identity.
    #[default]
    Serve,

    /// Worker entry point used internally for the root/worker fork-exec
    /// handoff; serves the HTTP surface under the uid the root assigned it.
    #[command(hide = true)]
    ServeHttp,

    /// Install as system service (requires root/sudo)
    Install {
        /// Environment file path (default: /etc/ding/ding.env)
        #[arg(long)]
        env_file: Option<PathBuf>,

        /// Force reinstall even if already installed
        #[arg(long, short)]
        force: bool,
    },

    /// Uninstall system service (requires root/sudo)
    Uninstall {
        /// Also remove data, logs, and configuration
        #[arg(long)]
        purge: bool,
    },

    /// Start the service (requires root/sudo)
    Start,

    /// Stop the service (requires root/sudo)
    Stop,

    /// Restart the service (requires root/sudo)
    Restart,

    /// Show service status
    Status,

    /// View service logs
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,

        /// Follow log output (tail -f)
        #[arg(short, long)]
        follow: bool,
    },
}
