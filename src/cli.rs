use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a scheduler node until interrupted (default)
    Serve,
    /// Database migration commands
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Move old terminal executions to history once and exit
    Archive,
    /// Show version information
    Version,
}

#[derive(Subcommand)]
pub enum MigrateAction {
    /// Apply pending scheduler migrations
    Up {
        /// Apply at most this many (default: all pending)
        #[arg(short, long)]
        steps: Option<u32>,
    },
    /// Revert the most recent migrations
    Down {
        /// How many to revert
        #[arg(short, long, default_value_t = 1)]
        steps: u32,
    },
    /// List applied and pending migrations
    Status,
    /// Drop every scheduler table, then migrate up again
    Reset,
    /// Revert and re-apply the most recent migrations
    Reapply {
        /// How many to re-apply
        #[arg(short, long, default_value_t = 1)]
        steps: u32,
    },
}
