use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sipatrol")]
#[command(about = "SiPatrol field shell: capture incident reports offline and sync them later", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "SIPATROL_JSON_LOGS")]
    pub json_logs: bool,

    /// Config file (default: ~/.config/sipatrol/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Queue a new incident report
    Capture {
        /// JPEG, PNG or WebP photo
        #[arg(long)]
        photo: PathBuf,

        /// Latitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,

        /// Longitude in degrees
        #[arg(long, allow_negative_numbers = true)]
        lon: f64,

        #[arg(long)]
        notes: Option<String>,

        /// RFC 3339 capture time (default: now)
        #[arg(long)]
        captured_at: Option<String>,
    },

    /// Show queued reports, oldest capture first
    List {
        #[arg(long)]
        json: bool,

        /// Only reports that will not be retried automatically
        #[arg(long)]
        attention: bool,
    },

    /// Queue and connectivity summary
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Deliver queued reports now
    Sync,

    /// Reset a stuck report so it is delivered again
    Retry {
        /// Local report id
        id: String,
    },

    /// Drop a report the server keeps rejecting
    Discard {
        /// Local report id
        id: String,
    },

    /// Stay in the foreground: probe connectivity and sync until Ctrl-C
    Run,
}
