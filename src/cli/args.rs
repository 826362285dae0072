//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::tracker::AnnounceEvent;

/// CLI arguments for the tracker client
#[derive(Debug, Parser)]
#[command(name = "piece-tracker")]
#[command(about = "Talk to UDP BitTorrent trackers", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// JSON file with tracker timing and socket settings
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Announce an info hash and print the peers the tracker returns
    Announce {
        /// Tracker URL, e.g. udp://tracker.example.org:1337/announce
        #[arg(value_name = "TRACKER_URL")]
        tracker: String,

        /// Info hash as 40 hex characters
        #[arg(value_name = "INFO_HASH")]
        info_hash: String,

        /// Port to announce
        #[arg(short, long, default_value_t = 6881)]
        port: u16,

        /// Number of peers wanted (-1 = tracker default)
        #[arg(short, long, default_value_t = -1, allow_negative_numbers = true)]
        num_want: i32,

        /// Announce event
        #[arg(short, long, value_enum, default_value_t = EventArg::Started)]
        event: EventArg,

        /// Bytes left to download
        #[arg(long, default_value_t = 0)]
        left: u64,

        /// Bytes downloaded so far
        #[arg(long, default_value_t = 0)]
        downloaded: u64,

        /// Bytes uploaded so far
        #[arg(long, default_value_t = 0)]
        uploaded: u64,
    },

    /// Print seeders, completed and leechers for info hashes
    Scrape {
        /// Tracker URL
        #[arg(value_name = "TRACKER_URL")]
        tracker: String,

        /// Info hashes as 40 hex characters each
        #[arg(value_name = "INFO_HASH", required = true)]
        info_hashes: Vec<String>,
    },
}

/// Announce event as typed on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    None,
    Completed,
    Started,
    Stopped,
}

impl From<EventArg> for AnnounceEvent {
    fn from(event: EventArg) -> Self {
        match event {
            EventArg::None => AnnounceEvent::None,
            EventArg::Completed => AnnounceEvent::Completed,
            EventArg::Started => AnnounceEvent::Started,
            EventArg::Stopped => AnnounceEvent::Stopped,
        }
    }
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
