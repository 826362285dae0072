//! CLI configuration module
//!
//! Turns parsed arguments and the optional JSON settings file into a
//! validated run configuration.

use anyhow::{Context, Result};

use crate::cli::args::{CliArgs, Command};
use crate::config::TrackerConfig;
use crate::hash::{InfoHash, PeerId};
use crate::tracker::wire::MAX_SCRAPE_HASHES;
use crate::tracker::{AnnounceParams, TrackerUrl};

/// What the run should do
#[derive(Debug, Clone)]
pub enum Operation {
    Announce {
        tracker_url: String,
        params: AnnounceParams,
    },
    Scrape {
        tracker_url: String,
        info_hashes: Vec<InfoHash>,
    },
}

impl Operation {
    pub fn tracker_url(&self) -> &str {
        match self {
            Operation::Announce { tracker_url, .. } | Operation::Scrape { tracker_url, .. } => {
                tracker_url
            }
        }
    }
}

/// Configuration for one CLI run
#[derive(Debug, Clone)]
pub struct Config {
    /// Tracker timing and socket settings
    pub tracker: TrackerConfig,
    pub operation: Operation,
    /// Verbose output
    pub verbose: bool,
    /// Quiet mode
    pub quiet: bool,
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let tracker = match &args.config {
            Some(path) => TrackerConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config file {}", path.display()))?,
            None => TrackerConfig::default(),
        };

        let operation = match &args.command {
            Command::Announce {
                tracker,
                info_hash,
                port,
                num_want,
                event,
                left,
                downloaded,
                uploaded,
            } => {
                let info_hash = InfoHash::from_hex(info_hash).context("Invalid info hash")?;
                let mut params = AnnounceParams::new(info_hash, PeerId::generate(), *port);
                params.num_want = *num_want;
                params.event = (*event).into();
                params.left = *left;
                params.downloaded = *downloaded;
                params.uploaded = *uploaded;
                Operation::Announce {
                    tracker_url: tracker.clone(),
                    params,
                }
            }
            Command::Scrape {
                tracker,
                info_hashes,
            } => {
                let info_hashes = info_hashes
                    .iter()
                    .map(|hex_str| InfoHash::from_hex(hex_str))
                    .collect::<crate::error::Result<Vec<_>>>()
                    .context("Invalid info hash")?;
                Operation::Scrape {
                    tracker_url: tracker.clone(),
                    info_hashes,
                }
            }
        };

        Ok(Self {
            tracker,
            operation,
            verbose: args.verbose,
            quiet: args.quiet,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        TrackerUrl::parse(self.operation.tracker_url())?;

        match &self.operation {
            Operation::Announce { params, .. } => {
                if params.port == 0 {
                    return Err(anyhow::anyhow!("Port cannot be 0"));
                }
                if params.num_want < -1 {
                    return Err(anyhow::anyhow!("num_want must be -1 or more"));
                }
            }
            Operation::Scrape { info_hashes, .. } => {
                if info_hashes.len() > MAX_SCRAPE_HASHES {
                    return Err(anyhow::anyhow!(
                        "At most {} info hashes per scrape",
                        MAX_SCRAPE_HASHES
                    ));
                }
            }
        }

        Ok(())
    }

    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Check if quiet mode is enabled
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}
