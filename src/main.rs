//! piece-tracker - Main entry point
//!
//! Announces to or scrapes a UDP tracker and prints what it returns.

use anyhow::{Context, Result};
use piece_tracker::cli::Operation;
use piece_tracker::{
    AnnounceParams, CliArgs, Config, InfoHash, TrackerConfig, TrackerSession,
};
use tracing::{debug, error, info};

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up panic handler
    setup_panic_handler();

    // Parse CLI arguments
    let args = CliArgs::parse_args();

    // Initialize logging
    init_logging(&args);
    info!("piece-tracker starting");
    debug!("CLI arguments: {:?}", args);

    // Create configuration
    let config = Config::from_args(&args).context("Failed to build configuration")?;

    // Validate configuration
    config.validate().context("Invalid configuration")?;

    let result = match &config.operation {
        Operation::Announce {
            tracker_url,
            params,
        } => run_announce(&config.tracker, tracker_url, params, config.is_quiet()).await,
        Operation::Scrape {
            tracker_url,
            info_hashes,
        } => run_scrape(&config.tracker, tracker_url, info_hashes, config.is_quiet()).await,
    };

    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

/// Initialize logging based on CLI arguments
fn init_logging(args: &CliArgs) {
    let level = args.log_level();

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }

    debug!("Logging initialized with level {:?}", level);
}

async fn run_announce(
    tracker: &TrackerConfig,
    tracker_url: &str,
    params: &AnnounceParams,
    quiet: bool,
) -> Result<()> {
    let session = TrackerSession::bind(tracker_url, tracker)
        .await
        .with_context(|| format!("Failed to set up session for {}", tracker_url))?;
    let response = session
        .announce(params)
        .await
        .with_context(|| format!("Announce to {} failed", tracker_url))?;

    if !quiet {
        println!("Tracker: {} ({})", tracker_url, session.tracker_addr());
        println!("  Info hash: {}", params.info_hash);
        println!("  Interval: {}s", response.interval);
        println!("  Seeders: {}", response.seeders);
        println!("  Leechers: {}", response.leechers);
        println!("  Peers: {}", response.peers.len());
        for peer in &response.peers {
            println!("    {}", peer.socket_addr());
        }
    }
    Ok(())
}

async fn run_scrape(
    tracker: &TrackerConfig,
    tracker_url: &str,
    info_hashes: &[InfoHash],
    quiet: bool,
) -> Result<()> {
    let session = TrackerSession::bind(tracker_url, tracker)
        .await
        .with_context(|| format!("Failed to set up session for {}", tracker_url))?;
    let stats = session
        .scrape(info_hashes)
        .await
        .with_context(|| format!("Scrape of {} failed", tracker_url))?;

    if !quiet {
        println!("Tracker: {} ({})", tracker_url, session.tracker_addr());
        for (info_hash, stats) in info_hashes.iter().zip(&stats) {
            println!(
                "  {}  seeders {}  completed {}  leechers {}",
                info_hash, stats.seeders, stats.completed, stats.leechers
            );
        }
    }
    Ok(())
}
