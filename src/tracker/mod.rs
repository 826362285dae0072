//! UDP tracker client
//!
//! Wire format, retry policy, transaction dispatch and the per-tracker
//! session that ties them together.

pub mod backoff;
pub mod dispatch;
pub mod session;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use backoff::RetryPolicy;
pub use dispatch::{Dispatcher, Inbound, Pending};
pub use session::{AnnounceParams, TrackerSession, TrackerUrl};
pub use transport::Transport;
pub use wire::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, CompactPeer, ScrapeStats, Wire,
};
