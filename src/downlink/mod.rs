//! # Downlink Assembly
//!
//! Picks the receive window, computes the payload budget for its data rate
//! and fills it: MAC answers first, then an ADR command, then the pending
//! application message if it still fits.

pub mod builder;

pub use builder::{BuiltDownlink, DownlinkBuilder, DownlinkContext};

use crate::error::{FrameError, RegionError};
use serde::Serialize;
use thiserror::Error;

/// MHDR, FHDR without options, FPort and MIC.
pub const DOWNLINK_OVERHEAD: usize = 13;

/// What happened to a pending application message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AppDisposition {
    /// Sent in this downlink.
    Included,
    /// Fits the data rate but not next to this downlink's MAC commands.
    Deferred,
    /// Larger than the data rate allows.
    TooLong,
    /// Uses a port applications may not send on.
    Rejected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownlinkError {
    #[error("No receive window can be reached in time")]
    ReceiveWindowMissed,

    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}
