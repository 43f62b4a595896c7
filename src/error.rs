//! # LoRaWAN Network Server Error Handling
//!
//! This module defines the crate-level [`LnsError`] enum together with the
//! smaller error types of the frame codec, region tables and persistence
//! layer. Pipeline outcomes reported to the transport layer use
//! [`crate::processing::FailedReason`] instead; these types cover
//! configuration, I/O and collaborator failures.

use crate::lorawan::crypto::CryptoError;
use crate::util::hex::HexError;
use thiserror::Error;

/// Errors raised while parsing a LoRaWAN PHYPayload or MAC command list.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The frame is shorter than the smallest valid frame of its type.
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// The MHDR announces a LoRaWAN major version this server does not speak.
    #[error("Unsupported LoRaWAN major version: {0}")]
    UnsupportedMajor(u8),

    /// The message type is valid LoRaWAN but not handled by this core.
    #[error("Unsupported message type: 0x{0:02X}")]
    UnsupportedMessageType(u8),

    /// A structurally invalid frame (e.g. FOpts together with FPort 0).
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

/// Errors raised by a [`crate::region::Region`] lookup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("Data rate DR{0} is not supported by region {1}")]
    UnsupportedDataRate(u8, &'static str),

    #[error("Frequency {0} Hz is outside the band of region {1}")]
    FrequencyOutOfBand(u32, &'static str),

    #[error("RX1 data rate offset {0} is not allowed")]
    InvalidRx1Offset(u8),
}

/// Errors raised by a [`crate::session::store::SessionStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The connection to the backing store could not be (re)established.
    #[error("Store connection unavailable: {0}")]
    ConnectionUnavailable(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while loading or validating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Represents the different error types that can occur in the network server core.
#[derive(Debug, Error)]
pub enum LnsError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Region error: {0}")]
    Region(#[from] RegionError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Decoder error: {0}")]
    Decoder(#[from] crate::decoder::DecodeError),

    #[error("Hex error: {0}")]
    Hex(#[from] HexError),

    /// A device with the same DevEUI is already registered.
    #[error("Device {0} is already registered")]
    DuplicateDevice(String),

    /// A catch-all error for uncategorized cases.
    #[error("Other error: {0}")]
    Other(String),
}
