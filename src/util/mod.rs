//! # Utility Modules
//!
//! Hex helpers for keys and identifiers, and rate-limited logging.

pub mod hex;
pub mod throttle;

pub use hex::{decode_fixed, decode_hex, encode_hex_upper, HexError};
pub use throttle::{log_frame_hex, LogThrottle};
