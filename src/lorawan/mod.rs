//! # LoRaWAN Frame Layer
//!
//! Identifiers, key material, the PHYPayload codec, LoRaWAN 1.0.x crypto and
//! MAC commands. Everything above this module works with these typed values
//! rather than raw byte slices.

pub mod crypto;
pub mod frame;
pub mod mac;

use crate::util::hex::{decode_fixed, HexError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use crypto::{CryptoError, Direction, SessionKeys};
pub use frame::{parse_phy_payload, DataFrame, FCtrl, JoinRequestFrame, MType, PhyPayload};
pub use mac::{DownlinkMacCommand, UplinkMacCommand};

/// 64-bit extended unique identifier (DevEUI, JoinEUI, station EUI).
///
/// Printed and configured most-significant byte first; transmitted
/// little-endian on the air.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Eui64(pub u64);

pub type DevEui = Eui64;
pub type JoinEui = Eui64;
pub type StationEui = Eui64;

impl Eui64 {
    pub fn from_hex(hex_str: &str) -> Result<Self, HexError> {
        Ok(Self(u64::from_be_bytes(decode_fixed::<8>(hex_str)?)))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Debug for Eui64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Serialize for Eui64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Eui64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// 32-bit device address assigned at activation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevAddr(pub u32);

impl DevAddr {
    pub fn from_hex(hex_str: &str) -> Result<Self, HexError> {
        Ok(Self(u32::from_be_bytes(decode_fixed::<4>(hex_str)?)))
    }

    /// Build an address inside the network identified by `net_id` (NetID type 0:
    /// the 7 NwkID bits occupy the address MSBs).
    pub fn from_nwk_id(net_id: NetId, nwk_addr: u32) -> Self {
        let nwk_id = net_id.0 & 0x7F;
        Self((nwk_id << 25) | (nwk_addr & 0x01FF_FFFF))
    }

    pub fn nwk_id(self) -> u8 {
        (self.0 >> 25) as u8
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl Serialize for DevAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DevAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// 24-bit network identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetId(pub u32);

/// LoRaWAN data rate index (DR0..DR15).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataRate(pub u8);

impl fmt::Display for DataRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DR{}", self.0)
    }
}

/// Nonce chosen by the device for each join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevNonce(pub u16);

/// 24-bit nonce chosen by the server for each join accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppNonce(pub u32);

/// AES-128 key (AppKey, NwkSKey, AppSKey); wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AesKey([u8; 16]);

impl AesKey {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Create AES key from a byte slice
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; 16] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 16,
            actual: bytes.len(),
        })?;
        Ok(Self(key))
    }

    /// Create AES key from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, CryptoError> {
        decode_fixed::<16>(hex_str)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKeyHex(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AesKey(***)")
    }
}

impl Serialize for AesKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode_upper(self.0))
    }
}

impl<'de> Deserialize<'de> for AesKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
