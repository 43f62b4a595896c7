//! # Application Payload Decoders
//!
//! Devices name a decoder in their provisioning record. Names are resolved
//! against a [`DecoderRegistry`] once, when the device is provisioned, so an
//! unknown name is a configuration error rather than a per-uplink failure.

use crate::lorawan::DevEui;
use crate::transport::ApplicationDownlink;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while decoding an application payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown decoder: {0}")]
    UnknownDecoder(String),

    #[error("{decoder} cannot decode payload: {reason}")]
    InvalidPayload { decoder: String, reason: String },
}

/// Decoded application payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub value: Value,
    /// Reply to send back to the device in this uplink's receive window
    pub reply: Option<ApplicationDownlink>,
}

impl DecodedPayload {
    pub fn value(value: Value) -> Self {
        Self { value, reply: None }
    }
}

/// Application payload decoder
pub trait PayloadDecoder: Send + Sync + std::fmt::Debug {
    /// Name used in device provisioning
    fn name(&self) -> &str;

    /// Decode a decrypted FRMPayload received on `fport`
    fn decode(&self, dev_eui: DevEui, payload: &[u8], fport: u8) -> Result<DecodedPayload, DecodeError>;
}

/// Hex dump of the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawHexDecoder;

impl PayloadDecoder for RawHexDecoder {
    fn name(&self) -> &str {
        "raw_hex"
    }

    fn decode(&self, _dev_eui: DevEui, payload: &[u8], fport: u8) -> Result<DecodedPayload, DecodeError> {
        Ok(DecodedPayload::value(json!({
            "fport": fport,
            "hex": hex::encode_upper(payload),
        })))
    }
}

/// ASCII-encoded number, e.g. `b"21.5"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValueSensorDecoder;

impl PayloadDecoder for ValueSensorDecoder {
    fn name(&self) -> &str {
        "value_sensor"
    }

    fn decode(&self, _dev_eui: DevEui, payload: &[u8], _fport: u8) -> Result<DecodedPayload, DecodeError> {
        let invalid = |reason: String| DecodeError::InvalidPayload {
            decoder: self.name().to_string(),
            reason,
        };
        let text = std::str::from_utf8(payload).map_err(|e| invalid(e.to_string()))?;
        let value: f64 = text.trim().parse().map_err(|_| invalid(format!("not a number: {text:?}")))?;
        Ok(DecodedPayload::value(json!({ "value": value })))
    }
}

/// Little-endian u32 pulse counter.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterDecoder;

impl PayloadDecoder for CounterDecoder {
    fn name(&self) -> &str {
        "counter"
    }

    fn decode(&self, _dev_eui: DevEui, payload: &[u8], _fport: u8) -> Result<DecodedPayload, DecodeError> {
        let bytes: [u8; 4] = payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| DecodeError::InvalidPayload {
                decoder: self.name().to_string(),
                reason: format!("need 4 bytes, got {}", payload.len()),
            })?;
        Ok(DecodedPayload::value(json!({ "counter": u32::from_le_bytes(bytes) })))
    }
}

/// Decoders by name.
#[derive(Debug, Clone, Default)]
pub struct DecoderRegistry {
    decoders: HashMap<String, Arc<dyn PayloadDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in decoders.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RawHexDecoder));
        registry.register(Arc::new(ValueSensorDecoder));
        registry.register(Arc::new(CounterDecoder));
        registry
    }

    /// Add or replace a decoder under its own name.
    pub fn register(&mut self, decoder: Arc<dyn PayloadDecoder>) {
        self.decoders.insert(decoder.name().to_string(), decoder);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn PayloadDecoder>, DecodeError> {
        self.decoders
            .get(name)
            .cloned()
            .ok_or_else(|| DecodeError::UnknownDecoder(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorawan::Eui64;

    #[test]
    fn test_builtins_resolve() {
        let registry = DecoderRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["counter", "raw_hex", "value_sensor"]);
        assert_eq!(
            registry.resolve("nope").unwrap_err(),
            DecodeError::UnknownDecoder("nope".to_string())
        );
    }

    #[test]
    fn test_value_sensor() {
        let decoded = ValueSensorDecoder.decode(Eui64(1), b" 21.5 ", 1).unwrap();
        assert_eq!(decoded.value, json!({ "value": 21.5 }));
        assert!(decoded.reply.is_none());
        assert!(ValueSensorDecoder.decode(Eui64(1), b"warm", 1).is_err());
    }

    #[test]
    fn test_counter() {
        let decoded = CounterDecoder.decode(Eui64(1), &[0x10, 0x27, 0, 0], 2).unwrap();
        assert_eq!(decoded.value, json!({ "counter": 10000 }));
        assert!(CounterDecoder.decode(Eui64(1), &[1, 2], 2).is_err());
    }

    #[test]
    fn test_raw_hex() {
        let decoded = RawHexDecoder.decode(Eui64(1), &[0xAB, 0x01], 9).unwrap();
        assert_eq!(decoded.value, json!({ "fport": 9, "hex": "AB01" }));
    }
}
