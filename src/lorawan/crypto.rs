//! # LoRaWAN 1.0.x Cryptography
//!
//! AES-128 primitives for the network server side of LoRaWAN 1.0.x:
//!
//! - **MIC**: AES-CMAC over the `B0` block and the frame (data frames) or over
//!   the frame alone with the AppKey (join request / join accept)
//! - **FRMPayload**: AES keystream built from the `A_i` blocks
//! - **Join**: session key derivation from AppKey, AppNonce, NetID and DevNonce,
//!   and join-accept encryption (which uses the AES *decrypt* operation)

use super::{AesKey, AppNonce, DevAddr, DevNonce, NetId};
use aes::Aes128;
use cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use cmac::{Cmac, Mac};
use thiserror::Error;

/// Key material errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key hex: {0}")]
    InvalidKeyHex(String),

    #[error("Invalid data length: must be multiple of {block_size}, got {actual}")]
    InvalidDataLength { block_size: usize, actual: usize },
}

/// Frame direction as encoded in the `B0`/`A_i` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

/// Network and application session keys, fixed between two joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub nwk_s_key: AesKey,
    pub app_s_key: AesKey,
}

fn block_cipher(key: &AesKey) -> Aes128 {
    Aes128::new(GenericArray::from_slice(key.as_bytes()))
}

/// Encrypt a single 16-byte block in place.
pub fn aes128_encrypt_block(key: &AesKey, block: &mut [u8; 16]) {
    let mut b = GenericArray::clone_from_slice(block);
    block_cipher(key).encrypt_block(&mut b);
    block.copy_from_slice(&b);
}

/// Decrypt a single 16-byte block in place.
pub fn aes128_decrypt_block(key: &AesKey, block: &mut [u8; 16]) {
    let mut b = GenericArray::clone_from_slice(block);
    block_cipher(key).decrypt_block(&mut b);
    block.copy_from_slice(&b);
}

/// Full 16-byte AES-CMAC tag.
pub fn aes_cmac(key: &AesKey, parts: &[&[u8]]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key.as_bytes()));
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut out = [0u8; 16];
    out.copy_from_slice(&tag);
    out
}

fn frame_block(first: u8, dir: Direction, dev_addr: DevAddr, fcnt: u32, last: u8) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = first;
    block[5] = dir as u8;
    block[6..10].copy_from_slice(&dev_addr.to_le_bytes());
    block[10..14].copy_from_slice(&fcnt.to_le_bytes());
    block[15] = last;
    block
}

/// MIC of a data frame; `msg` is `MHDR | FHDR | FPort | FRMPayload`.
pub fn compute_data_mic(
    key: &AesKey,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    msg: &[u8],
) -> [u8; 4] {
    let b0 = frame_block(0x49, dir, dev_addr, fcnt, msg.len() as u8);
    let tag = aes_cmac(key, &[&b0, msg]);
    [tag[0], tag[1], tag[2], tag[3]]
}

/// MIC of a join request or join accept; `msg` starts with the MHDR.
pub fn compute_join_mic(key: &AesKey, msg: &[u8]) -> [u8; 4] {
    let tag = aes_cmac(key, &[msg]);
    [tag[0], tag[1], tag[2], tag[3]]
}

/// Encrypt or decrypt a FRMPayload (the operation is its own inverse).
pub fn crypt_frm_payload(
    key: &AesKey,
    dir: Direction,
    dev_addr: DevAddr,
    fcnt: u32,
    payload: &[u8],
) -> Vec<u8> {
    let aes = block_cipher(key);
    let mut out = Vec::with_capacity(payload.len());

    for (i, chunk) in payload.chunks(16).enumerate() {
        let a = frame_block(0x01, dir, dev_addr, fcnt, (i + 1) as u8);
        let mut s = GenericArray::clone_from_slice(&a);
        aes.encrypt_block(&mut s);
        out.extend(chunk.iter().zip(s.iter()).map(|(p, k)| p ^ k));
    }

    out
}

/// Derive NwkSKey and AppSKey after a successful join.
pub fn derive_session_keys(
    app_key: &AesKey,
    app_nonce: AppNonce,
    net_id: NetId,
    dev_nonce: DevNonce,
) -> SessionKeys {
    let derive = |prefix: u8| {
        let mut block = [0u8; 16];
        block[0] = prefix;
        block[1..4].copy_from_slice(&app_nonce.0.to_le_bytes()[..3]);
        block[4..7].copy_from_slice(&net_id.0.to_le_bytes()[..3]);
        block[7..9].copy_from_slice(&dev_nonce.0.to_le_bytes());
        aes128_encrypt_block(app_key, &mut block);
        AesKey::new(block)
    };

    SessionKeys {
        nwk_s_key: derive(0x01),
        app_s_key: derive(0x02),
    }
}

/// Encrypt a join-accept body (everything after the MHDR, MIC included).
///
/// LoRaWAN 1.0.x applies AES *decrypt* here so the device only needs the
/// encrypt primitive to recover it.
pub fn encrypt_join_accept(app_key: &AesKey, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    process_blocks(body, |block| aes128_decrypt_block(app_key, block))
}

/// Inverse of [`encrypt_join_accept`], as performed by the device.
pub fn decrypt_join_accept(app_key: &AesKey, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
    process_blocks(body, |block| aes128_encrypt_block(app_key, block))
}

fn process_blocks(data: &[u8], mut op: impl FnMut(&mut [u8; 16])) -> Result<Vec<u8>, CryptoError> {
    if data.is_empty() || data.len() % 16 != 0 {
        return Err(CryptoError::InvalidDataLength {
            block_size: 16,
            actual: data.len(),
        });
    }

    let mut out = Vec::with_capacity(data.len());
    for chunk in data.chunks_exact(16) {
        let mut block = [0u8; 16];
        block.copy_from_slice(chunk);
        op(&mut block);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex_str: &str) -> AesKey {
        AesKey::from_hex(hex_str).unwrap()
    }

    #[test]
    fn test_aes_fips197_vector() {
        let k = key("000102030405060708090A0B0C0D0E0F");
        let mut block: [u8; 16] = hex::decode("00112233445566778899aabbccddeeff")
            .unwrap()
            .try_into()
            .unwrap();
        aes128_encrypt_block(&k, &mut block);
        assert_eq!(hex::encode(block), "69c4e0d86a7b0430d8cdb78070b4c55a");
        aes128_decrypt_block(&k, &mut block);
        assert_eq!(hex::encode(block), "00112233445566778899aabbccddeeff");
    }

    #[test]
    fn test_cmac_rfc4493_vectors() {
        let k = key("2B7E151628AED2A6ABF7158809CF4F3C");
        assert_eq!(hex::encode(aes_cmac(&k, &[])), "bb1d6929e95937287fa37d129b756746");
        let msg = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
        assert_eq!(hex::encode(aes_cmac(&k, &[&msg])), "070a16b46b4d4144f79bdd9dd04a287c");
        // Split input must give the same tag
        assert_eq!(aes_cmac(&k, &[&msg[..5], &msg[5..]]), aes_cmac(&k, &[&msg]));
    }

    #[test]
    fn test_frm_payload_is_involution() {
        let k = key("2B7E151628AED2A6ABF7158809CF4F3C");
        let plain = b"a payload longer than one AES block".to_vec();
        let enc = crypt_frm_payload(&k, Direction::Up, DevAddr(0x2601_1BDA), 7, &plain);
        assert_ne!(enc, plain);
        assert_eq!(enc.len(), plain.len());
        let dec = crypt_frm_payload(&k, Direction::Up, DevAddr(0x2601_1BDA), 7, &enc);
        assert_eq!(dec, plain);
    }

    #[test]
    fn test_data_mic_depends_on_counter_and_direction() {
        let k = key("2B7E151628AED2A6ABF7158809CF4F3C");
        let msg = [0x40, 0xDA, 0x1B, 0x01, 0x26, 0x00, 0x01, 0x00];
        let a = compute_data_mic(&k, Direction::Up, DevAddr(0x2601_1BDA), 1, &msg);
        let b = compute_data_mic(&k, Direction::Up, DevAddr(0x2601_1BDA), 0x0001_0001, &msg);
        let c = compute_data_mic(&k, Direction::Down, DevAddr(0x2601_1BDA), 1, &msg);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_session_keys_differ_per_nonce() {
        let app_key = key("000102030405060708090A0B0C0D0E0F");
        let k1 = derive_session_keys(&app_key, AppNonce(0x123456), NetId(0x13), DevNonce(1));
        let k2 = derive_session_keys(&app_key, AppNonce(0x123456), NetId(0x13), DevNonce(2));
        assert_ne!(k1.nwk_s_key, k1.app_s_key);
        assert_ne!(k1.nwk_s_key, k2.nwk_s_key);
    }

    #[test]
    fn test_join_accept_round_trip() {
        let app_key = key("000102030405060708090A0B0C0D0E0F");
        let body = [0xA5u8; 16];
        let enc = encrypt_join_accept(&app_key, &body).unwrap();
        assert_eq!(decrypt_join_accept(&app_key, &enc).unwrap(), body.to_vec());
        assert!(matches!(
            encrypt_join_accept(&app_key, &[0u8; 17]),
            Err(CryptoError::InvalidDataLength { .. })
        ));
    }
}
