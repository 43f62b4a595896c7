//! # LoRaWAN PHYPayload Codec
//!
//! Parses uplink data frames and join requests, and encodes downlink data
//! frames and join accepts. Layout (LoRaWAN 1.0.x):
//!
//! ```text
//! PHYPayload = MHDR | MACPayload | MIC
//! MACPayload = FHDR | [FPort | FRMPayload]
//! FHDR       = DevAddr(4, LE) | FCtrl(1) | FCnt(2, LE) | FOpts(0..15)
//! JoinReq    = JoinEUI(8, LE) | DevEUI(8, LE) | DevNonce(2, LE)
//! ```

use super::crypto::{self, Direction, SessionKeys};
use super::{AesKey, AppNonce, DevAddr, DevNonce, Eui64, NetId};
use crate::error::FrameError;
use bitflags::bitflags;
use bytes::{BufMut, BytesMut};
use nom::{
    bytes::complete::take,
    number::complete::{le_u16, le_u32, le_u64, u8 as parse_u8},
    IResult,
};

/// Length of the message integrity code trailer
pub const MIC_LEN: usize = 4;
/// Largest FOpts field that fits the 4-bit FOptsLen
pub const MAX_FOPTS_LEN: usize = 15;
/// MHDR + FHDR without options
const MIN_DATA_FRAME_LEN: usize = 1 + 7 + MIC_LEN;
const JOIN_REQUEST_LEN: usize = 1 + 18 + MIC_LEN;

/// Message type carried in the top three MHDR bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MType {
    JoinRequest,
    JoinAccept,
    UnconfirmedDataUp,
    UnconfirmedDataDown,
    ConfirmedDataUp,
    ConfirmedDataDown,
    RejoinRequest,
    Proprietary,
}

impl MType {
    pub fn from_mhdr(mhdr: u8) -> Self {
        match mhdr >> 5 {
            0 => Self::JoinRequest,
            1 => Self::JoinAccept,
            2 => Self::UnconfirmedDataUp,
            3 => Self::UnconfirmedDataDown,
            4 => Self::ConfirmedDataUp,
            5 => Self::ConfirmedDataDown,
            6 => Self::RejoinRequest,
            _ => Self::Proprietary,
        }
    }

    /// MHDR byte for this type with LoRaWAN R1 major version.
    pub fn mhdr(self) -> u8 {
        let bits = match self {
            Self::JoinRequest => 0,
            Self::JoinAccept => 1,
            Self::UnconfirmedDataUp => 2,
            Self::UnconfirmedDataDown => 3,
            Self::ConfirmedDataUp => 4,
            Self::ConfirmedDataDown => 5,
            Self::RejoinRequest => 6,
            Self::Proprietary => 7,
        };
        bits << 5
    }

    pub fn is_confirmed(self) -> bool {
        matches!(self, Self::ConfirmedDataUp | Self::ConfirmedDataDown)
    }

    pub fn is_data_uplink(self) -> bool {
        matches!(self, Self::UnconfirmedDataUp | Self::ConfirmedDataUp)
    }
}

bitflags! {
    /// Frame control flags; the low nibble carries FOptsLen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FCtrl: u8 {
        const ADR = 0x80;
        /// Uplink only
        const ADR_ACK_REQ = 0x40;
        const ACK = 0x20;
        /// Downlink: more data pending. Uplink: class B enabled.
        const FPENDING = 0x10;
    }
}

impl FCtrl {
    pub fn fopts_len(self) -> usize {
        (self.bits() & 0x0F) as usize
    }
}

/// Parsed data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub mtype: MType,
    pub dev_addr: DevAddr,
    pub fctrl: FCtrl,
    /// 16-bit counter as transmitted
    pub fcnt: u16,
    pub fopts: Vec<u8>,
    pub fport: Option<u8>,
    /// Still encrypted
    pub frm_payload: Vec<u8>,
    pub mic: [u8; 4],
    raw: Vec<u8>,
}

impl DataFrame {
    pub fn is_confirmed(&self) -> bool {
        self.mtype.is_confirmed()
    }

    pub fn adr(&self) -> bool {
        self.fctrl.contains(FCtrl::ADR)
    }

    pub fn adr_ack_requested(&self) -> bool {
        self.fctrl.contains(FCtrl::ADR_ACK_REQ)
    }

    /// Bytes covered by the MIC (everything but the MIC itself).
    pub fn mic_input(&self) -> &[u8] {
        &self.raw[..self.raw.len() - MIC_LEN]
    }

    /// Check the MIC against `nwk_s_key` using the inferred 32-bit counter.
    pub fn verify_mic(&self, nwk_s_key: &AesKey, fcnt32: u32) -> bool {
        crypto::compute_data_mic(nwk_s_key, Direction::Up, self.dev_addr, fcnt32, self.mic_input())
            == self.mic
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Parsed join request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequestFrame {
    pub join_eui: Eui64,
    pub dev_eui: Eui64,
    pub dev_nonce: DevNonce,
    pub mic: [u8; 4],
    raw: Vec<u8>,
}

impl JoinRequestFrame {
    pub fn verify_mic(&self, app_key: &AesKey) -> bool {
        crypto::compute_join_mic(app_key, &self.raw[..self.raw.len() - MIC_LEN]) == self.mic
    }
}

/// Frames an uplink can carry into this core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyPayload {
    JoinRequest(JoinRequestFrame),
    Data(DataFrame),
}

fn fhdr(input: &[u8]) -> IResult<&[u8], (u32, u8, u16, &[u8])> {
    let (input, dev_addr) = le_u32(input)?;
    let (input, fctrl) = parse_u8(input)?;
    let (input, fcnt) = le_u16(input)?;
    let (input, fopts) = take((fctrl & 0x0F) as usize)(input)?;
    Ok((input, (dev_addr, fctrl, fcnt, fopts)))
}

fn join_request_body(input: &[u8]) -> IResult<&[u8], (u64, u64, u16)> {
    let (input, join_eui) = le_u64(input)?;
    let (input, dev_eui) = le_u64(input)?;
    let (input, dev_nonce) = le_u16(input)?;
    Ok((input, (join_eui, dev_eui, dev_nonce)))
}

fn nom_error(e: nom::Err<nom::error::Error<&[u8]>>) -> FrameError {
    FrameError::Malformed(format!("{e:?}"))
}

/// Parse an uplink PHYPayload.
pub fn parse_phy_payload(bytes: &[u8]) -> Result<PhyPayload, FrameError> {
    let Some(&mhdr) = bytes.first() else {
        return Err(FrameError::TooShort { expected: 1, actual: 0 });
    };

    if mhdr & 0x03 != 0 {
        return Err(FrameError::UnsupportedMajor(mhdr & 0x03));
    }

    let mtype = MType::from_mhdr(mhdr);
    match mtype {
        MType::JoinRequest => parse_join_request(bytes),
        MType::UnconfirmedDataUp
        | MType::ConfirmedDataUp
        | MType::UnconfirmedDataDown
        | MType::ConfirmedDataDown => parse_data_frame(mtype, bytes),
        _ => Err(FrameError::UnsupportedMessageType(mhdr)),
    }
}

fn parse_join_request(bytes: &[u8]) -> Result<PhyPayload, FrameError> {
    if bytes.len() != JOIN_REQUEST_LEN {
        return Err(FrameError::TooShort {
            expected: JOIN_REQUEST_LEN,
            actual: bytes.len(),
        });
    }

    let body = &bytes[1..bytes.len() - MIC_LEN];
    let (_, (join_eui, dev_eui, dev_nonce)) = join_request_body(body).map_err(nom_error)?;

    Ok(PhyPayload::JoinRequest(JoinRequestFrame {
        join_eui: Eui64(join_eui),
        dev_eui: Eui64(dev_eui),
        dev_nonce: DevNonce(dev_nonce),
        mic: trailing_mic(bytes),
        raw: bytes.to_vec(),
    }))
}

fn parse_data_frame(mtype: MType, bytes: &[u8]) -> Result<PhyPayload, FrameError> {
    if bytes.len() < MIN_DATA_FRAME_LEN {
        return Err(FrameError::TooShort {
            expected: MIN_DATA_FRAME_LEN,
            actual: bytes.len(),
        });
    }

    let mac_payload = &bytes[1..bytes.len() - MIC_LEN];
    let (rest, (dev_addr, fctrl, fcnt, fopts)) = fhdr(mac_payload).map_err(nom_error)?;

    let (fport, frm_payload) = match rest.split_first() {
        Some((&port, payload)) => (Some(port), payload.to_vec()),
        None => (None, Vec::new()),
    };

    if fport == Some(0) && !fopts.is_empty() {
        return Err(FrameError::Malformed(
            "MAC commands present in both FOpts and FPort 0 payload".to_string(),
        ));
    }

    Ok(PhyPayload::Data(DataFrame {
        mtype,
        dev_addr: DevAddr(dev_addr),
        fctrl: FCtrl::from_bits_retain(fctrl),
        fcnt,
        fopts: fopts.to_vec(),
        fport,
        frm_payload,
        mic: trailing_mic(bytes),
        raw: bytes.to_vec(),
    }))
}

fn trailing_mic(bytes: &[u8]) -> [u8; 4] {
    let mut mic = [0u8; 4];
    mic.copy_from_slice(&bytes[bytes.len() - MIC_LEN..]);
    mic
}

/// Plain fields of a data frame to encode.
#[derive(Debug, Clone)]
pub struct DataFrameFields<'a> {
    pub mtype: MType,
    pub dev_addr: DevAddr,
    /// Flags only; FOptsLen is filled from `fopts`
    pub fctrl: FCtrl,
    pub fcnt: u32,
    pub fopts: &'a [u8],
    pub fport: Option<u8>,
    /// Plaintext; encrypted with NwkSKey on port 0, AppSKey otherwise
    pub frm_payload: &'a [u8],
}

/// Encode, encrypt and sign a data frame in either direction.
pub fn encode_data_frame(fields: &DataFrameFields<'_>, keys: &SessionKeys) -> Result<Vec<u8>, FrameError> {
    if fields.fopts.len() > MAX_FOPTS_LEN {
        return Err(FrameError::Malformed(format!(
            "FOpts of {} bytes exceed {MAX_FOPTS_LEN}",
            fields.fopts.len()
        )));
    }
    if fields.fport.is_none() && !fields.frm_payload.is_empty() {
        return Err(FrameError::Malformed("FRMPayload without FPort".to_string()));
    }

    let dir = if matches!(fields.mtype, MType::UnconfirmedDataUp | MType::ConfirmedDataUp) {
        Direction::Up
    } else {
        Direction::Down
    };

    let mut buf = BytesMut::with_capacity(MIN_DATA_FRAME_LEN + fields.fopts.len() + 1 + fields.frm_payload.len());
    buf.put_u8(fields.mtype.mhdr());
    buf.put_u32_le(fields.dev_addr.0);
    buf.put_u8((fields.fctrl.bits() & 0xF0) | fields.fopts.len() as u8);
    buf.put_u16_le(fields.fcnt as u16);
    buf.put_slice(fields.fopts);

    if let Some(port) = fields.fport {
        buf.put_u8(port);
        let key = if port == 0 { &keys.nwk_s_key } else { &keys.app_s_key };
        let encrypted = crypto::crypt_frm_payload(key, dir, fields.dev_addr, fields.fcnt, fields.frm_payload);
        buf.put_slice(&encrypted);
    }

    let mic = crypto::compute_data_mic(&keys.nwk_s_key, dir, fields.dev_addr, fields.fcnt, &buf);
    buf.put_slice(&mic);
    Ok(buf.to_vec())
}

/// Join-accept fields sent back to the device.
#[derive(Debug, Clone, Copy)]
pub struct JoinAcceptFields {
    pub app_nonce: AppNonce,
    pub net_id: NetId,
    pub dev_addr: DevAddr,
    pub rx1_dr_offset: u8,
    pub rx2_data_rate: u8,
    /// RX1 delay in seconds (0 is treated as 1 by devices)
    pub rx_delay: u8,
}

/// Encode, sign and encrypt a join accept with the device's AppKey.
pub fn encode_join_accept(fields: &JoinAcceptFields, app_key: &AesKey) -> Result<Vec<u8>, FrameError> {
    let mhdr = MType::JoinAccept.mhdr();

    let mut body = BytesMut::with_capacity(16);
    body.put_slice(&fields.app_nonce.0.to_le_bytes()[..3]);
    body.put_slice(&fields.net_id.0.to_le_bytes()[..3]);
    body.put_u32_le(fields.dev_addr.0);
    body.put_u8(((fields.rx1_dr_offset & 0x07) << 4) | (fields.rx2_data_rate & 0x0F));
    body.put_u8(fields.rx_delay & 0x0F);

    let mic = crypto::compute_join_mic(app_key, &[&[mhdr][..], &body[..]].concat());
    body.put_slice(&mic);

    let encrypted = crypto::encrypt_join_accept(app_key, &body)
        .map_err(|e| FrameError::Malformed(e.to_string()))?;

    let mut out = Vec::with_capacity(1 + encrypted.len());
    out.push(mhdr);
    out.extend_from_slice(&encrypted);
    Ok(out)
}

/// Encode a signed join request (device side; used by tests and tooling).
pub fn encode_join_request(join_eui: Eui64, dev_eui: Eui64, dev_nonce: DevNonce, app_key: &AesKey) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(JOIN_REQUEST_LEN);
    buf.put_u8(MType::JoinRequest.mhdr());
    buf.put_u64_le(join_eui.0);
    buf.put_u64_le(dev_eui.0);
    buf.put_u16_le(dev_nonce.0);
    let mic = crypto::compute_join_mic(app_key, &buf);
    buf.put_slice(&mic);
    buf.to_vec()
}
