//! # MAC Commands
//!
//! Uplink MAC commands are parsed from FOpts or from a decrypted port-0
//! payload. Parsing stops at the first unknown CID since the length of an
//! unknown command cannot be known.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use log::warn;
use nom::{
    number::complete::{le_u8, u8 as parse_u8},
    IResult,
};

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06)
const GPS_EPOCH_OFFSET_SECS: i64 = 315_964_800;
/// GPS time runs ahead of UTC by the accumulated leap seconds
const GPS_LEAP_SECONDS: i64 = 18;

/// MAC commands sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkMacCommand {
    LinkCheckReq,
    LinkAdrAns { power_ack: bool, data_rate_ack: bool, channel_mask_ack: bool },
    DutyCycleAns,
    RxParamSetupAns { status: u8 },
    DevStatusAns { battery: u8, margin: i8 },
    NewChannelAns { status: u8 },
    RxTimingSetupAns,
    DeviceTimeReq,
}

impl UplinkMacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            Self::LinkCheckReq => 0x02,
            Self::LinkAdrAns { .. } => 0x03,
            Self::DutyCycleAns => 0x04,
            Self::RxParamSetupAns { .. } => 0x05,
            Self::DevStatusAns { .. } => 0x06,
            Self::NewChannelAns { .. } => 0x07,
            Self::RxTimingSetupAns => 0x08,
            Self::DeviceTimeReq => 0x0D,
        }
    }

    /// Whether the network owes the device an answer for this command.
    pub fn expects_answer(&self) -> bool {
        matches!(self, Self::LinkCheckReq | Self::DeviceTimeReq)
    }
}

/// MAC commands sent by the network server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownlinkMacCommand {
    /// `margin` in dB above the demodulation floor
    LinkCheckAns { margin: u8, gateway_count: u8 },
    LinkAdrReq {
        data_rate: u8,
        tx_power: u8,
        channel_mask: u16,
        channel_mask_control: u8,
        nb_rep: u8,
    },
    DevStatusReq,
    RxTimingSetupReq { delay: u8 },
    DeviceTimeAns { gps_seconds: u32, fractional: u8 },
}

impl DownlinkMacCommand {
    pub fn cid(&self) -> u8 {
        match self {
            Self::LinkCheckAns { .. } => 0x02,
            Self::LinkAdrReq { .. } => 0x03,
            Self::DevStatusReq => 0x06,
            Self::RxTimingSetupReq { .. } => 0x08,
            Self::DeviceTimeAns { .. } => 0x0D,
        }
    }

    /// Encoded length including the CID byte.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::LinkCheckAns { .. } => 3,
            Self::LinkAdrReq { .. } => 5,
            Self::DevStatusReq => 1,
            Self::RxTimingSetupReq { .. } => 2,
            Self::DeviceTimeAns { .. } => 6,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.cid());
        match *self {
            Self::LinkCheckAns { margin, gateway_count } => {
                buf.put_u8(margin);
                buf.put_u8(gateway_count);
            }
            Self::LinkAdrReq {
                data_rate,
                tx_power,
                channel_mask,
                channel_mask_control,
                nb_rep,
            } => {
                buf.put_u8((data_rate << 4) | (tx_power & 0x0F));
                buf.put_u16_le(channel_mask);
                buf.put_u8(((channel_mask_control & 0x07) << 4) | (nb_rep & 0x0F));
            }
            Self::DevStatusReq => {}
            Self::RxTimingSetupReq { delay } => buf.put_u8(delay & 0x0F),
            Self::DeviceTimeAns { gps_seconds, fractional } => {
                buf.put_u32_le(gps_seconds);
                buf.put_u8(fractional);
            }
        }
    }

    /// `DeviceTimeAns` for the given wall-clock instant.
    pub fn device_time_at(now: DateTime<Utc>) -> Self {
        let gps = now.timestamp() - GPS_EPOCH_OFFSET_SECS + GPS_LEAP_SECONDS;
        let fractional = (now.timestamp_subsec_millis() as u64 * 256 / 1000) as u8;
        Self::DeviceTimeAns {
            gps_seconds: gps.max(0) as u32,
            fractional,
        }
    }
}

/// Encode a list of commands back to back.
pub fn encode_commands(commands: &[DownlinkMacCommand]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(commands.iter().map(DownlinkMacCommand::encoded_len).sum());
    for cmd in commands {
        cmd.encode(&mut buf);
    }
    buf.to_vec()
}

fn status_byte(input: &[u8]) -> IResult<&[u8], u8> {
    parse_u8(input)
}

fn uplink_command(cid: u8, input: &[u8]) -> Option<IResult<&[u8], UplinkMacCommand>> {
    let parsed = match cid {
        0x02 => Ok((input, UplinkMacCommand::LinkCheckReq)),
        0x03 => status_byte(input).map(|(rest, s)| {
            (
                rest,
                UplinkMacCommand::LinkAdrAns {
                    power_ack: s & 0x04 != 0,
                    data_rate_ack: s & 0x02 != 0,
                    channel_mask_ack: s & 0x01 != 0,
                },
            )
        }),
        0x04 => Ok((input, UplinkMacCommand::DutyCycleAns)),
        0x05 => status_byte(input).map(|(rest, status)| (rest, UplinkMacCommand::RxParamSetupAns { status })),
        0x06 => dev_status_ans(input),
        0x07 => status_byte(input).map(|(rest, status)| (rest, UplinkMacCommand::NewChannelAns { status })),
        0x08 => Ok((input, UplinkMacCommand::RxTimingSetupAns)),
        0x0D => Ok((input, UplinkMacCommand::DeviceTimeReq)),
        _ => return None,
    };
    Some(parsed)
}

fn dev_status_ans(input: &[u8]) -> IResult<&[u8], UplinkMacCommand> {
    let (input, battery) = le_u8(input)?;
    let (input, raw_margin) = le_u8(input)?;
    // 6-bit two's complement
    let margin = ((raw_margin << 2) as i8) >> 2;
    Ok((input, UplinkMacCommand::DevStatusAns { battery, margin }))
}

/// Parse all commands in `bytes`; truncated or unknown commands end the list.
pub fn parse_uplink_commands(bytes: &[u8]) -> Vec<UplinkMacCommand> {
    let mut commands = Vec::new();
    let mut rest = bytes;

    while let Some((&cid, body)) = rest.split_first() {
        match uplink_command(cid, body) {
            Some(Ok((remaining, cmd))) => {
                commands.push(cmd);
                rest = remaining;
            }
            Some(Err(_)) => {
                warn!("Truncated MAC command 0x{cid:02X}, ignoring {} trailing bytes", rest.len());
                break;
            }
            None => {
                warn!("Unknown MAC command 0x{cid:02X}, ignoring {} trailing bytes", rest.len());
                break;
            }
        }
    }

    commands
}
