//! Wire protocol primitives for the netsink LAN audio sink.
//!
//! One UDP datagram carries one frame:
//! - kind: u8
//! - len: u32 LE
//! - payload: [u8; len]
//!
//! Discovery datagrams additionally start with a 4-byte magic + u16 LE
//! version prelude so unrelated broadcast traffic is rejected cheaply.

use std::io;

use renderer_types::{DsdBitOrder, DsdLayout, Endianness, SinkCaps};

pub const MAGIC: [u8; 4] = *b"NSNK";
pub const VERSION: u16 = 1;

/// Frame header size: kind + len.
pub const FRAME_HEADER_LEN: usize = 5;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Hello = 0x01,
    HelloAck = 0x02,
    MtuProbe = 0x03,
    MtuAck = 0x04,

    SetFormat = 0x10,
    FormatAck = 0x11,

    Audio = 0x20,

    Pause = 0x30,
    Resume = 0x31,
    Stop = 0x32,
    Bye = 0x3F,

    Error = 0x7F,
}

impl FrameKind {
    pub fn from_u8(b: u8) -> io::Result<Self> {
        let k = match b {
            0x01 => FrameKind::Hello,
            0x02 => FrameKind::HelloAck,
            0x03 => FrameKind::MtuProbe,
            0x04 => FrameKind::MtuAck,
            0x10 => FrameKind::SetFormat,
            0x11 => FrameKind::FormatAck,
            0x20 => FrameKind::Audio,
            0x30 => FrameKind::Pause,
            0x31 => FrameKind::Resume,
            0x32 => FrameKind::Stop,
            0x3F => FrameKind::Bye,
            0x7F => FrameKind::Error,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown frame kind {b:#x}"),
                ))
            }
        };
        Ok(k)
    }
}

/// Encode a complete datagram: magic + version + kind + len + payload.
pub fn encode_datagram(kind: FrameKind, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len: u32 = payload
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "payload too large"))?;

    let mut out = Vec::with_capacity(6 + FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a datagram, returning the frame kind and payload slice.
pub fn decode_datagram(buf: &[u8]) -> io::Result<(FrameKind, &[u8])> {
    if buf.len() < 6 + FRAME_HEADER_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short datagram"));
    }
    if buf[..4] != MAGIC {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported version {version}"),
        ));
    }

    let kind = FrameKind::from_u8(buf[6])?;
    let len = u32::from_le_bytes([buf[7], buf[8], buf[9], buf[10]]) as usize;
    let payload = &buf[6 + FRAME_HEADER_LEN..];
    if payload.len() != len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "payload length mismatch",
        ));
    }
    Ok((kind, payload))
}

// Capability masks carried in HELLO_ACK.
const CAP_PCM_16: u8 = 0x01;
const CAP_PCM_24: u8 = 0x02;
const CAP_PCM_32: u8 = 0x04;

const CAP_DSD_LSB_BIG: u8 = 0x01;
const CAP_DSD_MSB_BIG: u8 = 0x02;
const CAP_DSD_LSB_LITTLE: u8 = 0x04;
const CAP_DSD_MSB_LITTLE: u8 = 0x08;

/// Encode a `HELLO_ACK` payload: `u16 name_len` + name + pcm mask + dsd mask.
pub fn encode_hello_ack_payload(name: &str, caps: &SinkCaps) -> io::Result<Vec<u8>> {
    let name_bytes = name.as_bytes();
    let name_len: u16 = name_bytes
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name too long"))?;

    let mut pcm_mask = 0u8;
    for bits in &caps.pcm_bits {
        pcm_mask |= match bits {
            16 => CAP_PCM_16,
            24 => CAP_PCM_24,
            32 => CAP_PCM_32,
            _ => 0,
        };
    }

    let mut dsd_mask = 0u8;
    for layout in &caps.dsd_layouts {
        dsd_mask |= dsd_layout_bit(*layout);
    }

    let mut out = Vec::with_capacity(2 + name_bytes.len() + 2);
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(name_bytes);
    out.push(pcm_mask);
    out.push(dsd_mask);
    Ok(out)
}

/// Decode a `HELLO_ACK` payload into the target name and capability set.
pub fn decode_hello_ack_payload(payload: &[u8]) -> io::Result<(String, SinkCaps)> {
    if payload.len() < 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "short HELLO_ACK"));
    }
    let name_len = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    if payload.len() != 2 + name_len + 2 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "HELLO_ACK length mismatch",
        ));
    }
    let name = std::str::from_utf8(&payload[2..2 + name_len])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "name not utf-8"))?
        .to_string();

    let pcm_mask = payload[2 + name_len];
    let dsd_mask = payload[2 + name_len + 1];

    let mut caps = SinkCaps::default();
    if pcm_mask & CAP_PCM_16 != 0 {
        caps.pcm_bits.push(16);
    }
    if pcm_mask & CAP_PCM_24 != 0 {
        caps.pcm_bits.push(24);
    }
    if pcm_mask & CAP_PCM_32 != 0 {
        caps.pcm_bits.push(32);
    }
    for (bit, layout) in [
        (CAP_DSD_LSB_BIG, layout(DsdBitOrder::LsbFirst, Endianness::Big)),
        (CAP_DSD_MSB_BIG, layout(DsdBitOrder::MsbFirst, Endianness::Big)),
        (CAP_DSD_LSB_LITTLE, layout(DsdBitOrder::LsbFirst, Endianness::Little)),
        (CAP_DSD_MSB_LITTLE, layout(DsdBitOrder::MsbFirst, Endianness::Little)),
    ] {
        if dsd_mask & bit != 0 {
            caps.dsd_layouts.push(layout);
        }
    }

    Ok((name, caps))
}

fn layout(bit_order: DsdBitOrder, endianness: Endianness) -> DsdLayout {
    DsdLayout {
        bit_order,
        endianness,
    }
}

fn dsd_layout_bit(l: DsdLayout) -> u8 {
    match (l.bit_order, l.endianness) {
        (DsdBitOrder::LsbFirst, Endianness::Big) => CAP_DSD_LSB_BIG,
        (DsdBitOrder::MsbFirst, Endianness::Big) => CAP_DSD_MSB_BIG,
        (DsdBitOrder::LsbFirst, Endianness::Little) => CAP_DSD_LSB_LITTLE,
        (DsdBitOrder::MsbFirst, Endianness::Little) => CAP_DSD_MSB_LITTLE,
        (DsdBitOrder::Unknown, _) => 0,
    }
}

/// Format descriptor carried by SET_FORMAT and FORMAT_ACK.
///
/// Layout: `u32 rate` + `u8 bits` + `u8 channels` + `u8 flags` +
/// `u32 cycle_us`. Flag bit 0 marks DSD, bit 1 LSB-first, bit 2 little
/// endian groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireFormat {
    pub sample_rate: u32,
    pub bit_depth: u8,
    pub channels: u8,
    pub is_dsd: bool,
    pub dsd_lsb_first: bool,
    pub dsd_little_endian: bool,
    pub cycle_us: u32,
}

const FMT_FLAG_DSD: u8 = 0x01;
const FMT_FLAG_LSB: u8 = 0x02;
const FMT_FLAG_LITTLE: u8 = 0x04;

pub fn encode_format_payload(fmt: &WireFormat) -> Vec<u8> {
    let mut flags = 0u8;
    if fmt.is_dsd {
        flags |= FMT_FLAG_DSD;
    }
    if fmt.dsd_lsb_first {
        flags |= FMT_FLAG_LSB;
    }
    if fmt.dsd_little_endian {
        flags |= FMT_FLAG_LITTLE;
    }

    let mut out = Vec::with_capacity(11);
    out.extend_from_slice(&fmt.sample_rate.to_le_bytes());
    out.push(fmt.bit_depth);
    out.push(fmt.channels);
    out.push(flags);
    out.extend_from_slice(&fmt.cycle_us.to_le_bytes());
    out
}

pub fn decode_format_payload(payload: &[u8]) -> io::Result<WireFormat> {
    if payload.len() != 11 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad format payload length",
        ));
    }
    let flags = payload[6];
    Ok(WireFormat {
        sample_rate: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
        bit_depth: payload[4],
        channels: payload[5],
        is_dsd: flags & FMT_FLAG_DSD != 0,
        dsd_lsb_first: flags & FMT_FLAG_LSB != 0,
        dsd_little_endian: flags & FMT_FLAG_LITTLE != 0,
        cycle_us: u32::from_le_bytes([payload[7], payload[8], payload[9], payload[10]]),
    })
}

/// Encode an `MTU_ACK` payload echoing the received probe size.
pub fn encode_mtu_ack_payload(probe_len: u32) -> Vec<u8> {
    probe_len.to_le_bytes().to_vec()
}

pub fn decode_mtu_ack_payload(payload: &[u8]) -> io::Result<u32> {
    if payload.len() != 4 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "bad MTU_ACK"));
    }
    Ok(u32::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]))
}

/// Encode an `AUDIO` payload: `u64 seq` + sample bytes.
pub fn encode_audio_payload(seq: u64, samples: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + samples.len());
    out.extend_from_slice(&seq.to_le_bytes());
    out.extend_from_slice(samples);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trip() {
        let dg = encode_datagram(FrameKind::Hello, b"renderer").unwrap();
        let (kind, payload) = decode_datagram(&dg).unwrap();
        assert_eq!(kind, FrameKind::Hello);
        assert_eq!(payload, b"renderer");
    }

    #[test]
    fn datagram_rejects_bad_magic() {
        let mut dg = encode_datagram(FrameKind::Hello, b"").unwrap();
        dg[0] = b'X';
        assert!(decode_datagram(&dg).is_err());
    }

    #[test]
    fn datagram_rejects_truncated_payload() {
        let mut dg = encode_datagram(FrameKind::Audio, &[1, 2, 3, 4]).unwrap();
        dg.truncate(dg.len() - 1);
        assert!(decode_datagram(&dg).is_err());
    }

    #[test]
    fn hello_ack_round_trip() {
        let caps = SinkCaps {
            pcm_bits: vec![16, 32],
            dsd_layouts: vec![
                layout(DsdBitOrder::LsbFirst, Endianness::Big),
                layout(DsdBitOrder::MsbFirst, Endianness::Little),
            ],
        };
        let payload = encode_hello_ack_payload("living-room", &caps).unwrap();
        let (name, decoded) = decode_hello_ack_payload(&payload).unwrap();
        assert_eq!(name, "living-room");
        assert_eq!(decoded.pcm_bits, vec![16, 32]);
        assert_eq!(decoded.dsd_layouts.len(), 2);
        assert!(decoded.supports_dsd_layout(layout(DsdBitOrder::LsbFirst, Endianness::Big)));
        assert!(decoded.supports_dsd_layout(layout(DsdBitOrder::MsbFirst, Endianness::Little)));
    }

    #[test]
    fn format_payload_round_trip() {
        let fmt = WireFormat {
            sample_rate: 2_822_400,
            bit_depth: 1,
            channels: 2,
            is_dsd: true,
            dsd_lsb_first: true,
            dsd_little_endian: false,
            cycle_us: 2_620,
        };
        let payload = encode_format_payload(&fmt);
        assert_eq!(decode_format_payload(&payload).unwrap(), fmt);
    }

    #[test]
    fn format_payload_rejects_wrong_length(){
        assert!(decode_format_payload(&[0u8; 10]).is_err());
    }

    #[test]
    fn unknown_frame_kind_is_invalid_data() {
        let err = FrameKind::from_u8(0x55).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
