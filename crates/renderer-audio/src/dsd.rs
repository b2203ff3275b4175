//! Native DSF and DFF container readers.
//!
//! Raw DSD is forwarded to the sink undecoded, so these readers only
//! parse the container headers and stream the sound data in packets.
//! Packets are always delivered as per-channel slabs (planar): DSF blocks
//! arrive planar already, DFF byte-interleaved data is de-interleaved on
//! read. Downstream, the ring buffer's planar push is the single place
//! the layout is converted for the sink.
//!
//! Both readers report the container's byte-oriented packet rate
//! (`bit rate / 8` per channel); the decoder converts to the sink-side
//! DSD bit rate exactly once at open.

use std::io::{self, Read, Seek, SeekFrom};

use renderer_types::DsdBitOrder;

/// DFF sound data is read in slices of this many bytes per channel.
const DFF_PACKET_BYTES_PER_CHANNEL: usize = 2048;

/// Parsed container facts shared by both readers.
#[derive(Clone, Debug)]
pub struct DsdStreamInfo {
    /// Bytes per second per channel (bit rate / 8).
    pub packet_rate: u32,
    pub channels: u32,
    pub bit_order: DsdBitOrder,
    /// Total 1-bit samples per channel; 0 when unknown.
    pub sample_count: u64,
}

/// A raw DSD container, sniffed by magic.
pub enum DsdContainer<R> {
    Dsf(DsfReader<R>),
    Dff(DffReader<R>),
}

impl<R: Read + Seek> DsdContainer<R> {
    /// Open `source` as a DSD container, or return it untouched (rewound)
    /// when the magic matches neither DSF nor DFF.
    pub fn sniff(mut source: R) -> io::Result<Result<Self, R>> {
        source.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 4];
        if source.read_exact(&mut magic).is_err() {
            source.seek(SeekFrom::Start(0))?;
            return Ok(Err(source));
        }
        source.seek(SeekFrom::Start(0))?;

        match &magic {
            b"DSD " => Ok(Ok(DsdContainer::Dsf(DsfReader::open(source)?))),
            b"FRM8" => Ok(Ok(DsdContainer::Dff(DffReader::open(source)?))),
            _ => Ok(Err(source)),
        }
    }

    pub fn info(&self) -> &DsdStreamInfo {
        match self {
            DsdContainer::Dsf(r) => &r.info,
            DsdContainer::Dff(r) => &r.info,
        }
    }

    /// Container label for track metadata.
    pub fn codec_name(&self) -> &'static str {
        match self {
            DsdContainer::Dsf(_) => "DSF",
            DsdContainer::Dff(_) => "DFF",
        }
    }

    /// Read the next packet as per-channel slabs; `None` at end of data.
    pub fn next_packet(&mut self) -> io::Result<Option<Vec<Vec<u8>>>> {
        match self {
            DsdContainer::Dsf(r) => r.next_packet(),
            DsdContainer::Dff(r) => r.next_packet(),
        }
    }
}

fn read_u32_le(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64_le(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_u16_be(r: &mut impl Read) -> io::Result<u16> {
    let mut b = [0u8; 2];
    r.read_exact(&mut b)?;
    Ok(u16::from_be_bytes(b))
}

fn read_u32_be(r: &mut impl Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_be_bytes(b))
}

fn read_u64_be(r: &mut impl Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_be_bytes(b))
}

fn read_id(r: &mut impl Read) -> io::Result<[u8; 4]> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(b)
}

fn bad_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// DSF reader: little-endian chunks, LSB-first bits, block-planar data
/// (one `block_size` slab per channel per block group).
#[derive(Debug)]
pub struct DsfReader<R> {
    source: R,
    info: DsdStreamInfo,
    block_size: usize,
    data_remaining: u64,
}

impl<R: Read + Seek> DsfReader<R> {
    pub fn open(mut source: R) -> io::Result<Self> {
        source.seek(SeekFrom::Start(0))?;

        if &read_id(&mut source)? != b"DSD " {
            return Err(bad_data("not a DSF file"));
        }
        let header_size = read_u64_le(&mut source)?;
        if header_size != 28 {
            return Err(bad_data("unexpected DSD chunk size"));
        }
        let _file_size = read_u64_le(&mut source)?;
        let _metadata_ptr = read_u64_le(&mut source)?;

        if &read_id(&mut source)? != b"fmt " {
            return Err(bad_data("missing fmt chunk"));
        }
        let fmt_size = read_u64_le(&mut source)?;
        if fmt_size < 52 {
            return Err(bad_data("short fmt chunk"));
        }
        let _format_version = read_u32_le(&mut source)?;
        let _format_id = read_u32_le(&mut source)?;
        let _channel_type = read_u32_le(&mut source)?;
        let channels = read_u32_le(&mut source)?;
        let sampling_freq = read_u32_le(&mut source)?;
        let bits_per_sample = read_u32_le(&mut source)?;
        let sample_count = read_u64_le(&mut source)?;
        let block_size = read_u32_le(&mut source)?;
        let _reserved = read_u32_le(&mut source)?;

        if channels == 0 || channels > 8 {
            return Err(bad_data("bad channel count"));
        }
        if sampling_freq == 0 || sampling_freq % 8 != 0 {
            return Err(bad_data("bad sampling frequency"));
        }
        if block_size == 0 || block_size > 1 << 20 {
            return Err(bad_data("bad block size"));
        }

        if &read_id(&mut source)? != b"data" {
            return Err(bad_data("missing data chunk"));
        }
        let data_size = read_u64_le(&mut source)?;
        let data_remaining = data_size.saturating_sub(12);

        let bit_order = match bits_per_sample {
            1 => DsdBitOrder::LsbFirst,
            8 => DsdBitOrder::MsbFirst,
            _ => DsdBitOrder::Unknown,
        };

        Ok(Self {
            source,
            info: DsdStreamInfo {
                packet_rate: sampling_freq / 8,
                channels,
                bit_order,
                sample_count,
            },
            block_size: block_size as usize,
            data_remaining,
        })
    }

    /// Read one block group: `block_size` bytes for each channel.
    fn next_packet(&mut self) -> io::Result<Option<Vec<Vec<u8>>>> {
        if self.data_remaining == 0 {
            return Ok(None);
        }

        let channels = self.info.channels as usize;
        let mut slabs = Vec::with_capacity(channels);
        for _ in 0..channels {
            let want = (self.block_size as u64).min(self.data_remaining) as usize;
            if want == 0 {
                break;
            }
            let mut slab = vec![0u8; want];
            let mut filled = 0;
            while filled < want {
                let n = self.source.read(&mut slab[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            slab.truncate(filled);
            self.data_remaining -= filled as u64;
            if filled == 0 {
                self.data_remaining = 0;
                break;
            }
            slabs.push(slab);
        }

        if slabs.len() != channels {
            // Truncated final group; drop it rather than emit a torn one.
            return Ok(None);
        }

        // Keep the slabs rectangular so planar math downstream holds.
        let min_len = slabs.iter().map(|s| s.len()).min().unwrap_or(0);
        if min_len == 0 {
            return Ok(None);
        }
        for slab in &mut slabs {
            slab.truncate(min_len);
        }

        Ok(Some(slabs))
    }
}

/// DFF (DSDIFF) reader: big-endian chunks, MSB-first bits, sound data
/// byte-interleaved across channels.
pub struct DffReader<R> {
    source: R,
    info: DsdStreamInfo,
    data_remaining: u64,
}

impl<R: Read + Seek> DffReader<R> {
    pub fn open(mut source: R) -> io::Result<Self> {
        source.seek(SeekFrom::Start(0))?;

        if &read_id(&mut source)? != b"FRM8" {
            return Err(bad_data("not a DFF file"));
        }
        let _form_size = read_u64_be(&mut source)?;
        if &read_id(&mut source)? != b"DSD " {
            return Err(bad_data("not a DSD form"));
        }

        let mut sample_rate = 0u32;
        let mut channels = 0u32;
        let mut data_remaining = 0u64;

        loop {
            let id = match read_id(&mut source) {
                Ok(id) => id,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(bad_data("no DSD sound data chunk"))
                }
                Err(e) => return Err(e),
            };
            let size = read_u64_be(&mut source)?;

            match &id {
                b"PROP" => {
                    let prop_end = source.stream_position()? + size;
                    if &read_id(&mut source)? != b"SND " {
                        return Err(bad_data("unexpected PROP form"));
                    }
                    while source.stream_position()? < prop_end {
                        let sub_id = read_id(&mut source)?;
                        let sub_size = read_u64_be(&mut source)?;
                        let sub_end = source.stream_position()? + sub_size;
                        match &sub_id {
                            b"FS  " => {
                                sample_rate = read_u32_be(&mut source)?;
                            }
                            b"CHNL" => {
                                channels = read_u16_be(&mut source)? as u32;
                            }
                            _ => {}
                        }
                        // Chunks are padded to even sizes.
                        source.seek(SeekFrom::Start(sub_end + (sub_size & 1)))?;
                    }
                    source.seek(SeekFrom::Start(prop_end + (size & 1)))?;
                }
                b"DSD " => {
                    data_remaining = size;
                    break;
                }
                _ => {
                    source.seek(SeekFrom::Current((size + (size & 1)) as i64))?;
                }
            }
        }

        if channels == 0 || channels > 8 {
            return Err(bad_data("bad channel count"));
        }
        if sample_rate == 0 || sample_rate % 8 != 0 {
            return Err(bad_data("bad sample rate"));
        }

        let sample_count = data_remaining / channels as u64 * 8;

        Ok(Self {
            source,
            info: DsdStreamInfo {
                packet_rate: sample_rate / 8,
                channels,
                bit_order: DsdBitOrder::MsbFirst,
                sample_count,
            },
            data_remaining,
        })
    }

    /// Read a slice of interleaved sound data and split it per channel.
    fn next_packet(&mut self) -> io::Result<Option<Vec<Vec<u8>>>> {
        if self.data_remaining == 0 {
            return Ok(None);
        }

        let channels = self.info.channels as usize;
        let want = ((DFF_PACKET_BYTES_PER_CHANNEL * channels) as u64).min(self.data_remaining)
            as usize;
        // Whole interleave groups only.
        let want = want - want % channels;
        if want == 0 {
            self.data_remaining = 0;
            return Ok(None);
        }

        let mut interleaved = vec![0u8; want];
        let mut filled = 0;
        while filled < want {
            let n = self.source.read(&mut interleaved[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let filled = filled - filled % channels;
        if filled == 0 {
            self.data_remaining = 0;
            return Ok(None);
        }
        self.data_remaining -= filled as u64;

        let per_channel = filled / channels;
        let mut slabs: Vec<Vec<u8>> = (0..channels)
            .map(|_| Vec::with_capacity(per_channel))
            .collect();
        for (i, &b) in interleaved[..filled].iter().enumerate() {
            slabs[i % channels].push(b);
        }

        Ok(Some(slabs))
    }
}

/// Build an in-memory DSF file for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn tests_fixture_dsf(channels: u32, block_size: u32, data: &[u8]) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(b"DSD ");
    f.extend_from_slice(&28u64.to_le_bytes());
    f.extend_from_slice(&0u64.to_le_bytes()); // file size
    f.extend_from_slice(&0u64.to_le_bytes()); // metadata pointer

    f.extend_from_slice(b"fmt ");
    f.extend_from_slice(&52u64.to_le_bytes());
    f.extend_from_slice(&1u32.to_le_bytes()); // version
    f.extend_from_slice(&0u32.to_le_bytes()); // format id
    f.extend_from_slice(&2u32.to_le_bytes()); // channel type
    f.extend_from_slice(&channels.to_le_bytes());
    f.extend_from_slice(&2_822_400u32.to_le_bytes());
    f.extend_from_slice(&1u32.to_le_bytes()); // bits per sample: LSB first
    f.extend_from_slice(&((data.len() as u64 / channels as u64) * 8).to_le_bytes());
    f.extend_from_slice(&block_size.to_le_bytes());
    f.extend_from_slice(&0u32.to_le_bytes()); // reserved

    f.extend_from_slice(b"data");
    f.extend_from_slice(&(data.len() as u64 + 12).to_le_bytes());
    f.extend_from_slice(data);
    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn dsf_fixture(channels: u32, block_size: u32, data: &[u8]) -> Vec<u8> {
        tests_fixture_dsf(channels, block_size, data)
    }

    fn dff_fixture(channels: u16, data: &[u8]) -> Vec<u8> {
        let mut prop = Vec::new();
        prop.extend_from_slice(b"SND ");
        prop.extend_from_slice(b"FS  ");
        prop.extend_from_slice(&4u64.to_be_bytes());
        prop.extend_from_slice(&2_822_400u32.to_be_bytes());
        prop.extend_from_slice(b"CHNL");
        let chnl_size = 2 + 4 * channels as u64;
        prop.extend_from_slice(&chnl_size.to_be_bytes());
        prop.extend_from_slice(&channels.to_be_bytes());
        for _ in 0..channels {
            prop.extend_from_slice(b"SLFT");
        }
        if chnl_size % 2 == 1 {
            prop.push(0);
        }

        let mut f = Vec::new();
        f.extend_from_slice(b"FRM8");
        f.extend_from_slice(&0u64.to_be_bytes()); // form size (unchecked)
        f.extend_from_slice(b"DSD ");
        f.extend_from_slice(b"FVER");
        f.extend_from_slice(&4u64.to_be_bytes());
        f.extend_from_slice(&0x01_05_00_00u32.to_be_bytes());
        f.extend_from_slice(b"PROP");
        f.extend_from_slice(&(prop.len() as u64).to_be_bytes());
        f.extend_from_slice(&prop);
        f.extend_from_slice(b"DSD ");
        f.extend_from_slice(&(data.len() as u64).to_be_bytes());
        f.extend_from_slice(data);
        f
    }

    #[test]
    fn dsf_header_parses() {
        let data = vec![0u8; 16];
        let file = dsf_fixture(2, 4, &data);
        let reader = DsfReader::open(Cursor::new(file)).unwrap();
        assert_eq!(reader.info.packet_rate, 352_800);
        assert_eq!(reader.info.channels, 2);
        assert_eq!(reader.info.bit_order, DsdBitOrder::LsbFirst);
        assert_eq!(reader.info.sample_count, 64);
    }

    #[test]
    fn dsf_packets_are_planar_block_groups() {
        // Two block groups of 4 bytes per channel.
        let data: Vec<u8> = vec![
            1, 2, 3, 4, // L block 0
            11, 12, 13, 14, // R block 0
            5, 6, 7, 8, // L block 1
            15, 16, 17, 18, // R block 1
        ];
        let file = dsf_fixture(2, 4, &data);
        let mut reader = DsfReader::open(Cursor::new(file)).unwrap();

        let p0 = reader.next_packet().unwrap().unwrap();
        assert_eq!(p0, vec![vec![1, 2, 3, 4], vec![11, 12, 13, 14]]);
        let p1 = reader.next_packet().unwrap().unwrap();
        assert_eq!(p1, vec![vec![5, 6, 7, 8], vec![15, 16, 17, 18]]);
        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn dsf_rejects_foreign_magic() {
        let err = DsfReader::open(Cursor::new(b"RIFFxxxx".to_vec())).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn dff_header_parses() {
        let data = vec![0u8; 8];
        let file = dff_fixture(2, &data);
        let reader = DffReader::open(Cursor::new(file)).unwrap();
        assert_eq!(reader.info.packet_rate, 352_800);
        assert_eq!(reader.info.channels, 2);
        assert_eq!(reader.info.bit_order, DsdBitOrder::MsbFirst);
        assert_eq!(reader.info.sample_count, 32);
    }

    #[test]
    fn dff_packets_deinterleave_per_channel() {
        let data = vec![1, 11, 2, 12, 3, 13, 4, 14];
        let file = dff_fixture(2, &data);
        let mut reader = DffReader::open(Cursor::new(file)).unwrap();

        let p = reader.next_packet().unwrap().unwrap();
        assert_eq!(p, vec![vec![1, 2, 3, 4], vec![11, 12, 13, 14]]);
        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn sniff_dispatches_by_magic() {
        let dsf = dsf_fixture(2, 4, &[0u8; 8]);
        match DsdContainer::sniff(Cursor::new(dsf)).unwrap() {
            Ok(DsdContainer::Dsf(_)) => {}
            _ => panic!("expected DSF"),
        }

        let dff = dff_fixture(2, &[0u8; 4]);
        match DsdContainer::sniff(Cursor::new(dff)).unwrap() {
            Ok(DsdContainer::Dff(_)) => {}
            _ => panic!("expected DFF"),
        }

        let other = b"fLaC....rest".to_vec();
        match DsdContainer::sniff(Cursor::new(other)).unwrap() {
            Err(_) => {}
            Ok(_) => panic!("expected passthrough"),
        }
    }
}
