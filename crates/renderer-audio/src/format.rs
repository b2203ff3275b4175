//! Sink format negotiation and conversion planning.
//!
//! Given the opened track and the sink's capability set, pick the
//! operative sink format and the ring-buffer push variant that adapts the
//! decoder output to it. The plan is pure data so the pipeline consumer
//! can snapshot it without touching the decoder.

use renderer_types::{AudioFormat, DsdBitOrder, DsdLayout, Endianness, SinkCaps, TrackInfo};
use thiserror::Error;

/// 8-bit mirror lookup used for DSD MSB-first ↔ LSB-first conversion.
pub const BIT_REVERSE_TABLE: [u8; 256] = build_bit_reverse_table();

const fn build_bit_reverse_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = (i as u8).reverse_bits();
        i += 1;
    }
    table
}

/// DSD layout preference: big-endian groups first, LSB bit order first.
const DSD_LAYOUT_ORDER: [DsdLayout; 4] = [
    DsdLayout {
        bit_order: DsdBitOrder::LsbFirst,
        endianness: Endianness::Big,
    },
    DsdLayout {
        bit_order: DsdBitOrder::MsbFirst,
        endianness: Endianness::Big,
    },
    DsdLayout {
        bit_order: DsdBitOrder::LsbFirst,
        endianness: Endianness::Little,
    },
    DsdLayout {
        bit_order: DsdBitOrder::MsbFirst,
        endianness: Endianness::Little,
    },
];

/// PCM depth preference, widest first.
const PCM_BITS_ORDER: [u32; 3] = [32, 24, 16];

#[derive(Debug, Error)]
#[error("sink supports no format usable for {0}")]
pub struct UnsupportedSinkFormat(pub String);

/// How decoder output bytes are adapted while entering the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionPlan {
    /// Byte-exact copy.
    Direct,
    /// 4-byte S32 containers packed to 3-byte S24.
    Pack24,
    /// 2-byte S16 widened to 4-byte S32.
    Upsample16To32,
    /// Planar DSD interleaved into 4-byte groups per channel.
    DsdPlanar { bit_reverse: bool, byte_swap: bool },
}

/// Negotiation result: operative sink format, ring conversion, and the
/// container width the decoder should emit.
#[derive(Clone, Copy, Debug)]
pub struct FormatPlan {
    pub format: AudioFormat,
    pub conversion: ConversionPlan,
    /// Bits per sample requested from the decoder: 16 or 32 for PCM
    /// (24-bit rides in a 32-bit container), 1 for DSD.
    pub decoder_bits: u32,
}

/// Decide the sink format and conversion plan for `info` against `caps`.
///
/// PCM tries 32, then 24, then 16 bits. DSD tries the four layouts in
/// [`DSD_LAYOUT_ORDER`]; `bit_reverse` is set when the source bit order
/// differs from the sink's, `byte_swap` when the sink wants little-endian
/// groups.
pub fn negotiate(info: &TrackInfo, caps: &SinkCaps) -> Result<FormatPlan, UnsupportedSinkFormat> {
    if info.is_dsd {
        return negotiate_dsd(info, caps);
    }

    for bits in PCM_BITS_ORDER {
        if !caps.supports_pcm_bits(bits) {
            continue;
        }

        let format = AudioFormat::pcm(info.sample_rate, bits, info.channels);
        let (conversion, decoder_bits) = match bits {
            24 => (ConversionPlan::Pack24, 32),
            32 if info.bit_depth == 16 => (ConversionPlan::Upsample16To32, 16),
            32 => (ConversionPlan::Direct, 32),
            _ => (ConversionPlan::Direct, 16),
        };

        return Ok(FormatPlan {
            format,
            conversion,
            decoder_bits,
        });
    }

    Err(UnsupportedSinkFormat(describe(info)))
}

fn negotiate_dsd(info: &TrackInfo, caps: &SinkCaps) -> Result<FormatPlan, UnsupportedSinkFormat> {
    // Unknown source order is treated as LSB-first; DSF is by far the
    // common raw-DSD container.
    let source_order = match info.dsd_bit_order {
        DsdBitOrder::Unknown => DsdBitOrder::LsbFirst,
        order => order,
    };

    for layout in DSD_LAYOUT_ORDER {
        if !caps.supports_dsd_layout(layout) {
            continue;
        }

        return Ok(FormatPlan {
            format: AudioFormat::dsd(info.sample_rate, info.channels, layout.bit_order),
            conversion: ConversionPlan::DsdPlanar {
                bit_reverse: source_order != layout.bit_order,
                byte_swap: layout.endianness == Endianness::Little,
            },
            decoder_bits: 1,
        });
    }

    Err(UnsupportedSinkFormat(describe(info)))
}

fn describe(info: &TrackInfo) -> String {
    if info.is_dsd {
        format!(
            "DSD{} {}ch ({:?})",
            info.dsd_multiplier, info.channels, info.dsd_bit_order
        )
    } else {
        format!(
            "{}Hz/{}bit/{}ch",
            info.sample_rate, info.bit_depth, info.channels
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_track(bits: u32) -> TrackInfo {
        TrackInfo {
            sample_rate: 44_100,
            bit_depth: bits,
            channels: 2,
            codec: "flac".to_string(),
            is_compressed: true,
            ..Default::default()
        }
    }

    fn dsd_track(order: DsdBitOrder) -> TrackInfo {
        TrackInfo {
            sample_rate: 2_822_400,
            bit_depth: 1,
            channels: 2,
            codec: "dsd".to_string(),
            is_dsd: true,
            dsd_multiplier: 64,
            dsd_bit_order: order,
            ..Default::default()
        }
    }

    fn caps(pcm: &[u32], dsd: &[DsdLayout]) -> SinkCaps {
        SinkCaps {
            pcm_bits: pcm.to_vec(),
            dsd_layouts: dsd.to_vec(),
        }
    }

    #[test]
    fn bit_reverse_table_mirrors_bytes() {
        assert_eq!(BIT_REVERSE_TABLE[0x01], 0x80);
        assert_eq!(BIT_REVERSE_TABLE[0x80], 0x01);
        assert_eq!(BIT_REVERSE_TABLE[0xF0], 0x0F);
        for i in 0..=255usize {
            assert_eq!(BIT_REVERSE_TABLE[BIT_REVERSE_TABLE[i] as usize] as usize, i);
        }
    }

    #[test]
    fn pcm_prefers_widest_depth() {
        let plan = negotiate(&pcm_track(24), &caps(&[16, 24, 32], &[])).unwrap();
        assert_eq!(plan.format.bit_depth, 32);
        assert_eq!(plan.conversion, ConversionPlan::Direct);
        assert_eq!(plan.decoder_bits, 32);
    }

    #[test]
    fn pcm_32_source_to_24_sink_packs() {
        let plan = negotiate(&pcm_track(32), &caps(&[16, 24], &[])).unwrap();
        assert_eq!(plan.format.bit_depth, 24);
        assert_eq!(plan.conversion, ConversionPlan::Pack24);
        assert_eq!(plan.decoder_bits, 32);
    }

    #[test]
    fn pcm_16_source_to_32_sink_upsamples() {
        let plan = negotiate(&pcm_track(16), &caps(&[32], &[])).unwrap();
        assert_eq!(plan.conversion, ConversionPlan::Upsample16To32);
        assert_eq!(plan.decoder_bits, 16);
    }

    #[test]
    fn pcm_matching_depth_is_direct() {
        let plan = negotiate(&pcm_track(16), &caps(&[16], &[])).unwrap();
        assert_eq!(plan.format.bit_depth, 16);
        assert_eq!(plan.conversion, ConversionPlan::Direct);
        assert_eq!(plan.decoder_bits, 16);

        let plan = negotiate(&pcm_track(32), &caps(&[16], &[])).unwrap();
        assert_eq!(plan.format.bit_depth, 16);
        assert_eq!(plan.decoder_bits, 16);
    }

    #[test]
    fn pcm_without_sink_support_fails() {
        assert!(negotiate(&pcm_track(16), &caps(&[], &[])).is_err());
    }

    #[test]
    fn dsd_layout_order_is_honored() {
        let all = DSD_LAYOUT_ORDER.to_vec();
        let plan = negotiate(&dsd_track(DsdBitOrder::LsbFirst), &caps(&[], &all)).unwrap();
        assert_eq!(
            plan.conversion,
            ConversionPlan::DsdPlanar {
                bit_reverse: false,
                byte_swap: false
            }
        );
        assert_eq!(plan.format.dsd_bit_order, DsdBitOrder::LsbFirst);
        assert_eq!(plan.decoder_bits, 1);
    }

    #[test]
    fn dff_source_to_lsb_sink_bit_reverses() {
        let lsb_big = [DSD_LAYOUT_ORDER[0]];
        let plan = negotiate(&dsd_track(DsdBitOrder::MsbFirst), &caps(&[], &lsb_big)).unwrap();
        assert_eq!(
            plan.conversion,
            ConversionPlan::DsdPlanar {
                bit_reverse: true,
                byte_swap: false
            }
        );
    }

    #[test]
    fn little_endian_sink_requests_byte_swap() {
        let msb_little = [DSD_LAYOUT_ORDER[3]];
        let plan = negotiate(&dsd_track(DsdBitOrder::MsbFirst), &caps(&[], &msb_little)).unwrap();
        assert_eq!(
            plan.conversion,
            ConversionPlan::DsdPlanar {
                bit_reverse: false,
                byte_swap: true
            }
        );
    }

    #[test]
    fn unknown_source_order_is_treated_as_lsb() {
        let msb_big = [DSD_LAYOUT_ORDER[1]];
        let plan = negotiate(&dsd_track(DsdBitOrder::Unknown), &caps(&[], &msb_big)).unwrap();
        assert_eq!(
            plan.conversion,
            ConversionPlan::DsdPlanar {
                bit_reverse: true,
                byte_swap: false
            }
        );
    }

    #[test]
    fn dsd_without_sink_support_fails() {
        assert!(negotiate(&dsd_track(DsdBitOrder::LsbFirst), &caps(&[32], &[])).is_err());
    }
}
