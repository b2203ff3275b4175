//! Shared data model for the renderer workspace.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Bit order of a raw DSD source.
///
/// DSF files store the least significant bit first, DFF files the most
/// significant bit first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DsdBitOrder {
    LsbFirst,
    MsbFirst,
    #[default]
    Unknown,
}

/// Byte order of 4-byte DSD groups on the sink side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    Big,
    Little,
}

/// One DSD layout a sink can accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DsdLayout {
    pub bit_order: DsdBitOrder,
    pub endianness: Endianness,
}

/// Capability set reported by a sink target.
#[derive(Clone, Debug, Default)]
pub struct SinkCaps {
    /// PCM bit depths the sink accepts, unordered.
    pub pcm_bits: Vec<u32>,
    /// DSD layouts the sink accepts, unordered.
    pub dsd_layouts: Vec<DsdLayout>,
}

impl SinkCaps {
    pub fn supports_pcm_bits(&self, bits: u32) -> bool {
        self.pcm_bits.contains(&bits)
    }

    pub fn supports_dsd_layout(&self, layout: DsdLayout) -> bool {
        self.dsd_layouts.contains(&layout)
    }
}

/// Immutable description of an opened track.
///
/// For DSD, `sample_rate` is the DSD *bit* rate (2 822 400 Hz for DSD64),
/// never the byte-oriented packet rate a container reports.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrackInfo {
    pub sample_rate: u32,
    /// 1 for DSD, 16/24/32 for PCM.
    pub bit_depth: u32,
    pub channels: u32,
    pub codec: String,
    /// Total duration in samples; 0 when unknown (live streams).
    pub duration_samples: u64,
    pub is_dsd: bool,
    /// 64, 128, 256, 512 or 1024; 0 when not DSD.
    pub dsd_multiplier: u32,
    /// False for uncompressed PCM containers (WAV/AIFF), true otherwise.
    pub is_compressed: bool,
    pub dsd_bit_order: DsdBitOrder,
}

impl TrackInfo {
    /// Duration in whole seconds, 0 when unknown.
    pub fn duration_seconds(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.duration_samples / self.sample_rate as u64
    }
}

/// The operative sink-side format.
///
/// Equality is field-wise, except that the DSD bit order only participates
/// when `is_dsd` is set: two PCM formats that differ only in a stale bit
/// order compare equal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bit_depth: u32,
    pub channels: u32,
    pub is_dsd: bool,
    pub dsd_bit_order: DsdBitOrder,
}

impl AudioFormat {
    pub fn pcm(sample_rate: u32, bit_depth: u32, channels: u32) -> Self {
        Self {
            sample_rate,
            bit_depth,
            channels,
            is_dsd: false,
            dsd_bit_order: DsdBitOrder::Unknown,
        }
    }

    pub fn dsd(bit_rate: u32, channels: u32, bit_order: DsdBitOrder) -> Self {
        Self {
            sample_rate: bit_rate,
            bit_depth: 1,
            channels,
            is_dsd: true,
            dsd_bit_order: bit_order,
        }
    }

    /// Output bytes per second after sink-side packing.
    pub fn bytes_per_second(&self) -> u64 {
        if self.is_dsd {
            // 1 bit per sample per channel.
            self.sample_rate as u64 * self.channels as u64 / 8
        } else {
            let bytes = match self.bit_depth {
                16 => 2,
                24 => 3,
                _ => 4,
            };
            self.sample_rate as u64 * self.channels as u64 * bytes
        }
    }
}

impl PartialEq for AudioFormat {
    fn eq(&self, other: &Self) -> bool {
        if self.is_dsd != other.is_dsd {
            return false;
        }
        if self.is_dsd && self.dsd_bit_order != other.dsd_bit_order {
            return false;
        }
        self.sample_rate == other.sample_rate
            && self.bit_depth == other.bit_depth
            && self.channels == other.channels
    }
}

impl Eq for AudioFormat {}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_dsd {
            write!(
                f,
                "DSD{} ({} Hz)/{}ch",
                self.sample_rate / (44_100 * 64) * 64,
                self.sample_rate,
                self.channels
            )
        } else {
            write!(
                f,
                "{}Hz/{}bit/{}ch",
                self.sample_rate, self.bit_depth, self.channels
            )
        }
    }
}

/// Renderer transport state as exposed to control points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RendererState {
    Stopped,
    Playing,
    Paused,
    Transitioning,
}

impl RendererState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RendererState::Playing,
            2 => RendererState::Paused,
            3 => RendererState::Transitioning,
            _ => RendererState::Stopped,
        }
    }
}

impl fmt::Display for RendererState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RendererState::Stopped => "STOPPED",
            RendererState::Playing => "PLAYING",
            RendererState::Paused => "PAUSED",
            RendererState::Transitioning => "TRANSITIONING",
        };
        f.write_str(s)
    }
}

/// Atomic cell holding a [`RendererState`].
///
/// Written by the facade and the engine, read by the producer and position
/// threads without taking any lock.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: RendererState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> RendererState {
        RendererState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: RendererState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Store `new` only when the current value is `expected`; returns
    /// whether the swap happened.
    pub fn compare_store(&self, expected: RendererState, new: RendererState) -> bool {
        self.0
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for AtomicState {
    fn default() -> Self {
        Self::new(RendererState::Stopped)
    }
}

/// Status payload returned by the control API.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub state: Option<RendererState>,
    pub uri: Option<String>,
    pub track_number: Option<u32>,
    pub position_seconds: Option<u64>,
    pub duration_seconds: Option<u64>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u32>,
    pub channels: Option<u32>,
    pub codec: Option<String>,
    pub is_dsd: Option<bool>,
    pub sink_online: Option<bool>,
    pub underrun_cycles: Option<u64>,
    pub buffer_fill: Option<f32>,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_equality_ignores_bit_order_for_pcm() {
        let mut a = AudioFormat::pcm(44_100, 16, 2);
        let mut b = AudioFormat::pcm(44_100, 16, 2);
        a.dsd_bit_order = DsdBitOrder::LsbFirst;
        b.dsd_bit_order = DsdBitOrder::MsbFirst;
        assert_eq!(a, b);
    }

    #[test]
    fn format_equality_checks_bit_order_for_dsd() {
        let a = AudioFormat::dsd(2_822_400, 2, DsdBitOrder::LsbFirst);
        let b = AudioFormat::dsd(2_822_400, 2, DsdBitOrder::MsbFirst);
        assert_ne!(a, b);
        assert_eq!(a, AudioFormat::dsd(2_822_400, 2, DsdBitOrder::LsbFirst));
    }

    #[test]
    fn format_equality_separates_pcm_and_dsd() {
        let pcm = AudioFormat::pcm(2_822_400, 1, 2);
        let dsd = AudioFormat::dsd(2_822_400, 2, DsdBitOrder::LsbFirst);
        assert_ne!(pcm, dsd);
    }

    #[test]
    fn bytes_per_second_covers_packings() {
        assert_eq!(AudioFormat::pcm(44_100, 16, 2).bytes_per_second(), 176_400);
        assert_eq!(AudioFormat::pcm(44_100, 24, 2).bytes_per_second(), 264_600);
        assert_eq!(AudioFormat::pcm(44_100, 32, 2).bytes_per_second(), 352_800);
        assert_eq!(
            AudioFormat::dsd(2_822_400, 2, DsdBitOrder::LsbFirst).bytes_per_second(),
            705_600
        );
    }

    #[test]
    fn atomic_state_round_trips() {
        let state = AtomicState::default();
        assert_eq!(state.load(), RendererState::Stopped);
        state.store(RendererState::Playing);
        assert_eq!(state.load(), RendererState::Playing);
        assert!(state.compare_store(RendererState::Playing, RendererState::Paused));
        assert!(!state.compare_store(RendererState::Playing, RendererState::Stopped));
        assert_eq!(state.load(), RendererState::Paused);
    }

    #[test]
    fn track_info_duration_seconds_handles_zero_rate() {
        let info = TrackInfo::default();
        assert_eq!(info.duration_seconds(), 0);
        let info = TrackInfo {
            sample_rate: 44_100,
            duration_samples: 441_000,
            ..Default::default()
        };
        assert_eq!(info.duration_seconds(), 10);
    }
}
