//! Producer/consumer glue between the decoder and the sink worker.
//!
//! The pipeline owns the ring buffer and the conversion plan. The
//! producer side runs on the engine's timer thread: it checks ring free
//! space, pulls a chunk from the decoder, and pushes it through the
//! format-adapting ring write chosen at negotiation time. The consumer
//! side is invoked by the sink worker once per cycle and resolves, in
//! order: shutdown silence, stop request, prefill, post-online
//! stabilization, then real ring data; on underrun it delivers a full
//! cycle of silence rather than a partial buffer.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::decode::Decoder;
use crate::error::DecodeError;
use crate::format::{ConversionPlan, FormatPlan, BIT_REVERSE_TABLE};
use crate::ring::RingBuffer;

/// Samples requested from the decoder per producer tick. Chosen so one
/// tick is roughly 10 ms of audio regardless of rate and the gapless seam
/// stays small.
pub const DSD_CHUNK_SAMPLES: usize = 32_768;
pub const PCM_CHUNK_SAMPLES: usize = 8_192;

/// Ring sizing in seconds of audio, clamped to the byte range below.
pub const DSD_RING_SECONDS: f64 = 0.8;
pub const PCM_RING_SECONDS: f64 = 1.0;
pub const MIN_RING_BYTES: usize = 3_000_000;
pub const MAX_RING_BYTES: usize = 16_777_216;

/// Prefill targets in milliseconds of audio.
pub const DSD_PREFILL_MS: u64 = 200;
pub const PCM_PREFILL_MS: u64 = 50;
pub const PCM_LOWRATE_PREFILL_MS: u64 = 100;
pub const MIN_PREFILL_BYTES: usize = 1_024;

/// Cycles of silence delivered after the sink first comes online, giving
/// the DAC time to lock before real audio starts.
pub const POST_ONLINE_SILENCE_CYCLES: u32 = 50;

/// Shutdown-silence cycle counts before a sink close or format change.
pub const PCM_SHUTDOWN_SILENCE_CYCLES: u32 = 30;
pub const DSD_SHUTDOWN_SILENCE_CYCLES: u32 = 100;

/// Quiet interval between closing the sink with one format and reopening
/// it with another; the DAC needs it to relock its PLL.
pub const FORMAT_SETTLE: Duration = Duration::from_millis(600);

pub const PCM_SILENCE_BYTE: u8 = 0x00;
pub const DSD_SILENCE_BYTE: u8 = 0x69;

/// Outcome of one producer tick.
#[derive(Debug, PartialEq, Eq)]
pub enum Produce {
    /// Samples decoded and pushed.
    Pushed(usize),
    /// Ring has no room for a whole chunk; try again next tick.
    RingFull,
    /// Decoder is exhausted.
    Eof,
}

/// Conversion state snapshot read by the consumer each cycle.
#[derive(Clone, Debug)]
struct PlanState {
    conversion: ConversionPlan,
    channels: usize,
    decoder_bits: u32,
    is_dsd: bool,
    bytes_per_cycle: usize,
}

impl Default for PlanState {
    fn default() -> Self {
        Self {
            conversion: ConversionPlan::Direct,
            channels: 2,
            decoder_bits: 16,
            is_dsd: false,
            bytes_per_cycle: 176,
        }
    }
}

pub struct AudioPipeline {
    ring: RwLock<RingBuffer>,
    plan: Mutex<PlanState>,
    /// Serializes producer ring writes across reconfiguration.
    push_lock: Mutex<()>,

    prefill_target: AtomicUsize,
    prefill_complete: AtomicBool,
    stop_requested: AtomicBool,
    shutdown_silence: AtomicU32,
    stabilization_count: AtomicU32,
    post_online_done: AtomicBool,

    push_count: AtomicU64,
    cycle_count: AtomicU64,
    underrun_cycles: AtomicU64,

    scratch: Mutex<Vec<u8>>,
}

impl AudioPipeline {
    pub fn new() -> Self {
        Self {
            ring: RwLock::new(RingBuffer::new(44_100 * 2 * 4, PCM_SILENCE_BYTE)),
            plan: Mutex::new(PlanState::default()),
            push_lock: Mutex::new(()),
            prefill_target: AtomicUsize::new(MIN_PREFILL_BYTES),
            prefill_complete: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            shutdown_silence: AtomicU32::new(0),
            stabilization_count: AtomicU32::new(0),
            post_online_done: AtomicBool::new(false),
            push_count: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            underrun_cycles: AtomicU64::new(0),
            scratch: Mutex::new(Vec::new()),
        }
    }

    /// Reconfigure for a negotiated format. Quiesces the producer via the
    /// push lock, resizes the ring, and clears the prefill state. The
    /// caller must have quiesced the consumer (sink closed or draining
    /// silence) before calling.
    pub fn configure(&self, plan: &FormatPlan) {
        let format = plan.format;

        let (state, ring_bytes, prefill, silence) = if format.is_dsd {
            let byte_rate = format.sample_rate as u64 / 8;
            let bytes_per_second = byte_rate * format.channels as u64;

            let mut cycle = (byte_rate / 1000) as usize * format.channels as usize;
            let group = 4 * format.channels as usize;
            cycle = (cycle + group - 1) / group * group;
            cycle = cycle.max(64);

            (
                PlanState {
                    conversion: plan.conversion,
                    channels: format.channels as usize,
                    decoder_bits: plan.decoder_bits,
                    is_dsd: true,
                    bytes_per_cycle: cycle,
                },
                ring_size(bytes_per_second, DSD_RING_SECONDS),
                prefill_target(bytes_per_second, DSD_PREFILL_MS),
                DSD_SILENCE_BYTE,
            )
        } else {
            let sink_bps = match format.bit_depth {
                16 => 2usize,
                24 => 3,
                _ => 4,
            };
            let bytes_per_second =
                format.sample_rate as u64 * format.channels as u64 * sink_bps as u64;

            let frames_per_ms = (format.sample_rate as usize + 999) / 1000;
            let cycle = frames_per_ms * format.channels as usize * sink_bps;

            let low_bitrate = sink_bps <= 2 && format.sample_rate <= 48_000;
            let prefill_ms = if low_bitrate {
                PCM_LOWRATE_PREFILL_MS
            } else {
                PCM_PREFILL_MS
            };

            (
                PlanState {
                    conversion: plan.conversion,
                    channels: format.channels as usize,
                    decoder_bits: plan.decoder_bits,
                    is_dsd: false,
                    bytes_per_cycle: cycle,
                },
                ring_size(bytes_per_second, PCM_RING_SECONDS),
                prefill_target(bytes_per_second, prefill_ms),
                PCM_SILENCE_BYTE,
            )
        };

        let _push = self.push_lock.lock().unwrap();
        {
            let mut ring = self.ring.write().unwrap();
            ring.resize(ring_bytes, silence);
        }
        let prefill = prefill.min(ring_bytes / 4);
        *self.plan.lock().unwrap() = state.clone();
        self.prefill_target.store(prefill, Ordering::Release);
        self.prefill_complete.store(false, Ordering::Release);
        self.post_online_done.store(false, Ordering::Release);
        self.stabilization_count.store(0, Ordering::Release);
        self.shutdown_silence.store(0, Ordering::Release);
        self.stop_requested.store(false, Ordering::Release);
        self.push_count.store(0, Ordering::Relaxed);
        self.cycle_count.store(0, Ordering::Relaxed);

        tracing::info!(
            format = %format,
            ring_bytes = ring_bytes,
            prefill_bytes = prefill,
            cycle_bytes = state.bytes_per_cycle,
            "pipeline configured"
        );
    }

    /// Chunk size for the current mode.
    pub fn chunk_samples(&self) -> usize {
        if self.plan.lock().unwrap().is_dsd {
            DSD_CHUNK_SAMPLES
        } else {
            PCM_CHUNK_SAMPLES
        }
    }

    /// Fixed buffer size the sink worker must pull per cycle.
    pub fn bytes_per_cycle(&self) -> usize {
        self.plan.lock().unwrap().bytes_per_cycle
    }

    /// One producer tick: decode up to `num_samples` and push them into
    /// the ring through the conversion plan.
    ///
    /// The ring is checked for room for the whole converted chunk before
    /// the decoder is touched, so a push never truncates mid-chunk (which
    /// would tear planar DSD layout and drop audio).
    pub fn produce(&self, decoder: &mut Decoder, num_samples: usize) -> Result<Produce, DecodeError> {
        let (conversion, channels, decoder_bits, is_dsd) = {
            let plan = self.plan.lock().unwrap();
            (plan.conversion, plan.channels, plan.decoder_bits, plan.is_dsd)
        };
        // Output rate tracks the source; the sink adapts depth, not rate.
        let target_rate = decoder.info().sample_rate;

        let expected_out = if is_dsd {
            num_samples * channels / 8
        } else {
            let in_bytes = num_samples * channels * if decoder_bits == 16 { 2 } else { 4 };
            match conversion {
                ConversionPlan::Pack24 => in_bytes / 4 * 3,
                ConversionPlan::Upsample16To32 => in_bytes * 2,
                _ => in_bytes,
            }
        };

        {
            let ring = self.ring.read().unwrap();
            if ring.free() < expected_out {
                return Ok(Produce::RingFull);
            }
        }

        let mut scratch = self.scratch.lock().unwrap();
        let samples = decoder.read_samples(&mut scratch, num_samples, target_rate, decoder_bits)?;
        if samples == 0 {
            return Ok(Produce::Eof);
        }

        let _push = self.push_lock.lock().unwrap();
        let ring = self.ring.read().unwrap();
        let consumed = match conversion {
            ConversionPlan::Direct => ring.push(&scratch),
            ConversionPlan::Pack24 => ring.push_pack_24(&scratch),
            ConversionPlan::Upsample16To32 => ring.push_upsample_16_to_32(&scratch),
            ConversionPlan::DsdPlanar {
                bit_reverse,
                byte_swap,
            } => ring.push_dsd_planar(
                &scratch,
                channels,
                bit_reverse.then_some(&BIT_REVERSE_TABLE),
                byte_swap,
            ),
        };

        if consumed < scratch.len() {
            // Should not happen given the free-space check above.
            tracing::warn!(
                offered = scratch.len(),
                consumed = consumed,
                "ring truncated a push"
            );
        }

        if !self.prefill_complete.load(Ordering::Acquire)
            && ring.available() >= self.prefill_target.load(Ordering::Acquire)
        {
            self.prefill_complete.store(true, Ordering::Release);
            tracing::info!(bytes = ring.available(), "prefill complete");
        }

        let count = self.push_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count <= 3 || count % 500 == 0 {
            tracing::debug!(
                push = count,
                bytes_in = scratch.len(),
                bytes_out = consumed,
                available = ring.available(),
                "produce"
            );
        }

        Ok(Produce::Pushed(samples))
    }

    /// Fill one sink cycle buffer. Invoked by the sink worker.
    pub fn fill_cycle(&self, buf: &mut [u8]) {
        let silence = {
            let ring = self.ring.read().unwrap();
            ring.silence_byte()
        };

        // Shutdown silence takes priority over everything.
        let remaining = self.shutdown_silence.load(Ordering::Acquire);
        if remaining > 0 {
            buf.fill(silence);
            self.shutdown_silence.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if self.stop_requested.load(Ordering::Acquire) {
            buf.fill(silence);
            return;
        }

        if !self.prefill_complete.load(Ordering::Acquire) {
            buf.fill(silence);
            return;
        }

        if !self.post_online_done.load(Ordering::Acquire) {
            let count = self.stabilization_count.fetch_add(1, Ordering::AcqRel) + 1;
            if count >= POST_ONLINE_SILENCE_CYCLES {
                self.post_online_done.store(true, Ordering::Release);
                tracing::debug!("post-online stabilization complete");
            }
            buf.fill(silence);
            return;
        }

        let cycle = self.cycle_count.fetch_add(1, Ordering::AcqRel) + 1;
        let ring = self.ring.read().unwrap();
        let available = ring.available();

        if available < buf.len() {
            let underruns = self.underrun_cycles.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::warn!(
                cycle = cycle,
                available = available,
                needed = buf.len(),
                underruns = underruns,
                "underrun, emitting silence"
            );
            // Re-arm the prefill gate: audio resumes only once the ring
            // has refilled to the target, not on the next lone chunk.
            self.prefill_complete.store(false, Ordering::Release);
            buf.fill(silence);
            return;
        }

        ring.pop(buf);
    }

    /// Ask the consumer to emit `cycles` of silence before anything else.
    pub fn request_shutdown_silence(&self, cycles: u32) {
        self.shutdown_silence.store(cycles, Ordering::Release);
        tracing::debug!(cycles = cycles, "shutdown silence requested");
    }

    /// Silence cycle count for the current mode's close sequence.
    pub fn shutdown_silence_cycles(&self) -> u32 {
        if self.plan.lock().unwrap().is_dsd {
            DSD_SHUTDOWN_SILENCE_CYCLES
        } else {
            PCM_SHUTDOWN_SILENCE_CYCLES
        }
    }

    /// Block until the requested shutdown silence has drained, bounded by
    /// `timeout`. Returns false on timeout.
    pub fn wait_silence_drained(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while self.shutdown_silence.load(Ordering::Acquire) > 0 {
            if start.elapsed() > timeout {
                tracing::warn!("shutdown silence drain timed out");
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop_requested.store(false, Ordering::Release);
    }

    /// Clear buffered audio and re-arm the prefill gate. Producer and
    /// consumer must be quiesced.
    pub fn reset_buffer(&self) {
        let _push = self.push_lock.lock().unwrap();
        let ring = self.ring.read().unwrap();
        ring.clear();
        ring.fill_with_silence();
        self.prefill_complete.store(false, Ordering::Release);
        self.post_online_done.store(false, Ordering::Release);
        self.stabilization_count.store(0, Ordering::Release);
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.prefill_complete.load(Ordering::Acquire)
    }

    pub fn underrun_cycles(&self) -> u64 {
        self.underrun_cycles.load(Ordering::Relaxed)
    }

    /// Ring fill fraction, 0.0 to 1.0.
    pub fn buffer_fill(&self) -> f32 {
        let ring = self.ring.read().unwrap();
        if ring.size() == 0 {
            return 0.0;
        }
        ring.available() as f32 / ring.size() as f32
    }

    pub fn buffer_empty(&self) -> bool {
        self.ring.read().unwrap().available() == 0
    }

    /// True once less than one whole cycle remains buffered. The
    /// consumer cannot deliver a partial cycle, so this is as drained as
    /// the ring gets while a track ends.
    pub fn buffer_drained(&self) -> bool {
        let cycle = self.plan.lock().unwrap().bytes_per_cycle;
        self.ring.read().unwrap().available() < cycle
    }
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new()
    }
}

fn ring_size(bytes_per_second: u64, seconds: f64) -> usize {
    let size = (bytes_per_second as f64 * seconds) as usize;
    size.clamp(MIN_RING_BYTES, MAX_RING_BYTES)
}

fn prefill_target(bytes_per_second: u64, prefill_ms: u64) -> usize {
    let bytes = (bytes_per_second * prefill_ms / 1000) as usize;
    bytes.max(MIN_PREFILL_BYTES)
}
