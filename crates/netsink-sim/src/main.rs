//! Simulated netsink target for development and soak testing.
//!
//! Answers discovery, MTU probes, and format negotiation like a real
//! DAC-fronting endpoint, then consumes AUDIO frames and reports stream
//! statistics (cycle rate, sequence gaps, silence vs data). Useful for
//! exercising the renderer end-to-end without hardware on the LAN.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use netsink_proto::{
    decode_datagram, decode_format_payload, encode_datagram, encode_format_payload,
    encode_hello_ack_payload, encode_mtu_ack_payload, FrameKind, WireFormat,
};
use renderer_types::{DsdBitOrder, DsdLayout, Endianness, SinkCaps};

#[derive(Parser, Debug)]
#[command(name = "netsink-sim", version)]
struct Args {
    /// UDP bind address
    #[arg(long, default_value = "0.0.0.0:47001")]
    bind: SocketAddr,

    /// Target name reported in HELLO_ACK
    #[arg(long, default_value = "netsink-sim")]
    name: String,

    /// Force every PCM negotiation down to 16-bit (optical-out behavior)
    #[arg(long)]
    force_16bit: bool,

    /// Disable DSD support
    #[arg(long)]
    no_dsd: bool,

    /// Seconds between stream statistics reports
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,
}

/// Running statistics for the current audio stream.
#[derive(Default)]
struct StreamStats {
    cycles: u64,
    bytes: u64,
    silence_cycles: u64,
    seq_gaps: u64,
    last_seq: Option<u64>,
    started: Option<Instant>,
}

impl StreamStats {
    fn record(&mut self, seq: u64, samples: &[u8], silence_byte: u8) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        self.cycles += 1;
        self.bytes += samples.len() as u64;
        if samples.iter().all(|&b| b == silence_byte) {
            self.silence_cycles += 1;
        }
        if let Some(last) = self.last_seq {
            if seq != last + 1 {
                self.seq_gaps += 1;
            }
        }
        self.last_seq = Some(seq);
    }

    fn report(&self) {
        let elapsed = self
            .started
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let cycles_per_second = if elapsed > 0.0 {
            self.cycles as f64 / elapsed
        } else {
            0.0
        };
        tracing::info!(
            cycles = self.cycles,
            bytes = self.bytes,
            silence_cycles = self.silence_cycles,
            seq_gaps = self.seq_gaps,
            cycles_per_second = cycles_per_second,
            "stream statistics"
        );
    }
}

fn capabilities(args: &Args) -> SinkCaps {
    let pcm_bits = if args.force_16bit {
        vec![16]
    } else {
        vec![16, 24, 32]
    };
    let dsd_layouts = if args.no_dsd {
        vec![]
    } else {
        vec![
            DsdLayout {
                bit_order: DsdBitOrder::LsbFirst,
                endianness: Endianness::Big,
            },
            DsdLayout {
                bit_order: DsdBitOrder::MsbFirst,
                endianness: Endianness::Big,
            },
        ]
    };
    SinkCaps {
        pcm_bits,
        dsd_layouts,
    }
}

/// Apply the simulated target's own constraints to a requested format.
fn accept_format(requested: &WireFormat, caps: &SinkCaps) -> WireFormat {
    let mut accepted = *requested;
    if !accepted.is_dsd {
        let bits = accepted.bit_depth as u32;
        if !caps.pcm_bits.contains(&bits) {
            // Downgrade to the widest depth the target actually takes.
            accepted.bit_depth = caps.pcm_bits.iter().copied().max().unwrap_or(16) as u8;
        }
    }
    accepted
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let socket = UdpSocket::bind(args.bind).with_context(|| format!("bind {}", args.bind))?;
    socket.set_read_timeout(Some(Duration::from_millis(250)))?;
    tracing::info!(bind = %args.bind, name = %args.name, "simulated target listening");

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        let _ = ctrlc::set_handler(move || {
            running.store(false, Ordering::Release);
        });
    }

    let caps = capabilities(&args);
    let mut stats = StreamStats::default();
    let mut silence_byte = 0u8;
    let mut last_report = Instant::now();
    let stats_interval = Duration::from_secs(args.stats_interval.max(1));
    let mut buf = vec![0u8; 64 * 1024];

    while running.load(Ordering::Acquire) {
        if last_report.elapsed() >= stats_interval && stats.cycles > 0 {
            stats.report();
            last_report = Instant::now();
        }

        let (n, from) = match socket.recv_from(&mut buf) {
            Ok(x) => x,
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        let (kind, payload) = match decode_datagram(&buf[..n]) {
            Ok(x) => x,
            Err(_) => continue, // unrelated traffic
        };

        match kind {
            FrameKind::Hello => {
                tracing::info!(from = %from, "hello");
                let ack = encode_hello_ack_payload(&args.name, &caps)?;
                socket.send_to(&encode_datagram(FrameKind::HelloAck, &ack)?, from)?;
            }
            FrameKind::MtuProbe => {
                // Echo the wire size (IP+UDP headers included) so the
                // renderer can take the largest probe that survived.
                let echoed = (n as u32) + 28;
                socket.send_to(
                    &encode_datagram(FrameKind::MtuAck, &encode_mtu_ack_payload(echoed))?,
                    from,
                )?;
            }
            FrameKind::SetFormat => {
                let requested = match decode_format_payload(payload) {
                    Ok(f) => f,
                    Err(e) => {
                        tracing::warn!(error = %e, "bad SET_FORMAT");
                        continue;
                    }
                };
                let accepted = accept_format(&requested, &caps);
                silence_byte = if accepted.is_dsd { 0x69 } else { 0x00 };
                stats = StreamStats::default();
                tracing::info!(
                    rate_hz = accepted.sample_rate,
                    bits = accepted.bit_depth,
                    channels = accepted.channels,
                    dsd = accepted.is_dsd,
                    cycle_us = accepted.cycle_us,
                    downgraded = accepted != requested,
                    "format accepted"
                );
                socket.send_to(
                    &encode_datagram(FrameKind::FormatAck, &encode_format_payload(&accepted))?,
                    from,
                )?;
            }
            FrameKind::Audio => {
                if payload.len() >= 8 {
                    let seq = u64::from_le_bytes([
                        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                        payload[6], payload[7],
                    ]);
                    stats.record(seq, &payload[8..], silence_byte);
                }
            }
            FrameKind::Pause => tracing::info!("pause"),
            FrameKind::Resume => tracing::info!("resume"),
            FrameKind::Stop => {
                tracing::info!("stop");
                stats.report();
            }
            FrameKind::Bye => {
                tracing::info!("bye");
                stats.report();
                stats = StreamStats::default();
            }
            _ => {}
        }
    }

    tracing::info!("simulated target shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(rate: u32, bits: u8, dsd: bool) -> WireFormat {
        WireFormat {
            sample_rate: rate,
            bit_depth: bits,
            channels: 2,
            is_dsd: dsd,
            dsd_lsb_first: true,
            dsd_little_endian: false,
            cycle_us: 8_000,
        }
    }

    #[test]
    fn accept_format_passes_supported_pcm() {
        let caps = SinkCaps {
            pcm_bits: vec![16, 24, 32],
            dsd_layouts: vec![],
        };
        let requested = wire(44_100, 32, false);
        assert_eq!(accept_format(&requested, &caps), requested);
    }

    #[test]
    fn accept_format_downgrades_unsupported_depth() {
        let caps = SinkCaps {
            pcm_bits: vec![16],
            dsd_layouts: vec![],
        };
        let accepted = accept_format(&wire(44_100, 32, false), &caps);
        assert_eq!(accepted.bit_depth, 16);
        assert_eq!(accepted.sample_rate, 44_100);
    }

    #[test]
    fn accept_format_leaves_dsd_untouched() {
        let caps = SinkCaps {
            pcm_bits: vec![16],
            dsd_layouts: vec![],
        };
        let requested = wire(2_822_400, 1, true);
        assert_eq!(accept_format(&requested, &caps), requested);
    }

    #[test]
    fn stats_track_sequence_gaps_and_silence() {
        let mut stats = StreamStats::default();
        stats.record(0, &[0, 0, 0, 0], 0);
        stats.record(1, &[1, 2, 3, 4], 0);
        stats.record(5, &[0, 0, 0, 0], 0);

        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.silence_cycles, 2);
        assert_eq!(stats.seq_gaps, 1);
        assert_eq!(stats.bytes, 12);
    }
}
