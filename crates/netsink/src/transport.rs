//! Connected sink client and its cycle worker.
//!
//! `NetSink` owns the UDP socket to a discovered target. `open` runs the
//! SET_FORMAT handshake (the target may downgrade the format) and starts
//! the worker thread, which wakes once per negotiated cycle, pulls one
//! fixed-size buffer from the registered [`SinkPull`], and submits it as
//! an AUDIO frame. The worker never blocks on the producer side; the
//! pipeline answers every pull, with silence when it must.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use netsink_proto::{
    decode_datagram, decode_format_payload, encode_audio_payload, encode_datagram,
    encode_format_payload, FrameKind, WireFormat,
};
use renderer_types::{AudioFormat, DsdBitOrder, SinkCaps};

use crate::discover::SinkTarget;
use crate::{Sink, SinkError, SinkPull};

/// Quiet period a DAC needs after a close before the next SET_FORMAT.
const RECONNECT_SETTLE: Duration = Duration::from_millis(500);

const NEGOTIATE_ATTEMPTS: u32 = 3;
const NEGOTIATE_BACKOFF: Duration = Duration::from_millis(250);

pub struct NetSink {
    inner: Arc<Inner>,
}

struct Inner {
    socket: UdpSocket,
    target: SinkTarget,

    pull: Mutex<Option<Arc<dyn SinkPull>>>,

    open: AtomicBool,
    online: AtomicBool,
    playing: AtomicBool,
    paused: AtomicBool,

    worker_running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,

    cycle_us: AtomicU64,
    bytes_per_cycle: AtomicUsize,
    seq: AtomicU64,
    submitted: AtomicU64,

    last_close: Mutex<Option<Instant>>,
}

impl NetSink {
    /// Bind a socket to the discovered target.
    pub fn connect(target: SinkTarget) -> Result<Self, SinkError> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(target.addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(500)))?;

        tracing::info!(name = %target.name, addr = %target.addr, mtu = target.mtu, "sink connected");

        Ok(Self {
            inner: Arc::new(Inner {
                socket,
                target,
                pull: Mutex::new(None),
                open: AtomicBool::new(false),
                online: AtomicBool::new(false),
                playing: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                worker_running: AtomicBool::new(false),
                worker: Mutex::new(None),
                cycle_us: AtomicU64::new(10_000),
                bytes_per_cycle: AtomicUsize::new(0),
                seq: AtomicU64::new(0),
                submitted: AtomicU64::new(0),
                last_close: Mutex::new(None),
            }),
        })
    }

    pub fn target(&self) -> &SinkTarget {
        &self.inner.target
    }

    /// Register the per-cycle audio source. Must happen before `open`.
    pub fn register_pull(&self, pull: Arc<dyn SinkPull>) {
        *self.inner.pull.lock().unwrap() = Some(pull);
    }

    pub fn submitted_cycles(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    fn start_worker(&self) {
        let mut guard = self.inner.worker.lock().unwrap();
        if guard.is_some() {
            return;
        }

        self.inner.worker_running.store(true, Ordering::Release);
        let inner = self.inner.clone();
        *guard = Some(std::thread::spawn(move || worker_loop(inner)));
    }

    fn stop_worker(&self) {
        self.inner.worker_running.store(false, Ordering::Release);
        let handle = self.inner.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    let mut scratch: Vec<u8> = Vec::new();
    let mut next = Instant::now();

    while inner.worker_running.load(Ordering::Acquire) {
        let cycle = Duration::from_micros(inner.cycle_us.load(Ordering::Acquire));

        if !inner.playing.load(Ordering::Acquire) || inner.paused.load(Ordering::Acquire) {
            std::thread::sleep(cycle.max(Duration::from_millis(1)));
            next = Instant::now();
            continue;
        }

        let want = inner.bytes_per_cycle.load(Ordering::Acquire);
        if want == 0 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        if scratch.len() != want {
            scratch.resize(want, 0);
        }
        scratch.fill(0);

        {
            let pull = inner.pull.lock().unwrap();
            if let Some(pull) = pull.as_ref() {
                pull.fill(&mut scratch);
            }
        }

        let seq = inner.seq.fetch_add(1, Ordering::AcqRel);
        let payload = encode_audio_payload(seq, &scratch);
        match encode_datagram(FrameKind::Audio, &payload) {
            Ok(dg) => {
                if let Err(e) = inner.socket.send(&dg) {
                    tracing::warn!(error = %e, "audio submit failed, cycle dropped");
                } else {
                    inner.submitted.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => tracing::warn!(error = %e, "audio frame encode failed"),
        }

        next += cycle;
        let now = Instant::now();
        match next.checked_duration_since(now) {
            Some(wait) => std::thread::sleep(wait),
            // Fell behind a full cycle; resynchronize rather than burst.
            None => next = now,
        }
    }
}

impl Sink for NetSink {
    fn capabilities(&self) -> SinkCaps {
        self.inner.target.caps.clone()
    }

    fn open(
        &self,
        format: AudioFormat,
        cycle_time: Duration,
        bytes_per_cycle: usize,
    ) -> Result<AudioFormat, SinkError> {
        // Let the DAC settle after a recent close before reconfiguring.
        let since_close = self
            .inner
            .last_close
            .lock()
            .unwrap()
            .map(|t| t.elapsed());
        if let Some(elapsed) = since_close {
            if elapsed < RECONNECT_SETTLE {
                std::thread::sleep(RECONNECT_SETTLE - elapsed);
            }
        }

        let wire = WireFormat {
            sample_rate: format.sample_rate,
            bit_depth: format.bit_depth.min(255) as u8,
            channels: format.channels.min(255) as u8,
            is_dsd: format.is_dsd,
            dsd_lsb_first: format.dsd_bit_order == DsdBitOrder::LsbFirst,
            dsd_little_endian: false,
            cycle_us: cycle_time.as_micros().min(u32::MAX as u128) as u32,
        };
        let request = encode_datagram(FrameKind::SetFormat, &encode_format_payload(&wire))?;

        let mut accepted: Option<WireFormat> = None;
        let mut buf = [0u8; 2048];
        for attempt in 0..NEGOTIATE_ATTEMPTS {
            if attempt > 0 {
                std::thread::sleep(NEGOTIATE_BACKOFF * attempt);
                tracing::debug!(attempt = attempt, "SET_FORMAT retry");
            }
            if self.inner.socket.send(&request).is_err() {
                continue;
            }
            match self.inner.socket.recv(&mut buf) {
                Ok(n) => {
                    if let Ok((FrameKind::FormatAck, payload)) = decode_datagram(&buf[..n]) {
                        if let Ok(ack) = decode_format_payload(payload) {
                            accepted = Some(ack);
                            break;
                        }
                    }
                }
                Err(_) => continue,
            }
        }

        let ack = accepted.ok_or_else(|| {
            SinkError::NegotiationFailed(format!(
                "no FORMAT_ACK from {} after {NEGOTIATE_ATTEMPTS} attempts",
                self.inner.target.addr
            ))
        })?;

        let accepted_format = AudioFormat {
            sample_rate: ack.sample_rate,
            bit_depth: ack.bit_depth as u32,
            channels: ack.channels as u32,
            is_dsd: ack.is_dsd,
            dsd_bit_order: if ack.is_dsd {
                if ack.dsd_lsb_first {
                    DsdBitOrder::LsbFirst
                } else {
                    DsdBitOrder::MsbFirst
                }
            } else {
                DsdBitOrder::Unknown
            },
        };

        if accepted_format != format {
            tracing::info!(
                requested = %format,
                accepted = %accepted_format,
                "target downgraded format"
            );
        }

        self.inner
            .cycle_us
            .store(ack.cycle_us.max(1) as u64, Ordering::Release);
        self.inner
            .bytes_per_cycle
            .store(bytes_per_cycle, Ordering::Release);
        self.inner.seq.store(0, Ordering::Release);
        self.inner.open.store(true, Ordering::Release);
        self.inner.online.store(true, Ordering::Release);
        self.inner.playing.store(true, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);

        self.start_worker();

        tracing::info!(
            format = %accepted_format,
            cycle_us = ack.cycle_us,
            bytes_per_cycle = bytes_per_cycle,
            "sink open"
        );
        Ok(accepted_format)
    }

    fn pause(&self) {
        self.inner.paused.store(true, Ordering::Release);
        let _ = encode_datagram(FrameKind::Pause, &[]).map(|dg| self.inner.socket.send(&dg));
        tracing::debug!("sink paused");
    }

    fn resume(&self) {
        self.inner.paused.store(false, Ordering::Release);
        let _ = encode_datagram(FrameKind::Resume, &[]).map(|dg| self.inner.socket.send(&dg));
        tracing::debug!("sink resumed");
    }

    fn stop(&self, immediate: bool) {
        self.inner.playing.store(false, Ordering::Release);
        self.inner.paused.store(false, Ordering::Release);
        let _ = encode_datagram(FrameKind::Stop, &[]).map(|dg| self.inner.socket.send(&dg));
        tracing::debug!(immediate = immediate, "sink stopped");
    }

    fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }

        self.inner.playing.store(false, Ordering::Release);
        self.stop_worker();
        let _ = encode_datagram(FrameKind::Bye, &[]).map(|dg| self.inner.socket.send(&dg));
        self.inner.online.store(false, Ordering::Release);
        *self.inner.last_close.lock().unwrap() = Some(Instant::now());

        tracing::info!("sink closed");
    }

    fn is_online(&self) -> bool {
        self.inner.open.load(Ordering::Acquire) && self.inner.online.load(Ordering::Acquire)
    }

    fn buffer_empty(&self) -> bool {
        // The wire protocol has no queue introspection; once the worker
        // is not submitting, nothing of ours is buffered target-side
        // beyond one cycle.
        !self.inner.playing.load(Ordering::Acquire)
    }
}

impl Drop for NetSink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::MTU_FALLBACK;
    /// Loopback target that acks SET_FORMAT, optionally forcing 16-bit.
    fn spawn_fake_target(force_16bit: bool) -> (SinkTarget, Arc<AtomicBool>) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done_thread = done.clone();

        std::thread::spawn(move || {
            let mut buf = [0u8; 64 * 1024];
            while !done_thread.load(Ordering::Relaxed) {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                let Ok((kind, payload)) = decode_datagram(&buf[..n]) else {
                    continue;
                };
                if kind == FrameKind::SetFormat {
                    let mut fmt = decode_format_payload(payload).unwrap();
                    if force_16bit && !fmt.is_dsd {
                        fmt.bit_depth = 16;
                    }
                    let dg =
                        encode_datagram(FrameKind::FormatAck, &encode_format_payload(&fmt))
                            .unwrap();
                    let _ = socket.send_to(&dg, from);
                }
            }
        });

        let target = SinkTarget {
            name: "fake-dac".to_string(),
            addr,
            caps: SinkCaps {
                pcm_bits: vec![16, 24, 32],
                dsd_layouts: vec![],
            },
            mtu: MTU_FALLBACK,
        };
        (target, done)
    }

    struct CountingPull(AtomicUsize);

    impl SinkPull for CountingPull {
        fn fill(&self, buf: &mut [u8]) {
            self.0.fetch_add(1, Ordering::Relaxed);
            buf.fill(0x42);
        }
    }

    #[test]
    fn open_negotiates_and_reports_accepted_format() {
        let (target, done) = spawn_fake_target(false);
        let sink = NetSink::connect(target).unwrap();

        let format = AudioFormat::pcm(44_100, 32, 2);
        let accepted = sink
            .open(format, Duration::from_micros(8_000), 180)
            .unwrap();
        assert_eq!(accepted, format);
        assert!(sink.is_online());

        sink.close();
        assert!(!sink.is_online());
        done.store(true, Ordering::Relaxed);
    }

    #[test]
    fn open_surfaces_target_downgrade() {
        let (target, done) = spawn_fake_target(true);
        let sink = NetSink::connect(target).unwrap();

        let requested = AudioFormat::pcm(44_100, 32, 2);
        let accepted = sink
            .open(requested, Duration::from_micros(8_000), 180)
            .unwrap();
        assert_eq!(accepted.bit_depth, 16);
        assert_ne!(accepted, requested);

        sink.close();
        done.store(true, Ordering::Relaxed);
    }

    #[test]
    fn worker_pulls_cycles_while_open() {
        let (target, done) = spawn_fake_target(false);
        let sink = NetSink::connect(target).unwrap();

        let pull = Arc::new(CountingPull(AtomicUsize::new(0)));
        sink.register_pull(pull.clone());

        sink.open(
            AudioFormat::pcm(44_100, 16, 2),
            Duration::from_micros(500),
            180,
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(50));
        sink.close();

        assert!(pull.0.load(Ordering::Relaxed) > 5);
        assert!(sink.submitted_cycles() > 5);
        done.store(true, Ordering::Relaxed);
    }

    #[test]
    fn negotiation_fails_without_target() {
        let dead = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let target = SinkTarget {
            name: "gone".to_string(),
            addr,
            caps: SinkCaps::default(),
            mtu: MTU_FALLBACK,
        };
        let sink = NetSink::connect(target).unwrap();
        let result = sink.open(
            AudioFormat::pcm(44_100, 16, 2),
            Duration::from_micros(8_000),
            180,
        );
        assert!(matches!(result, Err(SinkError::NegotiationFailed(_))));
    }
}
