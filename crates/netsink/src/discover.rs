//! Sink target discovery and MTU probing.
//!
//! Discovery is a broadcast HELLO with a bounded number of retries; every
//! HELLO_ACK received within the listen window is a candidate target.
//! With several candidates the caller must select one by index. The MTU
//! is then measured with padded echo probes against the chosen target,
//! falling back to 1500 when no probe round-trips.

use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use netsink_proto::{decode_datagram, decode_hello_ack_payload, encode_datagram, FrameKind};
use renderer_types::SinkCaps;

use crate::SinkError;

/// Probe sizes tried largest-first; the first that round-trips wins.
const MTU_CANDIDATES: [u32; 3] = [16_128, 9_000, 1_500];
pub const MTU_FALLBACK: u32 = 1_500;

#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    /// UDP port sink targets listen on.
    pub port: u16,
    /// Address the HELLO is sent to; overriding it lets tests run
    /// against a loopback target.
    pub broadcast: Option<SocketAddr>,
    pub attempts: u32,
    pub listen_window: Duration,
    /// Non-zero skips MTU probing.
    pub mtu_override: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 47_001,
            broadcast: None,
            attempts: 3,
            listen_window: Duration::from_secs(1),
            mtu_override: 0,
        }
    }
}

/// A discovered sink target.
#[derive(Clone, Debug)]
pub struct SinkTarget {
    pub name: String,
    pub addr: SocketAddr,
    pub caps: SinkCaps,
    pub mtu: u32,
}

/// Scan the LAN and return every sink target that answered, in response
/// order. MTUs are left at the fallback; `discover` probes the selected
/// target only.
pub fn scan(config: &DiscoveryConfig) -> Result<Vec<SinkTarget>, SinkError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;
    scan_with_socket(&socket, config)
}

fn scan_with_socket(
    socket: &UdpSocket,
    config: &DiscoveryConfig,
) -> Result<Vec<SinkTarget>, SinkError> {
    let broadcast = config
        .broadcast
        .unwrap_or_else(|| SocketAddr::from(([255, 255, 255, 255], config.port)));

    let hello = encode_datagram(FrameKind::Hello, b"netsink-renderer")?;

    let mut targets: Vec<SinkTarget> = Vec::new();
    for attempt in 0..config.attempts.max(1) {
        if attempt > 0 {
            tracing::debug!(attempt = attempt, "discovery retry");
        }
        socket.send_to(&hello, broadcast)?;

        let deadline = Instant::now() + config.listen_window;
        let mut buf = [0u8; 2048];
        while Instant::now() < deadline {
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
                Err(_) => continue, // unrelated broadcast traffic
            };
            if kind != FrameKind::HelloAck {
                continue;
            }
            let (name, caps) = match decode_hello_ack_payload(payload) {
                Ok(x) => x,
                Err(e) => {
                    tracing::debug!(from = %from, error = %e, "malformed HELLO_ACK");
                    continue;
                }
            };

            if targets.iter().all(|t| t.addr != from) {
                tracing::info!(name = %name, addr = %from, "sink target found");
                targets.push(SinkTarget {
                    name,
                    addr: from,
                    caps,
                    mtu: MTU_FALLBACK,
                });
            }
        }

        if !targets.is_empty() {
            break;
        }
    }

    Ok(targets)
}

/// Scan the LAN for sink targets and select one.
///
/// With exactly one responder it is selected outright; with several, a
/// `target_index` (0-based) is required. The selected target's MTU is
/// probed before returning.
pub fn discover(
    config: &DiscoveryConfig,
    target_index: Option<usize>,
) -> Result<SinkTarget, SinkError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_broadcast(true)?;
    socket.set_read_timeout(Some(Duration::from_millis(100)))?;

    let mut targets = scan_with_socket(&socket, config)?;

    if targets.is_empty() {
        return Err(SinkError::DiscoveryFailed(format!(
            "no targets responded on port {} after {} attempts",
            config.port, config.attempts
        )));
    }

    let mut target = match (targets.len(), target_index) {
        (1, None) => targets.remove(0),
        (n, Some(idx)) if idx < n => targets.remove(idx),
        (n, Some(idx)) => {
            return Err(SinkError::DiscoveryFailed(format!(
                "target index {idx} out of range ({n} found)"
            )))
        }
        (n, None) => return Err(SinkError::AmbiguousTarget(n)),
    };

    target.mtu = if config.mtu_override > 0 {
        tracing::info!(mtu = config.mtu_override, "using configured MTU");
        config.mtu_override
    } else {
        probe_mtu(&socket, target.addr)
    };

    Ok(target)
}

/// Measure the usable MTU with padded echo probes.
fn probe_mtu(socket: &UdpSocket, target: SocketAddr) -> u32 {
    let mut buf = vec![0u8; 20_000];

    for candidate in MTU_CANDIDATES {
        // Pad the payload so the datagram is candidate-sized on the wire
        // (28 bytes of IP+UDP headers).
        let pad = candidate.saturating_sub(28 + 11) as usize;
        let probe = match encode_datagram(FrameKind::MtuProbe, &vec![0u8; pad]) {
            Ok(p) => p,
            Err(_) => continue,
        };

        for _ in 0..2 {
            if socket.send_to(&probe, target).is_err() {
                break;
            }
            match socket.recv_from(&mut buf) {
                Ok((n, from)) if from == target => {
                    if let Ok((FrameKind::MtuAck, payload)) = decode_datagram(&buf[..n]) {
                        if let Ok(echoed) = netsink_proto::decode_mtu_ack_payload(payload) {
                            if echoed >= candidate {
                                tracing::info!(mtu = candidate, "MTU probe succeeded");
                                return candidate;
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    tracing::warn!(fallback = MTU_FALLBACK, "MTU probe failed, using fallback");
    MTU_FALLBACK
}

#[cfg(test)]
mod tests {
    use super::*;
    use netsink_proto::{encode_hello_ack_payload, encode_mtu_ack_payload};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    /// In-process fake target answering HELLO and MTU probes on loopback.
    fn spawn_fake_target(caps: SinkCaps) -> (SocketAddr, Arc<AtomicBool>) {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let done_thread = done.clone();

        std::thread::spawn(move || {
            let mut buf = [0u8; 20_000];
            while !done_thread.load(Ordering::Relaxed) {
                let (n, from) = match socket.recv_from(&mut buf) {
                    Ok(x) => x,
                    Err(_) => continue,
                };
                let Ok((kind, payload)) = decode_datagram(&buf[..n]) else {
                    continue;
                };
                match kind {
                    FrameKind::Hello => {
                        let ack = encode_hello_ack_payload("fake-dac", &caps).unwrap();
                        let dg = encode_datagram(FrameKind::HelloAck, &ack).unwrap();
                        let _ = socket.send_to(&dg, from);
                    }
                    FrameKind::MtuProbe => {
                        let echoed = (n as u32) + 28;
                        let dg = encode_datagram(
                            FrameKind::MtuAck,
                            &encode_mtu_ack_payload(echoed),
                        )
                        .unwrap();
                        let _ = socket.send_to(&dg, from);
                    }
                    _ => {}
                }
            }
        });

        (addr, done)
    }

    fn test_config(target: SocketAddr) -> DiscoveryConfig {
        DiscoveryConfig {
            port: target.port(),
            broadcast: Some(target),
            attempts: 2,
            listen_window: Duration::from_millis(200),
            mtu_override: 0,
        }
    }

    #[test]
    fn discovers_single_loopback_target() {
        let caps = SinkCaps {
            pcm_bits: vec![16, 24, 32],
            dsd_layouts: vec![],
        };
        let (addr, done) = spawn_fake_target(caps);

        let target = discover(&test_config(addr), None).unwrap();
        assert_eq!(target.name, "fake-dac");
        assert_eq!(target.addr, addr);
        assert_eq!(target.caps.pcm_bits, vec![16, 24, 32]);
        // The fake echoes every probe, so the largest candidate wins.
        assert_eq!(target.mtu, 16_128);

        done.store(true, Ordering::Relaxed);
    }

    #[test]
    fn mtu_override_skips_probing() {
        let (addr, done) = spawn_fake_target(SinkCaps::default());
        let mut config = test_config(addr);
        config.mtu_override = 9_000;

        let target = discover(&config, None).unwrap();
        assert_eq!(target.mtu, 9_000);

        done.store(true, Ordering::Relaxed);
    }

    #[test]
    fn no_responders_is_discovery_failure() {
        // Nothing listens on this socket's address after we drop it.
        let dead = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let addr = dead.local_addr().unwrap();
        drop(dead);

        let mut config = test_config(addr);
        config.attempts = 1;
        config.listen_window = Duration::from_millis(50);

        match discover(&config, None) {
            Err(SinkError::DiscoveryFailed(_)) => {}
            other => panic!("expected DiscoveryFailed, got {other:?}"),
        }
    }
}
