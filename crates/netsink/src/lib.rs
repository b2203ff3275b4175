//! Client for the netsink LAN audio sink protocol.
//!
//! - [`discover`]: UDP broadcast target discovery and MTU probing
//! - [`cycle`]: transfer cadence calculation from MTU and byte rate
//! - [`transport`]: the connected sink client and its cycle worker
//!
//! The engine consumes the [`Sink`] trait rather than the concrete
//! client, so playback logic can be exercised against a test double.

pub mod cycle;
pub mod discover;
pub mod transport;

use std::time::Duration;

use renderer_types::{AudioFormat, SinkCaps};
use thiserror::Error;

pub use cycle::CycleCalculator;
pub use discover::{discover, scan, DiscoveryConfig, SinkTarget};
pub use transport::NetSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink discovery failed: {0}")]
    DiscoveryFailed(String),

    #[error("{0} sink targets found; select one with a target index")]
    AmbiguousTarget(usize),

    #[error("format negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("sink is not connected")]
    NotConnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Callback the sink worker invokes once per cycle to obtain audio.
///
/// The buffer arrives zero-filled and sized to the negotiated
/// bytes-per-cycle; the implementation fills it completely (silence on
/// underrun) and must not block on the producer.
pub trait SinkPull: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Control surface of a connected sink, as consumed by the track engine.
pub trait Sink: Send + Sync {
    fn capabilities(&self) -> SinkCaps;

    /// Negotiate `format` with the target. The target may downgrade; the
    /// returned format is the operative one. `cycle_time` sets the
    /// submission cadence and `bytes_per_cycle` the fixed buffer size
    /// pulled each cycle.
    fn open(
        &self,
        format: AudioFormat,
        cycle_time: Duration,
        bytes_per_cycle: usize,
    ) -> Result<AudioFormat, SinkError>;

    fn pause(&self);
    fn resume(&self);
    fn stop(&self, immediate: bool);
    fn close(&self);
    fn is_online(&self) -> bool;
    fn buffer_empty(&self) -> bool;
}
