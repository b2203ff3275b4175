//! Control-callback facade.
//!
//! Serializes inbound transport callbacks behind one mutex and pairs the
//! producer's per-tick callback guard with a bounded wait, so a stop or
//! URI change can quiesce the audio path before mutating shared state.
//! Control points that send SetURI without a prior Stop get an automatic
//! stop first; that keeps decoder teardown off the audio callback path
//! and makes format changes across SetURI predictable.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use renderer_audio::AudioPipeline;
use renderer_types::{RendererState, StatusSnapshot};

use netsink::Sink;

use crate::engine::TrackEngine;
use crate::timefmt::parse_time_string;

/// Bound on waiting for an in-flight producer callback during stop.
const CALLBACK_WAIT: Duration = Duration::from_secs(5);

/// Minimum quiet time between a stop and the next play.
const POST_STOP_DELAY: Duration = Duration::from_millis(100);

/// Tracks whether a producer callback is in flight.
///
/// The producer wraps every engine tick in [`CallbackGate::enter`]; the
/// facade waits on the gate before tearing down decoders. The guard
/// signals completion on every exit path, including panics.
pub struct CallbackGate {
    running: Mutex<bool>,
    cv: Condvar,
}

impl CallbackGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn enter(&self) -> CallbackGuard<'_> {
        *self.running.lock().unwrap() = true;
        CallbackGuard { gate: self }
    }

    /// Wait until no callback is in flight, bounded by `timeout`.
    /// Returns false when the window elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let guard = self.running.lock().unwrap();
        let (guard, result) = self
            .cv
            .wait_timeout_while(guard, timeout, |running| *running)
            .unwrap();
        drop(guard);
        !result.timed_out()
    }
}

pub struct CallbackGuard<'a> {
    gate: &'a CallbackGate,
}

impl Drop for CallbackGuard<'_> {
    fn drop(&mut self) {
        *self.gate.running.lock().unwrap() = false;
        self.gate.cv.notify_all();
    }
}

pub struct RendererFacade {
    /// Serializes inbound control callbacks.
    control: Mutex<()>,
    engine: Arc<TrackEngine>,
    pipeline: Arc<AudioPipeline>,
    sink: Arc<dyn Sink>,
    gate: Arc<CallbackGate>,

    // Pass-through control-point settings; no audio effect.
    volume: AtomicU8,
    muted: AtomicBool,

    last_stop: Mutex<Option<Instant>>,
}

impl RendererFacade {
    pub fn new(
        engine: Arc<TrackEngine>,
        pipeline: Arc<AudioPipeline>,
        sink: Arc<dyn Sink>,
        gate: Arc<CallbackGate>,
    ) -> Arc<Self> {
        Arc::new(Self {
            control: Mutex::new(()),
            engine,
            pipeline,
            sink,
            gate,
            volume: AtomicU8::new(100),
            muted: AtomicBool::new(false),
            last_stop: Mutex::new(None),
        })
    }

    pub fn gate(&self) -> Arc<CallbackGate> {
        self.gate.clone()
    }

    pub fn engine(&self) -> Arc<TrackEngine> {
        self.engine.clone()
    }

    pub fn on_set_current_uri(&self, uri: &str, metadata: &str) {
        let _serial = self.control.lock().unwrap();
        tracing::info!(uri = %crate::truncate_uri(uri), "SetURI");

        let state = self.engine.state();
        if state != RendererState::Stopped {
            // Some control points skip the Stop; do it for them so the
            // audio callback never races decoder teardown.
            tracing::info!(state = %state, "auto-stop before URI change");
            self.stop_engine();
        }

        self.engine.set_current_uri(uri, metadata, false);
    }

    pub fn on_set_next_uri(&self, uri: &str, metadata: &str) {
        let _serial = self.control.lock().unwrap();
        tracing::info!(uri = %crate::truncate_uri(uri), "SetNextURI");
        self.engine.set_next_uri(uri, metadata);
    }

    pub fn on_play(&self) -> bool {
        let _serial = self.control.lock().unwrap();
        tracing::info!("Play");

        // A connected, paused sink resumes in place; anything else goes
        // through reopen and the producer's open-on-first-data path.
        if !(self.sink.is_online() && self.engine.state() == RendererState::Paused) {
            if !self.sink.is_online() && self.engine.state() == RendererState::Stopped {
                self.engine.reopen_current();
            }
            self.honor_post_stop_delay();
        }

        self.engine.play()
    }

    pub fn on_pause(&self) {
        let _serial = self.control.lock().unwrap();
        tracing::info!("Pause");
        self.engine.pause();
    }

    pub fn on_stop(&self) {
        let _serial = self.control.lock().unwrap();
        tracing::info!("Stop");
        self.stop_engine();
        // Rearm the same track at position zero for the next play.
        self.engine.reopen_current();
    }

    /// Seek to a transport time string. Returns false for unparsable
    /// targets or raw-DSD streams; playback state is untouched either
    /// way.
    pub fn on_seek(&self, target: &str) -> bool {
        let _serial = self.control.lock().unwrap();
        tracing::info!(target = %target, "Seek");

        let Some(seconds) = parse_time_string(target) else {
            tracing::warn!(target = %target, "invalid seek time");
            return false;
        };
        self.engine.seek(seconds)
    }

    pub fn on_set_volume(&self, volume: u8) {
        let clamped = volume.min(100);
        self.volume.store(clamped, Ordering::Release);
        tracing::info!(volume = clamped, "volume (pass-through)");
    }

    pub fn on_get_volume(&self) -> u8 {
        self.volume.load(Ordering::Acquire)
    }

    pub fn on_set_mute(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
        tracing::info!(muted = muted, "mute (pass-through)");
    }

    pub fn on_get_mute(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn status(&self) -> StatusSnapshot {
        let (uri, info, operative) = self.engine.track_status();
        let state = self.engine.state();

        StatusSnapshot {
            state: Some(state),
            uri: if uri.is_empty() { None } else { Some(uri) },
            track_number: Some(self.engine.track_number()),
            position_seconds: Some(self.engine.position_seconds()),
            duration_seconds: Some(self.engine.duration_seconds()),
            sample_rate: operative.map(|f| f.sample_rate),
            bit_depth: operative.map(|f| f.bit_depth),
            channels: operative.map(|f| f.channels),
            codec: if info.codec.is_empty() {
                None
            } else {
                Some(info.codec)
            },
            is_dsd: Some(info.is_dsd),
            sink_online: Some(self.sink.is_online()),
            underrun_cycles: Some(self.pipeline.underrun_cycles()),
            buffer_fill: Some(self.pipeline.buffer_fill()),
            volume: Some(self.on_get_volume()),
            muted: Some(self.on_get_mute()),
        }
    }

    fn stop_engine(&self) {
        self.engine.stop_request();
        if !self.gate.wait_idle(CALLBACK_WAIT) {
            tracing::warn!("producer callback did not finish in time, closing sink anyway");
        }
        self.engine.finalize_stop();
        *self.last_stop.lock().unwrap() = Some(Instant::now());
    }

    /// A DAC that just saw a stop needs a moment before traffic resumes.
    fn honor_post_stop_delay(&self) {
        let since = self.last_stop.lock().unwrap().map(|t| t.elapsed());
        if let Some(elapsed) = since {
            if elapsed < POST_STOP_DELAY {
                std::thread::sleep(POST_STOP_DELAY - elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RendererEvent;
    use crate::testsink::MockSink;
    use crate::testutil::{wav_fixture, write_temp};
    use crossbeam_channel::Receiver;

    fn facade_fixture() -> (
        Arc<RendererFacade>,
        Arc<MockSink>,
        Receiver<RendererEvent>,
    ) {
        let sink = Arc::new(MockSink::pcm_all());
        let pipeline = Arc::new(AudioPipeline::new());
        let (tx, rx) = crossbeam_channel::unbounded();
        let engine = TrackEngine::new(pipeline.clone(), sink.clone(), 1_500, tx);
        let facade = RendererFacade::new(engine, pipeline, sink.clone(), CallbackGate::new());
        (facade, sink, rx)
    }

    fn wav_track(name: &str, seconds: f64) -> String {
        let frames: Vec<i16> = (0..(44_100.0 * seconds) as usize * 2)
            .map(|i| (i % 100) as i16)
            .collect();
        write_temp(name, &wav_fixture(44_100, 2, &frames))
            .to_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn set_uri_while_playing_auto_stops_first() {
        let (facade, sink, _rx) = facade_fixture();
        let a = wav_track("facade-auto-a.wav", 0.5);
        let b = wav_track("facade-auto-b.wav", 0.5);

        facade.on_set_current_uri(&a, "");
        assert!(facade.on_play());
        facade.engine().process(); // opens the sink
        assert_eq!(facade.engine().state(), RendererState::Playing);

        facade.on_set_current_uri(&b, "");
        // Equivalent to stop + set: state is Stopped, sink closed.
        assert_eq!(facade.engine().state(), RendererState::Stopped);
        assert_eq!(sink.close_count(), 1);

        // The new URI plays from scratch.
        assert!(facade.on_play());
        assert_eq!(facade.engine().state(), RendererState::Playing);

        let _ = std::fs::remove_file(a);
        let _ = std::fs::remove_file(b);
    }

    #[test]
    fn stop_then_play_restarts_same_track() {
        let (facade, _sink, _rx) = facade_fixture();
        let a = wav_track("facade-restart.wav", 0.5);

        facade.on_set_current_uri(&a, "");
        assert!(facade.on_play());
        facade.engine().process();

        facade.on_stop();
        assert_eq!(facade.engine().state(), RendererState::Stopped);

        assert!(facade.on_play());
        assert_eq!(facade.engine().state(), RendererState::Playing);
        assert_eq!(facade.engine().position_seconds(), 0);

        let _ = std::fs::remove_file(a);
    }

    #[test]
    fn seek_rejects_invalid_time_strings() {
        let (facade, _sink, _rx) = facade_fixture();
        assert!(!facade.on_seek("not-a-time"));
        assert!(!facade.on_seek(""));
    }

    #[test]
    fn seek_parses_and_delegates() {
        let (facade, _sink, _rx) = facade_fixture();
        let a = wav_track("facade-seek.wav", 2.0);

        facade.on_set_current_uri(&a, "");
        assert!(facade.on_play());
        assert!(facade.on_seek("00:00:01"));
        assert_eq!(facade.engine().position_seconds(), 1);

        let _ = std::fs::remove_file(a);
    }

    #[test]
    fn volume_and_mute_are_pass_through() {
        let (facade, _sink, _rx) = facade_fixture();
        assert_eq!(facade.on_get_volume(), 100);
        facade.on_set_volume(42);
        assert_eq!(facade.on_get_volume(), 42);
        facade.on_set_volume(200);
        assert_eq!(facade.on_get_volume(), 100);

        assert!(!facade.on_get_mute());
        facade.on_set_mute(true);
        assert!(facade.on_get_mute());
    }

    #[test]
    fn status_reflects_state_and_settings() {
        let (facade, _sink, _rx) = facade_fixture();
        facade.on_set_volume(55);

        let status = facade.status();
        assert_eq!(status.state, Some(RendererState::Stopped));
        assert_eq!(status.volume, Some(55));
        assert_eq!(status.sink_online, Some(false));
        assert!(status.uri.is_none());
    }

    #[test]
    fn callback_gate_bounds_the_wait() {
        let gate = CallbackGate::new();
        // Idle gate returns immediately.
        assert!(gate.wait_idle(Duration::from_millis(10)));

        let guard = gate.enter();
        assert!(!gate.wait_idle(Duration::from_millis(20)));
        drop(guard);
        assert!(gate.wait_idle(Duration::from_millis(10)));
    }
}
