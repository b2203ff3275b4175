//! Track lifecycle state machine.
//!
//! Owns the current and next decoders and drives the pipeline from the
//! producer thread. Transport state lives in an atomic so control
//! threads never need the engine lock just to read it; mutable track
//! state sits behind the engine mutex. The gapless next-URI arrives
//! through a pending slot that only the producer tick drains, keeping
//! control threads away from decoder state.
//!
//! Upstream events are collected while the engine lock is held and sent
//! only after it is released; the control layer may synchronously call
//! back in when it receives one.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use renderer_audio::format::negotiate;
use renderer_audio::pipeline::{Produce, FORMAT_SETTLE};
use renderer_audio::{AudioPipeline, DecodeError, Decoder};
use renderer_types::{AtomicState, AudioFormat, RendererState, SinkCaps, TrackInfo};

use netsink::{CycleCalculator, Sink};

use crate::events::RendererEvent;

/// Producer ticks the engine idles after the decoder runs dry before the
/// track counts as finished; the sink keeps draining meanwhile.
const EOS_DRAIN_TICKS: u32 = 5;

/// Bound on waiting for shutdown silence to reach the sink during a
/// format change; on timeout the sink is closed anyway.
const SILENCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on letting the ring drain through the sink after end of stream.
const EOS_RING_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

struct PendingNext {
    uri: String,
    metadata: String,
}

struct PreloadSlot {
    handle: Option<JoinHandle<()>>,
    rx: Option<Receiver<Result<Decoder, DecodeError>>>,
}

struct EngineInner {
    current_uri: String,
    current_metadata: String,
    next_uri: String,
    next_metadata: String,
    current: Option<Decoder>,
    info: TrackInfo,
    operative: Option<AudioFormat>,
    draining: bool,
    drain_ticks: u32,
}

pub struct TrackEngine {
    state: Arc<AtomicState>,
    pipeline: Arc<AudioPipeline>,
    sink: Arc<dyn Sink>,
    cycles: CycleCalculator,
    events: Sender<RendererEvent>,

    inner: Mutex<EngineInner>,
    pending: Mutex<Option<PendingNext>>,
    pending_flag: AtomicBool,
    preload: Mutex<PreloadSlot>,
    preload_running: Arc<AtomicBool>,

    sink_open: AtomicBool,
    samples_played: AtomicU64,
    current_rate: AtomicU32,
    duration_secs: AtomicU64,
    track_number: AtomicU32,
}

impl TrackEngine {
    pub fn new(
        pipeline: Arc<AudioPipeline>,
        sink: Arc<dyn Sink>,
        mtu: u32,
        events: Sender<RendererEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(AtomicState::default()),
            pipeline,
            sink,
            cycles: CycleCalculator::new(mtu),
            events,
            inner: Mutex::new(EngineInner {
                current_uri: String::new(),
                current_metadata: String::new(),
                next_uri: String::new(),
                next_metadata: String::new(),
                current: None,
                info: TrackInfo::default(),
                operative: None,
                draining: false,
                drain_ticks: 0,
            }),
            pending: Mutex::new(None),
            pending_flag: AtomicBool::new(false),
            preload: Mutex::new(PreloadSlot {
                handle: None,
                rx: None,
            }),
            preload_running: Arc::new(AtomicBool::new(false)),
            sink_open: AtomicBool::new(false),
            samples_played: AtomicU64::new(0),
            current_rate: AtomicU32::new(0),
            duration_secs: AtomicU64::new(0),
            track_number: AtomicU32::new(1),
        })
    }

    pub fn state_handle(&self) -> Arc<AtomicState> {
        self.state.clone()
    }

    pub fn state(&self) -> RendererState {
        self.state.load()
    }

    pub fn position_seconds(&self) -> u64 {
        let rate = self.current_rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0;
        }
        self.samples_played.load(Ordering::Acquire) / rate as u64
    }

    pub fn duration_seconds(&self) -> u64 {
        self.duration_secs.load(Ordering::Acquire)
    }

    pub fn track_number(&self) -> u32 {
        self.track_number.load(Ordering::Acquire)
    }

    /// Snapshot of track fields for status reporting.
    pub fn track_status(&self) -> (String, TrackInfo, Option<AudioFormat>) {
        let inner = self.inner.lock().unwrap();
        (
            inner.current_uri.clone(),
            inner.info.clone(),
            inner.operative,
        )
    }

    pub fn current_rate(&self) -> u32 {
        self.current_rate.load(Ordering::Acquire)
    }

    /// Producer chunk size for the current pipeline mode.
    pub fn pipeline_chunk_samples(&self) -> usize {
        self.pipeline.chunk_samples()
    }

    /// Force the current URI to reopen from position zero on the next
    /// play. No-op when no URI is armed.
    pub fn reopen_current(&self) {
        let (uri, metadata) = {
            let inner = self.inner.lock().unwrap();
            (inner.current_uri.clone(), inner.current_metadata.clone())
        };
        if !uri.is_empty() {
            self.set_current_uri(&uri, &metadata, true);
        }
    }

    fn send_events(&self, events: Vec<RendererEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    /// Arm a URI as the current track. A different URI (or
    /// `force_reopen`) discards open decoders, clears the gapless queue,
    /// and resets the play position.
    pub fn set_current_uri(&self, uri: &str, metadata: &str, force_reopen: bool) {
        let mut inner = self.inner.lock().unwrap();
        let changed = inner.current_uri != uri;
        inner.current_uri = uri.to_string();
        inner.current_metadata = metadata.to_string();

        if changed || force_reopen {
            tracing::info!(
                reason = if changed { "uri changed" } else { "forced reopen" },
                "closing decoders for new track"
            );
            inner.current = None;
            inner.next_uri.clear();
            inner.next_metadata.clear();
            inner.draining = false;
            inner.drain_ticks = 0;
            *self.pending.lock().unwrap() = None;
            self.pending_flag.store(false, Ordering::Release);
            self.cancel_preload();
            self.samples_played.store(0, Ordering::Release);
        }
    }

    /// Queue the gapless next track. Applied on the next producer tick so
    /// the control thread never touches decoder state.
    pub fn set_next_uri(&self, uri: &str, metadata: &str) {
        *self.pending.lock().unwrap() = Some(PendingNext {
            uri: uri.to_string(),
            metadata: metadata.to_string(),
        });
        self.pending_flag.store(true, Ordering::Release);
        tracing::info!("next URI queued");
    }

    /// Start or resume playback. Returns false when no URI is armed or
    /// the track cannot be opened.
    pub fn play(&self) -> bool {
        let mut events = Vec::new();
        let ok = {
            let mut inner = self.inner.lock().unwrap();

            if inner.current_uri.is_empty() {
                tracing::warn!("play without a URI");
                false
            } else if self.state.load() == RendererState::Paused && inner.current.is_some() {
                tracing::info!("resuming from pause");
                self.sink.resume();
                self.state.store(RendererState::Playing);
                events.push(RendererEvent::StateChanged(RendererState::Playing));
                true
            } else {
                let needs_open = inner
                    .current
                    .as_ref()
                    .map(|d| d.is_eof())
                    .unwrap_or(true);
                let opened = if needs_open {
                    match Decoder::open(&inner.current_uri) {
                        Ok(dec) => {
                            self.install_current(&mut inner, dec, false, &mut events);
                            true
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to open track");
                            false
                        }
                    }
                } else {
                    true
                };

                if opened {
                    inner.draining = false;
                    inner.drain_ticks = 0;
                    self.pipeline.clear_stop();
                    self.state.store(RendererState::Playing);
                    events.push(RendererEvent::StateChanged(RendererState::Playing));
                }
                opened
            }
        };
        self.send_events(events);
        ok
    }

    /// Pause playback; decoders stay open at their positions.
    pub fn pause(&self) {
        if self
            .state
            .compare_store(RendererState::Playing, RendererState::Paused)
        {
            self.sink.pause();
            tracing::info!("paused");
            self.send_events(vec![RendererEvent::StateChanged(RendererState::Paused)]);
        }
    }

    /// First half of stop: flip the state and silence the consumer
    /// without taking the engine lock, so it works even while the
    /// producer is blocked in decoder I/O.
    pub fn stop_request(&self) {
        self.state.store(RendererState::Stopped);
        self.pending_flag.store(false, Ordering::Release);
        *self.pending.lock().unwrap() = None;
        self.pipeline.request_stop();
        tracing::info!("stop requested");
    }

    /// Second half of stop: close decoders and the sink. Decoder cleanup
    /// is skipped (deferred to the next producer tick) when the producer
    /// still holds the engine lock. The current URI is retained so a
    /// subsequent play restarts the track from position zero.
    pub fn finalize_stop(&self) {
        self.join_finished_preload();

        match self.inner.try_lock() {
            Ok(mut inner) => {
                inner.current = None;
                inner.draining = false;
                inner.drain_ticks = 0;
                self.samples_played.store(0, Ordering::Release);
            }
            Err(_) => {
                tracing::warn!("engine busy, decoder cleanup deferred to producer");
            }
        }

        self.teardown_sink(true);
        self.send_events(vec![RendererEvent::StateChanged(RendererState::Stopped)]);
    }

    /// Seek the current track. Raw DSD and missing decoders reject the
    /// request and leave playback untouched.
    pub fn seek(&self, seconds: f64) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.info.is_dsd {
            tracing::warn!("seek rejected for raw DSD stream");
            return false;
        }
        let info = inner.info.clone();
        let Some(current) = inner.current.as_mut() else {
            tracing::warn!("seek without an open decoder");
            return false;
        };

        let mut target = seconds.max(0.0);
        let duration = info.duration_seconds();
        if duration > 0 {
            target = target.min(duration as f64);
        }

        match current.seek(target) {
            Ok(()) => {
                self.samples_played
                    .store((target * info.sample_rate as f64) as u64, Ordering::Release);
                inner.draining = false;
                inner.drain_ticks = 0;
                tracing::info!(seconds = target, "seek complete");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "seek failed");
                false
            }
        }
    }

    /// One producer tick. Returns true when the deadline cadence should
    /// continue, false when the producer should back off and reset it.
    pub fn process(&self) -> bool {
        let state = self.state.load();
        if state != RendererState::Playing {
            if state == RendererState::Stopped {
                self.cleanup_after_stop();
            }
            return false;
        }

        let mut events = Vec::new();
        let keep_going = self.process_locked(&mut events);
        self.send_events(events);
        keep_going
    }

    fn process_locked(&self, events: &mut Vec<RendererEvent>) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if self.state.load() != RendererState::Playing {
            return false;
        }

        if self.pending_flag.swap(false, Ordering::AcqRel) {
            if let Some(pending) = self.pending.lock().unwrap().take() {
                inner.next_uri = pending.uri;
                inner.next_metadata = pending.metadata;
                tracing::info!("pending next URI applied");
            }
        }

        if inner.current.is_none() {
            if inner.current_uri.is_empty() {
                return false;
            }
            match Decoder::open(&inner.current_uri) {
                Ok(dec) => self.install_current(&mut inner, dec, false, events),
                Err(e) => {
                    tracing::error!(error = %e, "failed to reopen track");
                    self.state.store(RendererState::Stopped);
                    events.push(RendererEvent::StateChanged(RendererState::Stopped));
                    return false;
                }
            }
        }

        if !self.sink_open.load(Ordering::Acquire) {
            if let Err(e) = self.bring_up_sink(&mut inner) {
                tracing::error!(error = %e, "failed to bring up sink");
                self.state.store(RendererState::Stopped);
                events.push(RendererEvent::StateChanged(RendererState::Stopped));
                return false;
            }
        }

        // Preload kicks off as soon as the decoder's source runs dry,
        // while its remainder is still feeding the ring.
        let at_eof = inner
            .current
            .as_ref()
            .map(|d| d.source_exhausted())
            .unwrap_or(false);
        if at_eof && !inner.next_uri.is_empty() {
            self.spawn_preload(&inner.next_uri);
        }

        let chunk = self.pipeline.chunk_samples();
        let Some(current) = inner.current.as_mut() else {
            return false;
        };

        match self.pipeline.produce(current, chunk) {
            Ok(Produce::Pushed(samples)) => {
                self.samples_played
                    .fetch_add(samples as u64, Ordering::AcqRel);
                true
            }
            Ok(Produce::RingFull) => true,
            Ok(Produce::Eof) => self.handle_end_of_stream(&mut inner, events),
            Err(e) => {
                tracing::warn!(error = %e, "producer error");
                self.handle_end_of_stream(&mut inner, events)
            }
        }
    }

    fn handle_end_of_stream(
        &self,
        inner: &mut EngineInner,
        events: &mut Vec<RendererEvent>,
    ) -> bool {
        if !inner.draining {
            tracing::info!("decoder exhausted");
            inner.draining = true;
            inner.drain_ticks = 0;
        }

        if !inner.next_uri.is_empty() {
            match self.take_preloaded() {
                Some(Ok(next)) => {
                    let next_info = next.info().clone();
                    let gapless = same_operative_format(&inner.info, &next_info);

                    inner.current_uri = std::mem::take(&mut inner.next_uri);
                    inner.current_metadata = std::mem::take(&mut inner.next_metadata);
                    inner.draining = false;
                    inner.drain_ticks = 0;

                    if gapless {
                        tracing::info!(uri = %inner.current_uri, "gapless transition");
                        self.install_current(inner, next, true, events);
                        return true;
                    }
                    return self.format_change(inner, next, events);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "preload failed, dropping next track");
                    inner.next_uri.clear();
                    inner.next_metadata.clear();
                    // fall through to the end-of-stream path
                }
                None => {
                    // Preload still in flight; idle this tick.
                    self.spawn_preload(&inner.next_uri);
                    return true;
                }
            }
        }

        inner.drain_ticks += 1;
        if inner.drain_ticks <= EOS_DRAIN_TICKS {
            return false;
        }

        tracing::info!("track finished");
        self.wait_ring_drained();
        self.state.store(RendererState::Stopped);
        events.push(RendererEvent::StateChanged(RendererState::Stopped));
        inner.current = None;
        inner.draining = false;
        inner.drain_ticks = 0;
        self.teardown_sink(false);
        false
    }

    /// Three-phase format change: drain shutdown silence, close the sink,
    /// honor the DAC settle window, then reopen with the new format and
    /// re-establish prefill. No pipeline I/O happens between phases.
    fn format_change(
        &self,
        inner: &mut EngineInner,
        next: Decoder,
        events: &mut Vec<RendererEvent>,
    ) -> bool {
        tracing::info!(
            from = ?inner.operative,
            to_rate = next.info().sample_rate,
            to_dsd = next.info().is_dsd,
            "format change transition"
        );
        self.state.store(RendererState::Transitioning);
        events.push(RendererEvent::StateChanged(RendererState::Transitioning));

        let cycles = self.pipeline.shutdown_silence_cycles();
        self.pipeline.request_shutdown_silence(cycles);
        self.pipeline.wait_silence_drained(SILENCE_DRAIN_TIMEOUT);

        self.teardown_sink(true);

        std::thread::sleep(FORMAT_SETTLE);

        if self.state.load() != RendererState::Transitioning {
            // A stop (or new URI) intervened during the settle window.
            tracing::info!("format change aborted by control");
            return false;
        }

        self.install_current(inner, next, true, events);

        match self.bring_up_sink(inner) {
            Ok(()) => {
                if self
                    .state
                    .compare_store(RendererState::Transitioning, RendererState::Playing)
                {
                    events.push(RendererEvent::StateChanged(RendererState::Playing));
                    true
                } else {
                    self.teardown_sink(true);
                    false
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "sink reopen failed after format change");
                self.state.store(RendererState::Stopped);
                events.push(RendererEvent::StateChanged(RendererState::Stopped));
                false
            }
        }
    }

    fn install_current(
        &self,
        inner: &mut EngineInner,
        decoder: Decoder,
        advance_track: bool,
        events: &mut Vec<RendererEvent>,
    ) {
        let info = decoder.info().clone();
        self.current_rate.store(info.sample_rate, Ordering::Release);
        self.duration_secs
            .store(info.duration_seconds(), Ordering::Release);
        self.samples_played.store(0, Ordering::Release);

        let track_number = if advance_track {
            self.track_number.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            self.track_number.load(Ordering::Acquire)
        };

        tracing::info!(
            track = track_number,
            codec = %info.codec,
            rate_hz = info.sample_rate,
            bits = info.bit_depth,
            channels = info.channels,
            dsd = info.is_dsd,
            "track installed"
        );

        inner.info = info;
        inner.current = Some(decoder);
        events.push(RendererEvent::TrackChanged {
            track_number,
            uri: inner.current_uri.clone(),
            metadata: inner.current_metadata.clone(),
        });
    }

    /// Negotiate the sink format for the current track, configure the
    /// pipeline, and open the sink. A downgraded accept re-plans against
    /// what the target actually took.
    fn bring_up_sink(&self, inner: &mut EngineInner) -> anyhow::Result<()> {
        let caps = self.sink.capabilities();
        let mut plan = negotiate(&inner.info, &caps)?;

        for _ in 0..2 {
            self.pipeline.configure(&plan);
            let bits = effective_bits(&plan.format);
            let cycle =
                self.cycles
                    .cycle_time(plan.format.sample_rate, plan.format.channels, bits);
            let accepted =
                self.sink
                    .open(plan.format, cycle, self.pipeline.bytes_per_cycle())?;

            if accepted == plan.format {
                inner.operative = Some(accepted);
                self.sink_open.store(true, Ordering::Release);
                return Ok(());
            }

            tracing::info!(accepted = %accepted, "re-planning for downgraded sink format");
            plan = negotiate(&inner.info, &restrict_caps(&caps, &accepted))?;
        }

        anyhow::bail!("sink did not settle on a format")
    }

    fn teardown_sink(&self, immediate: bool) {
        if self.sink_open.swap(false, Ordering::AcqRel) {
            self.sink.stop(immediate);
            self.sink.close();
        }
    }

    /// Let already-buffered audio reach the sink before a close, bounded.
    fn wait_ring_drained(&self) {
        let start = std::time::Instant::now();
        while !self.pipeline.buffer_drained() {
            if start.elapsed() > EOS_RING_DRAIN_TIMEOUT {
                tracing::warn!("ring drain timed out before close");
                return;
            }
            if !self.sink.is_online() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn cleanup_after_stop(&self) {
        let Ok(mut inner) = self.inner.try_lock() else {
            return;
        };
        if inner.current.is_some() {
            tracing::debug!("dropping decoders after stop");
            inner.current = None;
            inner.draining = false;
            inner.drain_ticks = 0;
            self.samples_played.store(0, Ordering::Release);
        }
    }

    fn spawn_preload(&self, uri: &str) {
        if self.preload_running.load(Ordering::Acquire) {
            return;
        }
        let mut slot = self.preload.lock().unwrap();
        if slot.rx.is_some() {
            return;
        }

        self.join_finished_preload_slot(&mut slot);
        self.preload_running.store(true, Ordering::Release);

        let (tx, rx) = crossbeam_channel::bounded(1);
        let uri = uri.to_string();
        let running = self.preload_running.clone();

        tracing::info!(uri = %crate::truncate_uri(&uri), "preloading next track");
        slot.rx = Some(rx);
        slot.handle = Some(std::thread::spawn(move || {
            let result = Decoder::open(&uri);
            let _ = tx.send(result);
            running.store(false, Ordering::Release);
        }));
    }

    /// Collect a finished preload, if any. `None` means still running or
    /// never started.
    fn take_preloaded(&self) -> Option<Result<Decoder, DecodeError>> {
        let mut slot = self.preload.lock().unwrap();
        let rx = slot.rx.as_ref()?;
        match rx.try_recv() {
            Ok(result) => {
                slot.rx = None;
                if let Some(handle) = slot.handle.take() {
                    let _ = handle.join();
                }
                Some(result)
            }
            Err(_) => None,
        }
    }

    /// Drop any pending preload result. The open may still be in flight;
    /// its thread just discards the decoder when the channel is gone.
    fn cancel_preload(&self) {
        let mut slot = self.preload.lock().unwrap();
        if slot.rx.take().is_some() {
            tracing::info!("cancelling preload in flight");
        }
        self.join_finished_preload_slot(&mut slot);
    }

    fn join_finished_preload(&self) {
        let mut slot = self.preload.lock().unwrap();
        self.join_finished_preload_slot(&mut slot);
    }

    fn join_finished_preload_slot(&self, slot: &mut PreloadSlot) {
        if slot.handle.as_ref().map(|h| h.is_finished()).unwrap_or(false) {
            if let Some(handle) = slot.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TrackEngine {
    fn drop(&mut self) {
        // The preload thread owns only its own decoder; join it so no
        // work outlives the engine.
        let handle = self.preload.lock().unwrap().handle.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Gapless is possible when the fields that drive sink configuration all
/// match.
fn same_operative_format(a: &TrackInfo, b: &TrackInfo) -> bool {
    a.sample_rate == b.sample_rate
        && a.bit_depth == b.bit_depth
        && a.channels == b.channels
        && a.is_dsd == b.is_dsd
}

fn effective_bits(format: &AudioFormat) -> u32 {
    if format.is_dsd {
        1
    } else {
        format.bit_depth
    }
}

/// Capability set restricted to what a downgrading target accepted.
fn restrict_caps(original: &SinkCaps, accepted: &AudioFormat) -> SinkCaps {
    if accepted.is_dsd {
        SinkCaps {
            pcm_bits: vec![],
            dsd_layouts: original
                .dsd_layouts
                .iter()
                .copied()
                .filter(|l| l.bit_order == accepted.dsd_bit_order)
                .collect(),
        }
    } else {
        SinkCaps {
            pcm_bits: vec![accepted.bit_depth],
            dsd_layouts: vec![],
        }
    }
}
