//! Composition root: wires the sink, pipeline, engine, and facade
//! together and runs the long-lived threads.
//!
//! Threads:
//! - producer: drives the engine at a `sleep_until` cadence derived from
//!   the current chunk size and sample rate
//! - position: emits a position tick once per second while playing
//! - notifier: forwards engine events to the attached control layer
//!   (logged here; the HTTP surface reads status directly)
//! - control: dispatches HTTP commands onto facade callbacks
//! - sink worker: owned by `NetSink`, pulls one buffer per cycle

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;

use renderer_audio::AudioPipeline;
use renderer_types::RendererState;

use netsink::{NetSink, SinkPull};

use crate::config::RendererConfig;
use crate::control;
use crate::engine::TrackEngine;
use crate::events::RendererEvent;
use crate::facade::{CallbackGate, RendererFacade};
use crate::mdns;
use crate::timefmt::format_hms;

/// Adapter handing pipeline cycles to the sink worker.
struct PipelinePull(Arc<AudioPipeline>);

impl SinkPull for PipelinePull {
    fn fill(&self, buf: &mut [u8]) {
        self.0.fill_cycle(buf);
    }
}

/// Discover the sink, assemble the renderer, and run until shutdown.
pub fn run(config: RendererConfig) -> Result<()> {
    let target = netsink::discover(&config.discovery, config.target_index)
        .context("sink discovery")?;
    tracing::info!(name = %target.name, mtu = target.mtu, "using sink target");
    let mtu = target.mtu;

    let sink = Arc::new(NetSink::connect(target).context("sink connect")?);
    let pipeline = Arc::new(AudioPipeline::new());
    sink.register_pull(Arc::new(PipelinePull(pipeline.clone())));

    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let engine = TrackEngine::new(pipeline.clone(), sink.clone(), mtu, event_tx.clone());
    let gate = CallbackGate::new();
    let facade = RendererFacade::new(engine.clone(), pipeline, sink, gate.clone());

    let running = Arc::new(AtomicBool::new(true));

    let producer = {
        let engine = engine.clone();
        let gate = gate.clone();
        let running = running.clone();
        std::thread::Builder::new()
            .name("producer".to_string())
            .spawn(move || producer_loop(engine, gate, running))
            .context("spawn producer thread")?
    };

    let position = {
        let engine = engine.clone();
        let running = running.clone();
        std::thread::Builder::new()
            .name("position".to_string())
            .spawn(move || position_loop(engine, event_tx, running))
            .context("spawn position thread")?
    };

    let notifier = std::thread::Builder::new()
        .name("notifier".to_string())
        .spawn(move || {
            for event in event_rx.iter() {
                match event {
                    RendererEvent::StateChanged(state) => {
                        tracing::info!(state = %state, "state change")
                    }
                    RendererEvent::TrackChanged {
                        track_number,
                        uri,
                        metadata,
                    } => tracing::info!(
                        track = track_number,
                        uri = %crate::truncate_uri(&uri),
                        metadata = %crate::truncate_uri(&metadata),
                        "track change"
                    ),
                    RendererEvent::PositionTick {
                        position_seconds,
                        duration_seconds,
                    } => tracing::debug!(
                        position = %format_hms(position_seconds),
                        duration = %format_hms(duration_seconds),
                        "position"
                    ),
                }
            }
        })
        .context("spawn notifier thread")?;

    let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
    let control_loop = control::spawn_control_loop(facade.clone(), cmd_rx);
    let http = control::spawn_http_server(config.http_bind, facade.clone(), cmd_tx);

    let advertiser: Arc<Mutex<Option<mdns::Advertisement>>> = Arc::new(Mutex::new(None));
    if config.advertise {
        match mdns::Advertisement::publish(&config.name, config.http_bind) {
            Ok(ad) => *advertiser.lock().unwrap() = Some(ad),
            Err(e) => tracing::warn!(error = %e, "mdns advertisement failed"),
        }
    }

    {
        let advertiser = advertiser.clone();
        let facade = facade.clone();
        let running = running.clone();
        let _ = ctrlc::set_handler(move || {
            tracing::info!("shutting down");
            running.store(false, Ordering::Release);
            facade.on_stop();
            if let Ok(mut guard) = advertiser.lock() {
                if let Some(ad) = guard.take() {
                    ad.shutdown();
                }
            }
            std::process::exit(0);
        });
    }

    tracing::info!(bind = %config.http_bind, name = %config.name, "renderer running");

    let _ = http.join();
    running.store(false, Ordering::Release);
    let _ = producer.join();
    let _ = position.join();
    let _ = control_loop.join();
    let _ = notifier.join();
    Ok(())
}

/// Producer cadence: one engine tick per chunk interval, deadline-based.
/// The deadline resets after a failed tick or while not playing, so a
/// resume starts from "now" instead of bursting to catch up.
fn producer_loop(engine: Arc<TrackEngine>, gate: Arc<CallbackGate>, running: Arc<AtomicBool>) {
    tracing::debug!("producer started");

    let mut next_tick = Instant::now();
    let mut last_rate = 0u32;
    let mut last_chunk = 0usize;
    let mut interval = Duration::from_millis(10);

    while running.load(Ordering::Acquire) {
        if engine.state() != RendererState::Playing {
            std::thread::sleep(Duration::from_millis(10));
            next_tick = Instant::now();
            last_rate = 0;
            continue;
        }

        let rate = engine.current_rate();
        if rate == 0 {
            // Track not open yet; tick once to let the engine open it.
            let guard = gate.enter();
            engine.process();
            drop(guard);
            std::thread::sleep(Duration::from_millis(10));
            next_tick = Instant::now();
            continue;
        }

        let chunk = engine_chunk(&engine);
        if rate != last_rate || chunk != last_chunk {
            interval = Duration::from_micros(chunk as u64 * 1_000_000 / rate as u64);
            tracing::info!(
                rate_hz = rate,
                chunk_samples = chunk,
                interval_us = interval.as_micros() as u64,
                "producer timing configured"
            );
            last_rate = rate;
            last_chunk = chunk;
            next_tick = Instant::now();
        }

        if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }

        let guard = gate.enter();
        let ok = engine.process();
        drop(guard);

        if ok {
            next_tick += interval;
        } else {
            std::thread::sleep(Duration::from_millis(10));
            next_tick = Instant::now();
        }
    }

    tracing::debug!("producer finished");
}

fn engine_chunk(engine: &TrackEngine) -> usize {
    engine.pipeline_chunk_samples()
}

/// Position tick once per second while playing.
fn position_loop(
    engine: Arc<TrackEngine>,
    events: Sender<RendererEvent>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Acquire) {
        if engine.state() == RendererState::Playing {
            let _ = events.send(RendererEvent::PositionTick {
                position_seconds: engine.position_seconds(),
                duration_seconds: engine.duration_seconds(),
            });
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}
