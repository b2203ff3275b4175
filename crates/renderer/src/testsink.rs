//! Recording sink double used by engine and facade tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use netsink::{Sink, SinkError};
use renderer_types::{AudioFormat, DsdBitOrder, DsdLayout, Endianness, SinkCaps};

pub struct MockSink {
    caps: SinkCaps,
    opens: AtomicU32,
    closes: AtomicU32,
    pauses: AtomicU32,
    resumes: AtomicU32,
    online: AtomicBool,
    paused: AtomicBool,
    pub opened_formats: Mutex<Vec<AudioFormat>>,
}

impl MockSink {
    fn new(caps: SinkCaps) -> Self {
        Self {
            caps,
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            pauses: AtomicU32::new(0),
            resumes: AtomicU32::new(0),
            online: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            opened_formats: Mutex::new(Vec::new()),
        }
    }

    /// Sink that accepts every PCM depth and the common DSD layouts.
    pub fn pcm_all() -> Self {
        Self::new(SinkCaps {
            pcm_bits: vec![16, 24, 32],
            dsd_layouts: vec![
                DsdLayout {
                    bit_order: DsdBitOrder::LsbFirst,
                    endianness: Endianness::Big,
                },
                DsdLayout {
                    bit_order: DsdBitOrder::MsbFirst,
                    endianness: Endianness::Big,
                },
            ],
        })
    }

    /// Sink with a single DSD layout and no PCM support at all.
    pub fn dsd_only(bit_order: DsdBitOrder) -> Self {
        Self::new(SinkCaps {
            pcm_bits: vec![],
            dsd_layouts: vec![DsdLayout {
                bit_order,
                endianness: Endianness::Big,
            }],
        })
    }

    pub fn open_count(&self) -> u32 {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn pause_count(&self) -> u32 {
        self.pauses.load(Ordering::Relaxed)
    }

    pub fn resume_count(&self) -> u32 {
        self.resumes.load(Ordering::Relaxed)
    }
}

impl Sink for MockSink {
    fn capabilities(&self) -> SinkCaps {
        self.caps.clone()
    }

    fn open(
        &self,
        format: AudioFormat,
        _cycle_time: Duration,
        _bytes_per_cycle: usize,
    ) -> Result<AudioFormat, SinkError> {
        self.opens.fetch_add(1, Ordering::Relaxed);
        self.online.store(true, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.opened_formats.lock().unwrap().push(format);
        Ok(format)
    }

    fn pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
        self.paused.store(true, Ordering::Release);
    }

    fn resume(&self) {
        self.resumes.fetch_add(1, Ordering::Relaxed);
        self.paused.store(false, Ordering::Release);
    }

    fn stop(&self, _immediate: bool) {}

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
        self.online.store(false, Ordering::Release);
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn buffer_empty(&self) -> bool {
        true
    }
}
