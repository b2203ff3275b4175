//! URI decoder: Symphonia-backed PCM with raw-DSD passthrough.
//!
//! `open` classifies the URI (HTTP range source or local file), sniffs
//! for a DSD container before probing with Symphonia, and fills in the
//! track description. PCM packets are decoded and converted to the
//! requested integer width; raw DSD packets are forwarded unchanged in
//! planar layout. Samples that exceed a read request are retained in a
//! remainder buffer and served first on the next call.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{
    Decoder as CodecDecoder, DecoderOptions, CodecParameters, CODEC_TYPE_AAC, CODEC_TYPE_ALAC,
    CODEC_TYPE_FLAC, CODEC_TYPE_MP3, CODEC_TYPE_PCM_F32BE, CODEC_TYPE_PCM_F32LE,
    CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE, CODEC_TYPE_PCM_S24BE, CODEC_TYPE_PCM_S24LE,
    CODEC_TYPE_PCM_S32BE, CODEC_TYPE_PCM_S32LE,
};
use symphonia::core::errors::Error as SymError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::sample::SampleFormat;
use symphonia::core::units::Time;

use renderer_types::TrackInfo;

use crate::dsd::DsdContainer;
use crate::error::DecodeError;
use crate::http_stream::{HttpRangeSource, HttpSourceConfig};
use crate::resample::StreamResampler;

pub struct Decoder {
    uri: String,
    info: TrackInfo,
    backend: Backend,
    eof: bool,
    /// Surplus interleaved output bytes from previous PCM reads.
    remainder: Vec<u8>,
    /// Surplus per-channel DSD bytes from previous raw reads.
    dsd_remainder: Vec<Vec<u8>>,
    read_calls: u64,
    packet_count: u64,
}

enum Backend {
    Pcm(PcmBackend),
    Dsd(DsdContainer<Box<dyn MediaSource>>),
}

struct PcmBackend {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn CodecDecoder>,
    track_id: u32,
    resampler: Option<StreamResampler>,
}

impl Decoder {
    /// Open a URI and probe the track description.
    pub fn open(uri: &str) -> Result<Self, DecodeError> {
        tracing::info!(uri = %truncate_uri(uri), "opening decoder");

        let (source, hint) = open_media_source(uri)?;

        let source = match DsdContainer::sniff(source).map_err(|e| DecodeError::open(uri, &e))? {
            Ok(container) => {
                return Self::open_dsd(uri, container);
            }
            Err(source) => source,
        };

        Self::open_pcm(uri, source, hint)
    }

    fn open_dsd(uri: &str, container: DsdContainer<Box<dyn MediaSource>>) -> Result<Self, DecodeError> {
        let stream = container.info().clone();

        // Containers report a byte-oriented packet rate; the sink needs
        // the 1-bit sample rate. Convert exactly once, here.
        let bit_rate = stream.packet_rate * 8;
        let multiplier = bit_rate / 44_100;

        let info = TrackInfo {
            sample_rate: bit_rate,
            bit_depth: 1,
            channels: stream.channels,
            codec: container.codec_name().to_string(),
            duration_samples: stream.sample_count,
            is_dsd: true,
            dsd_multiplier: multiplier,
            is_compressed: false,
            dsd_bit_order: stream.bit_order,
        };

        tracing::info!(
            multiplier = multiplier,
            bit_rate_hz = bit_rate,
            channels = stream.channels,
            bit_order = ?stream.bit_order,
            "raw DSD mode, no codec opened"
        );

        Ok(Self {
            uri: uri.to_string(),
            dsd_remainder: vec![Vec::new(); stream.channels as usize],
            info,
            backend: Backend::Dsd(container),
            eof: false,
            remainder: Vec::new(),
            read_calls: 0,
            packet_count: 0,
        })
    }

    fn open_pcm(
        uri: &str,
        source: Box<dyn MediaSource>,
        hint: Hint,
    ) -> Result<Self, DecodeError> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| DecodeError::open(uri, &e))?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| DecodeError::NoAudioStream {
                uri: uri.to_string(),
            })?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| DecodeError::open(uri, "unknown sample rate"))?;
        let channels = params
            .channels
            .map(|c| c.count() as u32)
            .ok_or_else(|| DecodeError::open(uri, "unknown channel layout"))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::open(uri, &e))?;

        let bit_depth = detect_pcm_bit_depth(&params);
        let is_compressed = !is_uncompressed_pcm(&params);

        let info = TrackInfo {
            sample_rate,
            bit_depth,
            channels,
            codec: codec_label(&params),
            duration_samples: params.n_frames.unwrap_or(0),
            is_dsd: false,
            dsd_multiplier: 0,
            is_compressed,
            dsd_bit_order: Default::default(),
        };

        tracing::info!(
            rate_hz = sample_rate,
            bits = bit_depth,
            channels = channels,
            codec = %info.codec,
            compressed = is_compressed,
            "track opened"
        );

        Ok(Self {
            uri: uri.to_string(),
            info,
            backend: Backend::Pcm(PcmBackend {
                format,
                decoder,
                track_id,
                resampler: None,
            }),
            eof: false,
            remainder: Vec::new(),
            dsd_remainder: Vec::new(),
            read_calls: 0,
            packet_count: 0,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn is_eof(&self) -> bool {
        // The stream is exhausted only when the source ran dry AND the
        // remainder has been served.
        let pending = if self.info.is_dsd {
            self.dsd_remainder.iter().any(|s| !s.is_empty())
        } else {
            !self.remainder.is_empty()
        };
        self.eof && !pending
    }

    /// True once the underlying source ran dry, even while remainder
    /// samples are still being served. Used to start the next-track
    /// preload ahead of the final reads.
    pub fn source_exhausted(&self) -> bool {
        self.eof
    }

    /// Read up to `num_samples` samples into `out`, converted for the
    /// requested output. Returns the number of samples delivered; 0 means
    /// end of stream.
    ///
    /// PCM output is interleaved S16 (2 bytes) or S32 containers
    /// (4 bytes) per `target_bits`. DSD output is planar by channel,
    /// `num_samples × channels / 8` bytes total.
    pub fn read_samples(
        &mut self,
        out: &mut Vec<u8>,
        num_samples: usize,
        target_rate: u32,
        target_bits: u32,
    ) -> Result<usize, DecodeError> {
        out.clear();
        self.read_calls += 1;
        if self.read_calls % 512 == 0 {
            tracing::debug!(calls = self.read_calls, "read_samples");
        }

        if self.info.is_dsd {
            self.read_dsd(out, num_samples)
        } else {
            self.read_pcm(out, num_samples, target_rate, target_bits)
        }
    }

    fn read_dsd(&mut self, out: &mut Vec<u8>, num_samples: usize) -> Result<usize, DecodeError> {
        let channels = self.info.channels as usize;
        let per_channel = num_samples / 8;

        let container = match &mut self.backend {
            Backend::Dsd(c) => c,
            Backend::Pcm(_) => return Ok(0),
        };

        while !self.eof && self.dsd_remainder[0].len() < per_channel {
            match container.next_packet()? {
                Some(slabs) => {
                    self.packet_count += 1;
                    for (c, slab) in slabs.into_iter().enumerate().take(channels) {
                        self.dsd_remainder[c].extend_from_slice(&slab);
                    }
                }
                None => {
                    tracing::debug!(packets = self.packet_count, "end of DSD data");
                    self.eof = true;
                }
            }
        }

        let deliver = per_channel.min(self.dsd_remainder[0].len());
        if deliver == 0 {
            return Ok(0);
        }

        out.reserve(deliver * channels);
        for slab in &mut self.dsd_remainder {
            out.extend(slab.drain(..deliver.min(slab.len())));
        }

        // Planar layout: `deliver` bytes per channel, 8 samples per byte.
        Ok(deliver * 8)
    }

    fn read_pcm(
        &mut self,
        out: &mut Vec<u8>,
        num_samples: usize,
        target_rate: u32,
        target_bits: u32,
    ) -> Result<usize, DecodeError> {
        let channels = self.info.channels as usize;
        let bytes_per_frame = pcm_container_bytes(target_bits) * channels;
        let requested_bytes = num_samples * bytes_per_frame;

        let pcm = match &mut self.backend {
            Backend::Pcm(p) => p,
            Backend::Dsd(_) => return Ok(0),
        };

        while !self.eof && self.remainder.len() < requested_bytes {
            let packet = match pcm.format.next_packet() {
                Ok(p) => p,
                Err(SymError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    tracing::debug!("end of stream");
                    self.eof = true;
                    break;
                }
                Err(SymError::ResetRequired) => {
                    tracing::warn!("stream reset required, treating as end of stream");
                    self.eof = true;
                    break;
                }
                Err(e) => {
                    // Timeouts and connection resets land here; the track
                    // ends rather than stalling the producer.
                    tracing::warn!(error = %e, "read error, treating as end of stream");
                    self.eof = true;
                    break;
                }
            };

            if packet.track_id() != pcm.track_id {
                continue;
            }

            let decoded = match pcm.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymError::DecodeError(e)) => {
                    tracing::debug!(error = %e, "skipping undecodable packet");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "decoder failed, treating as end of stream");
                    self.eof = true;
                    break;
                }
            };

            let decoded_rate = decoded.spec().rate;
            if decoded_rate != target_rate {
                if pcm.resampler.is_none() {
                    tracing::info!(
                        from_hz = decoded_rate,
                        to_hz = target_rate,
                        "initializing resampler"
                    );
                    pcm.resampler = Some(
                        StreamResampler::new(decoded_rate, target_rate, channels)
                            .map_err(|e| DecodeError::open(&self.uri, &e))?,
                    );
                }

                let mut f32_buf =
                    SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
                f32_buf.copy_interleaved_ref(decoded);

                let mut converted = Vec::new();
                if let Some(rs) = pcm.resampler.as_mut() {
                    rs.process(f32_buf.samples(), &mut converted)
                        .map_err(|e| DecodeError::open(&self.uri, &e))?;
                }
                append_f32_as_int(&converted, target_bits, &mut self.remainder);
            } else {
                append_decoded_as_int(decoded, target_bits, &mut self.remainder);
            }
        }

        if self.eof {
            if let Some(rs) = pcm.resampler.as_mut() {
                let mut converted = Vec::new();
                if rs.flush(&mut converted).is_ok() {
                    append_f32_as_int(&converted, target_bits, &mut self.remainder);
                }
                pcm.resampler = None;
            }
        }

        let whole_frames = self.remainder.len() / bytes_per_frame;
        let deliver_frames = whole_frames.min(num_samples);
        let deliver_bytes = deliver_frames * bytes_per_frame;
        out.extend(self.remainder.drain(..deliver_bytes));
        Ok(deliver_frames)
    }

    /// Reposition a PCM stream; raw DSD rejects seeks.
    pub fn seek(&mut self, seconds: f64) -> Result<(), DecodeError> {
        let pcm = match &mut self.backend {
            Backend::Pcm(p) => p,
            Backend::Dsd(_) => return Err(DecodeError::SeekUnsupported),
        };

        let seconds = seconds.max(0.0);
        let time = Time::new(seconds.trunc() as u64, seconds.fract());

        // Coarse mode snaps to the sync point at or before the target.
        pcm.format
            .seek(
                SeekMode::Coarse,
                SeekTo::Time {
                    time,
                    track_id: Some(pcm.track_id),
                },
            )
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;

        pcm.decoder.reset();
        pcm.resampler = None;
        self.remainder.clear();
        self.eof = false;

        tracing::debug!(seconds = seconds, "seek complete");
        Ok(())
    }
}

/// Open the byte source for a URI: HTTP range reader or local file.
fn open_media_source(uri: &str) -> Result<(Box<dyn MediaSource>, Hint), DecodeError> {
    let mut hint = Hint::new();
    if let Some(ext) = infer_extension(uri) {
        hint.with_extension(&ext);
    }

    if uri.starts_with("http://") || uri.starts_with("https://") {
        let source = HttpRangeSource::open(uri.to_string(), HttpSourceConfig::default(), None);
        return Ok((Box::new(source), hint));
    }

    let path = uri.strip_prefix("file://").unwrap_or(uri);
    let file = File::open(Path::new(path)).map_err(|e| DecodeError::open(uri, &e))?;
    Ok((Box::new(file), hint))
}

/// Best-effort extension from a URI path, ignoring any query string.
fn infer_extension(uri: &str) -> Option<String> {
    let tail = uri.split('?').next().unwrap_or(uri);
    let file = tail.rsplit('/').next().unwrap_or(tail);
    let mut parts = file.rsplit('.');
    let ext = parts.next()?;
    if parts.next().is_some() && !ext.is_empty() {
        Some(ext.to_ascii_lowercase())
    } else {
        None
    }
}

/// Output container width: S16 in 2 bytes, everything else in 4.
fn pcm_container_bytes(target_bits: u32) -> usize {
    if target_bits == 16 {
        2
    } else {
        4
    }
}

/// Bit-depth detection priority: explicit container value, then PCM codec
/// id, then the codec sample format, then 24.
fn detect_pcm_bit_depth(params: &CodecParameters) -> u32 {
    if let Some(bits) = params.bits_per_sample.or(params.bits_per_coded_sample) {
        if matches!(bits, 16 | 24 | 32) {
            return bits;
        }
    }

    match params.codec {
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => return 16,
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => return 24,
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE | CODEC_TYPE_PCM_F32LE
        | CODEC_TYPE_PCM_F32BE => return 32,
        _ => {}
    }

    match params.sample_format {
        Some(SampleFormat::S16 | SampleFormat::U16) => 16,
        Some(SampleFormat::S24 | SampleFormat::U24) => 24,
        Some(SampleFormat::S32 | SampleFormat::U32 | SampleFormat::F32 | SampleFormat::F64) => 32,
        _ => 24,
    }
}

fn is_uncompressed_pcm(params: &CodecParameters) -> bool {
    matches!(
        params.codec,
        CODEC_TYPE_PCM_S16LE
            | CODEC_TYPE_PCM_S16BE
            | CODEC_TYPE_PCM_S24LE
            | CODEC_TYPE_PCM_S24BE
            | CODEC_TYPE_PCM_S32LE
            | CODEC_TYPE_PCM_S32BE
    )
}

fn codec_label(params: &CodecParameters) -> String {
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "PCM_S16",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "PCM_S24",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "PCM_S32",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "PCM_F32",
        _ => return format!("{:?}", params.codec),
    };
    name.to_string()
}

/// Convert a decoded buffer into interleaved target-width LE bytes.
fn append_decoded_as_int(
    decoded: symphonia::core::audio::AudioBufferRef<'_>,
    target_bits: u32,
    out: &mut Vec<u8>,
) {
    if target_bits == 16 {
        let mut buf = SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        for &s in buf.samples() {
            out.extend_from_slice(&s.to_le_bytes());
        }
    } else {
        let mut buf = SampleBuffer::<i32>::new(decoded.frames() as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        for &s in buf.samples() {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
}

/// Convert resampled f32 samples into interleaved target-width LE bytes.
fn append_f32_as_int(samples: &[f32], target_bits: u32, out: &mut Vec<u8>) {
    if target_bits == 16 {
        for &s in samples {
            let v = (s as f64 * i16::MAX as f64)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
    } else {
        for &s in samples {
            let v = (s as f64 * i32::MAX as f64)
                .round()
                .clamp(i32::MIN as f64, i32::MAX as f64) as i32;
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
}

/// Bound a URI for log output without splitting a UTF-8 sequence.
fn truncate_uri(uri: &str) -> &str {
    match uri.char_indices().nth(96) {
        Some((idx, _)) => &uri[..idx],
        None => uri,
    }
}
