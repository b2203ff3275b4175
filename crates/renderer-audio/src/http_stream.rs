//! HTTP range media source for streaming playback.
//!
//! Fetches the remote file in blocks over HTTP range requests. Each block
//! is an independent request, so a dropped connection heals on the next
//! refill; servers that misreport the content length are tolerated by
//! probing past the advertised end before declaring EOF.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::io::MediaSource;

/// Tuning for the range fetcher.
#[derive(Clone, Debug)]
pub struct HttpSourceConfig {
    /// Bytes fetched per range request.
    pub block_size: usize,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            block_size: 256 * 1024,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Buffered HTTP range reader with a single-block cache.
pub struct HttpRangeSource {
    url: String,
    config: HttpSourceConfig,
    agent: ureq::Agent,
    pos: u64,
    len: Option<u64>,
    /// Set once a read past `len` came back empty; suppresses further
    /// end probing.
    confirmed_end: bool,
    block: Vec<u8>,
    block_start: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl HttpRangeSource {
    pub fn open(
        url: String,
        config: HttpSourceConfig,
        cancel: Option<Arc<AtomicBool>>,
    ) -> Self {
        let agent = ureq::Agent::config_builder()
            .user_agent(concat!("netsink-renderer/", env!("CARGO_PKG_VERSION")))
            .build()
            .new_agent();
        Self {
            url,
            config,
            agent,
            pos: 0,
            len: None,
            confirmed_end: false,
            block: Vec::new(),
            block_start: 0,
            cancel,
        }
    }

    fn is_canceled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Probe the total length with a zero-length range request.
    fn ensure_len(&mut self) -> io::Result<u64> {
        if let Some(len) = self.len {
            return Ok(len);
        }
        let (data, len) = self.fetch_range(0, 0)?;
        let len = len
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "content length unavailable"))?;
        self.block = data;
        self.block_start = 0;
        self.len = Some(len);
        Ok(len)
    }

    /// Issue one range request; returns the body and the total length if
    /// the server reported one.
    fn fetch_range(&self, start: u64, end: u64) -> io::Result<(Vec<u8>, Option<u64>)> {
        let range = format!("bytes={start}-{end}");
        tracing::debug!(url = %self.url, range = %range, "http range request");

        let resp = self
            .agent
            .get(&self.url)
            .config()
            .timeout_per_call(Some(self.config.timeout))
            .build()
            .header("Range", &range)
            .call()
            .map_err(|e| {
                io::Error::new(io::ErrorKind::Other, format!("http range request failed: {e}"))
            })?;

        let status = resp.status();
        let content_range = resp
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let mut body = Vec::new();
        let (_, parts) = resp.into_parts();
        parts
            .into_reader()
            .read_to_end(&mut body)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("http read failed: {e}")))?;

        if status != ureq::http::StatusCode::OK
            && status != ureq::http::StatusCode::PARTIAL_CONTENT
            && status != ureq::http::StatusCode::RANGE_NOT_SATISFIABLE
        {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("http range status={status} url={} range={range}", self.url),
            ));
        }

        let total = match status {
            ureq::http::StatusCode::PARTIAL_CONTENT => content_range
                .as_deref()
                .and_then(parse_content_range_total)
                .or(content_length),
            ureq::http::StatusCode::OK => content_length,
            _ => None,
        };

        Ok((body, total))
    }

    /// Refill the block cache starting at the current position.
    fn refill(&mut self) -> io::Result<()> {
        if self.is_canceled() {
            return Ok(());
        }

        let start = self.pos;
        let mut end = start
            .saturating_add(self.config.block_size as u64)
            .saturating_sub(1);
        if let Some(len) = self.len {
            if len > 0 && start < len {
                end = end.min(len - 1);
            }
        }

        let (body, total) = self.fetch_range(start, end)?;
        if let Some(total) = total {
            // Servers occasionally report a length shorter than the data
            // they serve; only ever grow the known length.
            if self.len.map_or(true, |known| total > known) {
                self.len = Some(total);
            }
        }
        if body.is_empty() {
            self.confirmed_end = true;
        }
        self.block = body;
        self.block_start = start;
        Ok(())
    }
}

impl Read for HttpRangeSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.is_canceled() {
            return Ok(0);
        }

        if let Some(len) = self.len {
            // Do not trust the advertised end until a probe past it came
            // back empty.
            if self.pos >= len && self.confirmed_end {
                return Ok(0);
            }
        }

        let in_block = !self.block.is_empty()
            && self.pos >= self.block_start
            && self.pos < self.block_start.saturating_add(self.block.len() as u64);
        if !in_block {
            self.refill()?;
        }

        let offset = self.pos.saturating_sub(self.block_start) as usize;
        if offset >= self.block.len() {
            return Ok(0);
        }

        let n = (self.block.len() - offset).min(out.len());
        out[..n].copy_from_slice(&self.block[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpRangeSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(x) => x,
            SeekFrom::Current(d) => add_signed(self.pos, d),
            SeekFrom::End(d) => {
                let len = self.ensure_len()?;
                add_signed(len, d)
            }
        };
        self.pos = target;
        Ok(self.pos)
    }
}

impl MediaSource for HttpRangeSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
    }
}

/// Extract the total from a `bytes start-end/total` header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    let (_, total) = header.split_once('/')?;
    total.parse::<u64>().ok()
}

fn add_signed(base: u64, delta: i64) -> u64 {
    if delta >= 0 {
        base.saturating_add(delta as u64)
    } else {
        base.saturating_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> HttpRangeSource {
        HttpRangeSource::open(
            "http://example/track.flac".to_string(),
            HttpSourceConfig::default(),
            None,
        )
    }

    #[test]
    fn default_config_uses_ten_second_timeout() {
        let cfg = HttpSourceConfig::default();
        assert_eq!(cfg.timeout, Duration::from_secs(10));
        assert_eq!(cfg.block_size, 256 * 1024);
    }

    #[test]
    fn read_serves_from_cached_block() {
        let mut src = source();
        src.len = Some(8);
        src.confirmed_end = true;
        src.block = vec![10, 11, 12, 13, 14, 15, 16, 17];
        src.block_start = 0;
        src.pos = 2;

        let mut out = [0u8; 3];
        assert_eq!(src.read(&mut out).unwrap(), 3);
        assert_eq!(out, [12, 13, 14]);
        assert_eq!(src.pos, 5);
    }

    #[test]
    fn read_past_confirmed_end_returns_zero() {
        let mut src = source();
        src.len = Some(4);
        src.confirmed_end = true;
        src.pos = 4;
        let mut out = [0u8; 4];
        assert_eq!(src.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn canceled_source_reads_nothing() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut src = HttpRangeSource::open(
            "http://example/track.flac".to_string(),
            HttpSourceConfig::default(),
            Some(cancel),
        );
        let mut out = [0u8; 4];
        assert_eq!(src.read(&mut out).unwrap(), 0);
    }

    #[test]
    fn seek_supports_negative_current() {
        let mut src = source();
        src.pos = 10;
        assert_eq!(src.seek(SeekFrom::Current(-4)).unwrap(), 6);
        assert_eq!(src.seek(SeekFrom::Start(0)).unwrap(), 0);
    }

    #[test]
    fn content_range_total_parses() {
        assert_eq!(parse_content_range_total("bytes 0-99/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-99/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn add_signed_saturates() {
        assert_eq!(add_signed(5, -10), 0);
        assert_eq!(add_signed(u64::MAX, 10), u64::MAX);
        assert_eq!(add_signed(10, 5), 15);
    }
}
