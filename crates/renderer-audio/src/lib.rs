//! Audio core for the netsink renderer.
//!
//! - [`ring`]: single-producer/single-consumer byte ring with in-place
//!   format-adapting push variants
//! - [`format`]: sink format negotiation and conversion planning
//! - [`decode`]: URI decoding (Symphonia PCM, raw DSF/DFF)
//! - [`dsd`]: native DSF/DFF container readers
//! - [`http_stream`]: HTTP range media source for streaming playback
//! - [`pipeline`]: producer/consumer glue feeding the sink worker

pub mod decode;
pub mod dsd;
pub mod error;
pub mod format;
pub mod http_stream;
pub mod pipeline;
pub mod resample;
pub mod ring;

#[cfg(test)]
pub(crate) mod testutil;

pub use decode::Decoder;
pub use error::DecodeError;
pub use format::{negotiate, ConversionPlan, FormatPlan};
pub use pipeline::AudioPipeline;
pub use ring::RingBuffer;
