//! Transfer cadence calculation.
//!
//! One submission should carry roughly one MTU-sized payload of audio,
//! so the cycle time follows from the MTU and the stream byte rate.

use std::time::Duration;

/// Per-datagram protocol overhead subtracted from the MTU.
const OVERHEAD: u32 = 24;

/// Cycle time clamp range in microseconds.
const MIN_CYCLE_US: u64 = 100;
const MAX_CYCLE_US: u64 = 50_000;

pub struct CycleCalculator {
    efficient_mtu: u32,
}

impl CycleCalculator {
    pub fn new(mtu: u32) -> Self {
        Self {
            efficient_mtu: mtu.saturating_sub(OVERHEAD).max(1),
        }
    }

    /// Cycle time in microseconds for the given stream parameters,
    /// clamped to 100 µs … 50 ms.
    pub fn cycle_us(&self, sample_rate: u32, channels: u32, bits_per_sample: u32) -> u64 {
        let bytes_per_second =
            sample_rate as f64 * channels as f64 * bits_per_sample as f64 / 8.0;
        if bytes_per_second <= 0.0 {
            return MAX_CYCLE_US;
        }
        let cycle = (self.efficient_mtu as f64 / bytes_per_second * 1_000_000.0).round() as u64;
        cycle.clamp(MIN_CYCLE_US, MAX_CYCLE_US)
    }

    pub fn cycle_time(&self, sample_rate: u32, channels: u32, bits_per_sample: u32) -> Duration {
        Duration::from_micros(self.cycle_us(sample_rate, channels, bits_per_sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cd_rate_over_standard_mtu() {
        let calc = CycleCalculator::new(1_500);
        // 1476 effective bytes / 176400 B/s ~ 8367 us.
        assert_eq!(calc.cycle_us(44_100, 2, 16), 8_367);
    }

    #[test]
    fn dsd64_is_faster_cadence() {
        let calc = CycleCalculator::new(1_500);
        // DSD64 stereo: 705600 B/s.
        assert_eq!(calc.cycle_us(2_822_400, 2, 1), 2_092);
    }

    #[test]
    fn jumbo_mtu_at_low_rate_clamps_high() {
        let calc = CycleCalculator::new(16_128);
        assert_eq!(calc.cycle_us(8_000, 1, 16), MAX_CYCLE_US);
    }

    #[test]
    fn extreme_rate_clamps_low() {
        let calc = CycleCalculator::new(128);
        assert_eq!(calc.cycle_us(384_000, 8, 32), MIN_CYCLE_US);
    }

    #[test]
    fn zero_rate_does_not_divide_by_zero() {
        let calc = CycleCalculator::new(1_500);
        assert_eq!(calc.cycle_us(0, 2, 16), MAX_CYCLE_US);
    }
}
