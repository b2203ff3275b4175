//! Time string parsing and formatting for the control surface.
//!
//! Seek targets arrive as `HH:MM:SS`, `HH:MM:SS.mmm`, `MM:SS`, or plain
//! decimal seconds. Positions and durations are emitted as `HH:MM:SS`
//! with whole seconds.

/// Parse a transport time string into seconds.
pub fn parse_time_string(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let parts: Vec<&str> = s.split(':').collect();
    let seconds = match parts.as_slice() {
        [h, m, sec] => {
            let hours: u32 = h.parse().ok()?;
            let minutes: u32 = m.parse().ok()?;
            let secs: f64 = sec.parse().ok()?;
            if minutes >= 60 || !(0.0..60.0).contains(&secs) {
                return None;
            }
            hours as f64 * 3600.0 + minutes as f64 * 60.0 + secs
        }
        [m, sec] => {
            let minutes: u32 = m.parse().ok()?;
            let secs: f64 = sec.parse().ok()?;
            if !(0.0..60.0).contains(&secs) {
                return None;
            }
            minutes as f64 * 60.0 + secs
        }
        [only] => only.parse::<f64>().ok().filter(|v| *v >= 0.0)?,
        _ => return None,
    };

    Some(seconds)
}

/// Format whole seconds as `HH:MM:SS`.
pub fn format_hms(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
