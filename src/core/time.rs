//! Frame counting for visibility bookkeeping

use std::time::{Duration, Instant};

/// Monotonic frame counter plus the last frame interval.
///
/// Visibility ("last seen at frame N") is tracked in frames; the interval
/// converts retention times expressed in seconds into frame counts.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frame: u32,
    last_tick: Option<Instant>,
    interval: Duration,
}

impl FrameClock {
    /// Create a new clock at frame 1 (frame 0 means "never").
    pub fn new() -> Self {
        Self {
            frame: 1,
            last_tick: None,
            interval: Duration::ZERO,
        }
    }

    /// Call once per frame to advance the counter and measure the interval.
    pub fn tick(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_tick {
            self.interval = now - last;
        }
        self.last_tick = Some(now);
        self.frame = self.frame.wrapping_add(1).max(1);
    }

    /// Advance by a fixed interval without reading the wall clock.
    pub fn advance(&mut self, interval: Duration) {
        self.interval = interval;
        self.frame = self.frame.wrapping_add(1).max(1);
    }

    /// Current frame number
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Last frame interval in seconds (0 before the second tick)
    pub fn interval_secs(&self) -> f32 {
        self.interval.as_secs_f32()
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_starts_at_one() {
        let clock = FrameClock::new();
        assert_eq!(clock.frame(), 1);
        assert_eq!(clock.interval_secs(), 0.0);
    }

    #[test]
    fn test_advance() {
        let mut clock = FrameClock::new();
        clock.advance(Duration::from_millis(20));
        clock.advance(Duration::from_millis(20));
        assert_eq!(clock.frame(), 3);
        assert!((clock.interval_secs() - 0.02).abs() < 1e-6);
    }
}
