use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// Monotonic wall time in seconds since player start. All scheduling math
/// (frame timers, clock deltas) runs on this origin so values stay small
/// and comparable.
#[derive(Debug)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn seconds(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

/// An `f64` clock word shared across threads, stored as raw bits. The audio
/// callback reads clock words on the device thread, so these must never sit
/// behind a pipeline lock.
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    /// Read-modify-write without a compare loop; each clock word has exactly
    /// one producing thread.
    pub fn add(&self, delta: f64) {
        self.store(self.load() + delta);
    }
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;

    #[test]
    fn atomic_f64_round_trips() {
        let word = AtomicF64::new(1.25);
        assert_eq!(word.load(), 1.25);
        word.store(-3.5);
        assert_eq!(word.load(), -3.5);
        word.add(0.5);
        assert_eq!(word.load(), -3.0);
    }

    #[test]
    fn atomic_f64_preserves_nan() {
        let word = AtomicF64::new(f64::NAN);
        assert!(word.load().is_nan());
    }

    #[test]
    fn wall_clock_advances() {
        let wall = WallClock::new();
        let before = wall.seconds();
        thread::sleep(Duration::from_millis(20));
        let after = wall.seconds();
        assert!(after > before);
        assert!(after - before < 1.0);
    }
}
