use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Instant,
};

use crate::types::Command;

#[derive(Debug, Default)]
struct SpeedState {
    speed: f64,
    last_update: Option<Instant>,
    commands: VecDeque<Command>,
}

/// Speed state shared by the ingest, watchdog, supervisor and transmitter
///
/// Every field is guarded by a single lock which is only held for the length of
/// one read or read-modify-write; no method blocks on I/O while holding it.
/// Speeds are in meters per second and never negative.
#[derive(Debug, Default)]
pub struct SharedSpeedState {
    inner: Mutex<SpeedState>,
    running: AtomicBool,
}

/// Clamp to the valid speed domain, mapping NaN and negatives to zero
fn sanitize(speed: f64) -> f64 {
    if speed.is_finite() && speed > 0.0 {
        speed
    } else {
        0.0
    }
}

impl SharedSpeedState {
    /// Create an empty state: zero speed, no sample, empty queue, not running
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current speed in m/s
    pub fn set_speed(&self, speed: f64) {
        self.inner.lock().speed = sanitize(speed);
    }

    /// Current speed in m/s
    #[must_use]
    pub fn speed(&self) -> f64 {
        self.inner.lock().speed
    }

    /// Apply `f` to the current speed under the lock and return the new value
    pub fn update_speed(&self, f: impl FnOnce(f64) -> f64) -> f64 {
        let mut state = self.inner.lock();
        state.speed = sanitize(f(state.speed));
        state.speed
    }

    /// Store a fresh sample: speed and its arrival time in one critical section
    pub fn record_sample(&self, speed: f64, at: Instant) {
        let mut state = self.inner.lock();
        state.speed = sanitize(speed);
        state.last_update = Some(at);
    }

    /// Set the timestamp of the last delivered sample
    pub fn set_last_update(&self, at: Instant) {
        self.inner.lock().last_update = Some(at);
    }

    /// Timestamp of the last delivered sample, if any
    #[must_use]
    pub fn last_update(&self) -> Option<Instant> {
        self.inner.lock().last_update
    }

    /// Forget the last sample timestamp
    pub fn clear_last_update(&self) {
        self.inner.lock().last_update = None;
    }

    /// Append a command to the queue
    pub fn push_command(&self, command: Command) {
        self.inner.lock().commands.push_back(command);
    }

    /// Take the oldest queued command, or `None` when the queue is empty
    #[must_use]
    pub fn pop_command(&self) -> Option<Command> {
        self.inner.lock().commands.pop_front()
    }

    /// Number of queued commands
    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.inner.lock().commands.len()
    }

    /// Process liveness flag
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Set the process liveness flag
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn test_speed_is_clamped() {
        let state = SharedSpeedState::new();

        state.set_speed(4.2);
        assert!((state.speed() - 4.2).abs() < f64::EPSILON);

        state.set_speed(-3.0);
        assert!(state.speed().abs() < f64::EPSILON);

        state.set_speed(f64::NAN);
        assert!(state.speed().abs() < f64::EPSILON);

        assert!(state.update_speed(|v| v - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_sample_sets_both_fields() {
        let state = SharedSpeedState::new();
        assert!(state.last_update().is_none());

        let now = Instant::now();
        state.record_sample(2.5, now);
        assert_eq!(state.last_update(), Some(now));
        assert!((state.speed() - 2.5).abs() < f64::EPSILON);

        state.clear_last_update();
        assert!(state.last_update().is_none());
        assert!((state.speed() - 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_command_queue_is_fifo() {
        let state = SharedSpeedState::new();
        assert_eq!(state.pop_command(), None);

        state.push_command(Command::Start);
        state.push_command(Command::Stop);
        state.push_command(Command::Start);
        assert_eq!(state.pending_commands(), 3);

        assert_eq!(state.pop_command(), Some(Command::Start));
        assert_eq!(state.pop_command(), Some(Command::Stop));
        assert_eq!(state.pop_command(), Some(Command::Start));
        assert_eq!(state.pop_command(), None);
    }

    #[test]
    fn test_running_flag() {
        let state = SharedSpeedState::new();
        assert!(!state.is_running());
        state.set_running(true);
        assert!(state.is_running());
        state.set_running(false);
        assert!(!state.is_running());
    }

    #[test]
    fn test_concurrent_updates() {
        let state = Arc::new(SharedSpeedState::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        state.update_speed(|v| v + 1.0);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!((state.speed() - 8000.0).abs() < f64::EPSILON);
    }
}
