use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    state::SharedSpeedState,
    types::{Command, TimingConfig, TransmitPhase},
};

/// Age class of the last speed sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    /// No sample since start or since the last stop
    Unset,
    /// Recent enough to trust as-is
    Fresh,
    /// Briefly stale, speed is decayed every tick
    Stale,
    /// Source went quiet, speed is forced to zero
    Silent,
    /// Source is gone, transmission is released
    Abandoned,
}

/// Periodically ages the shared speed when the source stops posting
///
/// Each tick looks at the time since the last sample and, in order: halves the
/// speed while briefly stale, zeroes it once silent, and queues `STOP` once
/// abandoned. Independently it queues `START` when a recent sample shows up
/// while the transmitter is not running.
pub struct DecayWatchdog {
    state: Arc<SharedSpeedState>,
    phase: watch::Receiver<TransmitPhase>,
    config: TimingConfig,
}

impl DecayWatchdog {
    /// Create a watchdog observing `phase` for the auto-resume rule
    #[must_use]
    pub const fn new(
        state: Arc<SharedSpeedState>,
        phase: watch::Receiver<TransmitPhase>,
        config: TimingConfig,
    ) -> Self {
        Self {
            state,
            phase,
            config,
        }
    }

    /// Classify a sample age
    #[must_use]
    pub const fn classify(&self, elapsed: Duration) -> Staleness {
        let secs = elapsed.as_secs();
        let exact = elapsed.subsec_nanos() == 0;

        // thresholds are inclusive upper bounds: 3 s is still fresh, 3.001 s is not
        if secs < self.config.fresh_secs || (secs == self.config.fresh_secs && exact) {
            Staleness::Fresh
        } else if secs < self.config.decay_secs || (secs == self.config.decay_secs && exact) {
            Staleness::Stale
        } else if secs < self.config.zero_secs || (secs == self.config.zero_secs && exact) {
            Staleness::Silent
        } else {
            Staleness::Abandoned
        }
    }

    /// Run one watchdog step as of `now`
    pub fn tick_at(&self, now: Instant) -> Staleness {
        let Some(last_update) = self.state.last_update() else {
            return Staleness::Unset;
        };
        let elapsed = now.saturating_duration_since(last_update);
        let staleness = self.classify(elapsed);

        match staleness {
            Staleness::Unset | Staleness::Fresh => {}
            Staleness::Stale => {
                let factor = self.config.decay_factor;
                let speed = self.state.update_speed(|v| v * factor);
                debug!(
                    "No speed sample for {:.1}s - decayed speed to {:.2} m/s",
                    elapsed.as_secs_f64(),
                    speed
                );
            }
            Staleness::Silent => {
                self.state.set_speed(0.0);
                debug!(
                    "No speed sample for {:.1}s - speed forced to zero",
                    elapsed.as_secs_f64()
                );
            }
            Staleness::Abandoned => {
                info!(
                    "No speed sample for {}s - releasing ANT+ transmitter",
                    elapsed.as_secs()
                );
                self.state.push_command(Command::Stop);
                self.state.clear_last_update();
            }
        }

        let transmitting = *self.phase.borrow() == TransmitPhase::Running;
        if elapsed < Duration::from_secs(self.config.resume_secs) && !transmitting {
            info!("Speed samples arriving while transmitter is down - requesting start");
            self.state.push_command(Command::Start);
        }

        staleness
    }

    /// Tick until the shared running flag is cleared
    pub async fn run(self) {
        let mut ticker = interval(self.config.watchdog_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Decay watchdog started");
        loop {
            ticker.tick().await;
            if !self.state.is_running() {
                break;
            }
            self.tick_at(Instant::now());
        }
        info!("Decay watchdog stopped");
    }
}
