use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, watch, Mutex},
    task::JoinHandle,
    time::{timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::Result,
    protocol::{FrameGenerator, GeneratorSnapshot},
    radio::{RadioDriver, RadioTransport},
    state::SharedSpeedState,
    types::{BridgeConfig, ChannelConfig, TransmitPhase, WheelConfig},
};

/// Radio resources held while broadcasting
struct ActiveChannel {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

/// Starts and stops the ANT+ broadcast
///
/// `start` and `stop` serialize on one async lock, so concurrent calls never
/// interleave. Each start claims a fresh radio from the [`RadioDriver`] and a
/// fresh [`FrameGenerator`]; counters do not survive a stop.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use antspeed::{BridgeConfig, SharedSpeedState, SimulatedRadioDriver, Transmitter};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let state = Arc::new(SharedSpeedState::new());
///     let transmitter = Transmitter::new(
///         Arc::clone(&state),
///         Arc::new(SimulatedRadioDriver),
///         &BridgeConfig::default(),
///     );
///
///     transmitter.start().await?;
///     state.set_speed(2.78);
///     tokio::time::sleep(std::time::Duration::from_secs(2)).await;
///     println!("{:?}", transmitter.snapshot());
///
///     transmitter.stop().await;
///     Ok(())
/// }
/// ```
pub struct Transmitter {
    state: Arc<SharedSpeedState>,
    driver: Arc<dyn RadioDriver>,
    channel: ChannelConfig,
    wheel: WheelConfig,
    join_timeout: Duration,
    active: Mutex<Option<ActiveChannel>>,
    phase: Arc<watch::Sender<TransmitPhase>>,
    snapshot: Arc<watch::Sender<GeneratorSnapshot>>,
}

impl Transmitter {
    /// Create a stopped transmitter
    #[must_use]
    pub fn new(
        state: Arc<SharedSpeedState>,
        driver: Arc<dyn RadioDriver>,
        config: &BridgeConfig,
    ) -> Self {
        let (phase, _) = watch::channel(TransmitPhase::Stopped);
        let (snapshot, _) = watch::channel(GeneratorSnapshot::default());

        Self {
            state,
            driver,
            channel: config.channel.clone(),
            wheel: config.wheel,
            join_timeout: config.timing.join_timeout(),
            active: Mutex::new(None),
            phase: Arc::new(phase),
            snapshot: Arc::new(snapshot),
        }
    }

    /// Start broadcasting
    ///
    /// Does nothing if the driving task is alive. A leftover channel whose task
    /// has ended is torn down first, then a fresh radio is claimed, opened and
    /// handed to a new driving task.
    ///
    /// # Errors
    ///
    /// Returns the radio error if the transport cannot be created or opened.
    /// The transmitter is back in [`TransmitPhase::Stopped`] in that case and a
    /// later start retries from scratch.
    pub async fn start(&self) -> Result<()> {
        let mut active = self.active.lock().await;

        if let Some(channel) = active.as_ref() {
            if !channel.task.is_finished() && self.is_running() {
                info!("start() called but transmitter already running - skipping start");
                return Ok(());
            }
        }

        if let Some(stale) = active.take() {
            info!("start() called while a channel exists but its task ended - cleaning up and replacing it");
            self.teardown(stale).await;
        }

        self.phase.send_replace(TransmitPhase::Starting);
        info!("ANT+ transmitter starting ...");

        match self.open_channel().await {
            Ok(radio) => {
                let (shutdown, shutdown_rx) = oneshot::channel();
                let generator = FrameGenerator::new(self.channel.tick_seconds(), self.wheel);
                self.snapshot.send_replace(generator.snapshot());
                self.phase.send_replace(TransmitPhase::Running);

                let task = tokio::spawn(drive(
                    radio,
                    generator,
                    DriveContext {
                        state: Arc::clone(&self.state),
                        phase: Arc::clone(&self.phase),
                        snapshot: Arc::clone(&self.snapshot),
                        device_number: self.channel.device_number,
                        device_type: self.channel.device_type,
                    },
                    shutdown_rx,
                ));

                *active = Some(ActiveChannel { shutdown, task });
                info!(
                    "ANT+ transmitter running as device {} (type {})",
                    self.channel.device_number, self.channel.device_type
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to start ANT+ transmitter: {}", e);
                self.phase.send_replace(TransmitPhase::Stopped);
                Err(e)
            }
        }
    }

    /// Stop broadcasting and release the radio
    ///
    /// Idempotent. The last sample time is cleared so the watchdog does not
    /// resume the broadcast until a new sample arrives. The driving task is
    /// given the configured join timeout to close its channel; past that it is
    /// aborted and the stop still completes.
    pub async fn stop(&self) {
        let mut active = self.active.lock().await;
        self.state.clear_last_update();

        let Some(channel) = active.take() else {
            debug!("stop() called while already stopped");
            self.phase.send_replace(TransmitPhase::Stopped);
            return;
        };

        self.phase.send_replace(TransmitPhase::Stopping);
        info!("Stopping ANT+ transmitter...");
        self.teardown(channel).await;
        self.phase.send_replace(TransmitPhase::Stopped);
        info!("ANT+ transmitter stopped.");
    }

    /// Whether frames are being broadcast
    #[must_use]
    pub fn is_running(&self) -> bool {
        *self.phase.borrow() == TransmitPhase::Running
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> TransmitPhase {
        *self.phase.borrow()
    }

    /// Watch lifecycle phase changes
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<TransmitPhase> {
        self.phase.subscribe()
    }

    /// Counters of the current (or last) generator
    #[must_use]
    pub fn snapshot(&self) -> GeneratorSnapshot {
        *self.snapshot.borrow()
    }

    /// Claim and open a radio, closing it again if the open fails
    async fn open_channel(&self) -> Result<Box<dyn RadioTransport>> {
        let mut radio = self.driver.create()?;

        if let Err(e) = radio.open(&self.channel).await {
            if let Err(close_err) = radio.close().await {
                warn!("Error closing partially opened channel: {}", close_err);
            }
            return Err(e);
        }

        Ok(radio)
    }

    /// Signal the driving task and join it within the timeout
    async fn teardown(&self, channel: ActiveChannel) {
        let ActiveChannel { shutdown, mut task } = channel;

        // receiver is gone if the task already ended on its own
        let _ = shutdown.send(());

        match timeout(self.join_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => debug!("Transmitter task joined"),
            Ok(Ok(Err(e))) => warn!("Transmitter task ended with error: {}", e),
            Ok(Err(e)) => error!("Transmitter task failed to join: {}", e),
            Err(_) => {
                warn!(
                    "Transmitter task did not stop within {}ms - aborting it",
                    self.join_timeout.as_millis()
                );
                task.abort();
            }
        }
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        if let Some(channel) = self.active.get_mut().take() {
            let _ = channel.shutdown.send(());
        }
    }
}

struct DriveContext {
    state: Arc<SharedSpeedState>,
    phase: Arc<watch::Sender<TransmitPhase>>,
    snapshot: Arc<watch::Sender<GeneratorSnapshot>>,
    device_number: u16,
    device_type: u8,
}

/// Driving task: one frame per transmit tick until shut down or the radio fails
async fn drive(
    mut radio: Box<dyn RadioTransport>,
    mut generator: FrameGenerator,
    ctx: DriveContext,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let started = Instant::now();

    let result = loop {
        tokio::select! {
            _ = &mut shutdown => break Ok(()),
            tick = radio.tx_event() => {
                if let Err(e) = tick {
                    break Err(e);
                }

                let frame = generator.next_frame(ctx.state.speed());
                if let Err(e) = radio.send_broadcast(frame.to_bytes()).await {
                    break Err(e);
                }
                ctx.snapshot.send_replace(generator.snapshot());

                debug!(
                    "{:05.2} TX:{}, {}, {}",
                    started.elapsed().as_secs_f64(),
                    ctx.device_number,
                    ctx.device_type,
                    frame
                );
            }
        }
    };

    if let Err(e) = radio.close().await {
        warn!("Error closing ANT+ channel: {}", e);
    }

    if let Err(e) = &result {
        error!("ANT+ transmit loop ended: {}", e);
        ctx.phase.send_if_modified(|phase| {
            if *phase == TransmitPhase::Running {
                *phase = TransmitPhase::Stopped;
                true
            } else {
                false
            }
        });
    }

    result
}
