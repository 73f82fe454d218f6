use std::{future::Future, sync::Arc};
use tokio::{
    net::TcpListener,
    time::{interval, MissedTickBehavior},
};
use tracing::{error, info, warn};

use crate::{
    error::{BridgeError, Result},
    ingest::Ingest,
    radio::RadioDriver,
    state::SharedSpeedState,
    transmitter::Transmitter,
    types::{BridgeConfig, Command},
    watchdog::DecayWatchdog,
};

/// Wires the ingest, watchdog and transmitter around one shared state
///
/// The supervisor loop drains the command queue in FIFO order and applies
/// each command to the transmitter. Clearing the running flag ends the loop
/// and the watchdog after their current tick.
pub struct Bridge {
    config: BridgeConfig,
    state: Arc<SharedSpeedState>,
    transmitter: Arc<Transmitter>,
}

impl Bridge {
    /// Create a bridge with an empty state and a stopped transmitter
    #[must_use]
    pub fn new(config: BridgeConfig, driver: Arc<dyn RadioDriver>) -> Self {
        let state = Arc::new(SharedSpeedState::new());
        let transmitter = Arc::new(Transmitter::new(Arc::clone(&state), driver, &config));

        Self {
            config,
            state,
            transmitter,
        }
    }

    /// Shared speed state
    #[must_use]
    pub const fn state(&self) -> &Arc<SharedSpeedState> {
        &self.state
    }

    /// Transmitter lifecycle manager
    #[must_use]
    pub const fn transmitter(&self) -> &Arc<Transmitter> {
        &self.transmitter
    }

    /// Ingest bound to this bridge's state
    #[must_use]
    pub fn ingest(&self) -> Ingest {
        Ingest::new(Arc::clone(&self.state), self.config.speed_unit)
    }

    /// Watchdog bound to this bridge's state and transmitter
    #[must_use]
    pub fn watchdog(&self) -> DecayWatchdog {
        DecayWatchdog::new(
            Arc::clone(&self.state),
            self.transmitter.subscribe_phase(),
            self.config.timing.clone(),
        )
    }

    /// Apply one command to the transmitter
    ///
    /// Start failures are logged; the transmitter is left stopped and the next
    /// `START` retries.
    pub async fn apply(&self, command: Command) {
        match command {
            Command::Start => {
                if let Err(e) = self.transmitter.start().await {
                    warn!("START failed, will retry on next request: {}", e);
                }
            }
            Command::Stop => self.transmitter.stop().await,
        }
    }

    /// Drain the command queue, returning how many commands were applied
    pub async fn apply_pending(&self) -> usize {
        let mut applied = 0;
        while let Some(command) = self.state.pop_command() {
            info!("Applying {} command", command);
            self.apply(command).await;
            applied += 1;
        }
        applied
    }

    /// Poll the command queue until the running flag is cleared
    pub async fn supervise(&self) {
        let mut ticker = interval(self.config.timing.supervisor_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state.is_running() {
            ticker.tick().await;
            self.apply_pending().await;
        }
    }

    /// Run the whole bridge until `shutdown` resolves
    ///
    /// Starts the transmitter right away, serves ingest requests on `listener`,
    /// and runs the watchdog and supervisor. On shutdown the watchdog and
    /// supervisor are wound down, the listener is dropped, and the transmitter
    /// is stopped before returning.
    ///
    /// # Errors
    ///
    /// Returns an error only if the watchdog task panicked.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send,
    ) -> Result<()> {
        self.state.set_running(true);
        self.state.push_command(Command::Start);

        let server = tokio::spawn(Arc::new(self.ingest()).serve(listener));
        let watchdog = tokio::spawn(self.watchdog().run());

        tokio::select! {
            () = shutdown => info!("Shutdown requested"),
            () = self.supervise() => {}
        }

        self.state.set_running(false);

        info!("Stopping HTTP server...");
        server.abort();
        let _ = server.await;
        info!("HTTP server stopped.");

        if let Err(e) = watchdog.await {
            error!("Watchdog task failed: {}", e);
            self.transmitter.stop().await;
            return Err(BridgeError::Other(format!(
                "watchdog task failed: {e}"
            )));
        }

        self.transmitter.stop().await;
        info!("Bridge stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        radio::testing::{Behavior, RecordingDriver},
        types::{TimingConfig, TransmitPhase},
    };
    use std::time::Duration;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
        sync::oneshot,
    };

    fn fast_config() -> BridgeConfig {
        BridgeConfig {
            timing: TimingConfig {
                watchdog_interval_ms: 10,
                supervisor_interval_ms: 5,
                join_timeout_ms: 200,
                ..TimingConfig::default()
            },
            ..BridgeConfig::default()
        }
    }

    #[tokio::test]
    async fn test_apply_pending_in_order() {
        let driver = RecordingDriver::new(Behavior::Healthy);
        let bridge = Bridge::new(fast_config(), driver.clone());

        bridge.state().push_command(Command::Start);
        bridge.state().push_command(Command::Start);
        bridge.state().push_command(Command::Stop);
        bridge.state().push_command(Command::Start);

        assert_eq!(bridge.apply_pending().await, 4);
        assert!(bridge.transmitter().is_running());
        // duplicate START is absorbed, STOP then START claims a second radio
        assert_eq!(driver.log.created(), 2);
        assert_eq!(bridge.apply_pending().await, 0);

        bridge.apply(Command::Stop).await;
        assert_eq!(bridge.transmitter().phase(), TransmitPhase::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_is_retried() {
        let driver = RecordingDriver::new(Behavior::FailOpen);
        let bridge = Bridge::new(fast_config(), driver.clone());

        bridge.apply(Command::Start).await;
        assert!(!bridge.transmitter().is_running());

        driver.set_behavior(Behavior::Healthy);
        bridge.apply(Command::Start).await;
        assert!(bridge.transmitter().is_running());
        bridge.apply(Command::Stop).await;
    }

    #[tokio::test]
    async fn test_watchdog_stop_reaches_transmitter() {
        let driver = RecordingDriver::new(Behavior::Healthy);
        let bridge = Bridge::new(fast_config(), driver);

        bridge.apply(Command::Start).await;
        let sampled = std::time::Instant::now();
        bridge.state().record_sample(3.0, sampled);

        bridge
            .watchdog()
            .tick_at(sampled + Duration::from_secs(400));
        bridge.apply_pending().await;

        assert_eq!(bridge.transmitter().phase(), TransmitPhase::Stopped);
        assert!(bridge.state().last_update().is_none());

        // a fresh sample brings the broadcast back
        let sampled = std::time::Instant::now();
        bridge.state().record_sample(3.0, sampled);
        bridge.watchdog().tick_at(sampled);
        bridge.apply_pending().await;
        assert!(bridge.transmitter().is_running());

        bridge.apply(Command::Stop).await;
    }

    #[tokio::test]
    async fn test_diagnostic_stop_is_not_resumed() {
        let driver = RecordingDriver::new(Behavior::Healthy);
        let bridge = Bridge::new(fast_config(), driver.clone());
        let ingest = bridge.ingest();

        let sampled = std::time::Instant::now();
        bridge.state().record_sample(3.0, sampled);
        bridge.apply(Command::Start).await;
        assert!(bridge.transmitter().is_running());

        assert_eq!(ingest.handle("GET", "/diagnostic/antstop", b"").status, 200);
        bridge.apply_pending().await;
        assert_eq!(bridge.transmitter().phase(), TransmitPhase::Stopped);
        assert!(bridge.state().last_update().is_none());

        bridge.watchdog().tick_at(sampled + Duration::from_secs(1));
        bridge.apply_pending().await;
        assert_eq!(bridge.transmitter().phase(), TransmitPhase::Stopped);
        assert_eq!(driver.log.created(), 1);

        // the next posted sample resumes the broadcast
        assert_eq!(ingest.handle("POST", "/", br#"{"speed": 3000}"#).status, 200);
        bridge.watchdog().tick_at(std::time::Instant::now());
        bridge.apply_pending().await;
        assert!(bridge.transmitter().is_running());

        bridge.apply(Command::Stop).await;
    }

    #[tokio::test]
    async fn test_run_until_shutdown() {
        let driver = RecordingDriver::new(Behavior::Healthy);
        let bridge = Arc::new(Bridge::new(fast_config(), driver.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let runner = {
            let bridge = Arc::clone(&bridge);
            tokio::spawn(async move {
                bridge
                    .run(listener, async {
                        let _ = stop_rx.await;
                    })
                    .await
            })
        };

        let body = r#"{"speed": 4000}"#;
        let request = format!(
            "POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK"));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while bridge.transmitter().snapshot().total_intervals < 5 {
            assert!(std::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(bridge.transmitter().snapshot().total_wheel_rotations > 0.0);

        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!bridge.state().is_running());
        assert_eq!(bridge.transmitter().phase(), TransmitPhase::Stopped);
        assert_eq!(driver.log.opened(), driver.log.closed());
    }
}
