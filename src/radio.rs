use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::{interval, Instant, Interval, MissedTickBehavior};
use tracing::{info, trace};

use crate::{
    error::{BridgeError, Result},
    protocol::FRAME_SIZE,
    types::ChannelConfig,
};

/// Highest RF channel offset the radio accepts (2524 MHz)
pub const MAX_RF_FREQUENCY: u8 = 124;

/// One open ANT channel on a radio
///
/// The transmitter drives an implementation from a single task: `open` once,
/// then `tx_event`/`send_broadcast` per channel period, then `close`.
#[async_trait]
pub trait RadioTransport: Send {
    /// Load the network key, assign the channel, set its ID, period and
    /// frequency, and open it for master transmit
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ChannelConfig`] if the parameters are rejected or
    /// [`BridgeError::Radio`] if the device cannot be claimed.
    async fn open(&mut self, config: &ChannelConfig) -> Result<()>;

    /// Wait for the next transmit tick of the open channel
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Radio`] if the channel is not open or the device
    /// went away.
    async fn tx_event(&mut self) -> Result<()>;

    /// Broadcast one 8-byte payload
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Radio`] if the payload cannot be queued.
    async fn send_broadcast(&mut self, payload: Bytes) -> Result<()>;

    /// Close the channel and release the device
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Radio`] if the device rejects the close.
    async fn close(&mut self) -> Result<()>;
}

/// Creates a fresh transport for every transmitter start
pub trait RadioDriver: Send + Sync {
    /// Claim a radio and hand back an unopened transport
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Radio`] if no radio is available.
    fn create(&self) -> Result<Box<dyn RadioTransport>>;
}

impl<F> RadioDriver for F
where
    F: Fn() -> Result<Box<dyn RadioTransport>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn RadioTransport>> {
        self()
    }
}

/// Check channel parameters the way the radio would
///
/// # Errors
///
/// Returns [`BridgeError::ChannelConfig`] describing the first bad field.
pub fn validate_channel(config: &ChannelConfig) -> Result<()> {
    if config.period == 0 {
        return Err(BridgeError::ChannelConfig(
            "channel period must be non-zero".to_string(),
        ));
    }
    if config.rf_frequency > MAX_RF_FREQUENCY {
        return Err(BridgeError::ChannelConfig(format!(
            "RF frequency {} out of range (0-{MAX_RF_FREQUENCY})",
            config.rf_frequency
        )));
    }
    if config.device_number == 0 {
        return Err(BridgeError::ChannelConfig(
            "device number 0 is a wildcard and cannot be transmitted".to_string(),
        ));
    }
    Ok(())
}

/// Radio stand-in that ticks on a timer at the channel period
///
/// Broadcasts are only logged, so the whole bridge can run without ANT+
/// hardware attached.
pub struct SimulatedRadio {
    ticker: Option<Interval>,
    device_number: u16,
    device_type: u8,
    opened_at: Instant,
    frames_sent: u64,
}

impl SimulatedRadio {
    /// Create a closed simulated radio
    #[must_use]
    pub fn new() -> Self {
        Self {
            ticker: None,
            device_number: 0,
            device_type: 0,
            opened_at: Instant::now(),
            frames_sent: 0,
        }
    }

    /// Number of payloads broadcast since the channel was opened
    #[must_use]
    pub const fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Whether the channel is open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.ticker.is_some()
    }
}

impl Default for SimulatedRadio {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioTransport for SimulatedRadio {
    async fn open(&mut self, config: &ChannelConfig) -> Result<()> {
        validate_channel(config)?;

        let period = Duration::from_secs_f64(config.tick_seconds());
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.ticker = Some(ticker);
        self.device_number = config.device_number;
        self.device_type = config.device_type;
        self.opened_at = Instant::now();
        self.frames_sent = 0;

        info!(
            "Simulated ANT+ channel {} open: device {}/{} type {}, period {}, {} MHz",
            config.channel_number,
            config.device_number,
            config.transmission_type,
            config.device_type,
            config.period,
            2400 + u32::from(config.rf_frequency)
        );
        Ok(())
    }

    async fn tx_event(&mut self) -> Result<()> {
        let ticker = self
            .ticker
            .as_mut()
            .ok_or_else(|| BridgeError::Radio("channel is not open".to_string()))?;
        ticker.tick().await;
        Ok(())
    }

    async fn send_broadcast(&mut self, payload: Bytes) -> Result<()> {
        if self.ticker.is_none() {
            return Err(BridgeError::Radio("channel is not open".to_string()));
        }
        if payload.len() != FRAME_SIZE {
            return Err(BridgeError::Radio(format!(
                "broadcast payload must be {FRAME_SIZE} bytes, got {}",
                payload.len()
            )));
        }

        self.frames_sent += 1;
        trace!(
            "{:05.2} radio TX:{}, {}, {:02X?}",
            self.opened_at.elapsed().as_secs_f64(),
            self.device_number,
            self.device_type,
            payload.as_ref()
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.ticker.take().is_some() {
            info!(
                "Simulated ANT+ channel closed after {} broadcasts",
                self.frames_sent
            );
        }
        Ok(())
    }
}

/// Driver handing out [`SimulatedRadio`] transports
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedRadioDriver;

impl RadioDriver for SimulatedRadioDriver {
    fn create(&self) -> Result<Box<dyn RadioTransport>> {
        Ok(Box::new(SimulatedRadio::new()))
    }
}
