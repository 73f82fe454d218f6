use serde::Serialize;
use std::{fmt, str::FromStr, time::Duration};

use crate::{
    error::BridgeError, ANTPLUS_NETWORK_KEY, BIKE_SPEED_DEVICE_TYPE, CHANNEL_PERIOD,
    CHANNEL_RF_FREQUENCY, CHANNEL_TIMER_HZ, DEFAULT_DEVICE_NUMBER, DEFAULT_WHEEL_CIRCUMFERENCE_M,
    TRANSMISSION_TYPE,
};

/// Unit of the `speed` field posted by the speed source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpeedUnit {
    /// Millimeters per second (what the treadmill app sends)
    #[default]
    MillimetersPerSecond,
    /// Meters per second
    MetersPerSecond,
    /// Kilometers per hour
    KilometersPerHour,
}

impl SpeedUnit {
    /// Convert a raw posted value into kilometers per hour
    #[must_use]
    pub fn to_kmh(self, value: f64) -> f64 {
        match self {
            Self::MillimetersPerSecond => 3.6 * value / 1000.0,
            Self::MetersPerSecond => 3.6 * value,
            Self::KilometersPerHour => value,
        }
    }

    /// Convert a raw posted value into meters per second
    #[must_use]
    pub fn to_mps(self, value: f64) -> f64 {
        self.to_kmh(value) / 3.6
    }
}

impl fmt::Display for SpeedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MillimetersPerSecond => write!(f, "mm-per-s"),
            Self::MetersPerSecond => write!(f, "m-per-s"),
            Self::KilometersPerHour => write!(f, "km-per-h"),
        }
    }
}

impl FromStr for SpeedUnit {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mm-per-s" | "mm/s" => Ok(Self::MillimetersPerSecond),
            "m-per-s" | "m/s" => Ok(Self::MetersPerSecond),
            "km-per-h" | "km/h" => Ok(Self::KilometersPerHour),
            other => Err(BridgeError::InvalidParameters(format!(
                "unknown speed unit: {other}"
            ))),
        }
    }
}

/// Control token passed from the watchdog and diagnostics to the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Command {
    /// Start (or resume) the ANT+ broadcast
    Start,
    /// Stop the ANT+ broadcast and release the radio
    Stop,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "START"),
            Self::Stop => write!(f, "STOP"),
        }
    }
}

/// Lifecycle phase of the transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmitPhase {
    /// No radio resources are held
    #[default]
    Stopped,
    /// Radio is being configured
    Starting,
    /// Driving task is broadcasting frames
    Running,
    /// Radio is being released
    Stopping,
}

impl fmt::Display for TransmitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// How the generator turns intervals and speed into wire counters
///
/// The event time and distance formulas must use the same time base,
/// otherwise receivers compute the wrong speed from the counter deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingModel {
    /// `1024 * n / tick` event time and `avg_speed / tick` distance.
    ///
    /// Event time advances faster than wall clock but the reciprocal factors
    /// cancel, so head units display the posted speed.
    #[default]
    Legacy,
    /// `1024 * n * tick` event time and `avg_speed * tick` distance.
    Physical,
}

impl fmt::Display for TimingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "legacy"),
            Self::Physical => write!(f, "physical"),
        }
    }
}

impl FromStr for TimingModel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "physical" => Ok(Self::Physical),
            other => Err(BridgeError::InvalidParameters(format!(
                "unknown timing model: {other}"
            ))),
        }
    }
}

/// ANT+ channel parameters handed to the radio transport on start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Network key loaded into `network_number`
    pub network_key: [u8; 8],
    /// Network slot the key is loaded into
    pub network_number: u8,
    /// Channel number on the radio
    pub channel_number: u8,
    /// ANT+ device number advertised by the sensor
    pub device_number: u16,
    /// ANT+ device type
    pub device_type: u8,
    /// ANT+ transmission type
    pub transmission_type: u8,
    /// Broadcast period in 1/32768 s counts
    pub period: u16,
    /// RF channel offset from 2400 MHz
    pub rf_frequency: u8,
}

impl ChannelConfig {
    /// Duration of one transmit tick in seconds
    #[must_use]
    pub fn tick_seconds(&self) -> f64 {
        f64::from(self.period) / CHANNEL_TIMER_HZ
    }

    /// Duration of one transmit tick
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(self.tick_seconds())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            network_key: ANTPLUS_NETWORK_KEY,
            network_number: 0,
            channel_number: 0,
            device_number: DEFAULT_DEVICE_NUMBER,
            device_type: BIKE_SPEED_DEVICE_TYPE,
            transmission_type: TRANSMISSION_TYPE,
            period: CHANNEL_PERIOD,
            rf_frequency: CHANNEL_RF_FREQUENCY,
        }
    }
}

/// Wheel geometry and counter model used by the frame generator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelConfig {
    /// Wheel circumference in meters
    pub circumference_m: f64,
    /// Counter formula
    pub timing_model: TimingModel,
}

impl Default for WheelConfig {
    fn default() -> Self {
        Self {
            circumference_m: DEFAULT_WHEEL_CIRCUMFERENCE_M,
            timing_model: TimingModel::default(),
        }
    }
}

/// Periods and thresholds for the background loops
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Watchdog tick period in milliseconds
    pub watchdog_interval_ms: u64,
    /// Supervisor command poll period in milliseconds
    pub supervisor_interval_ms: u64,
    /// Bound on joining the driving task during stop, in milliseconds
    pub join_timeout_ms: u64,
    /// Samples younger than this are fresh
    pub fresh_secs: u64,
    /// Samples older than `fresh_secs` and up to this age are decayed
    pub decay_secs: u64,
    /// Samples older than `decay_secs` and up to this age force zero speed
    pub zero_secs: u64,
    /// Samples younger than this auto-resume a stopped transmitter
    pub resume_secs: u64,
    /// Multiplier applied per watchdog tick while decaying
    pub decay_factor: f64,
}

impl TimingConfig {
    /// Watchdog tick period
    #[must_use]
    pub const fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    /// Supervisor poll period
    #[must_use]
    pub const fn supervisor_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor_interval_ms)
    }

    /// Join bound for the driving task
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_ms: 1_000,
            supervisor_interval_ms: 100,
            join_timeout_ms: 2_000,
            fresh_secs: 3,
            decay_secs: 30,
            zero_secs: 300,
            resume_secs: 100,
            decay_factor: 0.5,
        }
    }
}

/// Complete bridge configuration
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// ANT+ channel parameters
    pub channel: ChannelConfig,
    /// Wheel geometry and counter model
    pub wheel: WheelConfig,
    /// Loop periods and watchdog thresholds
    pub timing: TimingConfig,
    /// Unit of the posted `speed` field
    pub speed_unit: SpeedUnit,
}
