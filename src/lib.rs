#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Antspeed
//!
//! Bridges an HTTP speed source (a treadmill app posting its belt speed) to a
//! simulated ANT+ bike speed sensor, so head units and trainer apps can pick up
//! indoor running or walking as if it came from a wheel sensor.
//!
//! ## Moving parts
//!
//! - **Shared state**: current speed, time of the last sample and a command queue,
//!   all behind one short-held lock ([`SharedSpeedState`])
//! - **Frame generator**: turns the speed seen at each transmit tick into the
//!   cumulative event time / revolution counters of the ANT+ bike speed profile
//!   ([`FrameGenerator`])
//! - **Decay watchdog**: halves, zeroes and finally stops the broadcast as the
//!   last sample ages ([`DecayWatchdog`])
//! - **Transmitter**: idempotent start/stop of the radio channel and the task that
//!   drives it ([`Transmitter`])
//! - **Ingest**: the HTTP endpoint the speed source posts to ([`Ingest`])
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use antspeed::{Bridge, BridgeConfig, SimulatedRadioDriver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let bridge = Bridge::new(BridgeConfig::default(), Arc::new(SimulatedRadioDriver));
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:5000").await?;
//!
//!     bridge
//!         .run(listener, async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

/// Supervisor loop and process lifecycle
pub mod bridge;
/// Error types and handling
pub mod error;
/// HTTP speed ingest
pub mod ingest;
/// ANT+ bike speed data pages and frame generation
pub mod protocol;
/// Radio transport boundary
pub mod radio;
/// Shared speed state
pub mod state;
/// Transmitter lifecycle management
pub mod transmitter;
/// Type definitions and configuration
pub mod types;
/// Stale-speed decay watchdog
pub mod watchdog;

// Re-export the main types for convenient usage
pub use bridge::Bridge;
pub use error::{BridgeError, Result};
pub use ingest::{Ingest, IngestResponse};
pub use protocol::{Frame, FrameGenerator, GeneratorSnapshot, PageId};
pub use radio::{RadioDriver, RadioTransport, SimulatedRadio, SimulatedRadioDriver};
pub use state::SharedSpeedState;
pub use transmitter::Transmitter;
pub use types::{
    BridgeConfig, ChannelConfig, Command, SpeedUnit, TimingConfig, TimingModel, TransmitPhase,
    WheelConfig,
};
pub use watchdog::{DecayWatchdog, Staleness};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// ANT+ managed network key
///
/// Loaded into network slot 0 before the channel is assigned; every ANT+
/// device profile broadcasts on this network.
pub const ANTPLUS_NETWORK_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

/// ANT+ device type of a bike speed sensor
pub const BIKE_SPEED_DEVICE_TYPE: u8 = 123;

/// Transmission type advertised in the channel ID
pub const TRANSMISSION_TYPE: u8 = 5;

/// Device number advertised unless overridden
pub const DEFAULT_DEVICE_NUMBER: u16 = 12775;

/// Channel period in 1/32768 s counts (about 4.04 Hz)
pub const CHANNEL_PERIOD: u16 = 8118;

/// RF channel, 2457 MHz
pub const CHANNEL_RF_FREQUENCY: u8 = 57;

/// ANT channel timer frequency, counts per second
pub const CHANNEL_TIMER_HZ: f64 = 32768.0;

/// Wheel circumference in meters used unless overridden
pub const DEFAULT_WHEEL_CIRCUMFERENCE_M: f64 = 2.105;
