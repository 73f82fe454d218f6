use crate::{
    error::{BridgeError, Result},
    types::{TimingModel, WheelConfig},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::trace;

/// ANT+ broadcast payload size in bytes
pub const FRAME_SIZE: usize = 8;

/// Message counter value after which the page cycle restarts
pub const MESSAGE_COUNT_WRAP: u8 = 68;

/// High bit of byte 0, flipped every four messages
pub const PAGE_TOGGLE_BIT: u8 = 0x80;

/// Event time resolution: units per second
pub const EVENT_TIME_UNITS_PER_SECOND: f64 = 1024.0;

/// Manufacturer ID advertised on page 2
pub const MANUFACTURER_ID: u8 = 1;

/// Serial number advertised on page 2
pub const SERIAL_NUMBER: u16 = 0xFFFF;

/// Hardware version advertised on page 3
pub const HW_VERSION: u8 = 1;

/// Software version advertised on page 3
pub const SW_VERSION: u8 = 1;

/// Model number advertised on page 3
pub const MODEL_NUMBER: u8 = 1;

/// Bike speed data pages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageId {
    /// Default data page, bytes 1-3 reserved
    Default = 0x00,
    /// Manufacturer ID and serial number
    ManufacturerId = 0x02,
    /// Hardware/software version and model number
    ProductId = 0x03,
}

impl PageId {
    /// Convert from the page number with the toggle bit cleared
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Default),
            0x02 => Some(Self::ManufacturerId),
            0x03 => Some(Self::ProductId),
            _ => None,
        }
    }

    /// Page for a given message counter value
    ///
    /// Counts 1-2 carry the manufacturer page, 3-4 the product page and
    /// everything after that the default page.
    #[must_use]
    pub const fn for_message_count(count: u8) -> Self {
        match count {
            0..=2 => Self::ManufacturerId,
            3..=4 => Self::ProductId,
            _ => Self::Default,
        }
    }

    /// Bytes 1-3 of this page
    #[must_use]
    pub const fn page_data(self) -> [u8; 3] {
        match self {
            Self::Default => [0xFF, 0xFF, 0xFF],
            Self::ManufacturerId => {
                let serial = SERIAL_NUMBER.to_le_bytes();
                [MANUFACTURER_ID, serial[0], serial[1]]
            }
            Self::ProductId => [HW_VERSION, SW_VERSION, MODEL_NUMBER],
        }
    }
}

/// One ANT+ bike speed broadcast
///
/// Wire layout:
/// - Byte 0: page id, bit 7 is the page toggle
/// - Bytes 1-3: page-dependent
/// - Bytes 4-5: event time, 1/1024 s, little-endian
/// - Bytes 6-7: cumulative wheel revolutions, little-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Data page
    pub page: PageId,
    /// Page toggle bit state
    pub toggle: bool,
    /// Bytes 1-3
    pub page_data: [u8; 3],
    /// Last speed event time, wraps at 65536
    pub event_time: u16,
    /// Cumulative revolutions, wraps at 65536
    pub revolutions: u16,
}

impl Frame {
    /// Byte 0 as it appears on the wire
    #[must_use]
    pub const fn page_byte(&self) -> u8 {
        if self.toggle {
            self.page as u8 | PAGE_TOGGLE_BIT
        } else {
            self.page as u8
        }
    }

    /// Serialize frame to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_SIZE);

        buf.put_u8(self.page_byte());
        buf.put_slice(&self.page_data);
        buf.put_u16_le(self.event_time);
        buf.put_u16_le(self.revolutions);

        buf.freeze()
    }

    /// Serialize frame into a fixed array
    #[must_use]
    pub fn to_array(&self) -> [u8; FRAME_SIZE] {
        let mut out = [0u8; FRAME_SIZE];
        out.copy_from_slice(&self.to_bytes());
        out
    }

    /// Parse frame from bytes
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidParameters`] if the payload is shorter than
    /// [`FRAME_SIZE`] or carries an unknown page id.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_SIZE {
            return Err(BridgeError::InvalidParameters(format!(
                "Frame too short: {} bytes, expected {}",
                data.len(),
                FRAME_SIZE
            )));
        }

        let mut buf = data;

        let page_byte = buf.get_u8();
        let page = PageId::from_u8(page_byte & !PAGE_TOGGLE_BIT).ok_or_else(|| {
            BridgeError::InvalidParameters(format!("Unknown page id: {page_byte:02X}"))
        })?;

        let mut page_data = [0u8; 3];
        buf.copy_to_slice(&mut page_data);

        Ok(Self {
            page,
            toggle: page_byte & PAGE_TOGGLE_BIT != 0,
            page_data,
            event_time: buf.get_u16_le(),
            revolutions: buf.get_u16_le(),
        })
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_array();
        write!(f, "[")?;
        for (i, byte) in bytes.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{byte:02X}")?;
        }
        write!(f, "]")
    }
}

/// Counter state of a running transmitter, as published after each frame
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GeneratorSnapshot {
    /// Position in the 1..=69 page cycle (0 right after a wrap)
    pub message_count: u8,
    /// Frames produced since start
    pub total_intervals: u64,
    /// Real-valued cumulative wheel rotations
    pub total_wheel_rotations: f64,
    /// Speed sample used by the previous frame, m/s
    pub last_speed: f64,
}

/// Truncate a non-negative counter to its 16-bit wire value
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn wrap_u16(value: f64) -> u16 {
    (value.trunc() % 65536.0) as u16
}

/// Turns per-tick speed samples into cumulative ANT+ bike speed frames
///
/// Called once per channel period from a single task. Creating a new generator
/// is how counters are reset; nothing survives a stop/start cycle.
#[derive(Debug, Clone)]
pub struct FrameGenerator {
    message_count: u8,
    total_intervals: u64,
    total_wheel_rotations: f64,
    last_speed: f64,
    tick_seconds: f64,
    wheel: WheelConfig,
}

impl FrameGenerator {
    /// Create a generator for a channel ticking every `tick_seconds`
    #[must_use]
    pub const fn new(tick_seconds: f64, wheel: WheelConfig) -> Self {
        Self {
            message_count: 0,
            total_intervals: 0,
            total_wheel_rotations: 0.0,
            last_speed: 0.0,
            tick_seconds,
            wheel,
        }
    }

    /// Produce the frame for the next tick given the current speed in m/s
    #[allow(clippy::cast_precision_loss)]
    pub fn next_frame(&mut self, speed: f64) -> Frame {
        self.message_count += 1;
        self.total_intervals += 1;

        let intervals = self.total_intervals as f64;
        let event_time = match self.wheel.timing_model {
            TimingModel::Legacy => EVENT_TIME_UNITS_PER_SECOND * intervals / self.tick_seconds,
            TimingModel::Physical => EVENT_TIME_UNITS_PER_SECOND * intervals * self.tick_seconds,
        };

        let speed = if speed.is_finite() { speed.max(0.0) } else { 0.0 };
        let avg_speed = 0.5 * (speed + self.last_speed);
        self.last_speed = speed;

        let distance = match self.wheel.timing_model {
            TimingModel::Legacy => avg_speed / self.tick_seconds,
            TimingModel::Physical => avg_speed * self.tick_seconds,
        };
        self.total_wheel_rotations += distance / self.wheel.circumference_m;

        let page = PageId::for_message_count(self.message_count);
        let frame = Frame {
            page,
            toggle: (self.message_count >> 2) & 0x01 == 1,
            page_data: page.page_data(),
            event_time: wrap_u16(event_time),
            revolutions: wrap_u16(self.total_wheel_rotations),
        };

        trace!(
            "intervals:{} speed:{:.2} m/s avg:{:.2} m/s distance:{:.2} rotations:{:.2}",
            self.total_intervals,
            speed,
            avg_speed,
            distance,
            self.total_wheel_rotations
        );

        if self.message_count > MESSAGE_COUNT_WRAP {
            self.message_count = 0;
        }

        frame
    }

    /// Current counters
    #[must_use]
    pub const fn snapshot(&self) -> GeneratorSnapshot {
        GeneratorSnapshot {
            message_count: self.message_count,
            total_intervals: self.total_intervals,
            total_wheel_rotations: self.total_wheel_rotations,
            last_speed: self.last_speed,
        }
    }
}
