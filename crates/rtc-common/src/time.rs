//! Epoch-2000 time codec.
//!
//! Field devices keep their real-time clock as seconds since
//! 2000-01-01T00:00:00Z split across two 16-bit registers, plus a third
//! register holding the millisecond part. This module converts between that
//! register layout, the device epoch and UTC instants.

use crate::error::{RtcError, RtcResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Seconds between the Unix epoch (1970-01-01) and the device epoch (2000-01-01).
pub const EPOCH_2000_UNIX_OFFSET: i64 = 946_684_800;

/// Number of registers in a device timestamp snapshot (epoch hi, epoch lo, ms).
pub const TIMESTAMP_REGISTER_COUNT: usize = 3;

/// Largest valid millisecond value.
pub const MAX_MILLISECONDS: u16 = 999;

/// Combine a big-endian register pair into a 32-bit value.
#[must_use]
pub fn words_to_u32(hi: u16, lo: u16) -> u32 {
    (u32::from(hi) << 16) | u32::from(lo)
}

/// Split a 32-bit value into a `(hi, lo)` register pair.
#[must_use]
pub fn u32_to_words(value: u32) -> (u16, u16) {
    ((value >> 16) as u16, (value & 0xFFFF) as u16)
}

/// Convert a device epoch value to a UTC instant.
///
/// The sub-second part of the result is exactly `ms` milliseconds. Values
/// above 999 saturate to 999.
#[must_use]
pub fn device_epoch_to_utc(epoch_seconds_2000: u32, ms: u16) -> DateTime<Utc> {
    let unix_seconds = EPOCH_2000_UNIX_OFFSET + i64::from(epoch_seconds_2000);
    let nanos = u32::from(ms.min(MAX_MILLISECONDS)) * 1_000_000;
    // Every u32 device epoch lands well inside chrono's representable range.
    DateTime::<Utc>::from_timestamp(unix_seconds, nanos).unwrap_or_default()
}

/// Render an instant as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn format_iso8601_millis(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Source of the host's current UTC time.
pub trait TimeSource {
    /// Current UTC instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Host wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock frozen at a given instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl TimeSource for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// A device clock reading: seconds since 2000-01-01 UTC plus milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct DeviceTimestamp {
    /// Whole seconds since 2000-01-01T00:00:00Z.
    pub epoch_seconds_2000: u32,
    /// Millisecond part, 0..=999.
    pub milliseconds: u16,
}

impl DeviceTimestamp {
    /// Create a timestamp from its two fields.
    #[must_use]
    pub fn new(epoch_seconds_2000: u32, milliseconds: u16) -> Self {
        Self {
            epoch_seconds_2000,
            milliseconds,
        }
    }

    /// Decode a `[epoch_hi, epoch_lo, ms]` register snapshot.
    ///
    /// Registers beyond the third are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RtcError::MalformedPayload`] if fewer than three registers
    /// were supplied or the millisecond register is above 999.
    pub fn from_registers(registers: &[u16]) -> RtcResult<Self> {
        let [hi, lo, ms, ..] = registers else {
            return Err(RtcError::MalformedPayload(format!(
                "expected {TIMESTAMP_REGISTER_COUNT} registers, got {}",
                registers.len()
            )));
        };

        if *ms > MAX_MILLISECONDS {
            return Err(RtcError::MalformedPayload(format!(
                "millisecond register out of range: {ms}"
            )));
        }

        Ok(Self::new(words_to_u32(*hi, *lo), *ms))
    }

    /// The epoch field as a `(hi, lo)` register pair.
    #[must_use]
    pub fn epoch_registers(&self) -> [u16; 2] {
        let (hi, lo) = u32_to_words(self.epoch_seconds_2000);
        [hi, lo]
    }

    /// The full `[epoch_hi, epoch_lo, ms]` snapshot.
    #[must_use]
    pub fn to_registers(&self) -> [u16; TIMESTAMP_REGISTER_COUNT] {
        let [hi, lo] = self.epoch_registers();
        [hi, lo, self.milliseconds]
    }

    /// The equivalent UTC instant.
    #[must_use]
    pub fn to_utc(&self) -> DateTime<Utc> {
        device_epoch_to_utc(self.epoch_seconds_2000, self.milliseconds)
    }

    /// Milliseconds since the device epoch.
    #[must_use]
    pub fn total_millis(&self) -> i64 {
        i64::from(self.epoch_seconds_2000) * 1000 + i64::from(self.milliseconds)
    }

    /// Signed offset of `self` relative to `reference`, in milliseconds.
    ///
    /// Negative when `self` is behind `reference`.
    #[must_use]
    pub fn offset_millis(&self, reference: &Self) -> i64 {
        self.total_millis() - reference.total_millis()
    }

    /// Convert a UTC instant to the device representation.
    ///
    /// Instants before 2000-01-01 clamp to epoch 0; instants past the u32
    /// range clamp to `u32::MAX`. The millisecond part is kept as is.
    #[must_use]
    pub fn from_utc(ts: &DateTime<Utc>) -> Self {
        let epoch = ts.timestamp() - EPOCH_2000_UNIX_OFFSET;
        let epoch_seconds_2000 = u32::try_from(epoch.max(0)).unwrap_or(u32::MAX);
        let milliseconds = ts.timestamp_subsec_millis().min(u32::from(MAX_MILLISECONDS)) as u16;
        Self::new(epoch_seconds_2000, milliseconds)
    }
}

impl std::fmt::Display for DeviceTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s + {}ms", self.epoch_seconds_2000, self.milliseconds)
    }
}

/// Capture the host's current time in device representation.
#[must_use]
pub fn host_time_as_device_epoch<C: TimeSource + ?Sized>(clock: &C) -> DeviceTimestamp {
    DeviceTimestamp::from_utc(&clock.now())
}
