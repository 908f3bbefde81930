//! Per-device clock sync exchange.
//!
//! One device at a time:
//! 1. connect
//! 2. read the clock snapshot
//! 3. capture host time in device representation
//! 4. write the epoch registers (and optionally the millisecond register)
//! 5. wait for the device to apply the new time
//! 6. read the clock back
//!
//! Connect, read-before and write failures end the exchange for that device.
//! A failed read-back only downgrades the outcome to unverified. The
//! connection is closed on every path by the [`Session`] guard.

use crate::error::SyncError;
use rtc_common::{
    host_time_as_device_epoch, DeviceTarget, DeviceTimestamp, RegisterMap, RegisterRange,
    SyncConfig, SystemClock, TimeSource,
};
use rtc_fieldbus::{RegisterTransport, Session};
use std::time::Duration;
use tracing::{debug, info, info_span, warn};

/// How far a device exchange got.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Written and read back.
    Synced {
        /// Device clock before the write.
        before: DeviceTimestamp,
        /// Host time that was written.
        host: DeviceTimestamp,
        /// Device clock after the settle delay.
        after: DeviceTimestamp,
    },
    /// Written, but the read-back failed.
    Unverified {
        /// Device clock before the write.
        before: DeviceTimestamp,
        /// Host time that was written.
        host: DeviceTimestamp,
        /// The read-back failure.
        warning: SyncError,
    },
    /// Stopped before the write completed.
    Failed {
        /// Device clock, if it was read.
        before: Option<DeviceTimestamp>,
        /// Host time, if the write was attempted.
        host: Option<DeviceTimestamp>,
        /// What went wrong.
        error: SyncError,
    },
}

impl SyncOutcome {
    /// Check if the device accepted the new time.
    #[must_use]
    pub fn is_written(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Device clock before the write, if read.
    #[must_use]
    pub fn before(&self) -> Option<DeviceTimestamp> {
        match self {
            Self::Synced { before, .. } | Self::Unverified { before, .. } => Some(*before),
            Self::Failed { before, .. } => *before,
        }
    }

    /// Host time used for the write, if computed.
    #[must_use]
    pub fn host(&self) -> Option<DeviceTimestamp> {
        match self {
            Self::Synced { host, .. } | Self::Unverified { host, .. } => Some(*host),
            Self::Failed { host, .. } => *host,
        }
    }

    /// Device clock after the write, if read back.
    #[must_use]
    pub fn after(&self) -> Option<DeviceTimestamp> {
        match self {
            Self::Synced { after, .. } => Some(*after),
            _ => None,
        }
    }

    /// The failure or warning, if any.
    #[must_use]
    pub fn error(&self) -> Option<&SyncError> {
        match self {
            Self::Synced { .. } => None,
            Self::Unverified { warning, .. } => Some(warning),
            Self::Failed { error, .. } => Some(error),
        }
    }
}

/// Outcome for one configured target.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    /// The device.
    pub target: DeviceTarget,
    /// What happened.
    pub outcome: SyncOutcome,
}

/// Runs the clock sync exchange against devices.
#[derive(Debug, Clone)]
pub struct ClockSyncer<C: TimeSource = SystemClock> {
    registers: RegisterMap,
    settle_delay: Duration,
    clock: C,
}

impl ClockSyncer<SystemClock> {
    /// Create a syncer using the host wall clock.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: TimeSource> ClockSyncer<C> {
    /// Create a syncer reading host time from `clock`.
    pub fn with_clock(config: &SyncConfig, clock: C) -> Self {
        Self {
            registers: config.registers.clone(),
            settle_delay: config.settle_delay,
            clock,
        }
    }

    /// Register layout in use.
    #[must_use]
    pub fn registers(&self) -> &RegisterMap {
        &self.registers
    }

    /// Sync every target in order.
    ///
    /// `connect` builds a fresh transport per target; `on_report` sees each
    /// report as soon as its device is done.
    pub fn run<T, F, R>(
        &self,
        targets: &[DeviceTarget],
        mut connect: F,
        mut on_report: R,
    ) -> Vec<DeviceReport>
    where
        T: RegisterTransport,
        F: FnMut(&DeviceTarget) -> T,
        R: FnMut(&DeviceReport),
    {
        let mut reports = Vec::with_capacity(targets.len());
        for target in targets {
            let _span = info_span!("device", target = %target).entered();
            let mut transport = connect(target);
            let report = DeviceReport {
                target: target.clone(),
                outcome: self.sync_device(&mut transport),
            };
            on_report(&report);
            reports.push(report);
        }

        let written = reports.iter().filter(|r| r.outcome.is_written()).count();
        info!(devices = reports.len(), written, "Clock sync run complete");
        reports
    }

    /// Run the full exchange on one transport.
    pub fn sync_device<T: RegisterTransport + ?Sized>(&self, transport: &mut T) -> SyncOutcome {
        let mut session = match Session::open(transport) {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Connect failed");
                return SyncOutcome::Failed {
                    before: None,
                    host: None,
                    error: SyncError::ConnectFailure(e),
                };
            }
        };

        let before = match self.read_timestamp(&mut *session) {
            Ok(ts) => ts,
            Err(error) => {
                warn!(%error, "Clock read failed, skipping write");
                return SyncOutcome::Failed {
                    before: None,
                    host: None,
                    error,
                };
            }
        };

        let host = host_time_as_device_epoch(&self.clock);
        debug!(%before, %host, offset_ms = before.offset_millis(&host), "Device clock read");

        if let Err(error) = self.write_timestamp(&mut *session, host) {
            warn!(%error, "Clock write failed");
            return SyncOutcome::Failed {
                before: Some(before),
                host: Some(host),
                error,
            };
        }

        if !self.settle_delay.is_zero() {
            std::thread::sleep(self.settle_delay);
        }

        match self.read_timestamp(&mut *session) {
            Ok(after) => {
                info!(%before, %host, %after, "Device clock synchronized");
                SyncOutcome::Synced { before, host, after }
            }
            Err(error) => {
                let warning = SyncError::VerifyWarning(error.cause().clone());
                warn!(%warning, "Clock written but read-back failed");
                SyncOutcome::Unverified {
                    before,
                    host,
                    warning,
                }
            }
        }
    }

    /// Read and decode the clock snapshot.
    ///
    /// A full payload whose millisecond register is above 999 is rejected as
    /// a read failure, so no write follows it.
    fn read_timestamp<T: RegisterTransport + ?Sized>(
        &self,
        transport: &mut T,
    ) -> Result<DeviceTimestamp, SyncError> {
        let range = self.registers.read_range();
        let failure = |source| SyncError::ReadFailure { range, source };

        let registers = transport
            .read_input_registers(range.start, range.count)
            .map_err(failure)?;
        DeviceTimestamp::from_registers(&registers).map_err(failure)
    }

    /// Write the epoch pair, then the millisecond register if enabled.
    ///
    /// The two writes are separate requests; a failed millisecond write
    /// leaves the epoch already written.
    fn write_timestamp<T: RegisterTransport + ?Sized>(
        &self,
        transport: &mut T,
        host: DeviceTimestamp,
    ) -> Result<(), SyncError> {
        let range = self.registers.write_range();
        transport
            .write_multiple_registers(range.start, &host.epoch_registers())
            .map_err(|source| SyncError::WriteFailure { range, source })?;

        if self.registers.write_ms_enabled {
            let range = RegisterRange::new(self.registers.write_ms_address, 1);
            transport
                .write_multiple_registers(range.start, &[host.milliseconds])
                .map_err(|source| SyncError::WriteFailure { range, source })?;
        }
        Ok(())
    }
}
