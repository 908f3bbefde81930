//! Simulated clock device.
//!
//! Stores a device timestamp in memory and exposes it through the same
//! register layout as real hardware: the snapshot is readable from the input
//! registers and the epoch/millisecond holding registers overwrite it. Fault
//! injection hooks let tests drive every failure branch of a sync sequence.

use crate::RegisterTransport;
use rtc_common::{words_to_u32, DeviceTimestamp, RegisterMap, RtcError, RtcResult};
use tracing::{debug, trace};

/// A register write recorded by the simulated device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// Starting holding register address.
    pub address: u16,
    /// Values written.
    pub values: Vec<u16>,
}

/// In-memory device clock reachable through [`RegisterTransport`].
#[derive(Debug)]
pub struct SimulatedClockDevice {
    registers: RegisterMap,
    clock: DeviceTimestamp,
    connected: bool,
    offline: bool,
    short_reads: bool,
    fail_reads_from: Option<usize>,
    fail_write_address: Option<u16>,
    reads: usize,
    writes: Vec<RecordedWrite>,
    closes: usize,
}

impl SimulatedClockDevice {
    /// Create a device holding `clock` with the default register layout.
    pub fn new(clock: DeviceTimestamp) -> Self {
        Self::with_registers(RegisterMap::default(), clock)
    }

    /// Create a device with a custom register layout.
    pub fn with_registers(registers: RegisterMap, clock: DeviceTimestamp) -> Self {
        Self {
            registers,
            clock,
            connected: false,
            offline: false,
            short_reads: false,
            fail_reads_from: None,
            fail_write_address: None,
            reads: 0,
            writes: Vec::new(),
            closes: 0,
        }
    }

    /// Current device clock.
    pub fn clock(&self) -> DeviceTimestamp {
        self.clock
    }

    /// Refuse connections.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Answer reads with fewer registers than requested.
    pub fn set_short_reads(&mut self, short: bool) {
        self.short_reads = short;
    }

    /// Fail every read whose zero-based index is `index` or later.
    ///
    /// `0` fails all reads; `1` lets the first read through.
    pub fn fail_reads_from(&mut self, index: usize) {
        self.fail_reads_from = Some(index);
    }

    /// Reject writes starting at `address` with an exception.
    pub fn fail_writes_to(&mut self, address: u16) {
        self.fail_write_address = Some(address);
    }

    /// Writes accepted or rejected so far, in order.
    pub fn writes(&self) -> &[RecordedWrite] {
        &self.writes
    }

    /// Number of read requests received.
    pub fn read_count(&self) -> usize {
        self.reads
    }

    /// Number of times the transport was closed.
    pub fn close_count(&self) -> usize {
        self.closes
    }

    fn ensure_connected(&self) -> RtcResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(RtcError::FieldbusError("Not connected to simulated device".into()))
        }
    }

    /// Register value at `address` in the input register space.
    fn input_register(&self, address: u16) -> u16 {
        let snapshot = self.clock.to_registers();
        address
            .checked_sub(self.registers.read_address)
            .and_then(|offset| snapshot.get(usize::from(offset)).copied())
            .unwrap_or(0)
    }

    fn apply_holding(&mut self, address: u16, value: u16) {
        let epoch = self.registers.write_epoch_address;
        let [hi, lo] = self.clock.epoch_registers();
        if address == epoch {
            self.clock.epoch_seconds_2000 = words_to_u32(value, lo);
        } else if address == epoch.wrapping_add(1) {
            self.clock.epoch_seconds_2000 = words_to_u32(hi, value);
        } else if self.registers.write_ms_enabled && address == self.registers.write_ms_address {
            self.clock.milliseconds = value.min(rtc_common::MAX_MILLISECONDS);
        }
    }
}

impl RegisterTransport for SimulatedClockDevice {
    fn connect(&mut self) -> RtcResult<()> {
        if self.offline {
            return Err(RtcError::FieldbusError(
                "Connection failed: simulated device offline".into(),
            ));
        }
        self.connected = true;
        debug!("Connected to simulated clock device");
        Ok(())
    }

    fn read_input_registers(&mut self, address: u16, quantity: u16) -> RtcResult<Vec<u16>> {
        self.ensure_connected()?;
        let index = self.reads;
        self.reads += 1;

        if self.fail_reads_from.is_some_and(|from| index >= from) {
            return Err(RtcError::FieldbusError(
                "Modbus exception: Server Device Failure".into(),
            ));
        }

        let quantity = if self.short_reads {
            quantity.saturating_sub(1)
        } else {
            quantity
        };

        let values: Vec<u16> = (0..quantity)
            .map(|i| self.input_register(address.wrapping_add(i)))
            .collect();
        trace!(address, ?values, "Simulated input register read");
        Ok(values)
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> RtcResult<()> {
        self.ensure_connected()?;
        self.writes.push(RecordedWrite {
            address,
            values: values.to_vec(),
        });

        if self.fail_write_address == Some(address) {
            return Err(RtcError::FieldbusError(
                "Modbus exception: Illegal Data Address".into(),
            ));
        }

        for (offset, &value) in (0u16..).zip(values) {
            self.apply_holding(address.wrapping_add(offset), value);
        }
        trace!(address, ?values, clock = %self.clock, "Simulated holding register write");
        Ok(())
    }

    fn close(&mut self) {
        if self.connected {
            debug!("Closing simulated clock device");
        }
        self.connected = false;
        self.closes += 1;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
