//! Modbus TCP client.
//!
//! Blocking client covering the two requests a clock sync needs:
//! - Read Input Registers (Function 0x04)
//! - Write Multiple Registers (Function 0x10)
//!
//! Single-register writes also go out as Function 0x10, matching what common
//! Modbus client libraries send and what clock devices expect.

use crate::RegisterTransport;
use rtc_common::error::{RtcError, RtcResult};
use rtc_common::{DeviceTarget, SyncConfig, DEFAULT_UNIT_ID};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Largest register count a single read may request.
pub const MAX_READ_REGISTERS: u16 = 125;

/// Largest register count a single write may carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Modbus function codes used by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Input Registers (0x04).
    ReadInputRegisters = 0x04,
    /// Write Multiple Registers (0x10).
    WriteMultipleRegisters = 0x10,
}

/// Modbus exception codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    /// Illegal function code.
    IllegalFunction = 0x01,
    /// Illegal data address.
    IllegalDataAddress = 0x02,
    /// Illegal data value.
    IllegalDataValue = 0x03,
    /// Server device failure.
    ServerDeviceFailure = 0x04,
    /// Acknowledge (request accepted, processing).
    Acknowledge = 0x05,
    /// Server device busy.
    ServerDeviceBusy = 0x06,
    /// Gateway path unavailable.
    GatewayPathUnavailable = 0x0A,
    /// Gateway target device failed to respond.
    GatewayTargetFailed = 0x0B,
}

impl ExceptionCode {
    /// Parse an exception code from a byte value.
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::IllegalFunction),
            0x02 => Some(Self::IllegalDataAddress),
            0x03 => Some(Self::IllegalDataValue),
            0x04 => Some(Self::ServerDeviceFailure),
            0x05 => Some(Self::Acknowledge),
            0x06 => Some(Self::ServerDeviceBusy),
            0x0A => Some(Self::GatewayPathUnavailable),
            0x0B => Some(Self::GatewayTargetFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IllegalFunction => write!(f, "Illegal Function"),
            Self::IllegalDataAddress => write!(f, "Illegal Data Address"),
            Self::IllegalDataValue => write!(f, "Illegal Data Value"),
            Self::ServerDeviceFailure => write!(f, "Server Device Failure"),
            Self::Acknowledge => write!(f, "Acknowledge"),
            Self::ServerDeviceBusy => write!(f, "Server Device Busy"),
            Self::GatewayPathUnavailable => write!(f, "Gateway Path Unavailable"),
            Self::GatewayTargetFailed => write!(f, "Gateway Target Failed"),
        }
    }
}

/// Modbus TCP Application Protocol (MBAP) header.
#[derive(Debug, Clone, Copy)]
struct MbapHeader {
    /// Transaction identifier (echoed by server).
    transaction_id: u16,
    /// Protocol identifier (0 for Modbus).
    protocol_id: u16,
    /// Length of remaining data (unit ID + PDU).
    length: u16,
    /// Unit identifier (slave address).
    unit_id: u8,
}

impl MbapHeader {
    /// MBAP header size in bytes.
    const SIZE: usize = 7;

    fn new(transaction_id: u16, pdu_length: u16, unit_id: u8) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: pdu_length + 1, // +1 for unit_id
            unit_id,
        }
    }

    fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.length.to_be_bytes());
        bytes[6] = self.unit_id;
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> RtcResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(RtcError::FieldbusError(format!(
                "MBAP header too short: {} bytes",
                bytes.len()
            )));
        }

        Ok(Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        })
    }
}

/// Build a Read Input Registers request PDU.
fn read_registers_pdu(address: u16, quantity: u16) -> [u8; 5] {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let [qty_hi, qty_lo] = quantity.to_be_bytes();
    [
        FunctionCode::ReadInputRegisters as u8,
        addr_hi,
        addr_lo,
        qty_hi,
        qty_lo,
    ]
}

/// Build a Write Multiple Registers request PDU.
fn write_registers_pdu(address: u16, values: &[u16]) -> Vec<u8> {
    let byte_count = values.len() * 2;
    let mut pdu = Vec::with_capacity(6 + byte_count);
    pdu.push(FunctionCode::WriteMultipleRegisters as u8);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(values.len() as u16).to_be_bytes());
    pdu.push(byte_count as u8);
    for &value in values {
        pdu.extend_from_slice(&value.to_be_bytes());
    }
    pdu
}

/// Fail if the response PDU carries the exception bit.
fn check_exception(pdu: &[u8]) -> RtcResult<()> {
    if let Some(&function) = pdu.first() {
        if function & 0x80 != 0 {
            let exception = match pdu.get(1) {
                Some(&code) => ExceptionCode::from_byte(code)
                    .map_or_else(|| format!("Unknown (0x{code:02X})"), |e| e.to_string()),
                None => "Unknown".into(),
            };
            return Err(RtcError::FieldbusError(format!(
                "Modbus exception: {exception}"
            )));
        }
    }
    Ok(())
}

fn check_function(response: &[u8], function: FunctionCode) -> RtcResult<()> {
    let response_function = response[0];
    if response_function != function as u8 {
        return Err(RtcError::FieldbusError(format!(
            "Function code mismatch: expected 0x{:02X}, got 0x{:02X}",
            function as u8, response_function
        )));
    }
    Ok(())
}

/// Decode a Read Input Registers response PDU.
fn parse_read_response(response: &[u8], quantity: u16) -> RtcResult<Vec<u16>> {
    if response.len() < 2 {
        return Err(RtcError::FieldbusError("Response too short".into()));
    }
    check_function(response, FunctionCode::ReadInputRegisters)?;

    let byte_count = response[1] as usize;
    let expected_bytes = quantity as usize * 2;
    if byte_count != expected_bytes {
        return Err(RtcError::FieldbusError(format!(
            "Expected {expected_bytes} bytes, got {byte_count}"
        )));
    }

    let data = response.get(2..2 + byte_count).ok_or_else(|| {
        RtcError::FieldbusError(format!(
            "Response too short: expected {} bytes",
            2 + byte_count
        ))
    })?;

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Validate a Write Multiple Registers response PDU (address and quantity echo).
fn check_write_response(response: &[u8], address: u16, quantity: u16) -> RtcResult<()> {
    if response.len() < 5 {
        return Err(RtcError::FieldbusError("Response too short".into()));
    }
    check_function(response, FunctionCode::WriteMultipleRegisters)?;

    let resp_address = u16::from_be_bytes([response[1], response[2]]);
    let resp_quantity = u16::from_be_bytes([response[3], response[4]]);

    if resp_address != address || resp_quantity != quantity {
        return Err(RtcError::FieldbusError(format!(
            "Write registers response mismatch: addr={resp_address}/{address}, qty={resp_quantity}/{quantity}"
        )));
    }
    Ok(())
}

/// Configuration for the Modbus TCP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusTcpConfig {
    /// Server host name or IP address.
    pub host: String,
    /// Server TCP port.
    pub port: u16,
    /// Unit ID placed in every request header.
    pub unit_id: u8,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read/write timeout.
    pub io_timeout: Duration,
}

impl Default for ModbusTcpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 502,
            unit_id: DEFAULT_UNIT_ID,
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
        }
    }
}

impl ModbusTcpConfig {
    /// Client settings for one sync target.
    ///
    /// The target's unit id reaches the wire only when
    /// [`SyncConfig::apply_unit_id`] is set; otherwise requests use the
    /// default unit.
    pub fn for_target(target: &DeviceTarget, config: &SyncConfig) -> Self {
        let unit_id = if config.apply_unit_id {
            target.unit_id
        } else {
            if target.unit_id != DEFAULT_UNIT_ID {
                debug!(
                    configured = target.unit_id,
                    used = DEFAULT_UNIT_ID,
                    "Target unit id not applied to requests"
                );
            }
            DEFAULT_UNIT_ID
        };

        Self {
            host: target.host.clone(),
            port: target.port,
            unit_id,
            connect_timeout: config.timeout,
            io_timeout: config.timeout,
        }
    }
}

/// Blocking Modbus TCP client.
pub struct ModbusTcpClient {
    /// Configuration.
    config: ModbusTcpConfig,
    /// TCP connection (None if disconnected).
    connection: Option<TcpStream>,
    /// Transaction ID counter.
    transaction_id: u16,
    /// Receive buffer.
    rx_buffer: Vec<u8>,
}

impl ModbusTcpClient {
    /// Create a new client. No connection is made until [`RegisterTransport::connect`].
    pub fn new(config: ModbusTcpConfig) -> Self {
        Self {
            config,
            connection: None,
            transaction_id: 0,
            rx_buffer: vec![0u8; 260], // Max Modbus TCP frame size
        }
    }

    /// Client configuration.
    pub fn config(&self) -> &ModbusTcpConfig {
        &self.config
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }

    fn resolve(&self) -> RtcResult<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|e| {
                RtcError::FieldbusError(format!(
                    "Connection failed: cannot resolve {}: {e}",
                    self.config.host
                ))
            })?
            .collect();

        if addrs.is_empty() {
            return Err(RtcError::FieldbusError(format!(
                "Connection failed: no addresses for {}",
                self.config.host
            )));
        }
        Ok(addrs)
    }

    fn open_stream(&self, addr: &SocketAddr) -> RtcResult<TcpStream> {
        let stream = TcpStream::connect_timeout(addr, self.config.connect_timeout)
            .map_err(|e| RtcError::FieldbusError(format!("Connection failed: {e}")))?;

        stream
            .set_read_timeout(Some(self.config.io_timeout))
            .map_err(|e| RtcError::FieldbusError(format!("Failed to set read timeout: {e}")))?;

        stream
            .set_write_timeout(Some(self.config.io_timeout))
            .map_err(|e| RtcError::FieldbusError(format!("Failed to set write timeout: {e}")))?;

        stream
            .set_nodelay(true)
            .map_err(|e| RtcError::FieldbusError(format!("Failed to set TCP_NODELAY: {e}")))?;

        Ok(stream)
    }

    /// Drop the connection after an I/O failure and build the error.
    fn io_failure(&mut self, what: &str, e: &std::io::Error) -> RtcError {
        self.connection = None;
        RtcError::FieldbusError(format!("{what} failed: {e}"))
    }

    /// Send a Modbus request and receive the response PDU.
    fn send_request(&mut self, pdu: &[u8]) -> RtcResult<Vec<u8>> {
        if self.connection.is_none() {
            return Err(RtcError::FieldbusError(
                "Not connected to Modbus server".into(),
            ));
        }

        let transaction_id = self.next_transaction_id();
        let header = MbapHeader::new(transaction_id, pdu.len() as u16, self.config.unit_id);

        let mut request = Vec::with_capacity(MbapHeader::SIZE + pdu.len());
        request.extend_from_slice(&header.to_bytes());
        request.extend_from_slice(pdu);

        trace!(transaction_id, pdu_len = pdu.len(), "Sending Modbus request");

        let write_result = match self.connection.as_mut() {
            Some(stream) => stream.write_all(&request),
            None => return Err(RtcError::FieldbusError("Connection lost during send".into())),
        };
        if let Err(e) = write_result {
            return Err(self.io_failure("Send", &e));
        }

        let read_result = match self.connection.as_mut() {
            Some(stream) => stream.read_exact(&mut self.rx_buffer[..MbapHeader::SIZE]),
            None => {
                return Err(RtcError::FieldbusError(
                    "Connection lost during receive".into(),
                ))
            }
        };
        if let Err(e) = read_result {
            return Err(self.io_failure("Receive header", &e));
        }

        let response_header = MbapHeader::from_bytes(&self.rx_buffer[..MbapHeader::SIZE])?;

        if response_header.transaction_id != transaction_id {
            return Err(RtcError::FieldbusError(format!(
                "Transaction ID mismatch: expected {}, got {}",
                transaction_id, response_header.transaction_id
            )));
        }

        if response_header.protocol_id != 0 {
            return Err(RtcError::FieldbusError(format!(
                "Invalid protocol ID: {}",
                response_header.protocol_id
            )));
        }

        if response_header.unit_id != self.config.unit_id {
            return Err(RtcError::FieldbusError(format!(
                "Unit ID mismatch: expected {}, got {}",
                self.config.unit_id, response_header.unit_id
            )));
        }

        let pdu_length = (response_header.length as usize).saturating_sub(1); // -1 for unit_id
        if pdu_length == 0 || pdu_length > self.rx_buffer.len() - MbapHeader::SIZE {
            return Err(RtcError::FieldbusError(format!(
                "Invalid response length: {pdu_length} bytes"
            )));
        }

        let frame_end = MbapHeader::SIZE + pdu_length;
        let read_result = match self.connection.as_mut() {
            Some(stream) => stream.read_exact(&mut self.rx_buffer[MbapHeader::SIZE..frame_end]),
            None => {
                return Err(RtcError::FieldbusError(
                    "Connection lost during receive".into(),
                ))
            }
        };
        if let Err(e) = read_result {
            return Err(self.io_failure("Receive PDU", &e));
        }

        let response = &self.rx_buffer[MbapHeader::SIZE..frame_end];
        check_exception(response)?;

        trace!(transaction_id, pdu_len = pdu_length, "Received Modbus response");

        Ok(response.to_vec())
    }
}

impl RegisterTransport for ModbusTcpClient {
    fn connect(&mut self) -> RtcResult<()> {
        info!(
            host = %self.config.host,
            port = self.config.port,
            unit_id = self.config.unit_id,
            "Connecting to Modbus TCP server"
        );

        let mut last_error = None;
        for addr in self.resolve()? {
            match self.open_stream(&addr) {
                Ok(stream) => {
                    self.connection = Some(stream);
                    info!(%addr, "Connected to Modbus TCP server");
                    return Ok(());
                }
                Err(e) => {
                    warn!(%addr, error = %e, "Modbus TCP connect attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| RtcError::FieldbusError("Connection failed".into())))
    }

    fn read_input_registers(&mut self, address: u16, quantity: u16) -> RtcResult<Vec<u16>> {
        if quantity == 0 || quantity > MAX_READ_REGISTERS {
            return Err(RtcError::FieldbusError(format!(
                "Invalid register count: {quantity}"
            )));
        }

        let response = self.send_request(&read_registers_pdu(address, quantity))?;
        let registers = parse_read_response(&response, quantity)?;
        debug!(address, ?registers, "Read input registers");
        Ok(registers)
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> RtcResult<()> {
        let quantity = u16::try_from(values.len()).unwrap_or(u16::MAX);
        if quantity == 0 || quantity > MAX_WRITE_REGISTERS {
            return Err(RtcError::FieldbusError(format!(
                "Invalid register count: {}",
                values.len()
            )));
        }

        let response = self.send_request(&write_registers_pdu(address, values))?;
        check_write_response(&response, address, quantity)?;
        debug!(address, ?values, "Wrote holding registers");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.connection.take() {
            info!(
                host = %self.config.host,
                port = self.config.port,
                "Closing Modbus TCP connection"
            );
            drop(stream);
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }
}
