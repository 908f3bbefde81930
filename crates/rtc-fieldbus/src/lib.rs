//! Fieldbus plane for reaching device clocks.
//!
//! This crate provides:
//! - [`RegisterTransport`] trait abstracting register reads and writes
//! - [`Session`] guard that closes a transport on every exit path
//! - [`modbus`] module with the Modbus TCP client
//! - [`simulated`] module with an in-memory clock device

pub mod modbus;
pub mod simulated;

pub use modbus::*;
pub use simulated::*;

use rtc_common::RtcResult;
use std::ops::{Deref, DerefMut};

/// Register-level access to a field device.
///
/// Implementations are blocking; each call is bounded by the transport's
/// own timeout.
pub trait RegisterTransport {
    /// Open the connection to the device.
    fn connect(&mut self) -> RtcResult<()>;

    /// Read `quantity` input registers starting at `address`.
    fn read_input_registers(&mut self, address: u16, quantity: u16) -> RtcResult<Vec<u16>>;

    /// Write `values` to consecutive holding registers starting at `address`.
    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> RtcResult<()>;

    /// Release the connection. Calling this on a closed transport is a no-op.
    fn close(&mut self);

    /// Check if the transport currently holds a connection.
    fn is_connected(&self) -> bool;
}

impl<T: RegisterTransport + ?Sized> RegisterTransport for Box<T> {
    fn connect(&mut self) -> RtcResult<()> {
        (**self).connect()
    }

    fn read_input_registers(&mut self, address: u16, quantity: u16) -> RtcResult<Vec<u16>> {
        (**self).read_input_registers(address, quantity)
    }

    fn write_multiple_registers(&mut self, address: u16, values: &[u16]) -> RtcResult<()> {
        (**self).write_multiple_registers(address, values)
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// An open connection on a borrowed transport.
///
/// Dropping the session closes the transport, so early returns and `?`
/// inside a sync sequence still release the connection.
pub struct Session<'a, T: RegisterTransport + ?Sized> {
    transport: &'a mut T,
}

impl<'a, T: RegisterTransport + ?Sized> Session<'a, T> {
    /// Connect `transport` and wrap it in a session.
    ///
    /// The transport is closed even if connecting fails, to release any
    /// half-open socket.
    ///
    /// # Errors
    ///
    /// Returns the transport's connect error.
    pub fn open(transport: &'a mut T) -> RtcResult<Self> {
        if let Err(e) = transport.connect() {
            transport.close();
            return Err(e);
        }
        Ok(Self { transport })
    }
}

impl<T: RegisterTransport + ?Sized> Deref for Session<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.transport
    }
}

impl<T: RegisterTransport + ?Sized> DerefMut for Session<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.transport
    }
}

impl<T: RegisterTransport + ?Sized> Drop for Session<'_, T> {
    fn drop(&mut self) {
        self.transport.close();
    }
}
