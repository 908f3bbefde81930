//! Modbus TCP integration tests using `MockModbusServer`.
//!
//! These tests verify the `ModbusTcpClient` behavior against a real TCP
//! connection with a mock server providing controllable fault injection.
//!
//! # Test Categories
//!
//! - **Happy path tests**: clock snapshot reads and epoch writes
//! - **Exception tests**: Modbus exception responses surface as readable errors
//! - **Timeout/connection tests**: refused connections and slow servers
//! - **Edge cases**: protocol anomalies and unit id addressing


use mock_modbus_server::{MockBehavior, MockModbusServer};
use rtc_common::{DeviceTarget, SyncConfig};
use rtc_fieldbus::{ModbusTcpClient, ModbusTcpConfig, RegisterTransport, Session};
use std::net::TcpListener;
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

/// Create a client config pointing to the mock server.
fn config_for_server(server: &MockModbusServer) -> ModbusTcpConfig {
    ModbusTcpConfig {
        host: server.local_addr().ip().to_string(),
        port: server.local_addr().port(),
        unit_id: 1,
        connect_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_millis(500),
    }
}

fn connected_client(server: &MockModbusServer) -> ModbusTcpClient {
    let mut client = ModbusTcpClient::new(config_for_server(server));
    client.connect().unwrap();
    assert!(client.is_connected());
    client
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ============================================================================
// Happy Path Tests
// ============================================================================

#[test]
fn test_read_clock_snapshot() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    server.set_input_registers(3, &[100, 0, 250]);

    let mut client = connected_client(&server);
    let registers = client.read_input_registers(3, 3).unwrap();
    assert_eq!(registers, vec![100, 0, 250]);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].function, 0x04);
    assert_eq!(requests[0].address, 3);
    assert_eq!(requests[0].quantity, 3);

    client.close();
    server.stop();
}

#[test]
fn test_write_epoch_registers() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();

    let mut client = connected_client(&server);
    client.write_multiple_registers(290, &[0x1234, 0x5678]).unwrap();

    assert_eq!(server.get_holding_register(290), 0x1234);
    assert_eq!(server.get_holding_register(291), 0x5678);

    client.close();
    server.stop();
}

#[test]
fn test_single_register_write_uses_multiple_write_function() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();

    let mut client = connected_client(&server);
    client.write_multiple_registers(292, &[250]).unwrap();

    assert_eq!(server.get_holding_register(292), 250);
    let writes = server.requests_with_function(0x10);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].quantity, 1);

    client.close();
    server.stop();
}

#[test]
fn test_write_then_read_through_mirror() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    server.mirror_holding_to_input(290, 3, 2);
    server.set_input_registers(5, &[0]);

    let mut client = connected_client(&server);
    client.write_multiple_registers(290, &[0x0001, 0x0002]).unwrap();
    assert_eq!(client.read_input_registers(3, 3).unwrap(), vec![1, 2, 0]);

    client.close();
    server.stop();
}

#[test]
fn test_many_requests_on_one_connection() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    server.set_input_registers(3, &[1, 2, 3]);

    let mut client = connected_client(&server);
    for _ in 0..20 {
        assert_eq!(client.read_input_registers(3, 3).unwrap(), vec![1, 2, 3]);
    }
    assert_eq!(server.requests().len(), 20);

    client.close();
    server.stop();
}

// ============================================================================
// Exception Tests
// ============================================================================

#[test]
fn test_exception_illegal_address() {
    let server = MockModbusServer::start(MockBehavior::Exception(0x02)).unwrap();

    let mut client = connected_client(&server);
    let err = client.read_input_registers(3, 3).unwrap_err();
    let err_msg = err.to_string();
    assert!(
        err_msg.contains("Illegal Data Address"),
        "Expected 'Illegal Data Address' in error message, got: {err_msg}"
    );

    // An exception is a valid response; the connection stays usable.
    assert!(client.is_connected());

    client.close();
    server.stop();
}

#[test]
fn test_exception_on_write_only() {
    let server = MockModbusServer::start(MockBehavior::ExceptionOnFunction {
        function: 0x10,
        code: 0x04,
    })
    .unwrap();
    server.set_input_registers(3, &[0, 1, 2]);

    let mut client = connected_client(&server);
    assert!(client.read_input_registers(3, 3).is_ok());

    let err = client.write_multiple_registers(290, &[0, 0]).unwrap_err();
    assert!(
        err.to_string().contains("Server Device Failure"),
        "Expected 'Server Device Failure', got: {err}"
    );
    assert_eq!(server.get_holding_register(290), 0);

    client.close();
    server.stop();
}

#[test]
fn test_out_of_range_address() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();

    let mut client = connected_client(&server);
    let err = client.read_input_registers(1020, 10).unwrap_err();
    assert!(err.to_string().contains("Illegal Data Address"));

    client.close();
    server.stop();
}

// ============================================================================
// Timeout and Connection Tests
// ============================================================================

#[test]
fn test_connection_refused() {
    let mut client = ModbusTcpClient::new(ModbusTcpConfig {
        host: "127.0.0.1".into(),
        port: closed_port(),
        unit_id: 1,
        connect_timeout: Duration::from_millis(200),
        io_timeout: Duration::from_millis(200),
    });

    let err = client.connect().unwrap_err();
    assert!(
        err.to_string().contains("Connection failed"),
        "Expected connection error, got: {err}"
    );
    assert!(!client.is_connected());
}

#[test]
fn test_read_timeout_drops_connection() {
    let server = MockModbusServer::start(MockBehavior::DelayMs(1000)).unwrap();

    let mut config = config_for_server(&server);
    config.io_timeout = Duration::from_millis(100);
    let mut client = ModbusTcpClient::new(config);
    client.connect().unwrap();

    assert!(client.read_input_registers(3, 3).is_err());
    assert!(
        !client.is_connected(),
        "Client should drop the connection after a timeout"
    );

    server.stop();
}

#[test]
fn test_dropped_connection() {
    let server = MockModbusServer::start(MockBehavior::DropConnection).unwrap();

    let mut client = connected_client(&server);
    let err = client.read_input_registers(3, 3).unwrap_err();
    assert!(err.to_string().contains("Receive header failed"));
    assert!(!client.is_connected());

    server.stop();
}

#[test]
fn test_session_releases_socket() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    let mut client = ModbusTcpClient::new(config_for_server(&server));

    {
        let mut session = Session::open(&mut client).unwrap();
        session.read_input_registers(3, 3).unwrap();
    }
    assert!(!client.is_connected());

    server.stop();
}

// ============================================================================
// Edge Case Tests
// ============================================================================

#[test]
fn test_wrong_transaction_id_response() {
    let server = MockModbusServer::start(MockBehavior::WrongTransactionId).unwrap();

    let mut client = connected_client(&server);
    let err = client.read_input_registers(3, 3).unwrap_err();
    assert!(err.to_string().contains("Transaction ID mismatch"));

    client.close();
    server.stop();
}

#[test]
fn test_wrong_unit_id_response() {
    let server = MockModbusServer::start(MockBehavior::WrongUnitId).unwrap();

    let mut client = connected_client(&server);
    let err = client.read_input_registers(3, 3).unwrap_err();
    assert!(err.to_string().contains("Unit ID mismatch"));

    client.close();
    server.stop();
}

#[test]
fn test_short_read_response() {
    let server = MockModbusServer::start(MockBehavior::ShortRead).unwrap();

    let mut client = connected_client(&server);
    let err = client.read_input_registers(3, 3).unwrap_err();
    assert!(
        err.to_string().contains("Expected 6 bytes, got 4"),
        "Expected byte count error, got: {err}"
    );

    client.close();
    server.stop();
}

#[test]
fn test_default_unit_id_on_wire() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    let target = DeviceTarget::new(
        server.local_addr().ip().to_string(),
        server.local_addr().port(),
        9,
    );

    let mut client =
        ModbusTcpClient::new(ModbusTcpConfig::for_target(&target, &SyncConfig::default()));
    client.connect().unwrap();
    client.read_input_registers(3, 3).unwrap();

    assert_eq!(server.requests()[0].unit_id, 1);

    client.close();
    server.stop();
}

#[test]
fn test_applied_unit_id_on_wire() {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    let target = DeviceTarget::new(
        server.local_addr().ip().to_string(),
        server.local_addr().port(),
        9,
    );
    let sync = SyncConfig {
        apply_unit_id: true,
        ..SyncConfig::default()
    };

    let mut client = ModbusTcpClient::new(ModbusTcpConfig::for_target(&target, &sync));
    client.connect().unwrap();
    client.read_input_registers(3, 3).unwrap();

    assert_eq!(server.requests()[0].unit_id, 9);

    client.close();
    server.stop();
}
