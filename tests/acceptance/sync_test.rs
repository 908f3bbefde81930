//! Full `ClockSyncer` runs over Modbus TCP.

use crate::mock_modbus_server::{MockBehavior, MockModbusServer};
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rtc_common::{format_iso8601_millis, DeviceTarget, DeviceTimestamp, FixedClock, SyncConfig};
use rtc_fieldbus::{ModbusTcpClient, ModbusTcpConfig};
use rtc_syncer::{ClockSyncer, SyncError, SyncOutcome};
use std::net::TcpListener;
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

/// 2024-05-01T12:00:00.123Z
fn host_clock() -> FixedClock {
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    FixedClock(start + ChronoDuration::milliseconds(123))
}

fn sync_config(write_ms: bool) -> SyncConfig {
    let mut config = SyncConfig {
        timeout: Duration::from_millis(500),
        settle_delay: Duration::from_millis(10),
        devices: Vec::new(),
        ..SyncConfig::default()
    };
    config.registers.write_ms_enabled = write_ms;
    config
}

fn target_for(server: &MockModbusServer) -> DeviceTarget {
    DeviceTarget::new(
        server.local_addr().ip().to_string(),
        server.local_addr().port(),
        1,
    )
}

/// Server whose holding registers 290..292 appear at input registers 3..5.
fn clock_device(initial: [u16; 3]) -> MockModbusServer {
    let server = MockModbusServer::start(MockBehavior::Normal).unwrap();
    server.set_input_registers(3, &initial);
    server.mirror_holding_to_input(290, 3, 3);
    server
}

fn sync_one(server: &MockModbusServer, config: &SyncConfig) -> SyncOutcome {
    let syncer = ClockSyncer::with_clock(config, host_clock());
    let mut client = ModbusTcpClient::new(ModbusTcpConfig::for_target(&target_for(server), config));
    let outcome = syncer.sync_device(&mut client);
    assert!(!rtc_fieldbus::RegisterTransport::is_connected(&client));
    outcome
}

fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

// ============================================================================
// Happy Path
// ============================================================================

#[test]
fn test_write_then_verify_bit_for_bit() {
    let server = clock_device([100, 0, 250]);

    let outcome = sync_one(&server, &sync_config(true));

    let SyncOutcome::Synced { before, host, after } = outcome else {
        panic!("expected synced outcome, got {outcome:?}");
    };
    assert_eq!(before, DeviceTimestamp::new(6_553_600, 250));
    assert_eq!(format_iso8601_millis(&before.to_utc()), "2000-03-16T20:26:40.250Z");
    assert_eq!(host, DeviceTimestamp::new(767_880_000, 123));
    assert_eq!(after, host);

    // read, write epoch, write ms, read
    let functions: Vec<u8> = server.requests().iter().map(|r| r.function).collect();
    assert_eq!(functions, vec![0x04, 0x10, 0x10, 0x04]);

    server.stop();
}

#[test]
fn test_epoch_only_write_keeps_device_ms() {
    let server = clock_device([0, 5, 640]);

    let outcome = sync_one(&server, &sync_config(false));

    assert_eq!(outcome.after(), Some(DeviceTimestamp::new(767_880_000, 640)));
    let writes = server.requests_with_function(0x10);
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].address, 290);
    assert_eq!(writes[0].quantity, 2);

    server.stop();
}

// ============================================================================
// Failure Handling
// ============================================================================

#[test]
fn test_read_exception_skips_write() {
    let server = MockModbusServer::start(MockBehavior::ExceptionOnFunction {
        function: 0x04,
        code: 0x02,
    })
    .unwrap();

    let outcome = sync_one(&server, &sync_config(false));

    let Some(SyncError::ReadFailure { source, .. }) = outcome.error() else {
        panic!("expected read failure, got {outcome:?}");
    };
    assert!(source.to_string().contains("Illegal Data Address"));
    assert!(server.requests_with_function(0x10).is_empty());

    server.stop();
}

#[test]
fn test_write_exception_reports_before_and_host() {
    let server = MockModbusServer::start(MockBehavior::ExceptionOnFunction {
        function: 0x10,
        code: 0x04,
    })
    .unwrap();
    server.set_input_registers(3, &[0, 60, 0]);

    let outcome = sync_one(&server, &sync_config(true));

    assert_eq!(outcome.before(), Some(DeviceTimestamp::new(60, 0)));
    assert!(outcome.host().is_some());
    assert!(matches!(
        outcome.error(),
        Some(SyncError::WriteFailure { range, .. }) if range.start == 290
    ));
    // No millisecond write and no read-back after the epoch write failed.
    assert_eq!(server.requests().len(), 2);

    server.stop();
}

#[test]
fn test_short_read_is_read_failure() {
    let server = MockModbusServer::start(MockBehavior::ShortRead).unwrap();

    let outcome = sync_one(&server, &sync_config(false));

    assert!(matches!(outcome.error(), Some(SyncError::ReadFailure { .. })));
    assert!(server.requests_with_function(0x10).is_empty());

    server.stop();
}

#[test]
fn test_out_of_range_milliseconds_skips_write() {
    let server = clock_device([0, 1, 1200]);

    let outcome = sync_one(&server, &sync_config(true));

    let Some(SyncError::ReadFailure { source, .. }) = outcome.error() else {
        panic!("expected read failure, got {outcome:?}");
    };
    assert!(source.to_string().contains("millisecond register out of range: 1200"));
    assert!(server.requests_with_function(0x10).is_empty());

    server.stop();
}

#[test]
fn test_connect_refused() {
    let config = sync_config(false);
    let syncer = ClockSyncer::with_clock(&config, host_clock());
    let target = DeviceTarget::new("127.0.0.1", closed_port(), 1);
    let mut client = ModbusTcpClient::new(ModbusTcpConfig::for_target(&target, &config));

    let outcome = syncer.sync_device(&mut client);

    assert!(matches!(
        outcome,
        SyncOutcome::Failed {
            before: None,
            host: None,
            error: SyncError::ConnectFailure(_)
        }
    ));
}

// ============================================================================
// Multi-Device Runs
// ============================================================================

#[test]
fn test_run_continues_after_failed_device() {
    let healthy = clock_device([0, 1, 0]);
    let broken = MockModbusServer::start(MockBehavior::Exception(0x04)).unwrap();

    let mut config = sync_config(true);
    config.devices = vec![
        DeviceTarget::new("127.0.0.1", closed_port(), 1),
        target_for(&broken),
        target_for(&healthy),
    ];
    let syncer = ClockSyncer::with_clock(&config, host_clock());

    let mut seen = 0;
    let reports = syncer.run(
        &config.devices,
        |target| ModbusTcpClient::new(ModbusTcpConfig::for_target(target, &config)),
        |_| seen += 1,
    );

    assert_eq!(seen, 3);
    assert_eq!(reports[0].outcome.error().map(SyncError::kind), Some("connect"));
    assert_eq!(reports[1].outcome.error().map(SyncError::kind), Some("read"));
    assert!(matches!(reports[2].outcome, SyncOutcome::Synced { .. }));
    assert_eq!(reports[2].target, config.devices[2]);

    broken.stop();
    healthy.stop();
}

#[test]
fn test_applied_unit_id_reaches_every_request() {
    let server = clock_device([0, 0, 0]);
    let mut config = sync_config(true);
    config.apply_unit_id = true;
    let target = DeviceTarget::new(
        server.local_addr().ip().to_string(),
        server.local_addr().port(),
        17,
    );
    let syncer = ClockSyncer::with_clock(&config, host_clock());

    let reports = syncer.run(
        std::slice::from_ref(&target),
        |target| ModbusTcpClient::new(ModbusTcpConfig::for_target(target, &config)),
        |_| {},
    );

    assert!(matches!(reports[0].outcome, SyncOutcome::Synced { .. }));
    let requests = server.requests();
    assert_eq!(requests.len(), 4);
    assert!(requests.iter().all(|r| r.unit_id == 17));

    server.stop();
}
