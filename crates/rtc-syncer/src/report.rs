//! Console rendering of sync results.
//!
//! Text output is line oriented, one block per device:
//!
//! ```text
//! === Device 192.168.7.2:502 unit=1 ===
//! [BEFORE] 2024-05-01T11:59:58.000Z  (device: 767879998s + 0ms)
//! [HOST  ] 2024-05-01T12:00:00.123Z  (host->device: 767880000s + 123ms)
//! [DELTA ] device was -2123 ms off host
//! [AFTER ] 2024-05-01T12:00:00.123Z  (device: 767880000s + 123ms)
//! ```
//!
//! JSON output prints one object per device on its own line.

use crate::{DeviceReport, SyncError, SyncOutcome};
use rtc_common::{format_iso8601_millis, DeviceTimestamp, RegisterMap};
use serde::Serialize;
use std::io::{self, Write};

/// Print the register layout in use before any device is contacted.
///
/// # Errors
///
/// Returns any error from the underlying writer.
pub fn write_banner<W: Write>(
    out: &mut W,
    registers: &RegisterMap,
    device_count: usize,
) -> io::Result<()> {
    writeln!(out, "Syncing {device_count} device(s)")?;
    writeln!(out, "Reading input regs: {}", registers.read_range())?;
    let ms = if registers.write_ms_enabled {
        format!(" (+ ms at {})", registers.write_ms_address)
    } else {
        String::new()
    };
    writeln!(out, "Writing regs:       {}{ms}", registers.write_range())
}

fn timestamp_line<W: Write>(
    out: &mut W,
    tag: &str,
    source: &str,
    ts: &DeviceTimestamp,
) -> io::Result<()> {
    writeln!(
        out,
        "[{tag}] {}  ({source}: {ts})",
        format_iso8601_millis(&ts.to_utc())
    )
}

fn failure_line<W: Write>(
    out: &mut W,
    registers: &RegisterMap,
    error: &SyncError,
) -> io::Result<()> {
    match error {
        SyncError::ConnectFailure(e) => writeln!(out, "[FAIL] connect(): {e}"),
        SyncError::ReadFailure { range, source } => {
            writeln!(out, "[FAIL] read_input_registers({range}): {source}")
        }
        SyncError::WriteFailure { range, source } => {
            let what = if range.start == registers.write_ms_address && registers.write_ms_enabled {
                "ms"
            } else {
                "epoch"
            };
            writeln!(out, "[FAIL] write_registers({range}) {what}: {source}")
        }
        SyncError::VerifyWarning(e) => writeln!(out, "[WARN] read-back after write failed: {e}"),
    }
}

/// Print one device block.
///
/// # Errors
///
/// Returns any error from the underlying writer.
pub fn write_text<W: Write>(
    out: &mut W,
    registers: &RegisterMap,
    report: &DeviceReport,
) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "=== Device {} ===", report.target)?;

    let outcome = &report.outcome;
    if let Some(before) = outcome.before() {
        timestamp_line(out, "BEFORE", "device", &before)?;
    }
    if let Some(host) = outcome.host() {
        timestamp_line(out, "HOST  ", "host->device", &host)?;
        if let Some(before) = outcome.before() {
            writeln!(out, "[DELTA ] device was {} ms off host", before.offset_millis(&host))?;
        }
    }

    match outcome {
        SyncOutcome::Synced { after, .. } => timestamp_line(out, "AFTER ", "device", after),
        SyncOutcome::Unverified { warning, .. } => failure_line(out, registers, warning),
        SyncOutcome::Failed { error, .. } => failure_line(out, registers, error),
    }
}

#[derive(Serialize)]
struct TimestampView {
    iso: String,
    epoch_seconds_2000: u32,
    milliseconds: u16,
}

impl From<DeviceTimestamp> for TimestampView {
    fn from(ts: DeviceTimestamp) -> Self {
        Self {
            iso: format_iso8601_millis(&ts.to_utc()),
            epoch_seconds_2000: ts.epoch_seconds_2000,
            milliseconds: ts.milliseconds,
        }
    }
}

#[derive(Serialize)]
struct ErrorView {
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ReportView<'a> {
    host: &'a str,
    port: u16,
    unit_id: u8,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<TimestampView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host_time: Option<TimestampView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    after: Option<TimestampView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorView>,
}

impl<'a> From<&'a DeviceReport> for ReportView<'a> {
    fn from(report: &'a DeviceReport) -> Self {
        let outcome = &report.outcome;
        let status = match outcome {
            SyncOutcome::Synced { .. } => "synced",
            SyncOutcome::Unverified { .. } => "unverified",
            SyncOutcome::Failed { .. } => "failed",
        };
        let offset_ms = outcome
            .before()
            .zip(outcome.host())
            .map(|(before, host)| before.offset_millis(&host));

        Self {
            host: &report.target.host,
            port: report.target.port,
            unit_id: report.target.unit_id,
            status,
            before: outcome.before().map(Into::into),
            host_time: outcome.host().map(Into::into),
            after: outcome.after().map(Into::into),
            offset_ms,
            error: outcome.error().map(|e| ErrorView {
                kind: e.kind(),
                message: e.to_string(),
            }),
        }
    }
}

/// Print one device report as a single-line JSON object.
///
/// # Errors
///
/// Returns any error from serialization or the underlying writer.
pub fn write_json<W: Write>(out: &mut W, report: &DeviceReport) -> io::Result<()> {
    serde_json::to_writer(&mut *out, &ReportView::from(report))?;
    writeln!(out)
}
