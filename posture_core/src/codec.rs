//! Telemetry codec for the sensor wire protocol.
//!
//! Peripherals send ASCII records `<ID>|<TYPE> <x>,<y>,<z>` terminated by a
//! newline, fragmented arbitrarily across BLE notifications. `ID` is `UB` or
//! `LB`, `TYPE` is `A` (accelerometer) or `G` (gyroscope). An `A` record
//! followed immediately by a `G` record from the same device makes one sample.

use crate::{DeviceRole, Error, Result, SensorSample, TimestampMs};

/// Which sensor a record came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadingKind {
    Accel,
    Gyro,
}

/// One parsed wire record
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TelemetryRecord {
    pub role: DeviceRole,
    pub kind: ReadingKind,
    pub values: [f64; 3],
}

/// Parse a single trimmed record
pub fn parse_record(line: &str) -> Result<TelemetryRecord> {
    let malformed = |reason: &str| Error::MalformedTelemetryRecord(format!("{:?}: {}", line, reason));

    let (id, rest) = line.split_once('|').ok_or_else(|| malformed("missing '|'"))?;
    let role = DeviceRole::from_wire_id(id.trim()).ok_or_else(|| malformed("unknown device id"))?;

    let (kind, payload) = rest
        .trim_start()
        .split_once(' ')
        .ok_or_else(|| malformed("missing reading type"))?;
    let kind = match kind {
        "A" => ReadingKind::Accel,
        "G" => ReadingKind::Gyro,
        _ => return Err(malformed("unknown reading type")),
    };

    let mut values = [0.0; 3];
    let mut fields = payload.split(',');
    for slot in values.iter_mut() {
        let field = fields.next().ok_or_else(|| malformed("expected 3 values"))?;
        let value: f64 = field
            .trim()
            .parse()
            .map_err(|_| malformed("non-numeric value"))?;
        if !value.is_finite() {
            return Err(malformed("non-finite value"));
        }
        *slot = value;
    }
    if fields.next().is_some() {
        return Err(malformed("expected 3 values"));
    }

    Ok(TelemetryRecord { role, kind, values })
}

/// Reassembles newline-terminated records from notification chunks
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    /// Append a chunk and return every record it completed, trimmed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Bytes waiting for their newline
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Pairs accelerometer and gyroscope records into samples
#[derive(Debug, Default)]
pub struct SamplePairer {
    pending: Option<(DeviceRole, [f64; 3])>,
}

impl SamplePairer {
    /// Feed one record. An `Err` means a half reading was discarded; the
    /// stream itself is unaffected.
    pub fn push(
        &mut self,
        record: TelemetryRecord,
        timestamp: TimestampMs,
    ) -> Result<Option<(DeviceRole, SensorSample)>> {
        match record.kind {
            ReadingKind::Accel => match self.pending.replace((record.role, record.values)) {
                Some((role, _)) => Err(Error::MalformedTelemetryRecord(format!(
                    "accelerometer reading from {} was not followed by a gyroscope reading",
                    role
                ))),
                None => Ok(None),
            },
            ReadingKind::Gyro => match self.pending.take() {
                Some((role, accel)) if role == record.role => {
                    Ok(Some((role, SensorSample::new(accel, record.values, timestamp))))
                }
                Some((role, _)) => Err(Error::MalformedTelemetryRecord(format!(
                    "gyroscope reading from {} does not match pending {} accelerometer reading",
                    record.role, role
                ))),
                None => Err(Error::MalformedTelemetryRecord(format!(
                    "gyroscope reading from {} without an accelerometer reading",
                    record.role
                ))),
            },
        }
    }

    pub fn discard_pending(&mut self) {
        self.pending = None;
    }
}

/// Byte stream to samples, one instance per connection
#[derive(Debug, Default)]
pub struct TelemetryDecoder {
    lines: LineAssembler,
    pairer: SamplePairer,
    dropped: u64,
}

impl TelemetryDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one notification chunk; `timestamp` stamps completed samples
    pub fn feed(&mut self, chunk: &[u8], timestamp: TimestampMs) -> Vec<(DeviceRole, SensorSample)> {
        let mut samples = Vec::new();
        for line in self.lines.push(chunk) {
            let record = match parse_record(&line) {
                Ok(record) => record,
                Err(e) => {
                    self.pairer.discard_pending();
                    self.dropped += 1;
                    tracing::warn!("Dropping telemetry: {}", e);
                    continue;
                }
            };
            match self.pairer.push(record, timestamp) {
                Ok(Some(sample)) => samples.push(sample),
                Ok(None) => {}
                Err(e) => {
                    self.dropped += 1;
                    tracing::warn!("Dropping telemetry: {}", e);
                }
            }
        }
        samples
    }

    /// Records or half readings discarded so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
