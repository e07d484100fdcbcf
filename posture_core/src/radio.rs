//! BLE radio abstraction.
//!
//! The controller drives the radio through [`BleRadio`]; everything the radio
//! reports back (scan results, connection changes, notifications) arrives as a
//! [`RadioEvent`] through the [`RadioEventSink`] handed to the radio when the
//! controller is spawned.

use crate::config::DeviceConfig;
use crate::runtime::ControllerInput;
use crate::{DeviceRole, Error, Result};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Bytes per notification the replay radio emits (default ATT MTU payload)
pub const NOTIFY_MTU: usize = 20;

/// Controller-assigned identity of one connection attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// A device seen while scanning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Peripheral {
    pub name: Option<String>,
    pub address: String,
}

/// Callbacks from the radio
#[derive(Clone, Debug, PartialEq)]
pub enum RadioEvent {
    ScanResult(Peripheral),
    Connected(ConnectionId),
    ConnectFailed(ConnectionId, String),
    Disconnected(ConnectionId),
    Notification(ConnectionId, Vec<u8>),
}

/// Scan/connect/notify primitives of the radio
pub trait BleRadio: Send {
    fn start_scan(&mut self) -> Result<()>;

    fn stop_scan(&mut self);

    /// Begin connecting; completion is reported as `Connected` or `ConnectFailed`
    fn connect(&mut self, id: ConnectionId, peripheral: &Peripheral) -> Result<()>;

    /// Ask for a high-priority (short interval) connection
    fn request_high_priority(&mut self, id: ConnectionId) -> Result<()>;

    /// Begin disconnecting; completion is reported as `Disconnected`
    fn disconnect(&mut self, id: ConnectionId);
}

/// Delivers radio callbacks into the controller mailbox
#[derive(Clone, Debug)]
pub struct RadioEventSink {
    tx: mpsc::UnboundedSender<ControllerInput>,
}

impl RadioEventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControllerInput>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: RadioEvent) {
        if self.tx.send(ControllerInput::Radio(event)).is_err() {
            tracing::debug!("Controller gone, dropping radio event");
        }
    }
}

/// Radio that replays recorded telemetry
///
/// Advertises one peripheral per role that has a recording and streams that
/// recording in MTU-sized notifications right after each connection.
pub struct ReplayRadio {
    sink: RadioEventSink,
    devices: DeviceConfig,
    recordings: HashMap<DeviceRole, Vec<u8>>,
    connections: HashMap<ConnectionId, DeviceRole>,
    scanning: bool,
}

impl ReplayRadio {
    pub fn new(sink: RadioEventSink, devices: DeviceConfig) -> Self {
        Self {
            sink,
            devices,
            recordings: HashMap::new(),
            connections: HashMap::new(),
            scanning: false,
        }
    }

    /// Build from a mixed log of wire records; lines are routed by device id
    pub fn from_log(sink: RadioEventSink, devices: DeviceConfig, log: &str) -> Self {
        let mut radio = Self::new(sink, devices);
        for line in log.lines() {
            let line = line.trim();
            let role = line
                .split_once('|')
                .and_then(|(id, _)| DeviceRole::from_wire_id(id.trim()));
            match role {
                Some(role) => {
                    let recording = radio.recordings.entry(role).or_default();
                    recording.extend_from_slice(line.as_bytes());
                    recording.push(b'\n');
                }
                None if line.is_empty() || line.starts_with('#') => {}
                None => tracing::warn!("Skipping replay line without device id: {:?}", line),
            }
        }
        radio
    }

    pub fn with_recording(mut self, role: DeviceRole, bytes: impl Into<Vec<u8>>) -> Self {
        self.recordings.insert(role, bytes.into());
        self
    }

    fn advertised_name(&self, role: DeviceRole) -> String {
        format!("{}-replay", self.devices.name_for(role))
    }
}

impl BleRadio for ReplayRadio {
    fn start_scan(&mut self) -> Result<()> {
        self.scanning = true;
        for role in DeviceRole::ALL {
            if self.recordings.contains_key(&role) {
                self.sink.emit(RadioEvent::ScanResult(Peripheral {
                    name: Some(self.advertised_name(role)),
                    address: format!("replay:{}", role.wire_id()),
                }));
            }
        }
        Ok(())
    }

    fn stop_scan(&mut self) {
        self.scanning = false;
    }

    fn connect(&mut self, id: ConnectionId, peripheral: &Peripheral) -> Result<()> {
        let name = peripheral.name.as_deref().unwrap_or_default();
        let role = DeviceRole::ALL
            .into_iter()
            .find(|role| self.devices.matches(*role, name))
            .ok_or_else(|| Error::Radio(format!("unknown peripheral {}", peripheral.address)))?;

        self.connections.insert(id, role);
        self.sink.emit(RadioEvent::Connected(id));
        if let Some(recording) = self.recordings.get(&role) {
            for chunk in recording.chunks(NOTIFY_MTU) {
                self.sink.emit(RadioEvent::Notification(id, chunk.to_vec()));
            }
        }
        Ok(())
    }

    fn request_high_priority(&mut self, id: ConnectionId) -> Result<()> {
        if self.connections.contains_key(&id) {
            Ok(())
        } else {
            Err(Error::Radio(format!("no connection {:?}", id)))
        }
    }

    fn disconnect(&mut self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            self.sink.emit(RadioEvent::Disconnected(id));
        }
    }
}
