//! Device cycle controller.
//!
//! Time-multiplexes one radio between the two sensor roles:
//!
//! ```text
//! Idle → Scanning(role) → Connecting → Connected(role) → Disconnecting
//!      → (advance role, pause) → Scanning(next role) → … → CycleComplete
//! ```
//!
//! The controller is a plain state machine. Commands, radio callbacks and
//! timer expiries are fed in one at a time by the runtime task, and every
//! callback re-checks `is_cycling` and the current connection identity before
//! acting, so anything arriving after a cancel or a newer connection is a no-op.

use crate::codec::TelemetryDecoder;
use crate::config::{CycleConfig, DeviceConfig};
use crate::radio::{BleRadio, ConnectionId, Peripheral, RadioEvent};
use crate::timer::{Scheduler, TimerKey, TimerToken, Timers};
use crate::{now_ms, ConnectionStatus, DeviceRole, Error, Result, SensorSample, TimestampMs};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// How long each connection is held before auto-disconnect
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HoldMode {
    /// Normal operation
    #[default]
    Short,
    /// High-rate training capture
    Long,
}

/// Parameters of one `start_cycle` call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleRequest {
    pub hold: HoldMode,
    /// Keep cycling after CycleComplete instead of going idle
    pub repeat: bool,
    /// Overrides the configured high-priority setting
    pub high_priority: Option<bool>,
}

impl CycleRequest {
    /// One full cycle in short hold mode
    pub fn single() -> Self {
        Self {
            hold: HoldMode::Short,
            repeat: false,
            high_priority: None,
        }
    }

    pub fn repeating() -> Self {
        Self {
            repeat: true,
            ..Self::single()
        }
    }

    /// One cycle in long hold mode with a high-priority connection
    pub fn training() -> Self {
        Self {
            hold: HoldMode::Long,
            repeat: false,
            high_priority: Some(true),
        }
    }
}

impl Default for CycleRequest {
    fn default() -> Self {
        Self::single()
    }
}

/// Everything the controller publishes, in the order it happened
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerEvent {
    Status(ConnectionStatus),
    Sample {
        role: DeviceRole,
        sample: SensorSample,
    },
    CycleComplete {
        cycle: u64,
    },
    /// Scanning for `role` found nothing; the cycle is over
    ScanTimedOut {
        role: DeviceRole,
        waited_ms: u64,
    },
    /// The radio refused to scan; the cycle is over
    ScanFailed {
        role: DeviceRole,
        reason: String,
    },
    /// `start_cycle` arrived while a cycle was running
    CycleRejected,
}

/// Transient controller state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CycleState {
    pub is_cycling: bool,
    pub device_index: usize,
    pub status: ConnectionStatus,
}

struct ActiveConnection {
    id: ConnectionId,
    role: DeviceRole,
    decoder: TelemetryDecoder,
}

pub struct CycleController<R: BleRadio, S: Scheduler> {
    radio: R,
    timers: Timers<S>,
    cycle: CycleConfig,
    devices: DeviceConfig,
    state: CycleState,
    request: CycleRequest,
    connection: Option<ActiveConnection>,
    next_connection: u64,
    cycles_completed: u64,
    events: broadcast::Sender<ControllerEvent>,
    status_tx: watch::Sender<ConnectionStatus>,
    clock: fn() -> TimestampMs,
}

impl<R: BleRadio, S: Scheduler> CycleController<R, S> {
    pub fn new(radio: R, scheduler: S, cycle: CycleConfig, devices: DeviceConfig) -> Self {
        let (events, _) = broadcast::channel(cycle.event_buffer.max(1));
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            radio,
            timers: Timers::new(scheduler),
            cycle,
            devices,
            state: CycleState::default(),
            request: CycleRequest::default(),
            connection: None,
            next_connection: 1,
            cycles_completed: 0,
            events,
            status_tx,
            clock: now_ms,
        }
    }

    /// Replace the clock used to stamp decoded samples
    pub fn with_clock(mut self, clock: fn() -> TimestampMs) -> Self {
        self.clock = clock;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ControllerEvent> {
        self.events.clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    pub fn armed_timer(&self, key: TimerKey) -> Option<TimerToken> {
        self.timers.armed(key)
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    fn current_role(&self) -> DeviceRole {
        DeviceRole::from_index(self.state.device_index)
    }

    fn hold_duration(&self) -> Duration {
        let ms = match self.request.hold {
            HoldMode::Short => self.cycle.short_hold_ms,
            HoldMode::Long => self.cycle.long_hold_ms,
        };
        Duration::from_millis(ms)
    }

    fn publish(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.state.status == status {
            return;
        }
        self.state.status = status;
        self.status_tx.send_replace(status);
        tracing::debug!("Connection status: {}", status);
        self.publish(ControllerEvent::Status(status));
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Start a cycle at role 0
    ///
    /// Only one cycle runs at a time; a request during a running cycle is
    /// rejected with `CycleBusy` and a `CycleRejected` event.
    pub fn start_cycle(&mut self, request: CycleRequest) -> Result<()> {
        if self.state.is_cycling {
            tracing::warn!("Cycle requested while another cycle is running");
            self.publish(ControllerEvent::CycleRejected);
            return Err(Error::CycleBusy);
        }

        self.timers.cancel_all();
        self.request = request;
        self.state.is_cycling = true;
        self.state.device_index = 0;
        tracing::info!(
            "Starting device cycle (hold {:?}, repeat {})",
            request.hold,
            request.repeat
        );
        self.begin_scan();
        Ok(())
    }

    /// Stop scanning, drop the connection, cancel every timer. Idempotent.
    pub fn cancel(&mut self) {
        let was_active = self.state.is_cycling || self.connection.is_some();

        self.timers.cancel_all();
        if matches!(self.state.status, ConnectionStatus::Scanning(_)) {
            self.radio.stop_scan();
        }
        if let Some(connection) = self.connection.take() {
            self.radio.disconnect(connection.id);
        }
        self.state.is_cycling = false;
        self.state.device_index = 0;
        self.set_status(ConnectionStatus::Disconnected);

        if was_active {
            tracing::info!("Device cycle cancelled");
        }
    }

    fn begin_scan(&mut self) {
        let role = self.current_role();
        self.set_status(ConnectionStatus::Scanning(role));

        if let Err(e) = self.radio.start_scan() {
            tracing::warn!("Failed to start scan for {}: {}", role, e);
            self.end_cycle();
            self.publish(ControllerEvent::ScanFailed {
                role,
                reason: e.to_string(),
            });
            return;
        }
        self.timers
            .arm(TimerKey::ScanTimeout, self.cycle.scan_timeout());
    }

    /// Abort the cycle without completing it
    fn end_cycle(&mut self) {
        self.timers.cancel_all();
        self.state.is_cycling = false;
        self.state.device_index = 0;
        self.set_status(ConnectionStatus::Disconnected);
    }

    // ------------------------------------------------------------------
    // Radio callbacks
    // ------------------------------------------------------------------

    pub fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::ScanResult(peripheral) => self.on_scan_result(peripheral),
            RadioEvent::Connected(id) => self.on_connected(id),
            RadioEvent::ConnectFailed(id, reason) => {
                if self.is_current(id) {
                    tracing::warn!("Connection attempt failed: {}", reason);
                }
                self.on_disconnected(id);
            }
            RadioEvent::Disconnected(id) => self.on_disconnected(id),
            RadioEvent::Notification(id, bytes) => self.on_notification(id, &bytes),
        }
    }

    fn is_current(&self, id: ConnectionId) -> bool {
        self.connection.as_ref().is_some_and(|c| c.id == id)
    }

    fn on_scan_result(&mut self, peripheral: Peripheral) {
        let role = match self.state.status {
            ConnectionStatus::Scanning(role) if self.state.is_cycling => role,
            _ => {
                tracing::debug!("Ignoring scan result outside an active scan");
                return;
            }
        };
        let matches = peripheral
            .name
            .as_deref()
            .is_some_and(|name| self.devices.matches(role, name));
        if !matches {
            return;
        }

        self.timers.cancel(TimerKey::ScanTimeout);
        self.radio.stop_scan();

        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        tracing::info!(
            "Found {} sensor {:?} ({}), connecting",
            role,
            peripheral.name.as_deref().unwrap_or_default(),
            peripheral.address
        );
        self.connection = Some(ActiveConnection {
            id,
            role,
            decoder: TelemetryDecoder::new(),
        });
        self.set_status(ConnectionStatus::Connecting(role));
        self.timers
            .arm(TimerKey::ConnectTimeout, self.cycle.connect_timeout());

        if let Err(e) = self.radio.connect(id, &peripheral) {
            tracing::warn!("Failed to connect to {} sensor: {}", role, e);
            self.on_disconnected(id);
        }
    }

    fn on_connected(&mut self, id: ConnectionId) {
        let role = match &self.connection {
            Some(c) if c.id == id && self.state.status == ConnectionStatus::Connecting(c.role) => {
                c.role
            }
            _ => {
                tracing::debug!("Ignoring connect for stale connection {:?}", id);
                return;
            }
        };
        self.timers.cancel(TimerKey::ConnectTimeout);
        self.set_status(ConnectionStatus::Connected(role));

        if self.request.high_priority.unwrap_or(self.cycle.high_priority) {
            if let Err(e) = self.radio.request_high_priority(id) {
                tracing::warn!("High-priority request refused for {}: {}", role, e);
            }
        }
        self.timers
            .arm(TimerKey::ConnectionHold, self.hold_duration());
    }

    fn on_notification(&mut self, id: ConnectionId, bytes: &[u8]) {
        let now = (self.clock)();
        let (role, samples) = match self.connection.as_mut() {
            Some(c) if c.id == id => (c.role, c.decoder.feed(bytes, now)),
            _ => {
                tracing::debug!("Ignoring notification for stale connection {:?}", id);
                return;
            }
        };

        for (sample_role, sample) in samples {
            if sample_role != role {
                tracing::warn!(
                    "Dropping {} sample received on the {} connection",
                    sample_role,
                    role
                );
                continue;
            }
            self.publish(ControllerEvent::Sample { role, sample });
        }
    }

    fn on_disconnected(&mut self, id: ConnectionId) {
        let connection = match self.connection.take() {
            Some(c) if c.id == id => c,
            other => {
                self.connection = other;
                tracing::debug!("Ignoring disconnect for stale connection {:?}", id);
                return;
            }
        };

        self.timers.cancel(TimerKey::ConnectTimeout);
        self.timers.cancel(TimerKey::ConnectionHold);
        if connection.decoder.dropped() > 0 {
            tracing::info!(
                "Dropped {} malformed telemetry records from {}",
                connection.decoder.dropped(),
                connection.role
            );
        }
        tracing::info!("Disconnected from {} sensor", connection.role);
        self.advance();
    }

    fn advance(&mut self) {
        self.state.device_index = (self.state.device_index + 1) % DeviceRole::ALL.len();
        self.set_status(ConnectionStatus::Disconnected);

        if self.state.device_index == 0 {
            self.cycles_completed += 1;
            if !self.request.repeat {
                self.state.is_cycling = false;
            }
            tracing::info!("Device cycle {} complete", self.cycles_completed);
            self.publish(ControllerEvent::CycleComplete {
                cycle: self.cycles_completed,
            });
            if !self.state.is_cycling {
                return;
            }
        }
        self.timers.arm(TimerKey::RolePause, self.cycle.role_pause());
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub fn handle_timer(&mut self, token: TimerToken) {
        if !self.timers.fire(token) {
            tracing::debug!("Ignoring stale {:?} timer", token.key);
            return;
        }
        match token.key {
            TimerKey::ScanTimeout => self.on_scan_timeout(),
            TimerKey::ConnectTimeout => self.on_connect_timeout(),
            TimerKey::ConnectionHold => self.on_hold_elapsed(),
            TimerKey::RolePause => self.on_pause_elapsed(),
        }
    }

    fn on_scan_timeout(&mut self) {
        let role = match self.state.status {
            ConnectionStatus::Scanning(role) if self.state.is_cycling => role,
            _ => return,
        };
        tracing::warn!(
            "No {} sensor found within {} ms",
            role,
            self.cycle.scan_timeout_ms
        );
        self.radio.stop_scan();
        self.end_cycle();
        self.publish(ControllerEvent::ScanTimedOut {
            role,
            waited_ms: self.cycle.scan_timeout_ms,
        });
    }

    /// Treated like a failed attempt: the role is skipped and the cycle moves on
    fn on_connect_timeout(&mut self) {
        let (id, role) = match &self.connection {
            Some(c) if self.state.status == ConnectionStatus::Connecting(c.role) => (c.id, c.role),
            _ => return,
        };
        tracing::warn!(
            "{} sensor did not connect within {} ms, giving up",
            role,
            self.cycle.connect_timeout_ms
        );
        self.radio.disconnect(id);
        self.on_disconnected(id);
    }

    fn on_hold_elapsed(&mut self) {
        let (id, role) = match &self.connection {
            Some(c) if self.state.status == ConnectionStatus::Connected(c.role) => (c.id, c.role),
            _ => return,
        };
        tracing::debug!("Connection hold elapsed for {}, disconnecting", role);
        self.set_status(ConnectionStatus::Disconnecting(role));
        self.radio.disconnect(id);
    }

    fn on_pause_elapsed(&mut self) {
        if !self.state.is_cycling || self.connection.is_some() {
            return;
        }
        self.begin_scan();
    }
}
