//! Async runtime for the cycle controller.
//!
//! One task owns the [`CycleController`] and drains a single mailbox of
//! commands, radio callbacks and timer expiries, so every state mutation is
//! serialized. Callers talk to it through a cloneable [`CycleHandle`].

use crate::config::{CycleConfig, DeviceConfig};
use crate::cycle::{ControllerEvent, CycleController, CycleRequest};
use crate::radio::{BleRadio, RadioEvent, RadioEventSink};
use crate::timer::{Scheduler, TimerToken};
use crate::{ConnectionStatus, Error, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Requests from callers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    StartCycle(CycleRequest),
    Cancel,
    /// Cancel and stop the controller task
    Shutdown,
}

/// Everything the controller task consumes
#[derive(Debug)]
pub enum ControllerInput {
    Command(Command),
    Radio(RadioEvent),
    Timer(TimerToken),
}

/// Timers backed by `tokio::time::sleep`, delivered back through the mailbox
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<ControllerInput>,
    tasks: HashMap<TimerToken, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::UnboundedSender<ControllerInput>) -> Self {
        Self {
            tx,
            tasks: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, token: TimerToken, delay: Duration) {
        self.tasks.retain(|_, task| !task.is_finished());
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(ControllerInput::Timer(token));
        });
        self.tasks.insert(token, task);
    }

    fn cancel(&mut self, token: TimerToken) {
        if let Some(task) = self.tasks.remove(&token) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

/// What calibration, monitoring and training need from a controller
pub trait CycleDriver {
    /// Subscribe before starting a cycle so no event is missed
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent>;

    fn start_cycle(&self, request: CycleRequest) -> Result<()>;

    fn cancel(&self);
}

/// Handle to a running controller task
#[derive(Clone)]
pub struct CycleHandle {
    tx: mpsc::UnboundedSender<ControllerInput>,
    events: broadcast::Sender<ControllerEvent>,
    status: watch::Receiver<ConnectionStatus>,
}

impl CycleHandle {
    /// Latest published connection status
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Cancel any cycle and stop the controller task
    pub fn shutdown(&self) {
        let _ = self.tx.send(ControllerInput::Command(Command::Shutdown));
    }

    fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(ControllerInput::Command(command))
            .map_err(|_| Error::ControllerClosed)
    }
}

impl CycleDriver for CycleHandle {
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    fn start_cycle(&self, request: CycleRequest) -> Result<()> {
        self.send(Command::StartCycle(request))
    }

    fn cancel(&self) {
        if self.send(Command::Cancel).is_err() {
            tracing::debug!("Cancel sent to a stopped controller");
        }
    }
}

/// Spawn the controller task on the current tokio runtime
///
/// `make_radio` receives the sink the radio must report its callbacks to.
pub fn spawn_controller<R, F>(
    cycle: CycleConfig,
    devices: DeviceConfig,
    make_radio: F,
) -> (CycleHandle, JoinHandle<()>)
where
    R: BleRadio + 'static,
    F: FnOnce(RadioEventSink) -> R,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let radio = make_radio(RadioEventSink::new(tx.clone()));
    let mut controller = CycleController::new(radio, TokioScheduler::new(tx.clone()), cycle, devices);

    let handle = CycleHandle {
        tx,
        events: controller.event_sender(),
        status: controller.status_receiver(),
    };

    let task = tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            match input {
                ControllerInput::Command(Command::StartCycle(request)) => {
                    // Rejections are already published as CycleRejected
                    let _ = controller.start_cycle(request);
                }
                ControllerInput::Command(Command::Cancel) => controller.cancel(),
                ControllerInput::Command(Command::Shutdown) => {
                    controller.cancel();
                    break;
                }
                ControllerInput::Radio(event) => controller.handle_radio_event(event),
                ControllerInput::Timer(token) => controller.handle_timer(token),
            }
        }
        tracing::debug!(
            "Cycle controller stopped after {} cycles",
            controller.cycles_completed()
        );
    });

    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::ReplayRadio;
    use crate::DeviceRole;

    const LOG: &str = "UB|A 0,0,1\nUB|G 0,0,0\nUB|A 0.1,0,1\nUB|G 0,0,0\nLB|A 0,0,1\nLB|G 0,0,0\n";

    fn fast_cycle() -> CycleConfig {
        CycleConfig {
            scan_timeout_ms: 1_000,
            short_hold_ms: 200,
            long_hold_ms: 400,
            role_pause_ms: 50,
            ..CycleConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_cycle_end_to_end() {
        crate::logging::init_test();
        let devices = DeviceConfig::default();
        let (handle, task) = spawn_controller(fast_cycle(), devices.clone(), |sink| {
            ReplayRadio::from_log(sink, devices, LOG)
        });
        let mut events = handle.subscribe();
        handle.start_cycle(CycleRequest::single()).unwrap();

        let mut samples = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                ControllerEvent::Sample { role, .. } => samples.push(role),
                ControllerEvent::CycleComplete { cycle } => {
                    assert_eq!(cycle, 1);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(
            samples,
            vec![DeviceRole::UpperBack, DeviceRole::UpperBack, DeviceRole::LowerBack]
        );
        assert_eq!(handle.status(), ConnectionStatus::Disconnected);

        handle.shutdown();
        task.await.unwrap();
        assert!(matches!(
            handle.start_cycle(CycleRequest::single()),
            Err(Error::ControllerClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_peripheral_times_out() {
        let devices = DeviceConfig::default();
        let (handle, _task) = spawn_controller(fast_cycle(), devices.clone(), |sink| {
            ReplayRadio::new(sink, devices)
        });
        let mut events = handle.subscribe();
        handle.start_cycle(CycleRequest::single()).unwrap();

        loop {
            if let ControllerEvent::ScanTimedOut { role, waited_ms } = events.recv().await.unwrap() {
                assert_eq!(role, DeviceRole::UpperBack);
                assert_eq!(waited_ms, 1_000);
                break;
            }
        }
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_through_handle() {
        let devices = DeviceConfig::default();
        let (handle, _task) = spawn_controller(fast_cycle(), devices.clone(), |sink| {
            ReplayRadio::new(sink, devices)
        });
        let mut status = handle.status_receiver();
        handle.start_cycle(CycleRequest::single()).unwrap();
        status.changed().await.unwrap();
        assert_eq!(
            *status.borrow_and_update(),
            ConnectionStatus::Scanning(DeviceRole::UpperBack)
        );

        handle.cancel();
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), ConnectionStatus::Disconnected);
        handle.shutdown();
    }
}
