//! Test doubles shared by the async workflow tests.

use crate::cycle::{ControllerEvent, CycleRequest};
use crate::runtime::CycleDriver;
use crate::store::{MemoryStore, Query, Store, StoreChange, StorePath};
use crate::{ConnectionStatus, DeviceRole, Error, Result, SensorSample};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Level sample tilted forward by `pitch` degrees
pub fn tilted(pitch: f64) -> SensorSample {
    SensorSample::new([-pitch.to_radians().tan(), 0.0, 1.0], [0.0; 3], 0)
}

/// Events of one full cycle delivering the given samples
pub fn cycle_events(cycle: u64, upper: &[SensorSample], lower: &[SensorSample]) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    for (role, samples) in [(DeviceRole::UpperBack, upper), (DeviceRole::LowerBack, lower)] {
        events.push(ControllerEvent::Status(ConnectionStatus::Scanning(role)));
        events.push(ControllerEvent::Status(ConnectionStatus::Connected(role)));
        events.extend(
            samples
                .iter()
                .map(|sample| ControllerEvent::Sample { role, sample: *sample }),
        );
        events.push(ControllerEvent::Status(ConnectionStatus::Disconnected));
    }
    events.push(ControllerEvent::CycleComplete { cycle });
    events
}

/// Driver that publishes one scripted batch of events per `start_cycle`
pub struct ScriptedDriver {
    events: broadcast::Sender<ControllerEvent>,
    script: Mutex<VecDeque<Vec<ControllerEvent>>>,
    pub starts: Mutex<Vec<CycleRequest>>,
    pub cancels: AtomicUsize,
}

impl ScriptedDriver {
    pub fn new(script: Vec<Vec<ControllerEvent>>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            events,
            script: Mutex::new(script.into()),
            starts: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
        }
    }

    pub fn cancel_count(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CycleRequest> {
        self.starts.lock().unwrap().clone()
    }
}

impl CycleDriver for ScriptedDriver {
    fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    fn start_cycle(&self, request: CycleRequest) -> Result<()> {
        self.starts.lock().unwrap().push(request);
        let batch = self.script.lock().unwrap().pop_front().unwrap_or_default();
        for event in batch {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// Store whose writes always fail
#[derive(Default)]
pub struct FailingStore;

impl Store for FailingStore {
    fn get(&self, _path: &StorePath) -> Result<Option<Value>> {
        Ok(None)
    }

    fn set(&self, path: &StorePath, _value: Value) -> Result<()> {
        Err(Error::Persistence(format!("write to {} refused", path)))
    }

    fn update(&self, path: &StorePath, _fields: Map<String, Value>) -> Result<()> {
        Err(Error::Persistence(format!("update of {} refused", path)))
    }

    fn remove(&self, path: &StorePath) -> Result<()> {
        Err(Error::Persistence(format!("remove of {} refused", path)))
    }

    fn query(&self, _parent: &StorePath, _query: &Query) -> Result<Vec<(String, Value)>> {
        Ok(Vec::new())
    }

    fn watch(&self, _path: &StorePath) -> broadcast::Receiver<StoreChange> {
        broadcast::channel(1).1
    }
}

/// In-memory store whose `update` can be switched to fail
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_updates: AtomicBool,
}

impl Store for FlakyStore {
    fn get(&self, path: &StorePath) -> Result<Option<Value>> {
        self.inner.get(path)
    }

    fn set(&self, path: &StorePath, value: Value) -> Result<()> {
        self.inner.set(path, value)
    }

    fn update(&self, path: &StorePath, fields: Map<String, Value>) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::Persistence(format!("update of {} refused", path)));
        }
        self.inner.update(path, fields)
    }

    fn remove(&self, path: &StorePath) -> Result<()> {
        self.inner.remove(path)
    }

    fn query(&self, parent: &StorePath, query: &Query) -> Result<Vec<(String, Value)>> {
        self.inner.query(parent, query)
    }

    fn watch(&self, path: &StorePath) -> broadcast::Receiver<StoreChange> {
        self.inner.watch(path)
    }
}
