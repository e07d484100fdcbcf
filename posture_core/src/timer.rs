//! Single-shot, cancellable timers keyed by purpose.
//!
//! Every armed timer gets a fresh generation. Expiries are delivered back as
//! the token that was armed, and only the token currently armed for its key is
//! accepted, so a timer that fires after being cancelled or superseded is a
//! no-op.

use std::collections::HashMap;
use std::time::Duration;

/// What a controller timer is for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Give up scanning for the current role
    ScanTimeout,
    /// Abandon a connection attempt that never completes
    ConnectTimeout,
    /// Auto-disconnect after the connection-hold duration
    ConnectionHold,
    /// Radio settle time before scanning for the next role
    RolePause,
}

/// Identity of one armed timer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub key: TimerKey,
    pub generation: u64,
}

/// Something that can deliver a token back after a delay
pub trait Scheduler: Send {
    fn schedule(&mut self, token: TimerToken, delay: Duration);

    /// Must tolerate tokens that already fired or were never scheduled
    fn cancel(&mut self, token: TimerToken);
}

/// At most one armed timer per key
pub struct Timers<S: Scheduler> {
    scheduler: S,
    armed: HashMap<TimerKey, TimerToken>,
    next_generation: u64,
}

impl<S: Scheduler> Timers<S> {
    pub fn new(scheduler: S) -> Self {
        Self {
            scheduler,
            armed: HashMap::new(),
            next_generation: 1,
        }
    }

    /// Arm `key`, cancelling whatever was armed for it before
    pub fn arm(&mut self, key: TimerKey, delay: Duration) -> TimerToken {
        self.cancel(key);
        let token = TimerToken {
            key,
            generation: self.next_generation,
        };
        self.next_generation += 1;
        self.armed.insert(key, token);
        self.scheduler.schedule(token, delay);
        token
    }

    pub fn cancel(&mut self, key: TimerKey) {
        if let Some(token) = self.armed.remove(&key) {
            self.scheduler.cancel(token);
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, token) in self.armed.drain() {
            self.scheduler.cancel(token);
        }
    }

    /// Accept an expiry. Returns false for stale tokens.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        match self.armed.get(&token.key) {
            Some(current) if *current == token => {
                self.armed.remove(&token.key);
                true
            }
            _ => false,
        }
    }

    pub fn armed(&self, key: TimerKey) -> Option<TimerToken> {
        self.armed.get(&key).copied()
    }

    pub fn is_idle(&self) -> bool {
        self.armed.is_empty()
    }
}
