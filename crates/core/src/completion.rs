//! Bounded waiting for response units.
//!
//! Every expected unit gets the full per-unit timeout until the first one
//! misses it. From then on the run is exhausted and the remaining units are
//! only checked without waiting, so a run where nobody answers still returns
//! after roughly one timeout period.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Waiting,
    Exhausted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CompletionState {
    pub expected: usize,
    pub received: usize,
    pub exhausted: bool,
}

#[derive(Debug)]
pub struct CompletionDetector {
    unit_timeout: Duration,
    state: CompletionState,
    phase: Phase,
}

impl CompletionDetector {
    pub fn new(expected: usize, unit_timeout: Duration) -> Self {
        Self {
            unit_timeout,
            state: CompletionState {
                expected,
                received: 0,
                exhausted: false,
            },
            phase: Phase::Waiting,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> CompletionState {
        self.state
    }

    /// Awaits one unit. Returns `None` when it did not arrive in time.
    pub async fn await_unit<T>(&mut self, units: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        let unit = if self.state.exhausted {
            units.try_recv().ok()
        } else {
            match timeout(self.unit_timeout, units.recv()).await {
                Ok(Some(unit)) => Some(unit),
                Ok(None) => {
                    warn!("Response channel closed while waiting");
                    None
                }
                Err(_) => {
                    error!("Response message timeout in {} seconds", self.unit_timeout.as_secs());
                    None
                }
            }
        };
        match unit {
            Some(_) => self.state.received += 1,
            None if !self.state.exhausted => {
                self.state.exhausted = true;
                self.phase = Phase::Exhausted;
            }
            None => {}
        }
        unit
    }

    /// Accounts for every expected unit, then reports the final state.
    pub async fn run<T>(&mut self, units: &mut mpsc::UnboundedReceiver<T>) -> CompletionState {
        debug!(expected = self.state.expected, "Waiting for responses");
        for _ in 0..self.state.expected {
            self.await_unit(units).await;
        }
        self.phase = Phase::Done;
        self.state
    }
}
