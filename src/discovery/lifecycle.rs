//! Service lifecycle state machine
//!
//! `Stopped -> Starting -> Started -> Stopping -> Stopped`. Every transition
//! goes through one guarded compare-and-set on a watch channel, so callers
//! racing on `start`/`stop` either claim the transition or wait for the one
//! in flight to settle. The outcome of a failed start travels in the same
//! watch value as the state, so a waiter always reports the start it saw.

use std::fmt;
use tokio::sync::watch;

/// Error recorded when a claimed start is dropped before it settles
pub const START_CANCELLED: &str = "start cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Started => "started",
            ServiceState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Phase {
    state: ServiceState,
    /// Why the most recent start failed; cleared when a new start is claimed
    start_error: Option<String>,
}

/// What a `start` caller should do
#[derive(Debug)]
pub enum StartDecision<'a> {
    /// This caller owns the transition and must settle it
    Run(PendingStart<'a>),
    /// Already started, or a concurrent start succeeded
    AlreadyStarted,
    /// A concurrent start failed with this message
    Failed(String),
}

/// What a `stop` caller should do
#[derive(Debug)]
pub enum StopDecision<'a> {
    /// This caller owns the transition and must settle it
    Run(PendingStop<'a>),
    AlreadyStopped,
}

/// A claimed start. Dropping it unsettled fails the start with
/// [`START_CANCELLED`].
#[must_use = "an unsettled start is cancelled when dropped"]
pub struct PendingStart<'a> {
    lifecycle: &'a ServiceLifecycle,
    settled: bool,
}

impl PendingStart<'_> {
    pub fn finish(mut self, result: Result<(), String>) {
        self.settled = true;
        self.lifecycle.settle_start(result);
    }
}

impl Drop for PendingStart<'_> {
    fn drop(&mut self) {
        if !self.settled {
            log::warn!("Start abandoned before it completed");
            self.lifecycle.settle_start(Err(START_CANCELLED.to_string()));
        }
    }
}

impl fmt::Debug for PendingStart<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingStart")
            .field("settled", &self.settled)
            .finish()
    }
}

/// A claimed stop. Dropping it unsettled still lands in `Stopped`.
#[must_use = "an unsettled stop is finished when dropped"]
pub struct PendingStop<'a> {
    lifecycle: &'a ServiceLifecycle,
}

impl PendingStop<'_> {
    pub fn finish(self) {}
}

impl Drop for PendingStop<'_> {
    fn drop(&mut self) {
        self.lifecycle.set(ServiceState::Stopped, None);
    }
}

impl fmt::Debug for PendingStop<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PendingStop")
    }
}

pub struct ServiceLifecycle {
    phase: watch::Sender<Phase>,
}

impl ServiceLifecycle {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase {
            state: ServiceState::Stopped,
            start_error: None,
        });
        Self { phase }
    }

    pub fn state(&self) -> ServiceState {
        self.phase.borrow().state
    }

    pub fn is_started(&self) -> bool {
        self.state() == ServiceState::Started
    }

    /// Why the most recent start failed, if it did
    pub fn last_start_error(&self) -> Option<String> {
        self.phase.borrow().start_error.clone()
    }

    /// Move `from -> to` if the current state is `from`; returns the state seen
    fn transition(&self, from: ServiceState, to: ServiceState) -> ServiceState {
        let mut seen = from;
        self.phase.send_if_modified(|current| {
            seen = current.state;
            if current.state == from {
                current.state = to;
                if to == ServiceState::Starting {
                    current.start_error = None;
                }
                true
            } else {
                false
            }
        });
        seen
    }

    fn set(&self, state: ServiceState, start_error: Option<String>) {
        self.phase.send_replace(Phase { state, start_error });
    }

    fn settle_start(&self, result: Result<(), String>) {
        match result {
            Ok(()) => self.set(ServiceState::Started, None),
            Err(error) => self.set(ServiceState::Stopped, Some(error)),
        }
    }

    /// Wait until the state leaves `state`, returning the phase that ended it
    async fn wait_while(&self, rx: &mut watch::Receiver<Phase>, state: ServiceState) -> Phase {
        match rx.wait_for(|current| current.state != state).await {
            Ok(phase) => phase.clone(),
            // The sender lives in `self`, so the channel cannot close here
            Err(_) => self.phase.borrow().clone(),
        }
    }

    pub async fn begin_start(&self) -> StartDecision<'_> {
        let mut rx = self.phase.subscribe();
        loop {
            match self.transition(ServiceState::Stopped, ServiceState::Starting) {
                ServiceState::Stopped => {
                    return StartDecision::Run(PendingStart {
                        lifecycle: self,
                        settled: false,
                    });
                }
                ServiceState::Started => return StartDecision::AlreadyStarted,
                ServiceState::Starting => {
                    let outcome = self.wait_while(&mut rx, ServiceState::Starting).await;
                    match (outcome.state, outcome.start_error) {
                        (ServiceState::Stopped, Some(error)) => {
                            return StartDecision::Failed(error)
                        }
                        (ServiceState::Started, _) | (ServiceState::Stopping, _) => {
                            return StartDecision::AlreadyStarted
                        }
                        // Started and stopped again before we looked
                        _ => continue,
                    }
                }
                ServiceState::Stopping => {
                    self.wait_while(&mut rx, ServiceState::Stopping).await;
                }
            }
        }
    }

    pub async fn begin_stop(&self) -> StopDecision<'_> {
        let mut rx = self.phase.subscribe();
        loop {
            match self.transition(ServiceState::Started, ServiceState::Stopping) {
                ServiceState::Started => return StopDecision::Run(PendingStop { lifecycle: self }),
                ServiceState::Stopped => return StopDecision::AlreadyStopped,
                ServiceState::Starting => {
                    self.wait_while(&mut rx, ServiceState::Starting).await;
                }
                ServiceState::Stopping => {
                    self.wait_while(&mut rx, ServiceState::Stopping).await;
                    return StopDecision::AlreadyStopped;
                }
            }
        }
    }
}

impl Default for ServiceLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
