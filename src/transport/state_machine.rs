//! Connection state machine
//!
//! Every status change of the transport goes through [`transition`], a
//! `(status, event) → (status, action)` table. [`ReconnectMachine`] adds the
//! failure counter that decides between retrying and giving up.

use super::ConnectionStatus;

/// Something that happened to the live channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The application asked for a live connection
    Connect,
    /// The live channel opened
    Opened,
    /// Opening the live channel failed; `exhausted` when no attempts remain
    OpenFailed {
        /// The failure budget is used up
        exhausted: bool,
    },
    /// The server does not offer a live channel at all
    LiveUnsupported,
    /// An open channel closed or stopped answering heartbeats
    Dropped,
    /// The reconnect timer fired
    RetryDue,
    /// The application tore the transport down
    Disconnect,
}

/// What the driver has to do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start opening the live channel
    OpenLink,
    /// Arm the reconnect timer for the given attempt number
    ScheduleRetry(u32),
    /// Start heartbeats and flush queued sends over the live channel
    StartHeartbeat,
    /// Stop reconnecting; polling stays the delivery path
    GiveUp,
    /// Close everything and cancel pending work
    Teardown,
}

/// The transition table
///
/// Returns `None` for events that do not apply in `status` (a stale timer
/// after a disconnect, a second `Connect` while connected).
pub fn transition(status: ConnectionStatus, event: Event) -> Option<(ConnectionStatus, Action)> {
    use Action::*;
    use ConnectionStatus::*;

    let next = match (status, event) {
        (Disconnected | Failed | Polling, Event::Connect) => (Connecting, OpenLink),

        (Connecting | Reconnecting, Event::Opened) => (Connected, StartHeartbeat),
        (Connecting | Reconnecting, Event::OpenFailed { exhausted: false }) => {
            // Attempt number is filled in by the machine
            (Reconnecting, ScheduleRetry(0))
        }
        (Connecting | Reconnecting, Event::OpenFailed { exhausted: true }) => (Failed, GiveUp),
        (Connecting | Reconnecting, Event::LiveUnsupported) => (Polling, GiveUp),

        (Reconnecting, Event::RetryDue) => (Reconnecting, OpenLink),
        (Connected, Event::Dropped) => (Reconnecting, OpenLink),

        (Disconnected, Event::Disconnect) => return None,
        (_, Event::Disconnect) => (Disconnected, Teardown),

        _ => return None,
    };
    Some(next)
}

/// A transition that was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Status before the event
    pub from: ConnectionStatus,
    /// Status after the event
    pub to: ConnectionStatus,
    /// Work for the driver
    pub action: Action,
}

/// The table plus the consecutive-failure counter
#[derive(Debug, Clone)]
pub struct ReconnectMachine {
    status: ConnectionStatus,
    failures: u32,
    max_reconnect_attempts: u32,
}

impl ReconnectMachine {
    /// Start disconnected
    ///
    /// With `max_reconnect_attempts = n`, the first failed connect plus `n`
    /// failed reconnects are tolerated: failure number `n + 1` ends in
    /// [`ConnectionStatus::Failed`].
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            failures: 0,
            max_reconnect_attempts,
        }
    }

    /// Current status
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Consecutive failed connection attempts
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Feed an event; returns the applied transition, if any
    ///
    /// `OpenFailed` is accepted with any `exhausted` flag; the machine
    /// recomputes it from its own counter.
    pub fn handle(&mut self, event: Event) -> Option<Transition> {
        let event = match event {
            Event::OpenFailed { .. } => Event::OpenFailed {
                exhausted: self.failures.saturating_add(1) > self.max_reconnect_attempts,
            },
            other => other,
        };

        let (to, action) = transition(self.status, event)?;

        let action = match (event, action) {
            (Event::OpenFailed { .. }, Action::ScheduleRetry(_)) => {
                self.failures += 1;
                Action::ScheduleRetry(self.failures)
            }
            (Event::OpenFailed { .. }, other) => {
                self.failures = self.failures.saturating_add(1);
                other
            }
            (Event::Opened | Event::Connect | Event::Disconnect, other) => {
                self.failures = 0;
                other
            }
            (_, other) => other,
        };

        let from = self.status;
        self.status = to;
        Some(Transition { from, to, action })
    }
}
