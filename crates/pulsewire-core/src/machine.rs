//! Connection lifecycle state machine.
//!
//! The machine holds no socket and no timer. The runtime feeds it named
//! events and carries out the actions it returns, which keeps the
//! reconnect policy testable without a network.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffPolicy;

/// Coarse connection state for UI binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    #[default]
    Disconnected,
    Errored,
}

impl ConnectionState {
    /// Lowercase wire/UI name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity failures surfaced to the owner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// Recovered automatically by the retry schedule.
    #[error("Connection lost: {0}")]
    Transient(String),
    /// Retries exhausted; only a manual connect resumes.
    #[error("Maximum reconnection attempts reached ({0})")]
    MaxAttemptsReached(u32),
}

impl ChannelError {
    /// Whether the channel stopped retrying because of this error.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::MaxAttemptsReached(_))
    }
}

/// Retry bookkeeping, reset on every successful connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectContext {
    pub attempt_count: u32,
    pub last_error: Option<ChannelError>,
}

/// Snapshot published to observers after every transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub attempt_count: u32,
    pub last_error: Option<ChannelError>,
    /// A retry timer is armed.
    pub retry_pending: bool,
}

impl ConnectionStatus {
    /// Short label for a status indicator.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match (self.state, &self.last_error) {
            (ConnectionState::Connected, _) => "Live",
            (ConnectionState::Connecting, _) => "Connecting",
            (_, Some(ChannelError::MaxAttemptsReached(_))) => "Disconnected (gave up)",
            _ if self.retry_pending => "Reconnecting",
            (ConnectionState::Errored, _) => "Error",
            (ConnectionState::Disconnected, _) => "Disconnected",
        }
    }
}

/// Inputs to the machine. `generation` identifies the open attempt an
/// event belongs to; events from superseded attempts are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineEvent {
    ConnectRequested,
    DisconnectRequested,
    HandshakeSucceeded { generation: u64 },
    HandshakeFailed { generation: u64, reason: String },
    TransportErrored { generation: u64, reason: String },
    ClosedCleanly { generation: u64 },
    ClosedAbnormally { generation: u64, reason: String },
    RetryElapsed,
}

/// Work the runtime must carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Start a handshake tagged with `generation`.
    Open { generation: u64 },
    /// Handshake accepted: announce the client and start keep-alive.
    Established,
    /// Arm the retry timer.
    ScheduleRetry { attempt: u32, delay: Duration },
    /// Retries exhausted.
    Exhausted { attempts: u32 },
    /// Cancel timers, abandon any handshake and close the link.
    Teardown,
}

/// The connection lifecycle.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    policy: BackoffPolicy,
    state: ConnectionState,
    context: ReconnectContext,
    generation: u64,
    retry_pending: bool,
}

impl ConnectionMachine {
    /// Create a machine in the `disconnected` state.
    #[must_use]
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disconnected,
            context: ReconnectContext::default(),
            generation: 0,
            retry_pending: false,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn context(&self) -> &ReconnectContext {
        &self.context
    }

    /// Generation of the most recent open attempt.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether events tagged with `generation` still matter.
    #[must_use]
    pub const fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    #[must_use]
    pub const fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            attempt_count: self.context.attempt_count,
            last_error: self.context.last_error.clone(),
            retry_pending: self.retry_pending,
        }
    }

    /// Apply one event and return the actions it requires.
    pub fn handle(&mut self, event: MachineEvent) -> Vec<Action> {
        match event {
            MachineEvent::ConnectRequested => self.on_connect_requested(),
            MachineEvent::DisconnectRequested => self.on_disconnect_requested(),
            MachineEvent::HandshakeSucceeded { generation } => {
                if !self.accepts(generation, &[ConnectionState::Connecting]) {
                    return Vec::new();
                }
                self.state = ConnectionState::Connected;
                self.context = ReconnectContext::default();
                vec![Action::Established]
            }
            MachineEvent::HandshakeFailed { generation, reason } => {
                if !self.accepts(generation, &[ConnectionState::Connecting]) {
                    return Vec::new();
                }
                self.on_lost(reason)
            }
            MachineEvent::TransportErrored { generation, reason } => {
                if !self.accepts(generation, &[ConnectionState::Connected]) {
                    return Vec::new();
                }
                self.state = ConnectionState::Errored;
                self.context.last_error = Some(ChannelError::Transient(reason));
                Vec::new()
            }
            MachineEvent::ClosedCleanly { generation } => {
                if !self.accepts(
                    generation,
                    &[ConnectionState::Connected, ConnectionState::Errored],
                ) {
                    return Vec::new();
                }
                self.state = ConnectionState::Disconnected;
                vec![Action::Teardown]
            }
            MachineEvent::ClosedAbnormally { generation, reason } => {
                if !self.accepts(
                    generation,
                    &[
                        ConnectionState::Connecting,
                        ConnectionState::Connected,
                        ConnectionState::Errored,
                    ],
                ) {
                    return Vec::new();
                }
                let mut actions = vec![Action::Teardown];
                actions.extend(self.on_lost(reason));
                actions
            }
            MachineEvent::RetryElapsed => {
                if !self.retry_pending || self.state != ConnectionState::Disconnected {
                    return Vec::new();
                }
                self.retry_pending = false;
                vec![self.open()]
            }
        }
    }

    fn accepts(&self, generation: u64, states: &[ConnectionState]) -> bool {
        if !self.is_current(generation) || !states.contains(&self.state) {
            tracing::debug!(
                generation,
                current = self.generation,
                state = %self.state,
                "Ignoring stale connection event"
            );
            return false;
        }
        true
    }

    fn open(&mut self) -> Action {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        Action::Open {
            generation: self.generation,
        }
    }

    fn on_connect_requested(&mut self) -> Vec<Action> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => Vec::new(),
            ConnectionState::Disconnected | ConnectionState::Errored => {
                self.retry_pending = false;
                self.context = ReconnectContext::default();
                vec![Action::Teardown, self.open()]
            }
        }
    }

    fn on_disconnect_requested(&mut self) -> Vec<Action> {
        if self.state == ConnectionState::Disconnected && !self.retry_pending {
            return Vec::new();
        }
        // Invalidate any handshake still in flight.
        self.generation += 1;
        self.state = ConnectionState::Disconnected;
        self.retry_pending = false;
        vec![Action::Teardown]
    }

    fn on_lost(&mut self, reason: String) -> Vec<Action> {
        self.state = ConnectionState::Disconnected;
        let attempt = self.context.attempt_count;
        if !self.policy.allows(attempt) {
            self.retry_pending = false;
            self.context.last_error = Some(ChannelError::MaxAttemptsReached(attempt));
            return vec![Action::Exhausted { attempts: attempt }];
        }
        let delay = self.policy.delay_for(attempt);
        self.context.attempt_count = attempt + 1;
        self.context.last_error = Some(ChannelError::Transient(reason));
        self.retry_pending = true;
        vec![Action::ScheduleRetry {
            attempt: attempt + 1,
            delay,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
            max_attempts,
        }
    }

    fn open_generation(actions: &[Action]) -> u64 {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Open { generation } => Some(*generation),
                _ => None,
            })
            .expect("no Open action")
    }

    fn fail(m: &mut ConnectionMachine, generation: u64) -> Vec<Action> {
        m.handle(MachineEvent::HandshakeFailed {
            generation,
            reason: "refused".into(),
        })
    }

    #[test]
    fn test_starts_disconnected() {
        let m = ConnectionMachine::new(policy(10));
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert_eq!(m.context().attempt_count, 0);
        assert!(m.context().last_error.is_none());
    }

    #[test]
    fn test_fails_twice_then_connects() {
        let mut m = ConnectionMachine::new(policy(10));
        let mut counts = vec![m.context().attempt_count];

        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        assert_eq!(m.state(), ConnectionState::Connecting);

        fail(&mut m, g);
        counts.push(m.context().attempt_count);
        let g = open_generation(&m.handle(MachineEvent::RetryElapsed));

        fail(&mut m, g);
        counts.push(m.context().attempt_count);
        let g = open_generation(&m.handle(MachineEvent::RetryElapsed));

        assert_eq!(
            m.handle(MachineEvent::HandshakeSucceeded { generation: g }),
            vec![Action::Established]
        );
        counts.push(m.context().attempt_count);

        assert_eq!(counts, vec![0, 1, 2, 0]);
        assert_eq!(m.state(), ConnectionState::Connected);
        assert!(m.context().last_error.is_none());
    }

    #[test]
    fn test_retry_schedule_is_bounded() {
        for max_attempts in [1_u32, 3, 10] {
            let mut m = ConnectionMachine::new(policy(max_attempts));
            let mut g = open_generation(&m.handle(MachineEvent::ConnectRequested));
            let mut delays = Vec::new();

            loop {
                let actions = fail(&mut m, g);
                match actions.as_slice() {
                    [Action::ScheduleRetry { attempt, delay }] => {
                        assert_eq!(*attempt as usize, delays.len() + 1);
                        delays.push(*delay);
                        g = open_generation(&m.handle(MachineEvent::RetryElapsed));
                    }
                    [Action::Exhausted { attempts }] => {
                        assert_eq!(*attempts, max_attempts);
                        break;
                    }
                    other => panic!("unexpected actions {other:?}"),
                }
                assert!(m.context().attempt_count <= max_attempts);
            }

            assert_eq!(delays.len(), max_attempts as usize);
            for (k, d) in delays.iter().enumerate() {
                let expected = crate::backoff::delay(
                    u32::try_from(k).unwrap(),
                    Duration::from_millis(1_000),
                    Duration::from_millis(30_000),
                );
                assert_eq!(*d, expected, "retry {}", k + 1);
            }
            assert_eq!(m.state(), ConnectionState::Disconnected);
            assert_eq!(
                m.context().last_error,
                Some(ChannelError::MaxAttemptsReached(max_attempts))
            );
            assert!(!m.retry_pending());
            assert!(m.handle(MachineEvent::RetryElapsed).is_empty());
        }
    }

    #[test]
    fn test_zero_max_attempts_retries_forever() {
        let mut m = ConnectionMachine::new(policy(0));
        let mut g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        for _ in 0..100 {
            let actions = fail(&mut m, g);
            assert!(matches!(actions.as_slice(), [Action::ScheduleRetry { .. }]));
            g = open_generation(&m.handle(MachineEvent::RetryElapsed));
        }
        assert_eq!(m.context().attempt_count, 100);
    }

    #[test]
    fn test_manual_connect_after_exhaustion_starts_fresh() {
        let mut m = ConnectionMachine::new(policy(1));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        fail(&mut m, g);
        let g = open_generation(&m.handle(MachineEvent::RetryElapsed));
        assert!(matches!(fail(&mut m, g).as_slice(), [Action::Exhausted { .. }]));

        let actions = m.handle(MachineEvent::ConnectRequested);
        assert!(actions.contains(&Action::Teardown));
        open_generation(&actions);
        assert_eq!(m.context().attempt_count, 0);
        assert!(m.context().last_error.is_none());
    }

    #[test]
    fn test_clean_close_does_not_retry() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::HandshakeSucceeded { generation: g });

        let actions = m.handle(MachineEvent::ClosedCleanly { generation: g });
        assert_eq!(actions, vec![Action::Teardown]);
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(!m.retry_pending());
    }

    #[test]
    fn test_abnormal_close_retries() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::HandshakeSucceeded { generation: g });

        let actions = m.handle(MachineEvent::ClosedAbnormally {
            generation: g,
            reason: "reset".into(),
        });
        assert_eq!(
            actions,
            vec![
                Action::Teardown,
                Action::ScheduleRetry {
                    attempt: 1,
                    delay: Duration::from_millis(1_000)
                }
            ]
        );
        assert_eq!(m.context().attempt_count, 1);
        assert_eq!(
            m.context().last_error,
            Some(ChannelError::Transient("reset".into()))
        );
    }

    #[test]
    fn test_transport_error_then_close() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::HandshakeSucceeded { generation: g });

        m.handle(MachineEvent::TransportErrored {
            generation: g,
            reason: "io".into(),
        });
        assert_eq!(m.state(), ConnectionState::Errored);

        m.handle(MachineEvent::ClosedAbnormally {
            generation: g,
            reason: "io".into(),
        });
        assert_eq!(m.state(), ConnectionState::Disconnected);
        assert!(m.retry_pending());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::HandshakeSucceeded { generation: g });

        assert_eq!(m.handle(MachineEvent::DisconnectRequested), vec![Action::Teardown]);
        let after_first = m.status();
        assert!(m.handle(MachineEvent::DisconnectRequested).is_empty());
        assert_eq!(m.status(), after_first);
    }

    #[test]
    fn test_disconnect_cancels_pending_retry() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        fail(&mut m, g);
        assert!(m.retry_pending());

        assert_eq!(m.handle(MachineEvent::DisconnectRequested), vec![Action::Teardown]);
        assert!(!m.retry_pending());
        assert!(m.handle(MachineEvent::RetryElapsed).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_disconnect_abandons_in_flight_handshake() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::DisconnectRequested);

        assert!(!m.is_current(g));
        assert!(m.handle(MachineEvent::HandshakeSucceeded { generation: g }).is_empty());
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_connect_is_idempotent_while_active() {
        let mut m = ConnectionMachine::new(policy(10));
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        assert!(m.handle(MachineEvent::ConnectRequested).is_empty());
        m.handle(MachineEvent::HandshakeSucceeded { generation: g });
        assert!(m.handle(MachineEvent::ConnectRequested).is_empty());
        assert_eq!(m.generation(), g);
    }

    #[test]
    fn test_stale_close_is_ignored() {
        let mut m = ConnectionMachine::new(policy(10));
        let old = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::DisconnectRequested);
        let new = open_generation(&m.handle(MachineEvent::ConnectRequested));
        m.handle(MachineEvent::HandshakeSucceeded { generation: new });

        assert!(m
            .handle(MachineEvent::ClosedAbnormally {
                generation: old,
                reason: "late".into()
            })
            .is_empty());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_status_labels() {
        let mut m = ConnectionMachine::new(policy(1));
        assert_eq!(m.status().label(), "Disconnected");
        let g = open_generation(&m.handle(MachineEvent::ConnectRequested));
        assert_eq!(m.status().label(), "Connecting");
        fail(&mut m, g);
        assert_eq!(m.status().label(), "Reconnecting");
        let g = open_generation(&m.handle(MachineEvent::RetryElapsed));
        fail(&mut m, g);
        assert_eq!(m.status().label(), "Disconnected (gave up)");
    }
}
