use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::host::HostRef;

/// Coarse view of [`ControlState`] for callers that only care whether a
/// control connection exists.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Closed,
    Connected,
    Defunct,
    Reconnecting,
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Defunct => "DEFUNCT",
            ConnectionState::Reconnecting => "RECONNECTING",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlState {
    /// Never opened, or shut down.
    Closed,
    Connected { target: HostRef, connection_id: u64 },
    /// The socket to `failed` closed and no replacement was tried yet.
    Defunct { failed: HostRef },
    /// Failover found nobody, waiting for a retry or for a host to come up.
    Reconnecting { failed: HostRef, retries: u32 },
}

impl ControlState {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            ControlState::Closed => ConnectionState::Closed,
            ControlState::Connected { .. } => ConnectionState::Connected,
            ControlState::Defunct { .. } => ConnectionState::Defunct,
            ControlState::Reconnecting { .. } => ConnectionState::Reconnecting,
        }
    }

    pub fn target(&self) -> Option<HostRef> {
        match self {
            ControlState::Connected { target, .. } => Some(*target),
            _ => None,
        }
    }
}

impl Display for ControlState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlState::Closed => write!(f, "CLOSED"),
            ControlState::Connected { target, connection_id } => {
                write!(f, "CONNECTED({}, conn {})", target, connection_id)
            }
            ControlState::Defunct { failed } => write!(f, "DEFUNCT({})", failed),
            ControlState::Reconnecting { failed, retries } => {
                write!(f, "RECONNECTING({}, retry {})", failed, retries)
            }
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlEvent {
    /// A connection passed the identity gate and was installed.
    Opened { target: HostRef, connection_id: u64 },
    SocketClosed { connection_id: u64 },
    FailoverExhausted,
    RetryDue,
    HostUp(HostRef),
    Shutdown,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlAction {
    None,
    /// Report `failed` down, then fail over to any other eligible host.
    ReportDown { failed: HostRef },
    /// Fail over to any eligible host.
    Failover,
    ScheduleRetry { retries: u32 },
    /// Run a reconciliation over the new connection.
    Refresh,
    Release,
}

/// The control connection's state machine. Pure, the manager executes the
/// returned action.
pub fn transition(state: &ControlState, event: ControlEvent) -> (ControlState, ControlAction) {
    use ControlAction as A;
    use ControlEvent as E;
    use ControlState as S;

    match (state, event) {
        (_, E::Shutdown) => (S::Closed, A::Release),
        (S::Connected { .. }, E::Opened { .. }) => (state.clone(), A::None),
        (_, E::Opened { target, connection_id }) => {
            (S::Connected { target, connection_id }, A::Refresh)
        }
        (
            S::Connected { target, connection_id },
            E::SocketClosed {
                connection_id: closed,
            },
        ) if *connection_id == closed => {
            (S::Defunct { failed: *target }, A::ReportDown { failed: *target })
        }
        (S::Defunct { failed }, E::FailoverExhausted) => (
            S::Reconnecting {
                failed: *failed,
                retries: 0,
            },
            A::ScheduleRetry { retries: 0 },
        ),
        (S::Reconnecting { failed, retries }, E::FailoverExhausted) => {
            let retries = retries.saturating_add(1);
            (S::Reconnecting { failed: *failed, retries }, A::ScheduleRetry { retries })
        }
        (S::Reconnecting { .. }, E::RetryDue | E::HostUp(_)) => (state.clone(), A::Failover),
        _ => (state.clone(), A::None),
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::control::state::{
        transition, ConnectionState, ControlAction, ControlEvent, ControlState,
    };
    use crate::host::{Generation, HostRef};

    fn host(node: u8) -> HostRef {
        HostRef {
            address: SocketAddr::from(([127, 0, 5, node], 9042)),
            generation: Generation(node as u64),
        }
    }

    #[test]
    fn test_close_goes_defunct_before_anything_else() {
        let connected = ControlState::Connected {
            target: host(1),
            connection_id: 7,
        };
        let closed = ControlEvent::SocketClosed { connection_id: 7 };
        let (state, action) = transition(&connected, closed);
        assert_eq!(state, ControlState::Defunct { failed: host(1) });
        assert_eq!(action, ControlAction::ReportDown { failed: host(1) });
        let (state, action) = transition(
            &state,
            ControlEvent::Opened {
                target: host(2),
                connection_id: 8,
            },
        );
        assert_eq!(state.connection_state(), ConnectionState::Connected);
        assert_eq!(state.target(), Some(host(2)));
        assert_eq!(action, ControlAction::Refresh);
    }

    #[test]
    fn test_stale_close_is_ignored() {
        let connected = ControlState::Connected {
            target: host(2),
            connection_id: 8,
        };
        let closed = ControlEvent::SocketClosed { connection_id: 7 };
        let (state, action) = transition(&connected, closed);
        assert_eq!(state, connected);
        assert_eq!(action, ControlAction::None);
    }

    #[test]
    fn test_exhausted_failover_keeps_retrying() {
        let defunct = ControlState::Defunct { failed: host(1) };
        let (state, action) = transition(&defunct, ControlEvent::FailoverExhausted);
        assert_eq!(action, ControlAction::ScheduleRetry { retries: 0 });
        let (state, action) = transition(&state, ControlEvent::RetryDue);
        assert_eq!(action, ControlAction::Failover);
        let (state, action) = transition(&state, ControlEvent::FailoverExhausted);
        assert_eq!(
            state,
            ControlState::Reconnecting {
                failed: host(1),
                retries: 1
            }
        );
        assert_eq!(action, ControlAction::ScheduleRetry { retries: 1 });
        let (_, action) = transition(&state, ControlEvent::HostUp(host(3)));
        assert_eq!(action, ControlAction::Failover);
    }

    #[test]
    fn test_retry_is_ignored_once_connected() {
        let connected = ControlState::Connected {
            target: host(2),
            connection_id: 1,
        };
        assert_eq!(transition(&connected, ControlEvent::RetryDue).1, ControlAction::None);
        assert_eq!(transition(&connected, ControlEvent::HostUp(host(3))).1, ControlAction::None);
        let (state, action) = transition(&connected, ControlEvent::Shutdown);
        assert_eq!(state, ControlState::Closed);
        assert_eq!(action, ControlAction::Release);
    }
}
