//! Connection lifecycle as a pure state machine.
//!
//! The connection task feeds [`ConnectionEvent`]s through [`transition`] and
//! carries out the returned [`RetryAction`]; nothing here touches a socket.

use tokio::time::Duration;

use crate::config::ReconnectPolicy;

/// Lifecycle state of a connection manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or explicitly disconnected
    Idle,
    /// Initial connect in flight
    Connecting,
    Open,
    /// Recovering from an unexpected close; `attempt` is zero-based
    Reconnecting { attempt: u32 },
    /// Initial connect failed or reconnection gave up
    Failed,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connect,
    Opened,
    ConnectFailed,
    /// Any close not initiated by `disconnect()`
    Closed,
    Disconnect,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    ScheduleRetry { attempt: u32, delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub state: ConnectionState,
    pub action: Option<RetryAction>,
}

impl Transition {
    fn to(state: ConnectionState) -> Self {
        Self {
            state,
            action: None,
        }
    }

    fn retry(attempt: u32, policy: &ReconnectPolicy) -> Self {
        if attempt >= policy.max_attempts {
            return Self {
                state: ConnectionState::Failed,
                action: Some(RetryAction::GiveUp),
            };
        }
        Self {
            state: ConnectionState::Reconnecting { attempt },
            action: Some(RetryAction::ScheduleRetry {
                attempt,
                delay: policy.delay_for(attempt),
            }),
        }
    }
}

/// Compute the next state for `event`
pub fn transition(
    state: ConnectionState,
    event: ConnectionEvent,
    policy: &ReconnectPolicy,
) -> Transition {
    use ConnectionEvent as E;
    use ConnectionState as S;

    match (state, event) {
        (_, E::Disconnect) => Transition::to(S::Idle),

        (S::Idle | S::Failed, E::Connect) => Transition::to(S::Connecting),

        (S::Connecting, E::Opened) => Transition::to(S::Open),
        (S::Connecting, E::ConnectFailed | E::Closed) => Transition::to(S::Failed),

        (S::Open, E::Closed) => Transition::retry(0, policy),

        (S::Reconnecting { .. }, E::Opened) => Transition::to(S::Open),
        (S::Reconnecting { attempt }, E::ConnectFailed | E::Closed) => {
            Transition::retry(attempt + 1, policy)
        }

        (state, _) => Transition::to(state),
    }
}
