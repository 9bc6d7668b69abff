// =============================================================================
// Daemon Lifecycle FSM
// =============================================================================
//
// IDLE -> CONNECTING -> {CONNECTED, WAITING_IB} -> RUNNING <-> RUNNING_SUSPENDED
// and any active state -> STOPPING -> STOPPED.
//
// A broker connect failure is recoverable: CONNECTING falls back to
// WAITING_IB and the daemon keeps running with a retry schedule. The only
// terminal state is STOPPED, and nothing short of request_stop or process
// death reaches it.
// =============================================================================

use tracing::{debug, warn};

/// Daemon lifecycle states. RUNNING_SUSPENDED is RUNNING with hedging
/// paused by the monitor; WAITING_IB is up-but-disconnected, retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DaemonState {
    Idle,
    Connecting,
    WaitingIb,
    Connected,
    Running,
    RunningSuspended,
    Stopping,
    Stopped,
}

impl DaemonState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::WaitingIb => "WAITING_IB",
            Self::Connected => "CONNECTED",
            Self::Running => "RUNNING",
            Self::RunningSuspended => "RUNNING_SUSPENDED",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Allowed transition targets from this state.
    fn allowed(self) -> &'static [DaemonState] {
        use DaemonState::*;
        match self {
            Idle => &[Connecting, Stopped],
            Connecting => &[Connected, WaitingIb, Stopping],
            WaitingIb => &[Connecting, Connected, Stopping],
            Connected => &[Running, Stopping],
            Running => &[Stopping, RunningSuspended, WaitingIb],
            RunningSuspended => &[Running, Stopping, WaitingIb],
            Stopping => &[Stopped],
            Stopped => &[],
        }
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Manages the daemon lifecycle state.
pub struct DaemonFsm {
    current: DaemonState,
}

impl Default for DaemonFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonFsm {
    pub fn new() -> Self {
        Self {
            current: DaemonState::Idle,
        }
    }

    pub fn current(&self) -> DaemonState {
        self.current
    }

    pub fn can_transition_to(&self, to: DaemonState) -> bool {
        self.current.allowed().contains(&to)
    }

    /// Transition if valid; invalid transitions are logged and refused.
    pub fn transition(&mut self, to: DaemonState) -> bool {
        if !self.can_transition_to(to) {
            warn!(
                from = %self.current,
                to = %to,
                allowed = ?self.current.allowed(),
                "invalid daemon transition"
            );
            return false;
        }
        debug!(from = %self.current, to = %to, "daemon transition");
        self.current = to;
        true
    }

    /// RUNNING or RUNNING_SUSPENDED: heartbeat and main loop active.
    pub fn is_running(&self) -> bool {
        matches!(
            self.current,
            DaemonState::Running | DaemonState::RunningSuspended
        )
    }

    /// Able to process hedges.
    pub fn is_active(&self) -> bool {
        matches!(self.current, DaemonState::Connected | DaemonState::Running)
    }

    /// Request stop: active states go to STOPPING for cleanup; IDLE goes
    /// straight to STOPPED.
    pub fn request_stop(&mut self) -> bool {
        match self.current {
            DaemonState::Running
            | DaemonState::RunningSuspended
            | DaemonState::Connecting
            | DaemonState::WaitingIb
            | DaemonState::Connected => self.transition(DaemonState::Stopping),
            DaemonState::Idle => self.transition(DaemonState::Stopped),
            _ => false,
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_lifecycle() {
        let mut fsm = DaemonFsm::new();
        assert_eq!(fsm.current(), DaemonState::Idle);
        assert!(fsm.transition(DaemonState::Connecting));
        assert!(fsm.transition(DaemonState::Connected));
        assert!(fsm.transition(DaemonState::Running));
        assert!(fsm.is_running());
        assert!(fsm.is_active());
        assert!(fsm.transition(DaemonState::Stopping));
        assert!(fsm.transition(DaemonState::Stopped));
    }

    #[test]
    fn connect_failure_goes_waiting_not_stopped() {
        let mut fsm = DaemonFsm::new();
        fsm.transition(DaemonState::Connecting);
        assert!(fsm.transition(DaemonState::WaitingIb));
        // Retry path.
        assert!(fsm.transition(DaemonState::Connecting));
        assert!(fsm.transition(DaemonState::WaitingIb));
        // Direct WAITING_IB -> CONNECTED is also valid (retry succeeded).
        assert!(fsm.transition(DaemonState::Connected));
    }

    #[test]
    fn running_drops_to_waiting_on_disconnect() {
        let mut fsm = DaemonFsm::new();
        fsm.transition(DaemonState::Connecting);
        fsm.transition(DaemonState::Connected);
        fsm.transition(DaemonState::Running);
        assert!(fsm.transition(DaemonState::WaitingIb));
        assert!(!fsm.is_running());
    }

    #[test]
    fn suspend_resume_cycle() {
        let mut fsm = DaemonFsm::new();
        fsm.transition(DaemonState::Connecting);
        fsm.transition(DaemonState::Connected);
        fsm.transition(DaemonState::Running);
        assert!(fsm.transition(DaemonState::RunningSuspended));
        assert!(fsm.is_running());
        assert!(!fsm.is_active());
        assert!(fsm.transition(DaemonState::Running));
        // Suspended may also drop to WAITING_IB on disconnect.
        fsm.transition(DaemonState::RunningSuspended);
        assert!(fsm.transition(DaemonState::WaitingIb));
    }

    #[test]
    fn stopped_is_terminal() {
        let mut fsm = DaemonFsm::new();
        fsm.request_stop();
        assert_eq!(fsm.current(), DaemonState::Stopped);
        for to in [
            DaemonState::Idle,
            DaemonState::Connecting,
            DaemonState::Running,
            DaemonState::Stopping,
        ] {
            assert!(!fsm.transition(to));
        }
        assert!(!fsm.request_stop());
    }

    #[test]
    fn request_stop_from_each_state() {
        // IDLE -> STOPPED directly.
        let mut fsm = DaemonFsm::new();
        assert!(fsm.request_stop());
        assert_eq!(fsm.current(), DaemonState::Stopped);

        // Active states -> STOPPING.
        for setup in [
            vec![DaemonState::Connecting],
            vec![DaemonState::Connecting, DaemonState::WaitingIb],
            vec![DaemonState::Connecting, DaemonState::Connected],
            vec![DaemonState::Connecting, DaemonState::Connected, DaemonState::Running],
            vec![
                DaemonState::Connecting,
                DaemonState::Connected,
                DaemonState::Running,
                DaemonState::RunningSuspended,
            ],
        ] {
            let mut fsm = DaemonFsm::new();
            for s in setup {
                assert!(fsm.transition(s));
            }
            assert!(fsm.request_stop());
            assert_eq!(fsm.current(), DaemonState::Stopping);
        }
    }

    #[test]
    fn invalid_transitions_refused() {
        let mut fsm = DaemonFsm::new();
        assert!(!fsm.transition(DaemonState::Running));
        assert!(!fsm.transition(DaemonState::RunningSuspended));
        assert_eq!(fsm.current(), DaemonState::Idle);
    }
}
