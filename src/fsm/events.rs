// =============================================================================
// FSM Events
// =============================================================================
//
// Event vocabularies for the Trading FSM (macro) and the Hedge Execution FSM
// (micro), plus the payload types that flow between the broker layer, the
// strategy, and the FSMs.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::broker::OrderSide;

/// Top-level Trading FSM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingEvent {
    Start,
    Synced,
    Tick,
    Quote,
    GreeksUpdate,
    TargetEmitted,
    HedgeDone,
    HedgeFailed,
    BrokerUp,
    ManualResume,
    Shutdown,
}

impl TradingEvent {
    /// Events that merely advance the monitoring pipeline; the FSM treats
    /// them uniformly.
    pub fn is_progress(self) -> bool {
        matches!(self, Self::Synced | Self::Tick | Self::Quote | Self::GreeksUpdate)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Synced => "synced",
            Self::Tick => "tick",
            Self::Quote => "quote",
            Self::GreeksUpdate => "greeks_update",
            Self::TargetEmitted => "target_emitted",
            Self::HedgeDone => "hedge_done",
            Self::HedgeFailed => "hedge_failed",
            Self::BrokerUp => "broker_up",
            Self::ManualResume => "manual_resume",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TradingEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hedge Execution FSM events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecEvent {
    RecvTarget,
    PlanSkip,
    PlanSend,
    PlaceOrder,
    AckOk,
    AckReject,
    TimeoutAck,
    PartialFill,
    FullFill,
    TimeoutWorking,
    RiskTrip,
    ManualCancel,
    BrokerDown,
    CancelSent,
    PositionsResynced,
    CannotRecover,
    TryResync,
}

impl ExecEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecvTarget => "recv_target",
            Self::PlanSkip => "plan_skip",
            Self::PlanSend => "plan_send",
            Self::PlaceOrder => "place_order",
            Self::AckOk => "ack_ok",
            Self::AckReject => "ack_reject",
            Self::TimeoutAck => "timeout_ack",
            Self::PartialFill => "partial_fill",
            Self::FullFill => "full_fill",
            Self::TimeoutWorking => "timeout_working",
            Self::RiskTrip => "risk_trip",
            Self::ManualCancel => "manual_cancel",
            Self::BrokerDown => "broker_down",
            Self::CancelSent => "cancel_sent",
            Self::PositionsResynced => "positions_resynced",
            Self::CannotRecover => "cannot_recover",
            Self::TryResync => "try_resync",
        }
    }
}

impl std::fmt::Display for ExecEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Emitted by the strategy; consumed by the Hedge Execution FSM.
#[derive(Debug, Clone)]
pub struct TargetPositionEvent {
    /// Absolute target stock position in the underlying (signed).
    pub target_shares: i64,
    pub side: OrderSide,
    /// abs(need).
    pub quantity: i64,
    pub reason: String,
    /// Unix seconds.
    pub ts: f64,
    pub trace_id: Option<String>,
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_events() {
        assert!(TradingEvent::Tick.is_progress());
        assert!(TradingEvent::Quote.is_progress());
        assert!(TradingEvent::Synced.is_progress());
        assert!(TradingEvent::GreeksUpdate.is_progress());
        assert!(!TradingEvent::TargetEmitted.is_progress());
        assert!(!TradingEvent::Shutdown.is_progress());
    }

    #[test]
    fn event_names() {
        assert_eq!(TradingEvent::HedgeFailed.to_string(), "hedge_failed");
        assert_eq!(ExecEvent::TimeoutWorking.to_string(), "timeout_working");
    }
}
