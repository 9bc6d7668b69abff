// =============================================================================
// Hedge Execution FSM
// =============================================================================
//
// Micro state machine owning the single in-flight hedge cycle:
//
//   EXEC_IDLE -> PLAN -> SEND -> WAIT_ACK -> WORKING -> FILLED
//                  |       ^                    |-> PARTIAL -> SEND | EXEC_IDLE
//                  v       |                    |-> REPRICE -> WAIT_ACK
//              EXEC_IDLE   +---- REPRICE       |-> CANCEL -> RECOVER -> EXEC_IDLE | FAIL
//                                               FAIL -> RECOVER (try_resync)
//
// At most one order is ever live: new targets are only accepted in
// EXEC_IDLE or FILLED. Any event that does not match the table is logged
// and ignored; state never changes on an invalid event.
// =============================================================================

use tracing::{debug, warn};

use crate::fsm::events::{ExecEvent, TargetPositionEvent};
use crate::state::ExecutionState;

/// States of the hedge execution cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HedgeExecState {
    ExecIdle,
    Plan,
    Send,
    WaitAck,
    Working,
    Partial,
    Filled,
    Reprice,
    Cancel,
    Recover,
    Fail,
}

impl HedgeExecState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecIdle => "exec_idle",
            Self::Plan => "plan",
            Self::Send => "send",
            Self::WaitAck => "wait_ack",
            Self::Working => "working",
            Self::Partial => "partial",
            Self::Filled => "filled",
            Self::Reprice => "reprice",
            Self::Cancel => "cancel",
            Self::Recover => "recover",
            Self::Fail => "fail",
        }
    }
}

impl std::fmt::Display for HedgeExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an execution state onto the composite E letter. A disconnected
/// broker forces E3 regardless of the cycle state.
fn to_execution_state(h: HedgeExecState, connected: bool) -> ExecutionState {
    if !connected {
        return ExecutionState::Disconnected;
    }
    match h {
        HedgeExecState::Fail => ExecutionState::BrokerError,
        HedgeExecState::ExecIdle | HedgeExecState::Filled => ExecutionState::Idle,
        HedgeExecState::Partial => ExecutionState::PartialFill,
        HedgeExecState::Plan
        | HedgeExecState::Send
        | HedgeExecState::WaitAck
        | HedgeExecState::Working
        | HedgeExecState::Reprice
        | HedgeExecState::Cancel
        | HedgeExecState::Recover => ExecutionState::OrderWorking,
    }
}

/// The micro FSM. Owns the current target and the signed share need.
pub struct HedgeExecutionFsm {
    state: HedgeExecState,
    current_target: Option<TargetPositionEvent>,
    /// Signed: positive = buy, negative = sell.
    need_shares: i64,
    connected: bool,
}

impl Default for HedgeExecutionFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl HedgeExecutionFsm {
    pub fn new() -> Self {
        Self {
            state: HedgeExecState::ExecIdle,
            current_target: None,
            need_shares: 0,
            connected: true,
        }
    }

    pub fn state(&self) -> HedgeExecState {
        self.state
    }

    pub fn need_shares(&self) -> i64 {
        self.need_shares
    }

    pub fn current_target(&self) -> Option<&TargetPositionEvent> {
        self.current_target.as_ref()
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// E letter for the composite state.
    pub fn effective_execution_state(&self) -> ExecutionState {
        to_execution_state(self.state, self.connected)
    }

    /// Ready to accept a new target.
    pub fn can_place_order(&self) -> bool {
        matches!(self.state, HedgeExecState::ExecIdle | HedgeExecState::Filled)
    }

    fn transition(&mut self, to: HedgeExecState, event: ExecEvent) -> bool {
        let from = self.state;
        self.state = to;
        debug!(from = %from, to = %to, event = %event, "hedge exec fsm transition");
        true
    }

    fn rejected(&self, event: ExecEvent) -> bool {
        warn!(state = %self.state, event = %event, "hedge exec fsm event ignored");
        false
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Receive a target: EXEC_IDLE/FILLED -> PLAN. Stores
    /// `need_shares = target_shares - current_stock_pos`.
    pub fn on_target(&mut self, target: TargetPositionEvent, current_stock_pos: i64) -> bool {
        if !self.can_place_order() {
            return self.rejected(ExecEvent::RecvTarget);
        }
        self.need_shares = target.target_shares - current_stock_pos;
        self.current_target = Some(target);
        self.transition(HedgeExecState::Plan, ExecEvent::RecvTarget)
    }

    /// After PLAN: send the order or skip back to idle.
    pub fn on_plan_decide(&mut self, send_order: bool) -> bool {
        if self.state != HedgeExecState::Plan {
            return self.rejected(if send_order {
                ExecEvent::PlanSend
            } else {
                ExecEvent::PlanSkip
            });
        }
        if send_order {
            self.transition(HedgeExecState::Send, ExecEvent::PlanSend)
        } else {
            self.current_target = None;
            self.need_shares = 0;
            self.transition(HedgeExecState::ExecIdle, ExecEvent::PlanSkip)
        }
    }

    /// place_order went out: SEND or REPRICE -> WAIT_ACK.
    pub fn on_order_placed(&mut self) -> bool {
        if !matches!(self.state, HedgeExecState::Send | HedgeExecState::Reprice) {
            return self.rejected(ExecEvent::PlaceOrder);
        }
        self.transition(HedgeExecState::WaitAck, ExecEvent::PlaceOrder)
    }

    pub fn on_ack_ok(&mut self) -> bool {
        if self.state != HedgeExecState::WaitAck {
            return self.rejected(ExecEvent::AckOk);
        }
        self.transition(HedgeExecState::Working, ExecEvent::AckOk)
    }

    pub fn on_ack_reject(&mut self) -> bool {
        if self.state != HedgeExecState::WaitAck {
            return self.rejected(ExecEvent::AckReject);
        }
        self.transition(HedgeExecState::Fail, ExecEvent::AckReject)
    }

    pub fn on_timeout_ack(&mut self) -> bool {
        if self.state != HedgeExecState::WaitAck {
            return self.rejected(ExecEvent::TimeoutAck);
        }
        self.transition(HedgeExecState::Fail, ExecEvent::TimeoutAck)
    }

    pub fn on_partial_fill(&mut self) -> bool {
        if self.state != HedgeExecState::Working {
            return self.rejected(ExecEvent::PartialFill);
        }
        self.transition(HedgeExecState::Partial, ExecEvent::PartialFill)
    }

    /// Full fill clears the target.
    pub fn on_full_fill(&mut self) -> bool {
        if self.state != HedgeExecState::Working {
            return self.rejected(ExecEvent::FullFill);
        }
        self.current_target = None;
        self.need_shares = 0;
        self.transition(HedgeExecState::Filled, ExecEvent::FullFill)
    }

    pub fn on_timeout_working(&mut self) -> bool {
        if self.state != HedgeExecState::Working {
            return self.rejected(ExecEvent::TimeoutWorking);
        }
        self.transition(HedgeExecState::Reprice, ExecEvent::TimeoutWorking)
    }

    pub fn on_risk_trip(&mut self) -> bool {
        if self.state != HedgeExecState::Working {
            return self.rejected(ExecEvent::RiskTrip);
        }
        self.transition(HedgeExecState::Cancel, ExecEvent::RiskTrip)
    }

    pub fn on_manual_cancel(&mut self) -> bool {
        if self.state != HedgeExecState::Working {
            return self.rejected(ExecEvent::ManualCancel);
        }
        self.transition(HedgeExecState::Cancel, ExecEvent::ManualCancel)
    }

    /// Broker down: WAIT_ACK -> FAIL, WORKING -> CANCEL; in any other state
    /// only the connected flag drops (which already forces E3).
    pub fn on_broker_down(&mut self) -> bool {
        match self.state {
            HedgeExecState::WaitAck => self.transition(HedgeExecState::Fail, ExecEvent::BrokerDown),
            HedgeExecState::Working => {
                self.transition(HedgeExecState::Cancel, ExecEvent::BrokerDown)
            }
            _ => {
                self.connected = false;
                true
            }
        }
    }

    pub fn on_cancel_sent(&mut self) -> bool {
        if self.state != HedgeExecState::Cancel {
            return self.rejected(ExecEvent::CancelSent);
        }
        self.transition(HedgeExecState::Recover, ExecEvent::CancelSent)
    }

    /// Resync complete clears the target.
    pub fn on_positions_resynced(&mut self) -> bool {
        if self.state != HedgeExecState::Recover {
            return self.rejected(ExecEvent::PositionsResynced);
        }
        self.current_target = None;
        self.need_shares = 0;
        self.transition(HedgeExecState::ExecIdle, ExecEvent::PositionsResynced)
    }

    pub fn on_cannot_recover(&mut self) -> bool {
        if self.state != HedgeExecState::Recover {
            return self.rejected(ExecEvent::CannotRecover);
        }
        self.transition(HedgeExecState::Fail, ExecEvent::CannotRecover)
    }

    pub fn on_try_resync(&mut self) -> bool {
        if self.state != HedgeExecState::Fail {
            return self.rejected(ExecEvent::TryResync);
        }
        self.transition(HedgeExecState::Recover, ExecEvent::TryResync)
    }

    /// After PARTIAL: replan into SEND (top up the remainder) or give up.
    pub fn on_partial_replan(&mut self, send_order: bool) -> bool {
        if self.state != HedgeExecState::Partial {
            return self.rejected(if send_order {
                ExecEvent::PlanSend
            } else {
                ExecEvent::PlanSkip
            });
        }
        if send_order {
            self.transition(HedgeExecState::Send, ExecEvent::PlanSend)
        } else {
            self.current_target = None;
            self.need_shares = 0;
            self.transition(HedgeExecState::ExecIdle, ExecEvent::PlanSkip)
        }
    }
}
