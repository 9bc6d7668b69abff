// =============================================================================
// Trading FSM
// =============================================================================
//
// Macro state machine gating when the strategy may emit a TargetPosition:
//
//   BOOT -> SYNC -> IDLE -> ARMED -> MONITOR -> {NO_TRADE, NEED_HEDGE,
//   PAUSE_COST, PAUSE_LIQ} -> HEDGING -> back to MONITOR, with SAFE as the
//   global refuge.
//
// Every event is evaluated against a fresh GuardReport. The global override
// runs first: broker down, stale data, bad greeks or an execution fault
// sends any state to SAFE. `transition` computes the next state without
// mutating; `apply_transition` commits it.
// =============================================================================

use tracing::debug;

use crate::fsm::events::TradingEvent;
use crate::guards::GuardReport;

/// Macro trading states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradingState {
    Boot,
    Sync,
    Idle,
    Armed,
    Monitor,
    NoTrade,
    NeedHedge,
    Hedging,
    PauseCost,
    PauseLiq,
    Safe,
}

impl TradingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Boot => "BOOT",
            Self::Sync => "SYNC",
            Self::Idle => "IDLE",
            Self::Armed => "ARMED",
            Self::Monitor => "MONITOR",
            Self::NoTrade => "NO_TRADE",
            Self::NeedHedge => "NEED_HEDGE",
            Self::Hedging => "HEDGING",
            Self::PauseCost => "PAUSE_COST",
            Self::PauseLiq => "PAUSE_LIQ",
            Self::Safe => "SAFE",
        }
    }
}

impl std::fmt::Display for TradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The macro FSM.
pub struct TradingFsm {
    state: TradingState,
}

impl Default for TradingFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingFsm {
    pub fn new() -> Self {
        Self {
            state: TradingState::Boot,
        }
    }

    pub fn state(&self) -> TradingState {
        self.state
    }

    /// Force a state (restart recovery only).
    pub fn set_state(&mut self, state: TradingState) {
        self.state = state;
    }

    /// Compute the next state for `event` under `guards`, or None when no
    /// transition applies. Does not mutate; commit with [`apply_transition`].
    ///
    /// [`apply_transition`]: TradingFsm::apply_transition
    pub fn transition(&self, event: TradingEvent, g: &GuardReport) -> Option<TradingState> {
        let s = self.state;

        // Global override: any fault routes to SAFE.
        if g.broker_down || g.data_stale || g.greeks_bad || g.exec_fault {
            return if s != TradingState::Safe {
                Some(TradingState::Safe)
            } else {
                None
            };
        }

        if event == TradingEvent::Shutdown {
            // The daemon FSM owns shutdown; no trading transition.
            return None;
        }

        if event == TradingEvent::Start && s == TradingState::Boot {
            return Some(TradingState::Sync);
        }

        if event.is_progress() {
            return match s {
                TradingState::Sync => Self::handle_sync(g),
                TradingState::Idle => Self::handle_idle(g),
                TradingState::Armed => Self::handle_armed(g),
                TradingState::Monitor => Self::handle_monitor(g),
                TradingState::NoTrade => Self::handle_no_trade(g),
                TradingState::PauseCost | TradingState::PauseLiq => Self::handle_pause(g),
                _ => None,
            };
        }

        match (event, s) {
            (TradingEvent::TargetEmitted, TradingState::NeedHedge) => Some(TradingState::Hedging),
            (TradingEvent::HedgeDone, TradingState::Hedging) => Some(TradingState::Monitor),
            (TradingEvent::HedgeFailed, TradingState::Hedging) => {
                if g.retry_allowed {
                    Some(TradingState::NeedHedge)
                } else {
                    Some(TradingState::Safe)
                }
            }
            (TradingEvent::ManualResume, TradingState::Safe) => {
                if g.broker_up && g.data_ok {
                    Some(TradingState::Sync)
                } else {
                    None
                }
            }
            (TradingEvent::BrokerUp, TradingState::Safe) => {
                if g.data_ok {
                    Some(TradingState::Sync)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Compute and commit. Returns true when a transition fired.
    pub fn apply_transition(&mut self, event: TradingEvent, g: &GuardReport) -> bool {
        match self.transition(event, g) {
            Some(next) => {
                debug!(
                    from = %self.state,
                    to = %next,
                    event = %event,
                    data_ok = g.data_ok,
                    broker_down = g.broker_down,
                    in_band = g.in_no_trade_band,
                    cost_ok = g.cost_ok,
                    liquidity_ok = g.liquidity_ok,
                    "trading fsm transition"
                );
                self.state = next;
                true
            }
            None => false,
        }
    }

    // ── Per-state progress handlers ─────────────────────────────────────

    fn handle_sync(g: &GuardReport) -> Option<TradingState> {
        if g.positions_ok && g.data_ok {
            return Some(TradingState::Idle);
        }
        if !g.data_ok || g.broker_down {
            return Some(TradingState::Safe);
        }
        None
    }

    fn handle_idle(g: &GuardReport) -> Option<TradingState> {
        if g.data_stale || g.greeks_bad || g.broker_down {
            return Some(TradingState::Safe);
        }
        if g.have_option_position && g.strategy_enabled {
            return Some(TradingState::Armed);
        }
        None
    }

    fn handle_armed(g: &GuardReport) -> Option<TradingState> {
        if g.delta_band_ready {
            return Some(TradingState::Monitor);
        }
        None
    }

    fn handle_monitor(g: &GuardReport) -> Option<TradingState> {
        if g.in_no_trade_band {
            return Some(TradingState::NoTrade);
        }
        Self::out_of_band_branch(g)
    }

    fn handle_no_trade(g: &GuardReport) -> Option<TradingState> {
        Self::out_of_band_branch(g)
    }

    fn handle_pause(g: &GuardReport) -> Option<TradingState> {
        if g.in_no_trade_band {
            return Some(TradingState::NoTrade);
        }
        if g.out_of_band && g.cost_ok && g.liquidity_ok {
            return Some(TradingState::NeedHedge);
        }
        None
    }

    fn out_of_band_branch(g: &GuardReport) -> Option<TradingState> {
        if g.out_of_band && g.cost_ok && g.liquidity_ok {
            return Some(TradingState::NeedHedge);
        }
        if g.out_of_band && !g.cost_ok {
            return Some(TradingState::PauseCost);
        }
        if g.out_of_band && !g.liquidity_ok {
            return Some(TradingState::PauseLiq);
        }
        None
    }
}
