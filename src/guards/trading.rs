// =============================================================================
// Trading Guard
// =============================================================================
//
// Pure predicates over a StateSnapshot, used by the Trading FSM to decide
// transitions. The guard borrows the snapshot and resolved config; nothing
// here mutates state. `eval_all` bundles every predicate into a GuardReport
// so one evaluation feeds a whole transition and the transition log.
// =============================================================================

use crate::config::{HedgeIntentConfig, RiskConfig, StateGates};
use crate::guards::execution::ExecutionGuard;
use crate::state::{
    ExecutionState, LiquidityState, OptionPositionState, StateSnapshot, SystemHealthState,
    GREEKS_SANITY_LIMIT,
};

/// All guard verdicts for one snapshot, evaluated once per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardReport {
    pub data_ok: bool,
    pub data_stale: bool,
    pub greeks_bad: bool,
    pub broker_down: bool,
    pub broker_up: bool,
    pub have_option_position: bool,
    pub delta_band_ready: bool,
    pub in_no_trade_band: bool,
    pub out_of_band: bool,
    pub cost_ok: bool,
    pub liquidity_ok: bool,
    pub retry_allowed: bool,
    pub exec_fault: bool,
    pub positions_ok: bool,
    pub strategy_enabled: bool,
}

/// Predicate view over one snapshot.
pub struct TradingGuard<'a> {
    snapshot: &'a StateSnapshot,
    gates: &'a StateGates,
    risk: &'a RiskConfig,
    intent: &'a HedgeIntentConfig,
    strategy_enabled: bool,
    execution_guard: Option<&'a ExecutionGuard>,
}

impl<'a> TradingGuard<'a> {
    pub fn new(
        snapshot: &'a StateSnapshot,
        gates: &'a StateGates,
        risk: &'a RiskConfig,
        intent: &'a HedgeIntentConfig,
        strategy_enabled: bool,
        execution_guard: Option<&'a ExecutionGuard>,
    ) -> Self {
        Self {
            snapshot,
            gates,
            risk,
            intent,
            strategy_enabled,
            execution_guard,
        }
    }

    /// Event lag within threshold, spot positive, and a quote exists.
    pub fn is_data_ok(&self) -> bool {
        if let Some(lag) = self.snapshot.event_lag_ms {
            if lag > self.gates.system.data_lag_threshold_ms {
                return false;
            }
        }
        if self.snapshot.l == LiquidityState::NoQuote {
            return false;
        }
        match self.snapshot.spot {
            Some(spot) if spot > 0.0 => true,
            _ => false,
        }
    }

    pub fn is_data_stale(&self) -> bool {
        !self.is_data_ok()
    }

    /// Greeks missing, invalid, non-finite, or pathologically large.
    pub fn is_greeks_bad(&self) -> bool {
        let Some(g) = self.snapshot.greeks.as_ref() else {
            return true;
        };
        if !g.valid || !g.is_finite() {
            return true;
        }
        g.delta.abs() > GREEKS_SANITY_LIMIT || g.gamma.abs() > GREEKS_SANITY_LIMIT
    }

    pub fn is_greeks_ok(&self) -> bool {
        !self.is_greeks_bad()
    }

    pub fn is_broker_down(&self) -> bool {
        matches!(
            self.snapshot.e,
            ExecutionState::Disconnected | ExecutionState::BrokerError
        )
    }

    pub fn is_broker_up(&self) -> bool {
        !self.is_broker_down()
    }

    pub fn is_option_position(&self) -> bool {
        matches!(
            self.snapshot.o,
            OptionPositionState::LongGamma | OptionPositionState::ShortGamma
        )
    }

    pub fn is_no_option_position(&self) -> bool {
        self.snapshot.o == OptionPositionState::None
    }

    /// Greeks valid and the delta thresholds are coherent.
    pub fn is_delta_band_ready(&self) -> bool {
        if !self.snapshot.greeks_valid() {
            return false;
        }
        let d = &self.gates.delta;
        d.epsilon_band.is_finite()
            && d.hedge_threshold.is_finite()
            && d.hedge_threshold >= d.epsilon_band
    }

    /// |net_delta| inside the epsilon band.
    pub fn is_in_no_trade_band(&self) -> bool {
        self.snapshot.net_delta.abs() <= self.gates.delta.epsilon_band
    }

    pub fn is_out_of_band(&self) -> bool {
        !self.is_in_no_trade_band()
    }

    /// Spread not extreme, and (when configured) the price has moved enough
    /// since the last hedge to be worth paying the spread again.
    pub fn is_cost_ok(&self) -> bool {
        if let Some(spread) = self.snapshot.spread_pct {
            if spread >= self.gates.liquidity.extreme_spread_pct {
                return false;
            }
        }
        let move_pct = self.intent.min_price_move_pct;
        if move_pct <= 0.0 {
            return true;
        }
        let (Some(last), Some(spot)) = (self.snapshot.last_hedge_price, self.snapshot.spot) else {
            return true;
        };
        if last <= 0.0 {
            return true;
        }
        100.0 * (spot - last).abs() / last >= move_pct
    }

    /// Quote exists, spread below extreme, and within the risk cap.
    pub fn is_liquidity_ok(&self) -> bool {
        if matches!(
            self.snapshot.l,
            LiquidityState::NoQuote | LiquidityState::ExtremeWide
        ) {
            return false;
        }
        if let (Some(max), Some(spread)) = (self.risk.max_spread_pct, self.snapshot.spread_pct) {
            if spread > max {
                return false;
            }
        }
        true
    }

    /// Daily hedge budget not exhausted.
    pub fn is_retry_allowed(&self) -> bool {
        match self.execution_guard {
            Some(g) => g.daily_hedge_count() < g.max_daily_hedge_count(),
            None => true,
        }
    }

    pub fn is_exec_fault(&self) -> bool {
        matches!(
            self.snapshot.e,
            ExecutionState::Disconnected | ExecutionState::BrokerError
        )
    }

    /// Position view coherent: data fresh and no risk halt.
    pub fn is_positions_ok(&self) -> bool {
        self.is_data_ok() && self.snapshot.s != SystemHealthState::RiskHalt
    }

    pub fn is_strategy_enabled(&self) -> bool {
        self.strategy_enabled
    }

    /// Evaluate everything once.
    pub fn eval_all(&self) -> GuardReport {
        GuardReport {
            data_ok: self.is_data_ok(),
            data_stale: self.is_data_stale(),
            greeks_bad: self.is_greeks_bad(),
            broker_down: self.is_broker_down(),
            broker_up: self.is_broker_up(),
            have_option_position: self.is_option_position(),
            delta_band_ready: self.is_delta_band_ready(),
            in_no_trade_band: self.is_in_no_trade_band(),
            out_of_band: self.is_out_of_band(),
            cost_ok: self.is_cost_ok(),
            liquidity_ok: self.is_liquidity_ok(),
            retry_allowed: self.is_retry_allowed(),
            exec_fault: self.is_exec_fault(),
            positions_ok: self.is_positions_ok(),
            strategy_enabled: self.is_strategy_enabled(),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{DeltaDeviationState, GreeksSnapshot};

    fn gates() -> StateGates {
        StateGates::default()
    }

    fn risk() -> RiskConfig {
        RiskConfig::default()
    }

    fn intent() -> HedgeIntentConfig {
        HedgeIntentConfig::default()
    }

    /// A healthy snapshot: fresh quote, valid greeks, long gamma.
    fn healthy() -> StateSnapshot {
        StateSnapshot::safe_default(1_700_000_000.0)
            .with_spot(Some(100.0))
            .with_spread_pct(Some(0.05))
            .with_event_lag_ms(Some(200.0))
            .with_liquidity(LiquidityState::Normal)
            .with_option_state(OptionPositionState::LongGamma)
            .with_greeks(Some(GreeksSnapshot::new(50.0, 0.02, true)))
            .with_net_delta(50.0)
            .with_delta_state(DeltaDeviationState::HedgeNeeded)
    }

    fn report(snapshot: &StateSnapshot) -> GuardReport {
        let g = gates();
        let r = risk();
        let i = intent();
        TradingGuard::new(snapshot, &g, &r, &i, true, None).eval_all()
    }

    #[test]
    fn healthy_snapshot_passes_core_guards() {
        let rep = report(&healthy());
        assert!(rep.data_ok);
        assert!(!rep.greeks_bad);
        assert!(rep.broker_up);
        assert!(rep.have_option_position);
        assert!(rep.delta_band_ready);
        assert!(rep.out_of_band);
        assert!(rep.cost_ok);
        assert!(rep.liquidity_ok);
        assert!(rep.positions_ok);
        assert!(rep.strategy_enabled);
        assert!(!rep.exec_fault);
    }

    #[test]
    fn data_ok_requires_fresh_quote_and_spot() {
        let rep = report(&healthy().with_event_lag_ms(Some(5000.0)));
        assert!(rep.data_stale);

        let rep = report(&healthy().with_liquidity(LiquidityState::NoQuote));
        assert!(rep.data_stale);

        let rep = report(&healthy().with_spot(None));
        assert!(rep.data_stale);

        let rep = report(&healthy().with_spot(Some(0.0)));
        assert!(rep.data_stale);
    }

    #[test]
    fn greeks_bad_on_nan_or_extreme() {
        let rep = report(&healthy().with_greeks(Some(GreeksSnapshot::new(f64::NAN, 0.0, true))));
        assert!(rep.greeks_bad);

        let rep = report(&healthy().with_greeks(Some(GreeksSnapshot::new(2e6, 0.0, true))));
        assert!(rep.greeks_bad);

        let rep = report(&healthy().with_greeks(None));
        assert!(rep.greeks_bad);
    }

    #[test]
    fn broker_down_and_exec_fault_track_e() {
        let rep = report(&healthy().with_execution(ExecutionState::Disconnected));
        assert!(rep.broker_down);
        assert!(rep.exec_fault);

        let rep = report(&healthy().with_execution(ExecutionState::BrokerError));
        assert!(rep.broker_down);

        let rep = report(&healthy().with_execution(ExecutionState::OrderWorking));
        assert!(rep.broker_up);
        assert!(!rep.exec_fault);
    }

    #[test]
    fn no_trade_band_boundary_inclusive() {
        // epsilon default 10.
        let rep = report(&healthy().with_net_delta(10.0));
        assert!(rep.in_no_trade_band);
        let rep = report(&healthy().with_net_delta(-10.0));
        assert!(rep.in_no_trade_band);
        let rep = report(&healthy().with_net_delta(10.01));
        assert!(rep.out_of_band);
    }

    #[test]
    fn cost_ok_spread_and_price_move() {
        // Extreme spread fails the cost gate.
        let rep = report(&healthy().with_spread_pct(Some(0.5)));
        assert!(!rep.cost_ok);

        // Price-move requirement: 0.5% configured, only 0.1% moved.
        let snap = healthy().with_last_hedge(Some(1_700_000_000.0), Some(100.0)).with_spot(Some(100.1));
        let g = gates();
        let r = risk();
        let i = HedgeIntentConfig {
            min_price_move_pct: 0.5,
            ..intent()
        };
        let guard = TradingGuard::new(&snap, &g, &r, &i, true, None);
        assert!(!guard.is_cost_ok());

        // No prior hedge price: gate open.
        let snap = healthy().with_spot(Some(100.1));
        let guard = TradingGuard::new(&snap, &g, &r, &i, true, None);
        assert!(guard.is_cost_ok());
    }

    #[test]
    fn liquidity_ok_rules() {
        let rep = report(&healthy().with_liquidity(LiquidityState::ExtremeWide));
        assert!(!rep.liquidity_ok);
        let rep = report(&healthy().with_liquidity(LiquidityState::NoQuote));
        assert!(!rep.liquidity_ok);
        let rep = report(&healthy().with_liquidity(LiquidityState::Wide));
        assert!(rep.liquidity_ok);

        // max_spread_pct cap from risk config.
        let snap = healthy().with_spread_pct(Some(0.3));
        let g = gates();
        let r = RiskConfig {
            max_spread_pct: Some(0.2),
            ..risk()
        };
        let i = intent();
        let guard = TradingGuard::new(&snap, &g, &r, &i, true, None);
        assert!(!guard.is_liquidity_ok());
    }

    #[test]
    fn retry_allowed_tracks_execution_guard() {
        use crate::config::EarningsConfig;
        use crate::guards::execution::GuardSettings;

        let snap = healthy();
        let g = gates();
        let r = risk();
        let i = intent();
        let exec = ExecutionGuard::new(GuardSettings::from_config(
            &i,
            &r,
            &EarningsConfig::default(),
        ));
        let guard = TradingGuard::new(&snap, &g, &r, &i, true, Some(&exec));
        assert!(guard.is_retry_allowed());
        exec.set_daily_hedge_count(r.max_daily_hedge_count, None);
        assert!(!guard.is_retry_allowed());
    }

    #[test]
    fn positions_ok_fails_on_risk_halt() {
        let rep = report(&healthy().with_system(SystemHealthState::RiskHalt));
        assert!(!rep.positions_ok);
    }

    #[test]
    fn delta_band_ready_needs_valid_greeks() {
        let rep = report(&healthy().with_greeks(None));
        assert!(!rep.delta_band_ready);
        let rep = report(&healthy());
        assert!(rep.delta_band_ready);
    }
}
