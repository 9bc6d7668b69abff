// =============================================================================
// Gamma Scalper Strategy
// =============================================================================
//
// Target-position framing with target delta zero:
//
//   option_delta_shares = portfolio_delta - stock_shares
//   target_shares       = -option_delta_shares
//   need                = target_shares - stock_shares = -portfolio_delta
//
// A hedge intent is only produced when |need| clears the threshold, sized
// up to the per-order cap. `should_output_target` is the composite-state
// gate in front of intent generation; `apply_hedge_gates` is the final
// risk gate in front of the wire.
// =============================================================================

use crate::broker::OrderSide;
use crate::config::HedgeIntentConfig;
use crate::guards::ExecutionGuard;
use crate::state::{
    CompositeState, DeltaDeviationState, ExecutionState, LiquidityState, OptionPositionState,
    SystemHealthState,
};

/// Proposed hedge order: side and share quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HedgeOrder {
    pub side: OrderSide,
    pub quantity: i64,
}

/// A hedge order plus the target it steers toward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HedgeIntent {
    /// Absolute target stock position (signed shares).
    pub target_shares: i64,
    pub side: OrderSide,
    pub quantity: i64,
    /// Bypass the cooldown gate (set for D3 force hedges).
    pub force_hedge: bool,
}

/// Pure target/need derivation. Returns `(target_shares, need)`.
pub fn compute_target_and_need(portfolio_delta: f64, stock_shares: i64) -> (f64, f64) {
    let opt_delta_shares = portfolio_delta - stock_shares as f64;
    let target_shares = -opt_delta_shares;
    let need = target_shares - stock_shares as f64;
    (target_shares, need)
}

/// Hedge order from the current delta, or None when |need| is inside the
/// threshold. Quantity is clamped to `max_per_order`.
pub fn gamma_scalper_hedge(
    portfolio_delta: f64,
    stock_shares: i64,
    threshold_shares: f64,
    max_per_order: i64,
) -> Option<HedgeOrder> {
    let (_, need) = compute_target_and_need(portfolio_delta, stock_shares);
    if need > threshold_shares {
        let qty = (need.round() as i64).min(max_per_order);
        if qty <= 0 {
            return None;
        }
        return Some(HedgeOrder {
            side: OrderSide::Buy,
            quantity: qty,
        });
    }
    if need < -threshold_shares {
        let qty = ((-need).round() as i64).min(max_per_order);
        if qty <= 0 {
            return None;
        }
        return Some(HedgeOrder {
            side: OrderSide::Sell,
            quantity: qty,
        });
    }
    None
}

/// Full hedge intent: order plus target and force flag.
pub fn gamma_scalper_intent(
    portfolio_delta: f64,
    stock_shares: i64,
    intent_cfg: &HedgeIntentConfig,
    hedge_threshold_shares: f64,
    force_hedge: bool,
) -> Option<HedgeIntent> {
    let order = gamma_scalper_hedge(
        portfolio_delta,
        stock_shares,
        hedge_threshold_shares,
        intent_cfg.max_hedge_shares_per_order,
    )?;
    let (target_shares, _) = compute_target_and_need(portfolio_delta, stock_shares);
    Some(HedgeIntent {
        target_shares: target_shares.round() as i64,
        side: order.side,
        quantity: order.quantity,
        force_hedge,
    })
}

/// Composite-state gate in front of intent generation:
/// (O1 or O2) and (D2 or D3) and (L0 or L1) and E0 and S0.
pub fn should_output_target(cs: &CompositeState) -> bool {
    if matches!(cs.l, LiquidityState::ExtremeWide | LiquidityState::NoQuote) {
        return false;
    }
    if cs.s != SystemHealthState::Ok {
        return false;
    }
    if cs.e != ExecutionState::Idle {
        return false;
    }
    if !matches!(
        cs.o,
        OptionPositionState::LongGamma | OptionPositionState::ShortGamma
    ) {
        return false;
    }
    matches!(
        cs.d,
        DeltaDeviationState::HedgeNeeded | DeltaDeviationState::ForceHedge
    )
}

/// Final risk gate: minimum size plus the ExecutionGuard. D3 promotes the
/// intent to force (cooldown bypass). Returns the approved intent together
/// with the gate verdict ("ok" or the blocking reason).
#[allow(clippy::too_many_arguments)]
pub fn apply_hedge_gates(
    intent: HedgeIntent,
    cs: &CompositeState,
    guard: &ExecutionGuard,
    now_ts: f64,
    spot: Option<f64>,
    last_hedge_price: Option<f64>,
    spread_pct: Option<f64>,
    min_hedge_shares: i64,
) -> (Option<HedgeIntent>, &'static str) {
    if intent.quantity < min_hedge_shares {
        return (None, "below_min_hedge_shares");
    }
    let force = intent.force_hedge || cs.d == DeltaDeviationState::ForceHedge;
    let (allowed, reason) = guard.allow_hedge(
        now_ts,
        cs.stock_pos,
        intent.side,
        intent.quantity,
        Some(cs.net_delta),
        spot,
        last_hedge_price.or(cs.last_hedge_price),
        spread_pct.or(cs.spread_pct),
        force,
    );
    if !allowed {
        return (None, reason);
    }
    (
        Some(HedgeIntent {
            force_hedge: force,
            ..intent
        }),
        "ok",
    )
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EarningsConfig, RiskConfig};
    use crate::guards::GuardSettings;
    use crate::state::MarketRegimeState;

    fn cs(
        o: OptionPositionState,
        d: DeltaDeviationState,
        l: LiquidityState,
        e: ExecutionState,
        s: SystemHealthState,
    ) -> CompositeState {
        CompositeState {
            o,
            d,
            m: MarketRegimeState::Normal,
            l,
            e,
            s,
            net_delta: 50.0,
            option_delta: 50.0,
            stock_pos: 0,
            last_hedge_price: None,
            last_hedge_ts: None,
            spread_pct: Some(0.05),
            data_lag_ms: Some(100.0),
            greeks_valid: true,
            ts: 0.0,
        }
    }

    fn hedge_ready() -> CompositeState {
        cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::HedgeNeeded,
            LiquidityState::Normal,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )
    }

    #[test]
    fn target_and_need_roundtrip() {
        // need = -portfolio_delta and target + stock + need = 2 * target.
        for (delta, stock) in [(50.0, 0i64), (-120.0, 30), (0.0, 100), (75.5, -40)] {
            let (target, need) = compute_target_and_need(delta, stock);
            assert!((need + delta).abs() < 1e-9);
            assert!((target + stock as f64 + need - 2.0 * target).abs() < 1e-9);
        }
    }

    #[test]
    fn hedge_sides_and_threshold() {
        // delta +50: need -50 -> SELL 50.
        let order = gamma_scalper_hedge(50.0, 0, 25.0, 500).unwrap();
        assert_eq!(order.side, OrderSide::Sell);
        assert_eq!(order.quantity, 50);

        // delta -50: need +50 -> BUY 50.
        let order = gamma_scalper_hedge(-50.0, 0, 25.0, 500).unwrap();
        assert_eq!(order.side, OrderSide::Buy);
        assert_eq!(order.quantity, 50);

        // Inside the threshold: no hedge. Boundary is exclusive.
        assert!(gamma_scalper_hedge(25.0, 0, 25.0, 500).is_none());
        assert!(gamma_scalper_hedge(-25.0, 0, 25.0, 500).is_none());
        assert!(gamma_scalper_hedge(25.1, 0, 25.0, 500).is_some());
    }

    #[test]
    fn hedge_clamped_to_max_per_order() {
        let order = gamma_scalper_hedge(1200.0, 0, 25.0, 500).unwrap();
        assert_eq!(order.quantity, 500);
        assert_eq!(order.side, OrderSide::Sell);
    }

    #[test]
    fn stock_position_cancels_out_of_need() {
        // The portfolio delta already includes the stock leg, so a fully
        // hedged book nets to zero need.
        assert!(gamma_scalper_hedge(0.0, 50, 25.0, 500).is_none());
    }

    #[test]
    fn intent_carries_target_and_force() {
        let cfg = HedgeIntentConfig::default();
        let intent = gamma_scalper_intent(50.0, 0, &cfg, 25.0, false).unwrap();
        assert_eq!(intent.quantity, 50);
        assert_eq!(intent.side, OrderSide::Sell);
        // option delta = 50 - 0 = 50; target = -50.
        assert_eq!(intent.target_shares, -50);
        assert!(!intent.force_hedge);

        let intent = gamma_scalper_intent(600.0, 0, &cfg, 25.0, true).unwrap();
        assert!(intent.force_hedge);
        assert_eq!(intent.quantity, 500); // clamped

        assert!(gamma_scalper_intent(10.0, 0, &cfg, 25.0, false).is_none());
    }

    #[test]
    fn should_output_target_matrix() {
        assert!(should_output_target(&hedge_ready()));
        assert!(should_output_target(&cs(
            OptionPositionState::ShortGamma,
            DeltaDeviationState::ForceHedge,
            LiquidityState::Wide,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )));

        // Each failing dimension kills the gate.
        assert!(!should_output_target(&cs(
            OptionPositionState::None,
            DeltaDeviationState::HedgeNeeded,
            LiquidityState::Normal,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )));
        assert!(!should_output_target(&cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::Minor,
            LiquidityState::Normal,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )));
        assert!(!should_output_target(&cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::InBand,
            LiquidityState::Normal,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )));
        assert!(!should_output_target(&cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::HedgeNeeded,
            LiquidityState::ExtremeWide,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )));
        assert!(!should_output_target(&cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::HedgeNeeded,
            LiquidityState::NoQuote,
            ExecutionState::Idle,
            SystemHealthState::Ok,
        )));
        assert!(!should_output_target(&cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::HedgeNeeded,
            LiquidityState::Normal,
            ExecutionState::OrderWorking,
            SystemHealthState::Ok,
        )));
        assert!(!should_output_target(&cs(
            OptionPositionState::LongGamma,
            DeltaDeviationState::HedgeNeeded,
            LiquidityState::Normal,
            ExecutionState::Idle,
            SystemHealthState::DataLag,
        )));
    }

    fn guard_no_rth() -> ExecutionGuard {
        let risk = RiskConfig {
            trading_hours_only: false,
            ..RiskConfig::default()
        };
        ExecutionGuard::new(GuardSettings::from_config(
            &HedgeIntentConfig::default(),
            &risk,
            &EarningsConfig::default(),
        ))
    }

    #[test]
    fn gates_min_size_first() {
        let guard = guard_no_rth();
        let intent = HedgeIntent {
            target_shares: -5,
            side: OrderSide::Sell,
            quantity: 5,
            force_hedge: false,
        };
        let (approved, reason) =
            apply_hedge_gates(intent, &hedge_ready(), &guard, 0.0, Some(100.0), None, None, 10);
        assert!(approved.is_none());
        assert_eq!(reason, "below_min_hedge_shares");
    }

    #[test]
    fn gates_pass_and_cooldown_block() {
        let guard = guard_no_rth();
        let intent = HedgeIntent {
            target_shares: -50,
            side: OrderSide::Sell,
            quantity: 50,
            force_hedge: false,
        };
        let now = 1_700_000_000.0;
        let (approved, reason) =
            apply_hedge_gates(intent, &hedge_ready(), &guard, now, Some(100.0), None, None, 10);
        assert_eq!(reason, "ok");
        assert!(approved.is_some());

        // A hedge 10 seconds ago with a 60 s cooldown blocks the next one.
        guard.record_hedge_sent(now - 10.0);
        let (approved, reason) =
            apply_hedge_gates(intent, &hedge_ready(), &guard, now, Some(100.0), None, None, 10);
        assert!(approved.is_none());
        assert_eq!(reason, "cooldown");
    }

    #[test]
    fn force_hedge_bypasses_cooldown_via_d3() {
        let guard = guard_no_rth();
        let now = 1_700_000_000.0;
        guard.record_hedge_sent(now - 10.0);

        let mut state = hedge_ready();
        state.d = DeltaDeviationState::ForceHedge;
        state.net_delta = 600.0;

        let intent = HedgeIntent {
            target_shares: -600,
            side: OrderSide::Sell,
            quantity: 500,
            force_hedge: false,
        };
        let (approved, reason) =
            apply_hedge_gates(intent, &state, &guard, now, Some(100.0), None, None, 10);
        assert_eq!(reason, "ok");
        assert!(approved.unwrap().force_hedge);

        // Max position still enforced under force.
        let mut state = state;
        state.stock_pos = 1800;
        let intent = HedgeIntent {
            target_shares: 2400,
            side: OrderSide::Buy,
            quantity: 500,
            force_hedge: true,
        };
        let (approved, reason) =
            apply_hedge_gates(intent, &state, &guard, now, Some(100.0), None, None, 10);
        assert!(approved.is_none());
        assert_eq!(reason, "max_position");
    }
}
