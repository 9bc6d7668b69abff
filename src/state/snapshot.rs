// =============================================================================
// Immutable State Snapshots
// =============================================================================
//
// GreeksSnapshot, CompositeState and StateSnapshot are pure value types. A
// snapshot is never mutated in place; overriding a field produces a new value
// via the `with_*` builders. Guards and the Trading FSM only ever see a
// snapshot, never live runtime objects.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::state::enums::{
    DeltaDeviationState, ExecutionState, LiquidityState, MarketRegimeState, OptionPositionState,
    SystemHealthState,
};

/// Greeks values considered pathological beyond this magnitude (share terms).
pub const GREEKS_SANITY_LIMIT: f64 = 1e6;

// ---------------------------------------------------------------------------
// GreeksSnapshot
// ---------------------------------------------------------------------------

/// Immutable snapshot of portfolio greeks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GreeksSnapshot {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    /// True only when the computation succeeded on a positive spot.
    pub valid: bool,
}

impl GreeksSnapshot {
    pub fn new(delta: f64, gamma: f64, valid: bool) -> Self {
        Self {
            delta,
            gamma,
            theta: 0.0,
            vega: 0.0,
            valid,
        }
    }

    /// All four fields finite.
    pub fn is_finite(&self) -> bool {
        self.delta.is_finite()
            && self.gamma.is_finite()
            && self.theta.is_finite()
            && self.vega.is_finite()
    }

    /// Valid, finite, and within the sanity limit on |delta| and |gamma|.
    pub fn is_usable(&self) -> bool {
        self.valid
            && self.is_finite()
            && self.delta.abs() <= GREEKS_SANITY_LIMIT
            && self.gamma.abs() <= GREEKS_SANITY_LIMIT
    }
}

// ---------------------------------------------------------------------------
// CompositeState
// ---------------------------------------------------------------------------

/// The six state letters plus the numeric values they were classified from.
/// Produced by [`crate::state::classifier::StateClassifier::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CompositeState {
    pub o: OptionPositionState,
    pub d: DeltaDeviationState,
    pub m: MarketRegimeState,
    pub l: LiquidityState,
    pub e: ExecutionState,
    pub s: SystemHealthState,
    /// Total portfolio delta in share equivalent.
    pub net_delta: f64,
    /// Option contribution in shares (net_delta minus stock).
    pub option_delta: f64,
    pub stock_pos: i64,
    pub last_hedge_price: Option<f64>,
    pub last_hedge_ts: Option<f64>,
    /// Bid-ask spread as a percent of mid.
    pub spread_pct: Option<f64>,
    pub data_lag_ms: Option<f64>,
    pub greeks_valid: bool,
    /// Unix seconds when classified.
    pub ts: f64,
}

impl CompositeState {
    /// Compact tag string for logging, e.g. "O1 D2 M1 L0 E0 S0".
    pub fn letters(&self) -> String {
        format!(
            "{} {} {} {} {} {}",
            self.o, self.d, self.m, self.l, self.e, self.s
        )
    }
}

// ---------------------------------------------------------------------------
// StateSnapshot
// ---------------------------------------------------------------------------

/// Immutable world view consumed by the trading guards and the Trading FSM.
///
/// Built from a [`CompositeState`] plus the raw inputs the guards need
/// (greeks, spot, cost parameters). `spread()` and `data_lag_ms()` are kept
/// as accessor aliases of `spread_pct` / `event_lag_ms` for call sites that
/// predate the rename.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub o: OptionPositionState,
    pub d: DeltaDeviationState,
    pub m: MarketRegimeState,
    pub l: LiquidityState,
    pub e: ExecutionState,
    pub s: SystemHealthState,
    pub net_delta: f64,
    pub option_delta: f64,
    pub stock_pos: i64,
    pub spot: Option<f64>,
    pub spread_pct: Option<f64>,
    pub event_lag_ms: Option<f64>,
    pub greeks: Option<GreeksSnapshot>,
    pub option_legs_count: usize,
    pub last_hedge_ts: Option<f64>,
    pub last_hedge_price: Option<f64>,
    pub ts: f64,
}

impl StateSnapshot {
    /// Build a snapshot from a composite state plus raw guard inputs.
    pub fn from_composite(
        cs: &CompositeState,
        spot: Option<f64>,
        greeks: Option<GreeksSnapshot>,
        option_legs_count: usize,
    ) -> Self {
        Self {
            o: cs.o,
            d: cs.d,
            m: cs.m,
            l: cs.l,
            e: cs.e,
            s: cs.s,
            net_delta: cs.net_delta,
            option_delta: cs.option_delta,
            stock_pos: cs.stock_pos,
            spot,
            spread_pct: cs.spread_pct,
            event_lag_ms: cs.data_lag_ms,
            greeks,
            option_legs_count,
            last_hedge_ts: cs.last_hedge_ts,
            last_hedge_price: cs.last_hedge_price,
            ts: cs.ts,
        }
    }

    /// Safe default: no position, no quote, broker idle.
    pub fn safe_default(ts: f64) -> Self {
        Self {
            o: OptionPositionState::None,
            d: DeltaDeviationState::InBand,
            m: MarketRegimeState::Normal,
            l: LiquidityState::NoQuote,
            e: ExecutionState::Idle,
            s: SystemHealthState::Ok,
            net_delta: 0.0,
            option_delta: 0.0,
            stock_pos: 0,
            spot: None,
            spread_pct: None,
            event_lag_ms: None,
            greeks: None,
            option_legs_count: 0,
            last_hedge_ts: None,
            last_hedge_price: None,
            ts,
        }
    }

    /// Alias of `spread_pct`.
    pub fn spread(&self) -> Option<f64> {
        self.spread_pct
    }

    /// Alias of `event_lag_ms`.
    pub fn data_lag_ms(&self) -> Option<f64> {
        self.event_lag_ms
    }

    /// True when greeks are present, flagged valid, and finite.
    pub fn greeks_valid(&self) -> bool {
        self.greeks
            .as_ref()
            .map(|g| g.valid && g.is_finite())
            .unwrap_or(false)
    }

    // ── Pure field overrides (each returns a new snapshot) ──────────────

    pub fn with_net_delta(&self, net_delta: f64) -> Self {
        Self { net_delta, ..self.clone() }
    }

    pub fn with_stock_pos(&self, stock_pos: i64) -> Self {
        Self { stock_pos, ..self.clone() }
    }

    pub fn with_spot(&self, spot: Option<f64>) -> Self {
        Self { spot, ..self.clone() }
    }

    pub fn with_spread_pct(&self, spread_pct: Option<f64>) -> Self {
        Self { spread_pct, ..self.clone() }
    }

    pub fn with_event_lag_ms(&self, event_lag_ms: Option<f64>) -> Self {
        Self { event_lag_ms, ..self.clone() }
    }

    pub fn with_greeks(&self, greeks: Option<GreeksSnapshot>) -> Self {
        Self { greeks, ..self.clone() }
    }

    pub fn with_execution(&self, e: ExecutionState) -> Self {
        Self { e, ..self.clone() }
    }

    pub fn with_delta_state(&self, d: DeltaDeviationState) -> Self {
        Self { d, ..self.clone() }
    }

    pub fn with_liquidity(&self, l: LiquidityState) -> Self {
        Self { l, ..self.clone() }
    }

    pub fn with_system(&self, s: SystemHealthState) -> Self {
        Self { s, ..self.clone() }
    }

    pub fn with_option_state(&self, o: OptionPositionState) -> Self {
        Self { o, ..self.clone() }
    }

    pub fn with_last_hedge(&self, ts: Option<f64>, price: Option<f64>) -> Self {
        Self {
            last_hedge_ts: ts,
            last_hedge_price: price,
            ..self.clone()
        }
    }

    pub fn with_ts(&self, ts: f64) -> Self {
        Self { ts, ..self.clone() }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StateSnapshot {
        StateSnapshot::safe_default(1_700_000_000.0)
    }

    #[test]
    fn with_builders_do_not_mutate_original() {
        let snap = base();
        let updated = snap.with_net_delta(42.0).with_stock_pos(-10);
        assert_eq!(snap.net_delta, 0.0);
        assert_eq!(snap.stock_pos, 0);
        assert_eq!(updated.net_delta, 42.0);
        assert_eq!(updated.stock_pos, -10);
    }

    #[test]
    fn greeks_valid_requires_finite() {
        let snap = base().with_greeks(Some(GreeksSnapshot::new(f64::NAN, 0.1, true)));
        assert!(!snap.greeks_valid());

        let snap = base().with_greeks(Some(GreeksSnapshot::new(12.0, 0.1, true)));
        assert!(snap.greeks_valid());

        let snap = base().with_greeks(Some(GreeksSnapshot::new(12.0, 0.1, false)));
        assert!(!snap.greeks_valid());

        assert!(!base().greeks_valid());
    }

    #[test]
    fn greeks_usable_enforces_sanity_limit() {
        let g = GreeksSnapshot::new(2e6, 0.0, true);
        assert!(g.is_finite());
        assert!(!g.is_usable());

        let g = GreeksSnapshot::new(100.0, 0.02, true);
        assert!(g.is_usable());
    }

    #[test]
    fn aliases_track_fields() {
        let snap = base()
            .with_spread_pct(Some(0.07))
            .with_event_lag_ms(Some(450.0));
        assert_eq!(snap.spread(), Some(0.07));
        assert_eq!(snap.data_lag_ms(), Some(450.0));
    }
}
