// =============================================================================
// State Classifier
// =============================================================================
//
// Pure function mapping raw runtime inputs onto the six discrete state
// letters. Classification order within each dimension is priority-based
// (first match wins), mirroring the thresholds in `gates.state.*`:
//
//   O: greeks invalid or no legs -> O0; gamma > 0 -> O1; gamma < 0 -> O2
//   D: invalid -> D4; |nd| <= eps -> D0; |nd| >= max -> D3; |nd| >= hedge -> D2; else D1
//   M: stale tick -> M5; else variance/slope over a short price history
//   L: no quote -> L3; spread >= extreme -> L2; >= wide -> L1; else L0
//   E: delegated to the Hedge Execution FSM mapping
//   S: risk halt -> S3; greeks bad -> S1; lag over threshold -> S2; else S0
//
// The function is total and has no side effects; all thresholds come from
// the caller's configuration.
// =============================================================================

use crate::config::StateGates;
use crate::state::enums::{
    DeltaDeviationState, ExecutionState, LiquidityState, MarketRegimeState, OptionPositionState,
    SystemHealthState,
};
use crate::state::snapshot::{CompositeState, GreeksSnapshot};

// ---------------------------------------------------------------------------
// Raw inputs
// ---------------------------------------------------------------------------

/// Position view consumed by the classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct PositionInputs {
    /// Signed net shares of the underlying.
    pub stock_shares: i64,
    /// Number of option legs surviving the DTE / ATM filter.
    pub option_legs: usize,
}

/// Market view consumed by the classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketInputs {
    /// Bid-ask spread as a percent of mid; None when no two-sided quote.
    pub spread_pct: Option<f64>,
    /// Unix seconds of the most recent tick, if any.
    pub last_tick_ts: Option<f64>,
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

pub struct StateClassifier;

impl StateClassifier {
    /// Produce a [`CompositeState`] from raw runtime inputs.
    ///
    /// `execution_e` comes from the Hedge Execution FSM's effective mapping;
    /// `price_history` is an optional short window of recent mids (oldest
    /// first) used for the M dimension; `now_ts` is unix seconds.
    #[allow(clippy::too_many_arguments)]
    pub fn classify(
        positions: PositionInputs,
        market: MarketInputs,
        greeks: &GreeksSnapshot,
        execution_e: ExecutionState,
        last_hedge_price: Option<f64>,
        last_hedge_ts: Option<f64>,
        data_lag_ms: Option<f64>,
        risk_halt: bool,
        gates: &StateGates,
        price_history: Option<&[f64]>,
        now_ts: f64,
    ) -> CompositeState {
        let greeks_valid = greeks.valid && greeks.is_finite();
        let net_delta = greeks.delta;
        let option_delta = net_delta - positions.stock_shares as f64;

        let o = Self::classify_o(greeks, greeks_valid, positions.option_legs);
        let d = Self::classify_d(net_delta, greeks_valid, gates);
        let m = Self::classify_m(market, gates, price_history, now_ts);
        let l = Self::classify_l(market, gates);
        let s = Self::classify_s(greeks_valid, data_lag_ms, risk_halt, gates);

        // Derive the lag from the tick timestamp when the caller did not.
        let data_lag_ms = data_lag_ms.or_else(|| {
            market
                .last_tick_ts
                .map(|last| (now_ts - last).max(0.0) * 1000.0)
        });

        CompositeState {
            o,
            d,
            m,
            l,
            e: execution_e,
            s,
            net_delta,
            option_delta,
            stock_pos: positions.stock_shares,
            last_hedge_price,
            last_hedge_ts,
            spread_pct: market.spread_pct,
            data_lag_ms,
            greeks_valid,
            ts: now_ts,
        }
    }

    fn classify_o(
        greeks: &GreeksSnapshot,
        greeks_valid: bool,
        option_legs: usize,
    ) -> OptionPositionState {
        if !greeks_valid || option_legs == 0 {
            return OptionPositionState::None;
        }
        if greeks.gamma > 0.0 {
            OptionPositionState::LongGamma
        } else if greeks.gamma < 0.0 {
            OptionPositionState::ShortGamma
        } else {
            OptionPositionState::None
        }
    }

    fn classify_d(net_delta: f64, greeks_valid: bool, gates: &StateGates) -> DeltaDeviationState {
        if !greeks_valid {
            return DeltaDeviationState::Invalid;
        }
        let abs_d = net_delta.abs();
        if abs_d <= gates.delta.epsilon_band {
            DeltaDeviationState::InBand
        } else if abs_d >= gates.delta.max_delta_limit {
            DeltaDeviationState::ForceHedge
        } else if abs_d >= gates.delta.hedge_threshold {
            DeltaDeviationState::HedgeNeeded
        } else {
            DeltaDeviationState::Minor
        }
    }

    fn classify_m(
        market: MarketInputs,
        gates: &StateGates,
        price_history: Option<&[f64]>,
        now_ts: f64,
    ) -> MarketRegimeState {
        if let Some(last) = market.last_tick_ts {
            let lag_ms = (now_ts - last) * 1000.0;
            if lag_ms > gates.market.stale_ts_threshold_ms {
                return MarketRegimeState::Stale;
            }
        }
        // Default regime rule: normalized variance and slope over a short
        // window. NORMAL when no usable history.
        if let Some(history) = price_history {
            if history.len() >= 2 {
                let n = history.len() as f64;
                let mean = history.iter().sum::<f64>() / n;
                let var = history.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                    / (n - 1.0).max(1.0);
                let vol = if mean != 0.0 { var.sqrt() / mean } else { 0.0 };
                let slope = (history[history.len() - 1] - history[0]) / n;
                if vol > 0.02 && slope.abs() < 0.001 {
                    return MarketRegimeState::ChoppyHighVol;
                }
                if slope.abs() > 0.005 {
                    return MarketRegimeState::Trend;
                }
                if vol < 0.005 {
                    return MarketRegimeState::Quiet;
                }
            }
        }
        MarketRegimeState::Normal
    }

    fn classify_l(market: MarketInputs, gates: &StateGates) -> LiquidityState {
        let Some(spread_pct) = market.spread_pct else {
            return LiquidityState::NoQuote;
        };
        if spread_pct >= gates.liquidity.extreme_spread_pct {
            LiquidityState::ExtremeWide
        } else if spread_pct >= gates.liquidity.wide_spread_pct {
            LiquidityState::Wide
        } else {
            LiquidityState::Normal
        }
    }

    fn classify_s(
        greeks_valid: bool,
        data_lag_ms: Option<f64>,
        risk_halt: bool,
        gates: &StateGates,
    ) -> SystemHealthState {
        if risk_halt {
            return SystemHealthState::RiskHalt;
        }
        if !greeks_valid {
            return SystemHealthState::GreeksBad;
        }
        if let Some(lag) = data_lag_ms {
            if lag > gates.system.data_lag_threshold_ms {
                return SystemHealthState::DataLag;
            }
        }
        SystemHealthState::Ok
    }
}
