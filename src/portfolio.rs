// =============================================================================
// Portfolio Parsing and Greeks
// =============================================================================
//
// Turns raw broker position rows into the option legs the strategy cares
// about (same underlying, DTE window, near-ATM strikes) plus the signed
// stock position, and aggregates per-leg Black-Scholes greeks into portfolio
// delta / gamma in share-equivalent terms.
//
// Broker clients differ in how they surface contract fields, so parsing is
// written against the small `PositionRow` trait instead of a concrete type;
// each connector adapts its own rows to it.
// =============================================================================

use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::pricing::{self, OptionType};
use crate::state::GreeksSnapshot;

// ---------------------------------------------------------------------------
// PositionRow
// ---------------------------------------------------------------------------

/// Accessor view over one broker position row.
pub trait PositionRow {
    fn symbol(&self) -> &str;
    /// "STK" or "OPT".
    fn sec_type(&self) -> &str;
    /// YYYYMMDD; empty for stock.
    fn expiry(&self) -> &str;
    fn strike(&self) -> Option<f64>;
    /// "C" or "P"; empty for stock.
    fn right(&self) -> &str;
    fn multiplier(&self) -> i64;
    /// Signed quantity; long > 0.
    fn quantity(&self) -> f64;
}

// ---------------------------------------------------------------------------
// OptionLeg
// ---------------------------------------------------------------------------

/// Single option position leg surviving the structure filter.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionLeg {
    pub symbol: String,
    /// YYYYMMDD.
    pub expiry: String,
    pub strike: f64,
    /// 'C' or 'P'.
    pub right: char,
    /// Signed contracts; long > 0.
    pub quantity: i64,
    pub multiplier: i64,
}

impl OptionLeg {
    pub fn option_type(&self) -> OptionType {
        if self.right.eq_ignore_ascii_case(&'P') {
            OptionType::Put
        } else {
            OptionType::Call
        }
    }
}

/// Days to expiration from a YYYYMMDD string; negative when unparseable.
pub fn dte(expiry: &str) -> i64 {
    match NaiveDate::parse_from_str(expiry, "%Y%m%d") {
        Ok(exp) => {
            let today = Utc::now().date_naive();
            (exp - today).num_days().max(0)
        }
        Err(_) => -1,
    }
}

fn years_to_expiry(expiry: &str) -> f64 {
    let d = dte(expiry);
    if d < 0 {
        return 0.0;
    }
    d as f64 / 365.0
}

fn is_near_atm(strike: f64, spot: f64, atm_band_pct: f64) -> bool {
    if spot <= 0.0 {
        return false;
    }
    (strike - spot).abs() / spot <= atm_band_pct
}

// ---------------------------------------------------------------------------
// parse_positions
// ---------------------------------------------------------------------------

/// Parse raw position rows into the legs tradable by the hedger.
///
/// Keeps options on `symbol` with DTE in `[min_dte, max_dte]` and strike
/// within the ATM band around `spot` (when spot is known); the stock row for
/// `symbol` sets the returned share count. Everything else is dropped.
pub fn parse_positions<R: PositionRow>(
    rows: &[R],
    symbol: &str,
    min_dte: i64,
    max_dte: i64,
    atm_band_pct: f64,
    spot: Option<f64>,
) -> (Vec<OptionLeg>, i64) {
    let mut legs = Vec::new();
    let mut stock_shares: i64 = 0;

    for row in rows {
        if row.symbol() != symbol {
            continue;
        }
        if row.sec_type() == "STK" {
            stock_shares = row.quantity().round() as i64;
            continue;
        }
        if row.sec_type() != "OPT" {
            continue;
        }
        let Some(strike) = row.strike() else {
            continue;
        };
        let expiry = row.expiry();
        if expiry.is_empty() {
            continue;
        }
        let days = dte(expiry);
        if days < 0 {
            continue;
        }
        if days < min_dte || days > max_dte {
            debug!(
                symbol = row.symbol(),
                expiry,
                strike,
                dte = days,
                min_dte,
                max_dte,
                "skip option leg: DTE outside window"
            );
            continue;
        }
        if let Some(spot) = spot {
            if !is_near_atm(strike, spot, atm_band_pct) {
                debug!(
                    symbol = row.symbol(),
                    expiry, strike, spot, "skip option leg: not near ATM"
                );
                continue;
            }
        }
        legs.push(OptionLeg {
            symbol: row.symbol().to_string(),
            expiry: expiry.to_string(),
            strike,
            right: row.right().trim().to_uppercase().chars().next().unwrap_or('C'),
            quantity: row.quantity().round() as i64,
            multiplier: row.multiplier().max(1),
        });
    }

    (legs, stock_shares)
}

// ---------------------------------------------------------------------------
// Portfolio greeks
// ---------------------------------------------------------------------------

/// Portfolio delta in share equivalent: stock contributes 1 per share, each
/// option `quantity * multiplier * bs_delta`.
pub fn portfolio_delta(
    legs: &[OptionLeg],
    stock_shares: i64,
    spot: f64,
    risk_free_rate: f64,
    volatility: f64,
) -> f64 {
    let mut total = stock_shares as f64;
    for leg in legs {
        let t = years_to_expiry(&leg.expiry);
        let d = pricing::delta(spot, leg.strike, t, risk_free_rate, volatility, leg.option_type());
        total += leg.quantity as f64 * leg.multiplier as f64 * d;
    }
    total
}

/// Portfolio gamma per-share equivalent; stock contributes zero.
pub fn portfolio_gamma(legs: &[OptionLeg], spot: f64, risk_free_rate: f64, volatility: f64) -> f64 {
    let mut total = 0.0;
    for leg in legs {
        let t = years_to_expiry(&leg.expiry);
        let g = pricing::gamma(spot, leg.strike, t, risk_free_rate, volatility);
        total += leg.quantity as f64 * leg.multiplier as f64 * g;
    }
    total
}

/// Compute a [`GreeksSnapshot`] from legs and stock. `valid` is false when
/// spot is non-positive or either aggregate comes out non-finite.
pub fn compute_greeks(
    legs: &[OptionLeg],
    stock_shares: i64,
    spot: f64,
    risk_free_rate: f64,
    volatility: f64,
) -> GreeksSnapshot {
    if spot <= 0.0 {
        return GreeksSnapshot::new(0.0, 0.0, false);
    }
    let delta = portfolio_delta(legs, stock_shares, spot, risk_free_rate, volatility);
    let gamma = portfolio_gamma(legs, spot, risk_free_rate, volatility);
    let valid = delta.is_finite() && gamma.is_finite();
    GreeksSnapshot::new(
        if valid { delta } else { 0.0 },
        if valid { gamma } else { 0.0 },
        valid,
    )
}
