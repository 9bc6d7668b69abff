// =============================================================================
// Black-Scholes Pricing
// =============================================================================
//
// Analytical delta and gamma for European options. Only the two first-order
// greeks the hedger consumes are implemented; theta and vega are reported as
// zero by `calculate_greeks` to keep the snapshot shape uniform.
// =============================================================================

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Parse an exchange "right" code ("C"/"P", case-insensitive, or the
    /// spelled-out words). Unknown values default to Call, matching the
    /// upstream position feeds that only ever send C or P.
    pub fn from_right(right: &str) -> Self {
        match right.trim().to_uppercase().chars().next() {
            Some('P') => Self::Put,
            _ => Self::Call,
        }
    }
}

fn standard_normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal parameters are valid")
}

fn d1(spot: f64, strike: f64, t: f64, rate: f64, sigma: f64) -> f64 {
    ((spot / strike).ln() + (rate + 0.5 * sigma * sigma) * t) / (sigma * t.sqrt())
}

/// Option delta per unit of underlying. Returns 0.0 at or past expiry or on
/// degenerate inputs.
pub fn delta(spot: f64, strike: f64, t: f64, rate: f64, sigma: f64, option_type: OptionType) -> f64 {
    if t <= 0.0 || spot <= 0.0 || strike <= 0.0 || sigma <= 0.0 {
        return 0.0;
    }
    let n = standard_normal();
    let nd1 = n.cdf(d1(spot, strike, t, rate, sigma));
    match option_type {
        OptionType::Call => nd1,
        OptionType::Put => nd1 - 1.0,
    }
}

/// Option gamma per unit of underlying. Returns 0.0 at or past expiry or on
/// degenerate inputs. Gamma is identical for calls and puts.
pub fn gamma(spot: f64, strike: f64, t: f64, rate: f64, sigma: f64) -> f64 {
    if t <= 0.0 || spot <= 0.0 || strike <= 0.0 || sigma <= 0.0 {
        return 0.0;
    }
    let n = standard_normal();
    let pdf_d1 = n.pdf(d1(spot, strike, t, rate, sigma));
    pdf_d1 / (spot * sigma * t.sqrt())
}

/// Per-unit greeks bundle for one contract.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UnitGreeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
}

/// Delta and gamma for one option (theta/vega zero).
pub fn calculate_greeks(
    spot: f64,
    strike: f64,
    t: f64,
    rate: f64,
    sigma: f64,
    option_type: OptionType,
) -> UnitGreeks {
    UnitGreeks {
        delta: delta(spot, strike, t, rate, sigma, option_type),
        gamma: gamma(spot, strike, t, rate, sigma),
        theta: 0.0,
        vega: 0.0,
    }
}
