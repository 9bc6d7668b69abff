// =============================================================================
// State-Space Enums
// =============================================================================
//
// The six discrete dimensions of the composite trading state. Every variant
// carries a stable short tag ("O0".."S3") that is written verbatim to the
// database and logs, so the monitor and any historical queries keep working
// across releases. Do not renumber.
// =============================================================================

use serde::{Deserialize, Serialize};

/// O: option position / portfolio gamma sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionPositionState {
    /// No option position (or greeks invalid).
    None,
    /// Portfolio gamma > 0.
    LongGamma,
    /// Portfolio gamma < 0.
    ShortGamma,
}

impl OptionPositionState {
    /// Stable tag for logs and DB columns.
    pub fn tag(self) -> &'static str {
        match self {
            Self::None => "O0",
            Self::LongGamma => "O1",
            Self::ShortGamma => "O2",
        }
    }
}

/// D: net delta deviation from the zero target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaDeviationState {
    /// Within the epsilon band.
    InBand,
    /// Beyond the band but below the hedge threshold.
    Minor,
    /// At or above the hedge threshold.
    HedgeNeeded,
    /// At or above the max delta limit; must hedge.
    ForceHedge,
    /// Greeks NaN or missing.
    Invalid,
}

impl DeltaDeviationState {
    pub fn tag(self) -> &'static str {
        match self {
            Self::InBand => "D0",
            Self::Minor => "D1",
            Self::HedgeNeeded => "D2",
            Self::ForceHedge => "D3",
            Self::Invalid => "D4",
        }
    }
}

/// M: market regime from volatility / trend / gap / staleness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketRegimeState {
    Quiet,
    Normal,
    Trend,
    ChoppyHighVol,
    Gap,
    /// Data timestamp too old.
    Stale,
}

impl MarketRegimeState {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Quiet => "M0",
            Self::Normal => "M1",
            Self::Trend => "M2",
            Self::ChoppyHighVol => "M3",
            Self::Gap => "M4",
            Self::Stale => "M5",
        }
    }
}

/// L: bid-ask spread / quote quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LiquidityState {
    Normal,
    Wide,
    ExtremeWide,
    NoQuote,
}

impl LiquidityState {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Normal => "L0",
            Self::Wide => "L1",
            Self::ExtremeWide => "L2",
            Self::NoQuote => "L3",
        }
    }
}

/// E: order / execution layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    Idle,
    OrderWorking,
    PartialFill,
    Disconnected,
    BrokerError,
}

impl ExecutionState {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Idle => "E0",
            Self::OrderWorking => "E1",
            Self::PartialFill => "E2",
            Self::Disconnected => "E3",
            Self::BrokerError => "E4",
        }
    }
}

/// S: system health (greeks, data lag, risk halt).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemHealthState {
    Ok,
    GreeksBad,
    DataLag,
    RiskHalt,
}

impl SystemHealthState {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Ok => "S0",
            Self::GreeksBad => "S1",
            Self::DataLag => "S2",
            Self::RiskHalt => "S3",
        }
    }
}

macro_rules! display_as_tag {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl std::fmt::Display for $ty {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    f.write_str(self.tag())
                }
            }
        )+
    };
}

display_as_tag!(
    OptionPositionState,
    DeltaDeviationState,
    MarketRegimeState,
    LiquidityState,
    ExecutionState,
    SystemHealthState,
);

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable() {
        assert_eq!(OptionPositionState::None.tag(), "O0");
        assert_eq!(OptionPositionState::ShortGamma.tag(), "O2");
        assert_eq!(DeltaDeviationState::ForceHedge.tag(), "D3");
        assert_eq!(DeltaDeviationState::Invalid.tag(), "D4");
        assert_eq!(MarketRegimeState::Stale.tag(), "M5");
        assert_eq!(LiquidityState::NoQuote.tag(), "L3");
        assert_eq!(ExecutionState::BrokerError.tag(), "E4");
        assert_eq!(SystemHealthState::RiskHalt.tag(), "S3");
    }

    #[test]
    fn display_matches_tag() {
        assert_eq!(format!("{}", LiquidityState::Wide), "L1");
        assert_eq!(format!("{}", ExecutionState::OrderWorking), "E1");
    }
}
