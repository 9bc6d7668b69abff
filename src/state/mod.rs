// =============================================================================
// State space: the six discrete letters, immutable snapshots, and the
// classifier that maps raw runtime data onto them.
// =============================================================================

pub mod classifier;
pub mod enums;
pub mod snapshot;

pub use classifier::{MarketInputs, PositionInputs, StateClassifier};
pub use enums::{
    DeltaDeviationState, ExecutionState, LiquidityState, MarketRegimeState, OptionPositionState,
    SystemHealthState,
};
pub use snapshot::{CompositeState, GreeksSnapshot, StateSnapshot, GREEKS_SANITY_LIMIT};
