// =============================================================================
// The three-layer FSM engine: daemon lifecycle (outer), trading (macro),
// hedge execution (micro), plus the event vocabulary they share.
// =============================================================================

pub mod daemon;
pub mod events;
pub mod execution;
pub mod trading;

pub use daemon::{DaemonFsm, DaemonState};
pub use events::{ExecEvent, TargetPositionEvent, TradingEvent};
pub use execution::{HedgeExecState, HedgeExecutionFsm};
pub use trading::{TradingFsm, TradingState};
