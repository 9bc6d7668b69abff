// =============================================================================
// Persistence: the daemon-owned PostgreSQL sink and the read-only status
// reader used by the API server.
// =============================================================================

pub mod reader;
pub mod sink;

pub use reader::{HeartbeatRow, OperationFilter, OperationRow, StatusReader};
pub use sink::{
    contract_key, ib_port_for_type, release_locks_for_tables, ControlCommand, HeartbeatUpdate,
    IbConnectionSettings, OperationRecord, PostgresSink, StatusSnapshotRow,
    CONTROL_CMD_MAX_AGE_SEC, DAEMON_LOCK_TABLES,
};
