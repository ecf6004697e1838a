/// Stable numeric codes for the kinds in [`super::ErrorKind`], for logs and
/// the status broadcaster's `ItemFailed` payload. Organized by category the
/// way the planning service's own error envelope groups HTTP status ranges.
pub struct ErrorCode;

impl ErrorCode {
    pub const AUTH_MISSING: u16 = 1001;
    pub const AUTH_INVALID: u16 = 1002;
    pub const AUTH_EXPIRED: u16 = 1003;

    pub const NETWORK_CONNECTION: u16 = 2001;
    pub const NETWORK_TIMEOUT: u16 = 2002;
    pub const NETWORK_SERVER: u16 = 2003;
    pub const NETWORK_RATE_LIMITED: u16 = 2004;

    pub const PLANNING_VALIDATION: u16 = 3001;
    pub const PLANNING_NOT_FOUND: u16 = 3002;
    pub const PLANNING_CONFLICT: u16 = 3003;

    pub const AGENT_SPAWN: u16 = 4001;
    pub const AGENT_TIMEOUT: u16 = 4002;
    pub const AGENT_INACTIVE: u16 = 4003;
    pub const AGENT_EXECUTION: u16 = 4004;

    pub const CHECKPOINT_CORRUPTED: u16 = 5001;
    pub const CHECKPOINT_VERSION_MISMATCH: u16 = 5002;
    pub const CHECKPOINT_EXPIRED: u16 = 5003;
    pub const CHECKPOINT_IO: u16 = 5004;

    pub const CYCLE: u16 = 6001;
    pub const CANCELLED: u16 = 6002;
    pub const CONFIG: u16 = 6003;
}
