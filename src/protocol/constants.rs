//! Protocol constants

/// Error message from either side
pub const OP_ERROR: u8 = 0;
/// Broker greeting carrying its name and the auth nonce
pub const OP_INFO: u8 = 1;
/// Client authentication
pub const OP_AUTH: u8 = 2;
pub const OP_PUBLISH: u8 = 3;
pub const OP_SUBSCRIBE: u8 = 4;
pub const OP_UNSUBSCRIBE: u8 = 5;

/// Length prefix plus opcode
pub const HEADER_SIZE: usize = 5;

/// Size of the random nonce sent in INFO
pub const NONCE_SIZE: usize = 4;

/// Size of the SHA-1 auth hash
pub const HASH_SIZE: usize = 20;

/// Largest frame accepted by default (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Broker name announced in INFO by default
pub const DEFAULT_BROKER_NAME: &str = "hpfeeds";

/// Error sent when authentication fails
pub const ERR_AUTH_FAIL: &str = "authfail";

/// Error sent when an identity lacks permission for a channel
pub const ERR_ACCESS_FAIL: &str = "accessfail";
