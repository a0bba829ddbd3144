/// Length of a generated transaction reference.
pub const TRANSACTION_REF_LEN: usize = 10;

/// Fresh references tried before a charge gives up.
pub const MAX_REFERENCE_ATTEMPTS: usize = 8;

/// Longest request line accepted by the line protocol, in bytes.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Largest encoded event accepted at replay; anything bigger is a torn length.
pub const MAX_WAL_ENTRY_LEN: usize = 1024 * 1024;
