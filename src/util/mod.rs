/// Serde shims for foreign types
pub mod ser_util;
#[cfg(test)]
pub mod test_utils;

/// Commitment numbers are passed to the transaction builders counting down
/// from this value, per BOLT #3.
pub const INITIAL_COMMITMENT_NUMBER: u64 = (1 << 48) - 1;

/// The largest value, in millisatoshi, that fits in a commitment
pub const MAX_VALUE_MSAT: u64 = 21_000_000_0000_0000_000;
