use log::error;
use thiserror::Error;

/// Channel errors
///
/// The controller distinguishes two fates: a [ChannelError::CommandRejected]
/// is reported back to the caller with no state change, anything else is a
/// protocol fault and leads to unilateral close (or `CLOSED` pre-funding).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChannelError {
    /// Caller mistake - invalid amount, closing in progress, illegal state
    #[error("command rejected: {0}")]
    CommandRejected(String),

    /// Our view of the protocol was violated by the peer
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A peer signature did not verify
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// An HTLC id that matches nothing on the relevant commitment
    #[error("unknown htlc id: {0}")]
    UnknownHtlcId(u64),

    /// A balance would drop below reserve or below zero
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// An unexpected internal condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChannelError {
    /// Whether this error only rejects a local command
    pub fn is_command_rejection(&self) -> bool {
        matches!(self, ChannelError::CommandRejected(_))
    }
}

/// Construct a command rejection
pub fn command_rejected(msg: impl Into<String>) -> ChannelError {
    ChannelError::CommandRejected(msg.into())
}

/// Construct a protocol violation, logging it
pub fn protocol_violation(msg: impl Into<String>) -> ChannelError {
    let s = msg.into();
    error!("PROTOCOL VIOLATION: {}", &s);
    ChannelError::ProtocolViolation(s)
}

/// Construct an invalid signature error, logging it
pub fn invalid_signature(msg: impl Into<String>) -> ChannelError {
    let s = msg.into();
    error!("INVALID SIGNATURE: {}", &s);
    ChannelError::InvalidSignature(s)
}

pub(crate) fn internal_error(msg: impl Into<String>) -> ChannelError {
    let s = msg.into();
    error!("INTERNAL ERROR: {}", &s);
    ChannelError::Internal(s)
}

pub(crate) fn insufficient_funds(msg: impl Into<String>) -> ChannelError {
    ChannelError::InsufficientFunds(msg.into())
}
