#![crate_name = "lightning_channel"]

//! The per-channel state machine of a Lightning node.
//! See [`channel::Channel`] for the entry point.
//!
//! The state machine is synchronous: feed it a [`events::ChannelEvent`],
//! get back the [`events::Action`]s for the peer wire, blockchain watcher,
//! HTLC relayer and router. [`actor`] wraps it in a tokio task for
//! deployments that want a mailbox.

#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

pub use bitcoin;
pub use lightning;

/// Tokio actor shell
pub mod actor;
/// State controller
pub mod channel;
/// Close protocols and on-chain claims
pub mod closing;
/// The dual commitment chain and its update algebra
pub mod commitments;
/// Errors
pub mod error;
/// Inbox events and outbound actions
pub mod events;
/// Opening protocol helpers
pub mod funding;
/// Per-channel key material
pub mod keys;
/// Transaction construction and signature plumbing
pub mod tx;
/// Various utilities
pub mod util;
/// BOLT #2 peer messages
pub mod wire;

#[cfg(test)]
mod close_tests;
#[cfg(test)]
mod normal_tests;
#[cfg(test)]
mod open_tests;
#[cfg(test)]
mod reconnect_tests;
