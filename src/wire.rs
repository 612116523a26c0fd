//! Typed BOLT #2 peer messages.
//!
//! Transport framing, feature negotiation and onion payloads are out of
//! scope; the channel consumes and produces these already-decoded values.
//! The onion blob on [UpdateAddHtlc] is carried opaquely for the relayer.

#![allow(missing_docs)]

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{ScriptBuf, Txid};
use lightning::ln::{PaymentHash, PaymentPreimage};
use serde_derive::{Deserialize, Serialize};

use crate::util::ser_util::{PaymentHashDef, PaymentPreimageDef};

/// Proposal to open a channel, sent by the funder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenChannel {
    pub temporary_channel_id: u64,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub dust_limit_satoshis: u64,
    pub max_htlc_value_in_flight_msat: u64,
    pub channel_reserve_satoshis: u64,
    pub htlc_minimum_msat: u64,
    pub feerate_per_kw: u32,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_basepoint: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
    pub first_per_commitment_point: PublicKey,
    pub channel_flags: u8,
}

/// Fundee's parameters in response to [OpenChannel]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptChannel {
    pub temporary_channel_id: u64,
    pub dust_limit_satoshis: u64,
    pub max_htlc_value_in_flight_msat: u64,
    pub channel_reserve_satoshis: u64,
    pub minimum_depth: u32,
    pub htlc_minimum_msat: u64,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_basepoint: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
    pub first_per_commitment_point: PublicKey,
}

/// Funder's signature on the fundee's first commitment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingCreated {
    pub temporary_channel_id: u64,
    pub funding_txid: Txid,
    pub funding_output_index: u16,
    pub signature: Signature,
}

/// Fundee's signature on the funder's first commitment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingSigned {
    pub temporary_channel_id: u64,
    pub signature: Signature,
}

/// Funding reached `minimum_depth` on the sender's side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingLocked {
    pub temporary_channel_id: u64,
    /// The permanent (short) channel id derived from the funding location
    pub channel_id: u64,
    pub next_per_commitment_point: PublicKey,
}

/// Offer an HTLC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateAddHtlc {
    pub channel_id: u64,
    pub id: u64,
    pub amount_msat: u64,
    #[serde(with = "PaymentHashDef")]
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
    /// Opaque onion, forwarded to the relayer untouched
    pub onion_routing_packet: Vec<u8>,
}

/// Settle an HTLC with its preimage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFulfillHtlc {
    pub channel_id: u64,
    pub id: u64,
    #[serde(with = "PaymentPreimageDef")]
    pub payment_preimage: PaymentPreimage,
}

/// Remove an HTLC, carrying an opaque failure reason
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateFailHtlc {
    pub channel_id: u64,
    pub id: u64,
    pub reason: Vec<u8>,
}

/// Signatures on the peer's next commitment and its HTLC transactions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitSig {
    pub channel_id: u64,
    pub signature: Signature,
    /// One signature per non-dust HTLC, in commitment output order
    pub htlc_signatures: Vec<Signature>,
}

/// Revoke the previous commitment and supply the next point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevokeAndAck {
    pub channel_id: u64,
    pub per_commitment_secret: SecretKey,
    pub next_per_commitment_point: PublicKey,
}

/// Start a mutual close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shutdown {
    pub channel_id: u64,
    pub script_pubkey: ScriptBuf,
}

/// One round of mutual close fee negotiation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosingSigned {
    pub channel_id: u64,
    pub fee_satoshis: u64,
    pub signature: Signature,
}

/// Signatures allowing the peer to assemble `channel_announcement`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncementSignatures {
    pub channel_id: u64,
    pub node_signature: Signature,
    pub bitcoin_signature: Signature,
}

/// Fatal peer error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub channel_id: u64,
    pub data: String,
}

/// Any BOLT #2 message this channel sends or receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    OpenChannel(OpenChannel),
    AcceptChannel(AcceptChannel),
    FundingCreated(FundingCreated),
    FundingSigned(FundingSigned),
    FundingLocked(FundingLocked),
    UpdateAddHtlc(UpdateAddHtlc),
    UpdateFulfillHtlc(UpdateFulfillHtlc),
    UpdateFailHtlc(UpdateFailHtlc),
    CommitSig(CommitSig),
    RevokeAndAck(RevokeAndAck),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    AnnouncementSignatures(AnnouncementSignatures),
    Error(ErrorMessage),
}

/// An update to a commitment spec, the unit of the change streams
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateMessage {
    Add(UpdateAddHtlc),
    Fulfill(UpdateFulfillHtlc),
    Fail(UpdateFailHtlc),
}

impl UpdateMessage {
    /// The HTLC id this update refers to
    pub fn htlc_id(&self) -> u64 {
        match self {
            UpdateMessage::Add(m) => m.id,
            UpdateMessage::Fulfill(m) => m.id,
            UpdateMessage::Fail(m) => m.id,
        }
    }
}

impl From<UpdateMessage> for Message {
    fn from(m: UpdateMessage) -> Message {
        match m {
            UpdateMessage::Add(m) => Message::UpdateAddHtlc(m),
            UpdateMessage::Fulfill(m) => Message::UpdateFulfillHtlc(m),
            UpdateMessage::Fail(m) => Message::UpdateFailHtlc(m),
        }
    }
}
