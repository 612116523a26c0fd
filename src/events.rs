//! The channel's inbox and outbox vocabularies.
//!
//! Everything the channel consumes arrives as a [ChannelEvent]; everything
//! it wants the outside world to do leaves as an [Action]. Collaborators
//! (peer wire, blockchain watcher, HTLC relayer, router, event stream) are
//! known only by these messages.

#![allow(missing_docs)]

use core::fmt;

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use lightning::ln::{PaymentHash, PaymentPreimage};
use serde_derive::{Deserialize, Serialize};

use crate::channel::StateName;
use crate::commitments::LocalParams;
use crate::wire::{Message, UpdateAddHtlc, UpdateFailHtlc, UpdateFulfillHtlc};

/// Where a locally-added HTLC came from, for upstream settlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HtlcOrigin {
    /// Sent by this node
    Local,
    /// Relayed from an upstream channel
    Relayed {
        upstream_channel_id: u64,
        upstream_htlc_id: u64,
    },
}

/// Add an HTLC to the channel
#[derive(Debug, Clone)]
pub struct CmdAddHtlc {
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
    pub onion_routing_packet: Vec<u8>,
    pub origin: HtlcOrigin,
    /// Immediately follow up with a signing round
    pub commit: bool,
}

/// Fulfill a received HTLC
#[derive(Debug, Clone)]
pub struct CmdFulfillHtlc {
    pub id: u64,
    pub payment_preimage: PaymentPreimage,
    pub commit: bool,
}

/// Fail a received HTLC
#[derive(Debug, Clone)]
pub struct CmdFailHtlc {
    pub id: u64,
    pub reason: Vec<u8>,
    pub commit: bool,
}

/// Start a mutual close
#[derive(Debug, Clone)]
pub struct CmdClose {
    /// Final scriptpubkey; the channel default is used when absent
    pub script_pubkey: Option<ScriptBuf>,
}

/// Local commands addressed to the channel
#[derive(Debug, Clone)]
pub enum ChannelCommand {
    AddHtlc(CmdAddHtlc),
    FulfillHtlc(CmdFulfillHtlc),
    FailHtlc(CmdFailHtlc),
    /// Sign whatever is pending
    Sign,
    Close(CmdClose),
    GetState,
    GetStateData,
    GetInfo,
}

/// Watch tags, echoed back with the matching [WatchEvent]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitcoinEventTag {
    FundingSpent,
    FundingDepthOk,
    FundingLost,
    FundingTimeout,
    CloseDone,
    LocalCommitDone,
    RemoteCommitDone,
    NextRemoteCommitDone,
    PenaltyDone,
    HtlcSpent,
}

/// Requests to the blockchain collaborator, fire-and-forget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockchainRequest {
    /// Build and fund a transaction paying `amount_sat` to `script_pubkey`
    MakeFundingTx {
        script_pubkey: ScriptBuf,
        amount_sat: u64,
        feerate_per_kw: u32,
    },
    /// Broadcast, retrying until confirmed
    PublishAsap(Transaction),
    WatchConfirmed {
        txid: Txid,
        min_depth: u32,
        tag: BitcoinEventTag,
    },
    WatchSpent {
        outpoint: OutPoint,
        tag: BitcoinEventTag,
    },
    /// Fire if the watched tx vanishes from the chain after confirming
    WatchLost {
        txid: Txid,
        tag: BitcoinEventTag,
    },
}

/// Funding transaction built by the blockchain collaborator
#[derive(Debug, Clone)]
pub struct MakeFundingTxResponse {
    pub funding_tx: Transaction,
    pub output_index: u16,
}

/// Notifications from the blockchain collaborator
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Confirmed {
        tag: BitcoinEventTag,
        block_height: u32,
        tx_index: u32,
    },
    Spent {
        tag: BitcoinEventTag,
        tx: Transaction,
    },
    Lost {
        tag: BitcoinEventTag,
    },
}

/// Notifications to the HTLC relayer
#[derive(Debug, Clone, PartialEq)]
pub enum RelayerNotification {
    /// Associate a locally-added HTLC with its origin
    Bind {
        add: UpdateAddHtlc,
        origin: HtlcOrigin,
    },
    /// A peer add is now irrevocably committed on both chains
    ForwardAdd(UpdateAddHtlc),
    /// A peer fulfill to settle upstream
    ForwardFulfill(UpdateFulfillHtlc),
    /// A peer fail to settle upstream
    ForwardFail(UpdateFailHtlc),
}

/// Channel announcement body, signed by both endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAnnouncement {
    pub short_channel_id: u64,
    pub node_id_1: PublicKey,
    pub node_id_2: PublicKey,
    pub bitcoin_key_1: PublicKey,
    pub bitcoin_key_2: PublicKey,
    pub node_signature_1: Signature,
    pub node_signature_2: Signature,
    pub bitcoin_signature_1: Signature,
    pub bitcoin_signature_2: Signature,
}

/// Node announcement body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub node_id: PublicKey,
    pub signature: Signature,
}

/// Relay-policy advertisement for one direction of the channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub short_channel_id: u64,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub signature: Signature,
}

/// Messages for the router
#[derive(Debug, Clone, PartialEq)]
pub enum RouterMessage {
    ChannelAnnouncement(ChannelAnnouncement),
    NodeAnnouncement(NodeAnnouncement),
    ChannelUpdate(ChannelUpdate),
}

/// Emissions on the node-wide event stream
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    ChannelCreated {
        temporary_channel_id: u64,
    },
    ChannelIdAssigned {
        temporary_channel_id: u64,
        channel_id: u64,
    },
    ChannelSignatureReceived {
        channel_id: u64,
    },
    ChannelChangedState {
        previous: StateName,
        current: StateName,
    },
}

/// Parameters for creating the channel as funder
#[derive(Debug, Clone)]
pub struct InitFunder {
    pub remote_node_id: PublicKey,
    pub temporary_channel_id: u64,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub initial_feerate_per_kw: u32,
    pub local_params: LocalParams,
    pub channel_flags: u8,
}

/// Parameters for creating the channel as fundee
#[derive(Debug, Clone)]
pub struct InitFundee {
    pub remote_node_id: PublicKey,
    pub local_params: LocalParams,
}

/// Everything the channel can receive
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    InitFunder(InitFunder),
    InitFundee(InitFundee),
    Message(Message),
    Command(ChannelCommand),
    Watch(WatchEvent),
    MakeFundingTxResponse(MakeFundingTxResponse),
    /// Current best block height
    BlockCount(u32),
    Disconnected,
    Reconnected,
    /// Delayed self-message: publish announcements to the router
    AnnouncementsTick,
}

/// Introspection summary returned by `CMD_GETINFO`
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub state: StateName,
    pub channel_id: Option<u64>,
    pub to_local_msat: u64,
    pub to_remote_msat: u64,
    pub htlcs_in_flight: usize,
}

/// Replies to local commands
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    Ok,
    Rejected(String),
    State(StateName),
    /// Rendered state data, for diagnostics
    StateData(String),
    Info(Box<ChannelInfo>),
}

/// Everything the channel can ask of the outside world
#[derive(Clone)]
pub enum Action {
    /// Send to the peer
    SendMessage(Message),
    /// Ask the blockchain collaborator
    Blockchain(BlockchainRequest),
    /// Notify the HTLC relayer
    Relayer(RelayerNotification),
    /// Publish to the router
    Router(RouterMessage),
    /// Emit on the event stream
    Emit(NodeEvent),
    /// Reply to the command sender
    Reply(CommandResponse),
    /// Ask the actor shell for a delayed self-message
    Schedule {
        delay_ms: u64,
        event: ChannelEvent,
    },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::SendMessage(m) => write!(f, "SendMessage({:?})", m),
            Action::Blockchain(r) => write!(f, "Blockchain({:?})", r),
            Action::Relayer(r) => write!(f, "Relayer({:?})", r),
            Action::Router(r) => write!(f, "Router({:?})", r),
            Action::Emit(e) => write!(f, "Emit({:?})", e),
            Action::Reply(r) => write!(f, "Reply({:?})", r),
            Action::Schedule { delay_ms, .. } => write!(f, "Schedule({}ms)", delay_ms),
        }
    }
}
