//! The per-channel state controller.
//!
//! One [Channel] owns one payment channel from funding negotiation to the
//! terminal states. Each incoming [ChannelEvent] is dispatched by the
//! current state; handlers return the next state and the actions to hand
//! to the collaborators. Any protocol fault raised while the channel has
//! commitments is converted into a unilateral close.

use core::fmt;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Transaction;
use lightning::ln::chan_utils::{make_funding_redeemscript, CounterpartyCommitmentSecrets};
use log::{debug, error, info, warn};
use serde_derive::{Deserialize, Serialize};

use crate::closing::{
    check_closing_signature, claim_current_local_commit_tx_outputs,
    claim_remote_commit_tx_outputs, claim_revoked_remote_commit_tx_outputs, first_closing_fee,
    is_valid_final_script, make_closing_tx, next_closing_fee, LocalCommitPublished,
    RemoteCommitPublished, RevokedCommitPublished,
};
use crate::commitments::{
    Applied, Commitments, LocalCommit, LocalParams, NextRemoteCommitInfo, PublishableTxs,
    RemoteCommit, RemoteParams,
};
use crate::error::{command_rejected, protocol_violation, ChannelError};
use crate::events::{
    Action, BitcoinEventTag, BlockchainRequest, ChannelAnnouncement, ChannelCommand, ChannelEvent,
    ChannelInfo, ChannelUpdate, CmdClose, CommandResponse, InitFundee, InitFunder,
    MakeFundingTxResponse, NodeAnnouncement, NodeEvent, RelayerNotification, RouterMessage,
    WatchEvent,
};
use crate::funding::{
    make_announcement_signatures, make_channel_announcement, make_channel_update,
    make_first_commit_txs, make_node_announcement, remote_params_from_accept,
    remote_params_from_open, short_channel_id, validate_accept_channel, validate_open_channel,
    verify_announcement_signatures,
};
use crate::tx::{
    add_funding_witness, sign_segwit_input, verify_segwit_input, CommitTxs,
    FundingInput,
};
use crate::wire::{
    AcceptChannel, AnnouncementSignatures, ClosingSigned, ErrorMessage, FundingCreated,
    FundingLocked, FundingSigned, Message, OpenChannel, Shutdown,
};

/// Depth at which a closing claim is considered done
const CLAIM_CONFIRM_DEPTH: u32 = 3;
/// Delay before handing fresh announcements to the router
const BROADCAST_DELAY_MS: u64 = 3_000;
/// Announce-channel bit in `open_channel.channel_flags`
const FLAG_ANNOUNCE_CHANNEL: u8 = 0x01;

/// Node-wide constants the channel needs
#[derive(Clone)]
pub struct NodeParams {
    /// The node key, used for announcements
    pub node_secret: SecretKey,
    /// Our node id
    pub node_id: PublicKey,
    /// Funding confirmations we require
    pub minimum_depth: u32,
    /// Feerate used for on-chain claims (a parameter, not an estimate)
    pub claim_feerate_per_kw: u32,
    /// `channel_update` relay policy
    pub cltv_expiry_delta: u16,
    /// `channel_update` relay policy
    pub fee_base_msat: u32,
    /// `channel_update` relay policy
    pub fee_proportional_millionths: u32,
}

// Need to define manually so the node secret stays out of logs.
impl fmt::Debug for NodeParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeParams")
            .field("node_id", &self.node_id)
            .field("minimum_depth", &self.minimum_depth)
            .finish()
    }
}

/// State tags, for introspection and event-stream emissions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum StateName {
    WaitForInitInternal,
    WaitForOpenChannel,
    WaitForAcceptChannel,
    WaitForFundingInternal,
    WaitForFundingCreated,
    WaitForFundingSigned,
    WaitForFundingConfirmed,
    WaitForFundingLocked,
    WaitForAnnSignatures,
    Normal,
    Shutdown,
    Negotiating,
    Closing,
    Closed,
    Offline,
    ErrInformationLeak,
    ErrFundingLost,
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Data while waiting for the peer's `open_channel` (fundee)
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForOpenChannel {
    pub init: InitFundee,
}

/// Data while waiting for the peer's `accept_channel` (funder)
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForAcceptChannel {
    pub init: InitFunder,
    pub last_sent: OpenChannel,
}

/// Data while waiting for the funding transaction to be built (funder)
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForFundingInternal {
    pub init: InitFunder,
    pub remote_params: RemoteParams,
    pub remote_first_per_commitment_point: PublicKey,
    pub minimum_depth: u32,
}

/// Data while waiting for the funder's `funding_created` (fundee)
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForFundingCreated {
    pub temporary_channel_id: u64,
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub initial_feerate_per_kw: u32,
    pub remote_first_per_commitment_point: PublicKey,
    pub channel_flags: u8,
    pub last_sent: AcceptChannel,
}

/// Data while waiting for the fundee's `funding_signed` (funder)
#[derive(Clone)]
#[allow(missing_docs)]
pub struct DataWaitForFundingSigned {
    pub temporary_channel_id: u64,
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    pub funding_tx: Transaction,
    pub commit_input: FundingInput,
    pub local_commit_txs: CommitTxs,
    pub local_spec: crate::commitments::CommitmentSpec,
    pub remote_commit: RemoteCommit,
    pub channel_flags: u8,
    pub minimum_depth: u32,
    pub last_sent: FundingCreated,
}

impl fmt::Debug for DataWaitForFundingSigned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataWaitForFundingSigned")
            .field("temporary_channel_id", &self.temporary_channel_id)
            .field("funding_txid", &self.funding_tx.txid())
            .finish()
    }
}

/// Data while waiting for the funding transaction to confirm
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForFundingConfirmed {
    pub commitments: Commitments,
    /// A `funding_locked` that arrived before our own depth event
    pub deferred: Option<FundingLocked>,
    pub last_sent: Message,
}

/// Data while waiting for the peer's `funding_locked`
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForFundingLocked {
    pub commitments: Commitments,
    pub short_channel_id: u64,
    pub last_sent: FundingLocked,
}

/// Data while waiting for the peer's `announcement_signatures`
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataWaitForAnnSignatures {
    pub commitments: Commitments,
    pub short_channel_id: u64,
    pub last_sent: AnnouncementSignatures,
}

/// Announcements held until the broadcast tick fires
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct Announcements {
    pub channel: ChannelAnnouncement,
    pub node: NodeAnnouncement,
    pub update: ChannelUpdate,
}

/// Data in the NORMAL state
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataNormal {
    pub commitments: Commitments,
    pub short_channel_id: u64,
    /// Our `shutdown`, once sent and until the close completes
    pub our_shutdown: Option<Shutdown>,
    /// Announcements awaiting the broadcast tick
    pub pending_announcements: Option<Announcements>,
}

/// Data in the SHUTDOWN state
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataShutdown {
    pub commitments: Commitments,
    pub local_shutdown: Shutdown,
    pub remote_shutdown: Shutdown,
}

/// Data in the NEGOTIATING state
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataNegotiating {
    pub commitments: Commitments,
    pub local_shutdown: Shutdown,
    pub remote_shutdown: Shutdown,
    /// Our most recent fee proposal
    pub local_closing_signed: ClosingSigned,
}

/// Data in the CLOSING state: which spends we have initiated
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct ClosingPublished {
    pub mutual_close_published: Option<Transaction>,
    pub local_commit_published: Option<LocalCommitPublished>,
    pub remote_commit_published: Option<RemoteCommitPublished>,
    pub next_remote_commit_published: Option<RemoteCommitPublished>,
    pub revoked_commit_published: Vec<RevokedCommitPublished>,
}

/// Data in the CLOSING state
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub struct DataClosing {
    pub commitments: Commitments,
    pub published: ClosingPublished,
}

/// The channel state and the data that goes with it. The pairing invariant
/// of the two is structural: each tag carries exactly its data.
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum ChannelState {
    WaitForInitInternal,
    WaitForOpenChannel(DataWaitForOpenChannel),
    WaitForAcceptChannel(DataWaitForAcceptChannel),
    WaitForFundingInternal(DataWaitForFundingInternal),
    WaitForFundingCreated(DataWaitForFundingCreated),
    WaitForFundingSigned(DataWaitForFundingSigned),
    WaitForFundingConfirmed(DataWaitForFundingConfirmed),
    WaitForFundingLocked(DataWaitForFundingLocked),
    WaitForAnnSignatures(DataWaitForAnnSignatures),
    Normal(DataNormal),
    Shutdown(DataShutdown),
    Negotiating(DataNegotiating),
    Closing(DataClosing),
    Closed,
    /// Peer connection lost; wraps the state to resume on reconnect
    Offline(Box<ChannelState>),
    ErrInformationLeak,
    ErrFundingLost,
}

impl ChannelState {
    /// The tag of this state
    pub fn name(&self) -> StateName {
        match self {
            ChannelState::WaitForInitInternal => StateName::WaitForInitInternal,
            ChannelState::WaitForOpenChannel(_) => StateName::WaitForOpenChannel,
            ChannelState::WaitForAcceptChannel(_) => StateName::WaitForAcceptChannel,
            ChannelState::WaitForFundingInternal(_) => StateName::WaitForFundingInternal,
            ChannelState::WaitForFundingCreated(_) => StateName::WaitForFundingCreated,
            ChannelState::WaitForFundingSigned(_) => StateName::WaitForFundingSigned,
            ChannelState::WaitForFundingConfirmed(_) => StateName::WaitForFundingConfirmed,
            ChannelState::WaitForFundingLocked(_) => StateName::WaitForFundingLocked,
            ChannelState::WaitForAnnSignatures(_) => StateName::WaitForAnnSignatures,
            ChannelState::Normal(_) => StateName::Normal,
            ChannelState::Shutdown(_) => StateName::Shutdown,
            ChannelState::Negotiating(_) => StateName::Negotiating,
            ChannelState::Closing(_) => StateName::Closing,
            ChannelState::Closed => StateName::Closed,
            ChannelState::Offline(_) => StateName::Offline,
            ChannelState::ErrInformationLeak => StateName::ErrInformationLeak,
            ChannelState::ErrFundingLost => StateName::ErrFundingLost,
        }
    }

    /// The commitments, if this state carries them
    pub fn commitments(&self) -> Option<&Commitments> {
        match self {
            ChannelState::WaitForFundingConfirmed(d) => Some(&d.commitments),
            ChannelState::WaitForFundingLocked(d) => Some(&d.commitments),
            ChannelState::WaitForAnnSignatures(d) => Some(&d.commitments),
            ChannelState::Normal(d) => Some(&d.commitments),
            ChannelState::Shutdown(d) => Some(&d.commitments),
            ChannelState::Negotiating(d) => Some(&d.commitments),
            ChannelState::Closing(d) => Some(&d.commitments),
            ChannelState::Offline(inner) => inner.commitments(),
            _ => None,
        }
    }

    /// Whether no further events will ever change this state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChannelState::Closed | ChannelState::ErrInformationLeak | ChannelState::ErrFundingLost
        )
    }
}

type HandlerResult = Result<(ChannelState, Vec<Action>), ChannelError>;

/// A single payment channel, driven synchronously by [Channel::process]
pub struct Channel {
    secp_ctx: Secp256k1<All>,
    node_params: NodeParams,
    remote_node_id: Option<PublicKey>,
    current_height: u32,
    state: ChannelState,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.state.name())
    }
}

impl Channel {
    /// A channel in its initial state, awaiting `INIT_FUNDER` or
    /// `INIT_FUNDEE`
    pub fn new(node_params: NodeParams) -> Self {
        Channel {
            secp_ctx: Secp256k1::new(),
            node_params,
            remote_node_id: None,
            current_height: 0,
            state: ChannelState::WaitForInitInternal,
        }
    }

    /// The current state tag
    pub fn state_name(&self) -> StateName {
        self.state.name()
    }

    /// The current state
    pub fn state(&self) -> &ChannelState {
        &self.state
    }

    /// Dispatch one event. Returns the actions for the collaborators; the
    /// state advances in place.
    pub fn process(&mut self, event: ChannelEvent) -> Vec<Action> {
        let previous = self.state.name();
        let state = self.state.clone();
        match self.handle(state, event) {
            Ok((next, mut actions)) => {
                let current = next.name();
                if current != previous {
                    info!("state {} -> {}", previous, current);
                    actions.push(Action::Emit(NodeEvent::ChannelChangedState { previous, current }));
                }
                self.state = next;
                actions
            }
            Err(e) if e.is_command_rejection() => {
                debug!("command rejected in {}: {}", previous, e);
                vec![Action::Reply(CommandResponse::Rejected(e.to_string()))]
            }
            Err(e) => self.handle_local_error(e, previous),
        }
    }

    // Protocol fault: notify the peer, then close unilaterally if anything
    // is at stake on-chain.
    fn handle_local_error(&mut self, e: ChannelError, previous: StateName) -> Vec<Action> {
        error!("local error in {}: {}", previous, e);
        let commitments = self.state.commitments().cloned();
        let channel_id = commitments.as_ref().map(|c| c.channel_id).unwrap_or(0);
        let mut actions = vec![Action::SendMessage(Message::Error(ErrorMessage {
            channel_id,
            data: e.to_string(),
        }))];
        let next = match commitments {
            Some(c) => match self.spend_local_current(&c) {
                Ok((state, more)) => {
                    actions.extend(more);
                    state
                }
                Err(e2) => {
                    error!("cannot spend local commit: {}", e2);
                    ChannelState::Closed
                }
            },
            None => ChannelState::Closed,
        };
        let current = next.name();
        if current != previous {
            actions.push(Action::Emit(NodeEvent::ChannelChangedState { previous, current }));
        }
        self.state = next;
        actions
    }

    fn handle(&mut self, state: ChannelState, event: ChannelEvent) -> HandlerResult {
        // Events with state-independent dispositions.
        match &event {
            ChannelEvent::Command(ChannelCommand::GetState) => {
                return Ok((state, vec![Action::Reply(CommandResponse::State(self.state.name()))]));
            }
            ChannelEvent::Command(ChannelCommand::GetStateData) => {
                let rendered = format!("{:?}", state);
                return Ok((state, vec![Action::Reply(CommandResponse::StateData(rendered))]));
            }
            ChannelEvent::Command(ChannelCommand::GetInfo) => {
                let info = self.channel_info(&state);
                return Ok((state, vec![Action::Reply(CommandResponse::Info(Box::new(info)))]));
            }
            ChannelEvent::Disconnected => {
                return match state {
                    ChannelState::WaitForInitInternal => Ok((state, vec![])),
                    s if s.is_terminal() => Ok((s, vec![])),
                    ChannelState::Offline(inner) => Ok((ChannelState::Offline(inner), vec![])),
                    s => {
                        info!("disconnected in {}", s.name());
                        Ok((ChannelState::Offline(Box::new(s)), vec![]))
                    }
                };
            }
            ChannelEvent::BlockCount(h) => {
                self.current_height = *h;
                let already_closing = match &state {
                    ChannelState::Closing(_) => true,
                    ChannelState::Offline(inner) => matches!(**inner, ChannelState::Closing(_)),
                    _ => false,
                };
                // Expired HTLCs can no longer be settled off-chain.
                if let Some(c) = state.commitments() {
                    if !state.is_terminal() && !already_closing && c.has_timedout_htlcs(*h) {
                        return Err(protocol_violation(format!("htlc timed out at height {}", h)));
                    }
                }
                return Ok((state, vec![]));
            }
            _ => {}
        }

        match state {
            ChannelState::WaitForInitInternal => self.handle_init(event),
            ChannelState::WaitForOpenChannel(d) => self.handle_wait_for_open_channel(d, event),
            ChannelState::WaitForAcceptChannel(d) => self.handle_wait_for_accept_channel(d, event),
            ChannelState::WaitForFundingInternal(d) => self.handle_wait_for_funding_internal(d, event),
            ChannelState::WaitForFundingCreated(d) => self.handle_wait_for_funding_created(d, event),
            ChannelState::WaitForFundingSigned(d) => self.handle_wait_for_funding_signed(d, event),
            ChannelState::WaitForFundingConfirmed(d) => {
                self.handle_wait_for_funding_confirmed(d, event)
            }
            ChannelState::WaitForFundingLocked(d) => self.handle_wait_for_funding_locked(d, event),
            ChannelState::WaitForAnnSignatures(d) => self.handle_wait_for_ann_signatures(d, event),
            ChannelState::Normal(d) => self.handle_normal(d, event),
            ChannelState::Shutdown(d) => self.handle_shutdown_state(d, event),
            ChannelState::Negotiating(d) => self.handle_negotiating(d, event),
            ChannelState::Closing(d) => self.handle_closing(d, event),
            ChannelState::Offline(inner) => self.handle_offline(*inner, event),
            s @ ChannelState::Closed
            | s @ ChannelState::ErrInformationLeak
            | s @ ChannelState::ErrFundingLost => self.handle_terminal(s, event),
        }
    }

    fn channel_info(&self, state: &ChannelState) -> ChannelInfo {
        match state.commitments() {
            Some(c) => ChannelInfo {
                state: state.name(),
                channel_id: Some(c.channel_id),
                to_local_msat: c.local_commit.spec.to_local_msat,
                to_remote_msat: c.local_commit.spec.to_remote_msat,
                htlcs_in_flight: c.local_commit.spec.htlcs.len(),
            },
            None => ChannelInfo {
                state: state.name(),
                channel_id: None,
                to_local_msat: 0,
                to_remote_msat: 0,
                htlcs_in_flight: 0,
            },
        }
    }

    // ===== opening =====

    fn handle_init(&mut self, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::InitFunder(init) => {
                self.remote_node_id = Some(init.remote_node_id);
                let first_point = init.local_params.keys.per_commitment_point(&self.secp_ctx, 0);
                let pubkeys = init.local_params.keys.pubkeys(&self.secp_ctx);
                let open = OpenChannel {
                    temporary_channel_id: init.temporary_channel_id,
                    funding_satoshis: init.funding_satoshis,
                    push_msat: init.push_msat,
                    dust_limit_satoshis: init.local_params.dust_limit_sat,
                    max_htlc_value_in_flight_msat: init.local_params.max_htlc_value_in_flight_msat,
                    channel_reserve_satoshis: init.local_params.channel_reserve_sat,
                    htlc_minimum_msat: init.local_params.htlc_minimum_msat,
                    feerate_per_kw: init.initial_feerate_per_kw,
                    to_self_delay: init.local_params.to_self_delay,
                    max_accepted_htlcs: init.local_params.max_accepted_htlcs,
                    funding_pubkey: pubkeys.funding_pubkey,
                    revocation_basepoint: pubkeys.revocation_basepoint.0,
                    payment_basepoint: pubkeys.payment_point,
                    delayed_payment_basepoint: pubkeys.delayed_payment_basepoint.0,
                    htlc_basepoint: pubkeys.htlc_basepoint.0,
                    first_per_commitment_point: first_point,
                    channel_flags: init.channel_flags,
                };
                let actions = vec![
                    Action::Emit(NodeEvent::ChannelCreated {
                        temporary_channel_id: init.temporary_channel_id,
                    }),
                    Action::SendMessage(Message::OpenChannel(open.clone())),
                ];
                Ok((
                    ChannelState::WaitForAcceptChannel(DataWaitForAcceptChannel {
                        init,
                        last_sent: open,
                    }),
                    actions,
                ))
            }
            ChannelEvent::InitFundee(init) => {
                self.remote_node_id = Some(init.remote_node_id);
                Ok((ChannelState::WaitForOpenChannel(DataWaitForOpenChannel { init }), vec![]))
            }
            e => self.unhandled(ChannelState::WaitForInitInternal, e),
        }
    }

    fn handle_wait_for_open_channel(
        &mut self,
        d: DataWaitForOpenChannel,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::OpenChannel(open)) => {
                validate_open_channel(&open)?;
                let remote_params = remote_params_from_open(&open);
                let local_params = d.init.local_params.clone();
                let pubkeys = local_params.keys.pubkeys(&self.secp_ctx);
                let accept = AcceptChannel {
                    temporary_channel_id: open.temporary_channel_id,
                    dust_limit_satoshis: local_params.dust_limit_sat,
                    max_htlc_value_in_flight_msat: local_params.max_htlc_value_in_flight_msat,
                    channel_reserve_satoshis: local_params.channel_reserve_sat,
                    minimum_depth: self.node_params.minimum_depth,
                    htlc_minimum_msat: local_params.htlc_minimum_msat,
                    to_self_delay: local_params.to_self_delay,
                    max_accepted_htlcs: local_params.max_accepted_htlcs,
                    funding_pubkey: pubkeys.funding_pubkey,
                    revocation_basepoint: pubkeys.revocation_basepoint.0,
                    payment_basepoint: pubkeys.payment_point,
                    delayed_payment_basepoint: pubkeys.delayed_payment_basepoint.0,
                    htlc_basepoint: pubkeys.htlc_basepoint.0,
                    first_per_commitment_point: local_params
                        .keys
                        .per_commitment_point(&self.secp_ctx, 0),
                };
                let actions = vec![Action::SendMessage(Message::AcceptChannel(accept.clone()))];
                Ok((
                    ChannelState::WaitForFundingCreated(DataWaitForFundingCreated {
                        temporary_channel_id: open.temporary_channel_id,
                        local_params,
                        remote_params,
                        funding_satoshis: open.funding_satoshis,
                        push_msat: open.push_msat,
                        initial_feerate_per_kw: open.feerate_per_kw,
                        remote_first_per_commitment_point: open.first_per_commitment_point,
                        channel_flags: open.channel_flags,
                        last_sent: accept,
                    }),
                    actions,
                ))
            }
            ChannelEvent::Message(Message::Error(_)) => Ok((ChannelState::Closed, vec![])),
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Ok((ChannelState::Closed, vec![Action::Reply(CommandResponse::Ok)]))
            }
            e => self.unhandled(ChannelState::WaitForOpenChannel(d), e),
        }
    }

    fn handle_wait_for_accept_channel(
        &mut self,
        d: DataWaitForAcceptChannel,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::AcceptChannel(accept)) => {
                validate_accept_channel(&accept, d.init.funding_satoshis)?;
                let remote_params = remote_params_from_accept(&accept);
                let local_funding_pubkey =
                    d.init.local_params.keys.pubkeys(&self.secp_ctx).funding_pubkey;
                let funding_script =
                    make_funding_redeemscript(&local_funding_pubkey, &remote_params.pubkeys.funding_pubkey)
                        .to_v0_p2wsh();
                let actions = vec![Action::Blockchain(BlockchainRequest::MakeFundingTx {
                    script_pubkey: funding_script,
                    amount_sat: d.init.funding_satoshis,
                    feerate_per_kw: d.init.initial_feerate_per_kw,
                })];
                Ok((
                    ChannelState::WaitForFundingInternal(DataWaitForFundingInternal {
                        init: d.init,
                        remote_params,
                        remote_first_per_commitment_point: accept.first_per_commitment_point,
                        minimum_depth: accept.minimum_depth,
                    }),
                    actions,
                ))
            }
            ChannelEvent::Message(Message::Error(_)) => Ok((ChannelState::Closed, vec![])),
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Ok((ChannelState::Closed, vec![Action::Reply(CommandResponse::Ok)]))
            }
            e => self.unhandled(ChannelState::WaitForAcceptChannel(d), e),
        }
    }

    fn handle_wait_for_funding_internal(
        &mut self,
        d: DataWaitForFundingInternal,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::MakeFundingTxResponse(MakeFundingTxResponse {
                funding_tx,
                output_index,
            }) => {
                let first = make_first_commit_txs(
                    &self.secp_ctx,
                    &d.init.local_params,
                    &d.remote_params,
                    d.init.funding_satoshis,
                    d.init.push_msat,
                    d.init.initial_feerate_per_kw,
                    funding_tx.txid(),
                    output_index,
                    &d.remote_first_per_commitment_point,
                )?;
                // Sign their first commitment; ours is signed by them in
                // funding_signed.
                let remote_commit_tx = first.remote_commit_txs.transaction();
                let sig = sign_segwit_input(
                    &self.secp_ctx,
                    &remote_commit_tx,
                    0,
                    &first.commit_input.redeem_script,
                    first.commit_input.amount_sat,
                    &d.init.local_params.keys.funding_key,
                )?;
                let funding_created = FundingCreated {
                    temporary_channel_id: d.init.temporary_channel_id,
                    funding_txid: funding_tx.txid(),
                    funding_output_index: output_index,
                    signature: sig,
                };
                let actions =
                    vec![Action::SendMessage(Message::FundingCreated(funding_created.clone()))];
                Ok((
                    ChannelState::WaitForFundingSigned(DataWaitForFundingSigned {
                        temporary_channel_id: d.init.temporary_channel_id,
                        local_params: d.init.local_params.clone(),
                        remote_params: d.remote_params,
                        funding_tx,
                        commit_input: first.commit_input,
                        local_commit_txs: first.local_commit_txs,
                        local_spec: first.local_spec,
                        remote_commit: RemoteCommit {
                            index: 0,
                            spec: first.remote_spec,
                            txid: remote_commit_tx.txid(),
                            remote_per_commitment_point: d.remote_first_per_commitment_point,
                        },
                        channel_flags: d.init.channel_flags,
                        minimum_depth: d.minimum_depth,
                        last_sent: funding_created,
                    }),
                    actions,
                ))
            }
            ChannelEvent::Message(Message::Error(_)) => Ok((ChannelState::Closed, vec![])),
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Ok((ChannelState::Closed, vec![Action::Reply(CommandResponse::Ok)]))
            }
            e => self.unhandled(ChannelState::WaitForFundingInternal(d), e),
        }
    }

    fn handle_wait_for_funding_created(
        &mut self,
        d: DataWaitForFundingCreated,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::FundingCreated(m)) => {
                let first = make_first_commit_txs(
                    &self.secp_ctx,
                    &d.local_params,
                    &d.remote_params,
                    d.funding_satoshis,
                    d.push_msat,
                    d.initial_feerate_per_kw,
                    m.funding_txid,
                    m.funding_output_index,
                    &d.remote_first_per_commitment_point,
                )?;
                let mut local_commit_tx = first.local_commit_txs.transaction();
                verify_segwit_input(
                    &self.secp_ctx,
                    &local_commit_tx,
                    0,
                    &first.commit_input.redeem_script,
                    first.commit_input.amount_sat,
                    &m.signature,
                    &d.remote_params.pubkeys.funding_pubkey,
                )?;
                let local_sig = sign_segwit_input(
                    &self.secp_ctx,
                    &local_commit_tx,
                    0,
                    &first.commit_input.redeem_script,
                    first.commit_input.amount_sat,
                    &d.local_params.keys.funding_key,
                )?;
                add_funding_witness(
                    &mut local_commit_tx,
                    local_sig,
                    m.signature,
                    &d.local_params.keys.pubkeys(&self.secp_ctx).funding_pubkey,
                    &d.remote_params.pubkeys.funding_pubkey,
                );

                let remote_commit_tx = first.remote_commit_txs.transaction();
                let remote_sig = sign_segwit_input(
                    &self.secp_ctx,
                    &remote_commit_tx,
                    0,
                    &first.commit_input.redeem_script,
                    first.commit_input.amount_sat,
                    &d.local_params.keys.funding_key,
                )?;
                let funding_signed = FundingSigned {
                    temporary_channel_id: d.temporary_channel_id,
                    signature: remote_sig,
                };

                let commitments = Commitments {
                    local_params: d.local_params,
                    remote_params: d.remote_params,
                    channel_flags: d.channel_flags,
                    local_commit: LocalCommit {
                        index: 0,
                        spec: first.local_spec,
                        publishable_txs: PublishableTxs {
                            commit_tx: local_commit_tx,
                            htlc_txs_and_sigs: vec![],
                        },
                        remote_sig: m.signature,
                    },
                    remote_commit: RemoteCommit {
                        index: 0,
                        spec: first.remote_spec,
                        txid: remote_commit_tx.txid(),
                        remote_per_commitment_point: d.remote_first_per_commitment_point,
                    },
                    local_changes: Default::default(),
                    remote_changes: Default::default(),
                    local_next_htlc_id: 0,
                    remote_next_htlc_id: 0,
                    remote_next_commit_info: NextRemoteCommitInfo::Point(
                        d.remote_first_per_commitment_point,
                    ),
                    unacked_messages: vec![],
                    commit_input: first.commit_input.clone(),
                    remote_per_commitment_secrets: CounterpartyCommitmentSecrets::new(),
                    revoked_remote_specs: vec![],
                    channel_id: d.temporary_channel_id,
                };
                let actions = vec![
                    Action::Emit(NodeEvent::ChannelSignatureReceived {
                        channel_id: d.temporary_channel_id,
                    }),
                    Action::Blockchain(BlockchainRequest::WatchSpent {
                        outpoint: first.commit_input.outpoint,
                        tag: BitcoinEventTag::FundingSpent,
                    }),
                    Action::Blockchain(BlockchainRequest::WatchConfirmed {
                        txid: first.commit_input.outpoint.txid,
                        min_depth: self.node_params.minimum_depth,
                        tag: BitcoinEventTag::FundingDepthOk,
                    }),
                    Action::SendMessage(Message::FundingSigned(funding_signed.clone())),
                ];
                Ok((
                    ChannelState::WaitForFundingConfirmed(DataWaitForFundingConfirmed {
                        commitments,
                        deferred: None,
                        last_sent: Message::FundingSigned(funding_signed),
                    }),
                    actions,
                ))
            }
            ChannelEvent::Message(Message::Error(_)) => Ok((ChannelState::Closed, vec![])),
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Ok((ChannelState::Closed, vec![Action::Reply(CommandResponse::Ok)]))
            }
            e => self.unhandled(ChannelState::WaitForFundingCreated(d), e),
        }
    }

    fn handle_wait_for_funding_signed(
        &mut self,
        d: DataWaitForFundingSigned,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::FundingSigned(m)) => {
                let mut local_commit_tx = d.local_commit_txs.transaction();
                // If their signature does not spend our commitment, the
                // funding tx must not be published.
                verify_segwit_input(
                    &self.secp_ctx,
                    &local_commit_tx,
                    0,
                    &d.commit_input.redeem_script,
                    d.commit_input.amount_sat,
                    &m.signature,
                    &d.remote_params.pubkeys.funding_pubkey,
                )?;
                let local_sig = sign_segwit_input(
                    &self.secp_ctx,
                    &local_commit_tx,
                    0,
                    &d.commit_input.redeem_script,
                    d.commit_input.amount_sat,
                    &d.local_params.keys.funding_key,
                )?;
                add_funding_witness(
                    &mut local_commit_tx,
                    local_sig,
                    m.signature,
                    &d.local_params.keys.pubkeys(&self.secp_ctx).funding_pubkey,
                    &d.remote_params.pubkeys.funding_pubkey,
                );

                let commitments = Commitments {
                    local_params: d.local_params,
                    remote_params: d.remote_params,
                    channel_flags: d.channel_flags,
                    local_commit: LocalCommit {
                        index: 0,
                        spec: d.local_spec,
                        publishable_txs: PublishableTxs {
                            commit_tx: local_commit_tx,
                            htlc_txs_and_sigs: vec![],
                        },
                        remote_sig: m.signature,
                    },
                    remote_commit: d.remote_commit.clone(),
                    local_changes: Default::default(),
                    remote_changes: Default::default(),
                    local_next_htlc_id: 0,
                    remote_next_htlc_id: 0,
                    remote_next_commit_info: NextRemoteCommitInfo::Point(
                        d.remote_commit.remote_per_commitment_point,
                    ),
                    unacked_messages: vec![],
                    commit_input: d.commit_input.clone(),
                    remote_per_commitment_secrets: CounterpartyCommitmentSecrets::new(),
                    revoked_remote_specs: vec![],
                    channel_id: d.temporary_channel_id,
                };
                let actions = vec![
                    Action::Emit(NodeEvent::ChannelSignatureReceived {
                        channel_id: d.temporary_channel_id,
                    }),
                    Action::Blockchain(BlockchainRequest::WatchSpent {
                        outpoint: d.commit_input.outpoint,
                        tag: BitcoinEventTag::FundingSpent,
                    }),
                    Action::Blockchain(BlockchainRequest::WatchConfirmed {
                        txid: d.commit_input.outpoint.txid,
                        min_depth: d.minimum_depth,
                        tag: BitcoinEventTag::FundingDepthOk,
                    }),
                    Action::Blockchain(BlockchainRequest::PublishAsap(d.funding_tx.clone())),
                ];
                Ok((
                    ChannelState::WaitForFundingConfirmed(DataWaitForFundingConfirmed {
                        commitments,
                        deferred: None,
                        last_sent: Message::FundingCreated(d.last_sent),
                    }),
                    actions,
                ))
            }
            ChannelEvent::Message(Message::Error(_)) => Ok((ChannelState::Closed, vec![])),
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Ok((ChannelState::Closed, vec![Action::Reply(CommandResponse::Ok)]))
            }
            e => self.unhandled(ChannelState::WaitForFundingSigned(d), e),
        }
    }

    fn handle_wait_for_funding_confirmed(
        &mut self,
        mut d: DataWaitForFundingConfirmed,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Watch(WatchEvent::Confirmed {
                tag: BitcoinEventTag::FundingDepthOk,
                block_height,
                tx_index,
            }) => {
                let vout = d.commitments.commit_input.outpoint.vout as u16;
                let channel_id = short_channel_id(block_height, tx_index, vout);
                let temporary_channel_id = d.commitments.channel_id;
                let mut commitments = d.commitments;
                commitments.channel_id = channel_id;
                let funding_locked = FundingLocked {
                    temporary_channel_id,
                    channel_id,
                    next_per_commitment_point: commitments
                        .local_params
                        .keys
                        .per_commitment_point(&self.secp_ctx, 1),
                };
                let mut actions = vec![
                    Action::Emit(NodeEvent::ChannelIdAssigned { temporary_channel_id, channel_id }),
                    Action::Blockchain(BlockchainRequest::WatchLost {
                        txid: commitments.commit_input.outpoint.txid,
                        tag: BitcoinEventTag::FundingLost,
                    }),
                    Action::SendMessage(Message::FundingLocked(funding_locked.clone())),
                ];
                let next = ChannelState::WaitForFundingLocked(DataWaitForFundingLocked {
                    commitments,
                    short_channel_id: channel_id,
                    last_sent: funding_locked,
                });
                // Replay the peer's early funding_locked now that we have
                // confirmed ourselves.
                if let Some(deferred) = d.deferred.take() {
                    debug!("replaying deferred funding_locked");
                    let (next2, more) = self
                        .handle(next, ChannelEvent::Message(Message::FundingLocked(deferred)))?;
                    actions.extend(more);
                    return Ok((next2, actions));
                }
                Ok((next, actions))
            }
            ChannelEvent::Message(Message::FundingLocked(m)) => {
                // Not confirmed on our side yet; keep it for later.
                d.deferred = Some(m);
                Ok((ChannelState::WaitForFundingConfirmed(d), vec![]))
            }
            ChannelEvent::Watch(WatchEvent::Lost { tag: BitcoinEventTag::FundingLost }) => {
                warn!("funding transaction lost");
                Ok((ChannelState::ErrFundingLost, vec![]))
            }
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                self.handle_remote_spent(d.commitments, Default::default(), &tx)
            }
            ChannelEvent::Message(Message::Error(_)) => {
                let c = d.commitments.clone();
                let (state, actions) = self.spend_local_current(&c)?;
                Ok((state, actions))
            }
            e => self.unhandled(ChannelState::WaitForFundingConfirmed(d), e),
        }
    }

    fn handle_wait_for_funding_locked(
        &mut self,
        d: DataWaitForFundingLocked,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::FundingLocked(m)) => {
                if m.channel_id != d.short_channel_id {
                    // Differing views of the funding location cannot be
                    // reconciled yet.
                    return Err(protocol_violation(format!(
                        "funding_locked channel_id mismatch: {} != {}",
                        m.channel_id, d.short_channel_id
                    )));
                }
                let mut commitments = d.commitments;
                commitments.remote_next_commit_info =
                    NextRemoteCommitInfo::Point(m.next_per_commitment_point);
                if commitments.channel_flags & FLAG_ANNOUNCE_CHANNEL != 0 {
                    let ann_sigs = self.sign_announcement(&commitments, d.short_channel_id);
                    let actions =
                        vec![Action::SendMessage(Message::AnnouncementSignatures(ann_sigs.clone()))];
                    Ok((
                        ChannelState::WaitForAnnSignatures(DataWaitForAnnSignatures {
                            commitments,
                            short_channel_id: d.short_channel_id,
                            last_sent: ann_sigs,
                        }),
                        actions,
                    ))
                } else {
                    Ok((
                        ChannelState::Normal(DataNormal {
                            commitments,
                            short_channel_id: d.short_channel_id,
                            our_shutdown: None,
                            pending_announcements: None,
                        }),
                        vec![],
                    ))
                }
            }
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                self.handle_remote_spent(d.commitments, Default::default(), &tx)
            }
            ChannelEvent::Watch(WatchEvent::Lost { tag: BitcoinEventTag::FundingLost }) => {
                Ok((ChannelState::ErrFundingLost, vec![]))
            }
            ChannelEvent::Message(Message::Error(_)) => {
                let c = d.commitments.clone();
                self.spend_local_current(&c)
            }
            e => self.unhandled(ChannelState::WaitForFundingLocked(d), e),
        }
    }

    fn handle_wait_for_ann_signatures(
        &mut self,
        d: DataWaitForAnnSignatures,
        event: ChannelEvent,
    ) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::AnnouncementSignatures(remote_sigs)) => {
                let remote_node_id = self.require_remote_node_id()?;
                let pubkeys = d.commitments.local_params.keys.pubkeys(&self.secp_ctx);
                verify_announcement_signatures(
                    &self.secp_ctx,
                    &remote_sigs,
                    &self.node_params.node_id,
                    &remote_node_id,
                    &pubkeys.funding_pubkey,
                    &d.commitments.remote_params.pubkeys.funding_pubkey,
                )?;
                let local_sigs = self.sign_announcement(&d.commitments, d.short_channel_id);
                let channel = make_channel_announcement(
                    d.short_channel_id,
                    &self.node_params.node_id,
                    &remote_node_id,
                    &pubkeys.funding_pubkey,
                    &d.commitments.remote_params.pubkeys.funding_pubkey,
                    &local_sigs,
                    &remote_sigs,
                );
                let node = make_node_announcement(
                    &self.secp_ctx,
                    &self.node_params.node_secret,
                    &self.node_params.node_id,
                );
                let update = make_channel_update(
                    &self.secp_ctx,
                    &self.node_params.node_secret,
                    d.short_channel_id,
                    self.node_params.cltv_expiry_delta,
                    d.commitments.local_params.htlc_minimum_msat,
                    self.node_params.fee_base_msat,
                    self.node_params.fee_proportional_millionths,
                );
                let actions = vec![Action::Schedule {
                    delay_ms: BROADCAST_DELAY_MS,
                    event: ChannelEvent::AnnouncementsTick,
                }];
                Ok((
                    ChannelState::Normal(DataNormal {
                        commitments: d.commitments,
                        short_channel_id: d.short_channel_id,
                        our_shutdown: None,
                        pending_announcements: Some(Announcements { channel, node, update }),
                    }),
                    actions,
                ))
            }
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                self.handle_remote_spent(d.commitments, Default::default(), &tx)
            }
            ChannelEvent::Message(Message::Error(_)) => {
                let c = d.commitments.clone();
                self.spend_local_current(&c)
            }
            e => self.unhandled(ChannelState::WaitForAnnSignatures(d), e),
        }
    }

    fn sign_announcement(
        &self,
        commitments: &Commitments,
        short_channel_id: u64,
    ) -> AnnouncementSignatures {
        let remote_node_id = self.remote_node_id.expect("set at init");
        let pubkeys = commitments.local_params.keys.pubkeys(&self.secp_ctx);
        make_announcement_signatures(
            &self.secp_ctx,
            &self.node_params.node_secret,
            &commitments.local_params.keys.funding_key,
            short_channel_id,
            &self.node_params.node_id,
            &remote_node_id,
            &pubkeys.funding_pubkey,
            &commitments.remote_params.pubkeys.funding_pubkey,
        )
    }

    fn require_remote_node_id(&self) -> Result<PublicKey, ChannelError> {
        self.remote_node_id
            .ok_or_else(|| crate::error::internal_error("remote node id not set"))
    }

    // ===== normal operation =====

    // Run a signing round if there is anything to sign; set the re-sign
    // flag when one is already in flight.
    fn maybe_sign(
        &self,
        commitments: Commitments,
    ) -> Result<(Commitments, Vec<Action>), ChannelError> {
        if !commitments.local_has_changes() {
            return Ok((commitments, vec![]));
        }
        match &commitments.remote_next_commit_info {
            NextRemoteCommitInfo::Waiting(_) => {
                let mut c = commitments;
                if let NextRemoteCommitInfo::Waiting(w) = &mut c.remote_next_commit_info {
                    w.re_sign_asap = true;
                }
                Ok((c, vec![]))
            }
            NextRemoteCommitInfo::Point(_) => {
                let (c, msg) = commitments.send_commit(&self.secp_ctx)?;
                Ok((c, vec![Action::SendMessage(Message::CommitSig(msg))]))
            }
        }
    }

    fn handle_normal(&mut self, mut d: DataNormal, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Command(ChannelCommand::AddHtlc(cmd)) => {
                if d.our_shutdown.is_some() {
                    return Err(command_rejected("cannot add htlc while closing"));
                }
                let (c, add) = d.commitments.send_add(&cmd)?;
                d.commitments = c;
                let mut actions = vec![
                    Action::Relayer(RelayerNotification::Bind {
                        add: add.clone(),
                        origin: cmd.origin.clone(),
                    }),
                    Action::SendMessage(Message::UpdateAddHtlc(add)),
                    Action::Reply(CommandResponse::Ok),
                ];
                if cmd.commit {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Normal(d), actions))
            }
            ChannelEvent::Message(Message::UpdateAddHtlc(m)) => {
                d.commitments = d.commitments.receive_add(&m)?;
                Ok((ChannelState::Normal(d), vec![]))
            }
            ChannelEvent::Command(ChannelCommand::FulfillHtlc(cmd)) => {
                let (c, fulfill) = d.commitments.send_fulfill(&cmd)?;
                d.commitments = c;
                let mut actions = vec![
                    Action::SendMessage(Message::UpdateFulfillHtlc(fulfill)),
                    Action::Reply(CommandResponse::Ok),
                ];
                if cmd.commit {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Normal(d), actions))
            }
            ChannelEvent::Message(Message::UpdateFulfillHtlc(m)) => {
                match d.commitments.receive_fulfill(&m)? {
                    Applied::New((c, _add)) => {
                        d.commitments = c;
                        let actions =
                            vec![Action::Relayer(RelayerNotification::ForwardFulfill(m))];
                        Ok((ChannelState::Normal(d), actions))
                    }
                    Applied::Duplicate => Ok((ChannelState::Normal(d), vec![])),
                }
            }
            ChannelEvent::Command(ChannelCommand::FailHtlc(cmd)) => {
                let (c, fail) = d.commitments.send_fail(&cmd)?;
                d.commitments = c;
                let mut actions = vec![
                    Action::SendMessage(Message::UpdateFailHtlc(fail)),
                    Action::Reply(CommandResponse::Ok),
                ];
                if cmd.commit {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Normal(d), actions))
            }
            ChannelEvent::Message(Message::UpdateFailHtlc(m)) => {
                match d.commitments.receive_fail(&m)? {
                    Applied::New((c, _add)) => {
                        d.commitments = c;
                        let actions = vec![Action::Relayer(RelayerNotification::ForwardFail(m))];
                        Ok((ChannelState::Normal(d), actions))
                    }
                    Applied::Duplicate => Ok((ChannelState::Normal(d), vec![])),
                }
            }
            ChannelEvent::Command(ChannelCommand::Sign) => {
                let (c, actions) = self.maybe_sign(d.commitments)?;
                d.commitments = c;
                Ok((ChannelState::Normal(d), actions))
            }
            ChannelEvent::Message(Message::CommitSig(m)) => {
                match d.commitments.receive_commit(&self.secp_ctx, &m)? {
                    Applied::New((c, revocation)) => {
                        d.commitments = c;
                        let mut actions =
                            vec![Action::SendMessage(Message::RevokeAndAck(revocation))];
                        // Keep the ratchet turning while we have changes.
                        let (c, more) = self.maybe_sign(d.commitments)?;
                        d.commitments = c;
                        actions.extend(more);
                        Ok((ChannelState::Normal(d), actions))
                    }
                    Applied::Duplicate => Ok((ChannelState::Normal(d), vec![])),
                }
            }
            ChannelEvent::Message(Message::RevokeAndAck(m)) => {
                let re_sign_asap = match &d.commitments.remote_next_commit_info {
                    NextRemoteCommitInfo::Waiting(w) => w.re_sign_asap,
                    NextRemoteCommitInfo::Point(_) => false,
                };
                let (c, forwards) = d.commitments.receive_revocation(&self.secp_ctx, &m)?;
                d.commitments = c;
                let mut actions: Vec<Action> = forwards
                    .into_iter()
                    .map(|add| Action::Relayer(RelayerNotification::ForwardAdd(add)))
                    .collect();
                if re_sign_asap {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Normal(d), actions))
            }
            ChannelEvent::Command(ChannelCommand::Close(cmd)) => {
                self.handle_cmd_close(d, cmd)
            }
            ChannelEvent::Message(Message::Shutdown(m)) => self.handle_remote_shutdown(d, m),
            ChannelEvent::AnnouncementsTick => {
                let mut actions = vec![];
                if let Some(ann) = d.pending_announcements.take() {
                    actions.push(Action::Router(RouterMessage::ChannelAnnouncement(ann.channel)));
                    actions.push(Action::Router(RouterMessage::NodeAnnouncement(ann.node)));
                    actions.push(Action::Router(RouterMessage::ChannelUpdate(ann.update)));
                }
                Ok((ChannelState::Normal(d), actions))
            }
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                self.handle_remote_spent(d.commitments, Default::default(), &tx)
            }
            ChannelEvent::Watch(WatchEvent::Lost { tag: BitcoinEventTag::FundingLost }) => {
                Ok((ChannelState::ErrFundingLost, vec![]))
            }
            ChannelEvent::Message(Message::Error(m)) => {
                warn!("peer error: {}", m.data);
                let c = d.commitments.clone();
                self.spend_local_current(&c)
            }
            e => self.unhandled(ChannelState::Normal(d), e),
        }
    }

    fn handle_cmd_close(&mut self, mut d: DataNormal, cmd: CmdClose) -> HandlerResult {
        if d.our_shutdown.is_some() {
            return Err(command_rejected("shutdown already in progress"));
        }
        if d.commitments.local_has_changes() {
            return Err(command_rejected("cannot close with pending changes, sign first"));
        }
        let script = cmd
            .script_pubkey
            .unwrap_or_else(|| d.commitments.local_params.default_final_script_pubkey.clone());
        if !is_valid_final_script(&script) {
            return Err(command_rejected("invalid final script"));
        }
        let shutdown =
            Shutdown { channel_id: d.commitments.channel_id, script_pubkey: script };
        d.our_shutdown = Some(shutdown.clone());
        Ok((
            ChannelState::Normal(d),
            vec![
                Action::SendMessage(Message::Shutdown(shutdown)),
                Action::Reply(CommandResponse::Ok),
            ],
        ))
    }

    fn handle_remote_shutdown(&mut self, d: DataNormal, m: Shutdown) -> HandlerResult {
        // BOLT #2: no shutdown while the peer has uncommitted updates
        // outstanding toward us.
        if !d.commitments.remote_changes.proposed.is_empty() {
            return Err(protocol_violation("shutdown with unsigned proposed changes"));
        }
        if !is_valid_final_script(&m.script_pubkey) {
            return Err(protocol_violation("invalid shutdown script"));
        }
        let mut commitments = d.commitments;
        let mut actions = vec![];
        let local_shutdown = match d.our_shutdown {
            Some(s) => s,
            None => {
                // Flush our pending changes, then follow suit.
                let (c, more) = self.maybe_sign(commitments)?;
                commitments = c;
                actions.extend(more);
                let shutdown = Shutdown {
                    channel_id: commitments.channel_id,
                    script_pubkey: commitments.local_params.default_final_script_pubkey.clone(),
                };
                actions.push(Action::SendMessage(Message::Shutdown(shutdown.clone())));
                shutdown
            }
        };
        if commitments.has_no_pending_htlcs() {
            let (next, more) =
                self.begin_negotiation(commitments, local_shutdown, m)?;
            actions.extend(more);
            Ok((next, actions))
        } else {
            Ok((
                ChannelState::Shutdown(DataShutdown {
                    commitments,
                    local_shutdown,
                    remote_shutdown: m,
                }),
                actions,
            ))
        }
    }

    fn begin_negotiation(
        &mut self,
        commitments: Commitments,
        local_shutdown: Shutdown,
        remote_shutdown: Shutdown,
    ) -> HandlerResult {
        let fee = first_closing_fee(&commitments);
        let (_tx, sig) = make_closing_tx(
            &self.secp_ctx,
            &commitments,
            &local_shutdown.script_pubkey,
            &remote_shutdown.script_pubkey,
            fee,
        )?;
        let closing_signed =
            ClosingSigned { channel_id: commitments.channel_id, fee_satoshis: fee, signature: sig };
        let actions = vec![Action::SendMessage(Message::ClosingSigned(closing_signed.clone()))];
        Ok((
            ChannelState::Negotiating(DataNegotiating {
                commitments,
                local_shutdown,
                remote_shutdown,
                local_closing_signed: closing_signed,
            }),
            actions,
        ))
    }

    // ===== shutdown =====

    fn handle_shutdown_state(&mut self, mut d: DataShutdown, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Command(ChannelCommand::AddHtlc(_)) => {
                Err(command_rejected("cannot add htlc while closing"))
            }
            ChannelEvent::Message(Message::UpdateAddHtlc(_)) => {
                Err(protocol_violation("update_add_htlc during shutdown"))
            }
            ChannelEvent::Command(ChannelCommand::FulfillHtlc(cmd)) => {
                let (c, fulfill) = d.commitments.send_fulfill(&cmd)?;
                d.commitments = c;
                let mut actions = vec![
                    Action::SendMessage(Message::UpdateFulfillHtlc(fulfill)),
                    Action::Reply(CommandResponse::Ok),
                ];
                if cmd.commit {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Shutdown(d), actions))
            }
            ChannelEvent::Message(Message::UpdateFulfillHtlc(m)) => {
                match d.commitments.receive_fulfill(&m)? {
                    Applied::New((c, _)) => {
                        d.commitments = c;
                        Ok((
                            ChannelState::Shutdown(d),
                            vec![Action::Relayer(RelayerNotification::ForwardFulfill(m))],
                        ))
                    }
                    Applied::Duplicate => Ok((ChannelState::Shutdown(d), vec![])),
                }
            }
            ChannelEvent::Command(ChannelCommand::FailHtlc(cmd)) => {
                let (c, fail) = d.commitments.send_fail(&cmd)?;
                d.commitments = c;
                let mut actions = vec![
                    Action::SendMessage(Message::UpdateFailHtlc(fail)),
                    Action::Reply(CommandResponse::Ok),
                ];
                if cmd.commit {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Shutdown(d), actions))
            }
            ChannelEvent::Message(Message::UpdateFailHtlc(m)) => {
                match d.commitments.receive_fail(&m)? {
                    Applied::New((c, _)) => {
                        d.commitments = c;
                        Ok((
                            ChannelState::Shutdown(d),
                            vec![Action::Relayer(RelayerNotification::ForwardFail(m))],
                        ))
                    }
                    Applied::Duplicate => Ok((ChannelState::Shutdown(d), vec![])),
                }
            }
            ChannelEvent::Command(ChannelCommand::Sign) => {
                let (c, actions) = self.maybe_sign(d.commitments)?;
                d.commitments = c;
                Ok((ChannelState::Shutdown(d), actions))
            }
            ChannelEvent::Message(Message::CommitSig(m)) => {
                match d.commitments.receive_commit(&self.secp_ctx, &m)? {
                    Applied::New((c, revocation)) => {
                        d.commitments = c;
                        let mut actions =
                            vec![Action::SendMessage(Message::RevokeAndAck(revocation))];
                        if d.commitments.has_no_pending_htlcs() {
                            let (next, more) = self.begin_negotiation(
                                d.commitments,
                                d.local_shutdown,
                                d.remote_shutdown,
                            )?;
                            actions.extend(more);
                            return Ok((next, actions));
                        }
                        let (c, more) = self.maybe_sign(d.commitments)?;
                        d.commitments = c;
                        actions.extend(more);
                        Ok((ChannelState::Shutdown(d), actions))
                    }
                    Applied::Duplicate => Ok((ChannelState::Shutdown(d), vec![])),
                }
            }
            ChannelEvent::Message(Message::RevokeAndAck(m)) => {
                let re_sign_asap = match &d.commitments.remote_next_commit_info {
                    NextRemoteCommitInfo::Waiting(w) => w.re_sign_asap,
                    NextRemoteCommitInfo::Point(_) => false,
                };
                let (c, forwards) = d.commitments.receive_revocation(&self.secp_ctx, &m)?;
                d.commitments = c;
                let mut actions: Vec<Action> = forwards
                    .into_iter()
                    .map(|add| Action::Relayer(RelayerNotification::ForwardAdd(add)))
                    .collect();
                if d.commitments.has_no_pending_htlcs() {
                    let (next, more) = self.begin_negotiation(
                        d.commitments,
                        d.local_shutdown,
                        d.remote_shutdown,
                    )?;
                    actions.extend(more);
                    return Ok((next, actions));
                }
                if re_sign_asap {
                    let (c, more) = self.maybe_sign(d.commitments)?;
                    d.commitments = c;
                    actions.extend(more);
                }
                Ok((ChannelState::Shutdown(d), actions))
            }
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Err(command_rejected("shutdown already in progress"))
            }
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                self.handle_remote_spent(d.commitments, Default::default(), &tx)
            }
            ChannelEvent::Message(Message::Error(m)) => {
                warn!("peer error: {}", m.data);
                let c = d.commitments.clone();
                self.spend_local_current(&c)
            }
            e => self.unhandled(ChannelState::Shutdown(d), e),
        }
    }

    // ===== negotiating =====

    fn handle_negotiating(&mut self, mut d: DataNegotiating, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Message(Message::ClosingSigned(m)) => {
                let signed_tx = check_closing_signature(
                    &self.secp_ctx,
                    &d.commitments,
                    &d.local_shutdown.script_pubkey,
                    &d.remote_shutdown.script_pubkey,
                    m.fee_satoshis,
                    &m.signature,
                )?;
                if m.fee_satoshis == d.local_closing_signed.fee_satoshis {
                    // Agreement on our proposal.
                    return self.publish_mutual_close(d.commitments, signed_tx);
                }
                let next_fee =
                    next_closing_fee(d.local_closing_signed.fee_satoshis, m.fee_satoshis);
                if next_fee == m.fee_satoshis {
                    // The midpoint lands on their proposal; take it.
                    return self.publish_mutual_close(d.commitments, signed_tx);
                }
                let (_tx, sig) = make_closing_tx(
                    &self.secp_ctx,
                    &d.commitments,
                    &d.local_shutdown.script_pubkey,
                    &d.remote_shutdown.script_pubkey,
                    next_fee,
                )?;
                debug!(
                    "fee negotiation: theirs {} ours {} -> {}",
                    m.fee_satoshis, d.local_closing_signed.fee_satoshis, next_fee
                );
                let closing_signed = ClosingSigned {
                    channel_id: d.commitments.channel_id,
                    fee_satoshis: next_fee,
                    signature: sig,
                };
                d.local_closing_signed = closing_signed.clone();
                Ok((
                    ChannelState::Negotiating(d),
                    vec![Action::SendMessage(Message::ClosingSigned(closing_signed))],
                ))
            }
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                // The peer may have published an agreed close before our
                // final closing_signed reached it.
                let is_mutual_close = !tx.output.is_empty()
                    && tx.output.iter().all(|o| {
                        o.script_pubkey == d.local_shutdown.script_pubkey
                            || o.script_pubkey == d.remote_shutdown.script_pubkey
                    });
                if is_mutual_close {
                    return self.publish_mutual_close(d.commitments, tx);
                }
                self.handle_remote_spent(d.commitments, Default::default(), &tx)
            }
            ChannelEvent::Command(ChannelCommand::Close(_)) => {
                Err(command_rejected("close already negotiating"))
            }
            ChannelEvent::Message(Message::Error(m)) => {
                warn!("peer error: {}", m.data);
                let c = d.commitments.clone();
                self.spend_local_current(&c)
            }
            e => self.unhandled(ChannelState::Negotiating(d), e),
        }
    }

    fn publish_mutual_close(
        &mut self,
        commitments: Commitments,
        signed_tx: Transaction,
    ) -> HandlerResult {
        info!("mutual close agreed, publishing {}", signed_tx.txid());
        let actions = vec![
            Action::Blockchain(BlockchainRequest::PublishAsap(signed_tx.clone())),
            Action::Blockchain(BlockchainRequest::WatchConfirmed {
                txid: signed_tx.txid(),
                min_depth: CLAIM_CONFIRM_DEPTH,
                tag: BitcoinEventTag::CloseDone,
            }),
        ];
        let published =
            ClosingPublished { mutual_close_published: Some(signed_tx), ..Default::default() };
        Ok((ChannelState::Closing(DataClosing { commitments, published }), actions))
    }

    // ===== closing =====

    fn handle_closing(&mut self, mut d: DataClosing, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                let txid = tx.txid();
                let ours_already = d
                    .published
                    .mutual_close_published
                    .as_ref()
                    .map(|t| t.txid() == txid)
                    .unwrap_or(false)
                    || d.published
                        .local_commit_published
                        .as_ref()
                        .and_then(|l| l.commit_tx.as_ref())
                        .map(|t| t.txid() == txid)
                        .unwrap_or(false);
                if ours_already {
                    // Our own spend showing up on-chain.
                    return Ok((ChannelState::Closing(d), vec![]));
                }
                self.handle_remote_spent(d.commitments, d.published, &tx)
            }
            ChannelEvent::Watch(WatchEvent::Confirmed { tag, .. }) => {
                let done = match tag {
                    BitcoinEventTag::CloseDone => d.published.mutual_close_published.is_some(),
                    BitcoinEventTag::LocalCommitDone => {
                        d.published.local_commit_published.is_some()
                    }
                    BitcoinEventTag::RemoteCommitDone => {
                        d.published.remote_commit_published.is_some()
                    }
                    BitcoinEventTag::NextRemoteCommitDone => {
                        d.published.next_remote_commit_published.is_some()
                    }
                    BitcoinEventTag::PenaltyDone => {
                        !d.published.revoked_commit_published.is_empty()
                    }
                    _ => false,
                };
                if done {
                    info!("close confirmed ({:?})", tag);
                    Ok((ChannelState::Closed, vec![]))
                } else {
                    Ok((ChannelState::Closing(d), vec![]))
                }
            }
            ChannelEvent::Message(Message::Error(m)) => {
                warn!("peer error while closing: {}", m.data);
                if d.published.local_commit_published.is_none() {
                    let (lcp, actions) = self.make_local_commit_published(&d.commitments)?;
                    d.published.local_commit_published = Some(lcp);
                    Ok((ChannelState::Closing(d), actions))
                } else {
                    Ok((ChannelState::Closing(d), vec![]))
                }
            }
            ChannelEvent::Command(ChannelCommand::Close(_))
            | ChannelEvent::Command(ChannelCommand::AddHtlc(_))
            | ChannelEvent::Command(ChannelCommand::FulfillHtlc(_))
            | ChannelEvent::Command(ChannelCommand::FailHtlc(_))
            | ChannelEvent::Command(ChannelCommand::Sign) => {
                Err(command_rejected("channel is closing"))
            }
            e => self.unhandled(ChannelState::Closing(d), e),
        }
    }

    // ===== offline and reconnection =====

    fn handle_offline(&mut self, inner: ChannelState, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Reconnected => {
                let mut actions = vec![];
                let next = inner.clone();
                match &next {
                    ChannelState::WaitForAcceptChannel(d) => {
                        actions
                            .push(Action::SendMessage(Message::OpenChannel(d.last_sent.clone())));
                    }
                    ChannelState::WaitForFundingCreated(d) => {
                        actions
                            .push(Action::SendMessage(Message::AcceptChannel(d.last_sent.clone())));
                    }
                    ChannelState::WaitForFundingSigned(d) => {
                        actions.push(Action::SendMessage(Message::FundingCreated(
                            d.last_sent.clone(),
                        )));
                    }
                    ChannelState::WaitForFundingConfirmed(d) => {
                        actions.push(Action::SendMessage(d.last_sent.clone()));
                    }
                    ChannelState::WaitForFundingLocked(d) => {
                        actions
                            .push(Action::SendMessage(Message::FundingLocked(d.last_sent.clone())));
                    }
                    ChannelState::WaitForAnnSignatures(d) => {
                        actions.push(Action::SendMessage(Message::AnnouncementSignatures(
                            d.last_sent.clone(),
                        )));
                    }
                    ChannelState::Normal(d) => {
                        let c = &d.commitments;
                        // A brand-new channel has nothing in flight; the
                        // peer may have missed our announcement handshake.
                        if c.local_commit.index == 0
                            && c.remote_commit.index == 0
                            && c.remote_changes.proposed.is_empty()
                            && c.channel_flags & FLAG_ANNOUNCE_CHANNEL != 0
                        {
                            let sigs = self.sign_announcement(c, d.short_channel_id);
                            actions
                                .push(Action::SendMessage(Message::AnnouncementSignatures(sigs)));
                        }
                        for m in c.unacked_messages.iter() {
                            actions.push(Action::SendMessage(m.clone()));
                        }
                        if let Some(s) = &d.our_shutdown {
                            actions.push(Action::SendMessage(Message::Shutdown(s.clone())));
                        }
                        if c.local_has_changes()
                            && !c.remote_next_commit_info.is_waiting()
                        {
                            let mut d2 = d.clone();
                            let (c2, more) = self.maybe_sign(d2.commitments)?;
                            d2.commitments = c2;
                            actions.extend(more);
                            return Ok((ChannelState::Normal(d2), actions));
                        }
                    }
                    ChannelState::Shutdown(d) => {
                        for m in d.commitments.unacked_messages.iter() {
                            actions.push(Action::SendMessage(m.clone()));
                        }
                        actions.push(Action::SendMessage(Message::Shutdown(
                            d.local_shutdown.clone(),
                        )));
                    }
                    ChannelState::Negotiating(d) => {
                        actions.push(Action::SendMessage(Message::Shutdown(
                            d.local_shutdown.clone(),
                        )));
                        actions.push(Action::SendMessage(Message::ClosingSigned(
                            d.local_closing_signed.clone(),
                        )));
                    }
                    _ => {}
                }
                info!("reconnected in {}, replaying {} messages", next.name(), actions.len());
                Ok((next, actions))
            }
            // Off-chain progress is limited to queueing changes; signing
            // resumes after reconnection.
            ChannelEvent::Command(ChannelCommand::AddHtlc(cmd)) => match inner {
                ChannelState::Normal(mut d) if d.our_shutdown.is_none() => {
                    let (c, add) = d.commitments.send_add(&cmd)?;
                    d.commitments = c;
                    let actions = vec![
                        Action::Relayer(RelayerNotification::Bind { add, origin: cmd.origin }),
                        Action::Reply(CommandResponse::Ok),
                    ];
                    Ok((ChannelState::Offline(Box::new(ChannelState::Normal(d))), actions))
                }
                _ => Err(command_rejected("cannot add htlc in this state")),
            },
            ChannelEvent::Command(ChannelCommand::FulfillHtlc(cmd)) => match inner {
                ChannelState::Normal(mut d) => {
                    let (c, _fulfill) = d.commitments.send_fulfill(&cmd)?;
                    d.commitments = c;
                    Ok((
                        ChannelState::Offline(Box::new(ChannelState::Normal(d))),
                        vec![Action::Reply(CommandResponse::Ok)],
                    ))
                }
                ChannelState::Shutdown(mut d) => {
                    let (c, _fulfill) = d.commitments.send_fulfill(&cmd)?;
                    d.commitments = c;
                    Ok((
                        ChannelState::Offline(Box::new(ChannelState::Shutdown(d))),
                        vec![Action::Reply(CommandResponse::Ok)],
                    ))
                }
                _ => Err(command_rejected("cannot fulfill htlc in this state")),
            },
            ChannelEvent::Command(ChannelCommand::FailHtlc(cmd)) => match inner {
                ChannelState::Normal(mut d) => {
                    let (c, _fail) = d.commitments.send_fail(&cmd)?;
                    d.commitments = c;
                    Ok((
                        ChannelState::Offline(Box::new(ChannelState::Normal(d))),
                        vec![Action::Reply(CommandResponse::Ok)],
                    ))
                }
                _ => Err(command_rejected("cannot fail htlc in this state")),
            },
            // The chain does not wait for the peer.
            ChannelEvent::Watch(WatchEvent::Spent { tag: BitcoinEventTag::FundingSpent, tx }) => {
                match inner.commitments() {
                    Some(c) => {
                        let c = c.clone();
                        self.handle_remote_spent(c, Default::default(), &tx)
                    }
                    None => Ok((ChannelState::Offline(Box::new(inner)), vec![])),
                }
            }
            ChannelEvent::Watch(WatchEvent::Lost { tag: BitcoinEventTag::FundingLost }) => {
                Ok((ChannelState::ErrFundingLost, vec![]))
            }
            _ => Ok((ChannelState::Offline(Box::new(inner)), vec![])),
        }
    }

    fn handle_terminal(&mut self, state: ChannelState, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Command(ChannelCommand::Close(_))
            | ChannelEvent::Command(ChannelCommand::AddHtlc(_))
            | ChannelEvent::Command(ChannelCommand::FulfillHtlc(_))
            | ChannelEvent::Command(ChannelCommand::FailHtlc(_))
            | ChannelEvent::Command(ChannelCommand::Sign) => {
                Err(command_rejected(format!("channel is {}", state.name())))
            }
            _ => Ok((state, vec![])),
        }
    }

    // ===== unilateral close paths =====

    fn make_local_commit_published(
        &self,
        commitments: &Commitments,
    ) -> Result<(LocalCommitPublished, Vec<Action>), ChannelError> {
        let lcp = claim_current_local_commit_tx_outputs(
            &self.secp_ctx,
            commitments,
            self.node_params.claim_feerate_per_kw,
        )?;
        let mut actions = vec![];
        for tx in lcp.all_txs() {
            actions.push(Action::Blockchain(BlockchainRequest::PublishAsap(tx)));
        }
        let commit_txid = commitments.local_commit.publishable_txs.commit_tx.txid();
        actions.push(Action::Blockchain(BlockchainRequest::WatchConfirmed {
            txid: commit_txid,
            min_depth: CLAIM_CONFIRM_DEPTH,
            tag: BitcoinEventTag::LocalCommitDone,
        }));
        // The relayer learns preimages from counterparty spends of these
        // inputs.
        for tx in lcp
            .claim_main_delayed_output_tx
            .iter()
            .chain(lcp.htlc_success_txs.iter())
            .chain(lcp.htlc_timeout_txs.iter())
        {
            actions.push(Action::Blockchain(BlockchainRequest::WatchSpent {
                outpoint: tx.input[0].previous_output,
                tag: BitcoinEventTag::HtlcSpent,
            }));
        }
        Ok((lcp, actions))
    }

    /// Publish our current commitment and enter CLOSING
    fn spend_local_current(&self, commitments: &Commitments) -> HandlerResult {
        let (lcp, actions) = self.make_local_commit_published(commitments)?;
        let published =
            ClosingPublished { local_commit_published: Some(lcp), ..Default::default() };
        Ok((
            ChannelState::Closing(DataClosing { commitments: commitments.clone(), published }),
            actions,
        ))
    }

    // A funding spend we did not initiate: the peer's current commitment,
    // its signed-but-unrevoked next commitment, a revoked commitment, or
    // an information leak.
    fn handle_remote_spent(
        &mut self,
        commitments: Commitments,
        mut published: ClosingPublished,
        tx: &Transaction,
    ) -> HandlerResult {
        let txid = tx.txid();
        if txid == commitments.remote_commit.txid {
            info!("remote commit {} spent funding", txid);
            let rcp = claim_remote_commit_tx_outputs(
                &self.secp_ctx,
                &commitments,
                &commitments.remote_commit,
                tx,
                self.node_params.claim_feerate_per_kw,
            )?;
            let actions = self.watch_remote_claims(&rcp, BitcoinEventTag::RemoteCommitDone, txid);
            published.remote_commit_published = Some(rcp);
            return Ok((ChannelState::Closing(DataClosing { commitments, published }), actions));
        }
        if let NextRemoteCommitInfo::Waiting(w) = &commitments.remote_next_commit_info {
            if txid == w.next_remote_commit.txid {
                info!("next remote commit {} spent funding", txid);
                let next_remote_commit = w.next_remote_commit.clone();
                let rcp = claim_remote_commit_tx_outputs(
                    &self.secp_ctx,
                    &commitments,
                    &next_remote_commit,
                    tx,
                    self.node_params.claim_feerate_per_kw,
                )?;
                let actions =
                    self.watch_remote_claims(&rcp, BitcoinEventTag::NextRemoteCommitDone, txid);
                published.next_remote_commit_published = Some(rcp);
                return Ok((
                    ChannelState::Closing(DataClosing { commitments, published }),
                    actions,
                ));
            }
        }
        match claim_revoked_remote_commit_tx_outputs(
            &self.secp_ctx,
            &commitments,
            tx,
            self.node_params.claim_feerate_per_kw,
        )? {
            Some(rvk) => {
                warn!("revoked commit {} spent funding, publishing penalties", txid);
                let mut actions = vec![];
                for claim in rvk.claim_txs() {
                    actions.push(Action::Blockchain(BlockchainRequest::PublishAsap(claim)));
                }
                actions.push(Action::Blockchain(BlockchainRequest::WatchConfirmed {
                    txid,
                    min_depth: CLAIM_CONFIRM_DEPTH,
                    tag: BitcoinEventTag::PenaltyDone,
                }));
                published.revoked_commit_published.push(rvk);
                Ok((ChannelState::Closing(DataClosing { commitments, published }), actions))
            }
            None => {
                // Nothing we can recognize spent the funding output: our
                // counterparty knows something we don't.
                error!("information leak: unrecognized spend {} of funding", txid);
                let (_lcp, actions) = self.make_local_commit_published(&commitments)?;
                Ok((ChannelState::ErrInformationLeak, actions))
            }
        }
    }

    fn watch_remote_claims(
        &self,
        rcp: &RemoteCommitPublished,
        tag: BitcoinEventTag,
        commit_txid: bitcoin::Txid,
    ) -> Vec<Action> {
        let mut actions = vec![];
        for claim in rcp.claim_txs() {
            actions.push(Action::Blockchain(BlockchainRequest::PublishAsap(claim)));
        }
        actions.push(Action::Blockchain(BlockchainRequest::WatchConfirmed {
            txid: commit_txid,
            min_depth: CLAIM_CONFIRM_DEPTH,
            tag,
        }));
        for claim in rcp.claim_htlc_success_txs.iter().chain(rcp.claim_htlc_timeout_txs.iter()) {
            actions.push(Action::Blockchain(BlockchainRequest::WatchSpent {
                outpoint: claim.input[0].previous_output,
                tag: BitcoinEventTag::HtlcSpent,
            }));
        }
        actions
    }

    fn unhandled(&self, state: ChannelState, event: ChannelEvent) -> HandlerResult {
        match event {
            ChannelEvent::Command(_) => Err(command_rejected(format!(
                "command not valid in state {}",
                state.name()
            ))),
            e => {
                debug!("ignoring {:?} in {}", e, state.name());
                Ok((state, vec![]))
            }
        }
    }
}
