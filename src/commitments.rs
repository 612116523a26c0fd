//! The per-channel dual commitment chain and its update algebra.
//!
//! `Commitments` is a value: every operation borrows the current value and
//! returns a new one, so a failed operation leaves the caller's state
//! untouched. The controller decides what a failure means; this module only
//! reports it.

use core::fmt;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::{ScriptBuf, Transaction, Txid};
use lightning::ln::chan_utils::{
    derive_private_key, get_commitment_transaction_number_obscure_factor, ChannelPublicKeys,
    ChannelTransactionParameters, CounterpartyCommitmentSecrets,
};
use lightning::ln::{PaymentHash, PaymentPreimage};

use crate::error::{
    command_rejected, insufficient_funds, protocol_violation, ChannelError,
};
use crate::events::{CmdAddHtlc, CmdFailHtlc, CmdFulfillHtlc};
use crate::keys::ChannelKeys;
use crate::tx::{
    add_funding_witness, commit_tx_fee_sat, make_commit_txs, sign_segwit_input,
    verify_segwit_input, FundingInput, HtlcTx,
};
use crate::util::INITIAL_COMMITMENT_NUMBER;
use crate::wire::{
    CommitSig, Message, RevokeAndAck, UpdateAddHtlc, UpdateFailHtlc, UpdateFulfillHtlc,
    UpdateMessage,
};

/// Local constants and policy for our side of the channel, fixed at open
#[derive(Debug, Clone)]
pub struct LocalParams {
    /// Our secret key material
    pub keys: ChannelKeys,
    /// Outputs below this are omitted from commitments we broadcast
    pub dust_limit_sat: u64,
    /// Cap on the total value of HTLCs the peer may offer us
    pub max_htlc_value_in_flight_msat: u64,
    /// Balance the peer must retain
    pub channel_reserve_sat: u64,
    /// Smallest HTLC we accept
    pub htlc_minimum_msat: u64,
    /// Delay we impose on the peer's to-self outputs
    pub to_self_delay: u16,
    /// Cap on the number of HTLCs the peer may offer us
    pub max_accepted_htlcs: u16,
    /// Whether we funded the channel (and therefore pay commit fees)
    pub is_funder: bool,
    /// Where mutual-close funds go unless a close command overrides it
    pub default_final_script_pubkey: ScriptBuf,
}

/// The peer's constants and policy, fixed at open
#[derive(Clone)]
pub struct RemoteParams {
    /// Outputs below this are omitted from commitments the peer broadcasts
    pub dust_limit_sat: u64,
    /// Cap on the total value of HTLCs we may offer
    pub max_htlc_value_in_flight_msat: u64,
    /// Balance we must retain
    pub channel_reserve_sat: u64,
    /// Smallest HTLC the peer accepts
    pub htlc_minimum_msat: u64,
    /// Delay the peer imposes on our to-self outputs
    pub to_self_delay: u16,
    /// Cap on the number of HTLCs we may offer
    pub max_accepted_htlcs: u16,
    /// The peer's funding pubkey and basepoints
    pub pubkeys: ChannelPublicKeys,
}

// Need to define manually because ChannelPublicKeys doesn't derive Debug.
impl fmt::Debug for RemoteParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteParams")
            .field("dust_limit_sat", &self.dust_limit_sat)
            .field("max_htlc_value_in_flight_msat", &self.max_htlc_value_in_flight_msat)
            .field("channel_reserve_sat", &self.channel_reserve_sat)
            .field("htlc_minimum_msat", &self.htlc_minimum_msat)
            .field("to_self_delay", &self.to_self_delay)
            .field("max_accepted_htlcs", &self.max_accepted_htlcs)
            .finish()
    }
}

/// Direction of an HTLC relative to the owner of a commitment spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Offered by the spec owner
    Outgoing,
    /// Offered to the spec owner
    Incoming,
}

/// An HTLC as it sits in a commitment spec
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct DirectedHtlc {
    pub direction: Direction,
    pub add: UpdateAddHtlc,
}

/// Balances and HTLC set of one commitment, from its owner's point of view.
///
/// Always recomputed by [CommitmentSpec::reduce]; never patched in place.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub struct CommitmentSpec {
    pub htlcs: Vec<DirectedHtlc>,
    pub feerate_per_kw: u32,
    pub to_local_msat: u64,
    pub to_remote_msat: u64,
}

impl CommitmentSpec {
    /// The initial spec of a freshly funded channel
    pub fn initial(feerate_per_kw: u32, to_local_msat: u64, to_remote_msat: u64) -> Self {
        CommitmentSpec { htlcs: Vec::new(), feerate_per_kw, to_local_msat, to_remote_msat }
    }

    fn add_htlc(&mut self, direction: Direction, add: &UpdateAddHtlc) -> Result<(), ChannelError> {
        match direction {
            Direction::Outgoing => {
                self.to_local_msat = self
                    .to_local_msat
                    .checked_sub(add.amount_msat)
                    .ok_or_else(|| insufficient_funds(format!("htlc {} overdraws sender", add.id)))?;
            }
            Direction::Incoming => {
                self.to_remote_msat = self
                    .to_remote_msat
                    .checked_sub(add.amount_msat)
                    .ok_or_else(|| insufficient_funds(format!("htlc {} overdraws sender", add.id)))?;
            }
        }
        self.htlcs.push(DirectedHtlc { direction, add: add.clone() });
        Ok(())
    }

    // Settle (fulfill or fail) the HTLC named by a message sent in
    // `sender`'s direction. A fulfill pays the settling side, a fail
    // refunds the offerer.
    fn settle_htlc(
        &mut self,
        sender: Direction,
        id: u64,
        fulfilled: bool,
    ) -> Result<(), ChannelError> {
        let target = match sender {
            Direction::Outgoing => Direction::Incoming,
            Direction::Incoming => Direction::Outgoing,
        };
        let pos = self
            .htlcs
            .iter()
            .position(|h| h.direction == target && h.add.id == id)
            .ok_or(ChannelError::UnknownHtlcId(id))?;
        let htlc = self.htlcs.remove(pos);
        let to_local = match (sender, fulfilled) {
            // we fulfilled an incoming htlc, the money is ours
            (Direction::Outgoing, true) => true,
            // we failed an incoming htlc, refund the peer
            (Direction::Outgoing, false) => false,
            // the peer fulfilled our htlc, the money is theirs
            (Direction::Incoming, true) => false,
            // the peer failed our htlc, refund us
            (Direction::Incoming, false) => true,
        };
        if to_local {
            self.to_local_msat += htlc.add.amount_msat;
        } else {
            self.to_remote_msat += htlc.add.amount_msat;
        }
        Ok(())
    }

    /// Apply a change stream to a spec. `local_changes` are updates sent by
    /// the spec owner, `remote_changes` updates sent by its peer. Adds are
    /// applied before settlements, as settlements may name fresh adds.
    pub fn reduce(
        spec: &CommitmentSpec,
        local_changes: &[UpdateMessage],
        remote_changes: &[UpdateMessage],
    ) -> Result<CommitmentSpec, ChannelError> {
        let mut out = spec.clone();
        for u in local_changes {
            if let UpdateMessage::Add(add) = u {
                out.add_htlc(Direction::Outgoing, add)?;
            }
        }
        for u in remote_changes {
            if let UpdateMessage::Add(add) = u {
                out.add_htlc(Direction::Incoming, add)?;
            }
        }
        for u in local_changes {
            match u {
                UpdateMessage::Fulfill(m) => out.settle_htlc(Direction::Outgoing, m.id, true)?,
                UpdateMessage::Fail(m) => out.settle_htlc(Direction::Outgoing, m.id, false)?,
                UpdateMessage::Add(_) => {}
            }
        }
        for u in remote_changes {
            match u {
                UpdateMessage::Fulfill(m) => out.settle_htlc(Direction::Incoming, m.id, true)?,
                UpdateMessage::Fail(m) => out.settle_htlc(Direction::Incoming, m.id, false)?,
                UpdateMessage::Add(_) => {}
            }
        }
        Ok(out)
    }

    /// Find an HTLC by direction and id
    pub fn find_htlc(&self, direction: Direction, id: u64) -> Option<&DirectedHtlc> {
        self.htlcs.iter().find(|h| h.direction == direction && h.add.id == id)
    }

    /// Total value of HTLCs in the given direction
    pub fn htlc_value_in_flight_msat(&self, direction: Direction) -> u64 {
        self.htlcs.iter().filter(|h| h.direction == direction).map(|h| h.add.amount_msat).sum()
    }

    /// Number of HTLCs in the given direction
    pub fn htlc_count(&self, direction: Direction) -> usize {
        self.htlcs.iter().filter(|h| h.direction == direction).count()
    }
}

/// A second-stage HTLC transaction with both signatures
#[derive(Debug, Clone)]
pub struct HtlcTxAndSigs {
    /// The transaction and its signing context
    pub htlc_tx: HtlcTx,
    /// Our signature
    pub local_sig: Signature,
    /// The peer's signature, received in `commit_sig`
    pub remote_sig: Signature,
}

/// The transactions we could broadcast for the current local commitment
#[derive(Debug, Clone)]
pub struct PublishableTxs {
    /// The fully signed commitment transaction
    pub commit_tx: Transaction,
    /// Second-stage HTLC transactions, both signatures attached on demand
    pub htlc_txs_and_sigs: Vec<HtlcTxAndSigs>,
}

/// Our current commitment
#[derive(Debug, Clone)]
pub struct LocalCommit {
    /// Commitment index, monotone non-decreasing
    pub index: u64,
    /// Balances and HTLCs from our point of view
    pub spec: CommitmentSpec,
    /// What we would broadcast on unilateral close
    pub publishable_txs: PublishableTxs,
    /// The peer's commitment signature, kept for replay detection
    pub remote_sig: Signature,
}

/// The peer's current commitment; we know its txid and spec, not its witness
#[derive(Debug, Clone)]
pub struct RemoteCommit {
    /// Commitment index, monotone non-decreasing
    pub index: u64,
    /// Balances and HTLCs from the peer's point of view
    pub spec: CommitmentSpec,
    /// Txid of the peer's commitment transaction
    pub txid: Txid,
    /// The per-commitment point the peer used for this commitment
    pub remote_per_commitment_point: PublicKey,
}

/// Our updates, staged by how far they have travelled
#[derive(Debug, Clone, Default)]
pub struct LocalChanges {
    /// Sent, not yet signed into the peer's next commitment
    pub proposed: Vec<UpdateMessage>,
    /// Signed into the peer's next commitment, awaiting their revocation
    pub signed: Vec<UpdateMessage>,
    /// Acknowledged; waiting to be folded into our next commitment
    pub acked: Vec<UpdateMessage>,
}

impl LocalChanges {
    /// All changes not yet folded into both commitments
    pub fn all(&self) -> Vec<UpdateMessage> {
        let mut v = self.signed.clone();
        v.extend(self.proposed.iter().cloned());
        v
    }

    fn is_empty(&self) -> bool {
        self.proposed.is_empty() && self.signed.is_empty() && self.acked.is_empty()
    }
}

/// The peer's updates, staged by how far they have travelled
#[derive(Debug, Clone, Default)]
pub struct RemoteChanges {
    /// Received, not yet folded into our commitment
    pub proposed: Vec<UpdateMessage>,
    /// Folded into our commitment, not yet signed back into theirs
    pub acked: Vec<UpdateMessage>,
    /// Signed into their next commitment, awaiting their revocation
    pub signed: Vec<UpdateMessage>,
}

impl RemoteChanges {
    fn is_empty(&self) -> bool {
        self.proposed.is_empty() && self.acked.is_empty() && self.signed.is_empty()
    }
}

/// Record of a `commit_sig` we sent and whose revocation is outstanding
#[derive(Debug, Clone)]
pub struct WaitingForRevocation {
    /// The remote commitment we signed
    pub next_remote_commit: RemoteCommit,
    /// The exact message we sent, for replay on reconnect
    pub sent: CommitSig,
    /// Start another signing round as soon as the revocation lands
    pub re_sign_asap: bool,
}

/// Either the peer's next per-commitment point (idle) or the in-flight
/// record of a remote commitment we signed and await revocation for.
/// Exactly one variant holds at any time.
#[derive(Debug, Clone)]
pub enum NextRemoteCommitInfo {
    /// A `commit_sig` we sent is not yet revoked
    Waiting(WaitingForRevocation),
    /// Idle; this is the point for the peer's next commitment
    Point(PublicKey),
}

impl NextRemoteCommitInfo {
    /// Whether a signing round is in flight
    pub fn is_waiting(&self) -> bool {
        matches!(self, NextRemoteCommitInfo::Waiting(_))
    }
}

/// Outcome of applying a peer message that may be a harmless replay
#[derive(Debug)]
pub enum Applied<T> {
    /// The message advanced the state
    New(T),
    /// Idempotent replay, nothing changed
    Duplicate,
}

/// The heart of the channel: both commitment chains and everything in
/// flight between them.
#[derive(Clone)]
#[allow(missing_docs)]
pub struct Commitments {
    pub local_params: LocalParams,
    pub remote_params: RemoteParams,
    /// BOLT #2 channel flags; bit 0 announces the channel
    pub channel_flags: u8,
    pub local_commit: LocalCommit,
    pub remote_commit: RemoteCommit,
    pub local_changes: LocalChanges,
    pub remote_changes: RemoteChanges,
    /// Next HTLC id on our side, strictly increasing
    pub local_next_htlc_id: u64,
    /// Next HTLC id on the peer's side, strictly increasing
    pub remote_next_htlc_id: u64,
    pub remote_next_commit_info: NextRemoteCommitInfo,
    /// Messages sent and not yet acknowledged by a revocation
    pub unacked_messages: Vec<Message>,
    /// The funding outpoint and script
    pub commit_input: FundingInput,
    /// Compressed store of every revealed remote revocation secret
    pub remote_per_commitment_secrets: CounterpartyCommitmentSecrets,
    /// HTLC-bearing specs of revoked remote commitments, by index.
    /// Penalty construction needs the HTLC set the peer's commitment
    /// actually carried, which the live specs no longer know once the
    /// HTLC settles.
    pub revoked_remote_specs: Vec<(u64, CommitmentSpec)>,
    /// Current channel id (temporary until funding confirms)
    pub channel_id: u64,
}

impl fmt::Debug for Commitments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commitments")
            .field("channel_id", &self.channel_id)
            .field("local_commit_index", &self.local_commit.index)
            .field("remote_commit_index", &self.remote_commit.index)
            .field("local_next_htlc_id", &self.local_next_htlc_id)
            .field("remote_next_htlc_id", &self.remote_next_htlc_id)
            .field("in_flight", &self.remote_next_commit_info.is_waiting())
            .field("unacked", &self.unacked_messages.len())
            .finish()
    }
}

impl Commitments {
    /// Channel parameters in the form the transaction builders expect
    pub fn channel_parameters(&self, secp_ctx: &Secp256k1<All>) -> ChannelTransactionParameters {
        crate::funding::make_channel_parameters(
            secp_ctx,
            &self.local_params,
            &self.remote_params,
            &self.commit_input,
        )
    }

    /// The obscure factor hiding commitment numbers in our commitments'
    /// locktime and sequence fields
    pub fn commitment_obscure_factor(&self, secp_ctx: &Secp256k1<All>) -> u64 {
        get_commitment_transaction_number_obscure_factor(
            &self.local_params.keys.pubkeys(secp_ctx).payment_point,
            &self.remote_params.pubkeys.payment_point,
            self.local_params.is_funder,
        )
    }

    /// Whether we have anything to put into the peer's next commitment
    pub fn local_has_changes(&self) -> bool {
        !self.remote_changes.acked.is_empty() || !self.local_changes.proposed.is_empty()
    }

    /// Whether the peer has anything to put into our next commitment
    pub fn remote_has_changes(&self) -> bool {
        !self.local_changes.acked.is_empty() || !self.remote_changes.proposed.is_empty()
    }

    /// Whether both chains are free of HTLCs and nothing is in flight
    pub fn has_no_pending_htlcs(&self) -> bool {
        self.local_commit.spec.htlcs.is_empty()
            && self.remote_commit.spec.htlcs.is_empty()
            && self.local_changes.is_empty()
            && self.remote_changes.is_empty()
    }

    /// Whether any HTLC on either chain has expired at `height`
    pub fn has_timedout_htlcs(&self, height: u32) -> bool {
        self.local_commit.spec.htlcs.iter().any(|h| h.add.cltv_expiry <= height)
            || self.remote_commit.spec.htlcs.iter().any(|h| h.add.cltv_expiry <= height)
    }

    /// Payment preimages we have revealed or are about to reveal
    pub fn known_preimages(&self) -> Vec<(PaymentHash, PaymentPreimage)> {
        let stages =
            [&self.local_changes.proposed, &self.local_changes.signed, &self.local_changes.acked];
        let mut out = Vec::new();
        for stage in stages {
            for u in stage.iter() {
                if let UpdateMessage::Fulfill(f) = u {
                    let hash =
                        PaymentHash(sha256::Hash::hash(&f.payment_preimage.0).to_byte_array());
                    out.push((hash, f.payment_preimage));
                }
            }
        }
        out
    }

    /// Add an HTLC offered by us.
    ///
    /// Failures are command rejections: the caller asked for something the
    /// channel cannot do right now, and no state changed.
    pub fn send_add(
        &self,
        cmd: &CmdAddHtlc,
    ) -> Result<(Commitments, UpdateAddHtlc), ChannelError> {
        if cmd.amount_msat < self.remote_params.htlc_minimum_msat {
            return Err(command_rejected(format!(
                "htlc amount {} below remote minimum {}",
                cmd.amount_msat, self.remote_params.htlc_minimum_msat
            )));
        }

        let add = UpdateAddHtlc {
            channel_id: self.channel_id,
            id: self.local_next_htlc_id,
            amount_msat: cmd.amount_msat,
            payment_hash: cmd.payment_hash,
            cltv_expiry: cmd.cltv_expiry,
            onion_routing_packet: cmd.onion_routing_packet.clone(),
        };

        let mut c = self.clone();
        c.local_next_htlc_id += 1;
        c.local_changes.proposed.push(UpdateMessage::Add(add.clone()));
        c.unacked_messages.push(Message::UpdateAddHtlc(add.clone()));

        // Project the peer's next commitment to check their limits on us.
        let reduced =
            CommitmentSpec::reduce(&c.remote_commit.spec, &c.remote_changes.acked, &c.local_changes.all())
                .map_err(|e| command_rejected(format!("cannot add htlc: {}", e)))?;
        let in_flight = reduced.htlc_value_in_flight_msat(Direction::Incoming);
        if in_flight > self.remote_params.max_htlc_value_in_flight_msat {
            return Err(command_rejected(format!(
                "in-flight htlc value {} exceeds remote limit {}",
                in_flight, self.remote_params.max_htlc_value_in_flight_msat
            )));
        }
        let count = reduced.htlc_count(Direction::Incoming);
        if count > self.remote_params.max_accepted_htlcs as usize {
            return Err(command_rejected(format!(
                "in-flight htlc count {} exceeds remote limit {}",
                count, self.remote_params.max_accepted_htlcs
            )));
        }
        let fee = if self.local_params.is_funder {
            commit_tx_fee_sat(reduced.feerate_per_kw, reduced.htlcs.len())
        } else {
            0
        };
        let our_balance_sat = reduced.to_remote_msat / 1000;
        if our_balance_sat < self.remote_params.channel_reserve_sat + fee {
            return Err(command_rejected(format!(
                "balance {} sat under remote reserve {} plus fee {}",
                our_balance_sat, self.remote_params.channel_reserve_sat, fee
            )));
        }

        Ok((c, add))
    }

    /// Apply an HTLC offered by the peer. Failures are protocol faults.
    pub fn receive_add(&self, add: &UpdateAddHtlc) -> Result<Commitments, ChannelError> {
        if add.id != self.remote_next_htlc_id {
            return Err(protocol_violation(format!(
                "unexpected htlc id {}, expected {}",
                add.id, self.remote_next_htlc_id
            )));
        }
        if add.amount_msat < self.local_params.htlc_minimum_msat {
            return Err(protocol_violation(format!(
                "htlc amount {} below our minimum {}",
                add.amount_msat, self.local_params.htlc_minimum_msat
            )));
        }

        let mut c = self.clone();
        c.remote_next_htlc_id += 1;
        c.remote_changes.proposed.push(UpdateMessage::Add(add.clone()));

        // Project our next commitment to check our limits on the peer.
        let reduced = CommitmentSpec::reduce(
            &c.local_commit.spec,
            &c.local_changes.acked,
            &c.remote_changes.proposed,
        )?;
        let in_flight = reduced.htlc_value_in_flight_msat(Direction::Incoming);
        if in_flight > self.local_params.max_htlc_value_in_flight_msat {
            return Err(protocol_violation(format!(
                "in-flight htlc value {} exceeds our limit {}",
                in_flight, self.local_params.max_htlc_value_in_flight_msat
            )));
        }
        let count = reduced.htlc_count(Direction::Incoming);
        if count > self.local_params.max_accepted_htlcs as usize {
            return Err(protocol_violation(format!(
                "in-flight htlc count {} exceeds our limit {}",
                count, self.local_params.max_accepted_htlcs
            )));
        }
        let fee = if self.local_params.is_funder {
            0
        } else {
            commit_tx_fee_sat(reduced.feerate_per_kw, reduced.htlcs.len())
        };
        let their_balance_sat = reduced.to_remote_msat / 1000;
        if their_balance_sat < self.local_params.channel_reserve_sat + fee {
            return Err(protocol_violation(format!(
                "peer balance {} sat under reserve {} plus fee {}",
                their_balance_sat, self.local_params.channel_reserve_sat, fee
            )));
        }

        Ok(c)
    }

    /// Fulfill an HTLC the peer offered us
    pub fn send_fulfill(
        &self,
        cmd: &CmdFulfillHtlc,
    ) -> Result<(Commitments, UpdateFulfillHtlc), ChannelError> {
        let htlc = self
            .remote_commit
            .spec
            .find_htlc(Direction::Outgoing, cmd.id)
            .ok_or_else(|| command_rejected(format!("unknown htlc id {}", cmd.id)))?;
        if self.settlement_pending(cmd.id) {
            return Err(command_rejected(format!("htlc {} already being settled", cmd.id)));
        }
        let hash = PaymentHash(sha256::Hash::hash(&cmd.payment_preimage.0).to_byte_array());
        if hash != htlc.add.payment_hash {
            return Err(command_rejected(format!("invalid preimage for htlc {}", cmd.id)));
        }

        let fulfill = UpdateFulfillHtlc {
            channel_id: self.channel_id,
            id: cmd.id,
            payment_preimage: cmd.payment_preimage,
        };
        let mut c = self.clone();
        c.local_changes.proposed.push(UpdateMessage::Fulfill(fulfill.clone()));
        c.unacked_messages.push(Message::UpdateFulfillHtlc(fulfill.clone()));
        Ok((c, fulfill))
    }

    /// Apply the peer's fulfill of an HTLC we offered. Returns the original
    /// add so the caller can settle upstream; replays are tolerated.
    pub fn receive_fulfill(
        &self,
        m: &UpdateFulfillHtlc,
    ) -> Result<Applied<(Commitments, UpdateAddHtlc)>, ChannelError> {
        let htlc = match self.local_commit.spec.find_htlc(Direction::Outgoing, m.id) {
            Some(h) => h.add.clone(),
            None if m.id < self.local_next_htlc_id => return Ok(Applied::Duplicate),
            None => return Err(protocol_violation(format!("fulfill of unknown htlc {}", m.id))),
        };
        let hash = PaymentHash(sha256::Hash::hash(&m.payment_preimage.0).to_byte_array());
        if hash != htlc.payment_hash {
            return Err(protocol_violation(format!("invalid preimage for htlc {}", m.id)));
        }
        let mut c = self.clone();
        c.remote_changes.proposed.push(UpdateMessage::Fulfill(m.clone()));
        Ok(Applied::New((c, htlc)))
    }

    /// Fail an HTLC the peer offered us
    pub fn send_fail(
        &self,
        cmd: &CmdFailHtlc,
    ) -> Result<(Commitments, UpdateFailHtlc), ChannelError> {
        if self.remote_commit.spec.find_htlc(Direction::Outgoing, cmd.id).is_none() {
            return Err(command_rejected(format!("unknown htlc id {}", cmd.id)));
        }
        if self.settlement_pending(cmd.id) {
            return Err(command_rejected(format!("htlc {} already being settled", cmd.id)));
        }
        let fail =
            UpdateFailHtlc { channel_id: self.channel_id, id: cmd.id, reason: cmd.reason.clone() };
        let mut c = self.clone();
        c.local_changes.proposed.push(UpdateMessage::Fail(fail.clone()));
        c.unacked_messages.push(Message::UpdateFailHtlc(fail.clone()));
        Ok((c, fail))
    }

    /// Apply the peer's fail of an HTLC we offered; replays are tolerated
    pub fn receive_fail(
        &self,
        m: &UpdateFailHtlc,
    ) -> Result<Applied<(Commitments, UpdateAddHtlc)>, ChannelError> {
        let htlc = match self.local_commit.spec.find_htlc(Direction::Outgoing, m.id) {
            Some(h) => h.add.clone(),
            None if m.id < self.local_next_htlc_id => return Ok(Applied::Duplicate),
            None => return Err(protocol_violation(format!("fail of unknown htlc {}", m.id))),
        };
        let mut c = self.clone();
        c.remote_changes.proposed.push(UpdateMessage::Fail(m.clone()));
        Ok(Applied::New((c, htlc)))
    }

    // A settlement for this id is already in our outgoing stream.
    fn settlement_pending(&self, id: u64) -> bool {
        self.local_changes.all().iter().chain(self.local_changes.acked.iter()).any(|u| match u {
            UpdateMessage::Fulfill(m) => m.id == id,
            UpdateMessage::Fail(m) => m.id == id,
            UpdateMessage::Add(_) => false,
        })
    }

    /// Sign the peer's next commitment.
    ///
    /// Moves our proposed changes (and their acked ones) into the signed
    /// stage and records the in-flight commitment awaiting revocation.
    pub fn send_commit(
        &self,
        secp_ctx: &Secp256k1<All>,
    ) -> Result<(Commitments, CommitSig), ChannelError> {
        let remote_point = match &self.remote_next_commit_info {
            NextRemoteCommitInfo::Point(p) => *p,
            NextRemoteCommitInfo::Waiting(_) => {
                return Err(command_rejected("cannot sign until the peer revokes"))
            }
        };
        if !self.local_has_changes() {
            return Err(command_rejected("cannot sign without changes"));
        }

        let spec = CommitmentSpec::reduce(
            &self.remote_commit.spec,
            &self.remote_changes.acked,
            &self.local_changes.all(),
        )?;
        let commit_txs = make_commit_txs(
            secp_ctx,
            &self.channel_parameters(secp_ctx),
            false,
            &remote_point,
            self.remote_commit.index + 1,
            self.remote_params.dust_limit_sat,
            &spec,
        )?;

        let keys = &self.local_params.keys;
        let commit_sig = sign_segwit_input(
            secp_ctx,
            &commit_txs.transaction(),
            0,
            &self.commit_input.redeem_script,
            self.commit_input.amount_sat,
            &keys.funding_key,
        )?;
        let htlc_key = derive_private_key(secp_ctx, &remote_point, &keys.htlc_base_key);
        let mut htlc_sigs = Vec::with_capacity(commit_txs.htlc_txs.len());
        for htlc_tx in commit_txs.htlc_txs.iter() {
            htlc_sigs.push(sign_segwit_input(
                secp_ctx,
                &htlc_tx.tx,
                0,
                &htlc_tx.redeem_script,
                htlc_tx.htlc.amount_msat / 1000,
                &htlc_key,
            )?);
        }

        let msg = CommitSig {
            channel_id: self.channel_id,
            signature: commit_sig,
            htlc_signatures: htlc_sigs,
        };
        let mut c = self.clone();
        c.local_changes.signed = c.local_changes.all();
        c.local_changes.proposed = Vec::new();
        c.remote_changes.signed = std::mem::take(&mut c.remote_changes.acked);
        c.remote_next_commit_info = NextRemoteCommitInfo::Waiting(WaitingForRevocation {
            next_remote_commit: RemoteCommit {
                index: self.remote_commit.index + 1,
                spec,
                txid: commit_txs.txid(),
                remote_per_commitment_point: remote_point,
            },
            sent: msg.clone(),
            re_sign_asap: false,
        });
        c.unacked_messages.push(Message::CommitSig(msg.clone()));
        Ok((c, msg))
    }

    /// Verify the peer's signatures on our next commitment and advance the
    /// local chain, producing the revocation of the previous commitment.
    pub fn receive_commit(
        &self,
        secp_ctx: &Secp256k1<All>,
        m: &CommitSig,
    ) -> Result<Applied<(Commitments, RevokeAndAck)>, ChannelError> {
        if !self.remote_has_changes() {
            if m.signature == self.local_commit.remote_sig {
                return Ok(Applied::Duplicate);
            }
            return Err(protocol_violation("commit_sig but no pending changes"));
        }

        let spec = CommitmentSpec::reduce(
            &self.local_commit.spec,
            &self.local_changes.acked,
            &self.remote_changes.proposed,
        )?;
        let next_index = self.local_commit.index + 1;
        let keys = &self.local_params.keys;
        let per_commitment_point = keys.per_commitment_point(secp_ctx, next_index);
        let commit_txs = make_commit_txs(
            secp_ctx,
            &self.channel_parameters(secp_ctx),
            true,
            &per_commitment_point,
            next_index,
            self.local_params.dust_limit_sat,
            &spec,
        )?;

        let mut commit_tx = commit_txs.transaction();
        verify_segwit_input(
            secp_ctx,
            &commit_tx,
            0,
            &self.commit_input.redeem_script,
            self.commit_input.amount_sat,
            &m.signature,
            &self.remote_params.pubkeys.funding_pubkey,
        )?;
        if m.htlc_signatures.len() != commit_txs.htlc_txs.len() {
            return Err(protocol_violation(format!(
                "got {} htlc sigs, expected {}",
                m.htlc_signatures.len(),
                commit_txs.htlc_txs.len()
            )));
        }

        // The peer signs our HTLC transactions with its htlc key derived
        // from our per-commitment point.
        let remote_htlc_pubkey = crate::funding::derive_pubkey(
            secp_ctx,
            &per_commitment_point,
            &self.remote_params.pubkeys.htlc_basepoint.0,
        )?;
        let local_htlc_key = derive_private_key(secp_ctx, &per_commitment_point, &keys.htlc_base_key);
        let mut htlc_txs_and_sigs = Vec::with_capacity(commit_txs.htlc_txs.len());
        for (htlc_tx, remote_sig) in commit_txs.htlc_txs.iter().zip(m.htlc_signatures.iter()) {
            verify_segwit_input(
                secp_ctx,
                &htlc_tx.tx,
                0,
                &htlc_tx.redeem_script,
                htlc_tx.htlc.amount_msat / 1000,
                remote_sig,
                &remote_htlc_pubkey,
            )
            .map_err(|e| {
                protocol_violation(format!("bad htlc sig for output {:?}: {}", htlc_tx.htlc.transaction_output_index, e))
            })?;
            let local_sig = sign_segwit_input(
                secp_ctx,
                &htlc_tx.tx,
                0,
                &htlc_tx.redeem_script,
                htlc_tx.htlc.amount_msat / 1000,
                &local_htlc_key,
            )?;
            htlc_txs_and_sigs.push(HtlcTxAndSigs {
                htlc_tx: htlc_tx.clone(),
                local_sig,
                remote_sig: *remote_sig,
            });
        }

        let local_funding_sig = sign_segwit_input(
            secp_ctx,
            &commit_tx,
            0,
            &self.commit_input.redeem_script,
            self.commit_input.amount_sat,
            &keys.funding_key,
        )?;
        add_funding_witness(
            &mut commit_tx,
            local_funding_sig,
            m.signature,
            &keys.pubkeys(secp_ctx).funding_pubkey,
            &self.remote_params.pubkeys.funding_pubkey,
        );

        // Revoke the commitment we are replacing and commit to the one
        // after next.
        let revocation = RevokeAndAck {
            channel_id: self.channel_id,
            per_commitment_secret: keys.per_commitment_secret(self.local_commit.index),
            next_per_commitment_point: keys.per_commitment_point(secp_ctx, next_index + 1),
        };

        let mut c = self.clone();
        c.local_commit = LocalCommit {
            index: next_index,
            spec,
            publishable_txs: PublishableTxs { commit_tx, htlc_txs_and_sigs },
            remote_sig: m.signature,
        };
        c.local_changes.acked = Vec::new();
        let newly_acked = std::mem::take(&mut c.remote_changes.proposed);
        c.remote_changes.acked.extend(newly_acked);
        c.unacked_messages.push(Message::RevokeAndAck(revocation.clone()));
        Ok(Applied::New((c, revocation)))
    }

    /// Apply the peer's revocation of its previous commitment.
    ///
    /// Returns the peer adds that are now irrevocably committed on both
    /// chains and must be forwarded to the relayer.
    pub fn receive_revocation(
        &self,
        secp_ctx: &Secp256k1<All>,
        m: &RevokeAndAck,
    ) -> Result<(Commitments, Vec<UpdateAddHtlc>), ChannelError> {
        let waiting = match &self.remote_next_commit_info {
            NextRemoteCommitInfo::Waiting(w) => w.clone(),
            NextRemoteCommitInfo::Point(_) => {
                return Err(protocol_violation("unexpected revoke_and_ack"))
            }
        };
        let revealed_point = PublicKey::from_secret_key(secp_ctx, &m.per_commitment_secret);
        if revealed_point != self.remote_commit.remote_per_commitment_point {
            return Err(protocol_violation("revocation secret does not match commitment point"));
        }

        let mut c = self.clone();
        c.remote_per_commitment_secrets
            .provide_secret(
                INITIAL_COMMITMENT_NUMBER - self.remote_commit.index,
                m.per_commitment_secret.secret_bytes(),
            )
            .map_err(|()| protocol_violation("revocation secret inconsistent with store"))?;

        let forwards: Vec<UpdateAddHtlc> = c
            .remote_changes
            .signed
            .iter()
            .filter_map(|u| match u {
                UpdateMessage::Add(add) => Some(add.clone()),
                _ => None,
            })
            .collect();

        let newly_acked = std::mem::take(&mut c.local_changes.signed);
        c.local_changes.acked.extend(newly_acked);
        c.remote_changes.signed = Vec::new();
        // The commitment being revoked right now is the one we may have to
        // punish later; remember its HTLC set while we still have it.
        if !c.remote_commit.spec.htlcs.is_empty() {
            c.revoked_remote_specs.push((c.remote_commit.index, c.remote_commit.spec.clone()));
        }
        c.remote_commit = waiting.next_remote_commit;
        c.remote_next_commit_info = NextRemoteCommitInfo::Point(m.next_per_commitment_point);
        c.unacked_messages = Vec::new();
        Ok((c, forwards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_add(id: u64, amount_msat: u64) -> UpdateMessage {
        UpdateMessage::Add(UpdateAddHtlc {
            channel_id: 1,
            id,
            amount_msat,
            payment_hash: PaymentHash([id as u8; 32]),
            cltv_expiry: 500,
            onion_routing_packet: vec![],
        })
    }

    fn spec() -> CommitmentSpec {
        CommitmentSpec::initial(1_000, 700_000_000, 300_000_000)
    }

    #[test]
    fn reduce_moves_add_amounts_out_of_balances() {
        let out = CommitmentSpec::reduce(&spec(), &[make_add(0, 50_000_000)], &[]).unwrap();
        assert_eq!(out.to_local_msat, 650_000_000);
        assert_eq!(out.to_remote_msat, 300_000_000);
        assert_eq!(out.htlcs.len(), 1);
        assert_eq!(out.htlc_count(Direction::Outgoing), 1);
    }

    #[test]
    fn fulfill_pays_the_settling_side() {
        // the peer adds, we fulfill: the amount becomes ours
        let changes_remote = vec![make_add(0, 40_000_000)];
        let fulfill = UpdateMessage::Fulfill(UpdateFulfillHtlc {
            channel_id: 1,
            id: 0,
            payment_preimage: PaymentPreimage([0; 32]),
        });
        let out = CommitmentSpec::reduce(&spec(), &[fulfill], &changes_remote).unwrap();
        assert!(out.htlcs.is_empty());
        assert_eq!(out.to_local_msat, 740_000_000);
        assert_eq!(out.to_remote_msat, 260_000_000);
    }

    #[test]
    fn fail_refunds_the_offerer() {
        let changes_remote = vec![make_add(0, 40_000_000)];
        let fail =
            UpdateMessage::Fail(UpdateFailHtlc { channel_id: 1, id: 0, reason: vec![1] });
        let out = CommitmentSpec::reduce(&spec(), &[fail], &changes_remote).unwrap();
        assert!(out.htlcs.is_empty());
        assert_eq!(out.to_local_msat, 700_000_000);
        assert_eq!(out.to_remote_msat, 300_000_000);
    }

    #[test]
    fn settling_an_unknown_htlc_fails() {
        let fulfill = UpdateMessage::Fulfill(UpdateFulfillHtlc {
            channel_id: 1,
            id: 9,
            payment_preimage: PaymentPreimage([0; 32]),
        });
        let err = CommitmentSpec::reduce(&spec(), &[fulfill], &[]).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownHtlcId(9)));
    }

    #[test]
    fn overdrawing_add_fails() {
        let err =
            CommitmentSpec::reduce(&spec(), &[make_add(0, 700_000_001)], &[]).unwrap_err();
        assert!(matches!(err, ChannelError::InsufficientFunds(_)));
    }
}
