//! Opening-protocol helpers: parameter validation, the first commitment
//! pair, short channel ids and announcement signatures.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::{self, All, PublicKey, Secp256k1, SecretKey};
use bitcoin::Txid;
use lightning::chain;
use lightning::ln::chan_utils::{
    ChannelPublicKeys, ChannelTransactionParameters, CounterpartyChannelTransactionParameters,
};
use lightning::ln::channel_keys::{DelayedPaymentBasepoint, HtlcBasepoint, RevocationBasepoint};
use lightning::ln::features::ChannelTypeFeatures;

use crate::commitments::{CommitmentSpec, LocalParams, RemoteParams};
use crate::error::{internal_error, protocol_violation, ChannelError};
use crate::events::{ChannelAnnouncement, ChannelUpdate, NodeAnnouncement};
use crate::tx::{make_commit_txs, message_for, CommitTxs, FundingInput};
use crate::wire::{AcceptChannel, AnnouncementSignatures, OpenChannel};

/// BOLT #2 upper bound on concurrently offered HTLCs
pub const MAX_ACCEPTED_HTLCS: u16 = 483;
/// Largest `to_self_delay` we will agree to
pub const MAX_TO_SELF_DELAY: u16 = 2016;
/// The minimum negotiated dust limit, in satoshi
pub const MIN_DUST_LIMIT_SAT: u64 = 354;

/// Derive a per-commitment public key from a basepoint, per BOLT #3
pub fn derive_pubkey(
    secp_ctx: &Secp256k1<All>,
    per_commitment_point: &PublicKey,
    base_point: &PublicKey,
) -> Result<PublicKey, ChannelError> {
    let mut sha = sha256::Hash::engine();
    sha.input(&per_commitment_point.serialize());
    sha.input(&base_point.serialize());
    let res = sha256::Hash::from_engine(sha).to_byte_array();

    let hashkey = PublicKey::from_secret_key(
        secp_ctx,
        &SecretKey::from_slice(&res)
            .map_err(|e: secp256k1::Error| internal_error(format!("derive failed: {}", e)))?,
    );
    base_point
        .combine(&hashkey)
        .map_err(|e| internal_error(format!("derive failed: {}", e)))
}

/// Pack a funding location into a short channel id
pub fn short_channel_id(block_height: u32, tx_index: u32, output_index: u16) -> u64 {
    ((block_height as u64 & 0xFF_FFFF) << 40)
        | ((tx_index as u64 & 0xFF_FFFF) << 16)
        | (output_index as u64 & 0xFFFF)
}

/// Validate a peer's `open_channel` against our policy (fundee side)
pub fn validate_open_channel(open: &OpenChannel) -> Result<(), ChannelError> {
    if open.push_msat > open.funding_satoshis * 1000 {
        return Err(protocol_violation(format!(
            "push_msat {} exceeds funding {}",
            open.push_msat, open.funding_satoshis
        )));
    }
    if open.channel_reserve_satoshis > open.funding_satoshis {
        return Err(protocol_violation(format!(
            "channel_reserve {} exceeds funding {}",
            open.channel_reserve_satoshis, open.funding_satoshis
        )));
    }
    if open.dust_limit_satoshis < MIN_DUST_LIMIT_SAT {
        return Err(protocol_violation(format!("dust limit {} too low", open.dust_limit_satoshis)));
    }
    if open.dust_limit_satoshis > open.channel_reserve_satoshis {
        return Err(protocol_violation(format!(
            "dust limit {} exceeds reserve {}",
            open.dust_limit_satoshis, open.channel_reserve_satoshis
        )));
    }
    if open.to_self_delay > MAX_TO_SELF_DELAY {
        return Err(protocol_violation(format!("to_self_delay {} too large", open.to_self_delay)));
    }
    if open.max_accepted_htlcs > MAX_ACCEPTED_HTLCS {
        return Err(protocol_violation(format!(
            "max_accepted_htlcs {} exceeds protocol limit",
            open.max_accepted_htlcs
        )));
    }
    Ok(())
}

/// Validate a peer's `accept_channel` against what we offered (funder side)
pub fn validate_accept_channel(
    accept: &AcceptChannel,
    funding_satoshis: u64,
) -> Result<(), ChannelError> {
    if accept.channel_reserve_satoshis > funding_satoshis {
        return Err(protocol_violation(format!(
            "channel_reserve {} exceeds funding {}",
            accept.channel_reserve_satoshis, funding_satoshis
        )));
    }
    if accept.dust_limit_satoshis < MIN_DUST_LIMIT_SAT {
        return Err(protocol_violation(format!(
            "dust limit {} too low",
            accept.dust_limit_satoshis
        )));
    }
    if accept.dust_limit_satoshis > accept.channel_reserve_satoshis {
        return Err(protocol_violation(format!(
            "dust limit {} exceeds reserve {}",
            accept.dust_limit_satoshis, accept.channel_reserve_satoshis
        )));
    }
    if accept.to_self_delay > MAX_TO_SELF_DELAY {
        return Err(protocol_violation(format!("to_self_delay {} too large", accept.to_self_delay)));
    }
    if accept.max_accepted_htlcs > MAX_ACCEPTED_HTLCS {
        return Err(protocol_violation(format!(
            "max_accepted_htlcs {} exceeds protocol limit",
            accept.max_accepted_htlcs
        )));
    }
    Ok(())
}

/// The peer's parameters as negotiated in `open_channel`
pub fn remote_params_from_open(open: &OpenChannel) -> RemoteParams {
    RemoteParams {
        dust_limit_sat: open.dust_limit_satoshis,
        max_htlc_value_in_flight_msat: open.max_htlc_value_in_flight_msat,
        channel_reserve_sat: open.channel_reserve_satoshis,
        htlc_minimum_msat: open.htlc_minimum_msat,
        to_self_delay: open.to_self_delay,
        max_accepted_htlcs: open.max_accepted_htlcs,
        pubkeys: ChannelPublicKeys {
            funding_pubkey: open.funding_pubkey,
            revocation_basepoint: RevocationBasepoint(open.revocation_basepoint),
            payment_point: open.payment_basepoint,
            delayed_payment_basepoint: DelayedPaymentBasepoint(open.delayed_payment_basepoint),
            htlc_basepoint: HtlcBasepoint(open.htlc_basepoint),
        },
    }
}

/// The peer's parameters as negotiated in `accept_channel`
pub fn remote_params_from_accept(accept: &AcceptChannel) -> RemoteParams {
    RemoteParams {
        dust_limit_sat: accept.dust_limit_satoshis,
        max_htlc_value_in_flight_msat: accept.max_htlc_value_in_flight_msat,
        channel_reserve_sat: accept.channel_reserve_satoshis,
        htlc_minimum_msat: accept.htlc_minimum_msat,
        to_self_delay: accept.to_self_delay,
        max_accepted_htlcs: accept.max_accepted_htlcs,
        pubkeys: ChannelPublicKeys {
            funding_pubkey: accept.funding_pubkey,
            revocation_basepoint: RevocationBasepoint(accept.revocation_basepoint),
            payment_point: accept.payment_basepoint,
            delayed_payment_basepoint: DelayedPaymentBasepoint(accept.delayed_payment_basepoint),
            htlc_basepoint: HtlcBasepoint(accept.htlc_basepoint),
        },
    }
}

/// Channel parameters in the form the transaction builders expect
pub fn make_channel_parameters(
    secp_ctx: &Secp256k1<All>,
    local_params: &LocalParams,
    remote_params: &RemoteParams,
    commit_input: &FundingInput,
) -> ChannelTransactionParameters {
    ChannelTransactionParameters {
        holder_pubkeys: local_params.keys.pubkeys(secp_ctx),
        holder_selected_contest_delay: local_params.to_self_delay,
        is_outbound_from_holder: local_params.is_funder,
        counterparty_parameters: Some(CounterpartyChannelTransactionParameters {
            pubkeys: remote_params.pubkeys.clone(),
            selected_contest_delay: remote_params.to_self_delay,
        }),
        funding_outpoint: Some(chain::transaction::OutPoint {
            txid: commit_input.outpoint.txid,
            index: commit_input.outpoint.vout as u16,
        }),
        channel_type_features: only_static_remote_key_features(),
    }
}

/// Constructs a `ChannelTypeFeatures` with only `static_remotekey` set.
pub(crate) fn only_static_remote_key_features() -> ChannelTypeFeatures {
    let mut features = ChannelTypeFeatures::empty();
    features.set_static_remote_key_required();
    features
}

/// The first commitment pair and the funding input they spend
#[derive(Clone)]
#[allow(missing_docs)]
pub struct FirstCommitTxs {
    pub commit_input: FundingInput,
    pub local_spec: CommitmentSpec,
    pub local_commit_txs: CommitTxs,
    pub remote_spec: CommitmentSpec,
    pub remote_commit_txs: CommitTxs,
}

/// Build both sides' first commitment transactions.
///
/// Neither is signed yet; the funder signs the remote one into
/// `funding_created`, the fundee replies in kind with `funding_signed`.
pub fn make_first_commit_txs(
    secp_ctx: &Secp256k1<All>,
    local_params: &LocalParams,
    remote_params: &RemoteParams,
    funding_satoshis: u64,
    push_msat: u64,
    initial_feerate_per_kw: u32,
    funding_txid: Txid,
    funding_output_index: u16,
    remote_first_per_commitment_point: &PublicKey,
) -> Result<FirstCommitTxs, ChannelError> {
    let funding_msat = funding_satoshis * 1000;
    let (to_local_msat, to_remote_msat) = if local_params.is_funder {
        (funding_msat - push_msat, push_msat)
    } else {
        (push_msat, funding_msat - push_msat)
    };
    let local_spec = CommitmentSpec::initial(initial_feerate_per_kw, to_local_msat, to_remote_msat);
    let remote_spec = CommitmentSpec::initial(initial_feerate_per_kw, to_remote_msat, to_local_msat);

    let commit_input = FundingInput::new(
        funding_txid,
        funding_output_index,
        funding_satoshis,
        &local_params.keys.pubkeys(secp_ctx).funding_pubkey,
        &remote_params.pubkeys.funding_pubkey,
    );
    let channel_parameters =
        make_channel_parameters(secp_ctx, local_params, remote_params, &commit_input);

    let local_point = local_params.keys.per_commitment_point(secp_ctx, 0);
    let local_commit_txs = make_commit_txs(
        secp_ctx,
        &channel_parameters,
        true,
        &local_point,
        0,
        local_params.dust_limit_sat,
        &local_spec,
    )?;
    let remote_commit_txs = make_commit_txs(
        secp_ctx,
        &channel_parameters,
        false,
        remote_first_per_commitment_point,
        0,
        remote_params.dust_limit_sat,
        &remote_spec,
    )?;

    Ok(FirstCommitTxs { commit_input, local_spec, local_commit_txs, remote_spec, remote_commit_txs })
}

// The digest both endpoints sign to announce the channel. Endpoints are
// ordered by node id, as the announcement requires.
fn announcement_digest(
    short_channel_id: u64,
    node_id_1: &PublicKey,
    node_id_2: &PublicKey,
    bitcoin_key_1: &PublicKey,
    bitcoin_key_2: &PublicKey,
) -> bitcoin::secp256k1::Message {
    let mut data = Vec::with_capacity(8 + 33 * 4);
    data.extend_from_slice(&short_channel_id.to_be_bytes());
    data.extend_from_slice(&node_id_1.serialize());
    data.extend_from_slice(&node_id_2.serialize());
    data.extend_from_slice(&bitcoin_key_1.serialize());
    data.extend_from_slice(&bitcoin_key_2.serialize());
    message_for(&data)
}

fn ordered(local_node_id: &PublicKey, remote_node_id: &PublicKey) -> bool {
    local_node_id.serialize()[..] < remote_node_id.serialize()[..]
}

/// Sign the channel announcement with our node and funding keys
pub fn make_announcement_signatures(
    secp_ctx: &Secp256k1<All>,
    node_secret: &SecretKey,
    funding_key: &SecretKey,
    channel_id: u64,
    local_node_id: &PublicKey,
    remote_node_id: &PublicKey,
    local_funding_pubkey: &PublicKey,
    remote_funding_pubkey: &PublicKey,
) -> AnnouncementSignatures {
    let msg = if ordered(local_node_id, remote_node_id) {
        announcement_digest(
            channel_id,
            local_node_id,
            remote_node_id,
            local_funding_pubkey,
            remote_funding_pubkey,
        )
    } else {
        announcement_digest(
            channel_id,
            remote_node_id,
            local_node_id,
            remote_funding_pubkey,
            local_funding_pubkey,
        )
    };
    AnnouncementSignatures {
        channel_id,
        node_signature: secp_ctx.sign_ecdsa(&msg, node_secret),
        bitcoin_signature: secp_ctx.sign_ecdsa(&msg, funding_key),
    }
}

/// Verify the peer's announcement signatures
pub fn verify_announcement_signatures(
    secp_ctx: &Secp256k1<All>,
    sigs: &AnnouncementSignatures,
    local_node_id: &PublicKey,
    remote_node_id: &PublicKey,
    local_funding_pubkey: &PublicKey,
    remote_funding_pubkey: &PublicKey,
) -> Result<(), ChannelError> {
    let msg = if ordered(local_node_id, remote_node_id) {
        announcement_digest(
            sigs.channel_id,
            local_node_id,
            remote_node_id,
            local_funding_pubkey,
            remote_funding_pubkey,
        )
    } else {
        announcement_digest(
            sigs.channel_id,
            remote_node_id,
            local_node_id,
            remote_funding_pubkey,
            local_funding_pubkey,
        )
    };
    secp_ctx
        .verify_ecdsa(&msg, &sigs.node_signature, remote_node_id)
        .map_err(|e| protocol_violation(format!("bad announcement node sig: {}", e)))?;
    secp_ctx
        .verify_ecdsa(&msg, &sigs.bitcoin_signature, remote_funding_pubkey)
        .map_err(|e| protocol_violation(format!("bad announcement bitcoin sig: {}", e)))
}

/// Assemble the `channel_announcement` from both endpoints' signatures
pub fn make_channel_announcement(
    channel_id: u64,
    local_node_id: &PublicKey,
    remote_node_id: &PublicKey,
    local_funding_pubkey: &PublicKey,
    remote_funding_pubkey: &PublicKey,
    local_sigs: &AnnouncementSignatures,
    remote_sigs: &AnnouncementSignatures,
) -> ChannelAnnouncement {
    if ordered(local_node_id, remote_node_id) {
        ChannelAnnouncement {
            short_channel_id: channel_id,
            node_id_1: *local_node_id,
            node_id_2: *remote_node_id,
            bitcoin_key_1: *local_funding_pubkey,
            bitcoin_key_2: *remote_funding_pubkey,
            node_signature_1: local_sigs.node_signature,
            node_signature_2: remote_sigs.node_signature,
            bitcoin_signature_1: local_sigs.bitcoin_signature,
            bitcoin_signature_2: remote_sigs.bitcoin_signature,
        }
    } else {
        ChannelAnnouncement {
            short_channel_id: channel_id,
            node_id_1: *remote_node_id,
            node_id_2: *local_node_id,
            bitcoin_key_1: *remote_funding_pubkey,
            bitcoin_key_2: *local_funding_pubkey,
            node_signature_1: remote_sigs.node_signature,
            node_signature_2: local_sigs.node_signature,
            bitcoin_signature_1: remote_sigs.bitcoin_signature,
            bitcoin_signature_2: local_sigs.bitcoin_signature,
        }
    }
}

/// Sign a `node_announcement` for the event-stream and router
pub fn make_node_announcement(
    secp_ctx: &Secp256k1<All>,
    node_secret: &SecretKey,
    node_id: &PublicKey,
) -> NodeAnnouncement {
    let msg = message_for(&node_id.serialize());
    NodeAnnouncement { node_id: *node_id, signature: secp_ctx.sign_ecdsa(&msg, node_secret) }
}

/// Sign a `channel_update` advertising our relay policy
pub fn make_channel_update(
    secp_ctx: &Secp256k1<All>,
    node_secret: &SecretKey,
    channel_id: u64,
    cltv_expiry_delta: u16,
    htlc_minimum_msat: u64,
    fee_base_msat: u32,
    fee_proportional_millionths: u32,
) -> ChannelUpdate {
    let mut data = Vec::with_capacity(8 + 2 + 8 + 4 + 4);
    data.extend_from_slice(&channel_id.to_be_bytes());
    data.extend_from_slice(&cltv_expiry_delta.to_be_bytes());
    data.extend_from_slice(&htlc_minimum_msat.to_be_bytes());
    data.extend_from_slice(&fee_base_msat.to_be_bytes());
    data.extend_from_slice(&fee_proportional_millionths.to_be_bytes());
    let msg = message_for(&data);
    ChannelUpdate {
        short_channel_id: channel_id,
        cltv_expiry_delta,
        htlc_minimum_msat,
        fee_base_msat,
        fee_proportional_millionths,
        signature: secp_ctx.sign_ecdsa(&msg, node_secret),
    }
}
