//! Mutual-close construction and fee negotiation, and claim transactions
//! for every unilateral outcome: our own commitment, the peer's current or
//! next commitment, and revoked commitments (penalties).
//!
//! Claim values are reduced by a fee computed from fixed weight estimates;
//! outputs whose value cannot cover that fee are left unclaimed.

use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use bitcoin::sighash::EcdsaSighashType;
use lightning::ln::chan_utils::{
    self, get_htlc_redeemscript, get_revokeable_redeemscript, ClosingTransaction,
    HTLCOutputInCommitment, TxCreationKeys,
};
use lightning::ln::channel_keys::{DelayedPaymentKey, RevocationKey};
use lightning::ln::PaymentPreimage;
use log::{debug, info, warn};

use crate::funding::only_static_remote_key_features;

use crate::commitments::{Commitments, Direction, RemoteCommit};
use crate::error::{internal_error, invalid_signature, protocol_violation, ChannelError};
use crate::tx::{
    add_funding_witness, claim_fee_sat, decode_commitment_index, sign_segwit_input,
    verify_segwit_input, CLAIM_HTLC_SUCCESS_WEIGHT, CLAIM_HTLC_TIMEOUT_WEIGHT,
    CLAIM_MAIN_DELAYED_WEIGHT, CLAIM_P2WPKH_OUTPUT_WEIGHT, HTLC_PENALTY_WEIGHT,
    MAIN_PENALTY_WEIGHT,
};
use crate::util::INITIAL_COMMITMENT_NUMBER;

/// Weight of the mutual close transaction, for the first fee proposal
pub const CLOSING_TX_WEIGHT: u64 = 706;

/// Everything we published after broadcasting our own commitment
#[derive(Debug, Clone, Default)]
pub struct LocalCommitPublished {
    /// Our signed commitment transaction
    pub commit_tx: Option<Transaction>,
    /// Sweep of our main output after `to_self_delay`
    pub claim_main_delayed_output_tx: Option<Transaction>,
    /// Second-stage transactions for received HTLCs we hold preimages for
    pub htlc_success_txs: Vec<Transaction>,
    /// Second-stage transactions for offered HTLCs past expiry
    pub htlc_timeout_txs: Vec<Transaction>,
    /// Sweeps of the second-stage outputs after `to_self_delay`
    pub claim_htlc_delayed_txs: Vec<Transaction>,
}

impl LocalCommitPublished {
    /// All transactions, broadcast order
    pub fn all_txs(&self) -> Vec<Transaction> {
        let mut txs = Vec::new();
        txs.extend(self.commit_tx.iter().cloned());
        txs.extend(self.claim_main_delayed_output_tx.iter().cloned());
        txs.extend(self.htlc_success_txs.iter().cloned());
        txs.extend(self.htlc_timeout_txs.iter().cloned());
        txs.extend(self.claim_htlc_delayed_txs.iter().cloned());
        txs
    }
}

/// Everything we published after the peer broadcast a commitment
#[derive(Debug, Clone, Default)]
pub struct RemoteCommitPublished {
    /// The peer's commitment transaction, as seen on-chain
    pub commit_tx: Option<Transaction>,
    /// Sweep of our main output (directly spendable)
    pub claim_main_output_tx: Option<Transaction>,
    /// Direct claims of HTLCs the peer offered, using known preimages
    pub claim_htlc_success_txs: Vec<Transaction>,
    /// Direct claims of HTLCs we offered, after expiry
    pub claim_htlc_timeout_txs: Vec<Transaction>,
}

impl RemoteCommitPublished {
    /// The transactions we want broadcast
    pub fn claim_txs(&self) -> Vec<Transaction> {
        let mut txs = Vec::new();
        txs.extend(self.claim_main_output_tx.iter().cloned());
        txs.extend(self.claim_htlc_success_txs.iter().cloned());
        txs.extend(self.claim_htlc_timeout_txs.iter().cloned());
        txs
    }
}

/// Penalties we published after the peer broadcast a revoked commitment
#[derive(Debug, Clone, Default)]
pub struct RevokedCommitPublished {
    /// The revoked commitment transaction, as seen on-chain
    pub commit_tx: Option<Transaction>,
    /// Penalty on the peer's main output via the revocation key
    pub main_penalty_tx: Option<Transaction>,
    /// Penalties on recognizable HTLC outputs
    pub htlc_penalty_txs: Vec<Transaction>,
    /// Sweep of our own main output
    pub claim_main_output_tx: Option<Transaction>,
}

impl RevokedCommitPublished {
    /// The transactions we want broadcast
    pub fn claim_txs(&self) -> Vec<Transaction> {
        let mut txs = Vec::new();
        txs.extend(self.main_penalty_tx.iter().cloned());
        txs.extend(self.htlc_penalty_txs.iter().cloned());
        txs.extend(self.claim_main_output_tx.iter().cloned());
        txs
    }
}

/// Whether a script is acceptable as a mutual-close destination, per
/// BOLT #2 (p2pkh, p2sh, p2wpkh or p2wsh)
pub fn is_valid_final_script(script: &ScriptBuf) -> bool {
    script.is_p2pkh() || script.is_p2sh() || script.is_v0_p2wpkh() || script.is_v0_p2wsh()
}

/// Our first mutual-close fee proposal, from the commitment feerate
pub fn first_closing_fee(commitments: &Commitments) -> u64 {
    commitments.local_commit.spec.feerate_per_kw as u64 * CLOSING_TX_WEIGHT / 1000
}

/// Midpoint of the two most recent fee proposals
pub fn next_closing_fee(local_fee_sat: u64, remote_fee_sat: u64) -> u64 {
    (local_fee_sat + remote_fee_sat) / 2
}

/// Build the mutual close transaction at the given fee and sign it.
///
/// The funder pays the fee out of its share. Outputs below the dust limit
/// are omitted.
pub fn make_closing_tx(
    secp_ctx: &Secp256k1<All>,
    commitments: &Commitments,
    local_script: &ScriptBuf,
    remote_script: &ScriptBuf,
    fee_sat: u64,
) -> Result<(Transaction, Signature), ChannelError> {
    let spec = &commitments.local_commit.spec;
    if !spec.htlcs.is_empty() {
        return Err(internal_error("mutual close with pending htlcs"));
    }
    let mut to_local_sat = spec.to_local_msat / 1000;
    let mut to_remote_sat = spec.to_remote_msat / 1000;
    if commitments.local_params.is_funder {
        to_local_sat = to_local_sat
            .checked_sub(fee_sat)
            .ok_or_else(|| protocol_violation("closing fee exceeds funder balance"))?;
    } else {
        to_remote_sat = to_remote_sat
            .checked_sub(fee_sat)
            .ok_or_else(|| protocol_violation("closing fee exceeds funder balance"))?;
    }
    if to_local_sat < commitments.local_params.dust_limit_sat {
        to_local_sat = 0;
    }
    if to_remote_sat < commitments.local_params.dust_limit_sat {
        to_remote_sat = 0;
    }

    let closing = ClosingTransaction::new(
        to_local_sat,
        to_remote_sat,
        local_script.clone(),
        remote_script.clone(),
        commitments.commit_input.outpoint,
    );
    let tx = closing.trust().built_transaction().clone();
    let sig = sign_segwit_input(
        secp_ctx,
        &tx,
        0,
        &commitments.commit_input.redeem_script,
        commitments.commit_input.amount_sat,
        &commitments.local_params.keys.funding_key,
    )?;
    Ok((tx, sig))
}

/// Verify the peer's `closing_signed` at its proposed fee and return the
/// fully signed close transaction
pub fn check_closing_signature(
    secp_ctx: &Secp256k1<All>,
    commitments: &Commitments,
    local_script: &ScriptBuf,
    remote_script: &ScriptBuf,
    remote_fee_sat: u64,
    remote_sig: &Signature,
) -> Result<Transaction, ChannelError> {
    let close_capacity = {
        let spec = &commitments.local_commit.spec;
        if commitments.local_params.is_funder {
            spec.to_local_msat / 1000
        } else {
            spec.to_remote_msat / 1000
        }
    };
    if remote_fee_sat > close_capacity {
        return Err(protocol_violation(format!(
            "closing fee {} exceeds available {}",
            remote_fee_sat, close_capacity
        )));
    }

    let (mut tx, local_sig) =
        make_closing_tx(secp_ctx, commitments, local_script, remote_script, remote_fee_sat)?;
    verify_segwit_input(
        secp_ctx,
        &tx,
        0,
        &commitments.commit_input.redeem_script,
        commitments.commit_input.amount_sat,
        remote_sig,
        &commitments.remote_params.pubkeys.funding_pubkey,
    )
    .map_err(|e| invalid_signature(format!("closing_signed: {}", e)))?;
    add_funding_witness(
        &mut tx,
        local_sig,
        *remote_sig,
        &commitments.local_params.keys.pubkeys(secp_ctx).funding_pubkey,
        &commitments.remote_params.pubkeys.funding_pubkey,
    );
    Ok(tx)
}

// A single-input claim skeleton, None when the value cannot pay the fee.
fn build_claim_tx(
    outpoint: OutPoint,
    value_sat: u64,
    fee_sat: u64,
    sequence: Sequence,
    lock_time: LockTime,
    destination: &ScriptBuf,
) -> Option<Transaction> {
    if value_sat <= fee_sat {
        debug!("not claiming {}:{}, value {} under fee {}", outpoint.txid, outpoint.vout, value_sat, fee_sat);
        return None;
    }
    Some(Transaction {
        version: 2,
        lock_time,
        input: vec![TxIn {
            previous_output: outpoint,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::default(),
        }],
        output: vec![TxOut { value: value_sat - fee_sat, script_pubkey: destination.clone() }],
    })
}

fn push_sig(witness: &mut Witness, sig: &Signature) {
    let mut ser = sig.serialize_der().to_vec();
    ser.push(EcdsaSighashType::All as u8);
    witness.push(ser);
}

// Spend a revokeable output, either through the delay branch (empty
// selector) or the revocation branch (selector 0x01).
fn spend_revokeable(
    secp_ctx: &Secp256k1<All>,
    tx: &mut Transaction,
    redeem_script: &ScriptBuf,
    value_sat: u64,
    key: &SecretKey,
    revocation_branch: bool,
) -> Result<(), ChannelError> {
    let sig = sign_segwit_input(secp_ctx, tx, 0, redeem_script, value_sat, key)?;
    let mut witness = Witness::default();
    push_sig(&mut witness, &sig);
    if revocation_branch {
        witness.push(vec![1u8]);
    } else {
        witness.push(Vec::new());
    }
    witness.push(redeem_script.as_bytes().to_vec());
    tx.input[0].witness = witness;
    Ok(())
}

fn find_output(tx: &Transaction, script_pubkey: &ScriptBuf) -> Option<(u32, u64)> {
    tx.output
        .iter()
        .enumerate()
        .find(|(_, o)| &o.script_pubkey == script_pubkey)
        .map(|(i, o)| (i as u32, o.value))
}

fn p2wpkh_script(pubkey: &PublicKey) -> ScriptBuf {
    let pk = bitcoin::PublicKey::new(*pubkey);
    ScriptBuf::new_v0_p2wpkh(&pk.wpubkey_hash().expect("compressed key"))
}

fn p2wpkh_script_code(pubkey: &PublicKey) -> ScriptBuf {
    let pk = bitcoin::PublicKey::new(*pubkey);
    ScriptBuf::new_p2pkh(&pk.pubkey_hash())
}

// Sweep a p2wpkh output paying `pubkey`, signing with `key`.
fn claim_p2wpkh_output(
    secp_ctx: &Secp256k1<All>,
    tx: &Transaction,
    pubkey: &PublicKey,
    key: &SecretKey,
    fee_sat: u64,
    destination: &ScriptBuf,
) -> Result<Option<Transaction>, ChannelError> {
    let script = p2wpkh_script(pubkey);
    let (vout, value) = match find_output(tx, &script) {
        Some(v) => v,
        None => return Ok(None),
    };
    let mut claim = match build_claim_tx(
        OutPoint { txid: tx.txid(), vout },
        value,
        fee_sat,
        Sequence::MAX,
        LockTime::ZERO,
        destination,
    ) {
        Some(t) => t,
        None => return Ok(None),
    };
    let sig = sign_segwit_input(secp_ctx, &claim, 0, &p2wpkh_script_code(pubkey), value, key)?;
    let mut witness = Witness::default();
    push_sig(&mut witness, &sig);
    witness.push(pubkey.serialize().to_vec());
    claim.input[0].witness = witness;
    Ok(Some(claim))
}

/// Build everything claimable from our own published commitment: the
/// delayed main output, the second-stage HTLC transactions we can complete,
/// and the delayed sweeps of their outputs.
pub fn claim_current_local_commit_tx_outputs(
    secp_ctx: &Secp256k1<All>,
    commitments: &Commitments,
    feerate_per_kw: u32,
) -> Result<LocalCommitPublished, ChannelError> {
    let keys = &commitments.local_params.keys;
    let local_commit = &commitments.local_commit;
    let commit_tx = local_commit.publishable_txs.commit_tx.clone();
    let per_commitment_point = keys.per_commitment_point(secp_ctx, local_commit.index);
    let pubkeys = keys.pubkeys(secp_ctx);
    let tx_keys = TxCreationKeys::derive_new(
        secp_ctx,
        &per_commitment_point,
        &pubkeys.delayed_payment_basepoint,
        &pubkeys.htlc_basepoint,
        &commitments.remote_params.pubkeys.revocation_basepoint,
        &commitments.remote_params.pubkeys.htlc_basepoint,
    );
    let delay = commitments.remote_params.to_self_delay;
    let revokeable_script = get_revokeable_redeemscript(
        &tx_keys.revocation_key,
        delay,
        &tx_keys.broadcaster_delayed_payment_key,
    );
    let delayed_key = chan_utils::derive_private_key(
        secp_ctx,
        &per_commitment_point,
        &keys.delayed_payment_base_key,
    );
    let destination = &commitments.local_params.default_final_script_pubkey;

    // Our main output, after the peer-imposed delay.
    let mut claim_main = None;
    if let Some((vout, value)) = find_output(&commit_tx, &revokeable_script.to_v0_p2wsh()) {
        if let Some(mut claim) = build_claim_tx(
            OutPoint { txid: commit_tx.txid(), vout },
            value,
            claim_fee_sat(feerate_per_kw, CLAIM_MAIN_DELAYED_WEIGHT),
            Sequence(delay as u32),
            LockTime::ZERO,
            destination,
        ) {
            spend_revokeable(secp_ctx, &mut claim, &revokeable_script, value, &delayed_key, false)?;
            claim_main = Some(claim);
        }
    }

    let preimages = commitments.known_preimages();
    let mut htlc_success_txs = Vec::new();
    let mut htlc_timeout_txs = Vec::new();
    let mut claim_htlc_delayed_txs = Vec::new();
    for entry in local_commit.publishable_txs.htlc_txs_and_sigs.iter() {
        let htlc = &entry.htlc_tx.htlc;
        let preimage = preimages.iter().find(|(h, _)| *h == htlc.payment_hash).map(|(_, r)| *r);
        let mut tx = entry.htlc_tx.tx.clone();
        if htlc.offered {
            crate::tx::add_htlc_witness(
                &mut tx,
                entry.local_sig,
                entry.remote_sig,
                None,
                &entry.htlc_tx.redeem_script,
            );
            htlc_timeout_txs.push(tx.clone());
        } else {
            let preimage = match preimage {
                Some(r) => r,
                // no preimage, nothing to do until the peer times it out
                None => continue,
            };
            crate::tx::add_htlc_witness(
                &mut tx,
                entry.local_sig,
                entry.remote_sig,
                Some(&preimage),
                &entry.htlc_tx.redeem_script,
            );
            htlc_success_txs.push(tx.clone());
        }

        // The second-stage output is revokeable just like the main output.
        if let Some(mut claim) = build_claim_tx(
            OutPoint { txid: tx.txid(), vout: 0 },
            tx.output[0].value,
            claim_fee_sat(feerate_per_kw, CLAIM_MAIN_DELAYED_WEIGHT),
            Sequence(delay as u32),
            LockTime::ZERO,
            destination,
        ) {
            spend_revokeable(
                secp_ctx,
                &mut claim,
                &revokeable_script,
                tx.output[0].value,
                &delayed_key,
                false,
            )?;
            claim_htlc_delayed_txs.push(claim);
        }
    }

    info!(
        "claiming local commit {}: main={} success={} timeout={}",
        commit_tx.txid(),
        claim_main.is_some(),
        htlc_success_txs.len(),
        htlc_timeout_txs.len()
    );
    Ok(LocalCommitPublished {
        commit_tx: Some(commit_tx),
        claim_main_delayed_output_tx: claim_main,
        htlc_success_txs,
        htlc_timeout_txs,
        claim_htlc_delayed_txs,
    })
}

/// Build everything claimable from a commitment the peer published
/// (current or next).
pub fn claim_remote_commit_tx_outputs(
    secp_ctx: &Secp256k1<All>,
    commitments: &Commitments,
    remote_commit: &RemoteCommit,
    tx: &Transaction,
    feerate_per_kw: u32,
) -> Result<RemoteCommitPublished, ChannelError> {
    let keys = &commitments.local_params.keys;
    let pubkeys = keys.pubkeys(secp_ctx);
    let remote_point = &remote_commit.remote_per_commitment_point;
    let tx_keys = TxCreationKeys::derive_new(
        secp_ctx,
        remote_point,
        &commitments.remote_params.pubkeys.delayed_payment_basepoint,
        &commitments.remote_params.pubkeys.htlc_basepoint,
        &pubkeys.revocation_basepoint,
        &pubkeys.htlc_basepoint,
    );
    let destination = &commitments.local_params.default_final_script_pubkey;

    // With a static remote key our main output pays our payment point
    // directly.
    let claim_main = claim_p2wpkh_output(
        secp_ctx,
        tx,
        &pubkeys.payment_point,
        &keys.payment_key,
        claim_fee_sat(feerate_per_kw, CLAIM_P2WPKH_OUTPUT_WEIGHT),
        destination,
    )?;

    let htlc_key = chan_utils::derive_private_key(secp_ctx, remote_point, &keys.htlc_base_key);
    let preimages = commitments.known_preimages();
    let features = only_static_remote_key_features();
    let mut claim_htlc_success_txs = Vec::new();
    let mut claim_htlc_timeout_txs = Vec::new();
    for htlc in remote_commit.spec.htlcs.iter() {
        let oic = HTLCOutputInCommitment {
            offered: htlc.direction == Direction::Outgoing,
            amount_msat: htlc.add.amount_msat,
            cltv_expiry: htlc.add.cltv_expiry,
            payment_hash: htlc.add.payment_hash,
            transaction_output_index: None,
        };
        let script = get_htlc_redeemscript(&oic, &features, &tx_keys);
        let (vout, value) = match find_output(tx, &script.to_v0_p2wsh()) {
            Some(v) => v,
            None => continue,
        };
        let outpoint = OutPoint { txid: tx.txid(), vout };
        match htlc.direction {
            // The peer offered this HTLC; claim it if we know the preimage.
            Direction::Outgoing => {
                let preimage: PaymentPreimage = match preimages
                    .iter()
                    .find(|(h, _)| *h == htlc.add.payment_hash)
                    .map(|(_, r)| *r)
                {
                    Some(r) => r,
                    None => continue,
                };
                if let Some(mut claim) = build_claim_tx(
                    outpoint,
                    value,
                    claim_fee_sat(feerate_per_kw, CLAIM_HTLC_SUCCESS_WEIGHT),
                    Sequence::MAX,
                    LockTime::ZERO,
                    destination,
                ) {
                    let sig = sign_segwit_input(secp_ctx, &claim, 0, &script, value, &htlc_key)?;
                    let mut witness = Witness::default();
                    push_sig(&mut witness, &sig);
                    witness.push(preimage.0.to_vec());
                    witness.push(script.as_bytes().to_vec());
                    claim.input[0].witness = witness;
                    claim_htlc_success_txs.push(claim);
                }
            }
            // We offered this HTLC; reclaim it after its expiry.
            Direction::Incoming => {
                if let Some(mut claim) = build_claim_tx(
                    outpoint,
                    value,
                    claim_fee_sat(feerate_per_kw, CLAIM_HTLC_TIMEOUT_WEIGHT),
                    Sequence::ZERO,
                    LockTime::from_consensus(htlc.add.cltv_expiry),
                    destination,
                ) {
                    let sig = sign_segwit_input(secp_ctx, &claim, 0, &script, value, &htlc_key)?;
                    let mut witness = Witness::default();
                    push_sig(&mut witness, &sig);
                    witness.push(Vec::new());
                    witness.push(script.as_bytes().to_vec());
                    claim.input[0].witness = witness;
                    claim_htlc_timeout_txs.push(claim);
                }
            }
        }
    }

    info!(
        "claiming remote commit {}: main={} success={} timeout={}",
        tx.txid(),
        claim_main.is_some(),
        claim_htlc_success_txs.len(),
        claim_htlc_timeout_txs.len()
    );
    Ok(RemoteCommitPublished {
        commit_tx: Some(tx.clone()),
        claim_main_output_tx: claim_main,
        claim_htlc_success_txs,
        claim_htlc_timeout_txs,
    })
}

/// Recognize a revoked remote commitment and punish every output we can
/// identify. Returns `None` when the transaction does not decode to a
/// commitment index whose revocation secret we hold.
pub fn claim_revoked_remote_commit_tx_outputs(
    secp_ctx: &Secp256k1<All>,
    commitments: &Commitments,
    tx: &Transaction,
    feerate_per_kw: u32,
) -> Result<Option<RevokedCommitPublished>, ChannelError> {
    let obscure_factor = commitments.commitment_obscure_factor(secp_ctx);
    let index = match decode_commitment_index(tx, obscure_factor) {
        Some(i) => i,
        None => return Ok(None),
    };
    let secret_bytes = match commitments
        .remote_per_commitment_secrets
        .get_secret(INITIAL_COMMITMENT_NUMBER - index)
    {
        Some(s) => s,
        None => {
            warn!("no revocation secret for commitment index {}", index);
            return Ok(None);
        }
    };
    let per_commitment_secret = SecretKey::from_slice(&secret_bytes)
        .map_err(|e| internal_error(format!("stored secret invalid: {}", e)))?;
    let per_commitment_point = PublicKey::from_secret_key(secp_ctx, &per_commitment_secret);

    let keys = &commitments.local_params.keys;
    let pubkeys = keys.pubkeys(secp_ctx);
    let revocation_key = chan_utils::derive_private_revocation_key(
        secp_ctx,
        &per_commitment_secret,
        &keys.revocation_base_key,
    );
    let revocation_pubkey = RevocationKey::from_basepoint(
        secp_ctx,
        &pubkeys.revocation_basepoint,
        &per_commitment_point,
    );
    let remote_delayed_key = DelayedPaymentKey::from_basepoint(
        secp_ctx,
        &commitments.remote_params.pubkeys.delayed_payment_basepoint,
        &per_commitment_point,
    );
    let destination = &commitments.local_params.default_final_script_pubkey;

    info!("revoked commitment {} at index {} detected", tx.txid(), index);

    // The peer's main output, spent through the revocation branch.
    let revokeable_script = get_revokeable_redeemscript(
        &revocation_pubkey,
        commitments.local_params.to_self_delay,
        &remote_delayed_key,
    );
    let mut main_penalty = None;
    if let Some((vout, value)) = find_output(tx, &revokeable_script.to_v0_p2wsh()) {
        if let Some(mut claim) = build_claim_tx(
            OutPoint { txid: tx.txid(), vout },
            value,
            claim_fee_sat(feerate_per_kw, MAIN_PENALTY_WEIGHT),
            Sequence::MAX,
            LockTime::ZERO,
            destination,
        ) {
            spend_revokeable(secp_ctx, &mut claim, &revokeable_script, value, &revocation_key, true)?;
            main_penalty = Some(claim);
        }
    }

    // Our own main output is unaffected by revocation.
    let claim_main = claim_p2wpkh_output(
        secp_ctx,
        tx,
        &pubkeys.payment_point,
        &keys.payment_key,
        claim_fee_sat(feerate_per_kw, CLAIM_P2WPKH_OUTPUT_WEIGHT),
        destination,
    )?;

    // Punish every HTLC output the revoked commitment carried. The spec
    // recorded when that commitment was revoked names them exactly; the
    // live specs cannot, as HTLCs settled since then are gone from both.
    let tx_keys = TxCreationKeys::derive_new(
        secp_ctx,
        &per_commitment_point,
        &commitments.remote_params.pubkeys.delayed_payment_basepoint,
        &commitments.remote_params.pubkeys.htlc_basepoint,
        &pubkeys.revocation_basepoint,
        &pubkeys.htlc_basepoint,
    );
    let features = only_static_remote_key_features();
    let revoked_htlcs = commitments
        .revoked_remote_specs
        .iter()
        .find(|(i, _)| *i == index)
        .map(|(_, spec)| spec.htlcs.as_slice())
        .unwrap_or(&[]);
    let mut htlc_penalty_txs = Vec::new();
    let mut claimed_vouts: Vec<u32> = Vec::new();
    for h in revoked_htlcs {
        let oic = HTLCOutputInCommitment {
            offered: h.direction == Direction::Outgoing,
            amount_msat: h.add.amount_msat,
            cltv_expiry: h.add.cltv_expiry,
            payment_hash: h.add.payment_hash,
            transaction_output_index: None,
        };
        let script = get_htlc_redeemscript(&oic, &features, &tx_keys);
        let spk = script.to_v0_p2wsh();
        // identical HTLCs share a script but occupy distinct outputs
        let (vout, value) = match tx
            .output
            .iter()
            .enumerate()
            .find(|(i, o)| o.script_pubkey == spk && !claimed_vouts.contains(&(*i as u32)))
            .map(|(i, o)| (i as u32, o.value))
        {
            Some(v) => v,
            None => continue,
        };
        claimed_vouts.push(vout);
        if let Some(mut claim) = build_claim_tx(
            OutPoint { txid: tx.txid(), vout },
            value,
            claim_fee_sat(feerate_per_kw, HTLC_PENALTY_WEIGHT),
            Sequence::MAX,
            LockTime::ZERO,
            destination,
        ) {
            let sig = sign_segwit_input(secp_ctx, &claim, 0, &script, value, &revocation_key)?;
            let mut witness = Witness::default();
            push_sig(&mut witness, &sig);
            witness.push(revocation_pubkey.to_public_key().serialize().to_vec());
            witness.push(script.as_bytes().to_vec());
            claim.input[0].witness = witness;
            htlc_penalty_txs.push(claim);
        }
    }

    Ok(Some(RevokedCommitPublished {
        commit_tx: Some(tx.clone()),
        main_penalty_tx: main_penalty,
        htlc_penalty_txs,
        claim_main_output_tx: claim_main,
    }))
}
