//! Deterministic transaction construction and signature plumbing.
//!
//! Commitment and second-stage HTLC transactions are rebuilt locally via
//! `lightning::ln::chan_utils` so that every signature we produce or verify
//! is over a transaction we composed ourselves.

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{OutPoint, Script, ScriptBuf, Transaction, Txid};
use lightning::ln::chan_utils::{
    build_htlc_transaction, get_htlc_redeemscript, make_funding_redeemscript,
    ChannelTransactionParameters, CommitmentTransaction, HTLCOutputInCommitment, TxCreationKeys,
};
use lightning::ln::PaymentPreimage;
use serde_derive::{Deserialize, Serialize};

use crate::commitments::{CommitmentSpec, Direction};
use crate::error::{insufficient_funds, internal_error, invalid_signature, ChannelError};
use crate::util::INITIAL_COMMITMENT_NUMBER;

/// Weight of a commitment transaction with no HTLC outputs
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;
/// Additional commitment weight per HTLC output
pub const COMMITMENT_TX_WEIGHT_PER_HTLC: u64 = 172;
/// Weight of a second-stage HTLC-timeout transaction
pub const HTLC_TIMEOUT_TX_WEIGHT: u64 = 663;
/// Weight of a second-stage HTLC-success transaction
pub const HTLC_SUCCESS_TX_WEIGHT: u64 = 703;

// Claim transaction weights, used to deduct a fee from the claimed amount.
pub(crate) const CLAIM_MAIN_DELAYED_WEIGHT: u64 = 483;
pub(crate) const CLAIM_P2WPKH_OUTPUT_WEIGHT: u64 = 438;
pub(crate) const CLAIM_HTLC_SUCCESS_WEIGHT: u64 = 571;
pub(crate) const CLAIM_HTLC_TIMEOUT_WEIGHT: u64 = 545;
pub(crate) const MAIN_PENALTY_WEIGHT: u64 = 484;
pub(crate) const HTLC_PENALTY_WEIGHT: u64 = 578;

/// The funding outpoint and how to spend it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingInput {
    /// The funding outpoint
    pub outpoint: OutPoint,
    /// The 2-of-2 redeem script
    pub redeem_script: ScriptBuf,
    /// The funding amount
    pub amount_sat: u64,
}

impl FundingInput {
    /// Build the funding input description from its parts
    pub fn new(
        txid: Txid,
        output_index: u16,
        amount_sat: u64,
        local_funding_pubkey: &PublicKey,
        remote_funding_pubkey: &PublicKey,
    ) -> Self {
        FundingInput {
            outpoint: OutPoint { txid, vout: output_index as u32 },
            redeem_script: make_funding_redeemscript(local_funding_pubkey, remote_funding_pubkey),
            amount_sat,
        }
    }

    /// The scriptpubkey of the funding output
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.redeem_script.to_v0_p2wsh()
    }
}

/// Fee of a commitment transaction at the given rate
pub fn commit_tx_fee_sat(feerate_per_kw: u32, num_untrimmed_htlcs: usize) -> u64 {
    feerate_per_kw as u64
        * (COMMITMENT_TX_BASE_WEIGHT + COMMITMENT_TX_WEIGHT_PER_HTLC * num_untrimmed_htlcs as u64)
        / 1000
}

/// Fee of a second-stage HTLC-timeout transaction
pub fn htlc_timeout_fee_sat(feerate_per_kw: u32) -> u64 {
    feerate_per_kw as u64 * HTLC_TIMEOUT_TX_WEIGHT / 1000
}

/// Fee of a second-stage HTLC-success transaction
pub fn htlc_success_fee_sat(feerate_per_kw: u32) -> u64 {
    feerate_per_kw as u64 * HTLC_SUCCESS_TX_WEIGHT / 1000
}

pub(crate) fn claim_fee_sat(feerate_per_kw: u32, weight: u64) -> u64 {
    feerate_per_kw as u64 * weight / 1000
}

// An HTLC output is trimmed when it cannot pay for its own second-stage
// transaction on top of the dust limit.
fn is_trimmed(htlc_amount_msat: u64, dust_limit_sat: u64, second_stage_fee_sat: u64) -> bool {
    htlc_amount_msat / 1000 < dust_limit_sat + second_stage_fee_sat
}

/// A second-stage HTLC transaction together with what is needed to sign it
#[derive(Debug, Clone)]
pub struct HtlcTx {
    /// The unsigned transaction
    pub tx: Transaction,
    /// The HTLC it spends
    pub htlc: HTLCOutputInCommitment,
    /// The witness script of the spent commitment output
    pub redeem_script: ScriptBuf,
}

/// A commitment transaction and its second-stage HTLC transactions,
/// from the broadcaster's point of view
#[derive(Clone)]
pub struct CommitTxs {
    /// The commitment, as composed by `chan_utils`
    pub commitment_tx: CommitmentTransaction,
    /// Second-stage transactions, in commitment output order
    pub htlc_txs: Vec<HtlcTx>,
    /// The derived per-commitment key set
    pub tx_keys: TxCreationKeys,
}

impl CommitTxs {
    /// The commitment txid
    pub fn txid(&self) -> Txid {
        self.commitment_tx.trust().txid()
    }

    /// The raw unsigned commitment transaction
    pub fn transaction(&self) -> Transaction {
        self.commitment_tx.trust().built_transaction().transaction.clone()
    }
}

/// Build a commitment transaction and its HTLC transactions.
///
/// `spec` is the broadcaster's view (`to_local` pays the broadcaster); the
/// funder's main output pays the commitment fee. Outputs below the
/// broadcaster's dust limit are omitted, with trimmed amounts going to fee.
pub fn make_commit_txs(
    secp_ctx: &Secp256k1<All>,
    channel_parameters: &ChannelTransactionParameters,
    broadcaster_is_local: bool,
    per_commitment_point: &PublicKey,
    commitment_number: u64,
    dust_limit_sat: u64,
    spec: &CommitmentSpec,
) -> Result<CommitTxs, ChannelError> {
    let directed = if broadcaster_is_local {
        channel_parameters.as_holder_broadcastable()
    } else {
        channel_parameters.as_counterparty_broadcastable()
    };
    let broadcaster_pubkeys = directed.broadcaster_pubkeys();
    let countersignatory_pubkeys = directed.countersignatory_pubkeys();
    let tx_keys = TxCreationKeys::derive_new(
        secp_ctx,
        per_commitment_point,
        &broadcaster_pubkeys.delayed_payment_basepoint,
        &broadcaster_pubkeys.htlc_basepoint,
        &countersignatory_pubkeys.revocation_basepoint,
        &countersignatory_pubkeys.htlc_basepoint,
    );

    let timeout_fee = htlc_timeout_fee_sat(spec.feerate_per_kw);
    let success_fee = htlc_success_fee_sat(spec.feerate_per_kw);
    let mut htlcs_with_aux: Vec<(HTLCOutputInCommitment, ())> = spec
        .htlcs
        .iter()
        .filter(|h| {
            let second_stage_fee = match h.direction {
                Direction::Outgoing => timeout_fee,
                Direction::Incoming => success_fee,
            };
            !is_trimmed(h.add.amount_msat, dust_limit_sat, second_stage_fee)
        })
        .map(|h| {
            (
                HTLCOutputInCommitment {
                    offered: h.direction == Direction::Outgoing,
                    amount_msat: h.add.amount_msat,
                    cltv_expiry: h.add.cltv_expiry,
                    payment_hash: h.add.payment_hash,
                    transaction_output_index: None,
                },
                (),
            )
        })
        .collect();

    let fee = commit_tx_fee_sat(spec.feerate_per_kw, htlcs_with_aux.len());
    let funder_is_broadcaster = channel_parameters.is_outbound_from_holder == broadcaster_is_local;
    let mut to_broadcaster_sat = spec.to_local_msat / 1000;
    let mut to_countersignatory_sat = spec.to_remote_msat / 1000;
    if funder_is_broadcaster {
        to_broadcaster_sat = to_broadcaster_sat
            .checked_sub(fee)
            .ok_or_else(|| insufficient_funds("funder cannot afford commit tx fee"))?;
    } else {
        to_countersignatory_sat = to_countersignatory_sat
            .checked_sub(fee)
            .ok_or_else(|| insufficient_funds("funder cannot afford commit tx fee"))?;
    }
    // Below-dust main outputs are omitted entirely.
    if to_broadcaster_sat < dust_limit_sat {
        to_broadcaster_sat = 0;
    }
    if to_countersignatory_sat < dust_limit_sat {
        to_countersignatory_sat = 0;
    }

    let commitment_tx = CommitmentTransaction::new_with_auxiliary_htlc_data(
        INITIAL_COMMITMENT_NUMBER - commitment_number,
        to_broadcaster_sat,
        to_countersignatory_sat,
        broadcaster_pubkeys.funding_pubkey,
        countersignatory_pubkeys.funding_pubkey,
        tx_keys.clone(),
        spec.feerate_per_kw,
        &mut htlcs_with_aux,
        &directed,
    );

    let commitment_txid = commitment_tx.trust().txid();
    let contest_delay = directed.contest_delay();
    let features = &channel_parameters.channel_type_features;
    let htlc_txs = commitment_tx
        .htlcs()
        .iter()
        .map(|htlc| HtlcTx {
            tx: build_htlc_transaction(
                &commitment_txid,
                spec.feerate_per_kw,
                contest_delay,
                htlc,
                features,
                &tx_keys.broadcaster_delayed_payment_key,
                &tx_keys.revocation_key,
            ),
            htlc: htlc.clone(),
            redeem_script: get_htlc_redeemscript(htlc, features, &tx_keys),
        })
        .collect();

    Ok(CommitTxs { commitment_tx, htlc_txs, tx_keys })
}

fn segwit_sighash(
    tx: &Transaction,
    input: usize,
    script_code: &Script,
    amount_sat: u64,
) -> Result<Message, ChannelError> {
    let sighash = SighashCache::new(tx)
        .segwit_signature_hash(input, script_code, amount_sat, EcdsaSighashType::All)
        .map_err(|e| internal_error(format!("sighash failed: {}", e)))?;
    Message::from_slice(&sighash[..]).map_err(|e| internal_error(format!("sighash failed: {}", e)))
}

/// Sign a segwit input with SIGHASH_ALL
pub fn sign_segwit_input(
    secp_ctx: &Secp256k1<All>,
    tx: &Transaction,
    input: usize,
    script_code: &Script,
    amount_sat: u64,
    key: &SecretKey,
) -> Result<Signature, ChannelError> {
    let sighash = segwit_sighash(tx, input, script_code, amount_sat)?;
    Ok(secp_ctx.sign_ecdsa(&sighash, key))
}

/// Verify a SIGHASH_ALL signature on a segwit input
pub fn verify_segwit_input(
    secp_ctx: &Secp256k1<All>,
    tx: &Transaction,
    input: usize,
    script_code: &Script,
    amount_sat: u64,
    sig: &Signature,
    pubkey: &PublicKey,
) -> Result<(), ChannelError> {
    let sighash = segwit_sighash(tx, input, script_code, amount_sat)?;
    secp_ctx
        .verify_ecdsa(&sighash, sig, pubkey)
        .map_err(|e| invalid_signature(format!("sig verify failed: {}", e)))
}

/// Attach both funding signatures to a transaction spending the funding
/// output, ordering them by funding pubkey as the multisig requires
pub fn add_funding_witness(
    tx: &mut Transaction,
    local_sig: Signature,
    remote_sig: Signature,
    local_funding_pubkey: &PublicKey,
    remote_funding_pubkey: &PublicKey,
) {
    let redeem_script = make_funding_redeemscript(local_funding_pubkey, remote_funding_pubkey);

    tx.input[0].witness.clear();
    tx.input[0].witness.push(Vec::new());
    let mut ser_local_sig = local_sig.serialize_der().to_vec();
    ser_local_sig.push(EcdsaSighashType::All as u8);
    let mut ser_remote_sig = remote_sig.serialize_der().to_vec();
    ser_remote_sig.push(EcdsaSighashType::All as u8);

    let local_sig_first =
        local_funding_pubkey.serialize()[..] < remote_funding_pubkey.serialize()[..];
    if local_sig_first {
        tx.input[0].witness.push(ser_local_sig);
        tx.input[0].witness.push(ser_remote_sig);
    } else {
        tx.input[0].witness.push(ser_remote_sig);
        tx.input[0].witness.push(ser_local_sig);
    }
    tx.input[0].witness.push(redeem_script.as_bytes().to_vec());
}

/// Attach the witness of a second-stage HTLC transaction
pub fn add_htlc_witness(
    tx: &mut Transaction,
    local_sig: Signature,
    remote_sig: Signature,
    preimage: Option<&PaymentPreimage>,
    redeem_script: &Script,
) {
    let mut ser_remote_sig = remote_sig.serialize_der().to_vec();
    ser_remote_sig.push(EcdsaSighashType::All as u8);
    let mut ser_local_sig = local_sig.serialize_der().to_vec();
    ser_local_sig.push(EcdsaSighashType::All as u8);

    tx.input[0].witness.clear();
    tx.input[0].witness.push(Vec::new());
    tx.input[0].witness.push(ser_remote_sig);
    tx.input[0].witness.push(ser_local_sig);
    match preimage {
        Some(r) => tx.input[0].witness.push(r.0.to_vec()),
        None => tx.input[0].witness.push(Vec::new()),
    }
    tx.input[0].witness.push(redeem_script.as_bytes().to_vec());
}

/// Recover the commitment index of a commitment transaction from its
/// obscured locktime and sequence fields, per BOLT #3
pub fn decode_commitment_index(tx: &Transaction, obscure_factor: u64) -> Option<u64> {
    if tx.input.is_empty() || tx.output.is_empty() {
        return None;
    }
    let locktime = tx.lock_time.to_consensus_u32() as u64;
    let sequence = tx.input[0].sequence.0 as u64;
    if locktime >> 24 != 0x20 || sequence >> 24 != 0x80 {
        return None;
    }
    let obscured = ((sequence & 0xFF_FFFF) << 24) | (locktime & 0xFF_FFFF);
    Some(obscured ^ obscure_factor)
}

/// Double-SHA256 of a slice, as a signable message
pub fn message_for(data: &[u8]) -> Message {
    let hash = bitcoin::hashes::sha256d::Hash::hash(data);
    Message::from_slice(&hash.to_byte_array()[..]).expect("32 bytes")
}
