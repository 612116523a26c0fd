//! Deterministic fixtures and a two-channel in-memory harness.
//!
//! The harness drives two [Channel]s against each other by routing every
//! `Action::SendMessage` into the peer, which is enough to run the whole
//! protocol without a network or a chain.

use std::collections::VecDeque;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use lightning::ln::{PaymentHash, PaymentPreimage};

use crate::channel::{Channel, NodeParams};
use crate::commitments::{Commitments, LocalParams};
use crate::events::{
    Action, BitcoinEventTag, BlockchainRequest, ChannelCommand, ChannelEvent, CmdAddHtlc,
    HtlcOrigin, InitFundee, InitFunder, MakeFundingTxResponse, RelayerNotification, WatchEvent,
};
use crate::keys::ChannelKeys;
use crate::wire::Message;

/// Height the funding transaction confirms at in tests
pub const FUNDING_HEIGHT: u32 = 400_000;
/// Index of the funding transaction in its block in tests
pub const FUNDING_TX_INDEX: u32 = 7;
/// Funding amount used by the harness
pub const FUNDING_SAT: u64 = 1_000_000;

pub fn make_test_privkey(i: u8) -> SecretKey {
    SecretKey::from_slice(&[i; 32]).unwrap()
}

pub fn make_test_pubkey(i: u8) -> PublicKey {
    let secp_ctx = Secp256k1::new();
    PublicKey::from_secret_key(&secp_ctx, &make_test_privkey(i))
}

pub fn make_channel_keys(seed: u8) -> ChannelKeys {
    ChannelKeys {
        funding_key: make_test_privkey(seed),
        revocation_base_key: make_test_privkey(seed + 1),
        payment_key: make_test_privkey(seed + 2),
        delayed_payment_base_key: make_test_privkey(seed + 3),
        htlc_base_key: make_test_privkey(seed + 4),
        commitment_seed: [seed + 5; 32],
    }
}

pub fn make_final_script(seed: u8) -> ScriptBuf {
    let pk = bitcoin::PublicKey::new(make_test_pubkey(seed + 6));
    ScriptBuf::new_v0_p2wpkh(&pk.wpubkey_hash().unwrap())
}

pub fn make_local_params(seed: u8, is_funder: bool) -> LocalParams {
    LocalParams {
        keys: make_channel_keys(seed),
        dust_limit_sat: 546,
        max_htlc_value_in_flight_msat: 500_000_000,
        channel_reserve_sat: 10_000,
        htlc_minimum_msat: 1_000,
        to_self_delay: 144,
        max_accepted_htlcs: 30,
        is_funder,
        default_final_script_pubkey: make_final_script(seed),
    }
}

pub fn make_node_params(seed: u8) -> NodeParams {
    let secp_ctx = Secp256k1::new();
    let node_secret = make_test_privkey(seed + 100);
    NodeParams {
        node_id: PublicKey::from_secret_key(&secp_ctx, &node_secret),
        node_secret,
        minimum_depth: 3,
        claim_feerate_per_kw: 1_000,
        cltv_expiry_delta: 144,
        fee_base_msat: 1_000,
        fee_proportional_millionths: 100,
    }
}

pub fn make_init_funder(fundee_node_seed: u8, funding_satoshis: u64, push_msat: u64) -> InitFunder {
    let secp_ctx = Secp256k1::new();
    InitFunder {
        remote_node_id: PublicKey::from_secret_key(
            &secp_ctx,
            &make_test_privkey(fundee_node_seed + 100),
        ),
        temporary_channel_id: 42,
        funding_satoshis,
        push_msat,
        initial_feerate_per_kw: 1_000,
        local_params: make_local_params(10, true),
        channel_flags: 0,
    }
}

pub fn make_payment(seed: u8) -> (PaymentPreimage, PaymentHash) {
    let preimage = PaymentPreimage([seed; 32]);
    let hash = PaymentHash(sha256::Hash::hash(&preimage.0).to_byte_array());
    (preimage, hash)
}

pub fn make_add_cmd(amount_msat: u64, hash: PaymentHash, expiry: u32, commit: bool) -> CmdAddHtlc {
    CmdAddHtlc {
        amount_msat,
        payment_hash: hash,
        cltv_expiry: expiry,
        onion_routing_packet: vec![],
        origin: HtlcOrigin::Local,
        commit,
    }
}

/// The funding transaction the blockchain collaborator would have built
pub fn make_funding_tx(script_pubkey: ScriptBuf, amount_sat: u64) -> Transaction {
    Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: vec![TxOut { value: amount_sat, script_pubkey }],
    }
}

/// Peer messages among the actions
pub fn sent_messages(actions: &[Action]) -> Vec<Message> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::SendMessage(m) => Some(m.clone()),
            _ => None,
        })
        .collect()
}

/// Blockchain requests among the actions
pub fn blockchain_requests(actions: &[Action]) -> Vec<BlockchainRequest> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Blockchain(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

/// Relayer notifications among the actions
pub fn relayer_notifications(actions: &[Action]) -> Vec<RelayerNotification> {
    actions
        .iter()
        .filter_map(|a| match a {
            Action::Relayer(r) => Some(r.clone()),
            _ => None,
        })
        .collect()
}

/// The commitments of a channel known to carry them
pub fn commitments_of(channel: &Channel) -> &Commitments {
    channel.state().commitments().expect("channel has commitments")
}

/// Route messages between the two channels until both fall silent.
///
/// `a_actions`/`b_actions` seed the exchange; everything each side produces
/// (including its outgoing messages) is returned for inspection.
pub fn route(
    a: &mut Channel,
    b: &mut Channel,
    a_actions: Vec<Action>,
    b_actions: Vec<Action>,
) -> (Vec<Action>, Vec<Action>) {
    let mut to_b: VecDeque<Message> = sent_messages(&a_actions).into();
    let mut to_a: VecDeque<Message> = sent_messages(&b_actions).into();
    let mut out_a = a_actions;
    let mut out_b = b_actions;
    loop {
        if let Some(m) = to_b.pop_front() {
            let acts = b.process(ChannelEvent::Message(m));
            to_a.extend(sent_messages(&acts));
            out_b.extend(acts);
            continue;
        }
        if let Some(m) = to_a.pop_front() {
            let acts = a.process(ChannelEvent::Message(m));
            to_b.extend(sent_messages(&acts));
            out_a.extend(acts);
            continue;
        }
        break;
    }
    (out_a, out_b)
}

/// Drive both channels through the whole opening protocol to NORMAL.
///
/// Returns `(funder, fundee)`.
pub fn establish_channel(push_msat: u64, announce: bool) -> (Channel, Channel) {
    let mut a = Channel::new(make_node_params(1));
    let mut b = Channel::new(make_node_params(2));

    let mut init = make_init_funder(2, FUNDING_SAT, push_msat);
    if announce {
        init.channel_flags |= 0x01;
    }
    let a_actions = a.process(ChannelEvent::InitFunder(init));
    let secp_ctx = Secp256k1::new();
    let b_actions = b.process(ChannelEvent::InitFundee(InitFundee {
        remote_node_id: PublicKey::from_secret_key(&secp_ctx, &make_test_privkey(101)),
        local_params: make_local_params(20, false),
    }));
    assert!(b_actions.is_empty());

    // open_channel / accept_channel
    let (a_actions, _b_actions) = route(&mut a, &mut b, a_actions, vec![]);

    // the blockchain collaborator builds the funding tx
    let make_funding = blockchain_requests(&a_actions)
        .into_iter()
        .find_map(|r| match r {
            BlockchainRequest::MakeFundingTx { script_pubkey, amount_sat, .. } => {
                Some((script_pubkey, amount_sat))
            }
            _ => None,
        })
        .expect("funder requested a funding tx");
    let funding_tx = make_funding_tx(make_funding.0, make_funding.1);
    let a_actions = a.process(ChannelEvent::MakeFundingTxResponse(MakeFundingTxResponse {
        funding_tx,
        output_index: 0,
    }));

    // funding_created / funding_signed
    let (_a_actions, _b_actions) = route(&mut a, &mut b, a_actions, vec![]);

    // the chain confirms on both sides; the funder is told first, so its
    // funding_locked reaches the fundee early and is deferred
    let confirmed = ChannelEvent::Watch(WatchEvent::Confirmed {
        tag: BitcoinEventTag::FundingDepthOk,
        block_height: FUNDING_HEIGHT,
        tx_index: FUNDING_TX_INDEX,
    });
    let a_actions = a.process(confirmed.clone());
    let _ = route(&mut a, &mut b, a_actions, vec![]);
    let b_actions = b.process(confirmed);
    let _ = route(&mut a, &mut b, vec![], b_actions);

    (a, b)
}

/// Run a full signing round started by `signer`
pub fn sign_round(signer: &mut Channel, other: &mut Channel) -> (Vec<Action>, Vec<Action>) {
    let actions = signer.process(ChannelEvent::Command(ChannelCommand::Sign));
    route(signer, other, actions, vec![])
}
