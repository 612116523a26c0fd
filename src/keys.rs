use core::fmt;

use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use lightning::ln::chan_utils::{self, ChannelPublicKeys};
use lightning::ln::channel_keys::{DelayedPaymentBasepoint, HtlcBasepoint, RevocationBasepoint};

use crate::util::INITIAL_COMMITMENT_NUMBER;

/// The per-channel secret key material.
///
/// Holds the funding key, the four basepoint secrets and the commitment
/// seed (`sha_seed`) from which the per-commitment chain is derived.
/// Basepoints are fixed at open and never rotate; only the per-commitment
/// point advances.
#[derive(Clone)]
pub struct ChannelKeys {
    /// Funding 2-of-2 key
    pub funding_key: SecretKey,
    /// Revocation basepoint secret
    pub revocation_base_key: SecretKey,
    /// Payment key - with static remote key this is used as-is by the peer
    pub payment_key: SecretKey,
    /// Delayed payment basepoint secret
    pub delayed_payment_base_key: SecretKey,
    /// HTLC basepoint secret
    pub htlc_base_key: SecretKey,
    /// Seed for the per-commitment secret chain
    pub commitment_seed: [u8; 32],
}

// Need to define manually so key material stays out of logs.
impl fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKeys(..)")
    }
}

impl ChannelKeys {
    /// The public counterparts of our keys, as exchanged in `open_channel`
    /// / `accept_channel`.
    pub fn pubkeys(&self, secp_ctx: &Secp256k1<All>) -> ChannelPublicKeys {
        ChannelPublicKeys {
            funding_pubkey: PublicKey::from_secret_key(secp_ctx, &self.funding_key),
            revocation_basepoint: RevocationBasepoint(PublicKey::from_secret_key(
                secp_ctx,
                &self.revocation_base_key,
            )),
            payment_point: PublicKey::from_secret_key(secp_ctx, &self.payment_key),
            delayed_payment_basepoint: DelayedPaymentBasepoint(PublicKey::from_secret_key(
                secp_ctx,
                &self.delayed_payment_base_key,
            )),
            htlc_basepoint: HtlcBasepoint(PublicKey::from_secret_key(
                secp_ctx,
                &self.htlc_base_key,
            )),
        }
    }

    /// The per-commitment secret for commitment `index`.
    ///
    /// Never hand this out before commitment `index + 1` is signed; the
    /// commitments engine enforces that by construction (it only reveals
    /// the previous index when replacing the local commitment).
    pub fn per_commitment_secret(&self, index: u64) -> SecretKey {
        let secret =
            chan_utils::build_commitment_secret(&self.commitment_seed, INITIAL_COMMITMENT_NUMBER - index);
        SecretKey::from_slice(&secret).expect("commitment secret is a valid scalar")
    }

    /// The per-commitment point for commitment `index`
    pub fn per_commitment_point(&self, secp_ctx: &Secp256k1<All>, index: u64) -> PublicKey {
        PublicKey::from_secret_key(secp_ctx, &self.per_commitment_secret(index))
    }

    /// Check a claimed future secret against the chain, for
    /// `option_data_loss_protect` style probes.
    pub fn check_future_secret(&self, index: u64, suggested: &SecretKey) -> bool {
        self.per_commitment_secret(index)[..] == suggested[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> ChannelKeys {
        ChannelKeys {
            funding_key: SecretKey::from_slice(&[11; 32]).unwrap(),
            revocation_base_key: SecretKey::from_slice(&[12; 32]).unwrap(),
            payment_key: SecretKey::from_slice(&[13; 32]).unwrap(),
            delayed_payment_base_key: SecretKey::from_slice(&[14; 32]).unwrap(),
            htlc_base_key: SecretKey::from_slice(&[15; 32]).unwrap(),
            commitment_seed: [16; 32],
        }
    }

    #[test]
    fn per_commitment_chain_is_deterministic() {
        let secp_ctx = Secp256k1::new();
        let k = keys();
        let p0 = k.per_commitment_point(&secp_ctx, 0);
        let p1 = k.per_commitment_point(&secp_ctx, 1);
        assert_ne!(p0, p1);
        assert_eq!(p0, k.per_commitment_point(&secp_ctx, 0));
        assert!(k.check_future_secret(5, &k.per_commitment_secret(5)));
        assert!(!k.check_future_secret(5, &k.per_commitment_secret(6)));
    }
}
