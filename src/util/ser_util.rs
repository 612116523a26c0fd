use lightning::ln::{PaymentHash, PaymentPreimage};
use serde_derive::{Deserialize, Serialize};

/// A helper for serializing [PaymentHash]
#[derive(Serialize, Deserialize)]
#[serde(remote = "PaymentHash")]
pub struct PaymentHashDef(pub [u8; 32]);

/// A helper for serializing [PaymentPreimage]
#[derive(Serialize, Deserialize)]
#[serde(remote = "PaymentPreimage")]
pub struct PaymentPreimageDef(pub [u8; 32]);
