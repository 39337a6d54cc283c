//! Shared fixtures for unit tests.

use std::sync::LazyLock;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{OutPoint, PublicKey, ScriptBuf, Txid};
use rand_core::OsRng;

use crate::trapdoor::RsaKey;
use crate::transaction::public_key_of;

static TEST_KEY: LazyLock<RsaKey> =
    LazyLock::new(|| RsaKey::generate(&mut OsRng, 1024).expect("test key generation"));

/// A 1024-bit key generated once per test binary.
pub fn test_key() -> &'static RsaKey {
    &TEST_KEY
}

pub fn secret_key(n: u8) -> SecretKey {
    SecretKey::from_slice(&[n; 32]).expect("nonzero scalar below the curve order")
}

pub fn public_key(n: u8) -> PublicKey {
    public_key_of(&secret_key(n))
}

pub fn outpoint(n: u8) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([n; 32]), u32::from(n))
}

pub fn cashout_script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&public_key(n).pubkey_hash())
}
