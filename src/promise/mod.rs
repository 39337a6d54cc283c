//! Cut-and-choose signature promise protocol.
//!
//! The escrow funder signs a shuffled batch of hashes: cashout sighashes of
//! the receiver's real transactions mixed with salted fake hashes. Each
//! signature is sealed under a random RSA-domain value `ε` and published
//! together with its puzzle `Encrypt(ε)`. After the fakes are opened, the
//! real puzzles are chained by quotients so that solving the first one (with
//! the solver protocol) unlocks every real signature.

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::secp256k1::ecdsa::Signature;
use serde::{Deserialize, Serialize};

use crate::commitment::{open, seal};
use crate::errors::Result;
use crate::puzzle::{PuzzleSolution, PuzzleValue, Quotient};
use crate::trapdoor::RsaPubKey;
use crate::types::{FakeSalt, PromiseHash, TAG_FAKE_HASH, TAG_PROMISE_KEY};

pub mod client;
pub mod server;

pub use client::{CashoutTerms, PromiseClientSession, PromiseClientState, PromiseHashEntry, RealPromise};
pub use server::{PromiseServerSession, PromiseServerState};

/// A sealed signature and the puzzle whose solution opens it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseCommitment {
    pub puzzle: PuzzleValue,
    #[serde(with = "hex::serde")]
    pub encrypted_signature: Vec<u8>,
}

/// Client disclosure of the fake hashes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseRevelation {
    pub fake_indexes: Vec<usize>,
    pub salts: Vec<FakeSalt>,
}

/// Server proof: the fake `ε` values and the quotients chaining the real puzzles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseProof {
    pub fake_solutions: Vec<PuzzleSolution>,
    pub quotients: Vec<Quotient>,
}

/// `SHA256d(tag || salt)`, indistinguishable from a sighash to the signer.
#[must_use]
pub fn fake_hash(salt: &FakeSalt) -> PromiseHash {
    let mut data = Vec::with_capacity(TAG_FAKE_HASH.len() + salt.0.len());
    data.extend_from_slice(TAG_FAKE_HASH);
    data.extend_from_slice(&salt.0);
    PromiseHash(sha256d::Hash::hash(&data).to_byte_array())
}

fn seal_signature(key: &RsaPubKey, epsilon: &PuzzleSolution, signature: &Signature) -> Result<Vec<u8>> {
    seal(TAG_PROMISE_KEY, &epsilon.to_bytes(key), &signature.serialize_compact())
}

fn open_signature(key: &RsaPubKey, epsilon: &PuzzleSolution, sealed: &[u8]) -> Option<Signature> {
    let plain = open(TAG_PROMISE_KEY, &epsilon.to_bytes(key), sealed)?;
    Signature::from_compact(&plain).ok()
}
