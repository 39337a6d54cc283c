//! Per-puzzle symmetric keys and the commitments built from them.
//!
//! A solution is sealed with ChaCha20-Poly1305 under a key derived from the
//! 16-byte [`SolutionKey`]; the RIPEMD160 of the raw key is published first
//! and is what the offer script checks on chain.

use core::fmt;

use bitcoin::hashes::{ripemd160, Hash};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TumblerError};
use crate::puzzle::PuzzleSolution;
use crate::trapdoor::RsaPubKey;
use crate::types::{KeyHash, SOLUTION_KEY_LEN, TAG_SOLUTION_KEY};

/// Seal `plaintext` under a key derived from `key_material` in `context`.
///
/// Every derived key encrypts exactly one message, so the nonce is fixed.
///
/// # Errors
/// Returns `TumblerError::Seal` if the AEAD rejects the plaintext.
pub fn seal(context: &str, key_material: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let key = blake3::derive_key(context, key_material);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .encrypt(Nonce::from_slice(&[0u8; 12]), plaintext)
        .map_err(|_| TumblerError::Seal)
}

/// Open a box produced by [`seal`]; `None` if authentication fails.
#[must_use]
pub fn open(context: &str, key_material: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    let key = blake3::derive_key(context, key_material);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    cipher.decrypt(Nonce::from_slice(&[0u8; 12]), ciphertext).ok()
}

/// Ephemeral symmetric key protecting one puzzle's solution.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionKey(pub [u8; SOLUTION_KEY_LEN]);

impl fmt::Debug for SolutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SolutionKey({})", hex::encode(self.0))
    }
}

impl TryFrom<&[u8]> for SolutionKey {
    type Error = TumblerError;

    fn try_from(b: &[u8]) -> Result<Self> {
        let arr: [u8; SOLUTION_KEY_LEN] = b
            .try_into()
            .map_err(|_| TumblerError::InvalidLength { expected: SOLUTION_KEY_LEN, got: b.len() })?;
        Ok(Self(arr))
    }
}

impl AsRef<[u8]> for SolutionKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl SolutionKey {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut key = [0u8; SOLUTION_KEY_LEN];
        rng.fill_bytes(&mut key);
        Self(key)
    }

    /// RIPEMD160 of the raw key bytes.
    #[must_use]
    pub fn hash(&self) -> KeyHash {
        KeyHash(ripemd160::Hash::hash(&self.0).to_byte_array())
    }

    /// Seal `solution` at the fixed modulus width of `key`.
    ///
    /// # Errors
    /// Returns `TumblerError::Seal` if sealing fails.
    pub fn encrypt(&self, key: &RsaPubKey, solution: &PuzzleSolution) -> Result<Vec<u8>> {
        seal(TAG_SOLUTION_KEY, &self.0, &solution.to_bytes(key))
    }

    /// Open a sealed solution; `None` if the key is wrong or the plaintext
    /// is not a domain element.
    #[must_use]
    pub fn decrypt(&self, key: &RsaPubKey, ciphertext: &[u8]) -> Option<PuzzleSolution> {
        let plain = open(TAG_SOLUTION_KEY, &self.0, ciphertext)?;
        PuzzleSolution::from_bytes(key, &plain).ok()
    }
}

/// What the solving party discloses per puzzle before any key is revealed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommitment {
    pub key_hash: KeyHash,
    #[serde(with = "hex::serde")]
    pub encrypted_solution: Vec<u8>,
}

impl ServerCommitment {
    /// Commit to `solution` under `solution_key`.
    ///
    /// # Errors
    /// Returns `TumblerError::Seal` if sealing fails.
    pub fn new(key: &RsaPubKey, solution_key: &SolutionKey, solution: &PuzzleSolution) -> Result<Self> {
        Ok(Self {
            key_hash: solution_key.hash(),
            encrypted_solution: solution_key.encrypt(key, solution)?,
        })
    }

    /// Check a revealed key against this commitment and open the solution.
    ///
    /// # Errors
    /// `Cheat::SolutionKeyMismatch` if the key does not hash to `key_hash`,
    /// `Cheat::UndecryptableSolution` if the ciphertext does not open.
    pub fn open(&self, key: &RsaPubKey, solution_key: &SolutionKey, index: usize) -> Result<PuzzleSolution> {
        if solution_key.hash() != self.key_hash {
            return Err(crate::Cheat::SolutionKeyMismatch { index }.into());
        }
        solution_key
            .decrypt(key, &self.encrypted_solution)
            .ok_or_else(|| crate::Cheat::UndecryptableSolution { index }.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_key;
    use crate::Cheat;
    use rand_core::OsRng;

    #[test]
    fn key_hash_is_ripemd160() {
        // RIPEMD160 of sixteen zero bytes.
        let key = SolutionKey([0u8; 16]);
        let expected = ripemd160::Hash::hash(&[0u8; 16]).to_byte_array();
        assert_eq!(key.hash().0, expected);
        assert_ne!(SolutionKey([1u8; 16]).hash(), key.hash());
    }

    #[test]
    fn commitment_opens_only_with_its_key() {
        let pk = test_key().public();
        let solution = PuzzleSolution::random(pk, &mut OsRng);
        let k = SolutionKey::random(&mut OsRng);
        let c = ServerCommitment::new(pk, &k, &solution).unwrap();
        assert_eq!(c.encrypted_solution.len(), pk.size() + 16);
        assert_eq!(c.open(pk, &k, 0).unwrap(), solution);

        let other = SolutionKey::random(&mut OsRng);
        let err = c.open(pk, &other, 3).unwrap_err();
        assert_eq!(err.cheat(), Some(&Cheat::SolutionKeyMismatch { index: 3 }));
    }

    #[test]
    fn tampered_ciphertext_is_a_cheat() {
        let pk = test_key().public();
        let solution = PuzzleSolution::random(pk, &mut OsRng);
        let k = SolutionKey::random(&mut OsRng);
        let mut c = ServerCommitment::new(pk, &k, &solution).unwrap();
        c.encrypted_solution[0] ^= 1;
        let err = c.open(pk, &k, 1).unwrap_err();
        assert_eq!(err.cheat(), Some(&Cheat::UndecryptableSolution { index: 1 }));
    }

    #[test]
    fn seal_contexts_are_separated() {
        let boxed = seal("ctx.a", b"material", b"hello").unwrap();
        assert_eq!(boxed.len(), 5 + 16);
        assert_eq!(open("ctx.a", b"material", &boxed).as_deref(), Some(&b"hello"[..]));
        assert!(open("ctx.b", b"material", &boxed).is_none());
        assert!(open("ctx.a", b"other", &boxed).is_none());

        // An empty box never opens, so a failed seal cannot pass as a commitment.
        assert!(open("ctx.a", b"material", &[]).is_none());
        assert_eq!(seal("ctx.a", b"material", b"").unwrap().len(), 16);
    }

    #[test]
    fn solution_key_from_slice() {
        assert!(SolutionKey::try_from(&[0u8; 15][..]).is_err());
        let k = SolutionKey::try_from(&[7u8; 16][..]).unwrap();
        assert_eq!(format!("{k:?}"), format!("SolutionKey({})", "07".repeat(16)));
    }
}
