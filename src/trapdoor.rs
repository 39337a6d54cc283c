//! RSA trapdoor permutation used to build puzzles.
//!
//! The public permutation `x ↦ x^e mod n` turns solutions into puzzles, the
//! private inverse `y ↦ y^d mod n` solves them. Blinding multiplies a value by
//! `r^e` so that the solver sees an unlinkable puzzle whose solution is the
//! original one multiplied by `r`.

use num_bigint_dig::{IntoBigUint, ModInverse, RandBigInt};
use num_traits::{One, Zero};
use rand_core::{CryptoRng, RngCore};
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TumblerError};
use crate::ser::{biguint_hex, to_fixed_be};
use crate::types::RSA_KEY_SIZE;

/// Public half of the solving server's RSA key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RsaPubKeyRepr", into = "RsaPubKeyRepr")]
pub struct RsaPubKey {
    inner: RsaPublicKey,
}

#[derive(Serialize, Deserialize)]
struct RsaPubKeyRepr {
    #[serde(with = "biguint_hex")]
    modulus: BigUint,
    #[serde(with = "biguint_hex")]
    exponent: BigUint,
}

impl TryFrom<RsaPubKeyRepr> for RsaPubKey {
    type Error = TumblerError;

    fn try_from(repr: RsaPubKeyRepr) -> Result<Self> {
        Self::new(repr.modulus, repr.exponent)
    }
}

impl From<RsaPubKey> for RsaPubKeyRepr {
    fn from(key: RsaPubKey) -> Self {
        Self { modulus: key.modulus().clone(), exponent: key.exponent().clone() }
    }
}

impl RsaPubKey {
    /// Build a public key from its modulus and exponent.
    ///
    /// # Errors
    /// Returns `TumblerError::Rsa` if the parts are rejected by the RSA backend.
    pub fn new(modulus: BigUint, exponent: BigUint) -> Result<Self> {
        if modulus.is_zero() || exponent.is_zero() {
            return Err(TumblerError::InvalidParameters("rsa modulus and exponent must be positive"));
        }
        Ok(Self { inner: RsaPublicKey::new(modulus, exponent)? })
    }

    #[must_use]
    pub fn modulus(&self) -> &BigUint {
        self.inner.n()
    }

    #[must_use]
    pub fn exponent(&self) -> &BigUint {
        self.inner.e()
    }

    /// Modulus width in bytes; every domain value is encoded at this width.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// BLAKE3 fingerprint of the key parts, used to name a key in logs and stores.
    #[must_use]
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut h = blake3::Hasher::new();
        h.update(&to_fixed_be(self.modulus(), self.size()));
        h.update(&self.exponent().to_bytes_be());
        *h.finalize().as_bytes()
    }

    /// Check `0 <= value < modulus`.
    ///
    /// # Errors
    /// Returns `TumblerError::OutOfDomain` otherwise.
    pub fn check_domain(&self, value: &BigUint) -> Result<()> {
        if value >= self.modulus() {
            return Err(TumblerError::OutOfDomain);
        }
        Ok(())
    }

    /// Public permutation `m^e mod n`.
    ///
    /// # Errors
    /// Returns `TumblerError::OutOfDomain` if `plaintext >= modulus`.
    pub fn encrypt(&self, plaintext: &BigUint) -> Result<BigUint> {
        self.check_domain(plaintext)?;
        Ok(plaintext.modpow(self.exponent(), self.modulus()))
    }

    /// `value * factor^e mod n`.
    ///
    /// # Errors
    /// Returns a domain error if either input is outside `Z_n`.
    pub fn blind(&self, value: &BigUint, factor: &BigUint) -> Result<BigUint> {
        self.check_domain(value)?;
        let re = self.encrypt(factor)?;
        Ok((value * re) % self.modulus())
    }

    /// Inverse of [`Self::blind`]: `value * (factor^-1)^e mod n`.
    ///
    /// # Errors
    /// Returns `TumblerError::NonInvertibleFactor` if `factor` has no inverse.
    pub fn revert_blind(&self, value: &BigUint, factor: &BigUint) -> Result<BigUint> {
        self.check_domain(value)?;
        let inv = self.inverse(factor)?;
        let inv_e = inv.modpow(self.exponent(), self.modulus());
        Ok((value * inv_e) % self.modulus())
    }

    /// `value * factor^-1 mod n`, removing a factor from a solution.
    ///
    /// # Errors
    /// Returns `TumblerError::NonInvertibleFactor` if `factor` has no inverse.
    pub fn unblind(&self, value: &BigUint, factor: &BigUint) -> Result<BigUint> {
        self.check_domain(value)?;
        let inv = self.inverse(factor)?;
        Ok((value * inv) % self.modulus())
    }

    /// `a * b mod n`.
    ///
    /// # Errors
    /// Returns a domain error if either input is outside `Z_n`.
    pub fn multiply(&self, a: &BigUint, b: &BigUint) -> Result<BigUint> {
        self.check_domain(a)?;
        self.check_domain(b)?;
        Ok((a * b) % self.modulus())
    }

    /// Modular inverse via the extended Euclidean algorithm.
    ///
    /// # Errors
    /// Returns `TumblerError::NonInvertibleFactor` for zero or non-coprime inputs.
    pub fn inverse(&self, value: &BigUint) -> Result<BigUint> {
        self.check_domain(value)?;
        if value.is_zero() {
            return Err(TumblerError::NonInvertibleFactor);
        }
        value
            .clone()
            .mod_inverse(self.modulus())
            .and_then(IntoBigUint::into_biguint)
            .ok_or(TumblerError::NonInvertibleFactor)
    }

    /// Uniform element of `Z_n^*`.
    pub fn random_invertible<R: RngCore + CryptoRng>(&self, rng: &mut R) -> BigUint {
        loop {
            let candidate = rng.gen_biguint_below(self.modulus());
            if candidate <= BigUint::one() {
                continue;
            }
            if self.inverse(&candidate).is_ok() {
                return candidate;
            }
        }
    }

    /// Decode a fixed-width big-endian value and check it lies in the domain.
    ///
    /// # Errors
    /// Returns a length error for the wrong width or `OutOfDomain`.
    pub fn decode_element(&self, bytes: &[u8]) -> Result<BigUint> {
        if bytes.len() != self.size() {
            return Err(TumblerError::InvalidLength { expected: self.size(), got: bytes.len() });
        }
        let value = BigUint::from_bytes_be(bytes);
        self.check_domain(&value)?;
        Ok(value)
    }

    /// Fixed-width big-endian encoding of a domain value.
    #[must_use]
    pub fn encode_element(&self, value: &BigUint) -> Vec<u8> {
        to_fixed_be(value, self.size())
    }
}

/// The solving server's RSA keypair. Read-only once created, so a single
/// instance may be shared by every session of a server.
#[derive(Clone, Debug)]
pub struct RsaKey {
    inner: RsaPrivateKey,
    public: RsaPubKey,
}

impl RsaKey {
    /// Generate a fresh keypair of `bits` bits with exponent 65537.
    ///
    /// # Errors
    /// Returns `TumblerError::Rsa` if key generation fails.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self> {
        let inner = RsaPrivateKey::new(rng, bits)?;
        Ok(Self::from_private(inner))
    }

    /// Generate a keypair of the default protocol size.
    ///
    /// # Errors
    /// Returns `TumblerError::Rsa` if key generation fails.
    pub fn generate_default<R: RngCore + CryptoRng>(rng: &mut R) -> Result<Self> {
        Self::generate(rng, RSA_KEY_SIZE)
    }

    #[must_use]
    pub fn from_private(inner: RsaPrivateKey) -> Self {
        let public = RsaPubKey { inner: inner.to_public_key() };
        Self { inner, public }
    }

    #[must_use]
    pub const fn public(&self) -> &RsaPubKey {
        &self.public
    }

    /// Private inverse permutation `c^d mod n`.
    ///
    /// # Errors
    /// Returns `TumblerError::OutOfDomain` if `ciphertext >= modulus`.
    pub fn solve(&self, ciphertext: &BigUint) -> Result<BigUint> {
        self.public.check_domain(ciphertext)?;
        Ok(ciphertext.modpow(self.inner.d(), self.public.modulus()))
    }
}
