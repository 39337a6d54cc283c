//! Puzzle, solution and blind-factor value types.

use core::fmt;

use rand_core::{CryptoRng, RngCore};
use rsa::BigUint;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::ser::biguint_hex;
use crate::trapdoor::{RsaKey, RsaPubKey};

macro_rules! domain_value {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(#[serde(with = "biguint_hex")] BigUint);

        impl $name {
            #[must_use]
            pub const fn new(value: BigUint) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn value(&self) -> &BigUint {
                &self.0
            }

            #[must_use]
            pub fn into_value(self) -> BigUint {
                self.0
            }

            /// Fixed-width big-endian bytes under `key`.
            #[must_use]
            pub fn to_bytes(&self, key: &RsaPubKey) -> Vec<u8> {
                key.encode_element(&self.0)
            }

            /// Decode fixed-width big-endian bytes and check the domain.
            ///
            /// # Errors
            /// Returns a domain error for the wrong width or an out-of-range value.
            pub fn from_bytes(key: &RsaPubKey, bytes: &[u8]) -> Result<Self> {
                key.decode_element(bytes).map(Self)
            }
        }

        impl From<BigUint> for $name {
            fn from(value: BigUint) -> Self {
                Self(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.to_str_radix(16))
            }
        }
    };
}

domain_value!(
    /// An RSA ciphertext: the public permutation applied to some solution.
    PuzzleValue
);
domain_value!(
    /// The preimage of a [`PuzzleValue`] under the public permutation.
    PuzzleSolution
);
domain_value!(
    /// Random invertible multiplier hiding a puzzle from its solver.
    BlindFactor
);
domain_value!(
    /// Ratio `ε_{k+1} / ε_k` between consecutive real promise solutions.
    Quotient
);

impl PuzzleSolution {
    /// Uniform random solution, used for fake puzzles and promise secrets.
    pub fn random<R: RngCore + CryptoRng>(key: &RsaPubKey, rng: &mut R) -> Self {
        Self(key.random_invertible(rng))
    }

    /// `Encrypt(pub, self)`: the puzzle this value solves.
    ///
    /// # Errors
    /// Returns `OutOfDomain` if the value is not below the modulus.
    pub fn to_puzzle(&self, key: &RsaPubKey) -> Result<PuzzleValue> {
        key.encrypt(&self.0).map(PuzzleValue)
    }

    /// Whether this value solves `puzzle`.
    #[must_use]
    pub fn solves(&self, key: &RsaPubKey, puzzle: &PuzzleValue) -> bool {
        self.to_puzzle(key).is_ok_and(|p| &p == puzzle)
    }

    /// Remove a blind factor: `self * factor^-1 mod n`.
    ///
    /// # Errors
    /// Returns a domain error if `factor` is not invertible.
    pub fn unblind(&self, key: &RsaPubKey, factor: &BlindFactor) -> Result<Self> {
        key.unblind(&self.0, &factor.0).map(Self)
    }

    /// Multiply by a promise quotient: `ε_{k+1} = ε_k · q_k`.
    ///
    /// # Errors
    /// Returns a domain error if either value is out of range.
    pub fn multiply(&self, key: &RsaPubKey, quotient: &Quotient) -> Result<Self> {
        key.multiply(&self.0, &quotient.0).map(Self)
    }
}

impl PuzzleValue {
    /// `Solve(priv, self)`. The only use of the private key.
    ///
    /// # Errors
    /// Returns `OutOfDomain` if the puzzle is not below the modulus.
    pub fn solve(&self, key: &RsaKey) -> Result<PuzzleSolution> {
        key.solve(&self.0).map(PuzzleSolution)
    }

    /// `self * factor^e mod n`.
    ///
    /// # Errors
    /// Returns a domain error if an input is out of range.
    pub fn blind(&self, key: &RsaPubKey, factor: &BlindFactor) -> Result<Self> {
        key.blind(&self.0, &factor.0).map(Self)
    }

    /// Inverse of [`Self::blind`].
    ///
    /// # Errors
    /// Returns a domain error if `factor` is not invertible.
    pub fn unblind(&self, key: &RsaPubKey, factor: &BlindFactor) -> Result<Self> {
        key.revert_blind(&self.0, &factor.0).map(Self)
    }

    /// `self * quotient^e mod n`, the puzzle of `ε · q`.
    ///
    /// # Errors
    /// Returns a domain error if an input is out of range.
    pub fn shift(&self, key: &RsaPubKey, quotient: &Quotient) -> Result<Self> {
        key.blind(&self.0, &quotient.0).map(Self)
    }

    /// # Errors
    /// Returns `OutOfDomain` if the value is not below the modulus of `key`.
    pub fn check_domain(&self, key: &RsaPubKey) -> Result<()> {
        key.check_domain(&self.0)
    }
}

impl BlindFactor {
    pub fn random<R: RngCore + CryptoRng>(key: &RsaPubKey, rng: &mut R) -> Self {
        Self(key.random_invertible(rng))
    }
}

impl Quotient {
    /// `next / previous mod n`.
    ///
    /// # Errors
    /// Returns a domain error if `previous` is not invertible.
    pub fn between(key: &RsaPubKey, previous: &PuzzleSolution, next: &PuzzleSolution) -> Result<Self> {
        let inv = key.inverse(previous.value())?;
        key.multiply(next.value(), &inv).map(Self)
    }
}
