use serde::{Deserialize, Serialize};

pub const RSA_KEY_SIZE: usize = 2048;              // bits
pub const RSA_EXPONENT: u64 = 65_537;
pub const SOLUTION_KEY_LEN: usize = 16;            // symmetric key per puzzle
pub const KEY_HASH_LEN: usize = 20;                // RIPEMD160
pub const PROMISE_HASH_LEN: usize = 32;            // sighash / fake hash
pub const SALT_LEN: usize = 32;

pub const DEFAULT_FAKE_PUZZLE_COUNT: usize = 285;
pub const DEFAULT_REAL_PUZZLE_COUNT: usize = 15;
pub const DEFAULT_FAKE_TRANSACTION_COUNT: usize = 42;
pub const DEFAULT_REAL_TRANSACTION_COUNT: usize = 42;

// Domain separation contexts
pub const TAG_SOLUTION_KEY: &str = "tumblebit.solver.solution-key.v1";
pub const TAG_PROMISE_KEY: &str = "tumblebit.promise.signature-key.v1";
pub const TAG_FAKE_HASH: &[u8] = b"tumblebit.promise.fake";

/// RIPEMD160 commitment to a [`crate::SolutionKey`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHash(pub [u8; KEY_HASH_LEN]);

/// 32-byte message signed in the promise protocol: either a real cashout
/// sighash or a salted fake hash. The signer cannot tell them apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PromiseHash(pub [u8; PROMISE_HASH_LEN]);

/// Salt from which a fake promise hash is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeSalt(pub [u8; SALT_LEN]);

macro_rules! impl_tryfrom_slice {
    ($t:ty, $len:expr) => {
        impl TryFrom<&[u8]> for $t {
            type Error = crate::errors::TumblerError;
            fn try_from(b: &[u8]) -> Result<Self, Self::Error> {
                if b.len() != $len {
                    return Err(crate::errors::TumblerError::InvalidLength { expected: $len, got: b.len() });
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(b);
                Ok(Self(arr))
            }
        }
    };
}
impl_tryfrom_slice!(KeyHash, KEY_HASH_LEN);
impl_tryfrom_slice!(PromiseHash, PROMISE_HASH_LEN);
impl_tryfrom_slice!(FakeSalt, SALT_LEN);

impl AsRef<[u8]> for KeyHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for PromiseHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
