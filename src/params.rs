//! Public protocol parameters agreed between the parties before a cycle.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TumblerError};
use crate::trapdoor::RsaPubKey;
use crate::types::{
    DEFAULT_FAKE_PUZZLE_COUNT, DEFAULT_FAKE_TRANSACTION_COUNT, DEFAULT_REAL_PUZZLE_COUNT,
    DEFAULT_REAL_TRANSACTION_COUNT,
};

fn check_counts(fake: usize, real: usize) -> Result<()> {
    if fake == 0 || real == 0 {
        return Err(TumblerError::InvalidParameters("fake and real counts must be at least one"));
    }
    let total = fake
        .checked_add(real)
        .ok_or(TumblerError::InvalidParameters("batch size overflows"))?;
    if u32::try_from(total).is_err() {
        return Err(TumblerError::InvalidParameters("batch size does not fit u32"));
    }
    Ok(())
}

/// Check a persisted or received collection has exactly `expected` entries.
pub(crate) fn check_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(TumblerError::InvalidLength { expected, got });
    }
    Ok(())
}

/// Check `indexes` names exactly `count` distinct positions of a batch of `total`.
fn check_index_set(indexes: &[usize], count: usize, total: usize) -> Result<()> {
    if indexes.len() != count {
        return Err(TumblerError::InvalidLength { expected: count, got: indexes.len() });
    }
    let mut seen = vec![false; total];
    for &index in indexes {
        if index >= total {
            return Err(TumblerError::OutOfRangeIndex { index, max: total });
        }
        if seen[index] {
            return Err(TumblerError::DuplicateIndex(index));
        }
        seen[index] = true;
    }
    Ok(())
}

/// Parameters of the puzzle solver protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverParameters {
    pub fake_puzzle_count: usize,
    pub real_puzzle_count: usize,
    pub server_key: RsaPubKey,
}

impl SolverParameters {
    /// Default cut-and-choose sizes under `server_key`.
    #[must_use]
    pub const fn new(server_key: RsaPubKey) -> Self {
        Self {
            fake_puzzle_count: DEFAULT_FAKE_PUZZLE_COUNT,
            real_puzzle_count: DEFAULT_REAL_PUZZLE_COUNT,
            server_key,
        }
    }

    #[must_use]
    pub const fn total_puzzle_count(&self) -> usize {
        self.fake_puzzle_count + self.real_puzzle_count
    }

    /// # Errors
    /// Returns `InvalidParameters` if a count is zero or the batch is too large.
    pub fn validate(&self) -> Result<()> {
        check_counts(self.fake_puzzle_count, self.real_puzzle_count)
    }

    /// # Errors
    /// Returns a domain error unless `indexes` are `fake_puzzle_count`
    /// distinct positions of the batch.
    pub fn check_fake_indexes(&self, indexes: &[usize]) -> Result<()> {
        check_index_set(indexes, self.fake_puzzle_count, self.total_puzzle_count())
    }

    /// Parse and validate.
    ///
    /// # Errors
    /// Returns `Serialization` for malformed JSON or `InvalidParameters`.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parameters of the signature promise protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseParameters {
    pub fake_transaction_count: usize,
    pub real_transaction_count: usize,
    pub server_key: RsaPubKey,
}

impl PromiseParameters {
    #[must_use]
    pub const fn new(server_key: RsaPubKey) -> Self {
        Self {
            fake_transaction_count: DEFAULT_FAKE_TRANSACTION_COUNT,
            real_transaction_count: DEFAULT_REAL_TRANSACTION_COUNT,
            server_key,
        }
    }

    #[must_use]
    pub const fn total_transaction_count(&self) -> usize {
        self.fake_transaction_count + self.real_transaction_count
    }

    /// # Errors
    /// Returns `InvalidParameters` if a count is zero or the batch is too large.
    pub fn validate(&self) -> Result<()> {
        check_counts(self.fake_transaction_count, self.real_transaction_count)
    }

    /// # Errors
    /// Returns a domain error unless `indexes` are `fake_transaction_count`
    /// distinct positions of the batch.
    pub fn check_fake_indexes(&self, indexes: &[usize]) -> Result<()> {
        check_index_set(indexes, self.fake_transaction_count, self.total_transaction_count())
    }

    /// # Errors
    /// Returns `Serialization` for malformed JSON or `InvalidParameters`.
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Self = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// # Errors
    /// Returns `Serialization` if encoding fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
