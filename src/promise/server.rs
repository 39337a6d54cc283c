//! Signing party of the promise protocol; funds the escrow.

use std::collections::BTreeSet;
use std::sync::Arc;

use bitcoin::secp256k1::SecretKey;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{fake_hash, seal_signature, PromiseCommitment, PromiseProof, PromiseRevelation};
use crate::errors::{cheat, Cheat, Result, TumblerError};
use crate::escrow::{EscrowCoin, EscrowContext, EscrowRole};
use crate::params::{check_len, PromiseParameters};
use crate::puzzle::{PuzzleSolution, Quotient};
use crate::trapdoor::RsaKey;
use crate::transaction::sign_hash;
use crate::types::PromiseHash;

const ROLE: &str = "promise-server";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PromiseServerState {
    WaitingEscrow,
    WaitingHashes {
        escrow: EscrowContext,
    },
    WaitingRevelation {
        escrow: EscrowContext,
        hashes: Vec<PromiseHash>,
        solutions: Vec<PuzzleSolution>,
    },
    Completed {
        escrow: EscrowContext,
    },
}

impl PromiseServerState {
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        match self {
            Self::WaitingEscrow => "waiting_escrow",
            Self::WaitingHashes { .. } => "waiting_hashes",
            Self::WaitingRevelation { .. } => "waiting_revelation",
            Self::Completed { .. } => "completed",
        }
    }

    fn check_shape(&self, parameters: &PromiseParameters) -> Result<()> {
        match self {
            Self::WaitingEscrow => Ok(()),
            Self::WaitingHashes { escrow } | Self::Completed { escrow } => escrow.check(EscrowRole::Initiator),
            Self::WaitingRevelation { escrow, hashes, solutions } => {
                escrow.check(EscrowRole::Initiator)?;
                let total = parameters.total_transaction_count();
                check_len(total, hashes.len())?;
                check_len(total, solutions.len())
            }
        }
    }
}

#[derive(Debug)]
pub struct PromiseServerSession {
    parameters: PromiseParameters,
    key: Arc<RsaKey>,
    state: PromiseServerState,
}

impl PromiseServerSession {
    /// # Errors
    /// `InvalidParameters` if the parameters are invalid or do not name `key`.
    pub fn new(parameters: PromiseParameters, key: Arc<RsaKey>) -> Result<Self> {
        Self::from_state(parameters, key, PromiseServerState::WaitingEscrow)
    }

    /// # Errors
    /// `InvalidParameters` if the parameters are invalid or do not name `key`;
    /// a domain error if `state` does not fit the parameters.
    pub fn from_state(parameters: PromiseParameters, key: Arc<RsaKey>, state: PromiseServerState) -> Result<Self> {
        parameters.validate()?;
        if &parameters.server_key != key.public() {
            return Err(TumblerError::InvalidParameters("server key does not match parameters"));
        }
        state.check_shape(&parameters)?;
        Ok(Self { parameters, key, state })
    }

    #[must_use]
    pub const fn state(&self) -> &PromiseServerState {
        &self.state
    }

    #[must_use]
    pub const fn phase(&self) -> &'static str {
        self.state.phase()
    }

    fn unexpected(&self, expected: &'static str) -> TumblerError {
        TumblerError::ProtocolState { expected, actual: self.state.phase() }
    }

    fn advance(&mut self, next: PromiseServerState) {
        debug!(role = ROLE, from = self.state.phase(), to = next.phase(), "session transition");
        self.state = next;
    }

    /// Bind the session to an escrow this server funded.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_escrow`; `InvalidEscrow` or
    /// `InvalidScript` if the escrow does not name `key` as initiator.
    pub fn configure_escrow(&mut self, coin: EscrowCoin, key: SecretKey) -> Result<()> {
        if !matches!(self.state, PromiseServerState::WaitingEscrow) {
            return Err(self.unexpected("waiting_escrow"));
        }
        let escrow = EscrowContext::new(coin, key, EscrowRole::Initiator)?;
        self.advance(PromiseServerState::WaitingHashes { escrow });
        Ok(())
    }

    /// Sign every hash with the escrow key and seal each signature under a
    /// fresh puzzle.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_hashes`; `InvalidLength` if the batch
    /// is not the agreed size.
    pub fn sign_hashes<R: RngCore + CryptoRng>(&mut self, hashes: &[PromiseHash], rng: &mut R) -> Result<Vec<PromiseCommitment>> {
        let PromiseServerState::WaitingHashes { escrow } = &self.state else {
            return Err(self.unexpected("waiting_hashes"));
        };
        let total = self.parameters.total_transaction_count();
        if hashes.len() != total {
            return Err(TumblerError::InvalidLength { expected: total, got: hashes.len() });
        }
        let pk = self.key.public();
        let mut solutions = Vec::with_capacity(total);
        let mut commitments = Vec::with_capacity(total);
        for hash in hashes {
            let signature = sign_hash(&hash.0, &escrow.key);
            let epsilon = PuzzleSolution::random(pk, rng);
            commitments.push(PromiseCommitment {
                puzzle: epsilon.to_puzzle(pk)?,
                encrypted_signature: seal_signature(pk, &epsilon, &signature)?,
            });
            solutions.push(epsilon);
        }
        let next = PromiseServerState::WaitingRevelation {
            escrow: escrow.clone(),
            hashes: hashes.to_vec(),
            solutions,
        };
        self.advance(next);
        Ok(commitments)
    }

    /// Check the fake hashes were derived from their salts, then open the
    /// fakes and chain the real puzzles.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_revelation`; a domain error for a
    /// malformed revelation; `CheatDetected` if a fake hash does not match
    /// its salt, in which case nothing is disclosed.
    pub fn check_revelation(&mut self, revelation: &PromiseRevelation) -> Result<PromiseProof> {
        let PromiseServerState::WaitingRevelation { escrow, hashes, solutions } = &self.state else {
            return Err(self.unexpected("waiting_revelation"));
        };
        self.parameters.check_fake_indexes(&revelation.fake_indexes)?;
        if revelation.salts.len() != revelation.fake_indexes.len() {
            return Err(TumblerError::InvalidLength {
                expected: revelation.fake_indexes.len(),
                got: revelation.salts.len(),
            });
        }
        for (&index, salt) in revelation.fake_indexes.iter().zip(&revelation.salts) {
            if hashes[index] != fake_hash(salt) {
                return Err(cheat(ROLE, Cheat::FakeHashMismatch { index }));
            }
        }
        let fakes: BTreeSet<usize> = revelation.fake_indexes.iter().copied().collect();
        let fake_solutions = revelation.fake_indexes.iter().map(|&i| solutions[i].clone()).collect();
        let real: Vec<&PuzzleSolution> = solutions
            .iter()
            .enumerate()
            .filter(|(i, _)| !fakes.contains(i))
            .map(|(_, s)| s)
            .collect();
        let pk = self.key.public();
        let quotients = real
            .windows(2)
            .map(|pair| Quotient::between(pk, pair[0], pair[1]))
            .collect::<Result<Vec<_>>>()?;
        let next = PromiseServerState::Completed { escrow: escrow.clone() };
        self.advance(next);
        Ok(PromiseProof { fake_solutions, quotients })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::EscrowScriptParams;
    use crate::testing::{outpoint, public_key, secret_key, test_key};
    use crate::types::FakeSalt;
    use bitcoin::Amount;
    use rand_core::OsRng;

    fn session() -> PromiseServerSession {
        let key = Arc::new(test_key().clone());
        let mut params = PromiseParameters::new(key.public().clone());
        params.fake_transaction_count = 2;
        params.real_transaction_count = 3;
        let mut s = PromiseServerSession::new(params, key).unwrap();
        let escrow = EscrowScriptParams { initiator: public_key(7), receiver: public_key(8), lock_time: 300 };
        s.configure_escrow(EscrowCoin::new(outpoint(5), Amount::from_sat(90_000), &escrow), secret_key(7)).unwrap();
        s
    }

    #[test]
    fn quotients_chain_real_solutions() {
        let mut s = session();
        let salts = [FakeSalt([1; 32]), FakeSalt([2; 32])];
        let hashes = vec![
            PromiseHash([9; 32]),
            fake_hash(&salts[0]),
            PromiseHash([10; 32]),
            fake_hash(&salts[1]),
            PromiseHash([11; 32]),
        ];
        let commitments = s.sign_hashes(&hashes, &mut OsRng).unwrap();
        let proof = s
            .check_revelation(&PromiseRevelation { fake_indexes: vec![1, 3], salts: salts.to_vec() })
            .unwrap();
        assert_eq!(proof.quotients.len(), 2);
        let pk = test_key().public();
        assert!(proof.fake_solutions[0].solves(pk, &commitments[1].puzzle));
        assert_eq!(commitments[0].puzzle.shift(pk, &proof.quotients[0]).unwrap(), commitments[2].puzzle);
        assert_eq!(commitments[2].puzzle.shift(pk, &proof.quotients[1]).unwrap(), commitments[4].puzzle);
        assert_eq!(s.phase(), "completed");
    }

    #[test]
    fn real_hash_claimed_as_fake_is_a_cheat() {
        let mut s = session();
        let salt = FakeSalt([1; 32]);
        let hashes = vec![fake_hash(&salt), PromiseHash([3; 32]), PromiseHash([4; 32]), PromiseHash([5; 32]), PromiseHash([6; 32])];
        s.sign_hashes(&hashes, &mut OsRng).unwrap();
        let err = s
            .check_revelation(&PromiseRevelation { fake_indexes: vec![0, 1], salts: vec![salt, FakeSalt([2; 32])] })
            .unwrap_err();
        assert_eq!(err.cheat(), Some(&Cheat::FakeHashMismatch { index: 1 }));
        assert_eq!(s.phase(), "waiting_revelation");
    }

    #[test]
    fn resumed_batch_must_fit_the_parameters() {
        let mut s = session();
        let hashes: Vec<PromiseHash> = (0..5u8).map(|i| PromiseHash([i; 32])).collect();
        s.sign_hashes(&hashes, &mut OsRng).unwrap();
        let key = Arc::new(test_key().clone());
        let PromiseServerState::WaitingRevelation { escrow, hashes, mut solutions } = s.state().clone() else {
            panic!("unexpected phase {}", s.phase());
        };
        solutions.truncate(2);
        let state = PromiseServerState::WaitingRevelation { escrow: escrow.clone(), hashes, solutions };
        assert!(matches!(
            PromiseServerSession::from_state(s.parameters.clone(), key.clone(), state),
            Err(TumblerError::InvalidLength { expected: 5, got: 2 })
        ));

        let state = PromiseServerState::WaitingRevelation { escrow, hashes: Vec::new(), solutions: Vec::new() };
        assert!(PromiseServerSession::from_state(s.parameters.clone(), key, state).is_err());
    }
}
