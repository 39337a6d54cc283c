//! Receiving party of the promise protocol.

use bitcoin::secp256k1::SecretKey;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ecdsa, Amount, FeeRate, Script, ScriptBuf, Transaction};
use rand::seq::SliceRandom;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{fake_hash, open_signature, PromiseCommitment, PromiseProof, PromiseRevelation};
use crate::errors::{cheat, Cheat, Result, TumblerError};
use crate::escrow::{EscrowCoin, EscrowContext, EscrowRole};
use crate::params::{check_len, PromiseParameters};
use crate::puzzle::{PuzzleSolution, PuzzleValue, Quotient};
use crate::transaction::{
    build_cashout, cashout_fee, cooperative_witness, sign_input, signature_hash, verify_hash,
};
use crate::types::{FakeSalt, PromiseHash};

const ROLE: &str = "promise-client";

/// One position of the shuffled batch of hashes sent for signing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PromiseHashEntry {
    /// Sighash of the cashout transaction with `nLockTime = lock_time`.
    Real { hash: PromiseHash, lock_time: u32 },
    Fake { hash: PromiseHash, salt: FakeSalt },
}

impl PromiseHashEntry {
    #[must_use]
    pub const fn hash(&self) -> &PromiseHash {
        match self {
            Self::Real { hash, .. } | Self::Fake { hash, .. } => hash,
        }
    }
}

/// A real cashout whose signature is sealed under a chained puzzle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealPromise {
    pub hash: PromiseHash,
    pub lock_time: u32,
    pub commitment: PromiseCommitment,
}

/// Where the cashout pays and at which fee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashoutTerms {
    pub script: ScriptBuf,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PromiseClientState {
    WaitingEscrow,
    WaitingSignatureRequest {
        escrow: EscrowContext,
    },
    WaitingCommitments {
        escrow: EscrowContext,
        cashout: CashoutTerms,
        entries: Vec<PromiseHashEntry>,
    },
    WaitingFakeProof {
        escrow: EscrowContext,
        cashout: CashoutTerms,
        entries: Vec<PromiseHashEntry>,
        commitments: Vec<PromiseCommitment>,
    },
    WaitingPuzzleSolution {
        escrow: EscrowContext,
        cashout: CashoutTerms,
        real: Vec<RealPromise>,
        quotients: Vec<Quotient>,
    },
    Completed {
        escrow: EscrowContext,
        transaction: Transaction,
    },
}

impl PromiseClientState {
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        match self {
            Self::WaitingEscrow => "waiting_escrow",
            Self::WaitingSignatureRequest { .. } => "waiting_signature_request",
            Self::WaitingCommitments { .. } => "waiting_commitments",
            Self::WaitingFakeProof { .. } => "waiting_fake_proof",
            Self::WaitingPuzzleSolution { .. } => "waiting_puzzle_solution",
            Self::Completed { .. } => "completed",
        }
    }

    fn check_shape(&self, parameters: &PromiseParameters) -> Result<()> {
        let real_count = parameters.real_transaction_count;
        match self {
            Self::WaitingEscrow => Ok(()),
            Self::WaitingSignatureRequest { escrow } | Self::Completed { escrow, .. } => {
                escrow.check(EscrowRole::Receiver)
            }
            Self::WaitingCommitments { escrow, entries, .. } => {
                escrow.check(EscrowRole::Receiver)?;
                check_entries(parameters, entries)
            }
            Self::WaitingFakeProof { escrow, entries, commitments, .. } => {
                escrow.check(EscrowRole::Receiver)?;
                check_entries(parameters, entries)?;
                check_len(entries.len(), commitments.len())
            }
            Self::WaitingPuzzleSolution { escrow, real, quotients, .. } => {
                escrow.check(EscrowRole::Receiver)?;
                check_len(real_count, real.len())?;
                check_len(real_count - 1, quotients.len())
            }
        }
    }
}

fn check_entries(parameters: &PromiseParameters, entries: &[PromiseHashEntry]) -> Result<()> {
    check_len(parameters.total_transaction_count(), entries.len())?;
    let real = entries
        .iter()
        .filter(|e| matches!(e, PromiseHashEntry::Real { .. }))
        .count();
    check_len(parameters.real_transaction_count, real)
}

#[derive(Debug)]
pub struct PromiseClientSession {
    parameters: PromiseParameters,
    state: PromiseClientState,
}

impl PromiseClientSession {
    /// # Errors
    /// `InvalidParameters` for invalid parameters.
    pub fn new(parameters: PromiseParameters) -> Result<Self> {
        Self::from_state(parameters, PromiseClientState::WaitingEscrow)
    }

    /// # Errors
    /// `InvalidParameters` for invalid parameters; a domain error if `state`
    /// does not fit the parameters.
    pub fn from_state(parameters: PromiseParameters, state: PromiseClientState) -> Result<Self> {
        parameters.validate()?;
        state.check_shape(&parameters)?;
        Ok(Self { parameters, state })
    }

    #[must_use]
    pub const fn state(&self) -> &PromiseClientState {
        &self.state
    }

    #[must_use]
    pub const fn phase(&self) -> &'static str {
        self.state.phase()
    }

    fn unexpected(&self, expected: &'static str) -> TumblerError {
        TumblerError::ProtocolState { expected, actual: self.state.phase() }
    }

    fn advance(&mut self, next: PromiseClientState) {
        debug!(role = ROLE, from = self.state.phase(), to = next.phase(), "session transition");
        self.state = next;
    }

    /// Bind the session to an escrow paying this client.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_escrow`; `InvalidEscrow` or
    /// `InvalidScript` if the escrow does not name `key` as receiver.
    pub fn configure_escrow(&mut self, coin: EscrowCoin, key: SecretKey) -> Result<()> {
        if !matches!(self.state, PromiseClientState::WaitingEscrow) {
            return Err(self.unexpected("waiting_escrow"));
        }
        let escrow = EscrowContext::new(coin, key, EscrowRole::Receiver)?;
        self.advance(PromiseClientState::WaitingSignatureRequest { escrow });
        Ok(())
    }

    /// Hashes to be signed: one cashout sighash per real transaction, each
    /// with a distinct `nLockTime`, mixed with salted fake hashes.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_signature_request`;
    /// `InsufficientFunds` if the escrow cannot pay the cashout fee.
    pub fn create_signature_request<R: RngCore + CryptoRng>(
        &mut self,
        cashout: &Script,
        fee_rate: FeeRate,
        rng: &mut R,
    ) -> Result<Vec<PromiseHash>> {
        let PromiseClientState::WaitingSignatureRequest { escrow } = &self.state else {
            return Err(self.unexpected("waiting_signature_request"));
        };
        let fee = cashout_fee(&escrow.coin, cashout, fee_rate)?;
        let mut entries = Vec::with_capacity(self.parameters.total_transaction_count());
        for k in 0..self.parameters.real_transaction_count {
            let lock_time = u32::try_from(k).map_err(|_| TumblerError::InvalidParameters("too many real transactions"))?;
            let tx = build_cashout(&escrow.coin, cashout, fee, lock_time)?;
            let hash = signature_hash(&tx, 0, (&escrow.coin).into(), EcdsaSighashType::All)?;
            entries.push(PromiseHashEntry::Real { hash: PromiseHash(hash), lock_time });
        }
        for _ in 0..self.parameters.fake_transaction_count {
            let mut salt = FakeSalt([0u8; 32]);
            rng.fill_bytes(&mut salt.0);
            entries.push(PromiseHashEntry::Fake { hash: fake_hash(&salt), salt });
        }
        entries.shuffle(rng);
        let hashes = entries.iter().map(|e| *e.hash()).collect();
        let next = PromiseClientState::WaitingCommitments {
            escrow: escrow.clone(),
            cashout: CashoutTerms { script: cashout.to_owned(), fee },
            entries,
        };
        self.advance(next);
        Ok(hashes)
    }

    /// Record the sealed signatures and disclose the fake hashes.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_commitments`; `InvalidLength` if the
    /// number of commitments is not the batch size.
    pub fn check_commitments(&mut self, commitments: &[PromiseCommitment]) -> Result<PromiseRevelation> {
        let PromiseClientState::WaitingCommitments { escrow, cashout, entries } = &self.state else {
            return Err(self.unexpected("waiting_commitments"));
        };
        if commitments.len() != entries.len() {
            return Err(TumblerError::InvalidLength { expected: entries.len(), got: commitments.len() });
        }
        let mut fake_indexes = Vec::with_capacity(self.parameters.fake_transaction_count);
        let mut salts = Vec::with_capacity(self.parameters.fake_transaction_count);
        for (i, entry) in entries.iter().enumerate() {
            if let PromiseHashEntry::Fake { salt, .. } = entry {
                fake_indexes.push(i);
                salts.push(*salt);
            }
        }
        let next = PromiseClientState::WaitingFakeProof {
            escrow: escrow.clone(),
            cashout: cashout.clone(),
            entries: entries.clone(),
            commitments: commitments.to_vec(),
        };
        self.advance(next);
        Ok(PromiseRevelation { fake_indexes, salts })
    }

    /// Verify every fake promise opens to a valid signature and every
    /// quotient links consecutive real puzzles. Returns the first real
    /// puzzle, whose solution unlocks all real signatures.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_fake_proof`; `InvalidLength` for a
    /// proof of the wrong shape; `CheatDetected` for an invalid fake promise
    /// or quotient.
    pub fn check_fake_proof(&mut self, proof: &PromiseProof) -> Result<PuzzleValue> {
        let PromiseClientState::WaitingFakeProof { escrow, cashout, entries, commitments } = &self.state else {
            return Err(self.unexpected("waiting_fake_proof"));
        };
        let fake_count = self.parameters.fake_transaction_count;
        let real_count = self.parameters.real_transaction_count;
        if proof.fake_solutions.len() != fake_count {
            return Err(TumblerError::InvalidLength { expected: fake_count, got: proof.fake_solutions.len() });
        }
        if proof.quotients.len() != real_count - 1 {
            return Err(TumblerError::InvalidLength { expected: real_count - 1, got: proof.quotients.len() });
        }
        let pk = &self.parameters.server_key;
        let signer = escrow.params.initiator;
        let mut fake_solutions = proof.fake_solutions.iter();
        let mut real = Vec::with_capacity(real_count);
        for (index, (entry, commitment)) in entries.iter().zip(commitments).enumerate() {
            match entry {
                PromiseHashEntry::Fake { hash, .. } => {
                    let epsilon = fake_solutions
                        .next()
                        .ok_or(TumblerError::InvalidLength { expected: fake_count, got: 0 })?;
                    let valid = epsilon.solves(pk, &commitment.puzzle)
                        && open_signature(pk, epsilon, &commitment.encrypted_signature)
                            .is_some_and(|sig| verify_hash(&hash.0, &sig, &signer));
                    if !valid {
                        return Err(cheat(ROLE, Cheat::InvalidFakePromise { index }));
                    }
                }
                PromiseHashEntry::Real { hash, lock_time } => real.push(RealPromise {
                    hash: *hash,
                    lock_time: *lock_time,
                    commitment: commitment.clone(),
                }),
            }
        }
        for (index, (pair, quotient)) in real.windows(2).zip(&proof.quotients).enumerate() {
            let shifted = pair[0].commitment.puzzle.shift(pk, quotient)?;
            if shifted != pair[1].commitment.puzzle {
                return Err(cheat(ROLE, Cheat::InvalidQuotient { index }));
            }
        }
        let first = real
            .first()
            .map(|r| r.commitment.puzzle.clone())
            .ok_or(TumblerError::InvalidLength { expected: real_count, got: 0 })?;
        let next = PromiseClientState::WaitingPuzzleSolution {
            escrow: escrow.clone(),
            cashout: cashout.clone(),
            real,
            quotients: proof.quotients.clone(),
        };
        self.advance(next);
        Ok(first)
    }

    /// Unlock the real signatures with the solution of the first real puzzle
    /// and return the first cashout that carries a valid one, fully signed.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_puzzle_solution`; `CheatDetected` if
    /// `solution` does not solve the first real puzzle or no real promise
    /// holds a valid signature.
    pub fn get_signed_transaction(&mut self, solution: &PuzzleSolution) -> Result<Transaction> {
        let PromiseClientState::WaitingPuzzleSolution { escrow, cashout, real, quotients } = &self.state else {
            return Err(self.unexpected("waiting_puzzle_solution"));
        };
        let pk = &self.parameters.server_key;
        let first = real.first().ok_or(TumblerError::InvalidLength { expected: 1, got: 0 })?;
        if !solution.solves(pk, &first.commitment.puzzle) {
            return Err(cheat(ROLE, Cheat::InvalidSolution));
        }
        let signer = escrow.params.initiator;
        let mut epsilon = solution.clone();
        let mut signed = None;
        for (k, promise) in real.iter().enumerate() {
            if k > 0 {
                epsilon = epsilon.multiply(pk, &quotients[k - 1])?;
            }
            match open_signature(pk, &epsilon, &promise.commitment.encrypted_signature) {
                Some(sig) if verify_hash(&promise.hash.0, &sig, &signer) => {
                    signed = Some((promise.lock_time, sig));
                    break;
                }
                _ => debug!(role = ROLE, index = k, "real promise does not open to a valid signature"),
            }
        }
        let (lock_time, server_signature) = signed.ok_or_else(|| cheat(ROLE, Cheat::NoValidPromise))?;

        let coin = (&escrow.coin).into();
        let mut tx = build_cashout(&escrow.coin, &cashout.script, cashout.fee, lock_time)?;
        let ours = sign_input(&tx, 0, coin, &escrow.key, EcdsaSighashType::All)?;
        let theirs = ecdsa::Signature { signature: server_signature, sighash_type: EcdsaSighashType::All };
        tx.input[0].witness = cooperative_witness(&theirs, &ours, &escrow.coin.redeem_script);
        let next = PromiseClientState::Completed { escrow: escrow.clone(), transaction: tx.clone() };
        self.advance(next);
        Ok(tx)
    }
}
