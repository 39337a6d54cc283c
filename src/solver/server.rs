//! Solving party of the puzzle solver protocol.

use std::collections::BTreeSet;
use std::sync::Arc;

use bitcoin::secp256k1::SecretKey;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ecdsa, FeeRate, Script, Transaction};
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OfferInformation, SolverFulfillment, SolverRevelation};
use crate::commitment::{ServerCommitment, SolutionKey};
use crate::errors::{cheat, Cheat, Result, TumblerError};
use crate::escrow::{EscrowCoin, EscrowContext, EscrowRole};
use crate::params::{check_len, SolverParameters};
use crate::puzzle::{BlindFactor, PuzzleSolution, PuzzleValue};
use crate::script::OfferScriptParams;
use crate::trapdoor::RsaKey;
use crate::transaction::{
    build_escape, build_fulfill, build_offer, cooperative_witness, fulfill_witness, public_key_of,
    sign_input, sign_offer, verify_input_signature, UnsignedOffer,
};

const ROLE: &str = "solver-server";

/// Server-side record of one solved puzzle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolvedPuzzle {
    pub puzzle: PuzzleValue,
    pub solution_key: SolutionKey,
    pub solution: PuzzleSolution,
}

/// Phase of a server session. Each variant holds exactly what that phase needs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SolverServerState {
    WaitingEscrow,
    WaitingPuzzles {
        escrow: EscrowContext,
    },
    WaitingRevelation {
        escrow: EscrowContext,
        solved: Vec<SolvedPuzzle>,
    },
    WaitingBlindFactor {
        escrow: EscrowContext,
        real: Vec<SolvedPuzzle>,
    },
    WaitingFulfillment {
        escrow: EscrowContext,
        real: Vec<SolvedPuzzle>,
        offer: UnsignedOffer,
        fulfill_key: SecretKey,
    },
    WaitingEscape {
        escrow: EscrowContext,
        real: Vec<SolvedPuzzle>,
        fulfillment: SolverFulfillment,
    },
    Completed {
        solution_keys: Vec<SolutionKey>,
        escape_transaction: Transaction,
    },
}

impl SolverServerState {
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        match self {
            Self::WaitingEscrow => "waiting_escrow",
            Self::WaitingPuzzles { .. } => "waiting_puzzles",
            Self::WaitingRevelation { .. } => "waiting_revelation",
            Self::WaitingBlindFactor { .. } => "waiting_blind_factor",
            Self::WaitingFulfillment { .. } => "waiting_fulfillment",
            Self::WaitingEscape { .. } => "waiting_escape",
            Self::Completed { .. } => "completed",
        }
    }

    /// Check a loaded state against `parameters` before a session resumes it.
    fn check_shape(&self, parameters: &SolverParameters) -> Result<()> {
        let real_count = parameters.real_puzzle_count;
        match self {
            Self::WaitingEscrow => Ok(()),
            Self::WaitingPuzzles { escrow } => escrow.check(EscrowRole::Receiver),
            Self::WaitingRevelation { escrow, solved } => {
                escrow.check(EscrowRole::Receiver)?;
                check_len(parameters.total_puzzle_count(), solved.len())
            }
            Self::WaitingBlindFactor { escrow, real } | Self::WaitingEscape { escrow, real, .. } => {
                escrow.check(EscrowRole::Receiver)?;
                check_len(real_count, real.len())
            }
            Self::WaitingFulfillment { escrow, real, offer, .. } => {
                escrow.check(EscrowRole::Receiver)?;
                check_len(real_count, real.len())?;
                offer.check_shape()?;
                if offer.transaction.input[0].previous_output != escrow.coin.outpoint {
                    return Err(TumblerError::InvalidEscrow("offer does not spend the escrow"));
                }
                Ok(())
            }
            Self::Completed { solution_keys, .. } => check_len(real_count, solution_keys.len()),
        }
    }
}

/// Server session for one cycle and one escrow.
///
/// The RSA key is shared read-only between every session of a server.
#[derive(Debug)]
pub struct SolverServerSession {
    parameters: SolverParameters,
    key: Arc<RsaKey>,
    state: SolverServerState,
}

impl SolverServerSession {
    /// # Errors
    /// Returns `InvalidParameters` if the parameters are invalid or do not
    /// name `key`.
    pub fn new(parameters: SolverParameters, key: Arc<RsaKey>) -> Result<Self> {
        Self::from_state(parameters, key, SolverServerState::WaitingEscrow)
    }

    /// Resume a session from persisted state.
    ///
    /// # Errors
    /// Returns `InvalidParameters` if the parameters are invalid or do not
    /// name `key`; a domain error if the state does not fit the parameters.
    pub fn from_state(parameters: SolverParameters, key: Arc<RsaKey>, state: SolverServerState) -> Result<Self> {
        parameters.validate()?;
        if &parameters.server_key != key.public() {
            return Err(TumblerError::InvalidParameters("server key does not match parameters"));
        }
        state.check_shape(&parameters)?;
        Ok(Self { parameters, key, state })
    }

    #[must_use]
    pub const fn state(&self) -> &SolverServerState {
        &self.state
    }

    #[must_use]
    pub const fn parameters(&self) -> &SolverParameters {
        &self.parameters
    }

    #[must_use]
    pub const fn phase(&self) -> &'static str {
        self.state.phase()
    }

    fn unexpected(&self, expected: &'static str) -> TumblerError {
        TumblerError::ProtocolState { expected, actual: self.state.phase() }
    }

    fn advance(&mut self, next: SolverServerState) {
        debug!(role = ROLE, from = self.state.phase(), to = next.phase(), "session transition");
        self.state = next;
    }

    /// Bind the session to an escrow in which this server is the receiver.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_escrow`; `InvalidEscrow` or
    /// `InvalidScript` if the escrow does not name `key` as receiver.
    pub fn configure_escrow(&mut self, coin: EscrowCoin, key: SecretKey) -> Result<()> {
        if !matches!(self.state, SolverServerState::WaitingEscrow) {
            return Err(self.unexpected("waiting_escrow"));
        }
        let escrow = EscrowContext::new(coin, key, EscrowRole::Receiver)?;
        self.advance(SolverServerState::WaitingPuzzles { escrow });
        Ok(())
    }

    /// Solve the whole batch and commit to each solution.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_puzzles`; a domain error for a batch
    /// of the wrong size or a puzzle outside the RSA domain.
    pub fn solve_puzzles<R: RngCore + CryptoRng>(&mut self, puzzles: &[PuzzleValue], rng: &mut R) -> Result<Vec<ServerCommitment>> {
        let SolverServerState::WaitingPuzzles { escrow } = &self.state else {
            return Err(self.unexpected("waiting_puzzles"));
        };
        let total = self.parameters.total_puzzle_count();
        if puzzles.len() != total {
            return Err(TumblerError::InvalidLength { expected: total, got: puzzles.len() });
        }
        let pk = self.key.public();
        let mut solved = Vec::with_capacity(total);
        let mut commitments = Vec::with_capacity(total);
        for puzzle in puzzles {
            let solution = puzzle.solve(&self.key)?;
            let solution_key = SolutionKey::random(rng);
            commitments.push(ServerCommitment::new(pk, &solution_key, &solution)?);
            solved.push(SolvedPuzzle { puzzle: puzzle.clone(), solution_key, solution });
        }
        let next = SolverServerState::WaitingRevelation { escrow: escrow.clone(), solved };
        self.advance(next);
        Ok(commitments)
    }

    /// Audit the fake puzzles and release their solution keys.
    ///
    /// The comparison with the solved values is not constant time.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_revelation`; a domain error for a
    /// malformed revelation; `CheatDetected` if any claimed solution differs
    /// from the solved value, in which case no key is released.
    pub fn check_revelation(&mut self, revelation: &SolverRevelation) -> Result<Vec<SolutionKey>> {
        let SolverServerState::WaitingRevelation { escrow, solved } = &self.state else {
            return Err(self.unexpected("waiting_revelation"));
        };
        self.parameters.check_fake_indexes(&revelation.fake_indexes)?;
        if revelation.solutions.len() != revelation.fake_indexes.len() {
            return Err(TumblerError::InvalidLength {
                expected: revelation.fake_indexes.len(),
                got: revelation.solutions.len(),
            });
        }
        for (&index, claimed) in revelation.fake_indexes.iter().zip(&revelation.solutions) {
            if &solved[index].solution != claimed {
                return Err(cheat(ROLE, Cheat::FakeSolutionMismatch { index }));
            }
        }
        let fakes: BTreeSet<usize> = revelation.fake_indexes.iter().copied().collect();
        let keys = revelation.fake_indexes.iter().map(|&i| solved[i].solution_key).collect();
        let real = solved
            .iter()
            .enumerate()
            .filter(|(i, _)| !fakes.contains(i))
            .map(|(_, s)| s.clone())
            .collect();
        let next = SolverServerState::WaitingBlindFactor { escrow: escrow.clone(), real };
        self.advance(next);
        Ok(keys)
    }

    /// Check every real puzzle hides the same value and prepare the offer.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_blind_factor`; a domain error for the
    /// wrong number of factors or a non-invertible factor; `CheatDetected`
    /// if two real puzzles unblind to different values; `InsufficientFunds`
    /// if the escrow cannot pay the offer fee.
    pub fn check_blind_factors<R: RngCore + CryptoRng>(
        &mut self,
        factors: &[BlindFactor],
        fee_rate: FeeRate,
        rng: &mut R,
    ) -> Result<OfferInformation> {
        let SolverServerState::WaitingBlindFactor { escrow, real } = &self.state else {
            return Err(self.unexpected("waiting_blind_factor"));
        };
        if factors.len() != real.len() {
            return Err(TumblerError::InvalidLength { expected: real.len(), got: factors.len() });
        }
        let pk = self.key.public();
        let mut unblinded: Option<PuzzleValue> = None;
        for (entry, factor) in real.iter().zip(factors) {
            let value = entry.puzzle.unblind(pk, factor)?;
            match &unblinded {
                Some(first) if *first != value => return Err(cheat(ROLE, Cheat::InconsistentRealPuzzles)),
                Some(_) => {}
                None => unblinded = Some(value),
            }
        }

        let fulfill_key = SecretKey::new(rng);
        let offer_params = OfferScriptParams {
            hashes: real.iter().map(|s| s.solution_key.hash()).collect(),
            fulfill_key: public_key_of(&fulfill_key),
            redeem_key: escrow.params.initiator,
            expiration: escrow.params.lock_time,
        };
        let offer = build_offer(&escrow.coin, &offer_params, fee_rate)?;
        let info = OfferInformation { fulfill_key: offer_params.fulfill_key, fee: offer.fee };
        let next = SolverServerState::WaitingFulfillment {
            escrow: escrow.clone(),
            real: real.clone(),
            offer,
            fulfill_key,
        };
        self.advance(next);
        Ok(info)
    }

    /// Countersign the offer and build the fulfillment that reveals every
    /// real solution key on chain.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_fulfillment`;
    /// `UnexpectedSighashType` unless the client signed with `SIGHASH_ALL`;
    /// `CheatDetected` for an invalid client signature; `InsufficientFunds`
    /// if the offer cannot pay the fulfillment fee.
    pub fn fulfill_offer(
        &mut self,
        client_signature: &ecdsa::Signature,
        cashout: &Script,
        fee_rate: FeeRate,
    ) -> Result<SolverFulfillment> {
        let SolverServerState::WaitingFulfillment { escrow, real, offer, fulfill_key } = &self.state else {
            return Err(self.unexpected("waiting_fulfillment"));
        };
        if client_signature.sighash_type != EcdsaSighashType::All {
            return Err(TumblerError::UnexpectedSighashType(client_signature.sighash_type));
        }
        let coin = (&escrow.coin).into();
        if !verify_input_signature(&offer.transaction, 0, coin, &escrow.params.initiator, client_signature)? {
            return Err(cheat(ROLE, Cheat::InvalidSignature));
        }
        let ours = sign_offer(offer, &escrow.coin, &escrow.key)?;
        let mut offer_transaction = offer.transaction.clone();
        offer_transaction.input[0].witness = cooperative_witness(client_signature, &ours, &escrow.coin.redeem_script);

        let keys: Vec<SolutionKey> = real.iter().map(|s| s.solution_key).collect();
        let mut fulfill_transaction = build_fulfill(offer.coin(), keys.len(), cashout, fee_rate)?;
        let signature = sign_input(&fulfill_transaction, 0, offer.coin(), fulfill_key, EcdsaSighashType::All)?;
        fulfill_transaction.input[0].witness = fulfill_witness(&signature, &keys, &offer.script);

        let fulfillment = SolverFulfillment { offer_transaction, fulfill_transaction };
        let next = SolverServerState::WaitingEscape {
            escrow: escrow.clone(),
            real: real.clone(),
            fulfillment: fulfillment.clone(),
        };
        self.advance(next);
        Ok(fulfillment)
    }

    /// Cooperative reveal of the real solution keys, in batch order.
    ///
    /// # Errors
    /// `ProtocolState` before the offer has been fulfilled.
    pub fn reveal_solution_keys(&self) -> Result<Vec<SolutionKey>> {
        match &self.state {
            SolverServerState::WaitingEscape { real, .. } => Ok(real.iter().map(|s| s.solution_key).collect()),
            SolverServerState::Completed { solution_keys, .. } => Ok(solution_keys.clone()),
            _ => Err(self.unexpected("waiting_escape")),
        }
    }

    /// Take the escrow directly with the client's `SIGHASH_NONE|ANYONECANPAY`
    /// signature instead of broadcasting offer and fulfillment.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_escape`; `UnexpectedSighashType` for
    /// any other signature mode; `CheatDetected` for an invalid signature.
    pub fn get_signed_escape_transaction(
        &mut self,
        client_signature: &ecdsa::Signature,
        fee_rate: FeeRate,
        cashout: &Script,
    ) -> Result<Transaction> {
        let SolverServerState::WaitingEscape { escrow, real, .. } = &self.state else {
            return Err(self.unexpected("waiting_escape"));
        };
        if client_signature.sighash_type != EcdsaSighashType::NonePlusAnyoneCanPay {
            return Err(TumblerError::UnexpectedSighashType(client_signature.sighash_type));
        }
        let mut tx = build_escape(&escrow.coin, cashout, fee_rate)?;
        let coin = (&escrow.coin).into();
        if !verify_input_signature(&tx, 0, coin, &escrow.params.initiator, client_signature)? {
            return Err(cheat(ROLE, Cheat::InvalidSignature));
        }
        let ours = sign_input(&tx, 0, coin, &escrow.key, EcdsaSighashType::All)?;
        tx.input[0].witness = cooperative_witness(client_signature, &ours, &escrow.coin.redeem_script);
        let next = SolverServerState::Completed {
            solution_keys: real.iter().map(|s| s.solution_key).collect(),
            escape_transaction: tx.clone(),
        };
        self.advance(next);
        Ok(tx)
    }
}
