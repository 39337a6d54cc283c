//! Requesting party of the puzzle solver protocol.

use bitcoin::secp256k1::SecretKey;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ecdsa, FeeRate, Script, Transaction};
use rand::seq::SliceRandom;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OfferInformation, SolverRevelation};
use crate::commitment::{ServerCommitment, SolutionKey};
use crate::errors::{cheat, note_cheat, Cheat, Result, TumblerError};
use crate::escrow::{EscrowCoin, EscrowContext, EscrowRole};
use crate::params::{check_len, SolverParameters};
use crate::puzzle::{BlindFactor, PuzzleSolution, PuzzleValue};
use crate::script::OfferScriptParams;
use crate::transaction::{
    build_escrow_redeem, build_offer, build_offer_redeem, build_offer_with_fee, escape_template,
    extract_solution_keys, refund_witness, sign_input, sign_offer, UnsignedOffer,
};

const ROLE: &str = "solver-client";

/// One position of the shuffled batch sent to the server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PuzzleSetElement {
    /// The target puzzle under a fresh blind factor.
    Real { puzzle: PuzzleValue, blind_factor: BlindFactor },
    /// A puzzle whose solution the client chose itself.
    Fake { puzzle: PuzzleValue, solution: PuzzleSolution },
}

impl PuzzleSetElement {
    #[must_use]
    pub const fn puzzle(&self) -> &PuzzleValue {
        match self {
            Self::Real { puzzle, .. } | Self::Fake { puzzle, .. } => puzzle,
        }
    }
}

/// A real puzzle that survived the audit, with the server's commitment to it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealPuzzle {
    pub puzzle: PuzzleValue,
    pub blind_factor: BlindFactor,
    pub commitment: ServerCommitment,
}

/// Phase of a client session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum SolverClientState {
    WaitingEscrow {
        puzzle: PuzzleValue,
    },
    WaitingGeneratePuzzles {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
    },
    WaitingCommitments {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
        elements: Vec<PuzzleSetElement>,
    },
    WaitingFakeSolutionKeys {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
        elements: Vec<PuzzleSetElement>,
        commitments: Vec<ServerCommitment>,
    },
    WaitingBlindFactorRequest {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
        real: Vec<RealPuzzle>,
    },
    WaitingOffer {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
        real: Vec<RealPuzzle>,
    },
    WaitingPuzzleSolutions {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
        real: Vec<RealPuzzle>,
        offer: UnsignedOffer,
    },
    Completed {
        puzzle: PuzzleValue,
        escrow: EscrowContext,
        solution: PuzzleSolution,
    },
}

impl SolverClientState {
    #[must_use]
    pub const fn phase(&self) -> &'static str {
        match self {
            Self::WaitingEscrow { .. } => "waiting_escrow",
            Self::WaitingGeneratePuzzles { .. } => "waiting_generate_puzzles",
            Self::WaitingCommitments { .. } => "waiting_commitments",
            Self::WaitingFakeSolutionKeys { .. } => "waiting_fake_solution_keys",
            Self::WaitingBlindFactorRequest { .. } => "waiting_blind_factor_request",
            Self::WaitingOffer { .. } => "waiting_offer",
            Self::WaitingPuzzleSolutions { .. } => "waiting_puzzle_solutions",
            Self::Completed { .. } => "completed",
        }
    }

    /// The puzzle whose solution this session recovers.
    #[must_use]
    pub const fn puzzle(&self) -> &PuzzleValue {
        match self {
            Self::WaitingEscrow { puzzle }
            | Self::WaitingGeneratePuzzles { puzzle, .. }
            | Self::WaitingCommitments { puzzle, .. }
            | Self::WaitingFakeSolutionKeys { puzzle, .. }
            | Self::WaitingBlindFactorRequest { puzzle, .. }
            | Self::WaitingOffer { puzzle, .. }
            | Self::WaitingPuzzleSolutions { puzzle, .. }
            | Self::Completed { puzzle, .. } => puzzle,
        }
    }

    const fn escrow(&self) -> Option<&EscrowContext> {
        match self {
            Self::WaitingEscrow { .. } => None,
            Self::WaitingGeneratePuzzles { escrow, .. }
            | Self::WaitingCommitments { escrow, .. }
            | Self::WaitingFakeSolutionKeys { escrow, .. }
            | Self::WaitingBlindFactorRequest { escrow, .. }
            | Self::WaitingOffer { escrow, .. }
            | Self::WaitingPuzzleSolutions { escrow, .. }
            | Self::Completed { escrow, .. } => Some(escrow),
        }
    }

    /// Check a loaded state against `parameters` before a session resumes it.
    fn check_shape(&self, parameters: &SolverParameters) -> Result<()> {
        self.puzzle().check_domain(&parameters.server_key)?;
        if let Some(escrow) = self.escrow() {
            escrow.check(EscrowRole::Initiator)?;
        }
        let real_count = parameters.real_puzzle_count;
        match self {
            Self::WaitingCommitments { elements, .. } => check_elements(parameters, elements),
            Self::WaitingFakeSolutionKeys { elements, commitments, .. } => {
                check_elements(parameters, elements)?;
                check_len(elements.len(), commitments.len())
            }
            Self::WaitingBlindFactorRequest { real, .. } | Self::WaitingOffer { real, .. } => {
                check_len(real_count, real.len())
            }
            Self::WaitingPuzzleSolutions { escrow, real, offer, .. } => {
                check_len(real_count, real.len())?;
                offer.check_shape()?;
                if offer.transaction.input[0].previous_output != escrow.coin.outpoint {
                    return Err(TumblerError::InvalidEscrow("offer does not spend the escrow"));
                }
                Ok(())
            }
            Self::WaitingEscrow { .. } | Self::WaitingGeneratePuzzles { .. } | Self::Completed { .. } => Ok(()),
        }
    }
}

fn check_elements(parameters: &SolverParameters, elements: &[PuzzleSetElement]) -> Result<()> {
    check_len(parameters.total_puzzle_count(), elements.len())?;
    let real = elements
        .iter()
        .filter(|e| matches!(e, PuzzleSetElement::Real { .. }))
        .count();
    check_len(parameters.real_puzzle_count, real)
}

/// Client session recovering the solution of one puzzle.
#[derive(Debug)]
pub struct SolverClientSession {
    parameters: SolverParameters,
    state: SolverClientState,
}

impl SolverClientSession {
    /// Start a session for `puzzle`.
    ///
    /// # Errors
    /// `InvalidParameters` for invalid parameters, `OutOfDomain` if the
    /// puzzle is not below the server modulus.
    pub fn new(parameters: SolverParameters, puzzle: PuzzleValue) -> Result<Self> {
        puzzle.check_domain(&parameters.server_key)?;
        Self::from_state(parameters, SolverClientState::WaitingEscrow { puzzle })
    }

    /// Resume a session from persisted state.
    ///
    /// # Errors
    /// `InvalidParameters` for invalid parameters; a domain error if the
    /// state does not fit the parameters.
    pub fn from_state(parameters: SolverParameters, state: SolverClientState) -> Result<Self> {
        parameters.validate()?;
        state.check_shape(&parameters)?;
        Ok(Self { parameters, state })
    }

    #[must_use]
    pub const fn state(&self) -> &SolverClientState {
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

    /// The recovered solution once the session has completed.
    #[must_use]
    pub const fn solution(&self) -> Option<&PuzzleSolution> {
        match &self.state {
            SolverClientState::Completed { solution, .. } => Some(solution),
            _ => None,
        }
    }

    fn unexpected(&self, expected: &'static str) -> TumblerError {
        TumblerError::ProtocolState { expected, actual: self.state.phase() }
    }

    fn advance(&mut self, next: SolverClientState) {
        debug!(role = ROLE, from = self.state.phase(), to = next.phase(), "session transition");
        self.state = next;
    }

    /// Bind the session to an escrow this client funded.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_escrow`; `InvalidEscrow` or
    /// `InvalidScript` if the escrow does not name `key` as initiator.
    pub fn configure_escrow(&mut self, coin: EscrowCoin, key: SecretKey) -> Result<()> {
        let SolverClientState::WaitingEscrow { puzzle } = &self.state else {
            return Err(self.unexpected("waiting_escrow"));
        };
        let escrow = EscrowContext::new(coin, key, EscrowRole::Initiator)?;
        let next = SolverClientState::WaitingGeneratePuzzles { puzzle: puzzle.clone(), escrow };
        self.advance(next);
        Ok(())
    }

    /// Build the shuffled batch of real and fake puzzles.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_generate_puzzles`.
    pub fn generate_puzzles<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<Vec<PuzzleValue>> {
        let SolverClientState::WaitingGeneratePuzzles { puzzle, escrow } = &self.state else {
            return Err(self.unexpected("waiting_generate_puzzles"));
        };
        let pk = &self.parameters.server_key;
        let mut elements = Vec::with_capacity(self.parameters.total_puzzle_count());
        for _ in 0..self.parameters.real_puzzle_count {
            let blind_factor = BlindFactor::random(pk, rng);
            let blinded = puzzle.blind(pk, &blind_factor)?;
            elements.push(PuzzleSetElement::Real { puzzle: blinded, blind_factor });
        }
        for _ in 0..self.parameters.fake_puzzle_count {
            let solution = PuzzleSolution::random(pk, rng);
            let fake = solution.to_puzzle(pk)?;
            elements.push(PuzzleSetElement::Fake { puzzle: fake, solution });
        }
        elements.shuffle(rng);
        let puzzles = elements.iter().map(|e| e.puzzle().clone()).collect();
        let next = SolverClientState::WaitingCommitments {
            puzzle: puzzle.clone(),
            escrow: escrow.clone(),
            elements,
        };
        self.advance(next);
        Ok(puzzles)
    }

    /// Record the server's commitments and disclose the fake puzzles.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_commitments`; `InvalidLength` if the
    /// number of commitments is not the batch size.
    pub fn reveal(&mut self, commitments: &[ServerCommitment]) -> Result<SolverRevelation> {
        let SolverClientState::WaitingCommitments { puzzle, escrow, elements } = &self.state else {
            return Err(self.unexpected("waiting_commitments"));
        };
        if commitments.len() != elements.len() {
            return Err(TumblerError::InvalidLength { expected: elements.len(), got: commitments.len() });
        }
        let mut fake_indexes = Vec::with_capacity(self.parameters.fake_puzzle_count);
        let mut solutions = Vec::with_capacity(self.parameters.fake_puzzle_count);
        for (i, element) in elements.iter().enumerate() {
            if let PuzzleSetElement::Fake { solution, .. } = element {
                fake_indexes.push(i);
                solutions.push(solution.clone());
            }
        }
        let next = SolverClientState::WaitingFakeSolutionKeys {
            puzzle: puzzle.clone(),
            escrow: escrow.clone(),
            elements: elements.clone(),
            commitments: commitments.to_vec(),
        };
        self.advance(next);
        Ok(SolverRevelation { fake_indexes, solutions })
    }

    /// Open every fake commitment and check it holds the solution the client
    /// chose. Blind factors are only released after this passes.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_fake_solution_keys`; `InvalidLength`
    /// for the wrong number of keys; `CheatDetected` if a key does not match
    /// its hash, does not decrypt, or yields a different solution.
    pub fn check_fake_solution_keys(&mut self, keys: &[SolutionKey]) -> Result<()> {
        let SolverClientState::WaitingFakeSolutionKeys { puzzle, escrow, elements, commitments } = &self.state else {
            return Err(self.unexpected("waiting_fake_solution_keys"));
        };
        if keys.len() != self.parameters.fake_puzzle_count {
            return Err(TumblerError::InvalidLength { expected: self.parameters.fake_puzzle_count, got: keys.len() });
        }
        let pk = &self.parameters.server_key;
        let mut keys = keys.iter();
        let mut real = Vec::with_capacity(self.parameters.real_puzzle_count);
        for (index, (element, commitment)) in elements.iter().zip(commitments).enumerate() {
            match element {
                PuzzleSetElement::Fake { solution, .. } => {
                    let key = keys.next().ok_or(TumblerError::InvalidLength {
                        expected: self.parameters.fake_puzzle_count,
                        got: 0,
                    })?;
                    let opened = commitment.open(pk, key, index).map_err(|e| note_cheat(ROLE, e))?;
                    if &opened != solution {
                        return Err(cheat(ROLE, Cheat::WrongFakeSolution { index }));
                    }
                }
                PuzzleSetElement::Real { puzzle, blind_factor } => real.push(RealPuzzle {
                    puzzle: puzzle.clone(),
                    blind_factor: blind_factor.clone(),
                    commitment: commitment.clone(),
                }),
            }
        }
        let next = SolverClientState::WaitingBlindFactorRequest {
            puzzle: puzzle.clone(),
            escrow: escrow.clone(),
            real,
        };
        self.advance(next);
        Ok(())
    }

    /// Release the blind factors of the real puzzles, in batch order.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_blind_factor_request`.
    pub fn get_blind_factors(&mut self) -> Result<Vec<BlindFactor>> {
        let SolverClientState::WaitingBlindFactorRequest { puzzle, escrow, real } = &self.state else {
            return Err(self.unexpected("waiting_blind_factor_request"));
        };
        let factors = real.iter().map(|r| r.blind_factor.clone()).collect();
        let next = SolverClientState::WaitingOffer {
            puzzle: puzzle.clone(),
            escrow: escrow.clone(),
            real: real.clone(),
        };
        self.advance(next);
        Ok(factors)
    }

    /// Build the offer locking the escrow to the real key hashes and sign it.
    ///
    /// The announced fee may not exceed what `max_fee_rate` pays for the
    /// same offer.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_offer`; `ExcessiveFee` if the
    /// announced fee is above the local bound; `InsufficientFunds` if the
    /// escrow cannot pay it.
    pub fn create_offer_signature(
        &mut self,
        offer_info: &OfferInformation,
        max_fee_rate: FeeRate,
    ) -> Result<ecdsa::Signature> {
        let SolverClientState::WaitingOffer { puzzle, escrow, real } = &self.state else {
            return Err(self.unexpected("waiting_offer"));
        };
        let offer_params = OfferScriptParams {
            hashes: real.iter().map(|r| r.commitment.key_hash).collect(),
            fulfill_key: offer_info.fulfill_key,
            redeem_key: escrow.params.initiator,
            expiration: escrow.params.lock_time,
        };
        let max = build_offer(&escrow.coin, &offer_params, max_fee_rate)?.fee;
        if offer_info.fee > max {
            return Err(TumblerError::ExcessiveFee { fee: offer_info.fee, max });
        }
        let offer = build_offer_with_fee(&escrow.coin, &offer_params, offer_info.fee)?;
        let signature = sign_offer(&offer, &escrow.coin, &escrow.key)?;
        let next = SolverClientState::WaitingPuzzleSolutions {
            puzzle: puzzle.clone(),
            escrow: escrow.clone(),
            real: real.clone(),
            offer,
        };
        self.advance(next);
        Ok(signature)
    }

    /// Recover the solution from keys the server revealed cooperatively.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_puzzle_solutions`; `InvalidLength`
    /// for the wrong number of keys; `CheatDetected` if a key does not open
    /// its commitment, the real puzzles disagree, or the result does not
    /// solve the puzzle.
    pub fn check_solution_keys(&mut self, keys: &[SolutionKey]) -> Result<PuzzleSolution> {
        let SolverClientState::WaitingPuzzleSolutions { puzzle, escrow, real, .. } = &self.state else {
            return Err(self.unexpected("waiting_puzzle_solutions"));
        };
        if keys.len() != real.len() {
            return Err(TumblerError::InvalidLength { expected: real.len(), got: keys.len() });
        }
        let pk = &self.parameters.server_key;
        let mut recovered: Option<PuzzleSolution> = None;
        for (index, (entry, key)) in real.iter().zip(keys).enumerate() {
            let blinded = entry.commitment.open(pk, key, index).map_err(|e| note_cheat(ROLE, e))?;
            let solution = blinded.unblind(pk, &entry.blind_factor)?;
            match &recovered {
                Some(first) if *first != solution => return Err(cheat(ROLE, Cheat::InconsistentRealPuzzles)),
                Some(_) => {}
                None => recovered = Some(solution),
            }
        }
        let solution = recovered.ok_or(TumblerError::InvalidLength { expected: real.len(), got: 0 })?;
        if !solution.solves(pk, puzzle) {
            return Err(cheat(ROLE, Cheat::InvalidSolution));
        }
        let next = SolverClientState::Completed {
            puzzle: puzzle.clone(),
            escrow: escrow.clone(),
            solution: solution.clone(),
        };
        self.advance(next);
        Ok(solution)
    }

    /// Recover the solution from a fulfillment transaction seen on chain.
    ///
    /// # Errors
    /// As [`Self::check_solution_keys`], plus a domain error if `tx` does
    /// not spend the offer through its fulfillment branch.
    pub fn check_fulfillment_transaction(&mut self, tx: &Transaction) -> Result<PuzzleSolution> {
        let SolverClientState::WaitingPuzzleSolutions { offer, real, .. } = &self.state else {
            return Err(self.unexpected("waiting_puzzle_solutions"));
        };
        let keys = extract_solution_keys(tx, offer.coin().outpoint, real.len())?;
        self.check_solution_keys(&keys)
    }

    /// Let the server take the escrow directly now that the puzzle is solved.
    ///
    /// # Errors
    /// `ProtocolState` outside `completed`.
    pub fn create_escape_signature(&self) -> Result<ecdsa::Signature> {
        let SolverClientState::Completed { escrow, .. } = &self.state else {
            return Err(self.unexpected("completed"));
        };
        let template = escape_template(&escrow.coin);
        sign_input(&template, 0, (&escrow.coin).into(), &escrow.key, EcdsaSighashType::NonePlusAnyoneCanPay)
    }

    /// Signed refund of the escrow through its timelocked branch.
    ///
    /// # Errors
    /// `ProtocolState` before an escrow is configured; `InsufficientFunds`
    /// if the escrow cannot pay the fee.
    pub fn create_escrow_redeem_transaction(&self, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
        let escrow = self.state.escrow().ok_or_else(|| self.unexpected("waiting_generate_puzzles"))?;
        let coin = (&escrow.coin).into();
        let mut tx = build_escrow_redeem(&escrow.coin, escrow.params.lock_time, cashout, fee_rate)?;
        let signature = sign_input(&tx, 0, coin, &escrow.key, EcdsaSighashType::All)?;
        tx.input[0].witness = refund_witness(&signature, &escrow.coin.redeem_script);
        Ok(tx)
    }

    /// Signed refund of the offer after expiration, for a server that never
    /// fulfilled.
    ///
    /// # Errors
    /// `ProtocolState` outside `waiting_puzzle_solutions`;
    /// `InsufficientFunds` if the offer cannot pay the fee.
    pub fn create_offer_redeem_transaction(&self, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
        let SolverClientState::WaitingPuzzleSolutions { escrow, offer, .. } = &self.state else {
            return Err(self.unexpected("waiting_puzzle_solutions"));
        };
        let mut tx = build_offer_redeem(offer, escrow.params.lock_time, cashout, fee_rate)?;
        let signature = sign_input(&tx, 0, offer.coin(), &escrow.key, EcdsaSighashType::All)?;
        tx.input[0].witness = refund_witness(&signature, &offer.script);
        Ok(tx)
    }
}
