//! Cut-and-choose puzzle solver protocol.
//!
//! The client sends a shuffled batch of real (blinded) and fake (self-solved)
//! puzzles. The server solves every one, commits to each solution under a
//! fresh [`SolutionKey`](crate::SolutionKey), and releases the fake keys only
//! after the client has proven it knew the fake solutions. The real keys are
//! released either cooperatively or through the fulfillment transaction,
//! whose witness carries them in the clear.
//!
//! Real entries keep their batch order everywhere after the audit: blind
//! factors, offer key hashes and revealed keys are all listed by ascending
//! batch index.

use bitcoin::{Amount, PublicKey, Transaction};
use serde::{Deserialize, Serialize};

use crate::puzzle::PuzzleSolution;

pub mod client;
pub mod server;

pub use client::{PuzzleSetElement, RealPuzzle, SolverClientSession, SolverClientState};
pub use server::{SolvedPuzzle, SolverServerSession, SolverServerState};

/// Client disclosure of the fake puzzles and their known solutions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverRevelation {
    pub fake_indexes: Vec<usize>,
    pub solutions: Vec<PuzzleSolution>,
}

/// What the client needs to build the offer transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferInformation {
    pub fulfill_key: PublicKey,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
}

/// Fully signed offer and fulfillment transactions, ready to broadcast in order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverFulfillment {
    pub offer_transaction: Transaction,
    pub fulfill_transaction: Transaction,
}
