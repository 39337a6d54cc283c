#![forbid(unsafe_code)]
#![deny(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

//! TumbleBit core: RSA puzzle solving as a fair exchange.
//!
//! A client obtains the solution of an RSA puzzle from a server that is paid
//! only by revealing it. The exchange runs as a cut-and-choose protocol
//! between two untrusted sessions and settles through Bitcoin scripts whose
//! spending conditions force the server to publish the keys on chain.

// Fixed cryptographic choices:
// - Trapdoor: RSA-2048, e = 65537, textbook permutation over Z_n
// - Solution keys: 16 bytes, committed with RIPEMD160
// - Sealing: ChaCha20-Poly1305 under BLAKE3-derived keys, one message per key
// - Scripts: P2WSH, ECDSA over secp256k1, BIP143 sighashes
//
// Sessions are synchronous and advance one phase per call. A failed call
// leaves the session untouched.

// Core modules
pub mod types;
pub mod errors;
pub mod ser;
pub mod params;
pub mod trapdoor;
pub mod puzzle;
pub mod commitment;
pub mod script;
pub mod escrow;
pub mod transaction;
pub mod solver;
pub mod promise;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types and functions
pub use types::*;
pub use errors::{Cheat, ErrorKind, Result, TumblerError};
pub use params::{PromiseParameters, SolverParameters};
pub use trapdoor::{RsaKey, RsaPubKey};
pub use puzzle::{BlindFactor, PuzzleSolution, PuzzleValue, Quotient};
pub use commitment::{ServerCommitment, SolutionKey};
pub use script::{EscrowScriptParams, OfferScriptParams};
pub use escrow::{EscrowCoin, EscrowContext, EscrowRole};
pub use transaction::{
    build_cashout, build_escape, build_escrow_redeem, build_fulfill, build_offer,
    build_offer_redeem, build_offer_with_fee, extract_solution_keys, sign_input,
    verify_input_signature, ScriptCoin, UnsignedOffer,
};
pub use solver::{
    OfferInformation, SolverClientSession, SolverClientState, SolverFulfillment, SolverRevelation,
    SolverServerSession, SolverServerState,
};
pub use promise::{
    PromiseClientSession, PromiseClientState, PromiseCommitment, PromiseProof, PromiseRevelation,
    PromiseServerSession, PromiseServerState,
};
pub use registry::{MemoryStore, SessionId, SessionRegistry, SessionRole, StateStore};

// Version and protocol constants
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PROTOCOL_VERSION: u32 = 1;
