use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = TumblerError> = core::result::Result<T, E>;

/// Coarse classification of a [`TumblerError`].
///
/// `Domain` errors are caller bugs and are never retried automatically,
/// `ProtocolState` errors indicate a scheduling bug, `Cheat` errors are fatal
/// to the session and the cycle must be abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Domain,
    ProtocolState,
    Cheat,
    Internal,
}

/// Evidence that the peer deviated from the protocol.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Cheat {
    #[error("claimed solution for fake puzzle {index} does not match the solved value")]
    FakeSolutionMismatch { index: usize },

    #[error("real puzzles unblind to different values")]
    InconsistentRealPuzzles,

    #[error("solution key {index} does not hash to its commitment")]
    SolutionKeyMismatch { index: usize },

    #[error("solution {index} does not decrypt under its revealed key")]
    UndecryptableSolution { index: usize },

    #[error("revealed solution for puzzle {index} differs from the known one")]
    WrongFakeSolution { index: usize },

    #[error("recovered solution does not solve the requested puzzle")]
    InvalidSolution,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("fake hash {index} was not derived from its revealed salt")]
    FakeHashMismatch { index: usize },

    #[error("fake promise {index} does not open to a valid signature")]
    InvalidFakePromise { index: usize },

    #[error("quotient {index} does not link consecutive real puzzles")]
    InvalidQuotient { index: usize },

    #[error("no real promise opens to a valid signature")]
    NoValidPromise,
}

#[derive(Debug, Error)]
pub enum TumblerError {
    #[error("invalid length: expected {expected} got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("index out of range: {index} not in [0, {max})")]
    OutOfRangeIndex { index: usize, max: usize },

    #[error("duplicate index {0}")]
    DuplicateIndex(usize),

    #[error("value outside the RSA domain")]
    OutOfDomain,

    #[error("blind factor is not invertible modulo the public modulus")]
    NonInvertibleFactor,

    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),

    #[error("invalid escrow: {0}")]
    InvalidEscrow(&'static str),

    #[error("invalid script: {0}")]
    InvalidScript(&'static str),

    #[error("unexpected signature hash mode {0}")]
    UnexpectedSighashType(bitcoin::sighash::EcdsaSighashType),

    #[error("amount {amount} cannot cover fee {fee}")]
    InsufficientFunds { amount: bitcoin::Amount, fee: bitcoin::Amount },

    #[error("announced fee {fee} exceeds the local bound {max}")]
    ExcessiveFee { fee: bitcoin::Amount, max: bitcoin::Amount },

    #[error("decode error: {0}")]
    DecodeError(&'static str),

    #[error("protocol state error: expected {expected}, session is {actual}")]
    ProtocolState { expected: &'static str, actual: &'static str },

    #[error("cheat detected: {0}")]
    CheatDetected(#[from] Cheat),

    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("sighash: {0}")]
    Sighash(String),

    #[error("fee overflow")]
    FeeOverflow,

    #[error("authenticated encryption failed")]
    Seal,

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("state store: {0}")]
    Store(String),
}

impl TumblerError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidLength { .. }
            | Self::OutOfRangeIndex { .. }
            | Self::DuplicateIndex(_)
            | Self::OutOfDomain
            | Self::NonInvertibleFactor
            | Self::InvalidParameters(_)
            | Self::InvalidEscrow(_)
            | Self::InvalidScript(_)
            | Self::UnexpectedSighashType(_)
            | Self::InsufficientFunds { .. }
            | Self::ExcessiveFee { .. }
            | Self::DecodeError(_) => ErrorKind::Domain,
            Self::ProtocolState { .. } => ErrorKind::ProtocolState,
            Self::CheatDetected(_) => ErrorKind::Cheat,
            Self::Rsa(_)
            | Self::Sighash(_)
            | Self::FeeOverflow
            | Self::Seal
            | Self::Serialization(_)
            | Self::Store(_) => ErrorKind::Internal,
        }
    }

    #[must_use]
    pub const fn is_cheat(&self) -> bool {
        matches!(self, Self::CheatDetected(_))
    }

    /// The cheat evidence carried by this error, if any.
    #[must_use]
    pub const fn cheat(&self) -> Option<&Cheat> {
        match self {
            Self::CheatDetected(c) => Some(c),
            _ => None,
        }
    }
}

/// Log `cheat` at warn level, distinct from transient faults, and wrap it.
pub(crate) fn cheat(role: &'static str, cheat: Cheat) -> TumblerError {
    tracing::warn!(role, cheat = %cheat, "cheat detected");
    TumblerError::CheatDetected(cheat)
}

/// Log the cheat carried by `err`, if any, and pass it through.
pub(crate) fn note_cheat(role: &'static str, err: TumblerError) -> TumblerError {
    if let Some(c) = err.cheat() {
        tracing::warn!(role, cheat = %c, "cheat detected");
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(TumblerError::OutOfDomain.kind(), ErrorKind::Domain);
        assert_eq!(
            TumblerError::InvalidLength { expected: 3, got: 2 }.kind(),
            ErrorKind::Domain
        );
        assert_eq!(
            TumblerError::ProtocolState { expected: "waiting_puzzles", actual: "completed" }.kind(),
            ErrorKind::ProtocolState
        );
        let cheat = TumblerError::from(Cheat::InconsistentRealPuzzles);
        assert_eq!(cheat.kind(), ErrorKind::Cheat);
        assert!(cheat.is_cheat());
        assert_eq!(cheat.cheat(), Some(&Cheat::InconsistentRealPuzzles));
        assert_eq!(TumblerError::Store("down".into()).kind(), ErrorKind::Internal);
    }

    #[test]
    fn messages_name_the_offending_index() {
        let e = TumblerError::from(Cheat::FakeSolutionMismatch { index: 7 });
        assert_eq!(
            e.to_string(),
            "cheat detected: claimed solution for fake puzzle 7 does not match the solved value"
        );
    }
}
