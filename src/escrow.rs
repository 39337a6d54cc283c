use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TumblerError};
use crate::script::EscrowScriptParams;
use crate::transaction::public_key_of;

/// An on-chain escrow output together with its redeem script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowCoin {
    pub outpoint: OutPoint,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub redeem_script: ScriptBuf,
}

impl EscrowCoin {
    #[must_use]
    pub fn new(outpoint: OutPoint, amount: Amount, params: &EscrowScriptParams) -> Self {
        Self { outpoint, amount, redeem_script: params.to_script() }
    }

    /// P2WSH output paying to the redeem script.
    #[must_use]
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.redeem_script.wscript_hash())
    }

    /// # Errors
    /// Returns `TumblerError::InvalidScript` if the redeem script is not an escrow script.
    pub fn params(&self) -> Result<EscrowScriptParams> {
        EscrowScriptParams::from_script(&self.redeem_script)
    }
}

/// Which side of the escrow script a session's key must occupy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscrowRole {
    Initiator,
    Receiver,
}

/// A validated escrow bound to the local party's key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EscrowContext {
    pub coin: EscrowCoin,
    pub params: EscrowScriptParams,
    pub key: SecretKey,
}

impl EscrowContext {
    /// Bind `coin` to `key`, checking the script names `key` in `role`.
    ///
    /// # Errors
    /// Returns `TumblerError::InvalidEscrow` for an empty coin or a script that
    /// does not name this party, `InvalidScript` for a malformed script.
    pub fn new(coin: EscrowCoin, key: SecretKey, role: EscrowRole) -> Result<Self> {
        if coin.amount == Amount::ZERO {
            return Err(TumblerError::InvalidEscrow("escrow amount is zero"));
        }
        let params = coin.params()?;
        let ours = public_key_of(&key);
        let expected = match role {
            EscrowRole::Initiator => params.initiator,
            EscrowRole::Receiver => params.receiver,
        };
        if expected != ours {
            return Err(TumblerError::InvalidEscrow("escrow script does not name this party"));
        }
        if params.initiator == params.receiver {
            return Err(TumblerError::InvalidEscrow("escrow parties must differ"));
        }
        Ok(Self { coin, params, key })
    }

    /// Re-run the checks of [`Self::new`] on a context loaded from storage.
    ///
    /// # Errors
    /// As [`Self::new`], plus `InvalidEscrow` if the stored parameters do
    /// not match the redeem script.
    pub fn check(&self, role: EscrowRole) -> Result<()> {
        let fresh = Self::new(self.coin.clone(), self.key, role)?;
        if fresh.params != self.params {
            return Err(TumblerError::InvalidEscrow("stored parameters do not match the script"));
        }
        Ok(())
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        public_key_of(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{outpoint, public_key, secret_key};

    fn coin() -> EscrowCoin {
        let params = EscrowScriptParams { initiator: public_key(1), receiver: public_key(2), lock_time: 500 };
        EscrowCoin::new(outpoint(9), Amount::from_sat(100_000), &params)
    }

    #[test]
    fn binds_the_named_party() {
        let ctx = EscrowContext::new(coin(), secret_key(2), EscrowRole::Receiver).unwrap();
        assert_eq!(ctx.public_key(), public_key(2));
        assert_eq!(ctx.params.lock_time, 500);
        assert!(EscrowContext::new(coin(), secret_key(1), EscrowRole::Initiator).is_ok());
    }

    #[test]
    fn rejects_a_stranger() {
        let err = EscrowContext::new(coin(), secret_key(3), EscrowRole::Receiver).unwrap_err();
        assert!(matches!(err, TumblerError::InvalidEscrow(_)));
        let err = EscrowContext::new(coin(), secret_key(1), EscrowRole::Receiver).unwrap_err();
        assert!(matches!(err, TumblerError::InvalidEscrow(_)));
    }

    #[test]
    fn stored_context_is_rechecked() {
        let mut ctx = EscrowContext::new(coin(), secret_key(2), EscrowRole::Receiver).unwrap();
        assert!(ctx.check(EscrowRole::Receiver).is_ok());
        assert!(ctx.check(EscrowRole::Initiator).is_err());
        ctx.params.lock_time = 501;
        assert!(matches!(ctx.check(EscrowRole::Receiver), Err(TumblerError::InvalidEscrow(_))));
    }

    #[test]
    fn rejects_empty_or_malformed_coins() {
        let mut c = coin();
        c.amount = Amount::ZERO;
        assert!(EscrowContext::new(c, secret_key(2), EscrowRole::Receiver).is_err());
        let mut c = coin();
        c.redeem_script = ScriptBuf::new();
        assert!(matches!(
            EscrowContext::new(c, secret_key(2), EscrowRole::Receiver),
            Err(TumblerError::InvalidScript(_))
        ));
    }
}
