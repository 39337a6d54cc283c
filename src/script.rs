//! Escrow and offer redeem scripts.
//!
//! Escrow:
//! ```text
//! OP_DEPTH 3 OP_EQUAL
//! OP_IF
//!   2 <initiator> <receiver> 2 OP_CHECKMULTISIG
//! OP_ELSE
//!   <lock_time> OP_CLTV OP_DROP <initiator> OP_CHECKSIG
//! OP_ENDIF
//! ```
//!
//! Offer (`n` solution key hashes):
//! ```text
//! OP_DEPTH <n+1> OP_EQUAL
//! OP_IF
//!   (OP_RIPEMD160 <h_i> OP_EQUALVERIFY) for i = n-1 .. 0
//!   <fulfill_key> OP_CHECKSIG
//! OP_ELSE
//!   <expiration> OP_CLTV OP_DROP <redeem_key> OP_CHECKSIG
//! OP_ENDIF
//! ```

use bitcoin::opcodes::all::{
    OP_CHECKMULTISIG, OP_CHECKSIG, OP_CLTV, OP_DEPTH, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_IF, OP_PUSHNUM_1, OP_PUSHNUM_16, OP_RIPEMD160,
};
use bitcoin::opcodes::Opcode;
use bitcoin::script::{Builder, Instruction};
use bitcoin::{PublicKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::errors::{Result, TumblerError};
use crate::types::KeyHash;

/// Largest lock time interpreted as a block height.
pub const LOCK_TIME_THRESHOLD: u32 = 500_000_000;

/// Decoded script token.
#[derive(Debug, PartialEq, Eq)]
enum Token<'a> {
    Op(Opcode),
    Push(&'a [u8]),
}

fn tokens(script: &Script) -> Result<Vec<Token<'_>>> {
    script
        .instructions()
        .map(|ins| match ins {
            Ok(Instruction::Op(op)) => Ok(Token::Op(op)),
            Ok(Instruction::PushBytes(b)) => Ok(Token::Push(b.as_bytes())),
            Err(_) => Err(TumblerError::InvalidScript("undecodable instruction")),
        })
        .collect()
}

/// Minimal little-endian sign-magnitude script number.
fn decode_script_num(bytes: &[u8]) -> Option<i64> {
    if bytes.is_empty() {
        return Some(0);
    }
    if bytes.len() > 5 {
        return None;
    }
    let mut v: i64 = 0;
    for (i, b) in bytes.iter().enumerate() {
        v |= i64::from(*b) << (8 * i);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        v &= !(0x80_i64 << (8 * (bytes.len() - 1)));
        v = -v;
    }
    Some(v)
}

fn read_int(token: &Token<'_>) -> Option<i64> {
    match token {
        Token::Op(op) => {
            let code = op.to_u8();
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&code) {
                Some(i64::from(code - OP_PUSHNUM_1.to_u8() + 1))
            } else {
                None
            }
        }
        Token::Push(bytes) => decode_script_num(bytes),
    }
}

fn read_key(token: &Token<'_>) -> Option<PublicKey> {
    match token {
        Token::Push(bytes) => PublicKey::from_slice(bytes).ok(),
        Token::Op(_) => None,
    }
}

fn read_lock_time(token: &Token<'_>) -> Option<u32> {
    read_int(token)
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v < LOCK_TIME_THRESHOLD)
}

fn expect_op(token: Option<&Token<'_>>, op: Opcode) -> Result<()> {
    match token {
        Some(Token::Op(found)) if *found == op => Ok(()),
        _ => Err(TumblerError::InvalidScript("unexpected opcode")),
    }
}

/// Parties and timeout of a 2-of-2 escrow with a timelocked refund.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowScriptParams {
    /// Funds the escrow and may reclaim it after `lock_time`.
    pub initiator: PublicKey,
    /// Counterparty whose signature is needed for the cooperative path.
    pub receiver: PublicKey,
    /// Absolute block height of the refund path.
    pub lock_time: u32,
}

impl EscrowScriptParams {
    #[must_use]
    pub fn to_script(&self) -> ScriptBuf {
        Builder::new()
            .push_opcode(OP_DEPTH)
            .push_int(3)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF)
            .push_int(2)
            .push_key(&self.initiator)
            .push_key(&self.receiver)
            .push_int(2)
            .push_opcode(OP_CHECKMULTISIG)
            .push_opcode(OP_ELSE)
            .push_int(i64::from(self.lock_time))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&self.initiator)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    /// Recover parameters from a redeem script.
    ///
    /// # Errors
    /// Returns `TumblerError::InvalidScript` unless `script` is exactly an
    /// escrow script as produced by [`Self::to_script`].
    pub fn from_script(script: &Script) -> Result<Self> {
        let t = tokens(script)?;
        if t.len() != 16 {
            return Err(TumblerError::InvalidScript("escrow script has wrong shape"));
        }
        let initiator = read_key(&t[5]).ok_or(TumblerError::InvalidScript("bad initiator key"))?;
        let receiver = read_key(&t[6]).ok_or(TumblerError::InvalidScript("bad receiver key"))?;
        let lock_time = read_lock_time(&t[10]).ok_or(TumblerError::InvalidScript("bad lock time"))?;
        let params = Self { initiator, receiver, lock_time };
        if params.to_script().as_script() != script {
            return Err(TumblerError::InvalidScript("escrow script is not canonical"));
        }
        Ok(params)
    }

    #[must_use]
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.to_script().wscript_hash())
    }
}

/// Conditions of the offer output: reveal every key hash preimage and sign
/// with `fulfill_key`, or reclaim with `redeem_key` after `expiration`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferScriptParams {
    pub hashes: Vec<KeyHash>,
    pub fulfill_key: PublicKey,
    pub redeem_key: PublicKey,
    pub expiration: u32,
}

impl OfferScriptParams {
    #[must_use]
    pub fn to_script(&self) -> ScriptBuf {
        let depth = i64::try_from(self.hashes.len()).unwrap_or(i64::MAX).saturating_add(1);
        let mut b = Builder::new()
            .push_opcode(OP_DEPTH)
            .push_int(depth)
            .push_opcode(OP_EQUAL)
            .push_opcode(OP_IF);
        for h in self.hashes.iter().rev() {
            b = b
                .push_opcode(OP_RIPEMD160)
                .push_slice(h.0)
                .push_opcode(OP_EQUALVERIFY);
        }
        b.push_key(&self.fulfill_key)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ELSE)
            .push_int(i64::from(self.expiration))
            .push_opcode(OP_CLTV)
            .push_opcode(OP_DROP)
            .push_key(&self.redeem_key)
            .push_opcode(OP_CHECKSIG)
            .push_opcode(OP_ENDIF)
            .into_script()
    }

    /// Recover parameters from an offer redeem script.
    ///
    /// # Errors
    /// Returns `TumblerError::InvalidScript` unless `script` is exactly an
    /// offer script as produced by [`Self::to_script`].
    pub fn from_script(script: &Script) -> Result<Self> {
        let t = tokens(script)?;
        // 4 header + 3 per hash + 2 fulfill + 7 else-branch
        if t.len() < 13 || (t.len() - 13) % 3 != 0 {
            return Err(TumblerError::InvalidScript("offer script has wrong shape"));
        }
        let n = (t.len() - 13) / 3;
        expect_op(t.first(), OP_DEPTH)?;
        let depth = read_int(&t[1]).ok_or(TumblerError::InvalidScript("bad depth"))?;
        if usize::try_from(depth).ok() != Some(n + 1) {
            return Err(TumblerError::InvalidScript("depth does not match hash count"));
        }
        let mut hashes = Vec::with_capacity(n);
        for i in 0..n {
            match &t[4 + 3 * i + 1] {
                Token::Push(bytes) => hashes.push(KeyHash::try_from(*bytes)?),
                Token::Op(_) => return Err(TumblerError::InvalidScript("expected key hash")),
            }
        }
        hashes.reverse();
        let at = 4 + 3 * n;
        let fulfill_key = read_key(&t[at]).ok_or(TumblerError::InvalidScript("bad fulfill key"))?;
        let expiration = read_lock_time(&t[at + 3]).ok_or(TumblerError::InvalidScript("bad expiration"))?;
        let redeem_key = read_key(&t[at + 6]).ok_or(TumblerError::InvalidScript("bad redeem key"))?;
        let params = Self { hashes, fulfill_key, redeem_key, expiration };
        if params.to_script().as_script() != script {
            return Err(TumblerError::InvalidScript("offer script is not canonical"));
        }
        Ok(params)
    }

    #[must_use]
    pub fn script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::new_p2wsh(&self.to_script().wscript_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::public_key;

    fn escrow() -> EscrowScriptParams {
        EscrowScriptParams { initiator: public_key(1), receiver: public_key(2), lock_time: 840_000 }
    }

    #[test]
    fn escrow_script_parses_back() {
        let p = escrow();
        let script = p.to_script();
        assert_eq!(EscrowScriptParams::from_script(&script).unwrap(), p);
        assert!(p.script_pubkey().is_p2wsh());
    }

    #[test]
    fn swapped_roles_change_the_script() {
        let p = escrow();
        let swapped = EscrowScriptParams { initiator: p.receiver, receiver: p.initiator, lock_time: p.lock_time };
        let parsed = EscrowScriptParams::from_script(&swapped.to_script()).unwrap();
        assert_eq!(parsed.receiver, p.initiator);
        assert_ne!(swapped.to_script(), p.to_script());
    }

    #[test]
    fn non_escrow_scripts_are_rejected() {
        let p2pk = Builder::new().push_key(&public_key(1)).push_opcode(OP_CHECKSIG).into_script();
        assert!(EscrowScriptParams::from_script(&p2pk).is_err());
        let offer = OfferScriptParams {
            hashes: vec![KeyHash([1; 20])],
            fulfill_key: public_key(3),
            redeem_key: public_key(1),
            expiration: 100,
        };
        assert!(EscrowScriptParams::from_script(&offer.to_script()).is_err());
    }

    #[test]
    fn offer_script_checks_hashes_last_first() {
        let hashes: Vec<KeyHash> = (0u8..20).map(|i| KeyHash([i; 20])).collect();
        let p = OfferScriptParams {
            hashes,
            fulfill_key: public_key(3),
            redeem_key: public_key(1),
            expiration: 840_100,
        };
        let script = p.to_script();
        let t = tokens(&script).unwrap();
        assert_eq!(t[5], Token::Push(&[19u8; 20]));
        assert_eq!(read_int(&t[1]), Some(21));
        assert_eq!(OfferScriptParams::from_script(&script).unwrap(), p);
    }

    #[test]
    fn script_numbers_decode() {
        assert_eq!(decode_script_num(&[]), Some(0));
        assert_eq!(decode_script_num(&[0x81]), Some(-1));
        assert_eq!(decode_script_num(&[0x40, 0xd1, 0x0c]), Some(840_000));
        assert_eq!(decode_script_num(&[0xff, 0x00]), Some(255));
        assert_eq!(decode_script_num(&[0; 6]), None);
    }
}
