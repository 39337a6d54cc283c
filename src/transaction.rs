//! Transaction builder for the escrow → offer → fulfillment chain.
//!
//! Every builder is a pure function of its inputs. Fees are the fee rate
//! times the virtual size of the transaction completed with placeholder
//! witness items of maximal size, so fee computation needs no signatures.

use std::sync::LazyLock as Lazy;

use bitcoin::absolute::LockTime;
use bitcoin::ecdsa::Signature;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{self, All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, FeeRate, OutPoint, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use serde::{Deserialize, Serialize};

use crate::commitment::SolutionKey;
use crate::errors::{Result, TumblerError};
use crate::escrow::EscrowCoin;
use crate::script::OfferScriptParams;
use crate::types::SOLUTION_KEY_LEN;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// DER signature (at most 72 bytes) plus the sighash byte.
const PLACEHOLDER_SIGNATURE_LEN: usize = 73;

#[must_use]
pub fn public_key_of(key: &SecretKey) -> PublicKey {
    PublicKey::new(key.public_key(&SECP))
}

/// A P2WSH output and the script that spends it.
#[derive(Clone, Copy, Debug)]
pub struct ScriptCoin<'a> {
    pub outpoint: OutPoint,
    pub amount: Amount,
    pub script: &'a Script,
}

impl<'a> From<&'a EscrowCoin> for ScriptCoin<'a> {
    fn from(coin: &'a EscrowCoin) -> Self {
        Self { outpoint: coin.outpoint, amount: coin.amount, script: &coin.redeem_script }
    }
}

/// The offer transaction before either escrow party has signed it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedOffer {
    pub transaction: Transaction,
    pub script: ScriptBuf,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub fee: Amount,
}

impl UnsignedOffer {
    /// Check a stored offer spends one input into one output paying its script.
    ///
    /// # Errors
    /// Returns `InvalidLength` for the wrong input or output count and
    /// `InvalidScript` if the output does not pay `script`.
    pub fn check_shape(&self) -> Result<()> {
        crate::params::check_len(1, self.transaction.input.len())?;
        crate::params::check_len(1, self.transaction.output.len())?;
        if self.transaction.output[0].script_pubkey != ScriptBuf::new_p2wsh(&self.script.wscript_hash()) {
            return Err(TumblerError::InvalidScript("offer output does not pay the offer script"));
        }
        Ok(())
    }

    /// The offer output, spent by fulfillment or by the timelocked redeem.
    #[must_use]
    pub fn coin(&self) -> ScriptCoin<'_> {
        ScriptCoin {
            outpoint: OutPoint::new(self.transaction.compute_txid(), 0),
            amount: self.transaction.output[0].value,
            script: &self.script,
        }
    }
}

fn spend(previous_output: OutPoint, sequence: Sequence, lock_time: LockTime, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time,
        input: vec![TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

fn fee_with_witness(tx: &Transaction, placeholder: Witness, fee_rate: FeeRate) -> Result<Amount> {
    let mut sized = tx.clone();
    sized.input[0].witness = placeholder;
    let vsize = u64::try_from(sized.vsize()).map_err(|_| TumblerError::FeeOverflow)?;
    fee_rate.fee_vb(vsize).ok_or(TumblerError::FeeOverflow)
}

fn pay_out(amount: Amount, fee: Amount) -> Result<Amount> {
    amount
        .checked_sub(fee)
        .filter(|v| *v > Amount::ZERO)
        .ok_or(TumblerError::InsufficientFunds { amount, fee })
}

fn placeholder_cooperative(script: &Script) -> Witness {
    let sig = [0u8; PLACEHOLDER_SIGNATURE_LEN];
    let mut w = Witness::new();
    w.push([0u8; 0]);
    w.push(sig);
    w.push(sig);
    w.push(script.as_bytes());
    w
}

fn placeholder_single(script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push([0u8; PLACEHOLDER_SIGNATURE_LEN]);
    w.push(script.as_bytes());
    w
}

fn placeholder_fulfill(script: &Script, key_count: usize) -> Witness {
    let mut w = Witness::new();
    w.push([0u8; PLACEHOLDER_SIGNATURE_LEN]);
    for _ in 0..key_count {
        w.push([0u8; SOLUTION_KEY_LEN]);
    }
    w.push(script.as_bytes());
    w
}

/// Offer transaction paying the escrow into the offer output, with the fee
/// derived from `fee_rate`.
///
/// # Errors
/// Returns `InsufficientFunds` if the escrow cannot cover the fee.
pub fn build_offer(escrow: &EscrowCoin, params: &OfferScriptParams, fee_rate: FeeRate) -> Result<UnsignedOffer> {
    let draft = spend(
        escrow.outpoint,
        Sequence::MAX,
        LockTime::ZERO,
        vec![TxOut { value: escrow.amount, script_pubkey: params.script_pubkey() }],
    );
    let fee = fee_with_witness(&draft, placeholder_cooperative(&escrow.redeem_script), fee_rate)?;
    build_offer_with_fee(escrow, params, fee)
}

/// Offer transaction with an agreed absolute fee.
///
/// # Errors
/// Returns `InsufficientFunds` if the escrow cannot cover the fee.
pub fn build_offer_with_fee(escrow: &EscrowCoin, params: &OfferScriptParams, fee: Amount) -> Result<UnsignedOffer> {
    let value = pay_out(escrow.amount, fee)?;
    let script = params.to_script();
    let transaction = spend(
        escrow.outpoint,
        Sequence::MAX,
        LockTime::ZERO,
        vec![TxOut { value, script_pubkey: ScriptBuf::new_p2wsh(&script.wscript_hash()) }],
    );
    Ok(UnsignedOffer { transaction, script, fee })
}

/// Fulfillment transaction spending the offer output to `cashout`.
///
/// # Errors
/// Returns `InsufficientFunds` if the offer cannot cover the fee.
pub fn build_fulfill(offer: ScriptCoin<'_>, key_count: usize, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
    let mut tx = spend(
        offer.outpoint,
        Sequence::MAX,
        LockTime::ZERO,
        vec![TxOut { value: offer.amount, script_pubkey: cashout.to_owned() }],
    );
    let fee = fee_with_witness(&tx, placeholder_fulfill(offer.script, key_count), fee_rate)?;
    tx.output[0].value = pay_out(offer.amount, fee)?;
    Ok(tx)
}

/// Template the client signs with `SIGHASH_NONE|ANYONECANPAY` to let the
/// server take the escrow directly. Outputs are not committed to.
#[must_use]
pub fn escape_template(escrow: &EscrowCoin) -> Transaction {
    spend(escrow.outpoint, Sequence::MAX, LockTime::ZERO, Vec::new())
}

/// Cooperative spend of the escrow straight to `cashout`.
///
/// # Errors
/// Returns `InsufficientFunds` if the escrow cannot cover the fee.
pub fn build_escape(escrow: &EscrowCoin, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
    let mut tx = escape_template(escrow);
    tx.output.push(TxOut { value: escrow.amount, script_pubkey: cashout.to_owned() });
    let fee = fee_with_witness(&tx, placeholder_cooperative(&escrow.redeem_script), fee_rate)?;
    tx.output[0].value = pay_out(escrow.amount, fee)?;
    Ok(tx)
}

/// Fee of a cooperative escrow spend to `cashout`.
///
/// # Errors
/// Returns `FeeOverflow` if the fee does not fit an amount.
pub fn cashout_fee(escrow: &EscrowCoin, cashout: &Script, fee_rate: FeeRate) -> Result<Amount> {
    let draft = spend(
        escrow.outpoint,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
        LockTime::ZERO,
        vec![TxOut { value: escrow.amount, script_pubkey: cashout.to_owned() }],
    );
    fee_with_witness(&draft, placeholder_cooperative(&escrow.redeem_script), fee_rate)
}

/// Cooperative escrow spend to `cashout` with an explicit `nLockTime`; the
/// promise protocol varies the lock time to obtain distinct sighashes.
///
/// # Errors
/// Returns `InsufficientFunds` if the escrow cannot cover the fee.
pub fn build_cashout(escrow: &EscrowCoin, cashout: &Script, fee: Amount, lock_time: u32) -> Result<Transaction> {
    let value = pay_out(escrow.amount, fee)?;
    Ok(spend(
        escrow.outpoint,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
        LockTime::from_consensus(lock_time),
        vec![TxOut { value, script_pubkey: cashout.to_owned() }],
    ))
}

/// Unilateral spend through the `OP_CLTV` branch of an escrow or offer script.
///
/// # Errors
/// Returns `InsufficientFunds` if the coin cannot cover the fee.
pub fn build_timelocked_refund(coin: ScriptCoin<'_>, lock_time: u32, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
    let mut tx = spend(
        coin.outpoint,
        Sequence::ENABLE_LOCKTIME_NO_RBF,
        LockTime::from_consensus(lock_time),
        vec![TxOut { value: coin.amount, script_pubkey: cashout.to_owned() }],
    );
    let fee = fee_with_witness(&tx, placeholder_single(coin.script), fee_rate)?;
    tx.output[0].value = pay_out(coin.amount, fee)?;
    Ok(tx)
}

/// Client refund of the escrow through its timelocked branch.
///
/// # Errors
/// Returns `InsufficientFunds` if the escrow cannot cover the fee.
pub fn build_escrow_redeem(escrow: &EscrowCoin, lock_time: u32, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
    build_timelocked_refund(escrow.into(), lock_time, cashout, fee_rate)
}

/// Client refund of an unfulfilled offer after its expiration.
///
/// # Errors
/// Returns `InsufficientFunds` if the offer cannot cover the fee.
pub fn build_offer_redeem(offer: &UnsignedOffer, expiration: u32, cashout: &Script, fee_rate: FeeRate) -> Result<Transaction> {
    build_timelocked_refund(offer.coin(), expiration, cashout, fee_rate)
}

/// BIP143 signature hash of input `input_index` spending `coin`.
///
/// # Errors
/// Returns `TumblerError::Sighash` if the input index is out of range.
pub fn signature_hash(tx: &Transaction, input_index: usize, coin: ScriptCoin<'_>, sighash_type: EcdsaSighashType) -> Result<[u8; 32]> {
    let mut cache = SighashCache::new(tx);
    let hash = cache
        .p2wsh_signature_hash(input_index, coin.script, coin.amount, sighash_type)
        .map_err(|e| TumblerError::Sighash(e.to_string()))?;
    Ok(hash.to_byte_array())
}

#[must_use]
pub fn sign_hash(hash: &[u8; 32], key: &SecretKey) -> secp256k1::ecdsa::Signature {
    SECP.sign_ecdsa(&Message::from_digest(*hash), key)
}

#[must_use]
pub fn verify_hash(hash: &[u8; 32], signature: &secp256k1::ecdsa::Signature, key: &PublicKey) -> bool {
    SECP.verify_ecdsa(&Message::from_digest(*hash), signature, &key.inner).is_ok()
}

/// Sign input `input_index` of `tx` spending `coin`.
///
/// # Errors
/// Returns `TumblerError::Sighash` if the input index is out of range.
pub fn sign_input(tx: &Transaction, input_index: usize, coin: ScriptCoin<'_>, key: &SecretKey, sighash_type: EcdsaSighashType) -> Result<Signature> {
    let hash = signature_hash(tx, input_index, coin, sighash_type)?;
    Ok(Signature { signature: sign_hash(&hash, key), sighash_type })
}

/// Verify `signature` on input `input_index` under its own sighash mode.
///
/// # Errors
/// Returns `TumblerError::Sighash` if the input index is out of range.
pub fn verify_input_signature(tx: &Transaction, input_index: usize, coin: ScriptCoin<'_>, key: &PublicKey, signature: &Signature) -> Result<bool> {
    let hash = signature_hash(tx, input_index, coin, signature.sighash_type)?;
    Ok(verify_hash(&hash, &signature.signature, key))
}

/// `[<empty>, sig_initiator, sig_receiver, script]` for the 2-of-2 branch.
#[must_use]
pub fn cooperative_witness(initiator: &Signature, receiver: &Signature, script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push([0u8; 0]);
    w.push(initiator.serialize());
    w.push(receiver.serialize());
    w.push(script.as_bytes());
    w
}

/// `[sig, script]` for a timelocked branch.
#[must_use]
pub fn refund_witness(signature: &Signature, script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push(signature.serialize());
    w.push(script.as_bytes());
    w
}

/// `[sig, key_0 .. key_{n-1}, script]`: every solution key in the clear.
#[must_use]
pub fn fulfill_witness(signature: &Signature, keys: &[SolutionKey], script: &Script) -> Witness {
    let mut w = Witness::new();
    w.push(signature.serialize());
    for k in keys {
        w.push(k.0);
    }
    w.push(script.as_bytes());
    w
}

/// Read the solution keys out of the input of `tx` spending `offer`.
///
/// # Errors
/// Returns a domain error if `tx` does not spend `offer` through the
/// fulfillment branch with `key_count` keys.
pub fn extract_solution_keys(tx: &Transaction, offer: OutPoint, key_count: usize) -> Result<Vec<SolutionKey>> {
    let input = tx
        .input
        .iter()
        .find(|i| i.previous_output == offer)
        .ok_or(TumblerError::DecodeError("transaction does not spend the offer"))?;
    let items: Vec<&[u8]> = input.witness.iter().collect();
    if items.len() != key_count + 2 {
        return Err(TumblerError::InvalidLength { expected: key_count + 2, got: items.len() });
    }
    items[1..=key_count]
        .iter()
        .map(|item| SolutionKey::try_from(*item))
        .collect()
}

/// Sign the offer transaction's escrow input.
///
/// # Errors
/// Returns `TumblerError::Sighash` if the offer has no input.
pub fn sign_offer(offer: &UnsignedOffer, escrow: &EscrowCoin, key: &SecretKey) -> Result<Signature> {
    sign_input(&offer.transaction, 0, escrow.into(), key, EcdsaSighashType::All)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::EscrowScriptParams;
    use crate::testing::{cashout_script, outpoint, public_key, secret_key};
    use crate::types::KeyHash;

    fn escrow() -> EscrowCoin {
        let params = EscrowScriptParams { initiator: public_key(1), receiver: public_key(2), lock_time: 1_000 };
        EscrowCoin::new(outpoint(1), Amount::from_sat(1_000_000), &params)
    }

    fn offer_params(n: u8) -> OfferScriptParams {
        OfferScriptParams {
            hashes: (0..n).map(|i| KeyHash([i; 20])).collect(),
            fulfill_key: public_key(3),
            redeem_key: public_key(1),
            expiration: 1_000,
        }
    }

    fn rate() -> FeeRate {
        FeeRate::from_sat_per_vb_unchecked(10)
    }

    #[test]
    fn offer_fee_tracks_virtual_size() {
        let escrow = escrow();
        let offer = build_offer(&escrow, &offer_params(3), rate()).unwrap();
        assert!(offer.fee > Amount::ZERO);
        assert_eq!(offer.transaction.output[0].value + offer.fee, escrow.amount);
        assert_eq!(offer.transaction.output[0].script_pubkey, offer_params(3).script_pubkey());
        let again = build_offer_with_fee(&escrow, &offer_params(3), offer.fee).unwrap();
        assert_eq!(again, offer);
    }

    #[test]
    fn malformed_stored_offer_is_rejected() {
        let offer = build_offer(&escrow(), &offer_params(2), rate()).unwrap();
        assert!(offer.check_shape().is_ok());
        let mut empty = offer.clone();
        empty.transaction.output.clear();
        assert!(matches!(empty.check_shape(), Err(TumblerError::InvalidLength { expected: 1, got: 0 })));
        let mut other = offer;
        other.script = offer_params(3).to_script();
        assert!(matches!(other.check_shape(), Err(TumblerError::InvalidScript(_))));
    }

    #[test]
    fn fee_larger_than_amount_is_rejected() {
        let escrow = escrow();
        let err = build_offer_with_fee(&escrow, &offer_params(1), Amount::from_sat(2_000_000)).unwrap_err();
        assert!(matches!(err, TumblerError::InsufficientFunds { .. }));
    }

    #[test]
    fn signatures_verify_for_the_signed_input_only() {
        let escrow = escrow();
        let offer = build_offer(&escrow, &offer_params(2), rate()).unwrap();
        let sig = sign_offer(&offer, &escrow, &secret_key(1)).unwrap();
        assert!(verify_input_signature(&offer.transaction, 0, (&escrow).into(), &public_key(1), &sig).unwrap());
        assert!(!verify_input_signature(&offer.transaction, 0, (&escrow).into(), &public_key(2), &sig).unwrap());
        assert!(verify_input_signature(&offer.transaction, 1, (&escrow).into(), &public_key(1), &sig).is_err());
    }

    #[test]
    fn fulfillment_witness_exposes_keys() {
        let escrow = escrow();
        let params = offer_params(2);
        let offer = build_offer(&escrow, &params, rate()).unwrap();
        let keys = [SolutionKey([7; 16]), SolutionKey([8; 16])];
        let mut tx = build_fulfill(offer.coin(), keys.len(), &cashout_script(5), rate()).unwrap();
        let sig = sign_input(&tx, 0, offer.coin(), &secret_key(3), EcdsaSighashType::All).unwrap();
        tx.input[0].witness = fulfill_witness(&sig, &keys, &offer.script);
        assert_eq!(extract_solution_keys(&tx, offer.coin().outpoint, 2).unwrap(), keys.to_vec());
        assert!(extract_solution_keys(&tx, offer.coin().outpoint, 3).is_err());
        assert!(extract_solution_keys(&tx, outpoint(42), 2).is_err());
    }

    #[test]
    fn timelocked_refund_sets_lock_time() {
        let escrow = escrow();
        let tx = build_escrow_redeem(&escrow, 1_000, &ScriptBuf::new(), rate()).unwrap();
        assert_eq!(tx.lock_time, LockTime::from_consensus(1_000));
        assert_eq!(tx.input[0].sequence, Sequence::ENABLE_LOCKTIME_NO_RBF);
        assert!(tx.output[0].value < escrow.amount);
    }
}
