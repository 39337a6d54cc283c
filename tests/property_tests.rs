//! Property-based tests for the RSA, commitment and script layers

use std::sync::LazyLock;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{Amount, FeeRate, OutPoint, Txid};
use proptest::prelude::*;
use rand_core::OsRng;
use rsa::BigUint;
use tumblebit_core::transaction::public_key_of;
use tumblebit_core::*;

static KEY: LazyLock<RsaKey> = LazyLock::new(|| RsaKey::generate(&mut OsRng, 1024).expect("rsa key"));

fn element(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes) % KEY.public().modulus()
}

fn secret(bytes: [u8; 32]) -> Option<SecretKey> {
    SecretKey::from_slice(&bytes).ok()
}

// Property test: the private permutation inverts the public one
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn solve_inverts_encrypt(bytes in prop::collection::vec(any::<u8>(), 128)) {
        let m = PuzzleSolution::new(element(&bytes));
        let puzzle = m.to_puzzle(KEY.public()).unwrap();
        prop_assert_eq!(puzzle.solve(&KEY).unwrap(), m);
    }
}

// Property test: blinding is undone by the same factor
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn unblind_reverts_blind(
        x in prop::collection::vec(any::<u8>(), 128),
        r in prop::collection::vec(any::<u8>(), 128)
    ) {
        let pk = KEY.public();
        let r = element(&r);
        prop_assume!(pk.inverse(&r).is_ok());
        let factor = BlindFactor::new(r);
        let x = PuzzleValue::new(element(&x));
        let blinded = x.blind(pk, &factor).unwrap();
        prop_assert_eq!(blinded.unblind(pk, &factor).unwrap(), x.clone());

        // Solving the blinded puzzle and removing the factor gives the plain solution.
        let solution = blinded.solve(&KEY).unwrap().unblind(pk, &factor).unwrap();
        prop_assert_eq!(solution, x.solve(&KEY).unwrap());
    }
}

// Property test: a commitment opens under its own key only
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn commitment_binds_its_key(
        s in prop::collection::vec(any::<u8>(), 128),
        key in prop::array::uniform16(any::<u8>()),
        other in prop::array::uniform16(any::<u8>())
    ) {
        let pk = KEY.public();
        let solution = PuzzleSolution::new(element(&s));
        let key = SolutionKey(key);
        let commitment = ServerCommitment::new(pk, &key, &solution).unwrap();
        prop_assert_eq!(commitment.open(pk, &key, 0).unwrap(), solution);
        prop_assume!(other != key.0);
        prop_assert!(commitment.open(pk, &SolutionKey(other), 0).unwrap_err().is_cheat());
    }
}

// Property test: escrow scripts parse back to their parameters
proptest! {
    #[test]
    fn escrow_script_roundtrip(
        a in prop::array::uniform32(any::<u8>()),
        b in prop::array::uniform32(any::<u8>()),
        lock_time in 0u32..500_000_000
    ) {
        let (Some(a), Some(b)) = (secret(a), secret(b)) else { return Ok(()); };
        let params = EscrowScriptParams {
            initiator: public_key_of(&a),
            receiver: public_key_of(&b),
            lock_time,
        };
        prop_assert_eq!(EscrowScriptParams::from_script(&params.to_script()).unwrap(), params);
    }
}

// Property test: offer scripts keep hash order
proptest! {
    #[test]
    fn offer_script_roundtrip(
        hashes in prop::collection::vec(prop::array::uniform20(any::<u8>()), 1..20),
        expiration in 0u32..500_000_000
    ) {
        let params = OfferScriptParams {
            hashes: hashes.into_iter().map(KeyHash).collect(),
            fulfill_key: public_key_of(&SecretKey::from_slice(&[3; 32]).unwrap()),
            redeem_key: public_key_of(&SecretKey::from_slice(&[4; 32]).unwrap()),
            expiration,
        };
        prop_assert_eq!(OfferScriptParams::from_script(&params.to_script()).unwrap(), params);
    }
}

// Property test: the offer output plus its fee is the escrow amount
proptest! {
    #[test]
    fn offer_conserves_value(amount in 10_000u64..21_000_000_000_000, sat_vb in 1u64..200) {
        let params = EscrowScriptParams {
            initiator: public_key_of(&SecretKey::from_slice(&[1; 32]).unwrap()),
            receiver: public_key_of(&SecretKey::from_slice(&[2; 32]).unwrap()),
            lock_time: 1_000,
        };
        let coin = EscrowCoin::new(OutPoint::new(Txid::from_byte_array([1; 32]), 0), Amount::from_sat(amount), &params);
        let offer_params = OfferScriptParams {
            hashes: vec![KeyHash([9; 20]); 3],
            fulfill_key: params.receiver,
            redeem_key: params.initiator,
            expiration: params.lock_time,
        };
        match build_offer(&coin, &offer_params, FeeRate::from_sat_per_vb_unchecked(sat_vb)) {
            Ok(offer) => prop_assert_eq!(offer.transaction.output[0].value + offer.fee, coin.amount),
            Err(e) => prop_assert!(matches!(e, TumblerError::InsufficientFunds { .. }), "expected InsufficientFunds error"),
        }
    }
}
