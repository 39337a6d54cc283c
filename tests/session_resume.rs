//! Both protocols driven to completion with every session saved and rebuilt
//! from its stored state after each phase.

use std::sync::{Arc, LazyLock};

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::{ecdsa, Amount, FeeRate, OutPoint, ScriptBuf, Txid};
use rand_core::OsRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tumblebit_core::transaction::{public_key_of, verify_input_signature};
use tumblebit_core::*;

static KEY: LazyLock<Arc<RsaKey>> =
    LazyLock::new(|| Arc::new(RsaKey::generate(&mut OsRng, 1024).expect("rsa key")));

const CLIENT: u8 = 41;
const SERVER: u8 = 42;
const BOB: u8 = 43;

fn secret(n: u8) -> SecretKey {
    SecretKey::from_slice(&[n; 32]).unwrap()
}

fn cashout(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&public_key_of(&secret(n)).pubkey_hash())
}

fn rate() -> FeeRate {
    FeeRate::from_sat_per_vb_unchecked(4)
}

fn escrow(initiator: u8, receiver: u8) -> EscrowCoin {
    let params = EscrowScriptParams {
        initiator: public_key_of(&secret(initiator)),
        receiver: public_key_of(&secret(receiver)),
        lock_time: 820_000,
    };
    EscrowCoin::new(OutPoint::new(Txid::from_byte_array([initiator; 32]), 0), Amount::from_sat(1_500_000), &params)
}

fn solver_parameters() -> SolverParameters {
    let mut p = SolverParameters::new(KEY.public().clone());
    p.fake_puzzle_count = 3;
    p.real_puzzle_count = 2;
    p
}

fn promise_parameters() -> PromiseParameters {
    let mut p = PromiseParameters::new(KEY.public().clone());
    p.fake_transaction_count = 2;
    p.real_transaction_count = 3;
    p
}

fn through_json<T: Serialize + DeserializeOwned>(state: &T) -> T {
    serde_json::from_str(&serde_json::to_string(state).unwrap()).unwrap()
}

struct Solver {
    registry: SessionRegistry<MemoryStore>,
    id: SessionId,
    client: SolverClientSession,
    server: SolverServerSession,
}

impl Solver {
    /// Store both sessions, rebuild them from the registry and check the
    /// phases they come back in.
    fn resume(&mut self, client: &str, server: &str) {
        self.registry.save(SessionRole::SolverClient, &self.id, self.client.state()).unwrap();
        self.registry.save(SessionRole::SolverServer, &self.id, self.server.state()).unwrap();
        let state: SolverClientState = self.registry.load(SessionRole::SolverClient, &self.id).unwrap().unwrap();
        self.client = SolverClientSession::from_state(solver_parameters(), state).unwrap();
        let state: SolverServerState = self.registry.load(SessionRole::SolverServer, &self.id).unwrap().unwrap();
        self.server = SolverServerSession::from_state(solver_parameters(), KEY.clone(), state).unwrap();
        assert_eq!(self.client.phase(), client);
        assert_eq!(self.server.phase(), server);
    }
}

#[test]
fn solver_survives_a_restart_at_every_phase() {
    let pk = KEY.public();
    let secret_value = PuzzleSolution::random(pk, &mut OsRng);
    let coin = escrow(CLIENT, SERVER);
    let mut s = Solver {
        registry: SessionRegistry::new(MemoryStore::new()),
        id: SessionId { cycle: 3, escrow: coin.outpoint },
        client: SolverClientSession::new(solver_parameters(), secret_value.to_puzzle(pk).unwrap()).unwrap(),
        server: SolverServerSession::new(solver_parameters(), KEY.clone()).unwrap(),
    };
    s.resume("waiting_escrow", "waiting_escrow");

    s.client.configure_escrow(coin.clone(), secret(CLIENT)).unwrap();
    s.server.configure_escrow(coin.clone(), secret(SERVER)).unwrap();
    s.resume("waiting_generate_puzzles", "waiting_puzzles");

    let puzzles = s.client.generate_puzzles(&mut OsRng).unwrap();
    s.resume("waiting_commitments", "waiting_puzzles");
    let commitments = s.server.solve_puzzles(&puzzles, &mut OsRng).unwrap();
    s.resume("waiting_commitments", "waiting_revelation");

    let revelation = s.client.reveal(&commitments).unwrap();
    s.resume("waiting_fake_solution_keys", "waiting_revelation");
    let fake_keys = s.server.check_revelation(&revelation).unwrap();
    s.resume("waiting_fake_solution_keys", "waiting_blind_factor");
    s.client.check_fake_solution_keys(&fake_keys).unwrap();
    s.resume("waiting_blind_factor_request", "waiting_blind_factor");

    let factors = s.client.get_blind_factors().unwrap();
    s.resume("waiting_offer", "waiting_blind_factor");
    let offer = s.server.check_blind_factors(&factors, rate(), &mut OsRng).unwrap();
    s.resume("waiting_offer", "waiting_fulfillment");
    let signature = s.client.create_offer_signature(&offer, rate()).unwrap();
    s.resume("waiting_puzzle_solutions", "waiting_fulfillment");

    let fulfillment = s.server.fulfill_offer(&signature, &cashout(SERVER), rate()).unwrap();
    s.resume("waiting_puzzle_solutions", "waiting_escape");
    let keys = s.server.reveal_solution_keys().unwrap();
    assert_eq!(keys.len(), 2);

    let recovered = s.client.check_fulfillment_transaction(&fulfillment.fulfill_transaction).unwrap();
    assert_eq!(recovered, secret_value);
    s.resume("completed", "waiting_escape");
    assert_eq!(s.client.solution(), Some(&secret_value));

    let escape = s.client.create_escape_signature().unwrap();
    assert_eq!(escape.sighash_type, EcdsaSighashType::NonePlusAnyoneCanPay);
    let tx = s.server.get_signed_escape_transaction(&escape, rate(), &cashout(SERVER)).unwrap();
    assert_eq!(tx.input[0].previous_output, coin.outpoint);
    s.resume("completed", "completed");

    assert_eq!(s.server.reveal_solution_keys().unwrap(), keys);
    assert!(s.client.create_escape_signature().is_ok());
    assert_eq!(s.registry.ids(SessionRole::SolverServer).unwrap(), vec![s.id]);
}

#[test]
fn promise_survives_a_restart_at_every_phase() {
    let params = promise_parameters();
    let coin = escrow(SERVER, BOB);
    let mut bob = PromiseClientSession::new(params.clone()).unwrap();
    let mut tumbler = PromiseServerSession::new(params.clone(), KEY.clone()).unwrap();
    let resume = |bob: &PromiseClientSession, tumbler: &PromiseServerSession| {
        let client = PromiseClientSession::from_state(params.clone(), through_json(bob.state())).unwrap();
        let server = PromiseServerSession::from_state(params.clone(), KEY.clone(), through_json(tumbler.state())).unwrap();
        assert_eq!(client.phase(), bob.phase());
        assert_eq!(server.phase(), tumbler.phase());
        (client, server)
    };
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(bob.phase(), "waiting_escrow");

    bob.configure_escrow(coin.clone(), secret(BOB)).unwrap();
    tumbler.configure_escrow(coin.clone(), secret(SERVER)).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(bob.phase(), "waiting_signature_request");
    assert_eq!(tumbler.phase(), "waiting_hashes");

    let hashes = bob.create_signature_request(&cashout(BOB), rate(), &mut OsRng).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(bob.phase(), "waiting_commitments");
    let commitments = tumbler.sign_hashes(&hashes, &mut OsRng).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(tumbler.phase(), "waiting_revelation");

    let revelation = bob.check_commitments(&commitments).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(bob.phase(), "waiting_fake_proof");
    let proof = tumbler.check_revelation(&revelation).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(tumbler.phase(), "completed");
    assert!(tumbler.check_revelation(&revelation).is_err());

    let puzzle = bob.check_fake_proof(&proof).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(bob.phase(), "waiting_puzzle_solution");

    let key: &RsaKey = &KEY;
    let solution = puzzle.solve(key).unwrap();
    let tx = bob.get_signed_transaction(&solution).unwrap();
    (bob, tumbler) = resume(&bob, &tumbler);
    assert_eq!(bob.phase(), "completed");
    assert_eq!(tumbler.phase(), "completed");
    let PromiseClientState::Completed { transaction, .. } = bob.state() else {
        panic!("unexpected phase {}", bob.phase());
    };
    assert_eq!(transaction, &tx);

    let witness: Vec<&[u8]> = tx.input[0].witness.iter().collect();
    let tumbler_signature = ecdsa::Signature::from_slice(witness[1]).unwrap();
    let bob_signature = ecdsa::Signature::from_slice(witness[2]).unwrap();
    let script = coin.params().unwrap();
    assert!(verify_input_signature(&tx, 0, (&coin).into(), &script.initiator, &tumbler_signature).unwrap());
    assert!(verify_input_signature(&tx, 0, (&coin).into(), &script.receiver, &bob_signature).unwrap());
    assert_eq!(tx.output[0].script_pubkey, cashout(BOB));
}
