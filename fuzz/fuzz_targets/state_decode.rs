#![no_main]

use libfuzzer_sys::fuzz_target;
use tumblebit_core::{PromiseClientState, PromiseServerState, SolverClientState, SolverServerState};

fuzz_target!(|data: &[u8]| {
    // Persisted session states come back from untrusted storage
    let _ = serde_json::from_slice::<SolverServerState>(data);
    let _ = serde_json::from_slice::<SolverClientState>(data);
    let _ = serde_json::from_slice::<PromiseServerState>(data);
    let _ = serde_json::from_slice::<PromiseClientState>(data);
});
