#![no_main]

use bitcoin::Script;
use libfuzzer_sys::fuzz_target;
use tumblebit_core::{EscrowScriptParams, OfferScriptParams};

fuzz_target!(|data: &[u8]| {
    let script = Script::from_bytes(data);
    if let Ok(params) = EscrowScriptParams::from_script(script) {
        assert_eq!(params.to_script().as_bytes(), data);
    }
    if let Ok(params) = OfferScriptParams::from_script(script) {
        assert_eq!(params.to_script().as_bytes(), data);
    }
});
