//! Fuzz target: JSON test plan parser.
//!
//! Arbitrary input must be rejected with an error, never a panic, and any
//! plan that parses must survive a serialize/parse cycle unchanged.
#![no_main]

use libfuzzer_sys::fuzz_target;
use vmtest_runner::TestPlan;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(plan) = TestPlan::from_json(text) {
        let json = serde_json::to_string(&plan).expect("plan serializes");
        assert_eq!(TestPlan::from_json(&json).expect("reparse"), plan);
    }
});
