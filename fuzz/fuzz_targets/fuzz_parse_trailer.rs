//! Fuzz target: response trailer parser.
//!
//! Any line either parses into spillover plus a non-negative status or is
//! rejected. A parsed trailer always came from a line containing the marker.
#![no_main]

use libfuzzer_sys::fuzz_target;
use vmtest_core::{parse_trailer, strip_line_terminator, TRAILER_MARKER};

fuzz_target!(|data: &[u8]| {
    let line = String::from_utf8_lossy(data);
    let line = strip_line_terminator(&line);
    if let Some(trailer) = parse_trailer(line) {
        assert!(line.contains(TRAILER_MARKER));
        assert!(trailer.status >= 0);
        assert!(line.starts_with(trailer.spillover));
    }
});
