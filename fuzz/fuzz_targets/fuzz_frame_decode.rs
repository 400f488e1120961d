//! Fuzz target for the frame codec.
//!
//! This tests that `Frame::decode` never panics on arbitrary input, and
//! that anything it does decode re-encodes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mirror_engine::frame::Frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        // Whatever decodes must encode again.
        let _ = frame.encode();
    }
});
