#![no_main]

use hayro_raw::{Camera, DecodeSettings, decode};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let cameras: Vec<Camera> = Vec::new();
    // Keep allocations small so we don't time out.
    let settings = DecodeSettings {
        threads: 1,
        max_dimension: 4096,
        ..DecodeSettings::default()
    };

    let _ = decode(data, &cameras, &settings);
});
