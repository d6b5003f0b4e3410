#![no_main]

use hayro_raw::Buffer;
use hayro_raw::bmff::IsoMFile;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(buffer) = Buffer::new(data) else {
        return;
    };

    let _ = IsoMFile::parse(buffer);
});
