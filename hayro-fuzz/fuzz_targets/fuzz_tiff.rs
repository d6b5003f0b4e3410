#![no_main]

use hayro_raw::Buffer;
use hayro_raw::tiff::TiffTree;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(buffer) = Buffer::new(data) else {
        return;
    };

    if let Ok(tree) = TiffTree::parse(buffer) {
        let _ = tree.get_id();
    }
});
