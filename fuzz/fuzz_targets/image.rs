#![no_main]

use libfuzzer_sys::fuzz_target;
use droidstrap::Image;

fuzz_target!(|data: &[u8]| {
    if let Ok(image) = Image::from_mem(data.to_vec()) {
        let _ = image.load_span();
        for symbol in image.symbols().iter().take(64) {
            let _ = image.symbol(&symbol.name);
        }
    }
});
