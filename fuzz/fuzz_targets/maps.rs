#![no_main]

use libfuzzer_sys::fuzz_target;
use droidstrap::resolver::MemoryMap;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(map) = MemoryMap::parse(text) {
            for entry in map.entries() {
                if let Some(path) = &entry.path {
                    let _ = map.module_extent(path);
                }
            }
        }
    }
});
