#![no_main]

use libfuzzer_sys::fuzz_target;
use marten_proxy::ProxyAddr;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(addr) = ProxyAddr::decode(text) {
            let reencoded = ProxyAddr::decode(&addr.encode()).expect("re-encoded tag must decode");
            assert_eq!(reencoded, addr);
        }
    }
});
