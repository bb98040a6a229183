#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;
use votifier_protocol::protocol::v2;
use votifier_protocol::utils::keys::KeyMaterial;

fn keys() -> &'static KeyMaterial {
    static KEYS: OnceLock<KeyMaterial> = OnceLock::new();
    KEYS.get_or_init(|| {
        KeyMaterial::new()
            .with_token("default", "fuzz-secret")
            .with_token("ExampleList", "list-secret")
    })
}

fuzz_target!(|data: &[u8]| {
    // Arbitrary envelope bytes must be rejected, never panic
    let _ = v2::decode(data, keys(), Some("00112233445566778899aabbccddeeff"));
    let _ = v2::decode(data, keys(), None);
});
