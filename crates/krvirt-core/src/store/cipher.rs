//! Lightweight value obfuscation.
//!
//! XOR against a repeating key, then base64. This keeps stored values from
//! being readable at a glance in a cookie jar or a session file. It is not
//! encryption; use the encrypted file backend when confidentiality matters.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

fn xor_with_key(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, k)| byte ^ k)
        .collect()
}

/// Obfuscate `text` with `key`. The result is plain base64.
pub fn obfuscate(text: &str, key: &str) -> String {
    STANDARD.encode(xor_with_key(text.as_bytes(), key.as_bytes()))
}

/// Reverse [`obfuscate`]. Returns `None` for input that is not valid base64
/// or does not decode to UTF-8 under this key.
pub fn deobfuscate(encoded: &str, key: &str) -> Option<String> {
    let bytes = STANDARD.decode(encoded).ok()?;
    String::from_utf8(xor_with_key(&bytes, key.as_bytes())).ok()
}
