use base64::Engine;
use rand::RngCore;

/// Random URL-safe identifier made from `bytes` random bytes
pub(crate) fn random_token(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

/// True if every character is visible ASCII, which is all session IDs and protocol versions may
/// contain.
pub(crate) fn is_visible_ascii(value: &str) -> bool {
    value.bytes().all(|b| (0x21..=0x7e).contains(&b))
}
