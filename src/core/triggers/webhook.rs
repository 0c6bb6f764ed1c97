use sha2::{Digest, Sha256};

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Compares digests of both tokens so neither the content nor the length of
/// the configured token leaks through timing. An empty configured token
/// never matches.
pub fn verify_webhook_token(expected: &str, provided: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let expected = Sha256::digest(expected.as_bytes());
    let provided = Sha256::digest(provided.as_bytes());
    constant_time_eq(expected.as_slice(), provided.as_slice())
}
