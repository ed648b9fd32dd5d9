use rand::{rng, Rng};

#[cfg(test)]
mod rand_test;

/// <https://tools.ietf.org/html/rfc5245#section-15.4>
/// ice-char = ALPHA / DIGIT / "+" / "/"
const RUNES_ICE_CHAR: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const LEN_UFRAG: usize = 4;
const LEN_PWD: usize = 22;

fn generate_crypto_random_string(n: usize, runes: &[u8]) -> String {
    let mut rng = rng();

    let rand_string: String = (0..n)
        .map(|_| {
            let idx = rng.random_range(0..runes.len());
            runes[idx] as char
        })
        .collect();

    rand_string
}

/// Generates an ICE user fragment. Four ice-chars give 2^24 combinations,
/// enough for server-local session disambiguation.
pub fn generate_ufrag() -> String {
    generate_crypto_random_string(LEN_UFRAG, RUNES_ICE_CHAR)
}

/// Generates an ICE password of the RFC minimum length.
pub fn generate_pwd() -> String {
    generate_crypto_random_string(LEN_PWD, RUNES_ICE_CHAR)
}
