use sha2::{Digest, Sha256};

/// Hash algorithm name advertised in `a=fingerprint` lines.
pub const FINGERPRINT_ALGORITHM: &str = "sha-256";

/// Computes the SHA-256 fingerprint of a DER certificate body in the
/// colon-separated uppercase form used for certificate pinning in SDP,
/// e.g. `AB:CD:…`. Peers compare fingerprints by string equality, so both
/// sides must apply this exact formatting.
pub fn fingerprint(der: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(der);
    let hashed = h.finalize();
    let values: Vec<String> = hashed.iter().map(|x| format!("{x:02X}")).collect();
    values.join(":")
}
