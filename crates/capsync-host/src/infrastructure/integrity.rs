//! SHA-256 file-integrity check for reassembled transfers.

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::application::orchestrate_session::FileVerifier;

/// Lowercase hex SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Compares a file's SHA-256 digest with the hash the device declared.
///
/// The declared hash may carry a `sha256:` prefix and may use either case.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Verifier;

impl FileVerifier for Sha256Verifier {
    fn verify(&self, data: &[u8], declared_hash: &str) -> bool {
        let declared = declared_hash.trim();
        let declared = declared.strip_prefix("sha256:").unwrap_or(declared);
        let actual = sha256_hex(data);
        let ok = actual.eq_ignore_ascii_case(declared);
        if !ok {
            debug!("sha256 mismatch: declared {declared}, computed {actual}");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

    #[test]
    fn test_sha256_hex_of_known_input() {
        assert_eq!(sha256_hex(b"abc"), ABC);
    }

    #[test]
    fn test_verify_accepts_prefix_and_uppercase() {
        let v = Sha256Verifier;
        assert!(v.verify(b"abc", ABC));
        assert!(v.verify(b"abc", &format!("sha256:{}", ABC.to_uppercase())));
    }

    #[test]
    fn test_verify_rejects_wrong_digest() {
        assert!(!Sha256Verifier.verify(b"abd", ABC));
        assert!(!Sha256Verifier.verify(b"abc", ""));
    }
}
