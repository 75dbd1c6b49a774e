//! Content checksums used as the OCR cache key.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 over the full content.
pub fn content_checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            content_checksum(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn content_changes_digest() {
        assert_ne!(content_checksum(b"page one"), content_checksum(b"page two"));
    }
}
