//! Chunk identity: SHA-256 digest, hex-encoded.
//!
//! Grounded in `pbs-datastore::data_blob`, which also reaches for
//! `openssl` rather than a pure-Rust hashing crate for its cryptographic
//! digests.

use openssl::sha::Sha256;

pub const DIGEST_HEX_LEN: usize = 64;

/// Computes the SHA-256 digest of `data`, encoded as 64 lowercase hex
/// characters.
pub fn hash_chunk(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_vector() {
        // sha256("") - the standard empty-input vector.
        assert_eq!(
            hash_chunk(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn is_64_lowercase_hex_chars() {
        let digest = hash_chunk(b"hello world");
        assert_eq!(digest.len(), DIGEST_HEX_LEN);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
