use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Compute the share hash for a client slug: hex(HMAC-SHA256(salt, slug)).
///
/// The hash is the capability token handed out to clients. It is
/// deterministic for a given salt, so changing the salt and recomputing for
/// every slug invalidates all previously issued tokens in one sweep.
pub fn share_hash(slug: &str, salt: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(salt.as_bytes()).expect("HMAC accepts any key length");
    mac.update(slug.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        let h1 = share_hash("alice-smith", "salt");
        let h2 = share_hash("alice-smith", "salt");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64); // SHA-256 hex digest
    }

    #[test]
    fn different_salts_produce_different_hashes() {
        assert_ne!(share_hash("alice", "salt-a"), share_hash("alice", "salt-b"));
    }

    #[test]
    fn different_slugs_produce_different_hashes() {
        assert_ne!(share_hash("alice", "salt"), share_hash("bob", "salt"));
    }
}
