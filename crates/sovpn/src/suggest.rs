//! Suggested values for the interactive setup prompts.
//!
//! Resolution is a pure priority chain (existing config value, then sample
//! default, then computed default) so it can be tested without stdin; the
//! prompt loop in `main.rs` is the only place that does I/O.

/// First usable candidate wins. Blank strings count as unusable.
pub fn resolve(candidates: &[Option<String>]) -> Option<String> {
    candidates
        .iter()
        .flatten()
        .find(|c| !c.trim().is_empty())
        .cloned()
}

pub const SERVER_DIR: &str = "/etc/openvpn";
pub const EASY_RSA_DIR: &str = "/etc/openvpn/easy-rsa";
pub const CLIENTS_DIR: &str = "/etc/openvpn/clients";
pub const PROTOCOL: &str = "udp";
pub const PORT: &str = "1194";
pub const SHARE_ADDRESS: &str = "0.0.0.0";
pub const SHARE_PORT: &str = "1195";

/// Fully qualified name reported by the system, if any.
pub fn system_hostname() -> Option<String> {
    std::process::Command::new("hostname")
        .arg("-f")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
}

/// Fresh random share salt: 32 hex chars.
pub fn random_salt() -> String {
    use rand::Rng;
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_prefers_earlier_candidates() {
        let got = resolve(&[
            Some("from-config".into()),
            Some("from-sample".into()),
            Some("computed".into()),
        ]);
        assert_eq!(got.as_deref(), Some("from-config"));
    }

    #[test]
    fn resolve_skips_missing_and_blank() {
        let got = resolve(&[None, Some("   ".into()), Some("computed".into())]);
        assert_eq!(got.as_deref(), Some("computed"));
        assert_eq!(resolve(&[None, None]), None);
    }

    #[test]
    fn random_salt_is_32_hex_chars() {
        let salt = random_salt();
        assert_eq!(salt.len(), 32);
        assert!(salt.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(salt, random_salt());
    }
}
