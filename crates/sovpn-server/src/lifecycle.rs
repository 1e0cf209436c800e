use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::ca::CertificateAuthority;
use crate::config::ServerConfig;
use crate::error::LifecycleError;
use crate::share::share_hash;
use crate::slug;
use crate::store::Index;

/// Display-only marker file inside a client dir; never used for identity.
pub const PRETTY_NAME_FILE: &str = "pretty-name.txt";

/// A provisioned client.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub slug: String,
    pub pretty_name: Option<String>,
    pub client_dir: PathBuf,
}

/// Orchestrates creation and revocation of client identities.
///
/// Operations are meant to run one at a time from a single controlling
/// process; the uniqueness check and directory creation are not one atomic
/// step, so concurrent creates against the same name must be serialized by
/// the caller.
pub struct Lifecycle<'a> {
    config: &'a ServerConfig,
    index: &'a Index,
    ca: &'a dyn CertificateAuthority,
}

impl<'a> Lifecycle<'a> {
    pub fn new(config: &'a ServerConfig, index: &'a Index, ca: &'a dyn CertificateAuthority) -> Self {
        Self { config, index, ca }
    }

    /// Create a client identity for `pretty_name`.
    ///
    /// Any failure after the client directory exists rolls the directory back,
    /// so a failed create leaves no trace under `clients_dir`.
    pub async fn create_client(&self, pretty_name: &str) -> Result<ClientIdentity, LifecycleError> {
        let pretty_name = pretty_name.trim();
        let slug = slug::derive(pretty_name);
        if slug.is_empty() {
            return Err(LifecycleError::InvalidName(pretty_name.to_owned()));
        }
        if slug::exists(&self.config.clients_dir, &slug) {
            return Err(LifecycleError::DuplicateClient(slug));
        }

        let client_dir = self.config.client_dir(&slug);
        create_private_dir(&client_dir)
            .with_context(|| format!("create client dir {}", client_dir.display()))
            .map_err(LifecycleError::Other)?;

        match self.provision(&slug, pretty_name, &client_dir).await {
            Ok(()) => {}
            Err(e) => {
                // Roll back so a failed create leaves the slug nonexistent.
                if let Err(cleanup) = std::fs::remove_dir_all(&client_dir) {
                    warn!(slug = %slug, error = %cleanup, "rollback of client dir failed");
                }
                return Err(e);
            }
        }

        info!(slug = %slug, "client created");
        Ok(ClientIdentity {
            slug,
            pretty_name: (!pretty_name.is_empty()).then(|| pretty_name.to_owned()),
            client_dir,
        })
    }

    /// Drive the interactive create loop: ask `next_name` for display names
    /// until one yields a free, non-empty slug. The retry policy lives here,
    /// not in the caller.
    pub async fn create_client_with<F>(&self, mut next_name: F) -> Result<ClientIdentity, LifecycleError>
    where
        F: FnMut() -> Result<String>,
    {
        loop {
            let name = next_name().map_err(LifecycleError::Other)?;
            match self.create_client(&name).await {
                Err(LifecycleError::DuplicateClient(slug)) => {
                    warn!(slug = %slug, "client with this name already exists");
                }
                Err(LifecycleError::InvalidName(_)) => {
                    warn!("name does not yield a usable identifier");
                }
                other => return other,
            }
        }
    }

    /// Revoke a client: CA first, local cleanup after. If the CA call fails,
    /// the record and directory are left untouched.
    pub async fn revoke_client(&self, slug: &str) -> Result<(), LifecycleError> {
        if self.index.find_hash_by_slug(slug)?.is_none() {
            return Err(LifecycleError::ClientNotFound(slug.to_owned()));
        }

        self.ca
            .revoke(slug)
            .await
            .with_context(|| format!("revoke certificate for {slug}"))
            .map_err(LifecycleError::Other)?;

        self.index.remove(slug)?;
        let client_dir = self.config.client_dir(slug);
        if client_dir.is_dir() {
            std::fs::remove_dir_all(&client_dir)
                .with_context(|| format!("remove {}", client_dir.display()))
                .map_err(LifecycleError::Other)?;
        }

        info!(slug = %slug, "client revoked");
        Ok(())
    }

    /// Recompute every registered slug's share hash from the current salt,
    /// replacing the old record. Idempotent for an unchanged salt; after a
    /// salt change this is what invalidates every previously issued token.
    pub fn rotate_share_hashes(&self) -> Result<usize, LifecycleError> {
        let slugs = self.index.all_slugs()?;
        for slug in &slugs {
            self.index.replace(slug, &share_hash(slug, &self.config.share_salt))?;
        }
        info!(rotated = slugs.len(), "share hashes rotated");
        Ok(slugs.len())
    }

    /// Everything that happens inside a freshly created client dir: CA
    /// generation, key-material installation, the pretty-name marker and
    /// index registration.
    async fn provision(
        &self,
        slug: &str,
        pretty_name: &str,
        client_dir: &Path,
    ) -> Result<(), LifecycleError> {
        if let Err(e) = self.ca.generate(slug).await {
            return Err(LifecycleError::CertificateGenerationFailed {
                slug: slug.to_owned(),
                reason: e.to_string(),
            });
        }

        self.install_key_material(slug, client_dir)
            .map_err(LifecycleError::Other)?;

        if !pretty_name.is_empty() {
            std::fs::write(client_dir.join(PRETTY_NAME_FILE), format!("{pretty_name}\n"))
                .context("write pretty-name marker")
                .map_err(LifecycleError::Other)?;
        }

        self.index.insert(slug, &share_hash(slug, &self.config.share_salt))?;
        Ok(())
    }

    /// Move the per-client key material out of the CA's keys directory (that
    /// directory is typically more broadly readable, so the private key must
    /// not stay duplicated there), drop the CSR artifact, and copy in the
    /// shared CA certificate and TLS-auth secret.
    fn install_key_material(&self, slug: &str, client_dir: &Path) -> Result<()> {
        let keys_dir = self.config.easy_rsa_dir.join("keys");

        for ext in ["crt", "key"] {
            let source = keys_dir.join(format!("{slug}.{ext}"));
            let destination = client_dir.join(format!("{slug}.{ext}"));
            std::fs::rename(&source, &destination)
                .with_context(|| format!("move {}", source.display()))?;
        }

        let csr = keys_dir.join(format!("{slug}.csr"));
        if csr.is_file() {
            std::fs::remove_file(&csr).with_context(|| format!("remove {}", csr.display()))?;
        }

        // Shared across clients, so copied rather than moved.
        std::fs::copy(keys_dir.join("ca.crt"), client_dir.join("ca.crt"))
            .context("copy ca.crt")?;
        std::fs::copy(
            self.config.server_dir.join("ta.key"),
            client_dir.join("ta.key"),
        )
        .context("copy ta.key")?;

        Ok(())
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        // Holds private key material; owner-only.
        builder.mode(0o700);
    }
    builder.create(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Hostname, Protocol};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::{tempdir, TempDir};

    /// Fake CA that mimics easy-rsa's on-disk behavior: drops crt/key/csr
    /// into the keys dir (plus ca.crt on first use).
    struct FakeCa {
        keys_dir: PathBuf,
        fail_generate: bool,
        fail_revoke: bool,
    }

    #[async_trait]
    impl CertificateAuthority for FakeCa {
        async fn generate(&self, slug: &str) -> Result<()> {
            if self.fail_generate {
                bail!("build-key exited with exit status: 1");
            }
            std::fs::create_dir_all(&self.keys_dir)?;
            std::fs::write(self.keys_dir.join(format!("{slug}.crt")), "crt")?;
            std::fs::write(self.keys_dir.join(format!("{slug}.key")), "key")?;
            std::fs::write(self.keys_dir.join(format!("{slug}.csr")), "csr")?;
            let ca = self.keys_dir.join("ca.crt");
            if !ca.exists() {
                std::fs::write(ca, "ca")?;
            }
            Ok(())
        }

        async fn revoke(&self, _slug: &str) -> Result<()> {
            if self.fail_revoke {
                bail!("revoke-full exited with exit status: 1");
            }
            Ok(())
        }
    }

    struct Fixture {
        config: ServerConfig,
        index: Index,
        ca: FakeCa,
        _root: TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with_salt("pepper")
    }

    fn fixture_with_salt(salt: &str) -> Fixture {
        let root = tempdir().unwrap();
        let server_dir = root.path().join("server");
        let easy_rsa_dir = root.path().join("easy-rsa");
        let clients_dir = root.path().join("clients");
        for d in [&server_dir, &easy_rsa_dir, &clients_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        std::fs::write(server_dir.join("ta.key"), "ta").unwrap();
        std::fs::create_dir_all(easy_rsa_dir.join("keys")).unwrap();

        let config = ServerConfig {
            server_dir: server_dir.clone(),
            easy_rsa_dir: easy_rsa_dir.clone(),
            clients_dir,
            hostname: Hostname::Name("vpn.example.com".into()),
            ipv4: None,
            protocol: Protocol::Udp,
            port: 1194,
            share_salt: salt.to_owned(),
            share_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            share_port: 1195,
            share_url: None,
        };
        let index = Index::open(&root.path().join("sovpn.db")).unwrap();
        let ca = FakeCa {
            keys_dir: easy_rsa_dir.join("keys"),
            fail_generate: false,
            fail_revoke: false,
        };

        Fixture {
            config,
            index,
            ca,
            _root: root,
        }
    }

    #[tokio::test]
    async fn create_provisions_full_client_dir() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);

        let client = lc.create_client("Alice Smith").await.unwrap();
        assert_eq!(client.slug, "alice-smith");

        for file in ["alice-smith.crt", "alice-smith.key", "ca.crt", "ta.key", PRETTY_NAME_FILE] {
            assert!(client.client_dir.join(file).is_file(), "missing {file}");
        }
        assert_eq!(
            std::fs::read_to_string(client.client_dir.join(PRETTY_NAME_FILE)).unwrap(),
            "Alice Smith\n"
        );

        // Private key and CSR must not linger in the CA's keys dir.
        let keys = f.config.easy_rsa_dir.join("keys");
        assert!(!keys.join("alice-smith.key").exists());
        assert!(!keys.join("alice-smith.csr").exists());
        // The shared CA cert stays.
        assert!(keys.join("ca.crt").is_file());

        let hash = f.index.find_hash_by_slug("alice-smith").unwrap().unwrap();
        assert_eq!(hash, share_hash("alice-smith", "pepper"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn client_dir_is_owner_only() {
        use std::os::unix::fs::MetadataExt;
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        let client = lc.create_client("Alice").await.unwrap();
        let mode = std::fs::metadata(&client.client_dir).unwrap().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        lc.create_client("Alice Smith").await.unwrap();

        let err = lc.create_client("Alice Smith").await.unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateClient(ref s) if s == "alice-smith"));
        // The first client's directory is untouched.
        assert!(f.config.client_dir("alice-smith").join("alice-smith.key").is_file());
    }

    #[tokio::test]
    async fn failed_generation_rolls_back_directory() {
        let mut f = fixture();
        f.ca.fail_generate = true;
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);

        let err = lc.create_client("Alice").await.unwrap_err();
        assert!(matches!(err, LifecycleError::CertificateGenerationFailed { .. }));
        assert!(!f.config.client_dir("alice").exists());
        assert!(f.index.find_hash_by_slug("alice").unwrap().is_none());
    }

    #[tokio::test]
    async fn create_then_revoke_round_trip() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);

        lc.create_client("Alice").await.unwrap();
        lc.revoke_client("alice").await.unwrap();

        assert!(!f.config.client_dir("alice").exists());
        assert!(f.index.find_hash_by_slug("alice").unwrap().is_none());
    }

    #[tokio::test]
    async fn revoke_unknown_slug_fails() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        let err = lc.revoke_client("ghost").await.unwrap_err();
        assert!(matches!(err, LifecycleError::ClientNotFound(ref s) if s == "ghost"));
    }

    #[tokio::test]
    async fn failed_ca_revoke_leaves_local_state_intact() {
        let mut f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        lc.create_client("Alice").await.unwrap();
        drop(lc);

        f.ca.fail_revoke = true;
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        assert!(lc.revoke_client("alice").await.is_err());

        assert!(f.config.client_dir("alice").is_dir());
        assert!(f.index.find_hash_by_slug("alice").unwrap().is_some());
    }

    #[tokio::test]
    async fn rotation_is_idempotent_for_unchanged_salt() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        lc.create_client("Alice").await.unwrap();
        lc.create_client("Bob").await.unwrap();

        lc.rotate_share_hashes().unwrap();
        let first: Vec<_> = ["alice", "bob"]
            .iter()
            .map(|s| f.index.find_hash_by_slug(s).unwrap().unwrap())
            .collect();
        lc.rotate_share_hashes().unwrap();
        let second: Vec<_> = ["alice", "bob"]
            .iter()
            .map(|s| f.index.find_hash_by_slug(s).unwrap().unwrap())
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn salt_change_plus_rotation_invalidates_old_tokens() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        lc.create_client("Alice").await.unwrap();
        let old_token = f.index.find_hash_by_slug("alice").unwrap().unwrap();

        let mut rotated_config = f.config.clone();
        rotated_config.share_salt = "new-pepper".into();
        let lc = Lifecycle::new(&rotated_config, &f.index, &f.ca);
        lc.rotate_share_hashes().unwrap();

        assert_eq!(f.index.find_slug_by_hash(&old_token).unwrap(), None);
        let new_token = share_hash("alice", "new-pepper");
        assert_eq!(f.index.find_slug_by_hash(&new_token).unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn interactive_loop_retries_until_free_slug() {
        let f = fixture();
        let lc = Lifecycle::new(&f.config, &f.index, &f.ca);
        lc.create_client("Alice").await.unwrap();

        let mut names = vec!["   ", "Alice", "Bob"].into_iter();
        let client = lc
            .create_client_with(|| Ok(names.next().expect("provider exhausted").to_owned()))
            .await
            .unwrap();
        assert_eq!(client.slug, "bob");
    }
}
