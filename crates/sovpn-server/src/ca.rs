use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

/// Default ceiling for one easy-rsa invocation. Key generation is slow on
/// entropy-starved hosts but should never take minutes.
pub const DEFAULT_CA_TIMEOUT: Duration = Duration::from_secs(120);

/// Narrow seam around the external certificate-authority tool, so lifecycle
/// logic can be exercised against a fake implementation.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Produce `{slug}.crt` / `{slug}.key` (and `ca.crt` on first use) in the
    /// tool's keys directory.
    async fn generate(&self, slug: &str) -> Result<()>;

    /// Un-issue the certificate for a slug.
    async fn revoke(&self, slug: &str) -> Result<()>;
}

/// Easy-RSA invoked as a subprocess from its own directory, with the
/// environment exported by its `vars` file.
pub struct EasyRsa {
    dir: PathBuf,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl EasyRsa {
    /// Set up an easy-rsa wrapper rooted at `dir`. Fails when the `vars`
    /// file is missing, since easy-rsa cannot run without it.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let vars_path = dir.join("vars");
        if !vars_path.is_file() {
            bail!("can't find vars file in easy-rsa directory: {}", dir.display());
        }
        let raw = std::fs::read_to_string(&vars_path)
            .with_context(|| format!("read {}", vars_path.display()))?;
        let env = parse_vars(&raw, &dir);
        Ok(Self {
            dir,
            env,
            timeout: DEFAULT_CA_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Directory easy-rsa drops generated key material into.
    pub fn keys_dir(&self) -> PathBuf {
        self.dir.join("keys")
    }

    async fn run_tool(&self, program: &str, slug: &str) -> Result<()> {
        debug!(program, slug, "invoking easy-rsa");

        let mut cmd = Command::new(format!("./{program}"));
        cmd.arg(slug)
            .current_dir(&self.dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = match tokio::time::timeout(self.timeout, cmd.status()).await {
            Ok(result) => result.with_context(|| format!("spawn {program}"))?,
            Err(_) => bail!("{program} {slug} timed out after {:?}", self.timeout),
        };

        if !status.success() {
            bail!("{program} {slug} exited with {status}");
        }
        info!(program, slug, "easy-rsa finished");
        Ok(())
    }
}

#[async_trait]
impl CertificateAuthority for EasyRsa {
    async fn generate(&self, slug: &str) -> Result<()> {
        self.run_tool("build-key", slug).await
    }

    async fn revoke(&self, slug: &str) -> Result<()> {
        self.run_tool("revoke-full", slug).await
    }
}

/// Parse `export KEY=value` lines from an easy-rsa `vars` file.
///
/// Values may be double-quoted or backtick-wrapped; `$EASY_RSA` references
/// are substituted with the actual directory, and `EASY_RSA`/`KEY_CONFIG`
/// are pinned to it regardless of what the file says.
fn parse_vars(raw: &str, easy_rsa_dir: &Path) -> Vec<(String, String)> {
    let root = easy_rsa_dir
        .display()
        .to_string()
        .trim_end_matches('/')
        .to_owned();

    let mut env = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.starts_with('#') || !line.starts_with("export") {
            continue;
        }
        let Some((key, value)) = line.trim_start_matches("export").trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_owned();
        let mut value = value.trim().trim_matches('"').trim_matches('`').to_owned();

        if key == "EASY_RSA" {
            value = root.clone();
        } else if key == "KEY_CONFIG" {
            value = format!("{root}/openssl.cnf");
        }
        value = value.replace("$EASY_RSA", &root);

        env.push((key, value));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_export_lines_and_substitutes_root() {
        let raw = "\
# easy-rsa vars
export EASY_RSA=\"`pwd`\"
export KEY_CONFIG=`$EASY_RSA/whichopensslcnf $EASY_RSA`
export KEY_DIR=\"$EASY_RSA/keys\"
export KEY_SIZE=2048
not an export line
";
        let env = parse_vars(raw, Path::new("/etc/openvpn/easy-rsa/"));
        let get = |k: &str| {
            env.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(get("EASY_RSA"), Some("/etc/openvpn/easy-rsa"));
        assert_eq!(get("KEY_CONFIG"), Some("/etc/openvpn/easy-rsa/openssl.cnf"));
        assert_eq!(get("KEY_DIR"), Some("/etc/openvpn/easy-rsa/keys"));
        assert_eq!(get("KEY_SIZE"), Some("2048"));
        assert_eq!(env.len(), 4);
    }

    #[test]
    fn new_requires_vars_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EasyRsa::new(dir.path()).is_err());

        std::fs::write(dir.path().join("vars"), "export KEY_SIZE=2048\n").unwrap();
        let ca = EasyRsa::new(dir.path()).unwrap();
        assert_eq!(ca.keys_dir(), dir.path().join("keys"));
    }
}
