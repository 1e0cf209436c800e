use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;

/// Name of the pointer file inside the data dir. Contains only the absolute
/// path of the user-chosen config file, so the config can live anywhere
/// while staying discoverable on every run.
pub const CONFIG_POINTER: &str = "config-pointer.txt";

/// Name of the share-hash index database inside the data dir.
pub const INDEX_DB: &str = "sovpn.db";

// ── Field types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        })
    }
}

impl Protocol {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Some(Self::Udp),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

/// Tri-state hostname setting.
///
/// In the config file: absent/`null` = never configured, `false` = operator
/// explicitly declined a hostname, a string = configured value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Hostname {
    #[default]
    Unset,
    Disabled,
    Name(String),
}

impl Hostname {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(n) => Some(n),
            _ => None,
        }
    }
}

impl Serialize for Hostname {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Unset => serializer.serialize_none(),
            Self::Disabled => serializer.serialize_bool(false),
            Self::Name(n) => serializer.serialize_str(n),
        }
    }
}

impl<'de> Deserialize<'de> for Hostname {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HostnameVisitor;

        impl<'de> Visitor<'de> for HostnameVisitor {
            type Value = Hostname;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a hostname string, false, or null")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Hostname, E> {
                Ok(Hostname::Name(v.to_owned()))
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Hostname, E> {
                if v {
                    Err(de::Error::custom("hostname cannot be `true`"))
                } else {
                    Ok(Hostname::Disabled)
                }
            }

            fn visit_unit<E: de::Error>(self) -> Result<Hostname, E> {
                Ok(Hostname::Unset)
            }

            fn visit_none<E: de::Error>(self) -> Result<Hostname, E> {
                Ok(Hostname::Unset)
            }

            fn visit_some<D2: Deserializer<'de>>(self, d: D2) -> Result<Hostname, D2::Error> {
                d.deserialize_any(HostnameVisitor)
            }
        }

        deserializer.deserialize_any(HostnameVisitor)
    }
}

// ── Draft (file representation) ──────────────────────────────────────────────

/// Unvalidated, all-optional mirror of the `server` group in the config file.
/// Produced by `ConfigStore::load` and by interactive setup; turned into a
/// usable [`ServerConfig`] by [`ConfigDraft::finalize`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDraft {
    pub server_dir: Option<String>,
    pub easy_rsa_dir: Option<String>,
    pub clients_dir: Option<String>,
    #[serde(default)]
    pub hostname: Hostname,
    pub ipv4: Option<String>,
    pub protocol: Option<Protocol>,
    pub port: Option<u16>,
    pub share_salt: Option<String>,
    pub share_address: Option<String>,
    pub share_port: Option<u16>,
    pub share_url: Option<String>,
}

/// On-disk shape: `server` group plus a `client` group that historical tools
/// wrote transient per-client state into. The `client` group is ignored on
/// load and written back empty.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    server: ConfigDraft,
    #[serde(default)]
    client: serde_json::Map<String, serde_json::Value>,
}

impl ConfigDraft {
    /// Reset every field except the CA-tool path and the resolved base URL,
    /// so a re-run of setup does not force re-discovery of stable
    /// infrastructure values.
    pub fn wipe(&mut self) {
        let keep = Self {
            easy_rsa_dir: self.easy_rsa_dir.take(),
            share_url: self.share_url.take(),
            ..Default::default()
        };
        *self = keep;
    }

    /// Normalize directory fields so they always carry a trailing separator.
    pub fn normalize(&mut self) {
        for dir in [
            &mut self.server_dir,
            &mut self.easy_rsa_dir,
            &mut self.clients_dir,
        ] {
            if let Some(d) = dir {
                *d = sanitize_path(d);
            }
        }
    }

    /// Validate the draft into an immutable [`ServerConfig`].
    pub fn finalize(mut self) -> Result<ServerConfig, ConfigError> {
        self.normalize();

        let server_dir = required_dir("server_dir", self.server_dir.as_deref())?;
        let easy_rsa_dir = required_dir("easy_rsa_dir", self.easy_rsa_dir.as_deref())?;
        let clients_dir = required_dir("clients_dir", self.clients_dir.as_deref())?;

        if let Hostname::Name(name) = &self.hostname {
            if name.is_empty() || name.len() > 255 {
                return Err(ConfigError::invalid(
                    "hostname",
                    name.clone(),
                    "must be 1-255 characters",
                ));
            }
        }

        let ipv4 = match self.ipv4.as_deref() {
            None => None,
            Some(raw) => Some(raw.parse::<Ipv4Addr>().map_err(|e| {
                ConfigError::invalid("ipv4", raw, e.to_string())
            })?),
        };

        let protocol = self
            .protocol
            .ok_or(ConfigError::Missing { field: "protocol" })?;
        let port = required_port("port", self.port)?;
        let share_port = required_port("share_port", self.share_port)?;

        let share_salt = self
            .share_salt
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing { field: "share_salt" })?;

        let share_address = match self.share_address.as_deref() {
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::invalid("share_address", raw, "not an IP address"))?,
        };

        Ok(ServerConfig {
            server_dir,
            easy_rsa_dir,
            clients_dir,
            hostname: self.hostname,
            ipv4,
            protocol,
            port,
            share_salt,
            share_address,
            share_port,
            share_url: self.share_url,
        })
    }
}

// ── Validated config ─────────────────────────────────────────────────────────

/// Validated server-wide settings, constructed once at startup and passed by
/// reference to the components that need it. Never mutated in place: edits go
/// through a [`ConfigDraft`] that is re-finalized and re-saved.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_dir: PathBuf,
    pub easy_rsa_dir: PathBuf,
    pub clients_dir: PathBuf,
    pub hostname: Hostname,
    pub ipv4: Option<Ipv4Addr>,
    pub protocol: Protocol,
    pub port: u16,
    pub share_salt: String,
    pub share_address: IpAddr,
    pub share_port: u16,
    pub share_url: Option<String>,
}

impl ServerConfig {
    /// Directory holding one client's files.
    pub fn client_dir(&self, slug: &str) -> PathBuf {
        self.clients_dir.join(slug)
    }

    /// Base URL of the distribution gateway, if resolvable: the explicit
    /// `share_url` wins, otherwise it is derived from the hostname and
    /// share port.
    pub fn share_url_base(&self) -> Option<String> {
        if let Some(url) = &self.share_url {
            return Some(url.trim_end_matches('/').to_owned());
        }
        self.hostname
            .as_name()
            .map(|h| format!("http://{}:{}", h, self.share_port))
    }
}

// ── Store ────────────────────────────────────────────────────────────────────

/// Loads and persists the config file, with a pointer file in the data dir
/// recording where the config file itself lives.
pub struct ConfigStore {
    data_dir: PathBuf,
}

impl ConfigStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Store rooted at `SOVPN_DATA_DIR` or the platform data dir.
    pub fn open_default() -> Result<Self, ConfigError> {
        Ok(Self::new(crate::dirs::data_dir()?))
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pointer_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_POINTER)
    }

    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(INDEX_DB)
    }

    /// Path of the config file recorded in the pointer, if any.
    pub fn config_path(&self) -> Result<Option<PathBuf>, ConfigError> {
        let pointer = self.pointer_path();
        if !pointer.is_file() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&pointer)
            .with_context(|| format!("read pointer file: {}", pointer.display()))
            .map_err(ConfigError::Other)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(PathBuf::from(trimmed)))
    }

    /// Load the draft config. `NotConfigured` when the pointer or the config
    /// file it names does not exist. Idempotent.
    pub fn load(&self) -> Result<ConfigDraft, ConfigError> {
        let path = self.config_path()?.ok_or(ConfigError::NotConfigured)?;
        if !path.is_file() {
            return Err(ConfigError::NotConfigured);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config file: {}", path.display()))
            .map_err(ConfigError::Other)?;
        let file: ConfigFile = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::invalid("server", path.display().to_string(), e.to_string()))?;
        Ok(file.server)
    }

    /// Persist the draft to `path` (pretty-printed JSON) and record `path` in
    /// the pointer file. The write goes through a temp file in the target
    /// directory followed by a rename, so an interrupted process never leaves
    /// a half-written config behind.
    pub fn save(&self, path: &Path, draft: &ConfigDraft) -> Result<(), ConfigError> {
        let mut draft = draft.clone();
        draft.normalize();

        let file = ConfigFile {
            server: draft,
            client: serde_json::Map::new(),
        };
        let body = serde_json::to_string_pretty(&file)
            .context("serialize config")
            .map_err(ConfigError::Other)?;

        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        atomic_write(parent, path, format!("{body}\n").as_bytes()).map_err(ConfigError::Other)?;

        std::fs::create_dir_all(&self.data_dir)
            .context("create data dir")
            .map_err(ConfigError::Other)?;
        atomic_write(
            &self.data_dir,
            &self.pointer_path(),
            format!("{}\n", path.display()).as_bytes(),
        )
        .map_err(ConfigError::Other)?;

        info!(path = %path.display(), "saved configuration");
        Ok(())
    }

    /// Remove the config file, the pointer file and the index database.
    /// Returns the paths that were actually removed.
    pub fn destroy(&self) -> Result<Vec<PathBuf>, ConfigError> {
        let mut targets = vec![self.pointer_path(), self.index_path()];
        if let Some(config) = self.config_path()? {
            targets.insert(0, config);
        }

        let mut removed = Vec::new();
        for target in targets {
            if target.is_file() {
                std::fs::remove_file(&target)
                    .with_context(|| format!("remove {}", target.display()))
                    .map_err(ConfigError::Other)?;
                removed.push(target);
            }
        }
        Ok(removed)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Append a trailing separator so directory paths are stored normalized.
pub fn sanitize_path(path: &str) -> String {
    if path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}

fn atomic_write(dir: &Path, path: &Path, contents: &[u8]) -> anyhow::Result<()> {
    use std::io::Write;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(contents).context("write temp file")?;
    tmp.persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

fn required_dir(field: &'static str, value: Option<&str>) -> Result<PathBuf, ConfigError> {
    let raw = value.ok_or(ConfigError::Missing { field })?;
    let path = PathBuf::from(raw);
    if !path.is_dir() {
        return Err(ConfigError::invalid(field, raw, "not an existing directory"));
    }
    if !dir_is_writable(&path) {
        return Err(ConfigError::invalid(
            field,
            raw,
            "missing write/execute permission",
        ));
    }
    Ok(path)
}

fn required_port(field: &'static str, value: Option<u16>) -> Result<u16, ConfigError> {
    match value {
        Some(p) if p > 0 => Ok(p),
        Some(p) => Err(ConfigError::invalid(field, p.to_string(), "port must be 1-65535")),
        None => Err(ConfigError::Missing { field }),
    }
}

#[cfg(unix)]
fn dir_is_writable(path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        // Owner write + execute. Good enough for a tool that runs as the
        // directory owner; a probe write would race with real use.
        Ok(meta) => meta.mode() & 0o300 == 0o300,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn dir_is_writable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false)
}
