use std::collections::HashSet;
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sovpn_server::{
    config::sanitize_path, ConfigDraft, ConfigStore, EasyRsa, GatewayConfig, Hostname, Index,
    Lifecycle, Protocol, ServerConfig,
};

mod suggest;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "sovpn",
    about = "Simplified OpenVPN — manage VPN client identities and share their configs",
    version
)]
struct Cli {
    /// Data directory for the pointer file and index ($SOVPN_DATA_DIR)
    #[arg(long, env = "SOVPN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactively configure sovpn for this server
    Setup,
    /// Manage client identities
    #[command(subcommand)]
    Client(ClientCommands),
    /// Recompute every client's share hash from the current salt
    Rotate,
    /// Run the distribution gateway, optionally restricted to specific slugs
    Share {
        /// Slugs to allow; with none given, every client is served
        slugs: Vec<String>,
    },
    /// Inspect or reset the persisted configuration
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Remove sovpn's configuration, pointer file and index database
    Destroy,
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Create a new client identity
    Create {
        /// Display name; prompted for interactively when omitted
        #[arg(long)]
        name: Option<String>,
    },
    /// Revoke a client and remove its files
    Revoke {
        /// Client slug
        slug: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the loaded configuration as pretty JSON
    Show,
    /// Clear all settings except the CA-tool path and share URL
    Wipe,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SOVPN_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let store = match cli.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir).context("create data dir")?;
            ConfigStore::new(dir)
        }
        None => ConfigStore::open_default()?,
    };

    match cli.command {
        Commands::Setup => cmd_setup(&store),
        Commands::Client(ClientCommands::Create { name }) => cmd_client_create(&store, name).await,
        Commands::Client(ClientCommands::Revoke { slug }) => cmd_client_revoke(&store, &slug).await,
        Commands::Rotate => cmd_rotate(&store),
        Commands::Share { slugs } => cmd_share(&store, slugs).await,
        Commands::Config(ConfigCommands::Show) => cmd_config_show(&store),
        Commands::Config(ConfigCommands::Wipe) => cmd_config_wipe(&store),
        Commands::Destroy => cmd_destroy(&store),
    }
}

fn load_config(store: &ConfigStore) -> Result<ServerConfig> {
    Ok(store.load()?.finalize()?)
}

// ── Client commands ───────────────────────────────────────────────────────────

async fn cmd_client_create(store: &ConfigStore, name: Option<String>) -> Result<()> {
    let config = load_config(store)?;
    let index = Index::open(&store.index_path())?;
    let ca = EasyRsa::new(&config.easy_rsa_dir)?;
    let lifecycle = Lifecycle::new(&config, &index, &ca);

    let client = match name {
        Some(name) => lifecycle.create_client(&name).await?,
        None => {
            lifecycle
                .create_client_with(|| prompt("Enter Full Name for client", None))
                .await?
        }
    };

    let hash = index
        .find_hash_by_slug(&client.slug)?
        .context("share hash missing after create")?;
    println!("> Client \"{}\" was successfully created.", client.slug);
    println!("> Share Hash: {hash}");
    if let Some(base) = config.share_url_base() {
        println!("> Share URL: {base}/{hash}");
    }
    Ok(())
}

async fn cmd_client_revoke(store: &ConfigStore, slug: &str) -> Result<()> {
    let config = load_config(store)?;
    let index = Index::open(&store.index_path())?;
    let ca = EasyRsa::new(&config.easy_rsa_dir)?;
    let lifecycle = Lifecycle::new(&config, &index, &ca);

    lifecycle.revoke_client(slug).await?;
    println!("> Client \"{slug}\" was revoked.");
    Ok(())
}

fn cmd_rotate(store: &ConfigStore) -> Result<()> {
    let config = load_config(store)?;
    let index = Index::open(&store.index_path())?;
    let ca = EasyRsa::new(&config.easy_rsa_dir)?;
    let lifecycle = Lifecycle::new(&config, &index, &ca);

    let rotated = lifecycle.rotate_share_hashes()?;
    println!("> Rotated share hashes for {rotated} client(s).");
    Ok(())
}

// ── Gateway ───────────────────────────────────────────────────────────────────

async fn cmd_share(store: &ConfigStore, slugs: Vec<String>) -> Result<()> {
    let config = load_config(store)?;
    let index = Index::open(&store.index_path())?;

    let allow_list: Option<HashSet<String>> = if slugs.is_empty() {
        println!("> Sharing configuration files for everybody.");
        None
    } else {
        // Serving only specific clients, so print their mappings up front.
        println!("> Sharing mappings:");
        for slug in &slugs {
            match index.find_hash_by_slug(slug)? {
                Some(hash) => println!("> {slug} : {hash}"),
                None => println!("> {slug} : ---"),
            }
        }
        Some(slugs.into_iter().collect())
    };
    println!();

    sovpn_server::run(
        index,
        GatewayConfig {
            bind: SocketAddr::new(config.share_address, config.share_port),
            clients_dir: config.clients_dir.clone(),
            allow_list,
        },
    )
    .await
}

// ── Config commands ───────────────────────────────────────────────────────────

fn cmd_config_show(store: &ConfigStore) -> Result<()> {
    let draft = store.load()?;
    println!("{}", serde_json::to_string_pretty(&draft)?);
    Ok(())
}

fn cmd_config_wipe(store: &ConfigStore) -> Result<()> {
    let mut draft = store.load()?;
    let path = store
        .config_path()?
        .context("config pointer disappeared during wipe")?;
    draft.wipe();
    store.save(&path, &draft)?;
    println!("> Configuration wiped (CA-tool path and share URL kept).");
    Ok(())
}

fn cmd_destroy(store: &ConfigStore) -> Result<()> {
    let removed = store.destroy()?;
    if removed.is_empty() {
        println!("> Nothing to remove.");
    } else {
        for path in removed {
            println!("> Removed {}", path.display());
        }
    }
    Ok(())
}

// ── Interactive setup ─────────────────────────────────────────────────────────

fn cmd_setup(store: &ConfigStore) -> Result<()> {
    // Existing values (if any) become the first-priority suggestions.
    let existing = store.load().unwrap_or_default();
    let mut draft = ConfigDraft::default();

    draft.server_dir = Some(ask_dir(
        "Enter location of OpenVPN server directory on your server",
        suggest::resolve(&[existing.server_dir, Some(suggest::SERVER_DIR.into())]),
    )?);
    draft.easy_rsa_dir = Some(ask_dir(
        "Enter location of Easy RSA directory on your server",
        suggest::resolve(&[existing.easy_rsa_dir, Some(suggest::EASY_RSA_DIR.into())]),
    )?);
    draft.clients_dir = Some(ask_clients_dir(
        "Enter location for client directories on your server",
        suggest::resolve(&[existing.clients_dir, Some(suggest::CLIENTS_DIR.into())]),
    )?);

    draft.hostname = ask_hostname(suggest::resolve(&[
        existing.hostname.as_name().map(str::to_owned),
        suggest::system_hostname(),
    ]))?;

    draft.protocol = Some(ask_with(
        "Select protocol that you would like to use (TCP|UDP)",
        suggest::resolve(&[
            existing.protocol.map(|p| p.to_string()),
            Some(suggest::PROTOCOL.into()),
        ]),
        |raw| Protocol::parse(raw).context("expected tcp or udp"),
    )?);
    draft.port = Some(ask_with(
        "Select port that you are using for your server",
        suggest::resolve(&[
            existing.port.map(|p| p.to_string()),
            Some(suggest::PORT.into()),
        ]),
        parse_port,
    )?);

    draft.share_salt = Some(ask_with(
        "Enter random salt for the sharing gateway",
        suggest::resolve(&[existing.share_salt, Some(suggest::random_salt())]),
        |raw| Ok(raw.to_owned()),
    )?);
    draft.share_address = Some(ask_with(
        "Enter network address for the sharing gateway",
        suggest::resolve(&[existing.share_address, Some(suggest::SHARE_ADDRESS.into())]),
        |raw| {
            raw.parse::<std::net::IpAddr>()
                .map(|_| raw.to_owned())
                .context("not an IP address")
        },
    )?);
    draft.share_port = Some(ask_with(
        "Enter TCP port for the sharing gateway",
        suggest::resolve(&[
            existing.share_port.map(|p| p.to_string()),
            Some(suggest::SHARE_PORT.into()),
        ]),
        parse_port,
    )?);
    draft.share_url = existing.share_url;

    // Surface any remaining validation problem before anything is written.
    draft.clone().finalize()?;

    let default_config = format!(
        "{}sovpn.json",
        sanitize_path(draft.server_dir.as_deref().unwrap_or_default())
    );
    let config_path = ask_with(
        "Enter location for sovpn's config file",
        Some(default_config),
        |raw| Ok(PathBuf::from(raw)),
    )?;

    store.save(&config_path, &draft)?;
    println!("> Setup complete. Configuration written to {}.", config_path.display());
    Ok(())
}

fn prompt(label: &str, suggestion: Option<&str>) -> Result<String> {
    match suggestion {
        Some(s) => print!("> {label}: [{s}] "),
        None => print!("> {label}: "),
    }
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("read stdin")?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        Ok(suggestion.unwrap_or_default().to_owned())
    } else {
        Ok(trimmed.to_owned())
    }
}

/// Ask until `parse` accepts the answer.
fn ask_with<T>(
    label: &str,
    suggestion: Option<String>,
    parse: impl Fn(&str) -> Result<T>,
) -> Result<T> {
    loop {
        let raw = prompt(label, suggestion.as_deref())?;
        match parse(&raw) {
            Ok(value) => return Ok(value),
            Err(e) => println!("> Invalid value \"{raw}\": {e:#}"),
        }
    }
}

/// Ask for an existing directory; re-prompts instead of silently accepting a
/// bad path.
fn ask_dir(label: &str, suggestion: Option<String>) -> Result<String> {
    ask_with(label, suggestion, |raw| {
        if PathBuf::from(raw).is_dir() {
            Ok(sanitize_path(raw))
        } else {
            anyhow::bail!("not an existing directory")
        }
    })
}

/// Like `ask_dir`, but creates the directory when it does not exist yet.
fn ask_clients_dir(label: &str, suggestion: Option<String>) -> Result<String> {
    ask_with(label, suggestion, |raw| {
        let path = PathBuf::from(raw);
        if !path.is_dir() {
            std::fs::create_dir_all(&path)
                .with_context(|| format!("create {}", path.display()))?;
        }
        Ok(sanitize_path(raw))
    })
}

/// Hostname prompt; `-` means "serve without a hostname".
fn ask_hostname(suggestion: Option<String>) -> Result<Hostname> {
    ask_with(
        "Enter hostname of your server (or - for none)",
        suggestion,
        |raw| match raw {
            "-" => Ok(Hostname::Disabled),
            name if !name.is_empty() && name.len() <= 255 => Ok(Hostname::Name(name.to_owned())),
            _ => anyhow::bail!("must be 1-255 characters, or - to disable"),
        },
    )
}

fn parse_port(raw: &str) -> Result<u16> {
    let port: u16 = raw.parse().context("not a number")?;
    if port == 0 {
        anyhow::bail!("port must be 1-65535");
    }
    Ok(port)
}
