pub mod ca;
pub mod config;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod server;
pub mod share;
pub mod slug;
pub mod store;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

/// Shared gateway state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub index: store::Index,
    pub clients_dir: PathBuf,
    /// When set, only these slugs are served; fixed at process start.
    pub allow_list: Option<Arc<HashSet<String>>>,
}

pub use ca::{CertificateAuthority, EasyRsa};
pub use config::{ConfigDraft, ConfigStore, Hostname, Protocol, ServerConfig};
pub use error::{ConfigError, LifecycleError};
pub use lifecycle::{ClientIdentity, Lifecycle};
pub use server::{run, GatewayConfig};
pub use share::share_hash;
pub use store::Index;
