use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::Request,
    http::{header, HeaderValue},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{client_page, download_file};
use crate::store::Index;
use crate::AppState;

/// Settings for one gateway process. The allow-list is fixed for the process
/// lifetime; it is never reloaded from the index.
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub clients_dir: PathBuf,
    pub allow_list: Option<HashSet<String>>,
}

/// Responses can carry key material; forbid caching on every one of them.
async fn no_store(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/{token}", get(client_page))
        .route("/{token}/{filename}", get(download_file))
        .with_state(state)
        .layer(middleware::from_fn(no_store))
        .layer(TraceLayer::new_for_http())
}

/// Run the distribution gateway until the process is stopped. Request
/// failures surface as 4xx/5xx responses, never as a crash.
pub async fn run(index: Index, cfg: GatewayConfig) -> Result<()> {
    let state = AppState {
        index,
        clients_dir: cfg.clients_dir,
        allow_list: cfg.allow_list.map(Arc::new),
    };

    if let Some(allowed) = &state.allow_list {
        info!(slugs = allowed.len(), "allow-list active");
    } else {
        info!("sharing configuration files for every registered client");
    }

    let app = router(state);

    info!(addr = %cfg.bind, "distribution gateway listening");
    let listener = tokio::net::TcpListener::bind(cfg.bind)
        .await
        .context("bind listener")?;

    axum::serve(listener, app).await.context("server error")
}
