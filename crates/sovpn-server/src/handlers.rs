use std::path::Path as FsPath;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
};
use tracing::info;

use crate::lifecycle::PRETTY_NAME_FILE;
use crate::AppState;

// ── Resolution ───────────────────────────────────────────────────────────────

/// Resolve a presented token to a slug, or produce the error response:
/// 404 for unknown tokens, 403 when an allow-list excludes the slug.
fn resolve_slug(state: &AppState, token: &str) -> Result<String, Response> {
    let slug = match state.index.find_slug_by_hash(token) {
        Ok(Some(slug)) => slug,
        Ok(None) => return Err(not_found()),
        Err(e) => return Err(internal_error(e)),
    };

    if let Some(allowed) = &state.allow_list {
        if !allowed.contains(&slug) {
            return Err(forbidden());
        }
    }
    Ok(slug)
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "forbidden").into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
}

// ── Listing page ─────────────────────────────────────────────────────────────

/// `GET /{token}` — list a client's downloadable files.
pub async fn client_page(State(state): State<AppState>, Path(token): Path<String>) -> Response {
    let slug = match resolve_slug(&state, &token) {
        Ok(slug) => slug,
        Err(resp) => return resp,
    };

    let client_dir = state.clients_dir.join(&slug);
    let mut display_name = slug.clone();
    let mut files = Vec::new();

    let mut entries = match tokio::fs::read_dir(&client_dir).await {
        Ok(entries) => entries,
        Err(e) => return internal_error(anyhow::Error::new(e).context("read client dir")),
    };
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name == PRETTY_NAME_FILE {
                    // The marker supplies the display label instead of being listed.
                    if let Ok(pretty) = tokio::fs::read_to_string(entry.path()).await {
                        let pretty = pretty.trim();
                        if !pretty.is_empty() {
                            display_name = pretty.to_owned();
                        }
                    }
                    continue;
                }
                files.push(name);
            }
            Ok(None) => break,
            Err(e) => return internal_error(anyhow::Error::new(e).context("read client dir")),
        }
    }
    files.sort();

    info!(slug = %slug, files = files.len(), "served listing page");
    Html(render_listing(&display_name, &token, &files)).into_response()
}

fn render_listing(display_name: &str, token: &str, files: &[String]) -> String {
    let mut items = String::new();
    for file in files {
        let file = escape_html(file);
        items.push_str(&format!("<li><a href=\"/{token}/{file}\">{file}</a></li>\n"));
    }
    let name = escape_html(display_name);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{name}</title></head>\n\
         <body>\n<h1>{name}</h1>\n<ul>\n{items}</ul>\n</body>\n</html>\n"
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ── File download ────────────────────────────────────────────────────────────

/// `GET /{token}/{filename}` — serve one client file as a download.
pub async fn download_file(
    State(state): State<AppState>,
    Path((token, filename)): Path<(String, String)>,
) -> Response {
    let slug = match resolve_slug(&state, &token) {
        Ok(slug) => slug,
        Err(resp) => return resp,
    };

    // The filename must be a single plain path segment before it is joined
    // to the client dir; anything else could escape it.
    if !is_single_segment(&filename) {
        return not_found();
    }

    let path = state.clients_dir.join(&slug).join(&filename);
    let body = match tokio::fs::read(&path).await {
        Ok(body) => body,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return not_found(),
        Err(e) => return internal_error(anyhow::Error::new(e).context("read client file")),
    };

    info!(slug = %slug, file = %filename, "served file download");
    let disposition = format!("attachment; filename=\"{filename}\"");
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            ),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&disposition)
                    .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
            ),
        ],
        body,
    )
        .into_response()
}

fn is_single_segment(filename: &str) -> bool {
    if filename.is_empty() || filename.contains(['/', '\\']) || filename.contains('\0') {
        return false;
    }
    let mut components = FsPath::new(filename).components();
    matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_validation() {
        assert!(is_single_segment("ca.crt"));
        assert!(is_single_segment("alice-smith.key"));
        assert!(!is_single_segment(""));
        assert!(!is_single_segment(".."));
        assert!(!is_single_segment("."));
        assert!(!is_single_segment("../ca.crt"));
        assert!(!is_single_segment("sub/ca.crt"));
        assert!(!is_single_segment("..\\ca.crt"));
        assert!(!is_single_segment("/etc/passwd"));
    }

    #[test]
    fn listing_escapes_and_links_files() {
        let page = render_listing("Alice & Co", "abc123", &["ca.crt".into()]);
        assert!(page.contains("<h1>Alice &amp; Co</h1>"));
        assert!(page.contains("<a href=\"/abc123/ca.crt\">ca.crt</a>"));
    }
}
