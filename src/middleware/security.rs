use axum::{
    extract::{Request, State},
    http::header::HOST,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, state::AppState};

/// Reject requests whose `Host` header is not in `TRUSTED_HOSTS`.
///
/// An empty list or a `*` entry disables the check.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if host_is_trusted(&state.config.trusted_hosts, host) {
        return next.run(request).await;
    }

    tracing::warn!(host, "Rejected request from untrusted host");
    AppError::BadRequest("Invalid host header.".to_string()).into_response()
}

fn host_is_trusted(trusted_hosts: &[String], host_header: &str) -> bool {
    if trusted_hosts.is_empty() || trusted_hosts.iter().any(|entry| entry == "*") {
        return true;
    }
    let host = strip_port(host_header.trim()).to_ascii_lowercase();
    trusted_hosts.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        match entry.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")),
            None => entry == host,
        }
    })
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host
            .split_once(']')
            .map(|(address, _)| address.trim_start_matches('['))
            .unwrap_or(host);
    }
    host.rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|character| character.is_ascii_digit()))
        .map(|(name, _)| name)
        .unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::{host_is_trusted, strip_port};

    fn hosts(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|entry| entry.to_string()).collect()
    }

    #[test]
    fn strips_ports() {
        assert_eq!(strip_port("localhost:8000"), "localhost");
        assert_eq!(strip_port("api.example.com"), "api.example.com");
        assert_eq!(strip_port("[::1]:8000"), "::1");
    }

    #[test]
    fn matches_exact_and_wildcard_hosts() {
        let trusted = hosts(&["localhost", "*.example.com"]);
        assert!(host_is_trusted(&trusted, "localhost:8000"));
        assert!(host_is_trusted(&trusted, "api.example.com"));
        assert!(!host_is_trusted(&trusted, "example.com"));
        assert!(!host_is_trusted(&trusted, "evil.test"));
    }

    #[test]
    fn empty_or_star_list_allows_everything() {
        assert!(host_is_trusted(&[], "anything"));
        assert!(host_is_trusted(&hosts(&["*"]), "anything"));
    }
}
