use axum::{
    extract::{Request, State},
    http::header::HOST,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::AppError, state::AppState};

fn host_without_port(raw: &str) -> &str {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    raw.rsplit_once(':').map_or(raw, |(host, _)| host)
}

pub(crate) fn host_is_trusted(trusted: &[String], host: &str) -> bool {
    let host = host_without_port(host).to_ascii_lowercase();
    trusted.iter().any(|pattern| {
        let pattern = pattern.trim().to_ascii_lowercase();
        if pattern == "*" {
            return true;
        }
        match pattern.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{suffix}")),
            None => host == pattern,
        }
    })
}

/// Rejects requests whose Host header is not in `TRUSTED_HOSTS`.
pub async fn enforce_trusted_hosts(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let trusted = &state.config.trusted_hosts;
    if trusted.is_empty() {
        return next.run(request).await;
    }
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .or_else(|| request.uri().host().map(ToOwned::to_owned));

    match host {
        Some(host) if host_is_trusted(trusted, &host) => next.run(request).await,
        other => {
            tracing::warn!(host = ?other, "Rejected request for untrusted host");
            AppError::InvalidArgument("Invalid host header.".to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_and_wildcard_hosts() {
        let trusted = vec!["localhost".to_string(), "*.casaora.co".to_string()];
        assert!(host_is_trusted(&trusted, "localhost:8000"));
        assert!(host_is_trusted(&trusted, "api.casaora.co"));
        assert!(!host_is_trusted(&trusted, "casaora.co.evil.com"));
        assert!(!host_is_trusted(&trusted, "example.com"));
        assert!(host_is_trusted(&["*".to_string()], "anything"));
        assert!(host_is_trusted(&["::1".to_string()], "[::1]:8000"));
    }
}
