use axum::http::{header::AUTHORIZATION, HeaderMap};
use hmac::{Hmac, Mac};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::Sha256;

use crate::{
    error::{AppError, AppResult},
    state::AppState,
};

const SUPABASE_AUDIENCE: &str = "authenticated";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct SupabaseClaims {
    sub: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|token| !token.is_empty())
}

fn decode_user_id(token: &str, secret: &str) -> AppResult<String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[SUPABASE_AUDIENCE]);
    let data = jsonwebtoken::decode::<SupabaseClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|error| {
        tracing::debug!(error = %error, "Rejected access token");
        AppError::Unauthorized("Invalid or expired access token.".to_string())
    })?;
    let sub = data.claims.sub.trim().to_string();
    if sub.is_empty() {
        return Err(AppError::Unauthorized(
            "Access token has no subject.".to_string(),
        ));
    }
    Ok(sub)
}

/// Resolves the calling user from the Supabase access token.
///
/// With dev overrides on, an `x-user-id` header is accepted in place of a token.
pub async fn require_user_id(state: &AppState, headers: &HeaderMap) -> AppResult<String> {
    if state.config.auth_dev_overrides_enabled() {
        if let Some(user_id) = headers
            .get("x-user-id")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            return Ok(user_id.to_string());
        }
    }

    let token = bearer_token(headers).ok_or_else(|| {
        AppError::Unauthorized("Missing bearer access token.".to_string())
    })?;
    let secret = state
        .config
        .supabase_jwt_secret
        .as_deref()
        .filter(|secret| !secret.trim().is_empty())
        .ok_or_else(|| {
            AppError::Dependency("SUPABASE_JWT_SECRET is not configured.".to_string())
        })?;
    decode_user_id(token, secret)
}

/// Shared-secret check for internal cron endpoints. Production refuses to run
/// them without a configured key.
pub fn require_internal_api_key(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let provided = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let expected = state
        .config
        .internal_api_key
        .as_deref()
        .map(str::trim)
        .unwrap_or_default();

    if state.config.is_production() && expected.is_empty() {
        return Err(AppError::Dependency(
            "INTERNAL_API_KEY must be set in production to run autopay.".to_string(),
        ));
    }
    if !expected.is_empty() && !keys_match(provided, expected) {
        return Err(AppError::Unauthorized(
            "Invalid or missing API key.".to_string(),
        ));
    }
    Ok(())
}

/// Compares MACs of both values so the time taken does not depend on where
/// the keys differ, or on the length of the provided one.
fn keys_match(provided: &str, expected: &str) -> bool {
    let digest = |value: &str| {
        HmacSha256::new_from_slice(expected.as_bytes()).map(|mut mac| {
            mac.update(value.as_bytes());
            mac
        })
    };
    match (digest(provided), digest(expected)) {
        (Ok(candidate), Ok(reference)) => candidate
            .verify_slice(&reference.finalize().into_bytes())
            .is_ok(),
        _ => false,
    }
}


#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn extracts_bearer_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer  "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn internal_keys_must_match_exactly() {
        assert!(keys_match("internal-key", "internal-key"));
        assert!(!keys_match("internal-kez", "internal-key"));
        assert!(!keys_match("internal", "internal-key"));
        assert!(!keys_match("internal-key-and-more", "internal-key"));
        assert!(!keys_match("", "internal-key"));
    }

    #[test]
    fn decodes_subject_for_the_authenticated_audience() {
        let token = test_tokens::signed("user-1", SUPABASE_AUDIENCE, "secret");
        assert_eq!(decode_user_id(&token, "secret").unwrap(), "user-1");
        assert!(matches!(
            decode_user_id(&token, "other-secret"),
            Err(AppError::Unauthorized(_))
        ));
        let wrong_audience = test_tokens::signed("user-1", "anon", "secret");
        assert!(matches!(
            decode_user_id(&wrong_audience, "secret"),
            Err(AppError::Unauthorized(_))
        ));
    }
}
