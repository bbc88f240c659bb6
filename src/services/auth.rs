//! Handshake credential extraction.
//!
//! Issuing and verifying credentials is another system's job. The hub only
//! requires that one is present, from the `token` query parameter or an
//! `Authorization: Bearer` header, and treats it as an opaque identity.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("authentication credential required")]
    MissingCredential,
}

impl crate::frame::ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::MissingCredential => "E_AUTHENTICATION",
        }
    }
}

/// Opaque authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Pick the handshake credential, preferring the query parameter.
///
/// # Errors
///
/// Returns `MissingCredential` when neither source carries a non-empty value.
pub fn credential_from(query_token: Option<&str>, headers: &HeaderMap) -> Result<Credential, AuthError> {
    let from_query = query_token.map(str::trim).filter(|t| !t.is_empty());
    let from_header = || {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    };
    from_query
        .or_else(from_header)
        .map(|t| Credential(t.to_owned()))
        .ok_or(AuthError::MissingCredential)
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
