use crate::metrics_defs::AUTH_REJECTED;
use crate::secrets::SecretResolver;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use shared::counter;
use std::sync::Arc;
use subtle::ConstantTimeEq;

pub const BASIC_AUTH_REALM: &str = "Basic realm=\"Authentication Required\"";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Extracts HTTP Basic credentials from the `Authorization` header.
pub fn parse_basic_auth(headers: &HeaderMap) -> Option<Credentials> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Checks inbound credentials against the function password kept in the
/// secret store. Fails closed: anything that prevents verification denies
/// access.
pub struct CredentialGate {
    resolver: Arc<SecretResolver>,
    username: String,
    password_secret: String,
}

impl CredentialGate {
    pub fn new(resolver: Arc<SecretResolver>, service_name: &str) -> Self {
        CredentialGate {
            resolver,
            username: service_name.to_string(),
            password_secret: format!("{service_name}-run-function-password"),
        }
    }

    pub async fn verify(&self, username: &str, password: &str) -> bool {
        if username != self.username {
            return false;
        }

        match self.resolver.fetch_secret(&self.password_secret).await {
            Ok(expected) => bool::from(password.as_bytes().ct_eq(expected.as_bytes())),
            Err(err) => {
                tracing::error!(error = %err, "Could not fetch function password, denying access");
                false
            }
        }
    }

    /// Verifies the request headers. Requests without usable Basic
    /// credentials are rejected before the secret store is consulted.
    pub async fn authorize(&self, headers: &HeaderMap) -> bool {
        let authorized = match parse_basic_auth(headers) {
            Some(credentials) => {
                self.verify(&credentials.username, &credentials.password)
                    .await
            }
            None => false,
        };

        if !authorized {
            counter!(AUTH_REJECTED).increment(1);
        }
        authorized
    }
}
