//! Connection authenticator: origin allow-list + bearer credential.
//!
//! Runs during the WebSocket upgrade, before any room join is possible:
//!
//! ```text
//! handshake ──► configured? ──► origin allowed? ──► token present? ──► token valid?
//!                   │                 │                   │                 │
//!          ServerMisconfigured  OriginRejected       MissingToken     Unauthorized
//! ```
//!
//! A missing issuer, audience or secret is reported once at construction
//! and then fails every attempt; nothing is ever admitted unauthenticated.

use std::fmt;
use std::sync::Arc;

use crate::token::{CredentialVerifier, Hs256Verifier, VerifyParams};

pub const ENV_ISSUER: &str = "WS_JWT_ISSUER";
pub const ENV_AUDIENCE: &str = "WS_JWT_AUDIENCE";
pub const ENV_SECRET: &str = "WS_JWT_SECRET";
pub const ENV_ALLOWED_ORIGINS: &str = "ALLOWED_ORIGINS";

pub const ADMIN_ROLE: &str = "admin";

/// Raw authentication settings as read from the environment.
#[derive(Clone, Default)]
pub struct AuthSettings {
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub secret: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl AuthSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            issuer: non_empty(ENV_ISSUER),
            audience: non_empty(ENV_AUDIENCE),
            secret: non_empty(ENV_SECRET),
            allowed_origins: lookup(ENV_ALLOWED_ORIGINS)
                .map(|list| parse_origins(&list))
                .unwrap_or_default(),
        }
    }

    /// Names of the required variables that are absent.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.issuer.is_none() {
            missing.push(ENV_ISSUER);
        }
        if self.audience.is_none() {
            missing.push(ENV_AUDIENCE);
        }
        if self.secret.is_none() {
            missing.push(ENV_SECRET);
        }
        missing
    }
}

impl fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSettings")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("allowed_origins", &self.allowed_origins)
            .finish()
    }
}

/// Split a comma separated origin list.
pub fn parse_origins(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect()
}

/// Complete configuration, only constructible when nothing is missing.
#[derive(Clone)]
struct AuthConfig {
    issuer: String,
    audience: String,
    secret: Vec<u8>,
    allowed_origins: Vec<String>,
}

enum AuthState {
    Ready(AuthConfig),
    Misconfigured { missing: Vec<&'static str> },
}

/// Handshake data relevant to admission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub origin: Option<String>,
    /// Token from the auth payload (the `token` query parameter).
    pub auth_token: Option<String>,
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
}

impl Handshake {
    /// Extract the bearer token; the auth payload wins over the header.
    pub fn bearer_token(&self) -> Option<&str> {
        if let Some(token) = self.auth_token.as_deref().filter(|t| !t.is_empty()) {
            let token = token.strip_prefix("Bearer ").unwrap_or(token);
            return Some(token).filter(|t| !t.is_empty());
        }
        self.authorization
            .as_deref()
            .and_then(|header| header.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }
}

/// Identity attached to an admitted connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub subject: Option<String>,
    pub role: Option<String>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role.as_deref() == Some(ADMIN_ROLE)
    }
}

/// Handshake rejection reasons.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("origin rejected")]
    OriginRejected,
    #[error("missing token")]
    MissingToken,
    #[error("unauthorized")]
    Unauthorized,
    #[error("server configuration error: authentication variables missing")]
    ServerMisconfigured,
}

impl AuthError {
    /// HTTP status returned on the rejected upgrade.
    pub fn status_code(&self) -> u16 {
        match self {
            AuthError::OriginRejected => 403,
            AuthError::MissingToken | AuthError::Unauthorized => 401,
            AuthError::ServerMisconfigured => 500,
        }
    }
}

/// Admits or rejects connection handshakes.
pub struct Authenticator {
    state: AuthState,
    verifier: Arc<dyn CredentialVerifier>,
}

impl Authenticator {
    /// Build from settings with the HS256 verifier.
    pub fn new(settings: AuthSettings) -> Self {
        Self::with_verifier(settings, Arc::new(Hs256Verifier::new()))
    }

    pub fn from_env() -> Self {
        Self::new(AuthSettings::from_env())
    }

    pub fn with_verifier(settings: AuthSettings, verifier: Arc<dyn CredentialVerifier>) -> Self {
        let state = match (settings.issuer, settings.audience, settings.secret) {
            (Some(issuer), Some(audience), Some(secret)) => {
                if settings.allowed_origins.is_empty() {
                    log::warn!(
                        "{ENV_ALLOWED_ORIGINS} is empty: every realtime connection will be rejected"
                    );
                }
                AuthState::Ready(AuthConfig {
                    issuer,
                    audience,
                    secret: secret.into_bytes(),
                    allowed_origins: settings.allowed_origins,
                })
            }
            (issuer, audience, secret) => {
                let missing = AuthSettings {
                    issuer,
                    audience,
                    secret,
                    allowed_origins: Vec::new(),
                }
                .missing();
                log::error!(
                    "Realtime authentication is MISCONFIGURED (missing: {}); all connections will be refused",
                    missing.join(", ")
                );
                AuthState::Misconfigured { missing }
            }
        };
        Self { state, verifier }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, AuthState::Ready(_))
    }

    /// Missing configuration variables, empty when ready.
    pub fn missing_settings(&self) -> &[&'static str] {
        match &self.state {
            AuthState::Ready(_) => &[],
            AuthState::Misconfigured { missing } => missing,
        }
    }

    /// Validate a handshake and return the decoded identity.
    pub fn authenticate(&self, handshake: &Handshake) -> Result<Identity, AuthError> {
        let config = match &self.state {
            AuthState::Ready(config) => config,
            AuthState::Misconfigured { .. } => return Err(AuthError::ServerMisconfigured),
        };

        let origin = handshake.origin.as_deref().ok_or(AuthError::OriginRejected)?;
        if !config.allowed_origins.iter().any(|allowed| allowed == origin) {
            return Err(AuthError::OriginRejected);
        }

        let token = handshake.bearer_token().ok_or(AuthError::MissingToken)?;

        let params = VerifyParams {
            issuer: &config.issuer,
            audience: &config.audience,
            secret: &config.secret,
        };
        let claims = self.verifier.verify(token, &params).map_err(|e| {
            log::debug!("Credential rejected: {e}");
            AuthError::Unauthorized
        })?;

        Ok(Identity {
            subject: claims.sub,
            role: claims.role,
        })
    }
}
