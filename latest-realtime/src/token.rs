//! Bearer credential verification (HS256 JWT).
//!
//! ```text
//! base64url(header) . base64url(claims) . base64url(HMAC-SHA256(secret, header.claims))
//! ```
//!
//! The [`CredentialVerifier`] trait is the seam the authenticator consumes;
//! [`Hs256Verifier`] is the production implementation.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

/// What a token must have been issued for.
#[derive(Debug, Clone, Copy)]
pub struct VerifyParams<'a> {
    pub issuer: &'a str,
    pub audience: &'a str,
    pub secret: &'a [u8],
}

/// `aud` may be a single string or an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    pub fn contains(&self, audience: &str) -> bool {
        match self {
            Audience::One(aud) => aud == audience,
            Audience::Many(auds) => auds.iter().any(|aud| aud == audience),
        }
    }
}

/// Decoded token payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<Audience>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Header {
    alg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    typ: Option<String>,
}

/// Credential verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid signing key")]
    InvalidKey,
    #[error("signature mismatch")]
    BadSignature,
    #[error("unexpected issuer")]
    WrongIssuer,
    #[error("unexpected audience")]
    WrongAudience,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token encoding failed: {0}")]
    Encoding(String),
}

/// Validates a bearer credential against issuer, audience and secret.
pub trait CredentialVerifier: Send + Sync {
    fn verify(&self, token: &str, params: &VerifyParams<'_>) -> Result<Claims, TokenError>;
}

/// HMAC-SHA256 JWT verifier.
#[derive(Debug, Clone, Default)]
pub struct Hs256Verifier {
    /// Clock skew tolerated on `exp` / `nbf`, in seconds.
    leeway_secs: u64,
}

impl Hs256Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_leeway(leeway_secs: u64) -> Self {
        Self { leeway_secs }
    }

    fn check_times(&self, claims: &Claims, now: u64) -> Result<(), TokenError> {
        if let Some(exp) = claims.exp {
            if now >= exp.saturating_add(self.leeway_secs) {
                return Err(TokenError::Expired);
            }
        }
        if let Some(nbf) = claims.nbf {
            if now.saturating_add(self.leeway_secs) < nbf {
                return Err(TokenError::NotYetValid);
            }
        }
        Ok(())
    }
}

impl CredentialVerifier for Hs256Verifier {
    fn verify(&self, token: &str, params: &VerifyParams<'_>) -> Result<Claims, TokenError> {
        let mut segments = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(signature_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(TokenError::Malformed);
        };

        let header: Header = decode_segment(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlgorithm(header.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = HmacSha256::new_from_slice(params.secret).map_err(|_| TokenError::InvalidKey)?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        // Constant-time comparison.
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = decode_segment(claims_b64)?;
        if claims.iss.as_deref() != Some(params.issuer) {
            return Err(TokenError::WrongIssuer);
        }
        if !claims
            .aud
            .as_ref()
            .is_some_and(|aud| aud.contains(params.audience))
        {
            return Err(TokenError::WrongAudience);
        }
        self.check_times(&claims, unix_now())?;

        Ok(claims)
    }
}

/// Issue an HS256 token for `claims`.
pub fn sign_hs256<T: Serialize>(claims: &T, secret: &[u8]) -> Result<String, TokenError> {
    let header = Header {
        alg: ALGORITHM.to_string(),
        typ: Some("JWT".to_string()),
    };
    let header_b64 = encode_segment(&header)?;
    let claims_b64 = encode_segment(claims)?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{header_b64}.{claims_b64}.{signature}"))
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode_segment<T: Serialize + ?Sized>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value).map_err(|e| TokenError::Encoding(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_segment<T: DeserializeOwned>(segment: &str) -> Result<T, TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| TokenError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SECRET: &[u8] = b"couple-secret";

    fn params() -> VerifyParams<'static> {
        VerifyParams {
            issuer: "latest-os",
            audience: "realtime",
            secret: SECRET,
        }
    }

    fn valid_claims() -> serde_json::Value {
        json!({
            "sub": "user-a",
            "role": "partner",
            "iss": "latest-os",
            "aud": "realtime",
            "exp": unix_now() + 600,
        })
    }

    #[test]
    fn test_verify_valid_token() {
        let token = sign_hs256(&valid_claims(), SECRET).unwrap();
        let claims = Hs256Verifier::new().verify(&token, &params()).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("user-a"));
        assert_eq!(claims.role.as_deref(), Some("partner"));
    }

    #[test]
    fn test_audience_array() {
        let mut claims = valid_claims();
        claims["aud"] = json!(["web", "realtime"]);
        let token = sign_hs256(&claims, SECRET).unwrap();
        assert!(Hs256Verifier::new().verify(&token, &params()).is_ok());
    }

    #[test]
    fn test_wrong_secret() {
        let token = sign_hs256(&valid_claims(), b"other-secret").unwrap();
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_claims() {
        let token = sign_hs256(&valid_claims(), SECRET).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        let mut forged = valid_claims();
        forged["role"] = json!("admin");
        let forged_b64 = encode_segment(&forged).unwrap();
        parts[1] = &forged_b64;
        let tampered = parts.join(".");

        assert_eq!(
            Hs256Verifier::new().verify(&tampered, &params()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_wrong_issuer_and_audience() {
        let mut claims = valid_claims();
        claims["iss"] = json!("someone-else");
        let token = sign_hs256(&claims, SECRET).unwrap();
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::WrongIssuer)
        );

        let mut claims = valid_claims();
        claims["aud"] = json!("billing");
        let token = sign_hs256(&claims, SECRET).unwrap();
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::WrongAudience)
        );

        let mut claims = valid_claims();
        claims.as_object_mut().unwrap().remove("aud");
        let token = sign_hs256(&claims, SECRET).unwrap();
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::WrongAudience)
        );
    }

    #[test]
    fn test_expired_and_not_yet_valid() {
        let mut claims = valid_claims();
        claims["exp"] = json!(unix_now() - 10);
        let token = sign_hs256(&claims, SECRET).unwrap();
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::Expired)
        );
        // Leeway admits small skew.
        assert!(Hs256Verifier::with_leeway(60).verify(&token, &params()).is_ok());

        let mut claims = valid_claims();
        claims["nbf"] = json!(unix_now() + 3600);
        let token = sign_hs256(&claims, SECRET).unwrap();
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::NotYetValid)
        );
    }

    #[test]
    fn test_malformed_inputs() {
        let verifier = Hs256Verifier::new();
        for token in ["", "abc", "a.b", "a.b.c.d", "!!.??.##"] {
            assert_eq!(verifier.verify(token, &params()), Err(TokenError::Malformed), "{token}");
        }
    }

    #[test]
    fn test_alg_none_rejected() {
        let header = encode_segment(&json!({ "alg": "none" })).unwrap();
        let claims = encode_segment(&valid_claims()).unwrap();
        let token = format!("{header}.{claims}.");
        assert_eq!(
            Hs256Verifier::new().verify(&token, &params()),
            Err(TokenError::UnsupportedAlgorithm("none".into()))
        );
    }
}
