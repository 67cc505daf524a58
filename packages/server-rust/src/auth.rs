//! Credential verification and tenant identity extraction.
//!
//! Pure: no pool or database access. A credential is a JWS compact token
//! (`header.payload.signature`) signed with the process-wide shared
//! secret; the payload's `sub` claim becomes the [`TenantIdentity`] the
//! rest of the request runs as.

use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rowfence_core::{Claims, TenantIdentity};

/// Credential verification failures. Caller-facing; never retried.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Not a structurally valid token, or required claims are missing.
    #[error("credential is malformed")]
    Malformed,
    /// Signature does not verify against the configured secret.
    #[error("credential signature is invalid")]
    InvalidSignature,
    /// The credential's expiry has passed.
    #[error("credential is expired")]
    Expired,
}

/// Shared-secret verification settings.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// HMAC-SHA256 secret shared with the token issuer.
    pub secret: String,
    /// Clock-skew allowance applied to expiry checks.
    pub leeway: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            leeway: Duration::from_secs(30),
        }
    }
}

/// Verifies bearer credentials and extracts the tenant identity.
pub struct IdentityResolver {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = config.leeway.as_secs();
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            validation,
        }
    }

    /// Verifies `credential` and extracts its tenant identity.
    ///
    /// # Errors
    ///
    /// [`AuthError::Expired`] when past expiry, [`AuthError::InvalidSignature`]
    /// when the signature does not verify, [`AuthError::Malformed`] for
    /// anything that is not a well-formed token with a non-empty subject.
    pub fn resolve(&self, credential: &str) -> Result<TenantIdentity, AuthError> {
        let data = decode::<Claims>(credential, &self.decoding, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Malformed,
            }
        })?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Malformed);
        }
        Ok(TenantIdentity::new(data.claims.sub))
    }

    /// Issues a credential for `tenant`, valid for `ttl`. Used by tests
    /// and operational tooling; production issuance lives elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the token cannot be signed.
    pub fn issue(&self, tenant: &TenantIdentity, ttl: Duration) -> anyhow::Result<String> {
        let now = u64::try_from(chrono::Utc::now().timestamp())?;
        let claims = Claims {
            sub: tenant.as_str().to_string(),
            role: Some("authenticated".to_string()),
            exp: now + ttl.as_secs(),
            iat: Some(now),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}
