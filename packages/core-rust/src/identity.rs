//! Tenant identity and credential claim payloads.
//!
//! A [`TenantIdentity`] is the opaque value the rest of the system keys
//! row visibility on. It is extracted exactly once per request from a
//! verified credential and never re-derived afterwards.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier for the tenant a request acts on behalf of.
///
/// Wraps the credential's subject claim verbatim. The database casts the
/// value as needed (e.g. to `uuid` inside RLS policies); application code
/// only ever compares it for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantIdentity(String);

impl TenantIdentity {
    /// Wraps a subject claim value as a tenant identity.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self(subject.into())
    }

    /// The raw subject claim value, as it will be handed to the database.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantIdentity {
    fn from(subject: &str) -> Self {
        Self::new(subject)
    }
}

/// JWT payload carried by the bearer credential.
///
/// Only the claims the resolver actually reads are modeled. Timestamps are
/// seconds since the Unix epoch, as usual for `exp`/`iat`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the tenant identity this credential acts for.
    pub sub: String,
    /// Database role the session will assume. Informational at the HTTP
    /// boundary; the binder uses its configured role, not this field.
    #[serde(default)]
    pub role: Option<String>,
    /// Expiry, seconds since epoch.
    pub exp: u64,
    /// Issued-at, seconds since epoch.
    #[serde(default)]
    pub iat: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_opaque_and_comparable() {
        let a = TenantIdentity::new("7c9e6679-7425-40de-944b-e07fc1f90ae7");
        let b = TenantIdentity::from("7c9e6679-7425-40de-944b-e07fc1f90ae7");
        let c = TenantIdentity::new("other");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "7c9e6679-7425-40de-944b-e07fc1f90ae7");
    }

    #[test]
    fn identity_serializes_transparently() {
        let id = TenantIdentity::new("alice");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice\"");

        let back: TenantIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn claims_roundtrip_with_optional_fields_absent() {
        let json = r#"{"sub":"alice","exp":4102444800}"#;
        let claims: Claims = serde_json::from_str(json).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp, 4_102_444_800);
        assert!(claims.role.is_none());
        assert!(claims.iat.is_none());
    }
}
