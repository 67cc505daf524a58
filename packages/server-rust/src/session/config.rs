//! Session-layer configuration types.

use std::time::Duration;

/// Connection pool sizing and backpressure settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of simultaneously leased connections.
    pub capacity: usize,
    /// Maximum time an `acquire` waits for a free connection before
    /// reporting exhaustion.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 5,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Names the binder uses when activating the row policy context.
///
/// Defaults follow the PostgREST convention the row policies read:
/// an `authenticated` role plus `request.jwt.claim.*` session variables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Database role assumed while a tenant context is bound.
    pub authenticated_role: String,
    /// Session variable carrying the tenant identity.
    pub sub_claim_key: String,
    /// Session variable carrying the role claim some policies re-check.
    pub role_claim_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            authenticated_role: "authenticated".to_string(),
            sub_claim_key: "request.jwt.claim.sub".to_string(),
            role_claim_key: "request.jwt.claim.role".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.capacity, 5);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.authenticated_role, "authenticated");
        assert_eq!(config.sub_claim_key, "request.jwt.claim.sub");
        assert_eq!(config.role_claim_key, "request.jwt.claim.role");
    }
}
