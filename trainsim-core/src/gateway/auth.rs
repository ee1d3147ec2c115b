//! Gateway authentication.

use super::{GatewayConfig, TokenGrant};
use crate::auth::{Principal, Role};

/// Maps bearer tokens to principals.
#[derive(Debug, Clone)]
pub struct GatewayAuth {
    grants: Vec<TokenGrant>,
}

impl GatewayAuth {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.auth_tokens.clone())
    }

    pub fn new(grants: Vec<TokenGrant>) -> Self {
        Self { grants }
    }

    /// Resolve the principal for an optional bearer token.
    ///
    /// In open mode (no tokens configured) every request runs as an
    /// anonymous engineer.
    pub fn authenticate(&self, token: Option<&str>) -> Option<Principal> {
        if self.is_open_mode() {
            return Some(Principal::new("anonymous", Role::Engineer));
        }
        let token = token?;
        self.grants
            .iter()
            .find(|g| g.token == token)
            .map(|g| Principal::new(g.principal.clone(), g.role))
    }

    /// Extract the token from an `Authorization: Bearer <token>` value.
    pub fn bearer(header: &str) -> Option<&str> {
        let (scheme, token) = header.split_once(' ')?;
        scheme
            .eq_ignore_ascii_case("bearer")
            .then(|| token.trim())
            .filter(|t| !t.is_empty())
    }

    pub fn token_count(&self) -> usize {
        self.grants.len()
    }

    pub fn is_open_mode(&self) -> bool {
        self.grants.is_empty()
    }
}
