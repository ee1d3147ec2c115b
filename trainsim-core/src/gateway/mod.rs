//! # HTTP Gateway
//!
//! JSON REST surface over the [`RunController`](crate::controller::RunController):
//! run creation and control, pollable run and metric reads, and model
//! registration. Callers authenticate with bearer tokens that map to
//! principals.

mod auth;
mod server;

pub use auth::GatewayAuth;
pub use server::{ApiError, GatewayState, SharedState, router as gateway_router, run as run_gateway};

use serde::{Deserialize, Serialize};

use crate::auth::Role;

/// A bearer token and the principal it authenticates as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    pub principal: String,
    pub role: Role,
}

/// Configuration for the HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Accepted tokens. Empty means open mode.
    #[serde(default)]
    pub auth_tokens: Vec<TokenGrant>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            auth_tokens: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
