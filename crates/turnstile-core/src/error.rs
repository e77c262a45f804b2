//! Domain-level error types.
//!
//! Deny outcomes (rate limited, quota exceeded, blocked) are values, not
//! errors. Everything here is either an infrastructure fault or a request the
//! caller has to fix.

use thiserror::Error;

/// Shared store failures (Redis or in-memory backends).
///
/// The rate limiter and quota manager recover from these locally by failing
/// open; they are never surfaced to API clients.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store operation failed: {0}")]
    Operation(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Invalid configuration, rejected at setup time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Unknown quota period: {0}")]
    UnknownPeriod(String),

    #[error("Unknown rate limit strategy: {0}")]
    UnknownStrategy(String),

    #[error("Unknown load balancing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("Invalid routing pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

/// Gateway routing failures.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Unknown API key")]
    UnknownApiKey,

    #[error("API key lacks permission '{permission}'")]
    AccessDenied { permission: String },

    #[error("Invalid request path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("No healthy node available for {endpoint}")]
    NoHealthyNode { endpoint: String },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Routing rule not found: {0}")]
    RuleNotFound(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Block registry failures on management-plane calls.
#[derive(Debug, Clone, Error)]
pub enum BlockError {
    #[error("IP {0} is not blocked")]
    NotBlocked(String),

    #[error("Block duration must be positive")]
    InvalidDuration,

    #[error("Unblock requires an actor identity")]
    MissingActor,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Quota management failures on management-plane calls.
#[derive(Debug, Clone, Error)]
pub enum QuotaError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
