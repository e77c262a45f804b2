//! # Turnstile Shared
//!
//! Wire types shared by the server and its clients: denial bodies, the
//! `X-RateLimit-*` header names and the management-plane DTOs.

pub mod dto;
pub mod headers;
pub mod response;

pub use response::{
    ApiResponse, BlockedBody, ErrorResponse, GatewayErrorBody, QuotaExceededBody,
    RateLimitExceededBody,
};
