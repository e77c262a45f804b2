//! Error handling - RFC 7807 responses for the management plane and
//! `{error, message}` bodies for the gateway surface.

use std::fmt;

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use turnstile_core::{BlockError, ConfigError, GatewayError, QuotaError, StoreError};
use turnstile_shared::{ErrorResponse, GatewayErrorBody};

/// Management-plane error type.
#[derive(Debug)]
pub enum AppError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    BadRequest(String),
    Validation(String),
    Unavailable(String),
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::Forbidden(msg) => write!(f, "Forbidden: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Validation(msg) => write!(f, "Validation failed: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Unavailable: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let error = match self {
            AppError::Unauthorized(detail) => ErrorResponse::unauthorized(detail),
            AppError::Forbidden(detail) => ErrorResponse::forbidden(detail),
            AppError::NotFound(detail) => ErrorResponse::not_found(detail),
            AppError::BadRequest(detail) => ErrorResponse::bad_request(detail),
            AppError::Validation(detail) => ErrorResponse::unprocessable(detail),
            AppError::Unavailable(detail) => ErrorResponse::service_unavailable(detail),
            AppError::Internal(detail) => {
                tracing::error!("Internal error: {}", detail);
                ErrorResponse::internal_error()
            }
        };

        HttpResponse::build(self.status_code()).json(error)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connection(msg) => AppError::Unavailable(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<QuotaError> for AppError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Config(e) => e.into(),
            QuotaError::Store(e) => e.into(),
        }
    }
}

impl From<BlockError> for AppError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::NotBlocked(_) => AppError::NotFound(err.to_string()),
            BlockError::InvalidDuration | BlockError::MissingActor => {
                AppError::BadRequest(err.to_string())
            }
            BlockError::Store(e) => e.into(),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NodeNotFound(_) | GatewayError::RuleNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            GatewayError::Config(e) => e.into(),
            GatewayError::Store(e) => e.into(),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}

/// Result type alias for handlers.
pub type AppResult<T> = Result<T, AppError>;

/// Failure on the proxied gateway surface.
#[derive(Debug)]
pub enum ProxyError {
    Gateway(GatewayError),
    /// Every attempt to reach an upstream node failed.
    Upstream(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Gateway(e) => write!(f, "{}", e),
            ProxyError::Upstream(msg) => write!(f, "Upstream request failed: {}", msg),
        }
    }
}

impl From<GatewayError> for ProxyError {
    fn from(err: GatewayError) -> Self {
        ProxyError::Gateway(err)
    }
}

impl ProxyError {
    fn code(&self) -> &'static str {
        match self {
            ProxyError::Gateway(GatewayError::UnknownApiKey) => "unauthorized",
            ProxyError::Gateway(GatewayError::AccessDenied { .. }) => "forbidden",
            ProxyError::Gateway(GatewayError::NoHealthyNode { .. }) => "no_healthy_node",
            ProxyError::Gateway(GatewayError::InvalidPath { .. }) => "bad_request",
            ProxyError::Gateway(_) => "gateway_error",
            ProxyError::Upstream(_) => "bad_gateway",
        }
    }
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Gateway(GatewayError::UnknownApiKey) => StatusCode::UNAUTHORIZED,
            ProxyError::Gateway(GatewayError::AccessDenied { .. }) => StatusCode::FORBIDDEN,
            ProxyError::Gateway(GatewayError::NoHealthyNode { .. }) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Gateway(GatewayError::InvalidPath { .. }) => StatusCode::BAD_REQUEST,
            ProxyError::Gateway(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if self.status_code().is_server_error() {
            tracing::error!(error = %self, "Gateway request failed");
        }
        HttpResponse::build(self.status_code())
            .json(GatewayErrorBody::new(self.code(), self.to_string()))
    }
}
