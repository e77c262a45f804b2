//! Response payloads: the success envelope, RFC 7807 problem details for the
//! management plane, and the denial bodies returned by the admission layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Success envelope for management-plane responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

/// RFC 7807 Problem Details.
///
/// See: https://datatracker.ietf.org/doc/html/rfc7807
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,

    pub title: String,

    pub status: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Request ID for correlating with server logs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            error_type: "about:blank".to_string(),
            title: title.into(),
            status,
            detail: None,
            request_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, "Bad Request").with_detail(detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(401, "Authentication Required").with_detail(detail)
    }

    pub fn forbidden(detail: impl Into<String>) -> Self {
        Self::new(403, "Forbidden").with_detail(detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(404, "Not Found").with_detail(detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(422, "Unprocessable Entity").with_detail(detail)
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(503, "Service Unavailable").with_detail(detail)
    }
}

/// 429 body for a short-window rate-limit denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceededBody {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: u64,
}

/// 429 body for an exhausted quota period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaExceededBody {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub overage: u64,
    pub retry_after: u64,
}

/// 429 body for a blocked source IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedBody {
    pub reason: String,
    pub retry_after: u64,
    pub threat_level: String,
}

/// Gateway failures (401, 403, 502, 503).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayErrorBody {
    pub error: String,
    pub message: String,
}

impl GatewayErrorBody {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn denial_bodies_use_camel_case() {
        let body = QuotaExceededBody {
            limit: 10,
            remaining: 0,
            reset_at: Utc.with_ymd_and_hms(2024, 5, 14, 12, 1, 0).unwrap(),
            overage: 1,
            retry_after: 55,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["resetAt"], "2024-05-14T12:01:00Z");
        assert_eq!(json["retryAfter"], 55);
        assert!(json.get("retry_after").is_none());
    }

    #[test]
    fn problem_details_skip_empty_fields() {
        let json = serde_json::to_value(ErrorResponse::not_found("no such node")).unwrap();
        assert_eq!(json["type"], "about:blank");
        assert_eq!(json["status"], 404);
        assert!(json.get("request_id").is_none());
    }
}
