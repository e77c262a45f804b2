//! Proxied gateway surface: route to a node, forward, release.

use actix_web::{
    HttpRequest, HttpResponse,
    http::StatusCode,
    http::header::{HeaderName, HeaderValue},
    web,
};
use turnstile_core::GatewayError;
use turnstile_core::domain::RouteTarget;
use turnstile_shared::headers::REQUEST_ID;

use crate::middleware::admission::gateway_route;
use crate::middleware::{Principal, ProxyError};
use crate::observability::RequestId;
use crate::state::AppState;

pub const GATEWAY_PREFIX: &str = "/gateway";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Set by the proxy itself.
const REPLACED: [&str; 4] = ["host", "content-length", "x-forwarded-for", "x-request-id"];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.contains(&name)
}

/// ANY /gateway/{tail}
///
/// Each attempt routes afresh, so a retry can land on another node. The
/// node's connection is released whatever the outcome.
pub async fn proxy(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
    principal: Principal,
    request_id: RequestId,
) -> Result<HttpResponse, ProxyError> {
    let api_key = principal
        .api_key_id
        .as_deref()
        .ok_or(GatewayError::UnknownApiKey)?;

    let mut endpoint = gateway_route(req.path(), GATEWAY_PREFIX);
    if !req.query_string().is_empty() {
        endpoint.push('?');
        endpoint.push_str(req.query_string());
    }
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .map_err(|e| ProxyError::Upstream(e.to_string()))?;

    let mut attempt = 0u32;
    loop {
        let target = state
            .router
            .route(api_key, &endpoint, req.method().as_str())
            .await?;

        let outcome = forward(
            &state.http,
            &req,
            &principal,
            &request_id,
            method.clone(),
            &target,
            &body,
        )
        .await;

        if let Err(e) = state.router.release(&target.node_id).await {
            tracing::debug!(node_id = %target.node_id, error = %e, "Node gone before release");
        }

        match outcome {
            Ok(response) => return Ok(response),
            Err(reason) if attempt < target.retries => {
                attempt += 1;
                tracing::warn!(
                    node_id = %target.node_id,
                    attempt,
                    error = %reason,
                    "Upstream attempt failed, retrying"
                );
            }
            Err(reason) => return Err(ProxyError::Upstream(reason)),
        }
    }
}

/// One upstream round trip. 502, 503 and 504 count as failures so the
/// caller can retry elsewhere.
async fn forward(
    client: &reqwest::Client,
    req: &HttpRequest,
    principal: &Principal,
    request_id: &RequestId,
    method: reqwest::Method,
    target: &RouteTarget,
    body: &web::Bytes,
) -> Result<HttpResponse, String> {
    let mut upstream = client
        .request(method, &target.target_url)
        .timeout(target.timeout);
    for (name, value) in req.headers() {
        let name = name.as_str();
        if is_hop_by_hop(name) || REPLACED.contains(&name) {
            continue;
        }
        upstream = upstream.header(name, value.as_bytes());
    }

    let response = upstream
        .header(REQUEST_ID, request_id.as_str())
        .header("x-forwarded-for", principal.ip.as_str())
        .body(body.to_vec())
        .send()
        .await
        .map_err(|e| format!("node {}: {}", target.node_id, e))?;

    let status = response.status().as_u16();
    if matches!(status, 502..=504) {
        return Err(format!("node {} answered {}", target.node_id, status));
    }

    let mut builder = HttpResponse::build(
        StatusCode::from_u16(status).map_err(|e| format!("node {}: {}", target.node_id, e))?,
    );
    for (name, value) in response.headers() {
        if is_hop_by_hop(name.as_str()) || name.as_str() == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder.append_header((name, value));
        }
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| format!("node {}: {}", target.node_id, e))?;
    Ok(builder.body(bytes.to_vec()))
}
