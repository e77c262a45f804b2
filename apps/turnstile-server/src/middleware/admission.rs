//! Admission middleware: threat check, rate limit and quota in front of the
//! gateway scope.

use std::future::{Ready, ready};
use std::rc::Rc;
use std::time::Instant;

use actix_web::{
    Error, HttpResponse,
    body::EitherBody,
    ResponseError,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderMap, HeaderName, HeaderValue},
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::LocalBoxFuture;
use turnstile_core::domain::{RequestPath, Tier, UsageEvent};
use turnstile_core::services::{Admission, AdmissionRequest, QuotaSubject, Verdict};
use turnstile_shared::headers::{
    RATE_LIMIT_LIMIT, RATE_LIMIT_OVERAGE, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET, RETRY_AFTER,
};
use turnstile_shared::{BlockedBody, ErrorResponse, QuotaExceededBody, RateLimitExceededBody};

use super::error::ProxyError;
use super::principal::Principal;
use crate::state::AppState;

/// Admission middleware factory.
///
/// `prefix` is the scope the middleware wraps. The remainder of the path is
/// normalized; limits and quotas are keyed on the resource it belongs to,
/// threat analysis on the full normalized path.
pub struct AdmissionGate {
    state: AppState,
    prefix: Rc<str>,
}

impl AdmissionGate {
    pub fn new(state: AppState, prefix: &str) -> Self {
        Self {
            state,
            prefix: Rc::from(prefix),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for AdmissionGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AdmissionGateService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(AdmissionGateService {
            service: Rc::new(service),
            state: self.state.clone(),
            prefix: self.prefix.clone(),
        }))
    }
}

pub struct AdmissionGateService<S> {
    service: Rc<S>,
    state: AppState,
    prefix: Rc<str>,
}

impl<S, B> Service<ServiceRequest> for AdmissionGateService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let state = self.state.clone();
        let raw_route = gateway_route(req.path(), &self.prefix);

        Box::pin(async move {
            let path = match RequestPath::parse(&raw_route) {
                Ok(path) => path,
                Err(e) => {
                    tracing::info!(route = %raw_route, error = %e, "Malformed gateway path");
                    let response = ProxyError::from(e).error_response();
                    let (http_req, _payload) = req.into_parts();
                    return Ok(ServiceResponse::new(http_req, response).map_into_right_body());
                }
            };
            let route = path.path();
            let resource = state.router.permissions().resource_for(&path);

            let principal = Principal::from_http(req.request(), &state.trusted_proxies);
            let method = req.method().to_string();
            let quota = quota_subject(&state, &principal).await;

            let request = AdmissionRequest {
                identity: principal.identity(),
                user_agent: principal.user_agent.clone(),
                route: route.clone(),
                resource: resource.clone(),
                quota: quota.clone(),
            };
            let admission = state.admission.admit(&request).await;
            let headers = limit_headers(&admission);

            if !admission.is_admitted() {
                tracing::info!(
                    ip = %principal.ip,
                    route = %route,
                    verdict = ?admission.verdict,
                    retry_after = admission.retry_after(),
                    "Request denied"
                );
                let response = denial_response(&admission, &headers);
                let (http_req, _payload) = req.into_parts();
                return Ok(ServiceResponse::new(http_req, response).map_into_right_body());
            }

            let started = Instant::now();
            let mut res = service.call(req).await?;
            apply_headers(res.headers_mut(), &headers);

            if let Some(subject) = quota {
                state.quotas.record_usage(UsageEvent {
                    cost: state
                        .quotas
                        .request_cost(subject.tier, admission.quota.as_ref()),
                    subject: subject.subject,
                    api_key_id: subject.api_key_id,
                    ip: principal.ip,
                    endpoint: resource,
                    method,
                    status_code: res.status().as_u16(),
                    response_time_ms: u64::try_from(started.elapsed().as_millis())
                        .unwrap_or(u64::MAX),
                    timestamp: Utc::now(),
                });
            }

            Ok(res.map_into_left_body())
        })
    }
}

/// Path below `prefix`, always starting with `/`.
pub fn gateway_route(path: &str, prefix: &str) -> String {
    let rest = path.strip_prefix(prefix).unwrap_or(path);
    if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{}", rest)
    }
}

/// Quota identity: the API key's subject and tier, else the user id on the
/// free tier. Anonymous callers have no quota.
async fn quota_subject(state: &AppState, principal: &Principal) -> Option<QuotaSubject> {
    if let Some(key_id) = &principal.api_key_id {
        match state.api_keys.find(key_id).await {
            Ok(Some(key)) => {
                return Some(QuotaSubject {
                    subject: key.subject,
                    api_key_id: Some(key.id),
                    tier: key.tier,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "API key lookup failed, continuing without key");
            }
        }
    }

    principal.user_id.as_ref().map(|user| QuotaSubject {
        subject: user.clone(),
        api_key_id: None,
        tier: Tier::Free,
    })
}

fn format_instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn limit_headers(admission: &Admission) -> Vec<(&'static str, String)> {
    let mut headers = Vec::with_capacity(5);
    if let Some(h) = admission.headers() {
        headers.push((RATE_LIMIT_LIMIT, h.limit.to_string()));
        headers.push((RATE_LIMIT_REMAINING, h.remaining.to_string()));
        headers.push((RATE_LIMIT_RESET, format_instant(h.reset_at)));
        headers.push((RATE_LIMIT_OVERAGE, h.overage.to_string()));
    }
    if !admission.is_admitted() {
        headers.push((RETRY_AFTER, admission.retry_after().to_string()));
    }
    headers
}

fn apply_headers(target: &mut HeaderMap, headers: &[(&'static str, String)]) {
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        target.insert(name, value);
    }
}

fn denial_response(admission: &Admission, headers: &[(&'static str, String)]) -> HttpResponse {
    let mut builder = HttpResponse::TooManyRequests();
    for (name, value) in headers {
        builder.insert_header((*name, value.as_str()));
    }
    let retry_after = admission.retry_after();

    match (admission.verdict, &admission.rate_limit, &admission.quota) {
        (Verdict::Blocked, _, _) => builder.json(BlockedBody {
            reason: admission.threat.reason.clone(),
            retry_after,
            threat_level: admission.threat.threat_level.as_str().to_string(),
        }),
        (Verdict::RateLimited, Some(decision), _) => builder.json(RateLimitExceededBody {
            limit: u64::from(decision.limit),
            remaining: u64::from(decision.remaining),
            reset_at: decision.reset_at,
            retry_after,
        }),
        (Verdict::QuotaExceeded, _, Some(decision)) => builder.json(QuotaExceededBody {
            limit: decision.limit,
            remaining: decision.remaining,
            reset_at: decision.reset_at,
            overage: decision.overage,
            retry_after,
        }),
        _ => builder.json(ErrorResponse::new(429, "Too Many Requests")),
    }
}
