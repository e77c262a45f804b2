//! Management-plane authentication.
//!
//! [`OperatorGate`] wraps the admin scope: the caller presents `X-Api-Key`
//! and the key must carry the `admin` permission. Handlers take the
//! resolved [`Operator`] as an extractor.

use std::future::{Ready, ready};
use std::rc::Rc;

use actix_web::{
    Error, FromRequest, HttpMessage, HttpRequest, ResponseError,
    body::EitherBody,
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
};
use futures::future::LocalBoxFuture;
use turnstile_core::ports::ApiKeyDirectory;
use turnstile_shared::headers::API_KEY;

use super::error::AppError;
use super::principal::header_value;
use crate::state::AppState;

/// Authenticated management-plane caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub key_id: String,
    /// Recorded as the actor on audited changes.
    pub subject: String,
}

impl Operator {
    /// Resolve `key_id` to an operator, or the error to answer with.
    pub async fn authenticate(
        keys: &dyn ApiKeyDirectory,
        key_id: Option<&str>,
    ) -> Result<Self, AppError> {
        let key_id =
            key_id.ok_or_else(|| AppError::Unauthorized(format!("{} header required", API_KEY)))?;

        let key = keys
            .find(key_id)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Unknown API key".to_string()))?;

        if !key.is_operator() {
            return Err(AppError::Forbidden(
                "API key lacks the admin permission".to_string(),
            ));
        }

        Ok(Self {
            key_id: key.id,
            subject: key.subject,
        })
    }
}

impl FromRequest for Operator {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Operator>()
                .cloned()
                .ok_or_else(|| AppError::Unauthorized("Operator not authenticated".to_string())),
        )
    }
}

/// Rejects management calls that do not come from an operator key.
pub struct OperatorGate {
    state: AppState,
}

impl OperatorGate {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

impl<S, B> Transform<S, ServiceRequest> for OperatorGate
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = OperatorGateService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(OperatorGateService {
            service: Rc::new(service),
            state: self.state.clone(),
        }))
    }
}

pub struct OperatorGateService<S> {
    service: Rc<S>,
    state: AppState,
}

impl<S, B> Service<ServiceRequest> for OperatorGateService<S>
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

        Box::pin(async move {
            let key_id = header_value(req.request(), API_KEY);
            match Operator::authenticate(state.api_keys.as_ref(), key_id.as_deref()).await {
                Ok(operator) => {
                    tracing::debug!(
                        operator = %operator.subject,
                        method = %req.method(),
                        path = %req.path(),
                        "Management call"
                    );
                    req.extensions_mut().insert(operator);
                    let res = service.call(req).await?;
                    Ok(res.map_into_left_body())
                }
                Err(e) => {
                    tracing::warn!(
                        path = %req.path(),
                        error = %e,
                        "Management call rejected"
                    );
                    let response = e.error_response();
                    let (http_req, _payload) = req.into_parts();
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                }
            }
        })
    }
}
