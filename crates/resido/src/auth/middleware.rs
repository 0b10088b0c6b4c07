use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, HOST, USER_AGENT};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use super::authenticator::{Authenticated, Authenticator};
use super::context::RequestContext;
use super::principal::Principal;
use crate::api::ApiError;
use crate::ids::RequestId;
use crate::telemetry;
use crate::tenancy::TenantResolver;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone)]
pub struct ContextState {
    pub resolver: Arc<dyn TenantResolver>,
    pub authenticator: Arc<Authenticator>,
}

/// Resolves the tenant from the host, binds it, authenticates the bearer
/// token and inserts a [`RequestContext`] into the request extensions. The
/// tenant binding is held until the response has been produced.
pub async fn attach_request_context(
    State(state): State<ContextState>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<RequestId>().ok())
        .unwrap_or_default();
    let span = telemetry::request_span(request_id, request.method().as_str(), request.uri().path());

    let mut response = async move {
        let host = host_of(&request);
        let tenant = match state
            .resolver
            .resolve_for_request(&host, request.uri().path())
        {
            Ok(tenant) => tenant,
            Err(err) => return ApiError::from(err).into_response(),
        };
        tracing::Span::current().record("tenant", tenant.schema.as_str());
        let scope = state.resolver.bind(tenant);

        let authenticated = match bearer_token(request.headers()) {
            Some(token) => match state
                .authenticator
                .authenticate(scope.context(), &token)
                .await
            {
                Ok(authenticated) => authenticated,
                Err(err) => {
                    tracing::info!(error = %err, "bearer authentication failed");
                    return ApiError::from(err).into_response();
                }
            },
            None => Authenticated {
                principal: Principal::Anonymous,
                token_type: None,
            },
        };

        let headers = request.headers();
        let ctx = RequestContext::new(scope.context().clone(), authenticated.principal, request_id)
            .with_token_type(authenticated.token_type)
            .with_client(client_ip(headers), header_string(headers, USER_AGENT.as_str()));
        request.extensions_mut().insert(ctx);

        let response = next.run(request).await;
        drop(scope);
        response
    }
    .instrument(span)
    .await;

    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn host_of(request: &Request) -> String {
    request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().host().map(str::to_string))
        .unwrap_or_default()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = raw.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() {
        Some(token.trim().to_string())
    } else {
        None
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-forwarded-for")
        .and_then(|raw| raw.split(',').next().map(|ip| ip.trim().to_string()))
        .filter(|ip| !ip.is_empty())
        .or_else(|| header_string(headers, "x-real-ip"))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
