use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use crate::routes::ApiError;
use crate::state::ControllerRecord;

/// Bearer token from the `Authorization` header. Who issued it and what it
/// entitles the caller to is a collaborator concern; this service only asks
/// the [`Authorizer`] whether the token may act on a given controller.
#[derive(Clone, Debug)]
pub struct AuthToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for AuthToken
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        extract_token(&parts.headers)
            .map(AuthToken)
            .ok_or(ApiError::Unauthorized)
    }
}

impl AuthToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(|token| token.to_owned())
}

/// Opaque authorization gate: is this caller allowed to act on this
/// controller? Swappable so deployments can plug in their own policy service.
pub trait Authorizer: Send + Sync {
    fn allows(&self, caller: &str, controller: &ControllerRecord) -> bool;
}

/// Default gate: the token that registered a controller owns it.
pub struct OwnerTokenAuthorizer;

impl Authorizer for OwnerTokenAuthorizer {
    fn allows(&self, caller: &str, controller: &ControllerRecord) -> bool {
        !caller.is_empty() && caller == controller.owner_token
    }
}
