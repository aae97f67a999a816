use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::booking::{Actor, Role};
use crate::error::Error;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Caller identity from the gateway-injected headers.
#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
        };
        let user_id = header(USER_ID_HEADER)
            .and_then(|v| v.parse().ok())
            .ok_or(Error::Unauthenticated)?;
        let role: Role = header(USER_ROLE_HEADER)
            .and_then(|v| v.parse().ok())
            .ok_or(Error::Unauthenticated)?;
        Ok(Actor { user_id, role })
    }
}
