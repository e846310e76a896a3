//! Caller identity.
//!
//! Authentication happens upstream. A trusted proxy forwards the user's id in
//! `X-Stage-User` and marks operators with `X-Stage-Admin: true`.

use crate::{errors::Error, types::UserId};
use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};
use tracing::trace;
use utoipa::ToSchema;

pub const USER_HEADER: &str = "x-stage-user";
pub const ADMIN_HEADER: &str = "x-stage-admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CurrentUser {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub is_admin: bool,
}

impl CurrentUser {
    pub fn require_admin(&self) -> Result<(), Error> {
        if self.is_admin {
            Ok(())
        } else {
            Err(Error::Forbidden {
                message: "operator access required".to_string(),
            })
        }
    }

    /// Whether this caller may see resources owned by `owner`
    pub fn can_access(&self, owner: UserId) -> bool {
        self.is_admin || self.id == owner
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<UserId>().ok())
            .ok_or(Error::Unauthorized)?;

        let is_admin = parts
            .headers
            .get(ADMIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("true"));

        trace!(user_id = %id, is_admin, "Resolved caller from proxy headers");
        Ok(CurrentUser { id, is_admin })
    }
}
