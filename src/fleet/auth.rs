//! Admin capability check.
//!
//! Sessions live outside this service; all the API needs is a yes/no
//! "is this caller an admin" per request. `AccessPolicy` answers it and
//! `Caller` carries the answer into handlers.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::{HeaderMap, header, request::Parts};

use super::api::SharedState;
use crate::errors::FleetError;

/// Header accepted as an alternative to `Authorization: Bearer`.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

pub trait AccessPolicy: Send + Sync {
    fn is_admin(&self, headers: &HeaderMap) -> bool;
}

/// Grants admin to requests presenting the configured token. With no token
/// configured nobody is admin.
pub struct TokenPolicy {
    admin_token: Option<String>,
}

impl TokenPolicy {
    pub fn new(admin_token: Option<String>) -> Self {
        Self {
            admin_token: admin_token.filter(|t| !t.is_empty()),
        }
    }
}

impl AccessPolicy for TokenPolicy {
    fn is_admin(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.admin_token.as_deref() else {
            return false;
        };
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        let direct = headers
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        [bearer, direct]
            .into_iter()
            .flatten()
            .any(|presented| constant_time_eq(presented.trim().as_bytes(), expected.as_bytes()))
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Who is calling, as far as the API cares.
#[derive(Debug, Clone, Copy)]
pub struct Caller {
    pub is_admin: bool,
}

impl Caller {
    pub fn require_admin(&self) -> Result<(), FleetError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(FleetError::Forbidden)
        }
    }
}

impl FromRequestParts<SharedState> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        Ok(Caller {
            is_admin: state.policy.is_admin(&parts.headers),
        })
    }
}
