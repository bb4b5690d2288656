//! Caller identity. The fronting identity provider authenticates the request
//! and forwards the stable uid in `X-User-Id`; the role comes from the
//! caller's role record, never from the request.

use std::future::{ready, Ready};

use actix_web::{dev::Payload, http::header::HeaderMap, FromRequest, HttpRequest};
use regex::Regex;

use crate::error::{AppError, AppResult};
use crate::models::{User, UserRole};

pub const USER_ID_HEADER: &str = "X-User-Id";

/// Unverified uid taken from the request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller(pub String);

impl Caller {
    pub fn from_headers(headers: &HeaderMap) -> AppResult<Self> {
        let raw = headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::Unauthenticated("missing caller identity".to_string()))?
            .to_str()
            .map_err(|_| {
                AppError::Unauthenticated("caller identity is not valid text".to_string())
            })?
            .trim();

        let re = Regex::new(r"^[A-Za-z0-9_-]{1,128}$")
            .map_err(|e| AppError::Internal(e.to_string()))?;
        if !re.is_match(raw) {
            return Err(AppError::Unauthenticated("malformed caller identity".to_string()));
        }
        Ok(Caller(raw.to_string()))
    }

    pub fn uid(&self) -> &str {
        &self.0
    }
}

impl FromRequest for Caller {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Caller::from_headers(req.headers()))
    }
}

/// A caller resolved against its role record.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    record: User,
}

impl Principal {
    pub fn uid(&self) -> &str {
        &self.record.uid
    }

    pub fn display_name(&self) -> Option<&str> {
        self.record.display_name.as_deref()
    }

    pub fn user(&self) -> &User {
        &self.record
    }

    pub fn is_admin(&self) -> bool {
        self.record.role == UserRole::Admin
    }

    pub fn require_admin(&self) -> AppResult<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(format!(
                "user '{}' lacks the admin capability",
                self.record.uid
            )))
        }
    }

    /// Owners may act on their own records; admins on anyone's.
    pub fn require_owner_or_admin(&self, owner_uid: &str) -> AppResult<()> {
        if self.is_admin() || self.uid() == owner_uid {
            Ok(())
        } else {
            Err(AppError::PermissionDenied(
                "record belongs to another user".to_string(),
            ))
        }
    }
}

impl From<User> for Principal {
    fn from(record: User) -> Self {
        Self { record }
    }
}
