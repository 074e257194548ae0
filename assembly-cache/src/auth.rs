//! Resolution of connect-frame tokens to users.
//!
//! The WebSocket server never takes a user id from the wire. Clients present
//! a token; an [`Authenticate`] implementation decides which user it belongs
//! to. A connect frame without a token is the anonymous user.

use std::collections::HashMap;

use thiserror::Error;

use crate::restriction::{UserId, ANONYMOUS_USER};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,

    #[error("authentication backend failed: {0}")]
    Backend(String),
}

pub trait Authenticate: Send + Sync {
    /// User behind `token`. `None` is the anonymous user.
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError>;
}

/// Fixed token table.
impl Authenticate for HashMap<String, UserId> {
    fn authenticate(&self, token: Option<&str>) -> Result<UserId, AuthError> {
        match token {
            None => Ok(ANONYMOUS_USER),
            Some(token) => self.get(token).copied().ok_or(AuthError::InvalidToken),
        }
    }
}
