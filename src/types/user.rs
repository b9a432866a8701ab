//! Registered users

use super::order::UserToken;

/// A registered user
///
/// The password is never stored in clear; `password_hash` is whatever the
/// HTTP layer derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub login: String,
    pub password_hash: String,
    pub token: UserToken,
}
