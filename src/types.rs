use std::fmt;

use derive_more::{Display, From, FromStr, Into};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use time::OffsetDateTime;

/// Short-lived bearer credential sent as `Authorization: Bearer <token>`.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for AccessToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// Longer-lived credential exchanged for a new [`AccessToken`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct RefreshToken(String);

impl RefreshToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RefreshToken {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl fmt::Debug for RefreshToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RefreshToken(***)")
    }
}

/// Backend user identifier (integer primary key).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, FromStr, From, Into,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Account role; decides which part of the application a user lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Patient,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Patient => "patient",
        }
    }

    /// Route the UI navigates to after login.
    #[must_use]
    pub fn landing_path(self) -> &'static str {
        match self {
            Self::Admin => "/admin",
            Self::Doctor => "/doctor",
            Self::Patient => "/patient",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Profile returned by the current-user endpoint.
///
/// Fields the client does not model are kept in `extra` so the serialized
/// profile round-trips unchanged through the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UserProfile {
    pub id: UserId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub date_joined: Option<OffsetDateTime>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl UserProfile {
    #[must_use]
    pub fn new(id: u64, role: Role) -> Self {
        Self {
            id: UserId(id),
            role,
            email: None,
            username: None,
            date_joined: None,
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Persisted authentication state.
///
/// Expiry is not tracked here: the server decides whether a token is still valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Session {
    pub access_token: AccessToken,
    pub refresh_token: Option<RefreshToken>,
    pub user: Option<UserProfile>,
}

impl Session {
    #[must_use]
    pub fn new(access_token: impl Into<AccessToken>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            user: None,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<RefreshToken>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.user.as_ref().map(|u| u.role)
    }

    /// Where the UI should send this user; `/login` when no profile is known.
    #[must_use]
    pub fn landing_path(&self) -> &'static str {
        self.role().map_or("/login", Role::landing_path)
    }
}

/// Token pair returned by the login and token-refresh endpoints.
///
/// The refresh endpoint only includes `refresh` when it rotates the token.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct TokenPair {
    pub(crate) access: AccessToken,
    #[serde(default)]
    pub(crate) refresh: Option<RefreshToken>,
}
