use std::fmt;

use serde::Serialize;

use crate::client::AuthenticatedHttpClient;
use crate::error::Error;
use crate::store::SessionStore;
use crate::types::{AccessToken, Role, Session, TokenPair, UserProfile};
use crate::validation::{self, ValidationErrors};

/// Email/password pair posted to the login endpoint.
///
/// `Debug` never prints the password.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    /// Run the login form checks.
    ///
    /// # Errors
    ///
    /// Returns the failing fields and their messages.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        errors.check("email", validation::validate_email(&self.email));
        errors.check("password", validation::validate_password(&self.password));
        errors.into_result()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

/// New account posted to the register endpoint.
#[derive(Clone, Serialize)]
#[non_exhaustive]
pub struct Registration {
    pub username: String,
    pub email: String,
    pub password: String,
    /// Omitted to let the backend apply its default role.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl Registration {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
            password: password.into(),
            role: None,
        }
    }

    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Run the registration form checks.
    ///
    /// # Errors
    ///
    /// Returns the failing fields and their messages.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        errors.check("username", validation::validate_required(&self.username));
        errors.check("email", validation::validate_email(&self.email));
        errors.check("password", validation::validate_password(&self.password));
        errors.into_result()
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.email.clone(), self.password.clone())
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("username", &self.username)
            .field("email", &self.email)
            .field("password", &"***")
            .field("role", &self.role)
            .finish()
    }
}

impl<S: SessionStore> AuthenticatedHttpClient<S> {
    /// Log in and persist the resulting session.
    ///
    /// Posts the credentials, fetches the current user with the new access
    /// token, then writes access token, refresh token and profile to the
    /// store in one `set`.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] before any network call if the credentials fail the form checks
    /// - [`Error::Http`] if the backend rejects the credentials (including `401`)
    /// - [`Error::Network`], [`Error::Decode`], [`Error::Store`] as usual
    #[tracing::instrument(name = "login", skip_all, fields(email = %credentials.email))]
    pub async fn login(&self, credentials: &Credentials) -> Result<Session, Error> {
        credentials.validate()?;

        let url = self.config().endpoint(self.config().login_path())?;
        let response = self.http().post(url).json(credentials).send().await?;
        let tokens: TokenPair = Self::settle(response).await?.json()?;

        let user = self.fetch_profile(&tokens.access).await?;

        let mut session = Session::new(tokens.access).with_user(user);
        session.refresh_token = tokens.refresh;
        self.replace_session(Some(&session)).await?;

        if let Some(user) = &session.user {
            tracing::info!(user_id = %user.id, role = %user.role, "login successful");
        }
        Ok(session)
    }

    /// Create an account, then log in with the same credentials.
    ///
    /// # Errors
    ///
    /// Same as [`login`](Self::login); a rejected registration surfaces as
    /// [`Error::Http`] with the backend's field errors.
    #[tracing::instrument(name = "register", skip_all, fields(email = %registration.email))]
    pub async fn register(&self, registration: &Registration) -> Result<Session, Error> {
        registration.validate()?;

        let url = self.config().endpoint(self.config().register_path())?;
        let response = self.http().post(url).json(registration).send().await?;
        Self::settle(response).await?;
        tracing::info!("registration accepted");

        self.login(&registration.credentials()).await
    }

    /// Fetch the profile of the logged-in user through the authenticated client.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn current_user(&self) -> Result<UserProfile, Error> {
        self.get_json(self.config().current_user_path()).await
    }

    /// Clear every session slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store could not be cleared.
    pub async fn logout(&self) -> Result<(), Error> {
        self.replace_session(None).await?;
        tracing::info!("logged out");
        Ok(())
    }

    /// Current-user request made with a token that is not persisted yet.
    async fn fetch_profile(&self, access: &AccessToken) -> Result<UserProfile, Error> {
        let url = self.config().endpoint(self.config().current_user_path())?;
        let response = self
            .http()
            .get(url)
            .bearer_auth(access.as_str())
            .send()
            .await?;
        Self::settle(response).await?.json()
    }
}
