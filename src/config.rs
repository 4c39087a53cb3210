use std::time::Duration;

use url::Url;

use crate::error::Error;

const DEFAULT_LOGIN_PATH: &str = "accounts/auth/login/";
const DEFAULT_REFRESH_PATH: &str = "accounts/auth/token/refresh/";
const DEFAULT_REGISTER_PATH: &str = "accounts/auth/register/";
const DEFAULT_CURRENT_USER_PATH: &str = "accounts/me/";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// API client configuration.
///
/// The base URL is the only required field. Endpoint paths are relative to
/// it and default to the backend's account routes.
///
/// The accounts app only routes `auth/register/`, `auth/login/` and
/// `auth/token/refresh/`. It has no current-user route, so the
/// `accounts/me/` default must either be added on the server or replaced
/// with [`with_current_user_path`](Self::with_current_user_path) (for example a
/// role-specific profile endpoint). Until then [`login`] fails while fetching
/// the profile, after the tokens were issued.
///
/// [`login`]: crate::AuthenticatedHttpClient::login
///
/// ```rust,ignore
/// use medical_api_client::ClientConfig;
///
/// let config = ClientConfig::new("https://clinic.example.com/api".parse()?)
///     .with_current_user_path("accounts/profile/");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ClientConfig {
    pub(crate) base_url: Url,
    pub(crate) login_path: String,
    pub(crate) refresh_path: String,
    pub(crate) register_path: String,
    pub(crate) current_user_path: String,
    pub(crate) timeout: Option<Duration>,
}

impl ClientConfig {
    /// Create a configuration for the given API origin.
    ///
    /// A trailing `/` is added to the base path so relative endpoints resolve
    /// below it instead of replacing its last segment.
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            login_path: DEFAULT_LOGIN_PATH.into(),
            refresh_path: DEFAULT_REFRESH_PATH.into(),
            register_path: DEFAULT_REGISTER_PATH.into(),
            current_user_path: DEFAULT_CURRENT_USER_PATH.into(),
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `MEDICAL_API_BASE_URL`: API origin, e.g. `https://clinic.example.com/api/`
    ///
    /// # Optional env vars
    /// - `MEDICAL_API_LOGIN_PATH`
    /// - `MEDICAL_API_REFRESH_PATH`
    /// - `MEDICAL_API_REGISTER_PATH`
    /// - `MEDICAL_API_CURRENT_USER_PATH`
    /// - `MEDICAL_API_TIMEOUT_SECS`: request timeout; `0` disables it
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the base URL is missing or any value is invalid.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let base_url = lookup("MEDICAL_API_BASE_URL")
            .ok_or_else(|| Error::Config("MEDICAL_API_BASE_URL is required".into()))?;
        let base_url: Url = base_url
            .parse()
            .map_err(|e| Error::Config(format!("MEDICAL_API_BASE_URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(
                "MEDICAL_API_BASE_URL must be an http(s) URL".into(),
            ));
        }

        let mut config = Self::new(base_url);

        if let Some(path) = lookup("MEDICAL_API_LOGIN_PATH") {
            config = config.with_login_path(path);
        }
        if let Some(path) = lookup("MEDICAL_API_REFRESH_PATH") {
            config = config.with_refresh_path(path);
        }
        if let Some(path) = lookup("MEDICAL_API_REGISTER_PATH") {
            config = config.with_register_path(path);
        }
        if let Some(path) = lookup("MEDICAL_API_CURRENT_USER_PATH") {
            config = config.with_current_user_path(path);
        }
        if let Some(secs) = lookup("MEDICAL_API_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("MEDICAL_API_TIMEOUT_SECS: {e}")))?;
            config = config.with_timeout((secs > 0).then_some(Duration::from_secs(secs)));
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    #[must_use]
    pub fn with_register_path(mut self, path: impl Into<String>) -> Self {
        self.register_path = path.into();
        self
    }

    /// Endpoint returning the logged-in user's profile (`id`, `role`, ...).
    #[must_use]
    pub fn with_current_user_path(mut self, path: impl Into<String>) -> Self {
        self.current_user_path = path.into();
        self
    }

    /// Per-request timeout; `None` waits indefinitely.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn refresh_path(&self) -> &str {
        &self.refresh_path
    }

    #[must_use]
    pub fn register_path(&self) -> &str {
        &self.register_path
    }

    #[must_use]
    pub fn current_user_path(&self) -> &str {
        &self.current_user_path
    }

    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolve a path against the base URL.
    ///
    /// Leading slashes are ignored so `/doctor/profile/` and `doctor/profile/`
    /// name the same endpoint. Paths that resolve to another origin are
    /// rejected so the bearer token never leaves the configured API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the path does not resolve below the base origin.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        let url = self
            .base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::InvalidRequest(format!("{path}: {e}")))?;
        if url.origin() != self.base_url.origin() {
            return Err(Error::InvalidRequest(format!(
                "{path} resolves outside {}",
                self.base_url
            )));
        }
        Ok(url)
    }
}
