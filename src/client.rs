use std::fmt;
use std::sync::Arc;

use futures::future::FutureExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{StatusCode, multipart};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::config::ClientConfig;
use crate::error::{Error, ErrorBody, RefreshError};
use crate::refresh::RefreshCoordinator;
use crate::store::{SessionStore, StoreError};
use crate::types::{AccessToken, RefreshToken, Session, TokenPair};

/// HTTP verbs the API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => Self::GET,
            Method::Post => Self::POST,
            Method::Put => Self::PUT,
            Method::Patch => Self::PATCH,
            Method::Delete => Self::DELETE,
        }
    }
}

/// Request payload.
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Sent with `Content-Type: application/json`.
    Json(JsonValue),
    /// Sent as `multipart/form-data`; the transport sets the content type and boundary.
    Multipart(MultipartBody),
}

impl RequestBody {
    /// Serialize any value into a JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the value cannot be represented as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, Error> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| Error::InvalidRequest(format!("unserializable body: {e}")))
    }
}

/// Replayable multipart form.
///
/// Kept as plain data rather than a `reqwest` form so the same body can be
/// sent again after a token refresh.
#[derive(Debug, Clone, Default)]
pub struct MultipartBody {
    parts: Vec<MultipartPart>,
}

#[derive(Debug, Clone)]
enum MultipartPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        bytes: Vec<u8>,
    },
}

impl MultipartBody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(MultipartPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        self.parts.push(MultipartPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime: None,
            bytes: bytes.into(),
        });
        self
    }

    /// Add a file part with an explicit MIME type (checked when the request is built).
    #[must_use]
    pub fn file_with_mime(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        self.parts.push(MultipartPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime: Some(mime.into()),
            bytes: bytes.into(),
        });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn to_form(&self) -> Result<multipart::Form, Error> {
        self.parts
            .iter()
            .try_fold(multipart::Form::new(), |form, part| -> Result<_, Error> {
                Ok(match part {
                    MultipartPart::Text { name, value } => form.text(name.clone(), value.clone()),
                    MultipartPart::File {
                        name,
                        file_name,
                        mime,
                        bytes,
                    } => {
                        let mut file =
                            multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                        if let Some(mime) = mime {
                            file = file
                                .mime_str(mime)
                                .map_err(|e| Error::InvalidRequest(format!("{mime}: {e}")))?;
                        }
                        form.part(name.clone(), file)
                    }
                })
            })
    }
}

/// An HTTP call captured so it can be replayed once after a token refresh.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PendingRequest {
    pub method: Method,
    /// Path relative to the configured base URL.
    pub path: String,
    /// Extra headers merged over the defaults.
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
}

impl PendingRequest {
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    status: u16,
    bytes: Vec<u8>,
}

impl ResponseBody {
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// `true` for bodiless responses such as `204 No Content`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    /// Deserialize the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

/// REST client that authenticates every request from the session store.
///
/// On a `401` the client refreshes the access token once, sharing a single
/// in-flight refresh between concurrent failures, then replays the original
/// request once. A second `401` ends the session.
///
/// Cloning is cheap; clones share the store and the refresh state.
pub struct AuthenticatedHttpClient<S> {
    inner: Arc<Inner<S>>,
}

struct Inner<S> {
    config: ClientConfig,
    http: reqwest::Client,
    store: S,
    refresh: RefreshCoordinator,
    // Session generation, bumped by every login and logout. Held while a
    // refresh writes back so it cannot undo one that happened meanwhile.
    generation: tokio::sync::Mutex<u64>,
}

// Manual Clone: avoid derive adding an `S: Clone` bound.
impl<S> Clone for AuthenticatedHttpClient<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: SessionStore> AuthenticatedHttpClient<S> {
    /// Create a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: ClientConfig, store: S) -> Result<Self, Error> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self::with_http_client(config, store, http))
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(config: ClientConfig, store: S, http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                http,
                store,
                refresh: RefreshCoordinator::default(),
                generation: tokio::sync::Mutex::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The session store; UI layers read the session from here instead of copying tokens.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Send a request and settle it, refreshing the session once on `401`.
    ///
    /// # Errors
    ///
    /// - [`Error::Network`] if no response was received
    /// - [`Error::Http`] for any non-2xx other than a recoverable `401`
    /// - [`Error::SessionExpired`] if the refresh failed or the retry was rejected
    /// - [`Error::NoRefreshToken`] if a refresh was needed but none is persisted
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
        extra_headers: Option<HeaderMap>,
    ) -> Result<ResponseBody, Error> {
        let mut request = PendingRequest::new(method, path);
        request.body = body;
        if let Some(headers) = extra_headers {
            request.headers = headers;
        }
        self.execute(&request).await
    }

    /// Same as [`request`](Self::request) for an already captured request.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    #[tracing::instrument(
        name = "api_request",
        skip_all,
        fields(method = %request.method, path = %request.path)
    )]
    pub async fn execute(&self, request: &PendingRequest) -> Result<ResponseBody, Error> {
        let (response, sent_with) = self.dispatch(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::settle(response).await;
        }

        tracing::warn!("request unauthorized, refreshing session");
        self.recover_session(sent_with.as_ref()).await?;

        let (retry, _) = self.dispatch(request).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("retry rejected after token refresh");
            self.discard_session().await;
            return Err(Error::SessionExpired);
        }
        Self::settle(retry).await
    }

    /// Send a request and deserialize the JSON response.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request); additionally [`Error::Decode`] if the
    /// body does not match `T`.
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<RequestBody>,
    ) -> Result<T, Error> {
        self.request(method, path, body, None).await?.json()
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get(&self, path: &str) -> Result<ResponseBody, Error> {
        self.request(Method::Get, path, None, None).await
    }

    /// # Errors
    ///
    /// See [`request_json`](Self::request_json).
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, Error> {
        self.request_json(Method::Get, path, None).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, Error> {
        let body = RequestBody::json(body)?;
        self.request(Method::Post, path, Some(body), None).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn put<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, Error> {
        let body = RequestBody::json(body)?;
        self.request(Method::Put, path, Some(body), None).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ResponseBody, Error> {
        let body = RequestBody::json(body)?;
        self.request(Method::Patch, path, Some(body), None).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn delete(&self, path: &str) -> Result<ResponseBody, Error> {
        self.request(Method::Delete, path, None, None).await
    }

    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post_multipart(
        &self,
        path: &str,
        form: MultipartBody,
    ) -> Result<ResponseBody, Error> {
        self.request(Method::Post, path, Some(RequestBody::Multipart(form)), None)
            .await
    }

    /// Exchange the persisted refresh token for a new access token.
    ///
    /// Joins a refresh that is already in flight instead of starting another.
    ///
    /// # Errors
    ///
    /// - [`RefreshError::NoRefreshToken`] without any network call if none is persisted
    /// - [`RefreshError::RefreshFailed`] on network failure or non-2xx, after which the session is
    ///   cleared, or when a login or logout replaced the session while the exchange was in flight
    /// - [`RefreshError::Store`] if the new session could not be persisted
    pub async fn refresh(&self) -> Result<Session, RefreshError> {
        let client = self.clone();
        self.inner
            .refresh
            .run(move || async move { client.perform_refresh().await }.boxed())
            .await
    }

    async fn recover_session(&self, sent_with: Option<&AccessToken>) -> Result<(), Error> {
        let current = self.current_access_token().await?;
        match (&current, sent_with) {
            // Another request's refresh already failed and ended the session.
            (None, Some(_)) => {
                tracing::debug!("session ended while request was in flight");
                return Err(Error::SessionExpired);
            }
            (Some(current), sent) if Some(current) != sent => {
                tracing::debug!("session replaced while request was in flight");
                return Ok(());
            }
            _ => {}
        }

        match self.refresh().await {
            Ok(_) => Ok(()),
            Err(RefreshError::NoRefreshToken) => {
                self.discard_session().await;
                Err(Error::NoRefreshToken)
            }
            Err(RefreshError::RefreshFailed { .. }) => Err(Error::SessionExpired),
            Err(RefreshError::Store(e)) => Err(Error::Store(e)),
        }
    }

    async fn perform_refresh(&self) -> Result<Session, RefreshError> {
        let generation = *self.inner.generation.lock().await;
        let stored = self
            .inner
            .store
            .get()
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        let Some(Session {
            refresh_token: Some(refresh_token),
            user,
            ..
        }) = stored
        else {
            tracing::debug!("no refresh token persisted");
            return Err(RefreshError::NoRefreshToken);
        };

        let tokens = match self.request_new_tokens(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!(error = %e, "token refresh failed, clearing session");
                let current = self.inner.generation.lock().await;
                let cleared = if self.is_current(*current, generation, &refresh_token).await? {
                    self.inner.store.clear().await
                } else {
                    Ok(())
                };
                if let Err(e) = cleared {
                    tracing::warn!(error = %e, "failed to clear session");
                }
                return Err(e);
            }
        };

        // A login or logout that landed during the exchange wins over its result.
        let current = self.inner.generation.lock().await;
        if !self.is_current(*current, generation, &refresh_token).await? {
            tracing::warn!("session changed during token refresh, discarding new tokens");
            return Err(RefreshError::RefreshFailed {
                status: None,
                message: "session changed during refresh".into(),
            });
        }

        let rotated = tokens.refresh.is_some();
        let session = Session {
            access_token: tokens.access,
            refresh_token: Some(tokens.refresh.unwrap_or(refresh_token)),
            user,
        };
        self.inner
            .store
            .set(&session)
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        drop(current);

        tracing::info!(rotated, "access token refreshed");
        Ok(session)
    }

    /// Whether the session a refresh started from is still the persisted one.
    async fn is_current(
        &self,
        current_generation: u64,
        started_at: u64,
        refresh_token: &RefreshToken,
    ) -> Result<bool, RefreshError> {
        if current_generation != started_at {
            return Ok(false);
        }
        let stored = self
            .inner
            .store
            .get()
            .await
            .map_err(|e| RefreshError::Store(e.to_string()))?;
        Ok(stored.and_then(|s| s.refresh_token).as_ref() == Some(refresh_token))
    }

    async fn request_new_tokens(
        &self,
        refresh_token: &RefreshToken,
    ) -> Result<TokenPair, RefreshError> {
        let failed = |status: Option<u16>, message: String| RefreshError::RefreshFailed {
            status,
            message,
        };

        let url = self
            .inner
            .config
            .endpoint(&self.inner.config.refresh_path)
            .map_err(|e| failed(None, e.to_string()))?;
        let response = self
            .inner
            .http
            .post(url)
            .json(&RefreshRequest {
                refresh: refresh_token.as_str(),
            })
            .send()
            .await
            .map_err(|e| failed(None, e.to_string()))?;

        let status = response.status().as_u16();
        let success = response.status().is_success();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| failed(Some(status), e.to_string()))?;
        if !success {
            return Err(failed(Some(status), ErrorBody::parse(status, &bytes).message));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| failed(Some(status), format!("invalid refresh response: {e}")))
    }

    async fn dispatch(
        &self,
        request: &PendingRequest,
    ) -> Result<(reqwest::Response, Option<AccessToken>), Error> {
        let url = self.inner.config.endpoint(&request.path)?;
        // Read at dispatch time so a retry picks up the token a refresh just persisted.
        let token = self.current_access_token().await?;

        let mut builder = self.inner.http.request(request.method.into(), url);
        if let Some(token) = &token {
            builder = builder.bearer_auth(token.as_str());
        }

        let mut headers = request.headers.clone();
        builder = match &request.body {
            Some(RequestBody::Multipart(form)) => {
                headers.remove(CONTENT_TYPE);
                builder.multipart(form.to_form()?)
            }
            Some(RequestBody::Json(value)) => {
                builder.header(CONTENT_TYPE, application_json()).json(value)
            }
            None => builder.header(CONTENT_TYPE, application_json()),
        };
        let builder = builder.headers(headers);

        tracing::debug!(authenticated = token.is_some(), "dispatching request");
        let response = builder.send().await?;
        Ok((response, token))
    }

    pub(crate) async fn current_access_token(&self) -> Result<Option<AccessToken>, Error> {
        let session = self.inner.store.get().await.map_err(store_error)?;
        Ok(session.map(|s| s.access_token))
    }

    /// Persist a new session (login) or remove it (logout), starting a new generation.
    pub(crate) async fn replace_session(&self, session: Option<&Session>) -> Result<(), Error> {
        let mut generation = self.inner.generation.lock().await;
        match session {
            Some(session) => self.inner.store.set(session).await,
            None => self.inner.store.clear().await,
        }
        .map_err(store_error)?;
        *generation += 1;
        Ok(())
    }

    pub(crate) async fn discard_session(&self) {
        if let Err(e) = self.replace_session(None).await {
            tracing::warn!(error = %e, "failed to clear session");
        }
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Checks HTTP response status; returns the body on success or a normalized error.
    pub(crate) async fn settle(response: reqwest::Response) -> Result<ResponseBody, Error> {
        let status = response.status().as_u16();
        let success = response.status().is_success();
        let bytes = response.bytes().await?;
        if success {
            return Ok(ResponseBody {
                status,
                bytes: bytes.to_vec(),
            });
        }
        let error = Error::from_response(status, &bytes);
        tracing::debug!(status, error = %error, "request failed");
        Err(error)
    }
}

fn application_json() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

pub(crate) fn store_error(e: StoreError) -> Error {
    Error::Store(e.to_string())
}
