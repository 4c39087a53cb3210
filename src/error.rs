use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::validation::ValidationErrors;

/// Field name DRF uses for errors that are not tied to a single input.
const NON_FIELD_ERRORS: &str = "non_field_errors";

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No response was received (connection refused, timeout, body read failure).
    #[cfg(feature = "client")]
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-2xx status that is not recoverable by a refresh.
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        field_errors: BTreeMap<String, Vec<String>>,
        payload: JsonValue,
    },

    /// A 401 persisted after the refresh attempt, or the refresh itself failed.
    #[error("Session expired")]
    SessionExpired,

    /// A refresh was needed but no refresh token is persisted.
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The response body did not have the expected shape.
    #[error("Response decode error: {0}")]
    Decode(String),

    /// Reading or writing the persisted session failed.
    #[error("Session store error: {0}")]
    Store(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request could not be built (foreign origin, bad MIME type, unserializable body).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client-side form validation rejected the input before any network call.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

impl Error {
    /// HTTP status of an [`Error::Http`], if this is one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `true` when the caller should send the user back to the login entry point.
    #[must_use]
    pub fn requires_login(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::NoRefreshToken)
    }

    /// Build an [`Error::Http`] from a raw error response body.
    pub(crate) fn from_response(status: u16, body: &[u8]) -> Self {
        let ErrorBody {
            message,
            field_errors,
            payload,
        } = ErrorBody::parse(status, body);
        Self::Http {
            status,
            message,
            field_errors,
            payload,
        }
    }
}

/// Failure of a token refresh.
///
/// `Clone` so a single in-flight refresh can hand its outcome to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RefreshError {
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Network failure or non-2xx from the refresh endpoint. The session has been cleared.
    #[error("Token refresh failed: {message}")]
    RefreshFailed {
        status: Option<u16>,
        message: String,
    },

    #[error("Session store error: {0}")]
    Store(String),
}

/// Normalized view of a server error body.
///
/// The backend answers with one of three shapes: a flat string, a
/// `{"detail": "..."}` object, or a map of field name to a list of messages.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorBody {
    /// Single human-readable message.
    pub message: String,
    /// Per-field messages; empty for flat and `detail` bodies.
    pub field_errors: BTreeMap<String, Vec<String>>,
    /// The original body, `Null` when empty.
    pub payload: JsonValue,
}

impl ErrorBody {
    #[must_use]
    pub fn parse(status: u16, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let text = text.trim();
        if text.is_empty() {
            return Self::flat(format!("Request failed with status {status}"), JsonValue::Null);
        }

        let payload = match serde_json::from_str::<JsonValue>(text) {
            Ok(value) => value,
            Err(_) => return Self::flat(text.to_owned(), JsonValue::String(text.to_owned())),
        };

        match &payload {
            JsonValue::String(s) => Self::flat(s.clone(), payload.clone()),
            JsonValue::Array(items) => {
                let messages = collect_messages(items);
                let message = if messages.is_empty() {
                    payload.to_string()
                } else {
                    messages.join("; ")
                };
                Self::flat(message, payload)
            }
            JsonValue::Object(map) => {
                let detail = map.get("detail").and_then(JsonValue::as_str);
                let field_errors: BTreeMap<String, Vec<String>> = map
                    .iter()
                    .filter(|(key, _)| key.as_str() != "detail" && key.as_str() != "code")
                    .filter_map(|(key, value)| {
                        let messages = field_messages(value);
                        (!messages.is_empty()).then(|| (key.clone(), messages))
                    })
                    .collect();

                let message = match detail {
                    Some(detail) => detail.to_owned(),
                    None if field_errors.is_empty() => payload.to_string(),
                    None => field_errors
                        .iter()
                        .map(|(field, messages)| {
                            let first = messages.first().map(String::as_str).unwrap_or_default();
                            if field == NON_FIELD_ERRORS {
                                first.to_owned()
                            } else {
                                format!("{field}: {first}")
                            }
                        })
                        .collect::<Vec<_>>()
                        .join("; "),
                };

                Self {
                    message,
                    field_errors,
                    payload,
                }
            }
            _ => Self::flat(payload.to_string(), payload),
        }
    }

    fn flat(message: String, payload: JsonValue) -> Self {
        Self {
            message,
            field_errors: BTreeMap::new(),
            payload,
        }
    }
}

fn field_messages(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::String(s) => vec![s.clone()],
        JsonValue::Array(items) => collect_messages(items),
        JsonValue::Null => Vec::new(),
        other => vec![other.to_string()],
    }
}

fn collect_messages(items: &[JsonValue]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect()
}
