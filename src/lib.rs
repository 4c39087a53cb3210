#![doc = include_str!("../README.md")]

#[cfg(feature = "client")]
pub mod auth;
#[cfg(feature = "client")]
pub mod client;
pub mod config;
pub mod error;
#[cfg(feature = "client")]
mod refresh;
pub mod store;
pub mod types;
pub mod validation;

// Re-exports for convenient access
#[cfg(feature = "client")]
pub use auth::{Credentials, Registration};
#[cfg(feature = "client")]
pub use client::{
    AuthenticatedHttpClient, Method, MultipartBody, PendingRequest, RequestBody, ResponseBody,
};
pub use config::ClientConfig;
pub use error::{Error, ErrorBody, RefreshError};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore, StoreError};
pub use types::{AccessToken, RefreshToken, Role, Session, UserId, UserProfile};
pub use validation::{ValidationErrors, is_valid_email};
