use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::types::{AccessToken, RefreshToken, Session, UserProfile};

/// Slot holding the access token.
pub const ACCESS_TOKEN_SLOT: &str = "access_token";
/// Slot holding the refresh token.
pub const REFRESH_TOKEN_SLOT: &str = "refresh_token";
/// Slot holding the serialized user profile JSON.
pub const USER_DATA_SLOT: &str = "user_data";

pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence for the authenticated session.
///
/// The three slots (access token, refresh token, user profile) are written
/// and cleared together; an implementation must never expose a partially
/// written group to `get`.
///
/// # Example
///
/// ```rust,ignore
/// impl SessionStore for KeychainStore {
///     async fn get(&self) -> Result<Option<Session>, StoreError> {
///         self.keychain.read("clinic-session").await
///     }
///
///     async fn set(&self, session: &Session) -> Result<(), StoreError> {
///         self.keychain.write("clinic-session", session).await
///     }
///
///     async fn clear(&self) -> Result<(), StoreError> {
///         self.keychain.delete("clinic-session").await
///     }
/// }
/// ```
pub trait SessionStore: Send + Sync + 'static {
    /// Current session, or `None` when logged out.
    fn get(&self) -> impl Future<Output = Result<Option<Session>, StoreError>> + Send;

    /// Replace the stored session.
    fn set(&self, session: &Session) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove every slot.
    fn clear(&self) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// On-disk layout: one string per slot, the profile kept as serialized JSON.
#[derive(Debug, Serialize, Deserialize)]
struct SessionSlots {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user_data: Option<String>,
}

impl SessionSlots {
    fn from_session(session: &Session) -> Result<Self, serde_json::Error> {
        let user_data = session
            .user
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        Ok(Self {
            access_token: session.access_token.as_str().to_owned(),
            refresh_token: session
                .refresh_token
                .as_ref()
                .map(|t| t.as_str().to_owned()),
            user_data,
        })
    }

    fn into_session(self) -> Result<Session, serde_json::Error> {
        let user = self
            .user_data
            .as_deref()
            .map(serde_json::from_str::<UserProfile>)
            .transpose()?;
        Ok(Session {
            access_token: AccessToken::new(self.access_token),
            refresh_token: self.refresh_token.map(RefreshToken::new),
            user,
        })
    }
}

/// In-process store; the session lives as long as the value.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with an existing session, e.g. one restored by the caller.
    #[must_use]
    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    async fn get(&self) -> Result<Option<Session>, StoreError> {
        Ok(self.session.read().await.clone())
    }

    async fn set(&self, session: &Session) -> Result<(), StoreError> {
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.session.write().await = None;
        Ok(())
    }
}

/// Durable store keeping the slots in `session.json` inside a directory.
///
/// Writes go to a temporary file that is then renamed over the old one, so a
/// concurrent `get` sees either the previous group or the new one.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    tmp_path: PathBuf,
    // Serializes writers so two renames cannot interleave with a clear.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileSessionStore {
    const FILE_NAME: &'static str = "session.json";

    /// Store the session under `dir`; the directory is created on first write.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            path: dir.join(Self::FILE_NAME),
            tmp_path: dir.join(format!("{}.tmp", Self::FILE_NAME)),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Path of the session document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileSessionStore {
    /// Write the temp file readable by the owner only; it holds bearer credentials.
    async fn write_private(&self, bytes: &[u8]) -> io::Result<()> {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options.open(&self.tmp_path).await?;

        // `mode` only applies on creation; tighten a leftover temp file too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
        }

        file.write_all(bytes).await?;
        file.sync_all().await
    }
}

impl SessionStore for FileSessionStore {
    async fn get(&self) -> Result<Option<Session>, StoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let slots: SessionSlots = serde_json::from_slice(&bytes)?;
        Ok(Some(slots.into_session()?))
    }

    async fn set(&self, session: &Session) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&SessionSlots::from_session(session)?)?;
        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.write_private(&bytes).await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
