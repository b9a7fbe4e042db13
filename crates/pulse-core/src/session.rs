//! Process-wide session store holding the bearer credentials.
//!
//! The realtime channel never writes credentials; it reads the access token
//! through [`CredentialSource`] each time it opens a physical connection, so
//! a token rotated between reconnect attempts takes effect on the next one.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Credential Source
// ============================================================================

/// Read-only view of the current bearer credential.
pub trait CredentialSource: Send + Sync {
    /// Returns the current access token, or `None` when not authenticated.
    fn access_token(&self) -> Option<String>;
}

/// A fixed credential that never rotates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    /// A source that never has a credential.
    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredential {
    fn access_token(&self) -> Option<String> {
        self.0.clone()
    }
}

// ============================================================================
// Session Tokens
// ============================================================================

/// Access and refresh tokens issued by the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTokens {
    pub access: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<String>,
}

impl SessionTokens {
    /// Creates a token pair, rejecting a blank access token.
    pub fn new(access: impl Into<String>, refresh: Option<String>) -> DomainResult<Self> {
        let access = access.into();
        if access.trim().is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "access token".to_string(),
                value: format!("{access:?}"),
                expected: "a non-empty token".to_string(),
            });
        }
        Ok(Self { access, refresh })
    }
}

// ============================================================================
// Session Store
// ============================================================================

/// Thread-safe store for the current session's tokens.
///
/// Shared by reference (`Arc<SessionStore>`) between the code that logs in
/// and the realtime channel that reads the access token.
#[derive(Debug, Default)]
pub struct SessionStore {
    tokens: RwLock<Option<SessionTokens>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store that already holds `tokens`.
    pub fn with_tokens(tokens: SessionTokens) -> Self {
        Self {
            tokens: RwLock::new(Some(tokens)),
        }
    }

    /// Replaces both tokens (login).
    pub fn set_tokens(&self, tokens: SessionTokens) {
        *self.tokens.write() = Some(tokens);
        debug!("Session tokens stored");
    }

    /// Replaces the access token after a refresh, keeping the refresh token.
    pub fn set_access_token(&self, access: impl Into<String>) -> DomainResult<()> {
        let mut guard = self.tokens.write();
        let refresh = guard.as_ref().and_then(|t| t.refresh.clone());
        *guard = Some(SessionTokens::new(access, refresh)?);
        debug!("Access token rotated");
        Ok(())
    }

    /// Forgets all tokens (logout).
    pub fn clear(&self) {
        *self.tokens.write() = None;
        debug!("Session cleared");
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.tokens.read().as_ref().and_then(|t| t.refresh.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.tokens.read().is_some()
    }

    /// Snapshot of the current tokens.
    pub fn tokens(&self) -> Option<SessionTokens> {
        self.tokens.read().clone()
    }

    /// Loads a store from a JSON session file.
    ///
    /// A missing file yields an empty (logged-out) store.
    pub fn load(path: &Path) -> DomainResult<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No session file, starting logged out");
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(DomainError::SessionIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let tokens: Option<SessionTokens> =
            serde_json::from_str(&contents).map_err(|source| DomainError::SessionFormat {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            tokens: RwLock::new(tokens),
        })
    }

    /// Writes the current tokens to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> DomainResult<()> {
        let io_err = |source| DomainError::SessionIo {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(&self.tokens()).map_err(|source| {
            DomainError::SessionFormat {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let mut file = open_private(path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;

        debug!(path = %path.display(), "Session saved");
        Ok(())
    }
}

/// Opens `path` for writing, readable by the owner only.
///
/// A new file is created with mode 0600; an existing one is narrowed to
/// 0600 before anything is written to it.
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

impl CredentialSource for SessionStore {
    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(access: &str, refresh: Option<&str>) -> SessionTokens {
        SessionTokens::new(access, refresh.map(str::to_string)).unwrap()
    }

    #[test]
    fn test_empty_store_has_no_credential() {
        let store = SessionStore::new();
        assert!(!store.is_authenticated());
        assert_eq!(store.access_token(), None);
    }

    #[test]
    fn test_set_and_clear_tokens() {
        let store = SessionStore::new();
        store.set_tokens(tokens("access-1", Some("refresh-1")));

        assert!(store.is_authenticated());
        assert_eq!(store.access_token().as_deref(), Some("access-1"));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-1"));

        store.clear();
        assert_eq!(store.access_token(), None);
        assert_eq!(store.refresh_token(), None);
    }

    #[test]
    fn test_rotation_keeps_refresh_token() {
        let store = SessionStore::with_tokens(tokens("old", Some("refresh")));
        store.set_access_token("new").unwrap();

        assert_eq!(store.access_token().as_deref(), Some("new"));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh"));
    }

    #[test]
    fn test_blank_access_token_rejected() {
        let result = SessionTokens::new("   ", None);
        assert!(matches!(result, Err(DomainError::InvalidFieldValue { .. })));

        let store = SessionStore::with_tokens(tokens("keep", None));
        assert!(store.set_access_token("").is_err());
        assert_eq!(store.access_token().as_deref(), Some("keep"));
    }

    #[test]
    fn test_static_credential() {
        assert_eq!(StaticCredential::new("abc").access_token().as_deref(), Some("abc"));
        assert_eq!(StaticCredential::none().access_token(), None);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        let store = SessionStore::with_tokens(tokens("access", Some("refresh")));
        store.save(&path).unwrap();

        let loaded = SessionStore::load(&path).unwrap();
        assert_eq!(loaded.tokens(), store.tokens());
    }

    #[test]
    fn test_load_missing_file_is_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::load(&dir.path().join("absent.json")).unwrap();
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_load_malformed_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        fs::write(&path, "{ not json").unwrap();

        let result = SessionStore::load(&path);
        assert!(matches!(result, Err(DomainError::SessionFormat { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_session_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::with_tokens(tokens("access", None));

        store.save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // A pre-existing world-readable file is narrowed on overwrite
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        store.save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(SessionStore::load(&path).unwrap().is_authenticated());
    }

    #[test]
    fn test_saved_logout_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");

        SessionStore::new().save(&path).unwrap();
        assert!(!SessionStore::load(&path).unwrap().is_authenticated());
    }
}
