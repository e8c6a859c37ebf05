//! Credential storage.
//!
//! One record holds the access token, refresh token, and the active org slug.
//! Every mutation replaces fields of that record under a single lock, so a
//! concurrent reader never observes a half-written pair (access present,
//! refresh absent mid-update). Tokens are never logged in full.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The persisted credential record.
///
/// Invariant: after any completed operation the tokens are either both
/// present or both absent. The org slug may exist without tokens only
/// transiently inside `set_tokens`-then-`set_tenant` sequences driven by the
/// session layer; `clear_all` removes everything together.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Short-lived bearer token attached to every authenticated request.
    pub access: Option<String>,
    /// Long-lived token used only to mint new access tokens.
    pub refresh: Option<String>,
    /// Slug of the currently selected organization, if any.
    pub org_slug: Option<String>,
}

/// Storage for tokens and the active org selection.
///
/// Reads return snapshots of the current record; attachment code must read at
/// send time, never hold a copy across an await. Writes are infallible from
/// the caller's point of view — persistent backends log failures instead of
/// surfacing them, because the in-memory record is the source of truth for
/// the rest of the process lifetime.
pub trait CredentialStore: Send + Sync {
    /// Current access token, if any.
    fn access(&self) -> Option<String>;
    /// Current refresh token, if any.
    fn refresh_token(&self) -> Option<String>;
    /// Currently selected org slug, if any.
    fn tenant(&self) -> Option<String>;
    /// Stores a token pair atomically.
    fn set_tokens(&self, access: &str, refresh: &str);
    /// Overwrites the access token only (renewal without rotation).
    fn set_access(&self, access: &str);
    /// Persists the active org slug.
    fn set_tenant(&self, slug: &str);
    /// Clears the org selection, leaving tokens intact.
    fn clear_tenant(&self);
    /// Removes tokens and org selection together — never partially.
    fn clear_all(&self);
}

/// In-process credential store. Default for tests and embedders that manage
/// persistence themselves.
#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Credentials>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with a record (boot from persisted state).
    pub fn with_credentials(record: Credentials) -> Self {
        Self {
            record: Mutex::new(record),
        }
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut Credentials) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut record)
    }
}

impl CredentialStore for MemoryStore {
    fn access(&self) -> Option<String> {
        self.with_record(|r| r.access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.with_record(|r| r.refresh.clone())
    }

    fn tenant(&self) -> Option<String> {
        self.with_record(|r| r.org_slug.clone())
    }

    fn set_tokens(&self, access: &str, refresh: &str) {
        self.with_record(|r| {
            r.access = Some(access.to_string());
            r.refresh = Some(refresh.to_string());
        });
    }

    fn set_access(&self, access: &str) {
        self.with_record(|r| r.access = Some(access.to_string()));
    }

    fn set_tenant(&self, slug: &str) {
        self.with_record(|r| r.org_slug = Some(slug.to_string()));
    }

    fn clear_tenant(&self) {
        self.with_record(|r| r.org_slug = None);
    }

    fn clear_all(&self) {
        self.with_record(|r| *r = Credentials::default());
    }
}

/// File-backed credential store.
///
/// Persists the record as a single JSON document with restricted permissions
/// (0600). The in-memory record is authoritative; a failed write is logged
/// and the next mutation retries persistence.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    record: Mutex<Credentials>,
}

impl FileStore {
    /// Opens a store at `path`, loading the existing record if the file
    /// exists. A missing file yields an empty record.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let record = Self::load(&path)?;
        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    fn load(path: &Path) -> Result<Credentials> {
        if !path.exists() {
            return Ok(Credentials::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read credentials from {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse credentials from {}", path.display()))
    }

    fn save(path: &Path, record: &Credentials) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let contents =
            serde_json::to_string_pretty(record).context("failed to serialize credentials")?;

        // Write with restricted permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .with_context(|| format!("failed to open {} for writing", path.display()))?;
            file.write_all(contents.as_bytes())
                .with_context(|| format!("failed to write to {}", path.display()))?;
        }

        #[cfg(not(unix))]
        {
            fs::write(path, contents)
                .with_context(|| format!("failed to write to {}", path.display()))?;
        }

        Ok(())
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut Credentials) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let out = f(&mut record);
        if let Err(e) = Self::save(&self.path, &record) {
            warn!(path = %self.path.display(), error = %e, "failed to persist credentials");
        }
        out
    }

    fn read_record<R>(&self, f: impl FnOnce(&Credentials) -> R) -> R {
        let record = self.record.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&record)
    }
}

impl CredentialStore for FileStore {
    fn access(&self) -> Option<String> {
        self.read_record(|r| r.access.clone())
    }

    fn refresh_token(&self) -> Option<String> {
        self.read_record(|r| r.refresh.clone())
    }

    fn tenant(&self) -> Option<String> {
        self.read_record(|r| r.org_slug.clone())
    }

    fn set_tokens(&self, access: &str, refresh: &str) {
        self.with_record(|r| {
            r.access = Some(access.to_string());
            r.refresh = Some(refresh.to_string());
        });
    }

    fn set_access(&self, access: &str) {
        self.with_record(|r| r.access = Some(access.to_string()));
    }

    fn set_tenant(&self, slug: &str) {
        self.with_record(|r| r.org_slug = Some(slug.to_string()));
    }

    fn clear_tenant(&self) {
        self.with_record(|r| r.org_slug = None);
    }

    fn clear_all(&self) {
        self.with_record(|r| *r = Credentials::default());
    }
}

/// Returns a masked version of a token for logs (first 8 chars + ...).
pub fn mask_token(token: &str) -> String {
    if token.len() <= 12 {
        return "***".to_string();
    }
    format!("{}...", &token[..8])
}
