//! Active tenant resolution and switching.
//!
//! The URL is the authoritative source for the active org (links stay
//! shareable and reload-safe); the credential store is the fallback. An
//! explicit switch persists the slug, rewrites the URL, and invalidates the
//! org-scoped cache namespace so no query can serve another tenant's data.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};
use url::Url;

use crate::cache::QueryCache;
use crate::store::CredentialStore;

/// Query parameter carrying the active org slug.
pub const ORG_PARAM: &str = "org";

/// Resolves and switches the active organization.
pub struct TenantContext {
    store: Arc<dyn CredentialStore>,
    cache: Arc<QueryCache>,
    location: Mutex<Url>,
}

impl TenantContext {
    /// Creates a context over the application's current location.
    pub fn new(location: Url, store: Arc<dyn CredentialStore>, cache: Arc<QueryCache>) -> Self {
        Self {
            store,
            cache,
            location: Mutex::new(location),
        }
    }

    /// Snapshot of the current location.
    pub fn location(&self) -> Url {
        self.lock_location().clone()
    }

    /// Canonical active org slug: URL parameter first, store fallback.
    pub fn active_tenant(&self) -> Option<String> {
        if let Some(slug) = org_param(&self.lock_location()) {
            return Some(slug);
        }
        self.store.tenant()
    }

    /// Switches the active org (or clears the selection with `None`).
    ///
    /// Persists the slug, rewrites the URL parameter, and invalidates every
    /// org-scoped cache entry — prior tenant and global namespaces alike — so
    /// nothing cached before the switch can answer a query after it.
    pub fn set_tenant(&self, slug: Option<&str>) {
        match slug {
            Some(slug) => {
                info!(org = slug, "switching active org");
                self.store.set_tenant(slug);
            }
            None => {
                info!("clearing active org");
                self.store.clear_tenant();
            }
        }

        set_org_param(&mut self.lock_location(), slug);
        self.cache.invalidate_org_scoped();
    }

    /// Aligns the URL with the stored selection at boot.
    ///
    /// When the URL lacks the parameter but storage has a slug, the URL is
    /// rewritten to match. This is a canonicalization of the same selection,
    /// not a switch, so the cache is left alone.
    pub fn canonicalize(&self) {
        let mut location = self.lock_location();
        if org_param(&location).is_some() {
            return;
        }
        if let Some(slug) = self.store.tenant() {
            debug!(org = %slug, "canonicalizing URL from stored org selection");
            set_org_param(&mut location, Some(&slug));
        }
    }

    fn lock_location(&self) -> std::sync::MutexGuard<'_, Url> {
        self.location.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn org_param(url: &Url) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == ORG_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn set_org_param(url: &mut Url, slug: Option<&str>) {
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != ORG_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (key, value) in &retained {
            pairs.append_pair(key, value);
        }
        if let Some(slug) = slug {
            pairs.append_pair(ORG_PARAM, slug);
        }
    }

    if url.query() == Some("") {
        url.set_query(None);
    }
}
