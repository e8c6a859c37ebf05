//! Client core for the PortfolioOS property-management API.
//!
//! Everything above this crate is CRUD screens; this is the authenticated,
//! multi-tenant HTTP boundary they all sit on:
//!
//! - [`store`] — credential persistence (tokens + active org slug)
//! - [`client`] — request authentication and the retry-once 401 flow
//! - [`refresh`] — single-flight token renewal with a bounded timeout
//! - [`session`] — the `Hydrating | Authenticated | Unauthenticated` machine
//! - [`tenant`] / [`cache`] — active-org resolution and tenant-scoped
//!   server-state caching
//!
//! Typical wiring:
//!
//! ```rust,ignore
//! let store: Arc<dyn CredentialStore> = Arc::new(FileStore::open(path)?);
//! let cache = Arc::new(QueryCache::new());
//! let session = SessionController::new(
//!     ClientConfig::new("https://api.example.com/api/v1"),
//!     Arc::clone(&store),
//!     Arc::clone(&cache),
//! );
//! let tenants = TenantContext::new(location, store, cache);
//! tenants.canonicalize();
//! session.hydrate().await?;
//! ```

pub mod cache;
pub mod client;
pub mod error;
pub mod refresh;
pub mod session;
pub mod store;
pub mod tenant;

pub use cache::{CacheHit, QueryCache, org_key};
pub use client::{
    ApiClient, ApiRequest, ClientConfig, Identity, Membership, ORG_HEADER, RegisterPayload,
    TokenPair, endpoints,
};
pub use error::{ApiError, ApiErrorKind};
pub use refresh::RefreshCoordinator;
pub use session::{SessionController, SessionState};
pub use store::{CredentialStore, Credentials, FileStore, MemoryStore};
pub use tenant::{ORG_PARAM, TenantContext};
