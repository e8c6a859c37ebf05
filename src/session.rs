//! Session lifecycle.
//!
//! One tagged state (`Hydrating | Authenticated | Unauthenticated`) instead
//! of independent booleans, so invalid combinations such as
//! authenticated-while-hydrating cannot be represented. `Authenticated`
//! reverts to `Unauthenticated` only through [`SessionController::logout`] —
//! invoked by the user or by the renewal coordinator's unrecoverable-failure
//! cascade, which is wired in at construction time.

use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::client::{ApiClient, ClientConfig, Identity, RegisterPayload};
use crate::error::ApiError;
use crate::refresh::UnrecoverableFn;
use crate::store::CredentialStore;

/// Session lifecycle state.
///
/// Starts `Unauthenticated` when no persisted access token exists at boot,
/// else `Hydrating`. `Hydrating` resolves to `Authenticated` or
/// `Unauthenticated` exactly once.
#[derive(Debug, Clone)]
pub enum SessionState {
    /// A persisted token exists; identity is being reconstructed.
    Hydrating,
    /// Identity is live and replaced wholesale on each successful fetch.
    Authenticated(Identity),
    /// No usable session.
    Unauthenticated,
}

type SharedState = Arc<Mutex<SessionState>>;

/// Owns the session state machine and the only auth surface the rest of the
/// application may depend on.
pub struct SessionController {
    client: Arc<ApiClient>,
    store: Arc<dyn CredentialStore>,
    cache: Arc<QueryCache>,
    state: SharedState,
}

impl SessionController {
    /// Builds the controller together with its [`ApiClient`].
    ///
    /// The client's renewal coordinator receives the logout routine as its
    /// unrecoverable-failure handler here, before any request can be issued —
    /// there is no window where a failure finds the callback unwired.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        cache: Arc<QueryCache>,
    ) -> Self {
        let initial = if store.access().is_some() {
            SessionState::Hydrating
        } else {
            SessionState::Unauthenticated
        };
        let state: SharedState = Arc::new(Mutex::new(initial));

        let on_unrecoverable: UnrecoverableFn = {
            let store = Arc::clone(&store);
            let cache = Arc::clone(&cache);
            let state = Arc::clone(&state);
            Box::new(move || {
                warn!("unrecoverable authentication failure; clearing session");
                clear_session(store.as_ref(), &cache, &state);
            })
        };

        let client = Arc::new(ApiClient::new(config, Arc::clone(&store), on_unrecoverable));

        Self {
            client,
            store,
            cache,
            state,
        }
    }

    /// The underlying API client, shared with the query layer.
    pub fn client(&self) -> Arc<ApiClient> {
        Arc::clone(&self.client)
    }

    /// Whether the session is `Authenticated`.
    pub fn is_authenticated(&self) -> bool {
        matches!(*self.lock_state(), SessionState::Authenticated(_))
    }

    /// Whether the session is still `Hydrating`.
    pub fn is_hydrating(&self) -> bool {
        matches!(*self.lock_state(), SessionState::Hydrating)
    }

    /// The live identity, if authenticated.
    pub fn identity(&self) -> Option<Identity> {
        match &*self.lock_state() {
            SessionState::Authenticated(identity) => Some(identity.clone()),
            SessionState::Hydrating | SessionState::Unauthenticated => None,
        }
    }

    /// Reconstructs the session from the persisted token at startup.
    ///
    /// Runs only while `Hydrating`; any other state is a no-op. A failed
    /// hydrate means the stored session is unusable: everything is cleared,
    /// the state becomes `Unauthenticated`, and the error propagates without
    /// a retry.
    pub async fn hydrate(&self) -> Result<(), ApiError> {
        if !self.is_hydrating() {
            return Ok(());
        }
        if self.store.access().is_none() {
            *self.lock_state() = SessionState::Unauthenticated;
            return Ok(());
        }

        match self.client.me().await {
            Ok(identity) => {
                self.select_sole_org(&identity);
                info!(user = identity.id, "session hydrated");
                *self.lock_state() = SessionState::Authenticated(identity);
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "hydrate failed; clearing stored session");
                clear_session(self.store.as_ref(), &self.cache, &self.state);
                Err(err)
            }
        }
    }

    /// Exchanges credentials for a fresh token pair and fetches identity.
    ///
    /// Backend validation errors propagate verbatim for form rendering and
    /// leave the session `Unauthenticated` with nothing persisted.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), ApiError> {
        let pair = self.client.login(email, password).await?;
        self.store.set_tokens(&pair.access, &pair.refresh);

        match self.client.me().await {
            Ok(identity) => {
                self.select_sole_org(&identity);
                info!(user = identity.id, "logged in");
                *self.lock_state() = SessionState::Authenticated(identity);
                Ok(())
            }
            Err(err) => {
                // Tokens were persisted above; a session without identity is
                // not usable, so undo everything.
                clear_session(self.store.as_ref(), &self.cache, &self.state);
                Err(err)
            }
        }
    }

    /// Registers an account, then signs in with the same credentials.
    pub async fn register(&self, payload: &RegisterPayload) -> Result<(), ApiError> {
        self.client.register(payload).await?;
        self.login(&payload.email, &payload.password).await
    }

    /// Clears tokens and org selection together and drops cached queries.
    ///
    /// A stale org slug surviving logout could bleed into the next identity's
    /// session, so the whole record goes at once.
    pub fn logout(&self) {
        info!("logged out");
        clear_session(self.store.as_ref(), &self.cache, &self.state);
    }

    /// Persists the sole org as the active tenant when the identity holds
    /// exactly one membership and none is selected yet.
    fn select_sole_org(&self, identity: &Identity) {
        if self.store.tenant().is_none()
            && let [only] = identity.memberships.as_slice()
        {
            debug!(org = %only.org_slug, "auto-selecting sole org membership");
            self.store.set_tenant(&only.org_slug);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn clear_session(store: &dyn CredentialStore, cache: &QueryCache, state: &SharedState) {
    store.clear_all();
    cache.clear();
    let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    *state = SessionState::Unauthenticated;
}
