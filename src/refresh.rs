//! Single-flight token renewal.
//!
//! Converts "authentication expired" responses into one shared renewal
//! operation. However many requests fail concurrently, exactly one of them
//! drives the renewal; the rest suspend as waiters and observe its outcome.
//! A failed renewal is fatal for the session and triggers the logout cascade
//! wired in at construction — it is never silently retried.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::ApiError;

/// Renewal operation: performs the refresh call against the backend and
/// persists the rotated pair, resolving to the new access token.
pub type RenewFn = Box<dyn Fn() -> BoxFuture<'static, Result<String, ApiError>> + Send + Sync>;

/// Invoked exactly once per failed renewal batch. Wired to the session
/// layer's logout so an unrecoverable 401 anywhere cascades to a full
/// sign-out.
pub type UnrecoverableFn = Box<dyn Fn() + Send + Sync>;

/// Renewal lifecycle. At most one renewal is in flight at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshState {
    Idle,
    Refreshing,
}

/// Outcome delivered to each waiter, identical for the whole batch.
#[derive(Debug, Clone)]
enum Outcome {
    Renewed(String),
    Failed(ApiError),
}

struct Shared {
    state: RefreshState,
    waiters: VecDeque<oneshot::Sender<Outcome>>,
}

enum Role {
    Initiator,
    Waiter(oneshot::Receiver<Outcome>),
}

/// Coordinates token renewal across concurrent callers.
///
/// Constructed once with its collaborators injected; there is no post-hoc
/// registration step, so a request can never race an unwired callback.
pub struct RefreshCoordinator {
    renew: RenewFn,
    on_unrecoverable: UnrecoverableFn,
    renew_timeout: Duration,
    shared: Mutex<Shared>,
}

impl RefreshCoordinator {
    /// Creates a coordinator.
    ///
    /// `renew_timeout` bounds the renewal operation; a renewal that never
    /// settles would otherwise hang every queued waiter forever.
    pub fn new(renew_timeout: Duration, renew: RenewFn, on_unrecoverable: UnrecoverableFn) -> Self {
        Self {
            renew,
            on_unrecoverable,
            renew_timeout,
            shared: Mutex::new(Shared {
                state: RefreshState::Idle,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns a freshly renewed access token, coordinating with any renewal
    /// already in flight.
    ///
    /// The first caller in a batch becomes the initiator and runs the renewal;
    /// everyone else suspends until the initiator flushes the queue. Waiters
    /// are released in enqueue order with the identical outcome.
    pub async fn renewed_access(&self) -> Result<String, ApiError> {
        let role = {
            let mut shared = self.lock_shared();
            match shared.state {
                RefreshState::Idle => {
                    shared.state = RefreshState::Refreshing;
                    Role::Initiator
                }
                RefreshState::Refreshing => {
                    let (tx, rx) = oneshot::channel();
                    shared.waiters.push_back(tx);
                    Role::Waiter(rx)
                }
            }
        };

        match role {
            Role::Initiator => self.run_renewal().await,
            Role::Waiter(rx) => match rx.await {
                Ok(Outcome::Renewed(token)) => Ok(token),
                Ok(Outcome::Failed(err)) => Err(err),
                // Initiator dropped mid-flight (task cancelled); treat as failure
                // but the cascade already ran or never will — do not re-trigger it.
                Err(_) => Err(ApiError::session_expired("renewal abandoned")),
            },
        }
    }

    async fn run_renewal(&self) -> Result<String, ApiError> {
        debug!("token renewal started");

        // If this task is cancelled mid-renewal, the guard still flips the
        // state back and rejects the queued waiters instead of leaving them
        // suspended on a renewal that will never settle.
        let mut guard = AbandonGuard {
            coordinator: self,
            armed: true,
        };

        let result = match tokio::time::timeout(self.renew_timeout, (self.renew)()).await {
            Ok(Ok(token)) => Ok(token),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ApiError::timeout(format!(
                "token renewal timed out after {:?}",
                self.renew_timeout
            ))),
        };

        // Flip back to Idle and drain the queue under one lock: a caller
        // arriving during the flush either got enqueued before the drain and
        // is notified below, or observes Idle and initiates its own renewal.
        guard.armed = false;
        let waiters = {
            let mut shared = self.lock_shared();
            shared.state = RefreshState::Idle;
            std::mem::take(&mut shared.waiters)
        };

        match result {
            Ok(token) => {
                debug!(waiters = waiters.len(), "token renewal succeeded");
                for tx in waiters {
                    let _ = tx.send(Outcome::Renewed(token.clone()));
                }
                Ok(token)
            }
            Err(err) => {
                warn!(waiters = waiters.len(), error = %err, "token renewal failed; session is unrecoverable");
                let fatal = ApiError::session_expired(err.message.clone());
                for tx in waiters {
                    let _ = tx.send(Outcome::Failed(fatal.clone()));
                }
                (self.on_unrecoverable)();
                Err(fatal)
            }
        }
    }

    /// Whether a renewal is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.lock_shared().state == RefreshState::Refreshing
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Unwinds an abandoned renewal: resets the state and rejects queued waiters.
/// Does not fire the cascade — cancellation is not an authentication verdict.
struct AbandonGuard<'a> {
    coordinator: &'a RefreshCoordinator,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let waiters = {
            let mut shared = self.coordinator.lock_shared();
            shared.state = RefreshState::Idle;
            std::mem::take(&mut shared.waiters)
        };
        warn!(waiters = waiters.len(), "token renewal abandoned mid-flight");
        for tx in waiters {
            let _ = tx.send(Outcome::Failed(ApiError::session_expired("renewal abandoned")));
        }
    }
}
