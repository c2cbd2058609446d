// Single-flight refresh coordination
//
// At most one refresh exchange is in flight. Callers that observe an expired
// access token while a cycle is running are queued and all receive the
// cycle's result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::refresh::RefreshClient;
use crate::error::RefreshError;
use crate::session::{Session, SessionInvalidator, SessionStore};

/// Queued continuation waiting for the current cycle's token
type PendingRequest = oneshot::Sender<Result<String, RefreshError>>;

enum CycleState {
    Idle,
    Refreshing { waiters: Vec<PendingRequest> },
}

/// Ensures one refresh exchange at a time and fans its result out to waiters
pub struct RefreshCoordinator {
    state: Mutex<CycleState>,
    store: Arc<dyn SessionStore>,
    invalidator: Arc<SessionInvalidator>,
    refresher: RefreshClient,
    /// Number of refresh exchanges started since creation
    cycles: AtomicU64,
    /// Number of cycles settled; only changes under the state lock
    settled: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        invalidator: Arc<SessionInvalidator>,
        refresher: RefreshClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CycleState::Idle),
            store,
            invalidator,
            refresher,
            cycles: AtomicU64::new(0),
            settled: AtomicU64::new(0),
        })
    }

    /// Whether a refresh exchange is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.lock_state(), CycleState::Refreshing { .. })
    }

    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Obtain an access token to replace `rejected_token`, which the server
    /// just answered with 401.
    ///
    /// The first caller while idle starts a cycle; callers arriving while a
    /// cycle runs join it. If the store already holds a different token, a
    /// cycle completed after the caller's attempt and that token is returned
    /// without a new exchange.
    ///
    /// The exchange runs on its own task: dropping this future (for example on
    /// the caller's timeout) only discards the queued result.
    pub async fn fresh_token(self: &Arc<Self>, rejected_token: &str) -> Result<String, RefreshError> {
        let receiver = loop {
            // The store is read outside the state lock; a cycle settling in
            // between is detected through the settled counter and re-read.
            let settled_before = self.settled.load(Ordering::SeqCst);
            let current = self
                .store
                .get()
                .map_err(|e| RefreshError::Store(e.to_string()))?;

            let mut state = self.lock_state();
            let (tx, rx) = oneshot::channel();

            match &mut *state {
                CycleState::Refreshing { waiters } => {
                    tracing::debug!(queued = waiters.len() + 1, "Joining in-flight token refresh");
                    waiters.push(tx);
                }
                CycleState::Idle => {
                    if self.settled.load(Ordering::SeqCst) != settled_before {
                        continue;
                    }

                    match current {
                        None => return Err(RefreshError::NoSession),
                        Some(session) if session.access_token != rejected_token => {
                            tracing::debug!("Access token already refreshed, reusing it");
                            return Ok(session.access_token);
                        }
                        Some(_) => {}
                    }

                    *state = CycleState::Refreshing { waiters: vec![tx] };
                    self.cycles.fetch_add(1, Ordering::SeqCst);

                    let coordinator = Arc::clone(self);
                    let rejected = rejected_token.to_string();
                    tokio::spawn(async move { coordinator.run_cycle(rejected).await });
                }
            }

            break rx;
        };

        receiver.await.unwrap_or(Err(RefreshError::Aborted))
    }

    async fn run_cycle(self: Arc<Self>, rejected_token: String) {
        let mut guard = CycleGuard {
            coordinator: Arc::clone(&self),
            settled: false,
        };

        let result = self.exchange().await;

        if let Err(ref e) = result {
            tracing::error!(error = %e, "Token refresh failed, ending session");
            if let Err(store_err) = self.invalidator.invalidate(&rejected_token, &e.to_string()) {
                tracing::error!(error = %store_err, "Failed to clear session after refresh failure");
            }
        }

        self.settle(result);
        guard.settled = true;
    }

    async fn exchange(&self) -> Result<String, RefreshError> {
        let session = self
            .store
            .get()
            .map_err(|e| RefreshError::Store(e.to_string()))?
            .ok_or(RefreshError::NoSession)?;

        let refresh_token = session
            .refresh_token
            .clone()
            .ok_or(RefreshError::MissingRefreshToken)?;

        let tokens = self.refresher.refresh(&refresh_token).await?;

        let updated = Session {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(session.refresh_token),
            tenant_id: tokens
                .user
                .and_then(|user| user.tenant_id)
                .or(session.tenant_id),
        };

        self.store
            .set(&updated)
            .map_err(|e| RefreshError::Store(e.to_string()))?;

        Ok(updated.access_token)
    }

    /// Return to idle and hand the result to every queued caller
    fn settle(&self, result: Result<String, RefreshError>) {
        let waiters = {
            let mut state = self.lock_state();
            self.settled.fetch_add(1, Ordering::SeqCst);
            match std::mem::replace(&mut *state, CycleState::Idle) {
                CycleState::Refreshing { waiters } => waiters,
                CycleState::Idle => Vec::new(),
            }
        };

        tracing::debug!(
            waiters = waiters.len(),
            success = result.is_ok(),
            "Refresh cycle settled"
        );

        for waiter in waiters {
            // A waiter that gave up (timed out) has dropped its receiver
            let _ = waiter.send(result.clone());
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CycleState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases waiters if the cycle task ends without settling
struct CycleGuard {
    coordinator: Arc<RefreshCoordinator>,
    settled: bool,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Refresh cycle aborted before settling");
            self.coordinator.settle(Err(RefreshError::Aborted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MemorySessionStore, SessionEvent};
    use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
    use reqwest::Client;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{OnceLock, Weak};
    use std::time::Duration;
    use tokio::net::TcpListener;

    enum Reply {
        Issue(&'static str),
        Revoke,
    }

    struct MockRefresh {
        calls: AtomicUsize,
        delay: Duration,
        reply: Reply,
    }

    async fn handle_refresh(
        State(mock): State<Arc<MockRefresh>>,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        mock.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(mock.delay).await;

        match mock.reply {
            Reply::Issue(token) => Json(json!({
                "data": {
                    "access_token": token,
                    "refresh_token": body["refresh_token"],
                    "expires_in": 900,
                    "user": {"id": "u-1", "tenant_id": "t-1", "roles": []}
                },
                "error": null
            }))
            .into_response(),
            Reply::Revoke => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"data": null, "error": {"message": "Invalid refresh token"}})),
            )
                .into_response(),
        }
    }

    async fn start_mock(reply: Reply, delay: Duration) -> (Arc<MockRefresh>, String) {
        let mock = Arc::new(MockRefresh {
            calls: AtomicUsize::new(0),
            delay,
            reply,
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new()
            .route("/auth/refresh", post(handle_refresh))
            .with_state(mock.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (mock, format!("http://127.0.0.1:{}/auth/refresh", port))
    }

    fn coordinator(
        url: String,
        session: Option<Session>,
    ) -> (Arc<MemorySessionStore>, Arc<SessionInvalidator>, Arc<RefreshCoordinator>) {
        let store = Arc::new(match session {
            Some(session) => MemorySessionStore::with_session(session),
            None => MemorySessionStore::new(),
        });
        let invalidator = Arc::new(SessionInvalidator::new(store.clone()));
        let refresher = RefreshClient::new(Client::new(), url, Duration::from_secs(5));
        let coordinator = RefreshCoordinator::new(store.clone(), invalidator.clone(), refresher);
        (store, invalidator, coordinator)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_refresh() {
        let (mock, url) = start_mock(Reply::Issue("A2"), Duration::from_millis(150)).await;
        let (store, _, coordinator) = coordinator(
            url,
            Some(Session::new("A1").with_refresh_token("R1")),
        );

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.fresh_token("A1").await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "A2");
        }

        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.cycles_started(), 1);
        assert!(!coordinator.is_refreshing());

        let session = store.get().unwrap().unwrap();
        assert_eq!(session.access_token, "A2");
        assert_eq!(session.refresh_token.as_deref(), Some("R1"));
        assert_eq!(session.tenant_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn test_stale_rejection_reuses_current_token() {
        let (mock, url) = start_mock(Reply::Issue("A3"), Duration::ZERO).await;
        let (_, _, coordinator) = coordinator(
            url,
            Some(Session::new("A2").with_refresh_token("R1")),
        );

        assert_eq!(coordinator.fresh_token("A1").await.unwrap(), "A2");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rejected_refresh_fails_all_waiters_and_clears_session() {
        let (mock, url) = start_mock(Reply::Revoke, Duration::from_millis(100)).await;
        let (store, invalidator, coordinator) = coordinator(
            url,
            Some(Session::new("A1").with_refresh_token("R1")),
        );
        let mut events = invalidator.subscribe();

        let results = futures::future::join_all(
            (0..3).map(|_| coordinator.fresh_token("A1")),
        )
        .await;

        for result in results {
            assert_eq!(
                result.unwrap_err(),
                RefreshError::Rejected {
                    status: 401,
                    message: "Invalid refresh token".to_string()
                }
            );
        }
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert!(store.get().unwrap().is_none());
        assert!(matches!(events.try_recv().unwrap(), SessionEvent::Expired { .. }));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_fails_without_exchange() {
        let (mock, url) = start_mock(Reply::Issue("A2"), Duration::ZERO).await;
        let (store, _, coordinator) = coordinator(url, Some(Session::new("A1")));

        let err = coordinator.fresh_token("A1").await.unwrap_err();
        assert_eq!(err, RefreshError::MissingRefreshToken);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
        assert!(store.get().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_session() {
        let (_, url) = start_mock(Reply::Issue("A2"), Duration::ZERO).await;
        let (_, _, coordinator) = coordinator(url, None);

        assert_eq!(
            coordinator.fresh_token("A1").await.unwrap_err(),
            RefreshError::NoSession
        );
        assert_eq!(coordinator.cycles_started(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_owner_does_not_cancel_cycle() {
        let (mock, url) = start_mock(Reply::Issue("A2"), Duration::from_millis(150)).await;
        let (store, _, coordinator) = coordinator(
            url,
            Some(Session::new("A1").with_refresh_token("R1")),
        );

        let gave_up =
            tokio::time::timeout(Duration::from_millis(20), coordinator.fresh_token("A1")).await;
        assert!(gave_up.is_err());
        assert!(coordinator.is_refreshing());

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert!(!coordinator.is_refreshing());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get().unwrap().unwrap().access_token, "A2");
    }

    /// Records whether the coordinator's state lock was held during a read
    struct LockCheckingStore {
        inner: MemorySessionStore,
        coordinator: OnceLock<Weak<RefreshCoordinator>>,
        read_under_lock: AtomicBool,
        reads: AtomicUsize,
    }

    impl SessionStore for LockCheckingStore {
        fn get(&self) -> anyhow::Result<Option<Session>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(coordinator) = self.coordinator.get().and_then(Weak::upgrade) {
                if coordinator.state.try_lock().is_err() {
                    self.read_under_lock.store(true, Ordering::SeqCst);
                }
            }
            self.inner.get()
        }

        fn set(&self, session: &Session) -> anyhow::Result<()> {
            self.inner.set(session)
        }

        fn clear(&self) -> anyhow::Result<()> {
            self.inner.clear()
        }
    }

    #[tokio::test]
    async fn test_store_is_read_outside_state_lock() {
        let (mock, url) = start_mock(Reply::Issue("A2"), Duration::ZERO).await;
        let store = Arc::new(LockCheckingStore {
            inner: MemorySessionStore::with_session(Session::new("A1").with_refresh_token("R1")),
            coordinator: OnceLock::new(),
            read_under_lock: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        });
        let invalidator = Arc::new(SessionInvalidator::new(store.clone()));
        let refresher = RefreshClient::new(Client::new(), url, Duration::from_secs(5));
        let coordinator = RefreshCoordinator::new(store.clone(), invalidator, refresher);
        store
            .coordinator
            .set(Arc::downgrade(&coordinator))
            .unwrap_or_else(|_| panic!("coordinator already set"));

        assert_eq!(coordinator.fresh_token("A1").await.unwrap(), "A2");
        assert_eq!(coordinator.fresh_token("A1").await.unwrap(), "A2");

        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
        assert!(store.reads.load(Ordering::SeqCst) >= 3);
        assert!(!store.read_under_lock.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_next_expiry_starts_a_new_cycle() {
        let (mock, url) = start_mock(Reply::Issue("A2"), Duration::ZERO).await;
        let (_, _, coordinator) = coordinator(
            url,
            Some(Session::new("A1").with_refresh_token("R1")),
        );

        assert_eq!(coordinator.fresh_token("A1").await.unwrap(), "A2");
        // The server later rejects A2 as well
        assert_eq!(coordinator.fresh_token("A2").await.unwrap(), "A2");
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coordinator.cycles_started(), 2);
    }
}
