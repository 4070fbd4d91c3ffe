//! Single-flight credential refresh
//!
//! `RefreshCoordinator::ensure_fresh` is the only place a refresh starts.
//! The first caller that finds the coordinator idle flips it to in-flight
//! and spawns one refresh task; every caller, including that first one,
//! then waits on its own oneshot for the task's outcome. Callers arriving
//! while a refresh is in flight just queue another waiter.
//!
//! The refresh runs on its own task so that cancelling any caller, even the
//! one that started it, leaves the issuer call and the other waiters alone.
//! A cancelled caller only removes its own waiter entry.
//!
//! Phase transitions:
//! - Idle → InFlight (first `ensure_fresh` that needs a refresh)
//! - InFlight → Idle (refresh task finished, waiters resolved)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use credential::{Credential, TokenIssuer};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::control::SessionControl;
use crate::error::RefreshError;

/// Default upper bound on one issuer refresh call.
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

type Outcome = std::result::Result<Credential, RefreshError>;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Outcome>,
}

enum Phase {
    Idle,
    InFlight {
        started_at: Instant,
        generation: u64,
        waiters: Vec<Waiter>,
    },
}

struct Shared {
    phase: Mutex<Phase>,
    next_waiter: AtomicU64,
    next_generation: AtomicU64,
    control: Arc<SessionControl>,
    issuer: Arc<dyn TokenIssuer>,
    refresh_timeout: Duration,
}

impl Shared {
    fn lock_phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove_waiter(&self, id: u64) {
        let mut phase = self.lock_phase();
        if let Phase::InFlight { waiters, .. } = &mut *phase {
            let before = waiters.len();
            waiters.retain(|w| w.id != id);
            if waiters.len() != before {
                debug!(waiter = id, remaining = waiters.len(), "refresh waiter cancelled");
                metrics::gauge!("session_refresh_waiters").set(waiters.len() as f64);
            }
        }
    }

    /// Leave `InFlight` for `generation`, handing back its waiters.
    fn finish(&self, generation: u64) -> Vec<Waiter> {
        let mut phase = self.lock_phase();
        match &*phase {
            Phase::InFlight { generation: g, .. } if *g == generation => {}
            _ => return Vec::new(),
        }
        metrics::gauge!("session_refresh_waiters").set(0.0);
        match std::mem::replace(&mut *phase, Phase::Idle) {
            Phase::InFlight { waiters, .. } => waiters,
            Phase::Idle => Vec::new(),
        }
    }
}

/// Serializes refreshes against the issuer.
///
/// Cheap to clone; clones share one phase and waiter list.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(control: Arc<SessionControl>, issuer: Arc<dyn TokenIssuer>) -> Self {
        Self::with_timeout(control, issuer, DEFAULT_REFRESH_TIMEOUT)
    }

    pub fn with_timeout(
        control: Arc<SessionControl>,
        issuer: Arc<dyn TokenIssuer>,
        refresh_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                next_waiter: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                control,
                issuer,
                refresh_timeout,
            }),
        }
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.shared.control
    }

    /// Return a credential newer than `seen`, refreshing if needed.
    ///
    /// `seen` is the credential the caller last used (or `None` if it found
    /// the store empty). If the store already holds a valid credential that
    /// supersedes it, that credential is returned with no issuer call. The
    /// refresh itself always uses the refresh secret currently in the store,
    /// not the one in `seen`.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn ensure_fresh(&self, seen: Option<&Credential>) -> Result<Credential, RefreshError> {
        let (rx, waiter_id) = {
            let mut phase = self.shared.lock_phase();
            let waiter_id = self.shared.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();

            match &mut *phase {
                Phase::Idle => {
                    // Epoch before store: see SessionControl::epoch
                    let epoch = self.shared.control.epoch();
                    let Some(current) = self.shared.control.store().get() else {
                        debug!("refresh requested with empty store");
                        return Err(RefreshError::NoCredential);
                    };

                    let newer_than_seen = match seen {
                        Some(seen) => current.supersedes(seen),
                        None => true,
                    };
                    if newer_than_seen && !current.is_expired(Duration::ZERO) {
                        debug!(
                            fingerprint = current.fingerprint(),
                            "store already holds a newer credential"
                        );
                        return Ok(current);
                    }

                    let generation = self.shared.next_generation.fetch_add(1, Ordering::Relaxed);
                    *phase = Phase::InFlight {
                        started_at: Instant::now(),
                        generation,
                        waiters: vec![Waiter { id: waiter_id, tx }],
                    };
                    metrics::gauge!("session_refresh_waiters").set(1.0);
                    info!(
                        generation,
                        fingerprint = current.fingerprint(),
                        "starting credential refresh"
                    );
                    tokio::spawn(run_refresh(self.shared.clone(), generation, epoch, current));
                }
                Phase::InFlight {
                    generation,
                    waiters,
                    ..
                } => {
                    waiters.push(Waiter { id: waiter_id, tx });
                    metrics::gauge!("session_refresh_waiters").set(waiters.len() as f64);
                    debug!(
                        generation = *generation,
                        waiters = waiters.len(),
                        "joined in-flight refresh"
                    );
                }
            }
            (rx, waiter_id)
        };

        let _ticket = WaiterTicket {
            shared: &self.shared,
            id: waiter_id,
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RefreshError::Transport("refresh task aborted".into())),
        }
    }

    /// Whether no refresh is in flight.
    pub fn is_idle(&self) -> bool {
        matches!(*self.shared.lock_phase(), Phase::Idle)
    }

    /// Number of callers waiting on the in-flight refresh.
    pub fn pending_waiters(&self) -> usize {
        match &*self.shared.lock_phase() {
            Phase::Idle => 0,
            Phase::InFlight { waiters, .. } => waiters.len(),
        }
    }

    /// How long the in-flight refresh has been running.
    pub fn in_flight_for(&self) -> Option<Duration> {
        match &*self.shared.lock_phase() {
            Phase::Idle => None,
            Phase::InFlight { started_at, .. } => Some(started_at.elapsed()),
        }
    }
}

/// Removes a waiter whose caller stopped waiting.
///
/// After a normal resolution the waiter is already gone and the removal is a
/// no-op.
struct WaiterTicket<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for WaiterTicket<'_> {
    fn drop(&mut self) {
        self.shared.remove_waiter(self.id);
    }
}

/// Returns the phase to Idle if the refresh task dies before finishing.
///
/// Dropping the waiters closes their channels, so callers see an aborted
/// refresh instead of hanging.
struct AbortGuard<'a> {
    shared: &'a Shared,
    generation: u64,
    armed: bool,
}

impl Drop for AbortGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let dropped = self.shared.finish(self.generation);
            warn!(
                generation = self.generation,
                waiters = dropped.len(),
                "refresh task aborted"
            );
        }
    }
}

async fn run_refresh(shared: Arc<Shared>, generation: u64, epoch: u64, current: Credential) {
    let mut guard = AbortGuard {
        shared: &shared,
        generation,
        armed: true,
    };
    let started = Instant::now();

    shared.control.mark_expired(epoch, &current).await;

    let result =
        tokio::time::timeout(shared.refresh_timeout, shared.issuer.refresh(&current.refresh)).await;

    let (outcome, label) = match result {
        Ok(Ok(credential)) => {
            let applied = shared.control.commit_refresh(epoch, credential.clone()).await;
            info!(
                generation,
                fingerprint = credential.fingerprint(),
                expires_at = credential.expires_at,
                applied,
                "credential refresh succeeded"
            );
            (Ok(credential), "success")
        }
        Ok(Err(e)) if e.is_denied() => {
            let reason = e.to_string();
            warn!(generation, error = %e, "refresh secret rejected, ending session");
            shared.control.fail_refresh(epoch, &reason).await;
            (Err(RefreshError::Denied(reason)), "denied")
        }
        Ok(Err(e)) => {
            warn!(generation, error = %e, "credential refresh failed (transient)");
            (Err(RefreshError::Transport(e.to_string())), "transport")
        }
        Err(_) => {
            warn!(
                generation,
                timeout_secs = shared.refresh_timeout.as_secs(),
                "credential refresh timed out"
            );
            (
                Err(RefreshError::Transport(format!(
                    "refresh timed out after {}s",
                    shared.refresh_timeout.as_secs()
                ))),
                "timeout",
            )
        }
    };

    if matches!(outcome, Err(RefreshError::Transport(_))) {
        shared.control.recover_refresh(epoch, &current).await;
    }

    metrics::counter!("session_refresh_total", "outcome" => label).increment(1);
    metrics::histogram!("session_refresh_duration_seconds")
        .record(started.elapsed().as_secs_f64());

    let waiters = shared.finish(generation);
    guard.armed = false;

    debug!(generation, waiters = waiters.len(), outcome = label, "resolving refresh waiters");
    for waiter in waiters {
        // A waiter whose caller went away between finish() and here is fine to skip
        let _ = waiter.tx.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AuthState;
    use common::Secret;
    use credential::{BoxFuture, MemoryKv, TokenStore};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Issuer whose refresh blocks until released, then answers with a
    /// scripted result. Counts calls.
    struct ScriptedIssuer {
        calls: AtomicUsize,
        release: Notify,
        gated: bool,
        deny: bool,
    }

    impl ScriptedIssuer {
        fn new(gated: bool, deny: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                release: Notify::new(),
                gated,
                deny,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenIssuer for ScriptedIssuer {
        fn login<'a>(
            &'a self,
            _username: &'a str,
            _password: &'a Secret<String>,
        ) -> BoxFuture<'a, credential::Result<Credential>> {
            Box::pin(async { Err(credential::Error::Http("not scripted".into())) })
        }

        fn refresh<'a>(
            &'a self,
            refresh: &'a Secret<String>,
        ) -> BoxFuture<'a, credential::Result<Credential>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if self.gated {
                    self.release.notified().await;
                }
                if self.deny {
                    return Err(credential::Error::InvalidCredentials(
                        "refresh secret invalid".into(),
                    ));
                }
                assert_eq!(refresh.expose(), "rt_old", "must use the stored refresh secret");
                Ok(Credential::new(
                    format!("at_new_{n}"),
                    "rt_new",
                    4_102_444_800_000,
                ))
            })
        }
    }

    fn expired_credential() -> Credential {
        Credential::new("at_old", "rt_old", 1_000)
    }

    async fn setup(issuer: Arc<ScriptedIssuer>) -> RefreshCoordinator {
        let control = Arc::new(SessionControl::new(
            Arc::new(TokenStore::new(Arc::new(MemoryKv::new()))),
            crate::state::SessionState::new(),
        ));
        control.login(expired_credential(), "alice").await.unwrap();
        RefreshCoordinator::new(control, issuer)
    }

    async fn wait_for_waiters(coordinator: &RefreshCoordinator, n: usize) {
        for _ in 0..200 {
            if coordinator.pending_waiters() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "expected {n} waiters, found {}",
            coordinator.pending_waiters()
        );
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let issuer = ScriptedIssuer::new(true, false);
        let coordinator = setup(issuer.clone()).await;
        let stale = expired_credential();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let coordinator = coordinator.clone();
            let stale = stale.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure_fresh(Some(&stale)).await
            }));
        }
        wait_for_waiters(&coordinator, 10).await;
        assert!(coordinator.in_flight_for().is_some());
        issuer.release.notify_one();

        for h in handles {
            let cred = h.await.unwrap().unwrap();
            assert_eq!(cred.access.expose(), "at_new_1");
        }
        assert_eq!(issuer.calls(), 1);
        assert!(coordinator.is_idle());
        assert!(coordinator.in_flight_for().is_none());
        assert_eq!(
            coordinator.control().store().get().unwrap().access.expose(),
            "at_new_1"
        );
    }

    #[tokio::test]
    async fn newer_stored_credential_skips_refresh() {
        let issuer = ScriptedIssuer::new(false, false);
        let coordinator = setup(issuer.clone()).await;

        let first = coordinator
            .ensure_fresh(Some(&expired_credential()))
            .await
            .unwrap();
        // A caller still holding the old credential gets the refreshed one
        let second = coordinator
            .ensure_fresh(Some(&expired_credential()))
            .await
            .unwrap();

        assert!(first.same_as(&second));
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn empty_store_reports_no_credential() {
        let issuer = ScriptedIssuer::new(false, false);
        let coordinator = setup(issuer.clone()).await;
        coordinator.control().logout().await.unwrap();

        let err = coordinator.ensure_fresh(None).await.unwrap_err();
        assert_eq!(err, RefreshError::NoCredential);
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn denied_refresh_rejects_every_waiter_and_clears_store() {
        let issuer = ScriptedIssuer::new(true, true);
        let coordinator = setup(issuer.clone()).await;

        let mut handles = Vec::new();
        for _ in 0..3 {
            let coordinator = coordinator.clone();
            handles.push(tokio::spawn(async move {
                coordinator.ensure_fresh(Some(&expired_credential())).await
            }));
        }
        wait_for_waiters(&coordinator, 3).await;
        issuer.release.notify_one();

        for h in handles {
            let err = h.await.unwrap().unwrap_err();
            assert!(matches!(err, RefreshError::Denied(_)), "got: {err:?}");
        }
        assert_eq!(issuer.calls(), 1);
        assert!(coordinator.control().store().get().is_none());
        assert!(matches!(
            coordinator.control().state().current(),
            AuthState::RefreshFailed { .. }
        ));
    }

    #[tokio::test]
    async fn state_goes_expired_then_authenticated() {
        let issuer = ScriptedIssuer::new(true, false);
        let coordinator = setup(issuer.clone()).await;
        let mut sub = coordinator.control().state().subscribe();
        assert!(sub.try_recv().unwrap().is_authenticated());

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh(Some(&expired_credential())).await })
        };
        let expired = sub.recv().await.unwrap();
        assert!(matches!(expired, AuthState::Expired { .. }));

        issuer.release.notify_one();
        waiter.await.unwrap().unwrap();
        let refreshed = sub.recv().await.unwrap();
        assert!(refreshed.is_authenticated());
        assert_eq!(refreshed.credential().unwrap().access.expose(), "at_new_1");
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_others_untouched() {
        let issuer = ScriptedIssuer::new(true, false);
        let coordinator = setup(issuer.clone()).await;

        let starter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh(Some(&expired_credential())).await })
        };
        let other = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh(Some(&expired_credential())).await })
        };
        wait_for_waiters(&coordinator, 2).await;

        // A third caller gives up early
        let impatient = tokio::time::timeout(
            Duration::from_millis(20),
            coordinator.ensure_fresh(Some(&expired_credential())),
        )
        .await;
        assert!(impatient.is_err());
        assert_eq!(coordinator.pending_waiters(), 2);

        // Cancelling the caller that started the refresh does not stop it
        starter.abort();
        let _ = starter.await;
        wait_for_waiters(&coordinator, 1).await;

        issuer.release.notify_one();
        let cred = other.await.unwrap().unwrap();
        assert_eq!(cred.access.expose(), "at_new_1");
        assert_eq!(issuer.calls(), 1);
        assert!(coordinator.control().state().current().is_authenticated());
    }

    #[tokio::test]
    async fn logout_during_refresh_discards_result() {
        let issuer = ScriptedIssuer::new(true, false);
        let coordinator = setup(issuer.clone()).await;

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.ensure_fresh(Some(&expired_credential())).await })
        };
        wait_for_waiters(&coordinator, 1).await;
        coordinator.control().logout().await.unwrap();
        issuer.release.notify_one();

        // The waiter still gets the outcome of the refresh it joined
        assert!(waiter.await.unwrap().is_ok());
        assert!(coordinator.control().store().get().is_none());
        assert!(matches!(
            coordinator.control().state().current(),
            AuthState::Unauthenticated
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_issuer_times_out_as_transport_failure() {
        // Gated and never released
        let issuer = ScriptedIssuer::new(true, false);
        let control = Arc::new(SessionControl::new(
            Arc::new(TokenStore::in_memory()),
            crate::state::SessionState::new(),
        ));
        control.login(expired_credential(), "alice").await.unwrap();
        let coordinator =
            RefreshCoordinator::with_timeout(control, issuer.clone(), Duration::from_secs(5));

        let err = coordinator
            .ensure_fresh(Some(&expired_credential()))
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Transport(_)), "got: {err:?}");
        assert!(coordinator.is_idle());
        // Transient failure keeps the credential for the next attempt
        assert!(coordinator.control().store().get().is_some());
        assert!(matches!(
            coordinator.control().state().current(),
            AuthState::Expired { .. }
        ));
    }
}
