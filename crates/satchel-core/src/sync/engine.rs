//! Sync engine lifecycle and trigger sources.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::instant::Clock;
use super::reason;
use super::reconciler::{Reconciler, SyncOutcome};
use super::sequencer::SyncSequencer;
use super::state::{SyncState, SyncStateHandle};
use super::store::{AuthEvent, IdentityProvider, LocalStore, RemoteStore};
use crate::config::SyncTimings;
use crate::error::Result;

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    local: Arc<dyn LocalStore>,
    identity: Arc<dyn IdentityProvider>,
    remote: Option<Arc<dyn RemoteStore>>,
    timings: SyncTimings,
    clock: Option<Arc<dyn Clock>>,
}

impl SyncEngineBuilder {
    /// Remote snapshot store; without one the engine stays disabled.
    #[must_use]
    pub fn remote(mut self, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        self.remote = remote;
        self
    }

    #[must_use]
    pub const fn timings(mut self, timings: SyncTimings) -> Self {
        self.timings = timings;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> SyncEngine {
        let state = SyncStateHandle::new(self.remote.is_some());
        let mut reconciler = Reconciler::new(
            Arc::clone(&self.local),
            self.remote,
            Arc::clone(&self.identity),
            state.clone(),
        );
        if let Some(clock) = self.clock {
            reconciler = reconciler.with_clock(clock);
        }

        SyncEngine {
            sequencer: Arc::new(SyncSequencer::new(Arc::new(reconciler))),
            local: self.local,
            identity: self.identity,
            state,
            timings: self.timings,
            lifecycle: Mutex::new(None),
        }
    }
}

struct Lifecycle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Keeps the local store and the remote snapshot converged.
///
/// [`SyncEngine::start`] spawns the trigger tasks; [`SyncEngine::stop`]
/// cancels them. Stopping never interrupts a pass that is already running.
pub struct SyncEngine {
    sequencer: Arc<SyncSequencer>,
    local: Arc<dyn LocalStore>,
    identity: Arc<dyn IdentityProvider>,
    state: SyncStateHandle,
    timings: SyncTimings,
    lifecycle: Mutex<Option<Lifecycle>>,
}

impl SyncEngine {
    pub fn builder(
        local: Arc<dyn LocalStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            local,
            identity,
            remote: None,
            timings: SyncTimings::default(),
            clock: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub const fn sequencer(&self) -> &Arc<SyncSequencer> {
        &self.sequencer
    }

    pub fn is_started(&self) -> bool {
        self.lock_lifecycle().is_some()
    }

    /// Interactive sync; errors are returned to the caller.
    pub async fn sync_now(&self, force: bool) -> Result<SyncOutcome> {
        self.sequencer.request(reason::MANUAL, force).await
    }

    /// Spawn the trigger tasks. Must be called inside a tokio runtime.
    ///
    /// Calling `start` on a started engine does nothing.
    pub fn start(&self) {
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let tasks = vec![
            self.spawn_startup(cancel.clone()),
            self.spawn_local_changes(cancel.clone()),
            self.spawn_interval(cancel.clone()),
            self.spawn_auth_changes(cancel.clone()),
        ];
        tracing::info!(
            debounce_ms = u64::try_from(self.timings.debounce.as_millis()).unwrap_or(u64::MAX),
            interval_secs = self.timings.interval.as_secs(),
            "Sync engine started"
        );
        *lifecycle = Some(Lifecycle { cancel, tasks });
    }

    /// Cancel every trigger and drop any queued follow-up. A pass that is
    /// already running completes.
    pub fn stop(&self) {
        if let Some(lifecycle) = self.lock_lifecycle().take() {
            lifecycle.cancel.cancel();
            self.sequencer.clear_pending();
            tracing::info!("Sync engine stopped");
        }
    }

    /// Stop and wait for the trigger tasks to exit.
    pub async fn shutdown(&self) {
        let Some(lifecycle) = self.lock_lifecycle().take() else {
            return;
        };
        lifecycle.cancel.cancel();
        self.sequencer.clear_pending();
        for task in lifecycle.tasks {
            if let Err(error) = task.await {
                tracing::warn!(%error, "Sync trigger task ended abnormally");
            }
        }
        tracing::info!("Sync engine shut down");
    }

    /// Connectivity came back.
    pub fn notify_online(&self) {
        self.spawn_one_shot(reason::ONLINE);
    }

    /// The app became visible again.
    pub fn notify_visible(&self) {
        self.spawn_one_shot(reason::VISIBLE);
    }

    fn spawn_one_shot(&self, trigger: &'static str) {
        let mut lifecycle = self.lock_lifecycle();
        let Some(lifecycle) = lifecycle.as_mut() else {
            tracing::debug!(reason = trigger, "Sync engine stopped; trigger ignored");
            return;
        };

        let sequencer = Arc::clone(&self.sequencer);
        let cancel = lifecycle.cancel.clone();
        lifecycle.tasks.retain(|task| !task.is_finished());
        lifecycle.tasks.push(tokio::spawn(async move {
            if cancel.is_cancelled() {
                return;
            }
            run_background(&sequencer, trigger).await;
        }));
    }

    fn spawn_startup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sequencer = Arc::clone(&self.sequencer);
        let identity = Arc::clone(&self.identity);
        let state = self.state.clone();

        tokio::spawn(async move {
            let user = tokio::select! {
                () = cancel.cancelled() => return,
                user = identity.current_user() => user,
            };
            match user {
                Ok(Some(user)) => state.set_authenticated(user),
                Ok(None) => state.set_signed_out(),
                Err(error) => {
                    tracing::warn!(%error, "Failed to resolve identity at startup");
                }
            }
            if !cancel.is_cancelled() {
                run_background(&sequencer, reason::STARTUP).await;
            }
        })
    }

    fn spawn_local_changes(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sequencer = Arc::clone(&self.sequencer);
        let mut changes = self.local.subscribe_to_local_data_changes();
        let debounce = self.timings.debounce;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    received = changes.recv() => {
                        if matches!(received, Err(RecvError::Closed)) {
                            return;
                        }
                    }
                }
                record_local_change(sequencer.reconciler()).await;

                if !wait_for_quiet(&mut changes, &cancel, debounce, sequencer.reconciler()).await {
                    return;
                }
                run_background(&sequencer, reason::LOCAL_CHANGE).await;
            }
        })
    }

    fn spawn_interval(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sequencer = Arc::clone(&self.sequencer);
        let period = self.timings.interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                run_background(&sequencer, reason::INTERVAL).await;
            }
        })
    }

    fn spawn_auth_changes(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let sequencer = Arc::clone(&self.sequencer);
        let mut events = self.identity.subscribe_auth_changes();
        let state = self.state.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                match event {
                    Ok(AuthEvent::SignedIn(user)) => {
                        tracing::info!(user_id = %user.id, "Signed in; requesting sync");
                        state.set_authenticated(user);
                        run_background(&sequencer, reason::AUTH_CHANGE).await;
                    }
                    Ok(AuthEvent::SignedOut) => {
                        tracing::info!("Signed out");
                        state.set_signed_out();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Auth events lagged");
                    }
                    Err(RecvError::Closed) => return,
                }
            }
        })
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Option<Lifecycle>> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if let Some(lifecycle) = self.lock_lifecycle().take() {
            lifecycle.cancel.cancel();
            self.sequencer.clear_pending();
        }
    }
}

/// Wait until no change arrives for `debounce`. Returns `false` on shutdown.
async fn wait_for_quiet(
    changes: &mut tokio::sync::broadcast::Receiver<super::store::LocalChange>,
    cancel: &CancellationToken,
    debounce: Duration,
    reconciler: &Reconciler,
) -> bool {
    loop {
        tokio::select! {
            () = cancel.cancelled() => return false,
            () = sleep(debounce) => return true,
            received = changes.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => record_local_change(reconciler).await,
                Err(RecvError::Closed) => return true,
            },
        }
    }
}

async fn record_local_change(reconciler: &Reconciler) {
    if let Err(error) = reconciler.record_local_change().await {
        tracing::warn!(%error, "Failed to record local change");
    }
}

async fn run_background(sequencer: &SyncSequencer, trigger: &'static str) {
    match sequencer.request(trigger, false).await {
        Ok(outcome) => tracing::debug!(reason = trigger, %outcome, "Background sync finished"),
        Err(error) => tracing::warn!(reason = trigger, %error, "Background sync failed"),
    }
}
