//! Render session pool
//!
//! Admits capture work against a fixed ceiling of concurrently leased
//! sessions. Callers beyond the ceiling queue in FIFO order; a release hands
//! its slot straight to the head of the queue so a fresh `acquire()` can never
//! overtake a queued one.
//!
//! All bookkeeping lives in one [`PoolState`] behind a single mutex. Engine
//! disconnects arrive as [`EngineEvent`]s on the pool's control loop, which
//! invalidates every outstanding lease and reconnects. A lease is only handed
//! out once its slot is confirmed against the current generation, so a
//! session opened across a reconnect is still counted.

use crate::{CaptureError, EngineEvent, PoolSettings, RenderEngine, RenderSession};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

type Grant = Result<u64, CaptureError>;

struct PoolState {
    /// Leased slots, including ones whose session is still being opened
    active: usize,
    /// Bumped whenever outstanding leases are written off wholesale
    generation: u64,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    shutting_down: bool,
    opened_total: u64,
    reconnects: u64,
}

pub struct SessionPool {
    engine: Arc<dyn RenderEngine>,
    settings: PoolSettings,
    state: Mutex<PoolState>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Serialises reconnects between the control loop and lazy reconnects in `acquire`
    reconnect_lock: tokio::sync::Mutex<()>,
    control: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionPool {
    /// Connect the engine and start the control loop that watches for disconnects.
    pub async fn start(
        engine: Arc<dyn RenderEngine>,
        settings: PoolSettings,
    ) -> Result<Arc<Self>, CaptureError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        engine.connect(events_tx.clone()).await?;

        let pool = Arc::new(Self {
            engine,
            settings,
            state: Mutex::new(PoolState {
                active: 0,
                generation: 0,
                waiters: VecDeque::new(),
                shutting_down: false,
                opened_total: 0,
                reconnects: 0,
            }),
            events_tx,
            reconnect_lock: tokio::sync::Mutex::new(()),
            control: Mutex::new(None),
        });

        let handle = tokio::spawn(control_loop(Arc::downgrade(&pool), events_rx));
        *lock(&pool.control) = Some(handle);

        info!(ceiling = pool.ceiling(), "Render session pool started");
        Ok(pool)
    }

    pub fn ceiling(&self) -> usize {
        self.settings.max_sessions.max(1)
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        lock(&self.state)
    }

    /// Lease a session, waiting in line if the ceiling is reached.
    pub async fn acquire(self: &Arc<Self>) -> Result<SessionLease, CaptureError> {
        loop {
            let slot = {
                let mut state = self.state();
                if state.shutting_down {
                    return Err(CaptureError::PoolShuttingDown);
                }
                if state.active < self.ceiling() && state.waiters.is_empty() {
                    state.active += 1;
                    Ok(state.generation)
                } else {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    debug!(queued = state.waiters.len(), "Session lease queued");
                    Err(PendingLease {
                        rx,
                        pool: self.clone(),
                    })
                }
            };

            let generation = match slot {
                Ok(generation) => generation,
                Err(mut pending) => pending.wait().await?,
            };
            crate::metrics::record_pool_usage(&self.stats());

            if !self.engine.is_connected() {
                if let Err(e) = self.reconnect_once().await {
                    self.free_slot(generation);
                    return Err(e);
                }
            }

            let session = match self.engine.open_session().await {
                Ok(session) => session,
                Err(e) => {
                    warn!("Failed to open render session: {}", e);
                    self.free_slot(generation);
                    return Err(e);
                }
            };

            if let Some(generation) = self.confirm_slot(generation) {
                return Ok(SessionLease {
                    session: Some(session),
                    generation,
                    pool: self.clone(),
                });
            }

            // The slot was written off while the session was opening
            debug!("Session lease lost to a reconnect, queueing again");
            session.close().await;
        }
    }

    /// Check that `generation` still owns a counted slot, claiming a fresh
    /// one if a write-off dropped it and there is room without overtaking
    /// queued callers.
    fn confirm_slot(&self, generation: u64) -> Option<u64> {
        let mut state = self.state();
        let confirmed = if generation == state.generation {
            Some(generation)
        } else if !state.shutting_down
            && state.active < self.ceiling()
            && state.waiters.is_empty()
        {
            state.active += 1;
            Some(state.generation)
        } else {
            None
        };
        if confirmed.is_some() {
            state.opened_total += 1;
        }
        confirmed
    }

    /// Close a leased session and pass its slot on.
    pub async fn release(&self, lease: SessionLease) {
        lease.release().await;
    }

    /// Give a slot back: to the oldest live waiter if there is one, otherwise to the pool.
    fn free_slot(&self, generation: u64) {
        let mut state = self.state();
        if generation != state.generation {
            // Already written off by a disconnect or a forced shutdown
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.send(Ok(generation)).is_ok() {
                return;
            }
        }

        state.active = state.active.saturating_sub(1);
        drop(state);
        crate::metrics::record_pool_usage(&self.stats());
    }

    /// Hand free slots to queued callers, e.g. after a reconnect reset the count.
    fn grant_waiters(&self) {
        let mut state = self.state();
        let ceiling = self.ceiling();
        while state.active < ceiling {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.send(Ok(state.generation)).is_ok() {
                state.active += 1;
            }
        }
    }

    /// Every outstanding lease died with the engine.
    fn write_off(&self) {
        let mut state = self.state();
        state.generation += 1;
        let lost = std::mem::replace(&mut state.active, 0);
        if lost > 0 {
            warn!(lost_sessions = lost, "Writing off leases from the lost render engine");
        }
    }

    /// Re-establish a lost engine. Whoever gets here first writes off the
    /// old leases; a late disconnect event finds the engine up and does nothing.
    async fn reconnect_once(&self) -> Result<(), CaptureError> {
        let _guard = self.reconnect_lock.lock().await;
        if self.engine.is_connected() {
            return Ok(());
        }
        self.write_off();
        if self.state().shutting_down {
            return Err(CaptureError::PoolShuttingDown);
        }
        self.engine.connect(self.events_tx.clone()).await?;
        self.state().reconnects += 1;
        info!("Render engine reconnected");
        self.grant_waiters();
        Ok(())
    }

    async fn handle_disconnect(&self, reason: &str) {
        warn!("Render engine disconnected: {}", reason);

        let attempts = self.settings.reconnect_attempts.max(1);
        for attempt in 1..=attempts {
            match self.reconnect_once().await {
                Ok(()) | Err(CaptureError::PoolShuttingDown) => return,
                Err(e) => {
                    warn!(attempt, "Reconnect failed: {}", e);
                    sleep(self.settings.reconnect_backoff * attempt as u32).await;
                }
            }
        }

        error!("Render engine could not be re-established after {} attempts", attempts);
        let waiters = std::mem::take(&mut self.state().waiters);
        for waiter in waiters {
            let _ = waiter.send(Err(CaptureError::Engine(
                "render engine unavailable".to_string(),
            )));
        }
    }

    /// Reject queued leases, wait out the grace period, then force-close
    /// whatever is still leased and tear the engine down.
    pub async fn shutdown(&self) {
        let waiters = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            std::mem::take(&mut state.waiters)
        };

        info!(rejected = waiters.len(), "Shutting down render session pool...");
        for waiter in waiters {
            let _ = waiter.send(Err(CaptureError::PoolShuttingDown));
        }

        let deadline = Instant::now() + self.settings.shutdown_grace;
        loop {
            let active = self.state().active;
            if active == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(active, "Grace period elapsed, force-closing sessions");
                let mut state = self.state();
                state.generation += 1;
                state.active = 0;
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }

        self.engine.disconnect().await;
        if let Some(handle) = lock(&self.control).take() {
            handle.abort();
        }
        info!("Render session pool shutdown complete");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            ceiling: self.ceiling(),
            active: state.active,
            queued: state.waiters.len(),
            opened_total: state.opened_total,
            reconnects: state.reconnects,
            connected: self.engine.is_connected(),
            shutting_down: state.shutting_down,
        }
    }
}

async fn control_loop(pool: Weak<SessionPool>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    while let Some(event) = events.recv().await {
        let Some(pool) = pool.upgrade() else {
            break;
        };
        match event {
            EngineEvent::Disconnected { reason } => pool.handle_disconnect(&reason).await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A caller waiting in the FIFO queue.
///
/// Dropping it after a slot was already granted passes that slot on, so a
/// cancelled `acquire()` never leaks capacity.
struct PendingLease {
    rx: oneshot::Receiver<Grant>,
    pool: Arc<SessionPool>,
}

impl PendingLease {
    async fn wait(&mut self) -> Grant {
        match (&mut self.rx).await {
            Ok(grant) => grant,
            Err(_) => Err(CaptureError::PoolShuttingDown),
        }
    }
}

impl Drop for PendingLease {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Ok(generation)) = self.rx.try_recv() {
            self.pool.free_slot(generation);
        }
    }
}

/// Exclusive use of one render session until released or dropped.
pub struct SessionLease {
    session: Option<Box<dyn RenderSession>>,
    generation: u64,
    pool: Arc<SessionPool>,
}

impl SessionLease {
    pub fn session(&self) -> &dyn RenderSession {
        self.session
            .as_deref()
            .expect("SessionLease: session already released")
    }

    pub async fn release(mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.pool.free_slot(self.generation);
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let pool = self.pool.clone();
        let generation = self.generation;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.close().await;
                    pool.free_slot(generation);
                });
            }
            Err(_) => pool.free_slot(generation),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub ceiling: usize,
    pub active: usize,
    pub queued: usize,
    pub opened_total: u64,
    pub reconnects: u64,
    pub connected: bool,
    pub shutting_down: bool,
}
