//! Sync scheduling: coalesced on-demand turns plus an optional periodic trigger.
//!
//! At most one turn runs at a time. Requests that arrive while a turn is
//! active collapse into a single rerun that starts once the turn finishes.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use fieldsync_common::{Error, Result};

/// One sync turn. Errors are handled inside the turn.
pub type TurnFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// What a sync request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    /// A new turn was started.
    Started,
    /// A rerun was scheduled after the active turn.
    Queued,
    /// A rerun was already scheduled; nothing changed.
    AlreadyQueued,
    /// The queue is paused; the request runs on resume.
    Paused,
}

#[derive(Debug, Default)]
struct QueueState {
    active: bool,
    rerun_requested: bool,
    paused: bool,
}

struct QueueShared {
    state: Mutex<QueueState>,
    /// `true` while no turn is running.
    idle_tx: watch::Sender<bool>,
    turns_started: AtomicU64,
    turn: TurnFn,
}

impl QueueShared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Request-coalescing scheduler for sync turns.
#[derive(Clone)]
pub struct SyncQueue {
    shared: Arc<QueueShared>,
    runtime: Handle,
}

impl SyncQueue {
    /// Create a queue running `turn` on the current tokio runtime.
    ///
    /// # Errors
    /// - `Configuration` if called outside a tokio runtime
    pub fn new(turn: TurnFn) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Configuration("sync queue requires a tokio runtime".to_string())
        })?;
        let (idle_tx, _) = watch::channel(true);
        Ok(Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                idle_tx,
                turns_started: AtomicU64::new(0),
                turn,
            }),
            runtime,
        })
    }

    /// Start a turn, or coalesce into the pending rerun.
    pub fn request_sync(&self) -> RequestOutcome {
        let mut state = self.shared.state();
        if state.paused {
            state.rerun_requested = true;
            return RequestOutcome::Paused;
        }
        if state.active {
            if state.rerun_requested {
                return RequestOutcome::AlreadyQueued;
            }
            state.rerun_requested = true;
            debug!("Sync turn active; rerun queued");
            return RequestOutcome::Queued;
        }
        self.start(&mut state);
        RequestOutcome::Started
    }

    fn start(&self, state: &mut QueueState) {
        state.active = true;
        state.rerun_requested = false;
        self.shared.idle_tx.send_replace(false);
        self.runtime.spawn(drive(self.shared.clone()));
    }

    /// Stop starting new turns. The active turn runs to completion.
    pub fn pause(&self) {
        self.shared.state().paused = true;
    }

    /// Allow turns again, starting one if a request arrived while paused.
    pub fn resume(&self) {
        let mut state = self.shared.state();
        state.paused = false;
        if state.rerun_requested && !state.active {
            self.start(&mut state);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state().paused
    }

    pub fn is_active(&self) -> bool {
        self.shared.state().active
    }

    pub fn turns_started(&self) -> u64 {
        self.shared.turns_started.load(Ordering::SeqCst)
    }

    /// Wait until no turn is running and no rerun is left to start.
    pub async fn wait_idle(&self) {
        let mut idle = self.shared.idle_tx.subscribe();
        // the sender lives as long as `self`
        let _ = idle.wait_for(|idle| *idle).await;
    }

    /// Request a sync every `period` until `stop` is cancelled.
    pub fn spawn_periodic(&self, period: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let outcome = queue.request_sync();
                        debug!(?outcome, "Periodic sync request");
                    }
                }
            }
            debug!("Periodic sync stopped");
        })
    }
}

async fn drive(shared: Arc<QueueShared>) {
    loop {
        shared.turns_started.fetch_add(1, Ordering::SeqCst);
        if AssertUnwindSafe((shared.turn)()).catch_unwind().await.is_err() {
            error!("Sync turn panicked");
        }

        let mut state = shared.state();
        if state.rerun_requested && !state.paused {
            state.rerun_requested = false;
            debug!("Starting queued sync turn");
            continue;
        }
        state.active = false;
        shared.idle_tx.send_replace(true);
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_turn(runs: Arc<AtomicUsize>, work: Duration) -> TurnFn {
        Arc::new(move || {
            let runs = runs.clone();
            async move {
                tokio::time::sleep(work).await;
                runs.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_during_a_turn_coalesce() {
        let runs = Arc::new(AtomicUsize::new(0));
        let queue = SyncQueue::new(counting_turn(runs.clone(), Duration::from_millis(50))).unwrap();

        assert_eq!(queue.request_sync(), RequestOutcome::Started);
        assert_eq!(queue.request_sync(), RequestOutcome::Queued);
        for _ in 0..10 {
            assert_eq!(queue.request_sync(), RequestOutcome::AlreadyQueued);
        }

        queue.wait_idle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(queue.turns_started(), 2);
        assert!(!queue.is_active());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let queue = SyncQueue::new(counting_turn(Arc::new(AtomicUsize::new(0)), Duration::ZERO)).unwrap();
        queue.wait_idle().await;
        assert_eq!(queue.turns_started(), 0);
    }

    #[tokio::test]
    async fn test_panicking_turn_releases_the_queue() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let turn: TurnFn = Arc::new(move || {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                if first {
                    panic!("turn blew up");
                }
            }
            .boxed()
        });
        let queue = SyncQueue::new(turn).unwrap();

        queue.request_sync();
        queue.wait_idle().await;
        assert_eq!(queue.request_sync(), RequestOutcome::Started);
        queue.wait_idle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_requests_run_on_resume() {
        let runs = Arc::new(AtomicUsize::new(0));
        let queue = SyncQueue::new(counting_turn(runs.clone(), Duration::from_millis(10))).unwrap();

        queue.pause();
        assert_eq!(queue.request_sync(), RequestOutcome::Paused);
        assert_eq!(queue.request_sync(), RequestOutcome::Paused);
        queue.wait_idle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        queue.resume();
        queue.wait_idle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_trigger() {
        let runs = Arc::new(AtomicUsize::new(0));
        let queue = SyncQueue::new(counting_turn(runs.clone(), Duration::ZERO)).unwrap();
        let stop = CancellationToken::new();

        let ticker = queue.spawn_periodic(Duration::from_secs(10), stop.clone());
        tokio::time::sleep(Duration::from_secs(35)).await;
        stop.cancel();
        ticker.await.unwrap();
        queue.wait_idle().await;

        assert!(runs.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_requires_runtime() {
        let err = SyncQueue::new(counting_turn(Arc::new(AtomicUsize::new(0)), Duration::ZERO))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
