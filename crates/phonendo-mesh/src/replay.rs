//! Reconnection replay loop.
//!
//! At most one loop runs per node. Triggers that arrive while it is alive
//! do not spawn another: they wake it from its backoff sleep, or mark that
//! one more pass is owed if it is mid-pass.
//!
//! Each pass is supplied by the caller and reports whether anything had to
//! be deferred. Deferred passes are retried after `backoff`, without limit
//! unless `max_retries` is set.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};

use phonendo_protocol::DEFAULT_REPLAY_BACKOFF_SECS;

use crate::events::{EventBus, PipelineEvent, ReplayEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayPolicy {
    /// Delay between a deferred pass and the next one.
    pub backoff: Duration,
    /// Retries allowed after the first pass. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ReplayPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(DEFAULT_REPLAY_BACKOFF_SECS),
            max_retries: None,
        }
    }
}

/// What one replay pass achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// Every pending item was handed to its next stage (or there were none).
    Complete { replayed: usize },
    /// Some items stayed put because their next role is unavailable.
    Deferred { deferred: usize },
}

/// One replay pass, produced fresh for each attempt.
pub type ReplayPass = Arc<dyn Fn() -> BoxFuture<'static, PassOutcome> + Send + Sync>;

#[derive(Debug, Default)]
struct LoopState {
    active: bool,
    pending: bool,
}

/// Owns the single replay loop of a node.
pub struct ReplayController {
    policy: ReplayPolicy,
    state: Mutex<LoopState>,
    wake: Notify,
    events: EventBus,
}

impl ReplayController {
    pub fn new(policy: ReplayPolicy, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            policy,
            state: Mutex::new(LoopState::default()),
            wake: Notify::new(),
            events,
        })
    }

    pub fn policy(&self) -> ReplayPolicy {
        self.policy
    }

    /// Whether a loop is currently alive (running a pass or backing off).
    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    /// Request a replay. Starts the loop if idle, otherwise nudges it.
    ///
    /// Returns `true` if this call started a new loop.
    pub async fn trigger(self: &Arc<Self>, pass: ReplayPass) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.active {
                state.pending = true;
                self.wake.notify_one();
                tracing::debug!("Replay already running, waking it");
                return false;
            }
            state.active = true;
            state.pending = false;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(pass).await });
        true
    }

    async fn run(&self, pass: ReplayPass) {
        let mut attempt: u32 = 0;
        loop {
            {
                let mut state = self.state.lock().await;
                state.pending = false;
                // A wake stored before this pass is already served by it.
                let _ = self.wake.notified().now_or_never();
            }
            attempt += 1;
            self.emit(ReplayEvent::Started { attempt });

            match pass().await {
                PassOutcome::Complete { replayed } => {
                    tracing::info!(attempt, replayed, "Reconnection replay complete");
                    self.emit(ReplayEvent::Completed { replayed });
                    if self.finish().await {
                        return;
                    }
                    attempt = 0;
                }
                PassOutcome::Deferred { deferred } => {
                    if self.policy.max_retries.is_some_and(|max| attempt > max) {
                        tracing::warn!(
                            attempts = attempt,
                            deferred,
                            "Replay retries exhausted, leaving items in storage"
                        );
                        self.emit(ReplayEvent::GaveUp { attempts: attempt });
                        if self.finish().await {
                            return;
                        }
                        attempt = 0;
                        continue;
                    }

                    let delay = self.policy.backoff;
                    tracing::info!(attempt, deferred, delay = ?delay, "Replay deferred, retrying later");
                    self.emit(ReplayEvent::RetryScheduled {
                        attempt,
                        delay,
                        deferred,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.wake.notified() => {
                            tracing::debug!("Replay woken early by a role acquisition");
                        }
                    }
                }
            }
        }
    }

    /// End the loop unless a trigger arrived during the last pass. Returns
    /// `true` when the loop should exit.
    async fn finish(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.pending {
            state.pending = false;
            false
        } else {
            state.active = false;
            true
        }
    }

    fn emit(&self, event: ReplayEvent) {
        self.events.emit(PipelineEvent::Replay(event));
    }
}

/// Box an async closure into a [`ReplayPass`].
pub fn replay_pass<F, Fut>(f: F) -> ReplayPass
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PassOutcome> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    async fn next_replay(rx: &mut broadcast::Receiver<PipelineEvent>) -> ReplayEvent {
        loop {
            if let PipelineEvent::Replay(event) = rx.recv().await.unwrap() {
                return event;
            }
        }
    }

    async fn wait_idle(controller: &ReplayController) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while controller.is_active().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("replay loop should stop");
    }

    /// A pass that defers `defer_for` times and then completes.
    fn flaky_pass(defer_for: usize, calls: Arc<AtomicUsize>) -> ReplayPass {
        replay_pass(move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < defer_for {
                    PassOutcome::Deferred { deferred: 1 }
                } else {
                    PassOutcome::Complete { replayed: 1 }
                }
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_full_backoff() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let controller = ReplayController::new(ReplayPolicy::default(), events);
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(controller.trigger(flaky_pass(1, calls.clone())).await);

        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 1 });
        let scheduled = next_replay(&mut rx).await;
        let scheduled_at = Instant::now();
        assert_eq!(
            scheduled,
            ReplayEvent::RetryScheduled {
                attempt: 1,
                delay: Duration::from_secs(10),
                deferred: 1
            }
        );

        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 2 });
        assert!(scheduled_at.elapsed() >= Duration::from_secs(10));
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Completed { replayed: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let policy = ReplayPolicy {
            backoff: Duration::from_secs(1),
            max_retries: Some(2),
        };
        let controller = ReplayController::new(policy, events);
        let calls = Arc::new(AtomicUsize::new(0));

        controller.trigger(flaky_pass(usize::MAX, calls.clone())).await;

        loop {
            if let ReplayEvent::GaveUp { attempts } = next_replay(&mut rx).await {
                assert_eq!(attempts, 3);
                break;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        wait_idle(&controller).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_wakes_sleeping_loop() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let policy = ReplayPolicy {
            backoff: Duration::from_secs(3600),
            max_retries: None,
        };
        let controller = ReplayController::new(policy, events);
        let calls = Arc::new(AtomicUsize::new(0));
        let pass = flaky_pass(1, calls.clone());

        assert!(controller.trigger(pass.clone()).await);
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 1 });
        assert!(matches!(
            next_replay(&mut rx).await,
            ReplayEvent::RetryScheduled { .. }
        ));

        let woken_at = Instant::now();
        assert!(!controller.trigger(pass).await);
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 2 });
        assert!(woken_at.elapsed() < Duration::from_secs(3600));
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Completed { replayed: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_pass_keeps_full_backoff() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let controller = ReplayController::new(ReplayPolicy::default(), events);
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let pass = {
            let gate = gate.clone();
            let calls = calls.clone();
            replay_pass(move || {
                let gate = gate.clone();
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        gate.notified().await;
                        PassOutcome::Complete { replayed: 0 }
                    } else {
                        PassOutcome::Deferred { deferred: 1 }
                    }
                }
            })
        };

        assert!(controller.trigger(pass.clone()).await);
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 1 });

        // Second trigger lands mid-pass: one more pass is owed.
        assert!(!controller.trigger(pass).await);
        gate.notify_one();

        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Completed { replayed: 0 });
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 1 });
        assert!(matches!(
            next_replay(&mut rx).await,
            ReplayEvent::RetryScheduled { attempt: 1, .. }
        ));
        let scheduled_at = Instant::now();

        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 2 });
        assert!(scheduled_at.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_empty_pass_completes_once() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let controller = ReplayController::new(ReplayPolicy::default(), events);

        controller
            .trigger(replay_pass(|| async { PassOutcome::Complete { replayed: 0 } }))
            .await;

        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Started { attempt: 1 });
        assert_eq!(next_replay(&mut rx).await, ReplayEvent::Completed { replayed: 0 });
        wait_idle(&controller).await;
    }
}
