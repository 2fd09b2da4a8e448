//! One-shot wake timers per job.
//!
//! Each job has at most one pending timer. Scheduling again replaces it, and
//! a fired timer sends the job id on the engine's wake channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::Clock;

pub type WakeSender = mpsc::UnboundedSender<Uuid>;
pub type WakeReceiver = mpsc::UnboundedReceiver<Uuid>;

/// Channel on which fired timers deliver job ids.
pub fn wake_channel() -> (WakeSender, WakeReceiver) {
    mpsc::unbounded_channel()
}

struct Timer {
    generation: u64,
    token: CancellationToken,
}

#[derive(Clone)]
pub struct Scheduler {
    wakes: WakeSender,
    clock: Arc<dyn Clock>,
    /// Pending timers keyed by job id.
    timers: Arc<DashMap<Uuid, Timer>>,
    generation: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new(wakes: WakeSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            wakes,
            clock,
            timers: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wake `job_id` at `at`, replacing any pending timer for it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, job_id: Uuid, at: DateTime<Utc>) {
        let delay = (at - self.clock.now()).to_std().unwrap_or_default();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let timer = Timer {
            generation,
            token: token.clone(),
        };
        if let Some(previous) = self.timers.insert(job_id, timer) {
            previous.token.cancel();
        }

        let wakes = self.wakes.clone();
        let timers = Arc::clone(&self.timers);
        let deadline = tokio::time::Instant::now() + delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    timers.remove_if(&job_id, |_, timer| timer.generation == generation);
                    if wakes.send(job_id).is_err() {
                        tracing::debug!(%job_id, "wake dropped: engine stopped");
                    }
                }
            }
        });
        tracing::debug!(%job_id, %at, delay_ms = delay.as_millis() as u64, "wake scheduled");
    }

    /// Drop the pending timer for `job_id`, if any.
    pub fn cancel(&self, job_id: Uuid) {
        if let Some((_, timer)) = self.timers.remove(&job_id) {
            timer.token.cancel();
        }
    }

    /// Number of jobs with a pending timer.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Cancel every pending timer.
    pub fn clear(&self) {
        self.timers.retain(|_, timer| {
            timer.token.cancel();
            false
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.timers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpreter::clock::TokioClock;
    use std::time::Duration;

    fn scheduler() -> (Scheduler, WakeReceiver, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::new(Utc::now()));
        let (tx, rx) = wake_channel();
        (Scheduler::new(tx, clock.clone()), rx, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_at_deadline() {
        let (scheduler, mut rx, clock) = scheduler();
        let job_id = Uuid::now_v7();
        let start = clock.now();
        scheduler.schedule(job_id, start + chrono::Duration::seconds(5));
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(rx.recv().await, Some(job_id));
        assert!(clock.now() >= start + chrono::Duration::seconds(5));
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_pending_timer() {
        let (scheduler, mut rx, clock) = scheduler();
        let job_id = Uuid::now_v7();
        scheduler.schedule(job_id, clock.now() + chrono::Duration::seconds(10));
        scheduler.schedule(job_id, clock.now() + chrono::Duration::seconds(2));
        assert_eq!(scheduler.pending(), 1);

        assert_eq!(rx.recv().await, Some(job_id));
        let second = tokio::time::timeout(Duration::from_secs(60), rx.recv()).await;
        assert!(second.is_err(), "replaced timer must not fire");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let (scheduler, mut rx, clock) = scheduler();
        let job_id = Uuid::now_v7();
        scheduler.schedule(job_id, clock.now() + chrono::Duration::seconds(1));
        scheduler.cancel(job_id);
        assert_eq!(scheduler.pending(), 0);

        let fired = tokio::time::timeout(Duration::from_secs(30), rx.recv()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_fires_immediately() {
        let (scheduler, mut rx, clock) = scheduler();
        let job_id = Uuid::now_v7();
        scheduler.schedule(job_id, clock.now() - chrono::Duration::seconds(30));
        assert_eq!(rx.recv().await, Some(job_id));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_everything() {
        let (scheduler, mut rx, clock) = scheduler();
        for _ in 0..3 {
            scheduler.schedule(Uuid::now_v7(), clock.now() + chrono::Duration::seconds(1));
        }
        assert_eq!(scheduler.pending(), 3);
        scheduler.clear();
        assert_eq!(scheduler.pending(), 0);
        assert!(tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.is_err());
    }
}
