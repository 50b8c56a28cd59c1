//! Per-record expiration jobs.
//!
//! A [`TtlJob`] holds at most one live timer scheduled at an absolute
//! wall-clock instant. Recomputing the TTL reschedules only when the
//! instant actually changed; cancellation is idempotent. When the timer
//! fires it sends an [`ExpiryNotice`] to the owning manager, which emits
//! the `expire` cascade (or drops content, under the `keep` policy).

use cachegrid_core::TtlPolicy;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::clock::instant_at;

/// What a fired TTL timer tells the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryNotice {
    pub scope: String,
    pub key: String,
    pub policy: TtlPolicy,
}

/// Sender half of a manager's expiry channel.
pub type ExpiryTx = mpsc::UnboundedSender<ExpiryNotice>;

struct ScheduledExpiry {
    fire_at: i64,
    handle: JoinHandle<()>,
}

/// The single expiration timer of one record.
#[derive(Default)]
pub struct TtlJob {
    slot: Mutex<Option<ScheduledExpiry>>,
}

impl TtlJob {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules (or reschedules) the timer at `fire_at` millis since epoch.
    ///
    /// A live timer at the same instant is left alone, so sliding-TTL
    /// accesses that do not move the deadline cost nothing.
    pub fn schedule(&self, fire_at: i64, notice: ExpiryNotice, tx: ExpiryTx) {
        let mut slot = self.slot.lock();
        if let Some(current) = slot.as_ref() {
            if current.fire_at == fire_at && !current.handle.is_finished() {
                return;
            }
        }
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(instant_at(fire_at)).await;
            // The manager may already be gone during teardown.
            let _ = tx.send(notice);
        });
        *slot = Some(ScheduledExpiry { fire_at, handle });
    }

    /// Cancels the timer. Idempotent.
    pub fn cancel(&self) {
        if let Some(scheduled) = self.slot.lock().take() {
            scheduled.handle.abort();
        }
    }

    /// The instant the live timer will fire, if one is scheduled.
    #[must_use]
    pub fn scheduled_at(&self) -> Option<i64> {
        self.slot
            .lock()
            .as_ref()
            .filter(|scheduled| !scheduled.handle.is_finished())
            .map(|scheduled| scheduled.fire_at)
    }
}

impl Drop for TtlJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::now_millis;

    fn notice(key: &str) -> ExpiryNotice {
        ExpiryNotice {
            scope: "global".to_string(),
            key: key.to_string(),
            policy: TtlPolicy::Evict,
        }
    }

    #[tokio::test]
    async fn fires_at_the_scheduled_instant() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = TtlJob::new();
        job.schedule(now_millis() + 30, notice("k"), tx);

        let received = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timer should fire")
            .expect("notice");
        assert_eq!(received.key, "k");
        assert_eq!(received.policy, TtlPolicy::Evict);
    }

    #[tokio::test]
    async fn cancel_prevents_the_notice() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = TtlJob::new();
        job.schedule(now_millis() + 20, notice("k"), tx);
        job.cancel();
        job.cancel(); // idempotent

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(job.scheduled_at(), None);
    }

    #[tokio::test]
    async fn reschedule_replaces_the_old_instant() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = TtlJob::new();
        let near = now_millis() + 20;
        let far = now_millis() + 5_000;

        job.schedule(near, notice("k"), tx.clone());
        job.schedule(far, notice("k"), tx);
        assert_eq!(job.scheduled_at(), Some(far));

        // The near timer was aborted, so nothing fires in its window.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn same_instant_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let job = TtlJob::new();
        let at = now_millis() + 10_000;

        job.schedule(at, notice("k"), tx.clone());
        let first = job.scheduled_at();
        job.schedule(at, notice("k"), tx);
        assert_eq!(job.scheduled_at(), first);
    }

    #[tokio::test]
    async fn at_most_one_timer_is_live() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = TtlJob::new();
        for _ in 0..10 {
            job.schedule(now_millis() + 20, notice("k"), tx.clone());
        }
        drop(job.scheduled_at());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err(), "only one notice may arrive");
    }
}
