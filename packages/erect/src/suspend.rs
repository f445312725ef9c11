//! Scoped suspension of a task's concurrency permit around an external await.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Scheduler-wide counters the deadlock watchdog reads to decide whether
/// every live task is blocked on something that will never arrive.
///
/// `active` counts tasks that have begun driving and not yet finished;
/// `suspended` counts, among those, the ones currently parked inside
/// [`scoped`]. If the two are equal and nonzero, and the concurrency
/// semaphore is fully idle, no task can possibly make progress on its own.
#[derive(Default)]
pub struct SchedulerStats {
    pub(crate) active: AtomicUsize,
    pub(crate) suspended: AtomicUsize,
}

impl SchedulerStats {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn suspended(&self) -> usize {
        self.suspended.load(Ordering::SeqCst)
    }

    pub(crate) fn enter_active(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn leave_active(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A guard that decrements `suspended` on drop, including when the awaiting
/// future is cancelled rather than polled to completion.
struct SuspendGuard<'a> {
    stats: &'a SchedulerStats,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.stats.suspended.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Release `permit` for the duration of `fut`, then reacquire a fresh permit
/// from `semaphore` before returning.
///
/// This is how a task that blocks on something outside the scheduler's
/// control — most notably, awaiting a module another task hasn't produced
/// yet over the module mapper protocol — avoids holding a concurrency slot
/// it isn't using, while still being visible to the deadlock watchdog as
/// "suspended" rather than "finished".
pub async fn scoped<F: Future>(
    stats: &SchedulerStats,
    semaphore: &Arc<Semaphore>,
    permit: OwnedSemaphorePermit,
    fut: F,
) -> (OwnedSemaphorePermit, F::Output) {
    stats.suspended.fetch_add(1, Ordering::SeqCst);
    let _guard = SuspendGuard { stats };
    drop(permit);

    let output = fut.await;

    let permit = Arc::clone(semaphore)
        .acquire_owned()
        .await
        .expect("semaphore closed while a task was suspended");
    (permit, output)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn releases_and_reacquires_permit() {
        let semaphore = Arc::new(Semaphore::new(1));
        let stats = SchedulerStats::default();
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();

        assert_eq!(semaphore.available_permits(), 0);
        let (permit, ()) = scoped(&stats, &semaphore, permit, async {
            // While suspended, the permit is free for someone else to take.
            assert_eq!(semaphore.available_permits(), 1);
        })
        .await;
        assert_eq!(semaphore.available_permits(), 0);
        assert_eq!(stats.suspended(), 0);
        drop(permit);
    }

    #[tokio::test]
    async fn decrements_suspended_count_even_if_cancelled() {
        let semaphore = Arc::new(Semaphore::new(1));
        let stats = Arc::new(SchedulerStats::default());
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();

        let stats_clone = Arc::clone(&stats);
        let handle = tokio::spawn(async move {
            let (_permit, ()) =
                scoped(&stats_clone, &semaphore, permit, std::future::pending()).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.suspended(), 1);
        handle.abort();
        let _ = handle.await;
        // give the aborted task's drop glue a chance to run
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.suspended(), 0);
    }
}
