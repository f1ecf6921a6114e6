//! Bounded admission queue in front of the completion dependency.
//!
//! At most `max_concurrent` tasks run at once and at most `max_queued` wait
//! behind them. Anything beyond that is rejected on the spot, as is every
//! task offered while the circuit breaker is open. Each settled task reports
//! its outcome to the breaker and hands its slot to the oldest waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use super::circuit_breaker::{CircuitBreaker, CircuitState};

/// Error type for queued work.
#[derive(Debug, thiserror::Error)]
pub enum QueueError<E> {
    #[error("request queue full ({max_queued} already waiting)")]
    Full { max_queued: usize },

    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("request queue closed")]
    Closed,

    #[error("task failed: {0}")]
    Failed(E),
}

impl<E> QueueError<E> {
    /// Capacity rejections: the task never ran and the caller should try later.
    pub fn is_capacity(&self) -> bool {
        matches!(self, Self::Full { .. } | Self::CircuitOpen)
    }
}

/// Shared reference to RequestQueue
pub type SharedRequestQueue = Arc<RequestQueue>;

struct QueueState {
    active: usize,
    waiting: VecDeque<oneshot::Sender<()>>,
    breaker: CircuitBreaker,
}

/// FIFO admission queue with bounded concurrency and bounded backlog.
pub struct RequestQueue {
    state: Mutex<QueueState>,
    max_concurrent: usize,
    max_queued: usize,
}

impl RequestQueue {
    pub fn new(max_concurrent: usize, max_queued: usize, breaker: CircuitBreaker) -> Self {
        Self {
            state: Mutex::new(QueueState {
                active: 0,
                waiting: VecDeque::new(),
                breaker,
            }),
            max_concurrent: max_concurrent.max(1),
            max_queued,
        }
    }

    /// Create a shared reference to this queue
    pub fn shared(self) -> SharedRequestQueue {
        Arc::new(self)
    }

    /// Run `task` once a slot is free.
    ///
    /// The task is not polled at all when the queue rejects it. `Ok` outcomes
    /// count as breaker successes and `Err` outcomes as breaker failures.
    pub async fn enqueue<F, T, E>(&self, task: F) -> Result<T, QueueError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if let Some(rx) = self.admit()? {
            let mut turn = WaitingTurn {
                queue: self,
                rx,
                granted: false,
            };
            (&mut turn.rx).await.map_err(|_| QueueError::Closed)?;
            turn.granted = true;
        }

        let slot = RunningSlot {
            queue: self,
            settled: false,
        };
        let result = task.await;
        slot.settle(result.is_ok());
        result.map_err(QueueError::Failed)
    }

    fn admit<E>(&self) -> Result<Option<oneshot::Receiver<()>>, QueueError<E>> {
        let mut state = self.lock();
        state.waiting.retain(|tx| !tx.is_closed());

        let has_slot = state.active < self.max_concurrent;
        if !has_slot && state.waiting.len() >= self.max_queued {
            debug!(
                active = state.active,
                waiting = state.waiting.len(),
                "Queue full, rejecting"
            );
            return Err(QueueError::Full {
                max_queued: self.max_queued,
            });
        }
        if state.breaker.is_open() {
            debug!("Circuit open, rejecting");
            return Err(QueueError::CircuitOpen);
        }

        if has_slot {
            state.active += 1;
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        state.waiting.push_back(tx);
        debug!(waiting = state.waiting.len(), "Task queued");
        Ok(Some(rx))
    }

    /// Give a slot back, recording `outcome` first when there is one.
    fn release(&self, outcome: Option<bool>) {
        let mut state = self.lock();
        match outcome {
            Some(true) => state.breaker.record_success(),
            Some(false) => state.breaker.record_failure(),
            None => {}
        }
        while let Some(next) = state.waiting.pop_front() {
            if next.send(()).is_ok() {
                return;
            }
        }
        state.active = state.active.saturating_sub(1);
    }

    /// Tasks currently waiting for a slot.
    pub fn depth(&self) -> usize {
        let mut state = self.lock();
        state.waiting.retain(|tx| !tx.is_closed());
        state.waiting.len()
    }

    /// Tasks currently running.
    pub fn active(&self) -> usize {
        self.lock().active
    }

    /// Breaker state, without triggering the half-open transition.
    pub fn breaker_state(&self) -> CircuitState {
        self.lock().breaker.state()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_queued(&self) -> usize {
        self.max_queued
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A queued caller. If dropped after being handed a slot it never used, the
/// slot goes straight back to the queue.
struct WaitingTurn<'a> {
    queue: &'a RequestQueue,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Drop for WaitingTurn<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            self.queue.release(None);
        }
    }
}

/// An occupied slot. Cancelled tasks release without recording an outcome.
struct RunningSlot<'a> {
    queue: &'a RequestQueue,
    settled: bool,
}

impl RunningSlot<'_> {
    fn settle(mut self, ok: bool) {
        self.settled = true;
        self.queue.release(Some(ok));
    }
}

impl Drop for RunningSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.queue.release(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn queue(max_concurrent: usize, max_queued: usize) -> SharedRequestQueue {
        RequestQueue::new(
            max_concurrent,
            max_queued,
            CircuitBreaker::new(3, Duration::from_secs(120)),
        )
        .shared()
    }

    async fn settle_until(mut ready: impl FnMut() -> bool) {
        for _ in 0..1000 {
            if ready() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition never became true");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let q = queue(2, 100);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..20u64 {
            let q = q.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                q.enqueue(async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10 + i % 3)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(i)
                })
                .await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(q.active(), 0);
        assert_eq!(q.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seventh_enqueue_rejected_before_running() {
        let q = queue(1, 5);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let q = q.clone();
            tokio::spawn(async move {
                q.enqueue(async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(0)
                })
                .await
            })
        };
        settle_until(|| q.active() == 1).await;

        let mut queued = Vec::new();
        for i in 1..=5usize {
            let q = q.clone();
            queued.push(tokio::spawn(
                async move { q.enqueue(async move { Ok::<_, String>(i) }).await },
            ));
        }
        settle_until(|| q.depth() == 5).await;

        let ran = AtomicBool::new(false);
        let rejected = q
            .enqueue(async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, String>(7)
            })
            .await;
        assert!(matches!(rejected, Err(QueueError::Full { max_queued: 5 })));
        assert!(!ran.load(Ordering::SeqCst));

        release_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 0);
        for (i, handle) in queued.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap().unwrap(), i + 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_order() {
        let q = queue(1, 10);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = {
            let q = q.clone();
            tokio::spawn(async move {
                q.enqueue(async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
            })
        };
        settle_until(|| q.active() == 1).await;

        let mut handles = Vec::new();
        for i in 0..4 {
            let worker_q = q.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                worker_q.enqueue(async move {
                    order.lock().unwrap().push(i);
                    Ok::<_, String>(())
                })
                .await
            }));
            let expected = i + 1;
            settle_until(|| q.depth() == expected).await;
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_open_breaker_and_reject() {
        let q = queue(1, 5);
        for _ in 0..3 {
            let result = q.enqueue(async { Err::<(), _>("upstream 503") }).await;
            assert!(matches!(result, Err(QueueError::Failed("upstream 503"))));
        }
        assert_eq!(q.breaker_state(), CircuitState::Open);

        let ran = AtomicBool::new(false);
        let result = q
            .enqueue(async {
                ran.store(true, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(QueueError::CircuitOpen)));
        assert!(result.unwrap_err().is_capacity());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_after_cooldown_closes_breaker() {
        let q = queue(1, 5);
        for _ in 0..3 {
            let _ = q.enqueue(async { Err::<(), _>("down") }).await;
        }
        tokio::time::advance(Duration::from_secs(120)).await;

        let result = q.enqueue(async { Ok::<_, &str>("back") }).await;
        assert_eq!(result.unwrap(), "back");
        assert_eq!(q.breaker_state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_frees_its_place() {
        let q = queue(1, 1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = {
            let q = q.clone();
            tokio::spawn(async move {
                q.enqueue(async move {
                    let _ = release_rx.await;
                    Ok::<_, String>(())
                })
                .await
            })
        };
        settle_until(|| q.active() == 1).await;

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(async { Ok::<_, String>(()) }).await })
        };
        settle_until(|| q.depth() == 1).await;
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(q.depth(), 0);
        let next = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(async { Ok::<_, String>(42) }).await })
        };
        settle_until(|| q.depth() == 1).await;

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        assert_eq!(next.await.unwrap().unwrap(), 42);
        assert_eq!(q.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_running_task_releases_slot() {
        let q = queue(1, 1);
        let running = {
            let q = q.clone();
            tokio::spawn(async move {
                q.enqueue(async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, String>(())
                })
                .await
            })
        };
        settle_until(|| q.active() == 1).await;
        running.abort();
        let _ = running.await;

        assert_eq!(q.active(), 0);
        assert_eq!(q.breaker_state(), CircuitState::Closed);
        assert_eq!(q.enqueue(async { Ok::<_, String>(1) }).await.unwrap(), 1);
    }
}
