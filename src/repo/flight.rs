//! Single-flight execution with fan-out delivery
//!
//! The first caller to [`SingleFlight::join`] while idle becomes the leader:
//! its work is spawned onto the runtime and the flight is marked in flight.
//! Callers arriving before the work finishes register a delivery slot and
//! wait on it. When the work completes the waiter list is taken under the
//! lock (which also clears the in-flight marker) and every slot, the
//! leader's included, receives a clone of the same result.
//!
//! The work runs detached from any caller, so a caller that stops waiting
//! never cancels the attempt the others are waiting on. If the work task
//! itself goes away without finishing (a panic, or the runtime dropping it
//! during shutdown) the marker is cleared and every waiter gets
//! [`FlightAborted`].

use parking_lot::Mutex;
use scopeguard::ScopeGuard;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

type Waiters<T> = Arc<Mutex<Option<Vec<oneshot::Sender<T>>>>>;

/// How a caller took part in a flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

/// The attempt ended without delivering a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("in-flight operation was aborted before delivering a result")]
pub struct FlightAborted;

/// A pending delivery slot
#[derive(Debug)]
pub struct Flight<T> {
    role: FlightRole,
    receiver: oneshot::Receiver<T>,
}

impl<T> Flight<T> {
    pub fn role(&self) -> FlightRole {
        self.role
    }

    /// Wait for the attempt's result
    pub async fn wait(self) -> Result<T, FlightAborted> {
        self.receiver.await.map_err(|_| FlightAborted)
    }
}

/// Collapses concurrent identical operations into one execution
#[derive(Debug)]
pub struct SingleFlight<T> {
    waiters: Waiters<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            waiters: Arc::new(Mutex::new(None)),
        }
    }
}

impl<T: Clone + Send + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_flight(&self) -> bool {
        self.waiters.lock().is_some()
    }

    /// Number of callers currently waiting on the in-flight attempt
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().as_ref().map_or(0, Vec::len)
    }

    /// Join the in-flight attempt, or start one running `work`
    ///
    /// `work` is only invoked when the caller becomes the leader. Must be
    /// called from within a tokio runtime.
    pub fn join<F, Fut>(&self, work: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        {
            let mut slot = self.waiters.lock();
            if let Some(waiters) = slot.as_mut() {
                waiters.push(sender);
                return Flight {
                    role: FlightRole::Follower,
                    receiver,
                };
            }
            *slot = Some(vec![sender]);
        }

        let future = work();
        // Armed before the spawn: fires if the task panics or is dropped,
        // even unpolled. Dropping the senders wakes waiters with `FlightAborted`.
        let guard = scopeguard::guard(Arc::clone(&self.waiters), |waiters| {
            waiters.lock().take();
        });
        tokio::spawn(async move {
            let result = future.await;

            let waiters = ScopeGuard::into_inner(guard);
            let delivered = waiters.lock().take().unwrap_or_default();
            for sender in delivered {
                // 接收方可能已放弃等待
                let _ = sender.send(result.clone());
            }
        });

        Flight {
            role: FlightRole::Leader,
            receiver,
        }
    }

    /// Join (or lead) and wait for the result
    pub async fn run<F, Fut>(&self, work: F) -> Result<T, FlightAborted>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        self.join(work).wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flight: Arc<SingleFlight<usize>> = Arc::new(SingleFlight::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let flight = Arc::clone(&flight);
            let executions = Arc::clone(&executions);
            handles.push(tokio::spawn(async move {
                flight
                    .run(move || async move {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        executions.fetch_add(1, Ordering::SeqCst) + 1
                    })
                    .await
            }));
        }

        let results: Vec<usize> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|&r| r == 1));
        assert!(!flight.is_in_flight());
    }

    #[tokio::test]
    async fn test_roles_and_marker() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let leader = flight.join(move || async move {
            let _ = release_rx.await;
            7
        });
        // 跟随者的闭包不会被执行
        let follower = flight.join(|| async { 0 });

        assert_eq!(leader.role(), FlightRole::Leader);
        assert_eq!(follower.role(), FlightRole::Follower);
        assert!(flight.is_in_flight());
        assert_eq!(flight.waiter_count(), 2);

        release_tx.send(()).unwrap();
        assert_eq!(leader.wait().await, Ok(7));
        assert_eq!(follower.wait().await, Ok(7));
        assert!(!flight.is_in_flight());
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flight: SingleFlight<usize> = SingleFlight::new();
        let executions = Arc::new(AtomicUsize::new(0));

        for expected in 1..=3 {
            let executions = Arc::clone(&executions);
            let result = flight
                .run(move || async move { executions.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(result, Ok(expected));
        }
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_cancel_leader() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let finished_clone = Arc::clone(&finished);

        let leader = flight.join(move || async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            finished_clone.fetch_add(1, Ordering::SeqCst);
            1
        });
        let abandoned = tokio::time::timeout(Duration::from_millis(5), leader.wait()).await;
        assert!(abandoned.is_err());

        let follower = flight.join(|| async { 2 });
        assert_eq!(follower.role(), FlightRole::Follower);
        assert_eq!(follower.wait().await, Ok(1));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_work_releases_waiters() {
        let flight: SingleFlight<u32> = SingleFlight::new();

        let leader = flight.join(|| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if true {
                panic!("boom");
            }
            0
        });
        assert_eq!(leader.wait().await, Err(FlightAborted));
        assert!(!flight.is_in_flight());

        assert_eq!(flight.run(|| async { 3 }).await, Ok(3));
    }

    #[test]
    fn test_runtime_shutdown_releases_waiters() {
        let flight: SingleFlight<u32> = SingleFlight::new();
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        let leader = rt.block_on(async { flight.join(std::future::pending::<u32>) });
        assert!(flight.is_in_flight());

        // 运行时关闭时丢弃尚未完成的任务
        drop(rt);

        assert!(!flight.is_in_flight());
        assert_eq!(futures::executor::block_on(leader.wait()), Err(FlightAborted));
    }
}
