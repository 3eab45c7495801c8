// In crates/dispatcher/src/lib.rs

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tokio::time::{Instant, sleep_until};

/// A deferred exchange call. The boxed future runs the call and delivers the
/// result to the original caller through its captured oneshot sender.
type QueuedRequest = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

struct QueueState {
    queue: VecDeque<QueuedRequest>,
    /// Whether a drain task is currently running. At most one may exist.
    draining: bool,
    /// When the most recent call was dispatched.
    last_dispatch: Option<Instant>,
}

struct Inner {
    state: Mutex<QueueState>,
    min_interval: Duration,
}

/// Serializes and throttles all outbound exchange calls.
///
/// The exchange enforces a fixed requests-per-second ceiling, so every call
/// the engine makes is funneled through one of these: callers `enqueue` a
/// zero-argument async operation and get its result back, while a single
/// drain task dispatches the queue in FIFO order with at least `min_interval`
/// between consecutive dispatch starts. A failing call resolves only its own
/// caller's future; sibling calls already queued are unaffected.
#[derive(Clone)]
pub struct RequestDispatcher {
    inner: Arc<Inner>,
}

impl RequestDispatcher {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    draining: false,
                    last_dispatch: None,
                }),
                min_interval,
            }),
        }
    }

    /// Queues `call` for dispatch and waits for its result.
    ///
    /// Returns exactly what the operation returns. The drain task is started
    /// lazily here when none is active.
    pub async fn enqueue<T, F, Fut>(&self, call: F) -> api_client::Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = api_client::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let request: QueuedRequest = Box::pin(async move {
            let result = call().await;
            // The caller may have been dropped; that is not our problem.
            let _ = tx.send(result);
        });

        let start_drain = {
            let mut state = self.inner.state.lock().await;
            state.queue.push_back(request);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(drain(inner));
        }

        rx.await.map_err(|_| {
            api_client::Error::CustomError("Dispatcher dropped the queued request".to_string())
        })?
    }
}

/// The drain loop: pop the head, wait out the minimum interval since the last
/// dispatch, dispatch, repeat. Exits (clearing the `draining` flag) when the
/// queue is empty.
async fn drain(inner: Arc<Inner>) {
    loop {
        let request = {
            let mut state = inner.state.lock().await;
            match state.queue.pop_front() {
                Some(request) => request,
                None => {
                    state.draining = false;
                    return;
                }
            }
        };

        let deadline = {
            let state = inner.state.lock().await;
            state.last_dispatch.map(|at| at + inner.min_interval)
        };
        if let Some(deadline) = deadline {
            sleep_until(deadline).await;
        }

        {
            let mut state = inner.state.lock().await;
            state.last_dispatch = Some(Instant::now());
        }

        // The request delivers its own result (or failure) to its caller.
        request.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api_client::Error;

    const MIN_INTERVAL: Duration = Duration::from_millis(200);

    #[tokio::test(start_paused = true)]
    async fn dispatch_starts_are_spaced_and_fifo() {
        let dispatcher = RequestDispatcher::new(MIN_INTERVAL);
        let log: Arc<Mutex<Vec<(u32, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let calls = (0..3u32).map(|i| {
            let dispatcher = dispatcher.clone();
            let log = Arc::clone(&log);
            async move {
                dispatcher
                    .enqueue(move || async move {
                        log.lock().await.push((i, Instant::now()));
                        Ok::<u32, Error>(i)
                    })
                    .await
            }
        });

        let results = futures::future::join_all(calls).await;
        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), i as u32);
        }

        let log = log.lock().await;
        assert_eq!(log.len(), 3);
        // FIFO: enqueue order is dispatch order.
        assert_eq!(log.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
        // Throttled: consecutive dispatch starts at least MIN_INTERVAL apart.
        for pair in log.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= MIN_INTERVAL);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_isolated_to_their_caller() {
        let dispatcher = RequestDispatcher::new(MIN_INTERVAL);

        let failing = dispatcher.enqueue(|| async {
            Err::<u32, Error>(Error::ApiError {
                code: 110007,
                msg: "insufficient balance".to_string(),
            })
        });
        let succeeding = dispatcher.enqueue(|| async { Ok::<u32, Error>(7) });

        let (failed, succeeded) = tokio::join!(failing, succeeding);
        assert!(matches!(failed, Err(Error::ApiError { code: 110007, .. })));
        assert_eq!(succeeded.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_restarts_after_queue_empties() {
        let dispatcher = RequestDispatcher::new(MIN_INTERVAL);

        let first = dispatcher.enqueue(|| async { Ok::<u32, Error>(1) }).await;
        assert_eq!(first.unwrap(), 1);

        // The first drain has exited by now; a new enqueue must start another.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = dispatcher.enqueue(|| async { Ok::<u32, Error>(2) }).await;
        assert_eq!(second.unwrap(), 2);
    }
}
