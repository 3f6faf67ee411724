//! Bounded-concurrency task execution inside a worker.
//!
//! The queue runs whatever the agent enqueues; the concurrency cap is
//! enforced upstream by how many jobs the agent claims. Execution wraps the
//! user function so that errors and panics never propagate past the
//! completion callback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use differential_core::ResultType;

use crate::error::WorkerError;
use crate::registry::Handler;

const DRAIN_TICK: Duration = Duration::from_millis(50);

/// What one execution produced, with its measured duration.
#[derive(Clone, Debug)]
pub struct ExecutionOutcome {
    pub result_type: ResultType,
    pub payload: Vec<u8>,
    pub elapsed_ms: u64,
}

impl ExecutionOutcome {
    pub fn rejection(message: impl Into<String>, elapsed_ms: u64) -> Self {
        let payload = serde_json::to_vec(&serde_json::json!({ "error": message.into() }))
            .unwrap_or_default();
        Self {
            result_type: ResultType::Rejection,
            payload,
            elapsed_ms,
        }
    }
}

#[derive(Default)]
pub struct TaskQueue {
    running: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `handler(args)`, timing it and reporting the outcome through
    /// `on_complete`. Returns an error once the queue is closed.
    pub fn add_task(
        &self,
        handler: Handler,
        args: Vec<u8>,
        on_complete: impl FnOnce(ExecutionOutcome) + Send + 'static,
    ) -> Result<(), WorkerError> {
        if self.is_closed() {
            return Err(WorkerError::QueueClosed);
        }
        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let started = Instant::now();
            // The inner spawn keeps a panicking user function from taking
            // this supervisor down; it surfaces as a rejection instead.
            let joined = tokio::spawn(handler(args)).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let outcome = match joined {
                Ok(Ok(payload)) => ExecutionOutcome {
                    result_type: ResultType::Resolution,
                    payload,
                    elapsed_ms,
                },
                Ok(Err(message)) => ExecutionOutcome::rejection(message, elapsed_ms),
                Err(join_error) if join_error.is_panic() => {
                    ExecutionOutcome::rejection("function panicked", elapsed_ms)
                }
                Err(_) => ExecutionOutcome::rejection("function was cancelled", elapsed_ms),
            };
            on_complete(outcome);
            running.fetch_sub(1, Ordering::SeqCst);
        });
        Ok(())
    }

    /// Refuse new tasks; in-flight ones keep running.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Await in-flight completions.
    pub async fn drain(&self) {
        while self.running_count() > 0 {
            tokio::time::sleep(DRAIN_TICK).await;
        }
    }

    /// Close and drain.
    pub async fn quit(&self) {
        self.close();
        self.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn handler_ok(payload: &'static [u8]) -> Handler {
        Arc::new(move |_args| Box::pin(async move { Ok(payload.to_vec()) }))
    }

    fn collect() -> (
        Arc<Mutex<Vec<ExecutionOutcome>>>,
        impl FnOnce(ExecutionOutcome) + Send + 'static,
    ) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&outcomes);
        (outcomes, move |outcome| {
            sink.lock().unwrap().push(outcome);
        })
    }

    #[tokio::test]
    async fn resolution_carries_payload_and_timing() {
        let queue = TaskQueue::new();
        let (outcomes, on_complete) = collect();
        let slow: Handler = Arc::new(|_args| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(b"\"done\"".to_vec())
            })
        });
        queue.add_task(slow, Vec::new(), on_complete).unwrap();
        queue.drain().await;

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].result_type, ResultType::Resolution);
        assert_eq!(outcomes[0].payload, b"\"done\"");
        assert!(outcomes[0].elapsed_ms >= 20);
    }

    #[tokio::test]
    async fn handler_errors_become_rejections() {
        let queue = TaskQueue::new();
        let (outcomes, on_complete) = collect();
        let failing: Handler =
            Arc::new(|_args| Box::pin(async { Err("out of stock".to_string()) }));
        queue.add_task(failing, Vec::new(), on_complete).unwrap();
        queue.drain().await;

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes[0].result_type, ResultType::Rejection);
        let payload: serde_json::Value = serde_json::from_slice(&outcomes[0].payload).unwrap();
        assert_eq!(payload["error"], "out of stock");
    }

    #[tokio::test]
    async fn panics_become_rejections() {
        let queue = TaskQueue::new();
        let (outcomes, on_complete) = collect();
        let panicking: Handler = Arc::new(|_args| Box::pin(async { panic!("boom") }));
        queue.add_task(panicking, Vec::new(), on_complete).unwrap();
        queue.drain().await;

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes[0].result_type, ResultType::Rejection);
        let payload: serde_json::Value = serde_json::from_slice(&outcomes[0].payload).unwrap();
        assert_eq!(payload["error"], "function panicked");
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_tasks_but_drains_old_ones() {
        let queue = TaskQueue::new();
        let (outcomes, on_complete) = collect();
        let slow: Handler = Arc::new(|_args| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Vec::new())
            })
        });
        queue.add_task(slow.clone(), Vec::new(), on_complete).unwrap();
        queue.close();
        assert!(matches!(
            queue.add_task(slow, Vec::new(), |_| {}),
            Err(WorkerError::QueueClosed)
        ));
        queue.drain().await;
        assert_eq!(queue.running_count(), 0);
        assert_eq!(outcomes.lock().unwrap().len(), 1);
    }
}
