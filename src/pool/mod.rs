// pgkeeper/src/pool/mod.rs
//
// Bounded-concurrency fan-out over a fixed task list. The producer enqueues
// everything up front and closes the queue, so workers only ever drain; the
// result channel is sized to the task count, so no worker blocks on send.
// The pool never retries — a retry policy, if any, belongs to the task.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Runs `worker_fn` over `tasks` with at most `workers` tasks in flight.
/// Result arrival order is unspecified.
pub async fn run<T, R, F, Fut>(workers: usize, tasks: Vec<T>, worker_fn: F) -> Vec<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = R> + Send,
{
    let task_count = tasks.len();
    if task_count == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, task_count);

    let (task_tx, task_rx) = mpsc::channel::<T>(task_count);
    let (result_tx, mut result_rx) = mpsc::channel::<R>(task_count);

    for task in tasks {
        // Cannot fail: the channel holds every task.
        let _ = task_tx.send(task).await;
    }
    drop(task_tx);

    let task_rx = Arc::new(Mutex::new(task_rx));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let task_rx = Arc::clone(&task_rx);
        let result_tx = result_tx.clone();
        let worker_fn = worker_fn.clone();

        handles.push(tokio::spawn(async move {
            loop {
                let task = {
                    let mut rx = task_rx.lock().await;
                    rx.recv().await
                };
                let Some(task) = task else { break };
                let result = worker_fn(task).await;
                if result_tx.send(result).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    for handle in handles {
        let _ = handle.await;
    }

    let mut results = Vec::with_capacity(task_count);
    while let Some(result) = result_rx.recv().await {
        results.push(result);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn processes_every_task() {
        let results = run(3, (0..20).collect(), |n: i32| async move { n * 2 }).await;
        let mut results = results;
        results.sort();
        assert_eq!(results, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn respects_the_worker_bound() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let in_flight2 = Arc::clone(&in_flight);
        let peak2 = Arc::clone(&peak);
        let results = run(4, (0..32).collect::<Vec<i32>>(), move |_| {
            let in_flight = Arc::clone(&in_flight2);
            let peak = Arc::clone(&peak2);
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert_eq!(results.len(), 32);
        assert!(peak.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn empty_task_list_is_a_no_op() {
        let results: Vec<i32> = run(8, Vec::<i32>::new(), |n| async move { n }).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn task_errors_are_collected_not_fatal() {
        let results = run(2, vec![1, 2, 3, 4], |n: i32| async move {
            if n % 2 == 0 {
                Err(format!("task {n} failed"))
            } else {
                Ok(n)
            }
        })
        .await;

        let errors: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(results.len(), 4);
    }
}
