//! Process-wide semaphore capping in-flight upstream calls.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Acquire a slot (FIFO), run `fn_`, and release on every exit path —
    /// including panics, since the permit is dropped when `_permit` goes
    /// out of scope.
    pub async fn run<F, Fut, T>(&self, fn_: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("concurrency gate semaphore never closes");
        fn_().await
    }

    #[cfg(test)]
    fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn never_exceeds_cap_and_all_complete() {
        let gate = Arc::new(ConcurrencyGate::new(3));
        let current = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            let current = current.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                gate.run(|| async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.available_permits(), 3);
    }

    #[tokio::test]
    async fn releases_permit_on_early_return() {
        let gate = ConcurrencyGate::new(1);
        gate.run(|| async { 42 }).await;
        assert_eq!(gate.available_permits(), 1);
    }
}
