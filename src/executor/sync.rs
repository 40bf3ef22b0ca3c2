//! Host-side synchronization primitives for the executor
//!
//! The offload-sync and prefetch-ready signals are counting semaphores
//! posted from detached worker threads and awaited on the main thread.

use std::sync::{Condvar, Mutex};

/// Counting semaphore over a mutex + condvar.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Semaphore::default()
    }

    /// Add one permit and wake a waiter.
    pub fn post(&self) {
        match self.permits.lock() {
            Ok(mut permits) => {
                *permits += 1;
                self.available.notify_one();
            }
            // A poisoned semaphore means a worker panicked; waiters will
            // see the poison on their own lock attempt.
            Err(err) => tracing::error!(%err, "semaphore poisoned on post"),
        }
    }

    /// Block until a permit is available, then consume it.
    pub fn wait(&self) {
        let mut permits = match self.permits.lock() {
            Ok(p) => p,
            Err(err) => {
                tracing::error!(%err, "semaphore poisoned on wait");
                err.into_inner()
            }
        };
        while *permits == 0 {
            permits = match self.available.wait(permits) {
                Ok(p) => p,
                Err(err) => err.into_inner(),
            };
        }
        *permits -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new());
        let waiter_sem = Arc::clone(&sem);
        let waiter = std::thread::spawn(move || waiter_sem.wait());
        std::thread::sleep(Duration::from_millis(20));
        sem.post();
        waiter.join().expect("waiter must wake");
    }

    #[test]
    fn test_counts_permits() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();
    }
}
