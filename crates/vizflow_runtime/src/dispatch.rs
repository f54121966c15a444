// SPDX-License-Identifier: MIT OR Apache-2.0
//! Hand-back of background results to the owning thread.
//!
//! The graph is single-writer: worker tasks must not mutate it. They push
//! closures here instead, and the owning thread drains them between
//! evaluation passes.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

type Job<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Queue of closures to run against a `C` owned by another thread
pub struct MainThreadQueue<C> {
    job_tx: mpsc::UnboundedSender<Job<C>>,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<Job<C>>>>,
}

impl<C> Clone for MainThreadQueue<C> {
    fn clone(&self) -> Self {
        Self {
            job_tx: self.job_tx.clone(),
            job_rx: Arc::clone(&self.job_rx),
        }
    }
}

impl<C> Default for MainThreadQueue<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> MainThreadQueue<C> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        Self {
            job_tx,
            job_rx: Arc::new(Mutex::new(job_rx)),
        }
    }

    /// Queue a closure for the owning thread
    pub fn push<F>(&self, job: F)
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        // Every clone holds the receiver, so the channel is open while `self` lives.
        if self.job_tx.send(Box::new(job)).is_err() {
            tracing::warn!("Main-thread queue closed, dropping job");
        }
    }

    /// Number of queued closures
    pub fn len(&self) -> usize {
        self.job_rx.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.job_rx.lock().is_empty()
    }

    /// Run every queued closure against `target`, in push order. Closures
    /// pushed while draining run on the next drain. Returns how many ran.
    pub fn drain(&self, target: &mut C) -> usize {
        let jobs: Vec<Job<C>> = {
            let mut job_rx = self.job_rx.lock();
            std::iter::from_fn(|| job_rx.try_recv().ok()).collect()
        };
        let count = jobs.len();
        for job in jobs {
            job(target);
        }
        if count > 0 {
            tracing::debug!("Ran {count} main-thread jobs");
        }
        count
    }
}

impl<C> std::fmt::Debug for MainThreadQueue<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainThreadQueue")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;

    #[test]
    fn jobs_run_in_push_order() {
        let queue = MainThreadQueue::<Vec<u32>>::new();
        queue.push(|v| v.push(1));
        queue.push(|v| v.push(2));
        let mut target = Vec::new();
        assert_eq!(queue.drain(&mut target), 2);
        assert_eq!(target, [1, 2]);
        assert!(queue.is_empty());
        assert_eq!(queue.drain(&mut target), 0);
    }

    #[test]
    fn jobs_pushed_while_draining_wait_for_the_next_drain() {
        let queue = MainThreadQueue::<Vec<u32>>::new();
        let inner = queue.clone();
        queue.push(move |v| {
            v.push(1);
            inner.push(|v| v.push(2));
        });
        let mut target = Vec::new();
        assert_eq!(queue.drain(&mut target), 1);
        assert_eq!(target, [1]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain(&mut target), 1);
        assert_eq!(target, [1, 2]);
    }

    #[test]
    fn worker_results_come_back_through_the_queue() {
        let pool = WorkerPool::new(3).unwrap();
        let queue = MainThreadQueue::<Vec<u64>>::new();
        for i in 0..30_u64 {
            let queue = queue.clone();
            pool.enqueue(move || {
                let square = i * i;
                queue.push(move |v| v.push(square));
            });
        }
        pool.wait_idle();

        let mut results = Vec::new();
        assert_eq!(queue.drain(&mut results), 30);
        results.sort_unstable();
        assert_eq!(results, (0..30).map(|i| i * i).collect::<Vec<_>>());
    }
}
