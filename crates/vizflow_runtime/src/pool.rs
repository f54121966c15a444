// SPDX-License-Identifier: MIT OR Apache-2.0
//! Background worker pool.
//!
//! Tasks go into one FIFO queue guarded by a mutex; workers sleep on a
//! condition variable until work arrives. A pool with no workers runs every
//! task on the calling thread, so code that enqueues work always makes
//! progress.
//!
//! Each worker moves through [`WorkerState`]:
//! `Free -> Working -> Free` per task, `Stop -> Done` on graceful shutdown
//! and `Abort` on forced teardown.

use crate::ids::IdAllocator;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use tokio::sync::oneshot;

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The task panicked, or was discarded by `abort`, before producing a result
    #[error("Task dropped before producing a result")]
    TaskDropped,

    /// The OS refused to start a worker thread
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Lifecycle state of one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Waiting for a task
    Free,
    /// Running a task
    Working,
    /// Finishing up; exits once the queue is drained or others take over
    Stop,
    /// Exits after the task in hand, ignoring the queue
    Abort,
    /// Exited after a graceful stop
    Done,
}

impl WorkerState {
    fn is_active(self) -> bool {
        matches!(self, Self::Free | Self::Working)
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Task>,
    workers: BTreeMap<u32, WorkerState>,
    ids: IdAllocator,
    busy: usize,
}

impl PoolState {
    fn active_workers(&self) -> usize {
        self.workers.values().filter(|s| s.is_active()).count()
    }

    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.busy == 0
    }
}

struct Shared {
    state: Mutex<PoolState>,
    work: Condvar,
    idle: Condvar,
}

struct Worker {
    id: u32,
    thread: JoinHandle<()>,
}

/// A resizable set of background threads draining a shared task queue
pub struct WorkerPool {
    shared: Arc<Shared>,
    workers: Vec<Worker>,
}

impl WorkerPool {
    /// Create a pool with `size` workers
    pub fn new(size: usize) -> Result<Self, PoolError> {
        let mut pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: BTreeMap::new(),
                    ids: IdAllocator::new(0, u32::MAX),
                    busy: 0,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            workers: Vec::new(),
        };
        pool.resize(size)?;
        Ok(pool)
    }

    /// Number of live workers
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks waiting for a worker
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Snapshot of every tracked worker's state, by worker id
    pub fn worker_states(&self) -> Vec<(u32, WorkerState)> {
        let state = self.shared.state.lock();
        state.workers.iter().map(|(id, s)| (*id, *s)).collect()
    }

    /// Queue a task. Without workers the task runs right here.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if state.active_workers() == 0 {
            drop(state);
            run_task(Box::new(task));
            return;
        }
        state.queue.push_back(Box::new(task));
        drop(state);
        self.shared.work.notify_one();
    }

    /// Run `f` on the pool and get a handle to its result
    pub fn submit<F, R>(&self, f: F) -> TaskHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.enqueue(move || {
            // The receiver may have been dropped; the result is then unwanted.
            let _ = sender.send(f());
        });
        TaskHandle { receiver }
    }

    /// Grow or shrink the pool.
    ///
    /// New workers start `Free`. Excess workers are flagged `Stop`: each
    /// finishes its current task and exits, and this call waits for them.
    pub fn resize(&mut self, size: usize) -> Result<(), PoolError> {
        let current = self.workers.len();
        if size > current {
            for _ in current..size {
                self.spawn_worker()?;
            }
        } else if size < current {
            let stopping = self.workers.split_off(size);
            self.stop(stopping);
        } else {
            return Ok(());
        }
        tracing::info!("Worker pool resized from {} to {} threads", current, size);
        Ok(())
    }

    /// Block until the queue is empty and no worker is running a task
    pub fn wait_idle(&self) {
        let mut state = self.shared.state.lock();
        while !state.is_idle() {
            self.shared.idle.wait(&mut state);
        }
    }

    /// Forced teardown.
    ///
    /// Queued tasks are dropped without running. Workers exit after the task
    /// they are running and are not joined. The pool is left with no workers,
    /// so later tasks run on the caller.
    pub fn abort(&mut self) {
        let dropped = {
            let mut state = self.shared.state.lock();
            let dropped = std::mem::take(&mut state.queue);
            for worker in &self.workers {
                state.workers.insert(worker.id, WorkerState::Abort);
            }
            if state.busy == 0 {
                self.shared.idle.notify_all();
            }
            dropped
        };
        self.shared.work.notify_all();

        // Dropping the join handles detaches the threads.
        let detached = std::mem::take(&mut self.workers).len();
        tracing::warn!(
            "Worker pool aborted: {} queued tasks dropped, {} workers detached",
            dropped.len(),
            detached
        );
    }

    fn spawn_worker(&mut self) -> Result<(), PoolError> {
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.ids.allocate().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::OutOfMemory, "worker ids exhausted")
            })?;
            state.workers.insert(id, WorkerState::Free);
            id
        };

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(format!("vizflow-worker-{id}"))
            .spawn(move || worker_loop(id, &shared));

        match spawned {
            Ok(thread) => {
                tracing::debug!("Spawned worker {id}");
                self.workers.push(Worker { id, thread });
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                state.workers.remove(&id);
                state.ids.release(id);
                Err(PoolError::Spawn(e))
            }
        }
    }

    fn stop(&mut self, workers: Vec<Worker>) {
        {
            let mut state = self.shared.state.lock();
            for worker in &workers {
                state.workers.insert(worker.id, WorkerState::Stop);
            }
        }
        self.shared.work.notify_all();

        for worker in workers {
            if worker.thread.join().is_err() {
                tracing::warn!("Worker {} terminated abnormally", worker.id);
            }
            let mut state = self.shared.state.lock();
            state.workers.remove(&worker.id);
            state.ids.release(worker.id);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let workers = std::mem::take(&mut self.workers);
        if !workers.is_empty() {
            self.stop(workers);
            tracing::debug!("Worker pool shut down");
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.workers.len())
            .field("queued", &self.queued())
            .finish()
    }
}

fn worker_loop(id: u32, shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        let stopping = match state.workers.get(&id).copied() {
            Some(WorkerState::Free | WorkerState::Working) => false,
            // A stopping worker only drains the queue when nobody else will.
            Some(WorkerState::Stop) if !state.queue.is_empty() && state.active_workers() == 0 => {
                true
            }
            _ => break,
        };

        let Some(task) = state.queue.pop_front() else {
            shared.work.wait(&mut state);
            continue;
        };

        if !stopping {
            state.workers.insert(id, WorkerState::Working);
        }
        state.busy += 1;
        MutexGuard::unlocked(&mut state, || run_task(task));
        state.busy -= 1;

        if let Some(s) = state.workers.get_mut(&id) {
            if *s == WorkerState::Working {
                *s = WorkerState::Free;
            }
        }
        if state.is_idle() {
            shared.idle.notify_all();
        }
    }

    match state.workers.get(&id).copied() {
        Some(WorkerState::Stop) => {
            state.workers.insert(id, WorkerState::Done);
        }
        Some(WorkerState::Abort) => {
            state.workers.remove(&id);
            state.ids.release(id);
        }
        _ => {}
    }
    tracing::debug!("Worker {id} exiting");
}

fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::warn!("Worker task panicked: {}", panic_message(payload.as_ref()));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Result of a submitted task.
///
/// Block on it with [`TaskHandle::wait`] or `.await` it from async code.
#[derive(Debug)]
pub struct TaskHandle<R> {
    receiver: oneshot::Receiver<R>,
}

impl<R> TaskHandle<R> {
    /// Block until the task finishes. Must not be called from async code.
    pub fn wait(self) -> Result<R, PoolError> {
        self.receiver
            .blocking_recv()
            .map_err(|_| PoolError::TaskDropped)
    }

    /// Take the result if the task already finished
    pub fn try_take(&mut self) -> Option<Result<R, PoolError>> {
        match self.receiver.try_recv() {
            Ok(value) => Some(Ok(value)),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(PoolError::TaskDropped)),
        }
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| PoolError::TaskDropped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn zero_workers_run_tasks_inline_in_order() {
        let pool = WorkerPool::new(0).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let caller = std::thread::current().id();
        for i in 0..10 {
            let order = Arc::clone(&order);
            pool.enqueue(move || {
                assert_eq!(std::thread::current().id(), caller);
                order.lock().push(i);
            });
        }
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn every_task_runs_exactly_once() {
        const TASKS: usize = 500;
        let pool = WorkerPool::new(4).unwrap();
        let runs: Arc<Vec<AtomicUsize>> = Arc::new((0..TASKS).map(|_| AtomicUsize::new(0)).collect());
        let total = Arc::new(AtomicUsize::new(0));
        for i in 0..TASKS {
            let runs = Arc::clone(&runs);
            let total = Arc::clone(&total);
            pool.enqueue(move || {
                runs[i].fetch_add(1, Ordering::SeqCst);
                total.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.wait_idle();
        assert_eq!(total.load(Ordering::SeqCst), TASKS);
        assert!(runs.iter().all(|r| r.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn panicking_tasks_do_not_kill_the_pool() {
        let pool = WorkerPool::new(1).unwrap();
        pool.enqueue(|| panic!("boom"));
        let failed = pool.submit(|| -> u32 { panic!("boom again") });
        assert!(matches!(failed.wait(), Err(PoolError::TaskDropped)));
        assert_eq!(pool.submit(|| 21 * 2).wait().unwrap(), 42);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn resize_spawns_and_stops_named_workers() {
        let mut pool = WorkerPool::new(2).unwrap();
        pool.resize(4).unwrap();
        assert_eq!(pool.size(), 4);
        assert_eq!(pool.worker_states().len(), 4);

        let name = pool
            .submit(|| std::thread::current().name().map(str::to_string))
            .wait()
            .unwrap()
            .unwrap();
        assert!(name.starts_with("vizflow-worker-"));

        pool.resize(1).unwrap();
        assert_eq!(pool.size(), 1);
        assert_eq!(pool.worker_states().len(), 1);
        assert_eq!(pool.submit(|| 5).wait().unwrap(), 5);
    }

    #[test]
    fn shrinking_to_zero_finishes_queued_work() {
        let mut pool = WorkerPool::new(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let counter = Arc::new(AtomicUsize::new(0));
        pool.enqueue(move || {
            let _ = gate_rx.recv();
        });
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        gate_tx.send(()).unwrap();
        pool.resize(0).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn dropping_the_pool_drains_the_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::new(2).unwrap();
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                pool.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn abort_drops_queued_tasks() {
        let mut pool = WorkerPool::new(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        pool.enqueue(move || {
            let _ = started_tx.send(());
            let _ = gate_rx.recv();
        });
        started_rx.recv().unwrap();

        let queued: Vec<_> = (0..5).map(|i| pool.submit(move || i)).collect();
        pool.abort();
        let _ = gate_tx.send(());

        for handle in queued {
            assert!(matches!(handle.wait(), Err(PoolError::TaskDropped)));
        }
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.submit(|| 7).wait().unwrap(), 7);
    }

    #[test]
    fn handles_can_be_awaited() {
        let pool = WorkerPool::new(2).unwrap();
        let handle = pool.submit(|| "done");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        assert_eq!(runtime.block_on(handle).unwrap(), "done");
    }
}
