use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Completion handle for a submitted job.
///
/// Completion is signaled even if the job panics, so a waiter can never hang
/// on a dead task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
}

struct TaskState {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl TaskHandle {
    fn pending() -> Self {
        Self {
            state: Arc::new(TaskState {
                done: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    /// An already-resolved handle, used when work degrades to a no-op
    /// because a pool is shutting down.
    pub fn completed() -> Self {
        let handle = Self::pending();
        *handle.state.done.lock() = true;
        handle
    }

    fn mark_done(&self) {
        let mut done = self.state.done.lock();
        *done = true;
        self.state.condvar.notify_all();
    }

    pub fn is_done(&self) -> bool {
        *self.state.done.lock()
    }

    /// Blocks until the job finishes.
    pub fn wait(&self) {
        let mut done = self.state.done.lock();
        while !*done {
            self.state.condvar.wait(&mut done);
        }
    }

    /// Blocks until the job finishes or the timeout elapses. Returns whether
    /// the job finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut done = self.state.done.lock();
        if *done {
            return true;
        }
        self.state.condvar.wait_for(&mut done, timeout);
        *done
    }
}

/// Marks the handle done on drop so completion fires on every exit path,
/// including a panicking job.
struct CompletionGuard(TaskHandle);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.0.mark_done();
    }
}

/// Fixed-size pool of worker threads fed from an unbounded queue.
///
/// Submission is refused (degrading to a resolved no-op) once the pool shuts
/// down; jobs already accepted always run to completion. In-flight work is
/// never interrupted, since interrupting mid-write risks corrupting the
/// durable store.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<Job>>>,
    queue_depth: Arc<AtomicUsize>,
    shut_down: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawns `thread_count` named worker threads.
    pub fn new(name: &str, thread_count: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let queue_depth = Arc::new(AtomicUsize::new(0));

        let mut threads = Vec::with_capacity(thread_count.max(1));
        for index in 0..thread_count.max(1) {
            let receiver = Arc::clone(&receiver);
            let thread = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(&receiver))
                .expect("failed to spawn worker thread");
            threads.push(thread);
        }

        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            queue_depth,
            shut_down: AtomicBool::new(false),
            threads: Mutex::new(threads),
        })
    }

    /// Queues a job, or returns `None` when the pool is shut down. The
    /// returned handle resolves when the job has run.
    pub fn try_submit<F>(&self, job: F) -> Option<TaskHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shut_down.load(Ordering::SeqCst) {
            return None;
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return None;
        };

        let handle = TaskHandle::pending();
        let guard = CompletionGuard(handle.clone());
        let depth = Arc::clone(&self.queue_depth);
        depth.fetch_add(1, Ordering::SeqCst);

        let wrapped: Job = Box::new(move || {
            depth.fetch_sub(1, Ordering::SeqCst);
            let _guard = guard;
            job();
        });

        match sender.send(wrapped) {
            Ok(()) => Some(handle),
            Err(_) => {
                self.queue_depth.fetch_sub(1, Ordering::SeqCst);
                None
            }
        }
    }

    /// Queues a job; a shut-down pool yields an immediately-resolved handle.
    pub fn submit<F>(&self, job: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_submit(job).unwrap_or_else(TaskHandle::completed)
    }

    /// Jobs queued but not yet started.
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Stops accepting work, then drains the queue and joins every worker.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender ends the worker loops once the queue drains.
        self.sender.lock().take();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.join().is_err() {
                warn!("workers.join.panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: &Mutex<Receiver<Job>>) {
    loop {
        let job = {
            let receiver = receiver.lock();
            receiver.recv()
        };
        match job {
            Ok(job) => {
                // Keep the worker alive if a job panics; the completion
                // guard still resolves the task's handle.
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    warn!("workers.job.panicked");
                }
            }
            Err(_) => break,
        }
    }
}
