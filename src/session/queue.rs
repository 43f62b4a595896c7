//! Per-device single-flight request queue.
//!
//! At most one job runs at a time; later jobs wait in FIFO order. Each job
//! runs in its own task so a panic is contained: the runner logs it, counts
//! a fault and moves on to the next job. The panicked job's reply channel is
//! dropped, which the caller observes as a closed receiver.

use log::{debug, error};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

type BoxedJob<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

struct Job<T> {
    work: BoxedJob<T>,
    reply: oneshot::Sender<T>,
}

struct QueueState<T> {
    pending: VecDeque<Job<T>>,
    running: bool,
}

pub struct RequestQueue<T> {
    label: String,
    state: Mutex<QueueState<T>>,
    faults: AtomicU64,
    completed: AtomicU64,
}

impl<T> std::fmt::Debug for RequestQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("label", &self.label)
            .field("pending", &self.len())
            .field("running", &self.is_running())
            .field("faults", &self.fault_count())
            .finish()
    }
}

impl<T: Send + 'static> RequestQueue<T> {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: false,
            }),
            faults: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    /// Admit `work`; it starts now if the queue is idle, otherwise after
    /// every job admitted before it.
    pub fn enqueue<F>(self: &Arc<Self>, work: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            work: Box::pin(work),
            reply,
        };

        let mut state = self.lock();
        if state.running {
            state.pending.push_back(job);
            debug!("{}: request queued ({} pending)", self.label, state.pending.len());
        } else {
            state.running = true;
            drop(state);
            tokio::spawn(Arc::clone(self).drain(job));
        }
        rx
    }

    async fn drain(self: Arc<Self>, first: Job<T>) {
        let mut job = first;
        loop {
            let Job { work, reply } = job;
            match tokio::spawn(work).await {
                Ok(output) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                    // The caller may have stopped waiting
                    let _ = reply.send(output);
                }
                Err(e) => {
                    let faults = self.faults.fetch_add(1, Ordering::Relaxed) + 1;
                    error!("{}: request processing failed: {e} (faults: {faults})", self.label);
                }
            }

            match self.next_job() {
                Some(next) => job = next,
                None => return,
            }
        }
    }

    /// Pop the next job, or mark the queue idle when there is none.
    fn next_job(&self) -> Option<Job<T>> {
        let mut state = self.lock();
        let next = state.pending.pop_front();
        if next.is_none() {
            state.running = false;
        }
        next
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> RequestQueue<T> {
    /// Jobs waiting behind the running one.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).running
    }

    pub fn fault_count(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}
