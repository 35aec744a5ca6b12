//! Job scheduling for off-thread work.
//!
//! Diff computation, cursor loading and list loading run through a
//! [`Scheduler`]. Two implementations are provided:
//!
//! - [`Worker`] - a background thread with a FIFO queue and a timer heap.
//!   When idle it blocks on a condition variable and consumes no CPU.
//! - [`ManualScheduler`] - runs nothing until told to, with a virtual clock.
//!   Tests use it to interleave background work deterministically.
//!
//! ```ignore
//! let worker = Arc::new(Worker::new());
//! worker.schedule(Box::new(|| println!("on the worker")));
//! worker.schedule_after(Duration::from_secs(3), Box::new(|| println!("later")));
//! ```

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs jobs somewhere other than the caller's stack.
pub trait Scheduler: Send + Sync {
    /// Run `job` as soon as possible.
    fn schedule(&self, job: Job);

    /// Run `job` once `delay` has elapsed.
    fn schedule_after(&self, delay: Duration, job: Job);
}

/// The process-wide worker used when no scheduler is configured.
pub fn shared_worker() -> Arc<dyn Scheduler> {
    static SHARED: LazyLock<Arc<Worker>> = LazyLock::new(|| Arc::new(Worker::new()));
    SHARED.clone()
}

struct Timer<D> {
    due: D,
    seq: u64,
    job: Job,
}

impl<D: Ord> PartialEq for Timer<D> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl<D: Ord> Eq for Timer<D> {}

impl<D: Ord> PartialOrd for Timer<D> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the earliest deadline sits at the top of the max-heap.
impl<D: Ord> Ord for Timer<D> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (&other.due, other.seq).cmp(&(&self.due, self.seq))
    }
}

struct WorkerQueue {
    ready: VecDeque<Job>,
    timers: BinaryHeap<Timer<Instant>>,
    seq: u64,
    shutdown: bool,
}

struct WorkerInner {
    queue: Mutex<WorkerQueue>,
    condvar: Condvar,
}

/// A background thread running jobs in submission order.
///
/// Delayed jobs run after every job that became ready before their deadline.
/// A panicking job is logged and does not take the worker down. Dropping the
/// worker stops the thread once the ready queue is empty; pending timers are
/// discarded.
pub struct Worker {
    inner: Arc<WorkerInner>,
    handle: Option<JoinHandle<()>>,
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

impl Worker {
    /// Spawn a worker on a new thread.
    pub fn new() -> Self {
        Self::with_spawn_fn(|f| thread::spawn(f))
    }

    /// Spawn a worker using a custom spawning function, e.g. to name the thread.
    pub fn with_spawn_fn<F>(spawn_fn: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()>,
    {
        let inner = Arc::new(WorkerInner {
            queue: Mutex::new(WorkerQueue {
                ready: VecDeque::new(),
                timers: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = spawn_fn(Box::new(move || worker_loop(worker_inner)));
        Worker {
            inner,
            handle: Some(handle),
        }
    }
}

impl Scheduler for Worker {
    fn schedule(&self, job: Job) {
        self.inner.queue.lock().ready.push_back(job);
        self.inner.condvar.notify_one();
    }

    fn schedule_after(&self, delay: Duration, job: Job) {
        {
            let mut queue = self.inner.queue.lock();
            queue.seq += 1;
            let seq = queue.seq;
            queue.timers.push(Timer {
                due: Instant::now() + delay,
                seq,
                job,
            });
        }
        self.inner.condvar.notify_one();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.inner.queue.lock().shutdown = true;
        self.inner.condvar.notify_one();
        if let Some(handle) = self.handle.take() {
            // A job holding the last reference drops the worker on its own thread.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(inner: Arc<WorkerInner>) {
    loop {
        let job = {
            let mut queue = inner.queue.lock();
            loop {
                let now = Instant::now();
                while queue.timers.peek().is_some_and(|timer| timer.due <= now) {
                    if let Some(timer) = queue.timers.pop() {
                        queue.ready.push_back(timer.job);
                    }
                }
                if let Some(job) = queue.ready.pop_front() {
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                match queue.timers.peek().map(|timer| timer.due) {
                    Some(deadline) => {
                        inner.condvar.wait_until(&mut queue, deadline);
                    }
                    None => inner.condvar.wait(&mut queue),
                }
            }
        };

        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::warn!("worker job panicked");
        }
    }
}

#[derive(Default)]
struct ManualQueue {
    now: Duration,
    ready: VecDeque<Job>,
    timers: BinaryHeap<Timer<Duration>>,
    seq: u64,
}

/// A scheduler driven explicitly by the caller.
///
/// Jobs accumulate until [`run_pending`](ManualScheduler::run_pending) or
/// [`advance`](ManualScheduler::advance) is called, on the calling thread.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<ManualQueue>,
}

impl ManualScheduler {
    /// An idle scheduler at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs ready to run, not counting timers.
    pub fn pending(&self) -> usize {
        self.queue.lock().ready.len()
    }

    /// Number of delayed jobs not yet due.
    pub fn pending_timers(&self) -> usize {
        self.queue.lock().timers.len()
    }

    /// Run ready jobs, including ones they schedule, until none are left.
    ///
    /// Returns the number of jobs run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // The lock is released before the job runs; jobs may schedule more.
            let Some(job) = self.queue.lock().ready.pop_front() else {
                return ran;
            };
            job();
            ran += 1;
        }
    }

    /// Run only the oldest ready job. Returns whether there was one.
    pub fn run_next(&self) -> bool {
        let job = self.queue.lock().ready.pop_front();
        match job {
            Some(job) => {
                job();
                true
            }
            None => false,
        }
    }

    /// Move the virtual clock forward, make due timers ready, and run everything ready.
    pub fn advance(&self, by: Duration) -> usize {
        {
            let mut queue = self.queue.lock();
            queue.now += by;
            let now = queue.now;
            while queue.timers.peek().is_some_and(|timer| timer.due <= now) {
                if let Some(timer) = queue.timers.pop() {
                    queue.ready.push_back(timer.job);
                }
            }
        }
        self.run_pending()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, job: Job) {
        self.queue.lock().ready.push_back(job);
    }

    fn schedule_after(&self, delay: Duration, job: Job) {
        let mut queue = self.queue.lock();
        queue.seq += 1;
        let timer = Timer {
            due: queue.now + delay,
            seq: queue.seq,
            job,
        };
        queue.timers.push(timer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn worker_runs_jobs_in_order() {
        let worker = Worker::new();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            worker.schedule(Box::new(move || tx.send(i).unwrap()));
        }
        let received: Vec<i32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(received, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn worker_delays_timers() {
        let worker = Worker::new();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        let late = tx.clone();
        worker.schedule_after(
            Duration::from_millis(30),
            Box::new(move || late.send("late").unwrap()),
        );
        worker.schedule(Box::new(move || tx.send("now").unwrap()));
        assert_eq!(rx.recv().unwrap(), "now");
        assert_eq!(rx.recv().unwrap(), "late");
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn worker_survives_a_panicking_job() {
        let worker = Worker::new();
        let (tx, rx) = mpsc::channel();
        worker.schedule(Box::new(|| panic!("job failed")));
        worker.schedule(Box::new(move || tx.send(()).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn manual_scheduler_runs_nested_jobs_and_timers() {
        let scheduler = Arc::new(ManualScheduler::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let nested = scheduler.clone();
        let nested_runs = runs.clone();
        scheduler.schedule(Box::new(move || {
            nested_runs.fetch_add(1, Ordering::Relaxed);
            let inner_runs = nested_runs.clone();
            nested.schedule(Box::new(move || {
                inner_runs.fetch_add(1, Ordering::Relaxed);
            }));
        }));
        let timer_runs = runs.clone();
        scheduler.schedule_after(
            Duration::from_secs(3),
            Box::new(move || {
                timer_runs.fetch_add(10, Ordering::Relaxed);
            }),
        );

        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(runs.load(Ordering::Relaxed), 2);
        assert_eq!(scheduler.advance(Duration::from_secs(2)), 0);
        assert_eq!(scheduler.pending_timers(), 1);
        assert_eq!(scheduler.advance(Duration::from_secs(1)), 1);
        assert_eq!(runs.load(Ordering::Relaxed), 12);
    }
}
