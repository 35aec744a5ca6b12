//! Marshaling producer emissions onto one delivery context.
//!
//! Every source owns a [`Mailbox`]: a single-consumer queue of messages posted by
//! its producers, its diff worker and its own public operations. Messages are
//! handled one at a time by whichever thread drains the mailbox, and observer
//! notifications are only ever issued from inside a drain.
//!
//! - **Inline drain**: a post from the delivery thread that is not already
//!   draining drains immediately, so synchronous producers deliver before
//!   `register_data_observer` returns. A post made while draining is queued and
//!   handled by the same drain after the current message.
//! - **Coalesced wake-up**: posts from any other thread are queued and call the
//!   mailbox's waker at most once until the next drain begins.
//!
//! A [`DeliveryLoop`] is a ready-made delivery thread. It flushes every
//! attached source after a resetting debounce, and runs jobs posted to it:
//!
//! ```ignore
//! let delivery = DeliveryLoop::new()
//!     .debounce(Duration::from_millis(2))
//!     .spawn();
//!
//! let data = ObservableData::builder()
//!     .contents(|_| fetch_rows())
//!     .delivery_loop(&delivery)
//!     .build();
//! ```
//!
//! Without a loop, hosts call [`flush`](crate::ObservableData::flush) themselves
//! from their event loop, typically from the waker they configured.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use papaya::HashMap as PapayaHashMap;
use parking_lot::Mutex;

use crate::hash::{FastHashBuilder, address_of};
use crate::worker::Job;

/// Callback invoked when a mailbox needs draining from another thread.
pub type Waker = Arc<dyn Fn() + Send + Sync>;

/// Something whose queued work can be drained.
pub trait Flush: Send + Sync {
    /// Handle everything queued. Returns the number of messages handled.
    fn flush(&self) -> usize;
}

pub(crate) struct Mailbox<M> {
    queue: Mutex<VecDeque<M>>,
    draining: AtomicBool,
    posted: AtomicBool,
    delivery_thread: ThreadId,
    waker: Option<Waker>,
}

impl<M> Mailbox<M> {
    pub(crate) fn new(delivery_thread: ThreadId, waker: Option<Waker>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            posted: AtomicBool::new(false),
            delivery_thread,
            waker,
        }
    }

    pub(crate) fn on_delivery_thread(&self) -> bool {
        thread::current().id() == self.delivery_thread
    }

    /// Queue `message`. Returns true if the caller should drain now.
    pub(crate) fn post(&self, message: M) -> bool {
        self.queue.lock().push_back(message);
        if self.on_delivery_thread() {
            if !self.draining.load(Ordering::Acquire) {
                cov_mark::hit!(mailbox_inline_drain);
                return true;
            }
            return false;
        }
        self.wake();
        false
    }

    /// Queue `message` without ever draining inline.
    pub(crate) fn post_deferred(&self, message: M) {
        self.queue.lock().push_back(message);
        self.wake();
    }

    fn wake(&self) {
        if !self.posted.swap(true, Ordering::AcqRel) {
            tracing::trace!("waking delivery context");
            if let Some(waker) = &self.waker {
                waker();
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Handle queued messages until none are left.
    ///
    /// Messages are handled on the calling thread, which need not be the
    /// delivery thread. Returns 0 without handling anything if another drain
    /// is in progress; that drain picks up whatever is queued.
    pub(crate) fn drain(&self, mut handle: impl FnMut(M)) -> usize {
        if !self.on_delivery_thread() {
            tracing::trace!("draining off the delivery thread");
        }
        let mut handled = 0;
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return handled;
            }
            self.posted.store(false, Ordering::Release);
            loop {
                let Some(message) = self.queue.lock().pop_front() else {
                    break;
                };
                handle(message);
                handled += 1;
            }
            self.draining.store(false, Ordering::Release);
            // A post may have raced with the end of the drain.
            if self.queue.lock().is_empty() {
                if handled > 0 {
                    tracing::trace!(handled, "mailbox drained");
                }
                return handled;
            }
        }
    }
}

/// Default debounce delay before attached sources are flushed.
///
/// New wake-ups during this period reset the timer.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(4);

/// Maximum time a flush is deferred while wake-ups keep arriving.
pub const DEFAULT_MAX_DEBOUNCE: Duration = Duration::from_millis(16);

enum LoopMessage {
    Wake,
    Job(Job),
}

type SpawnFn = Box<dyn FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send>;

/// Builder for a delivery thread.
///
/// Defaults:
/// - `debounce`: 4ms
/// - `max_debounce`: 16ms
/// - `spawn_fn`: `std::thread::spawn`
pub struct DeliveryLoop {
    debounce: Duration,
    max_debounce: Duration,
    spawn_fn: Option<SpawnFn>,
}

impl Default for DeliveryLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryLoop {
    /// A builder with default settings.
    pub fn new() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            max_debounce: DEFAULT_MAX_DEBOUNCE,
            spawn_fn: None,
        }
    }

    /// Set the resetting debounce delay.
    pub fn debounce(mut self, duration: Duration) -> Self {
        self.debounce = duration;
        self
    }

    /// Set the upper bound on how long wake-ups can keep deferring a flush.
    pub fn max_debounce(mut self, duration: Duration) -> Self {
        self.max_debounce = duration;
        self
    }

    /// Set a custom thread spawning function, e.g. to name the thread.
    ///
    /// ```ignore
    /// DeliveryLoop::new()
    ///     .spawn_fn(|f| {
    ///         std::thread::Builder::new()
    ///             .name("delivery".into())
    ///             .spawn(f)
    ///             .unwrap()
    ///     })
    ///     .spawn();
    /// ```
    pub fn spawn_fn<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Box<dyn FnOnce() + Send>) -> JoinHandle<()> + Send + 'static,
    {
        self.spawn_fn = Some(Box::new(f));
        self
    }

    /// Start the delivery thread.
    ///
    /// The thread exits once every [`DeliveryHandle`] and every waker obtained
    /// from one has been dropped.
    pub fn spawn(self) -> DeliveryHandle {
        let (tx, rx) = mpsc::channel::<LoopMessage>();
        let registry: Arc<Registry> = Arc::new(PapayaHashMap::with_hasher(FastHashBuilder));

        let loop_registry = Arc::downgrade(&registry);
        let debounce = self.debounce;
        let max_debounce = self.max_debounce;
        let loop_fn: Box<dyn FnOnce() + Send> = Box::new(move || {
            delivery_loop(rx, loop_registry, debounce, max_debounce);
        });
        let handle = match self.spawn_fn {
            Some(spawn_fn) => spawn_fn(loop_fn),
            None => thread::spawn(loop_fn),
        };

        DeliveryHandle {
            sender: tx,
            registry,
            thread: handle.thread().id(),
            _handle: Arc::new(handle),
        }
    }
}

type Registry = PapayaHashMap<usize, Weak<dyn Flush>, FastHashBuilder>;

/// Handle to a running [`DeliveryLoop`].
#[derive(Clone)]
pub struct DeliveryHandle {
    sender: Sender<LoopMessage>,
    registry: Arc<Registry>,
    thread: ThreadId,
    _handle: Arc<JoinHandle<()>>,
}

impl DeliveryHandle {
    /// Id of the delivery thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread
    }

    /// A waker that schedules a debounced flush of every attached source.
    pub fn waker(&self) -> Waker {
        let sender = self.sender.clone();
        Arc::new(move || {
            let _ = sender.send(LoopMessage::Wake);
        })
    }

    /// Flush `target` whenever the loop flushes. The loop holds it weakly.
    pub fn attach(&self, target: &Arc<dyn Flush>) {
        let key = address_of(Arc::as_ptr(target));
        self.registry.pin().insert(key, Arc::downgrade(target));
        let _ = self.sender.send(LoopMessage::Wake);
    }

    /// Stop flushing `target`.
    pub fn detach(&self, target: &Arc<dyn Flush>) {
        let key = address_of(Arc::as_ptr(target));
        self.registry.pin().remove(&key);
    }

    /// Run `job` on the delivery thread.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(LoopMessage::Job(Box::new(job)));
    }
}

fn delivery_loop(
    rx: mpsc::Receiver<LoopMessage>,
    registry: Weak<Registry>,
    debounce: Duration,
    max_debounce: Duration,
) {
    loop {
        match rx.recv() {
            Ok(LoopMessage::Job(job)) => {
                job();
                continue;
            }
            Ok(LoopMessage::Wake) => {}
            Err(_) => break,
        }

        // Resetting debounce, bounded by max_debounce. Jobs still run promptly.
        let debounce_start = Instant::now();
        loop {
            let remaining = max_debounce.saturating_sub(debounce_start.elapsed());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(debounce.min(remaining)) {
                Ok(LoopMessage::Wake) => {}
                Ok(LoopMessage::Job(job)) => job(),
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }

        loop {
            match rx.try_recv() {
                Ok(LoopMessage::Wake) => continue,
                Ok(LoopMessage::Job(job)) => job(),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        let Some(registry) = registry.upgrade() else {
            return;
        };
        let targets: Vec<(usize, Option<Arc<dyn Flush>>)> = registry
            .pin()
            .iter()
            .map(|(key, target)| (*key, target.upgrade()))
            .collect();
        let mut handled = 0;
        for (key, target) in targets {
            match target {
                Some(target) => handled += target.flush(),
                None => {
                    registry.pin().remove(&key);
                }
            }
        }
        tracing::trace!(handled, "delivery loop flushed");
    }
}
