//! Push-based producers.
//!
//! A [`Producer`] is a cold stream factory: every call to
//! [`subscribe`](Producer::subscribe) starts an independent stream that pushes
//! values into the given [`Emitter`] until it signals completion or an error, or
//! until the returned [`Subscription`] is disposed.
//!
//! ```ignore
//! let numbers = producer::from_fn(|emitter: Emitter<Vec<u32>>| {
//!     emitter.next(vec![1, 2, 3]);
//!     emitter.complete();
//!     Subscription::empty()
//! });
//! ```
//!
//! Disposal is cooperative and immediate: once a subscription is disposed, the
//! emitter it was created with drops everything it is handed, even if the
//! producer keeps calling it from another thread.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use slab::Slab;

use crate::error::{SourceError, source_error};
use crate::worker::Scheduler;

/// A signal delivered to an [`Emitter`]'s sink.
#[derive(Debug)]
pub enum Event<V> {
    /// A value.
    Next(V),
    /// The stream failed. No further events follow.
    Error(SourceError),
    /// The stream finished. No further events follow.
    Complete,
}

type Sink<V> = Arc<dyn Fn(Event<V>) + Send + Sync>;

/// The receiving end handed to a producer.
///
/// Cloning an emitter shares its disposal state, so a producer may fan work out
/// to several threads and still stop all of them with one dispose.
pub struct Emitter<V> {
    sink: Sink<V>,
    done: Arc<AtomicBool>,
}

impl<V> Clone for Emitter<V> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            done: self.done.clone(),
        }
    }
}

impl<V> fmt::Debug for Emitter<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

impl<V> Emitter<V> {
    /// An emitter forwarding to `sink`.
    pub fn new(sink: impl Fn(Event<V>) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Push a value.
    pub fn next(&self, value: V) {
        if !self.is_done() {
            (self.sink)(Event::Next(value));
        }
    }

    /// Fail the stream.
    pub fn error(&self, error: impl Into<Box<dyn std::error::Error + Send + Sync>>) {
        self.error_shared(source_error(error));
    }

    /// Fail the stream with an already shared error.
    pub fn error_shared(&self, error: SourceError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.sink)(Event::Error(error));
        }
    }

    /// Finish the stream.
    pub fn complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            (self.sink)(Event::Complete);
        }
    }

    /// Whether the stream terminated or its subscription was disposed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.done.store(true, Ordering::Release);
    }
}

/// Handle to a running stream. Dropping it disposes the stream.
#[must_use = "dropping a Subscription disposes it immediately"]
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// A subscription that runs `teardown` once when disposed.
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    /// A subscription with nothing to tear down.
    pub fn empty() -> Self {
        Self { teardown: None }
    }

    /// Dispose now.
    pub fn dispose(mut self) {
        self.run_teardown();
    }

    fn run_teardown(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_teardown();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

/// A cold stream factory.
pub trait Producer<V>: Send + Sync {
    /// Start a stream pushing into `emitter`.
    fn subscribe(&self, emitter: Emitter<V>) -> Subscription;
}

impl<V, P: Producer<V> + ?Sized> Producer<V> for Arc<P> {
    fn subscribe(&self, emitter: Emitter<V>) -> Subscription {
        (**self).subscribe(emitter)
    }
}

impl<V, P: Producer<V> + ?Sized> Producer<V> for Box<P> {
    fn subscribe(&self, emitter: Emitter<V>) -> Subscription {
        (**self).subscribe(emitter)
    }
}

/// Subscribe `sink` to `producer`.
///
/// The returned subscription silences the emitter before running the
/// producer's own teardown, so nothing reaches `sink` once it is disposed.
pub fn subscribe<V, P>(producer: &P, sink: impl Fn(Event<V>) + Send + Sync + 'static) -> Subscription
where
    P: Producer<V> + ?Sized,
    V: 'static,
{
    let emitter = Emitter::new(sink);
    let guard = emitter.clone();
    let inner = producer.subscribe(emitter);
    Subscription::new(move || {
        guard.close();
        drop(inner);
    })
}

/// Producer built from a closure. See [`from_fn`].
pub struct FromFn<F>(F);

impl<V, F> Producer<V> for FromFn<F>
where
    F: Fn(Emitter<V>) -> Subscription + Send + Sync,
{
    fn subscribe(&self, emitter: Emitter<V>) -> Subscription {
        (self.0)(emitter)
    }
}

/// A producer whose subscribe behaviour is `f`.
pub fn from_fn<V, F>(f: F) -> FromFn<F>
where
    F: Fn(Emitter<V>) -> Subscription + Send + Sync,
{
    FromFn(f)
}

/// Emits `value` once, then completes.
pub fn just<V: Clone + Send + Sync>(value: V) -> impl Producer<V> {
    from_fn(move |emitter: Emitter<V>| {
        emitter.next(value.clone());
        emitter.complete();
        Subscription::empty()
    })
}

/// Emits every item of `items` in order, then completes.
pub fn from_iter<I>(items: I) -> impl Producer<I::Item>
where
    I: IntoIterator + Clone + Send + Sync,
{
    from_fn(move |emitter: Emitter<I::Item>| {
        for item in items.clone() {
            if emitter.is_done() {
                break;
            }
            emitter.next(item);
        }
        emitter.complete();
        Subscription::empty()
    })
}

/// Completes without emitting.
pub fn empty<V>() -> impl Producer<V> {
    from_fn(|emitter: Emitter<V>| {
        emitter.complete();
        Subscription::empty()
    })
}

/// Never emits and never terminates.
pub fn never<V>() -> impl Producer<V> {
    from_fn(|_: Emitter<V>| Subscription::empty())
}

/// Fails immediately with `error`.
pub fn fail<V>(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> impl Producer<V> {
    let error = source_error(error);
    from_fn(move |emitter: Emitter<V>| {
        emitter.error_shared(error.clone());
        Subscription::empty()
    })
}

/// Builds a fresh producer from `factory` for every subscription.
pub fn defer<V, P, F>(factory: F) -> impl Producer<V>
where
    P: Producer<V>,
    F: Fn() -> P + Send + Sync,
{
    from_fn(move |emitter: Emitter<V>| factory().subscribe(emitter))
}

/// Subscribes to `producer` on `scheduler` instead of the calling thread.
///
/// Disposing before the scheduled subscribe ran cancels it; disposing after
/// disposes the inner subscription.
pub fn on_scheduler<V, P>(scheduler: Arc<dyn Scheduler>, producer: P) -> impl Producer<V>
where
    V: Send + 'static,
    P: Producer<V> + 'static,
{
    let producer = Arc::new(producer);
    from_fn(move |emitter: Emitter<V>| {
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let cancelled = Arc::new(AtomicBool::new(false));
        {
            let producer = producer.clone();
            let slot = slot.clone();
            let cancelled = cancelled.clone();
            scheduler.schedule(Box::new(move || {
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                let subscription = producer.subscribe(emitter);
                let mut slot = slot.lock();
                if cancelled.load(Ordering::Acquire) {
                    drop(slot);
                    drop(subscription);
                } else {
                    *slot = Some(subscription);
                }
            }));
        }
        Subscription::new(move || {
            cancelled.store(true, Ordering::Release);
            let subscription = slot.lock().take();
            drop(subscription);
        })
    })
}

struct SubjectInner<V> {
    emitters: Mutex<Slab<Emitter<V>>>,
}

/// A hot producer: values pushed into it reach every current subscriber.
///
/// Subscribers only see values pushed after they subscribed.
pub struct Subject<V> {
    inner: Arc<SubjectInner<V>>,
}

impl<V> Clone for Subject<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Default for Subject<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Subject<V> {
    /// A subject with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SubjectInner {
                emitters: Mutex::new(Slab::new()),
            }),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.emitters.lock().len()
    }

    fn snapshot(&self) -> Vec<Emitter<V>> {
        self.inner.emitters.lock().iter().map(|(_, e)| e.clone()).collect()
    }
}

impl<V: Clone> Subject<V> {
    /// Push `value` to every subscriber.
    pub fn emit(&self, value: V) {
        for emitter in self.snapshot() {
            emitter.next(value.clone());
        }
    }

    /// Fail every current subscriber.
    pub fn error(&self, error: impl Into<Box<dyn std::error::Error + Send + Sync>>) {
        let error = source_error(error);
        for emitter in self.snapshot() {
            emitter.error_shared(error.clone());
        }
    }

    /// Complete every current subscriber.
    pub fn complete(&self) {
        for emitter in self.snapshot() {
            emitter.complete();
        }
    }
}

impl<V: Send + 'static> Producer<V> for Subject<V> {
    fn subscribe(&self, emitter: Emitter<V>) -> Subscription {
        let key = self.inner.emitters.lock().insert(emitter);
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.emitters.lock().try_remove(key);
            }
        })
    }
}
