//! Data materialized from asynchronous producers.
//!
//! [`ObservableData`] subscribes to a content producer while it has structural
//! observers, diffs each emitted snapshot against the elements it holds, and
//! applies the resulting edits one at a time, announcing each before applying
//! the next. Optional producers feed the loading flag, the available count,
//! prepended and appended pages, and out-of-band errors.
//!
//! ```ignore
//! let data = ObservableData::builder()
//!     .contents(|load_type| fetch_contacts(load_type))
//!     .diff_strategy(DiffStrategy::Fine(FineGrained::new(|a: &Contact, b: &Contact| a.id == b.id)))
//!     .diff_computation(DiffComputation::Asynchronous(shared_worker()))
//!     .build();
//!
//! data.register_data_observer(Arc::new(|change: &Change| println!("{change}")));
//! ```
//!
//! # Content pipeline
//!
//! Emissions are posted to the source's mailbox and handled on its delivery
//! thread (see [`delivery`](crate::DeliveryLoop)). Content, prepend and append
//! emissions form one FIFO. At most one snapshot diff is in flight at a time;
//! later snapshots wait and are diffed against the elements as they stand when
//! their turn comes. Offloaded diffs carry the subscription epoch and a
//! sequence number, and results that no longer match are dropped.
//!
//! # Inferred side channels
//!
//! Without a loading producer, loading turns true on subscription and false
//! once the first content operation of that subscription has been applied, or
//! when content completes or fails with nothing queued or being diffed. Without an available
//! producer, the count is [`AVAILABLE_UNKNOWN`] from subscription until the
//! first content operation, then 0. On that first operation the structural
//! notifications come first, then available, then loading.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::data::{AVAILABLE_UNKNOWN, Data, LoadType};
use crate::delivery::{DeliveryHandle, Flush, Mailbox, Waker};
use crate::diff::{DiffStrategy, Differ, Edit};
use crate::error::{Result, SourceError};
use crate::lifecycle::{LifecycleGate, Transition};
use crate::notifying::NotifyingList;
use crate::observer::ObserverRegistry;
use crate::producer::{self, Event, Producer, Subscription};
use crate::worker::Scheduler;

/// Where snapshot diffs are computed.
#[derive(Clone, Default)]
pub enum DiffComputation {
    /// On the delivery thread, as part of handling the emission.
    #[default]
    Synchronous,
    /// On the given scheduler; results are posted back to the delivery thread.
    ///
    /// The `None` strategy and the empty/identical fast paths always run
    /// synchronously.
    Asynchronous(Arc<dyn Scheduler>),
}

impl fmt::Debug for DiffComputation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffComputation::Synchronous => f.write_str("Synchronous"),
            DiffComputation::Asynchronous(_) => f.write_str("Asynchronous(..)"),
        }
    }
}

type Factory<V> = Arc<dyn Fn(LoadType) -> Box<dyn Producer<V>> + Send + Sync>;

fn factory<V, P, F>(f: F) -> Factory<V>
where
    F: Fn(LoadType) -> P + Send + Sync + 'static,
    P: Producer<V> + 'static,
{
    Arc::new(move |load_type| Box::new(f(load_type)))
}

enum ContentOp<T> {
    Overwrite(Vec<T>),
    Prepend(Vec<T>),
    Append(Vec<T>),
}

enum Message<T> {
    Subscribed { epoch: u64 },
    Clear,
    Content { epoch: u64, op: ContentOp<T> },
    ContentFinished { epoch: u64 },
    Loading { epoch: u64, loading: bool },
    Available { epoch: u64, available: usize },
    Error { epoch: u64, error: SourceError },
    Diffed { epoch: u64, seq: u64, edits: Vec<Edit<T>> },
}

struct InFlight<T> {
    seq: u64,
    new: Arc<Vec<T>>,
}

struct State<T> {
    gate: LifecycleGate,
    epoch: u64,
    subscriptions: Vec<Subscription>,
    pending: VecDeque<ContentOp<T>>,
    in_flight: Option<InFlight<T>>,
    seq: u64,
    content_applied: bool,
    loading: bool,
    available: usize,
}

struct Producers<T> {
    contents: Factory<Vec<T>>,
    prepends: Option<Factory<Vec<T>>>,
    appends: Option<Factory<Vec<T>>>,
    loading: Option<Factory<bool>>,
    available: Option<Factory<usize>>,
    errors: Option<Factory<SourceError>>,
}

struct Inner<T> {
    me: Weak<Inner<T>>,
    list: NotifyingList<T>,
    mailbox: Mailbox<Message<T>>,
    producers: Producers<T>,
    differ: Differ<T>,
    computation: DiffComputation,
    state: Mutex<State<T>>,
}

/// Data whose contents come from asynchronous producers.
///
/// Cloning yields another handle to the same source.
pub struct ObservableData<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for ObservableData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ObservableData<T> {
    /// Start configuring a source.
    pub fn builder() -> ObservableDataBuilder<T> {
        ObservableDataBuilder::new()
    }

    /// Handle everything posted to this source from other threads.
    ///
    /// The calling thread becomes the delivery context for this flush: every
    /// notification it triggers is dispatched there. Hosts should call it from
    /// the configured delivery thread. Returns the number of messages handled.
    pub fn flush(&self) -> usize {
        self.inner.drain()
    }

    /// Remove every element, announcing `Removed(0, size)`, and reset the
    /// available count to [`AVAILABLE_UNKNOWN`].
    pub fn clear(&self) {
        self.inner.post(Message::Clear);
    }

    /// Number of messages waiting for a flush.
    pub fn pending_messages(&self) -> usize {
        self.inner.mailbox.len()
    }

    /// This source as a flush target for a [`DeliveryLoop`](crate::DeliveryLoop).
    pub fn as_flush(&self) -> Arc<dyn Flush> {
        self.inner.clone()
    }
}

impl<T: Clone + Send + Sync + 'static> Data<T> for ObservableData<T> {
    fn size(&self) -> usize {
        self.inner.list.len()
    }

    fn try_get(&self, position: usize) -> Result<T> {
        self.inner.list.get(position)
    }

    fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    fn refresh(&self) {
        let transition = self.inner.state.lock().gate.refresh();
        self.inner.execute(transition);
    }

    fn reload(&self) {
        let transition = self.inner.state.lock().gate.reload();
        self.inner.execute(transition);
    }

    fn invalidate(&self) {
        let transition = self.inner.state.lock().gate.invalidate();
        self.inner.execute(transition);
    }

    fn observers(&self) -> &ObserverRegistry {
        self.inner.list.observers()
    }

    fn on_data_observer_added(&self) {
        let transition = self.inner.state.lock().gate.observer_added();
        self.inner.execute(transition);
    }

    fn on_data_observer_removed(&self) {
        let transition = self.inner.state.lock().gate.observer_removed();
        self.inner.execute(transition);
    }

    fn to_vec(&self) -> Vec<T> {
        self.inner.list.to_vec()
    }
}

impl<T: Clone + Send + Sync + 'static> Flush for Inner<T> {
    fn flush(&self) -> usize {
        self.drain()
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    fn post(&self, message: Message<T>) {
        if self.mailbox.post(message) {
            self.drain();
        }
    }

    fn drain(&self) -> usize {
        self.mailbox.drain(|message| self.handle(message))
    }

    fn infers_loading(&self) -> bool {
        self.producers.loading.is_none()
    }

    fn infers_available(&self) -> bool {
        self.producers.available.is_none()
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().epoch == epoch
    }

    fn set_loading(&self, loading: bool) {
        let changed = std::mem::replace(&mut self.state.lock().loading, loading) != loading;
        if changed {
            self.list.observers().notify_loading(loading);
        }
    }

    fn set_available(&self, available: usize) {
        let changed = std::mem::replace(&mut self.state.lock().available, available) != available;
        if changed {
            self.list.observers().notify_available(available);
        }
    }

    fn execute(&self, transition: Transition) {
        if transition.unsubscribe {
            self.unsubscribe();
        }
        if transition.clear {
            self.post(Message::Clear);
        }
        if let Some(load_type) = transition.subscribe {
            self.subscribe(load_type);
        }
    }

    fn unsubscribe(&self) {
        let subscriptions = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.pending.clear();
            state.in_flight = None;
            std::mem::take(&mut state.subscriptions)
        };
        tracing::debug!(count = subscriptions.len(), "disposing subscriptions");
        drop(subscriptions);
    }

    fn subscribe(&self, load_type: LoadType) {
        let epoch = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.epoch
        };
        self.post(Message::Subscribed { epoch });

        let producers = &self.producers;
        let mut subscriptions = Vec::with_capacity(6);
        subscriptions.push(self.attach(
            &*(producers.contents)(load_type),
            epoch,
            |epoch, event| match event {
                Event::Next(items) => Message::Content {
                    epoch,
                    op: ContentOp::Overwrite(items),
                },
                Event::Error(error) => Message::Error { epoch, error },
                Event::Complete => Message::ContentFinished { epoch },
            },
        ));
        if let Some(prepends) = &producers.prepends {
            subscriptions.push(self.attach(&*prepends(load_type), epoch, |epoch, event| {
                match event {
                    Event::Next(items) => Some(Message::Content {
                        epoch,
                        op: ContentOp::Prepend(items),
                    }),
                    Event::Error(error) => Some(Message::Error { epoch, error }),
                    Event::Complete => None,
                }
            }));
        }
        if let Some(appends) = &producers.appends {
            subscriptions.push(self.attach(&*appends(load_type), epoch, |epoch, event| {
                match event {
                    Event::Next(items) => Some(Message::Content {
                        epoch,
                        op: ContentOp::Append(items),
                    }),
                    Event::Error(error) => Some(Message::Error { epoch, error }),
                    Event::Complete => None,
                }
            }));
        }
        if let Some(loading) = &producers.loading {
            subscriptions.push(self.attach(&*loading(load_type), epoch, |epoch, event| {
                match event {
                    Event::Next(loading) => Some(Message::Loading { epoch, loading }),
                    Event::Error(error) => Some(Message::Error { epoch, error }),
                    Event::Complete => None,
                }
            }));
        }
        if let Some(available) = &producers.available {
            subscriptions.push(self.attach(&*available(load_type), epoch, |epoch, event| {
                match event {
                    Event::Next(available) => Some(Message::Available { epoch, available }),
                    Event::Error(error) => Some(Message::Error { epoch, error }),
                    Event::Complete => None,
                }
            }));
        }
        if let Some(errors) = &producers.errors {
            subscriptions.push(self.attach(&*errors(load_type), epoch, |epoch, event| {
                match event {
                    Event::Next(error) | Event::Error(error) => {
                        Some(Message::Error { epoch, error })
                    }
                    Event::Complete => None,
                }
            }));
        }

        let mut state = self.state.lock();
        if state.epoch == epoch {
            state.subscriptions.extend(subscriptions);
        } else {
            // Unsubscribed re-entrantly while subscribing.
            drop(state);
            cov_mark::hit!(subscribe_superseded);
            drop(subscriptions);
        }
    }

    fn attach<V, R>(
        &self,
        producer: &dyn Producer<V>,
        epoch: u64,
        route: fn(u64, Event<V>) -> R,
    ) -> Subscription
    where
        V: Send + 'static,
        R: Into<Option<Message<T>>> + 'static,
    {
        let me = self.me.clone();
        producer::subscribe(producer, move |event| {
            if let Some(inner) = me.upgrade()
                && let Some(message) = route(epoch, event).into()
            {
                inner.post(message);
            }
        })
    }

    fn handle(&self, message: Message<T>) {
        match message {
            Message::Subscribed { epoch } => {
                {
                    let mut state = self.state.lock();
                    if state.epoch != epoch {
                        return;
                    }
                    state.content_applied = false;
                }
                if self.infers_loading() {
                    self.set_loading(true);
                }
                if self.infers_available() {
                    self.set_available(AVAILABLE_UNKNOWN);
                }
            }
            Message::Clear => self.clear_now(),
            Message::Content { epoch, op } => {
                {
                    let mut state = self.state.lock();
                    if state.epoch != epoch {
                        cov_mark::hit!(stale_content_discarded);
                        return;
                    }
                    state.pending.push_back(op);
                }
                self.pump();
            }
            Message::ContentFinished { epoch } => {
                // Queued or offloaded content settles loading once it is applied.
                let settle = {
                    let state = self.state.lock();
                    state.epoch == epoch
                        && !state.content_applied
                        && state.pending.is_empty()
                        && state.in_flight.is_none()
                };
                if settle && self.infers_loading() {
                    self.set_loading(false);
                }
            }
            Message::Loading { epoch, loading } => {
                if self.is_current(epoch) {
                    self.set_loading(loading);
                }
            }
            Message::Available { epoch, available } => {
                if self.is_current(epoch) {
                    self.set_available(available);
                }
            }
            Message::Error { epoch, error } => {
                if !self.is_current(epoch) {
                    cov_mark::hit!(stale_error_discarded);
                    tracing::debug!(%error, "error from a disposed subscription dropped");
                    return;
                }
                self.list.observers().notify_error(&error);
                if self.infers_loading() {
                    self.set_loading(false);
                }
            }
            Message::Diffed { epoch, seq, edits } => {
                let new = {
                    let mut state = self.state.lock();
                    let current = state.epoch == epoch
                        && state.in_flight.as_ref().is_some_and(|f| f.seq == seq);
                    if current {
                        state.in_flight.take().map(|f| f.new)
                    } else {
                        None
                    }
                };
                let Some(new) = new else {
                    cov_mark::hit!(stale_diff_discarded);
                    tracing::debug!(epoch, seq, "stale diff result discarded");
                    return;
                };
                self.overwrite(edits, Arc::unwrap_or_clone(new));
                self.content_applied();
                self.pump();
            }
        }
    }

    /// Apply queued content operations until the queue is empty or a diff is offloaded.
    fn pump(&self) {
        loop {
            let op = {
                let mut state = self.state.lock();
                if state.in_flight.is_some() {
                    return;
                }
                match state.pending.pop_front() {
                    Some(op) => op,
                    None => return,
                }
            };
            match op {
                ContentOp::Prepend(items) => {
                    // Inserting at 0 is always in range.
                    let _ = self.list.insert_all(0, items);
                }
                ContentOp::Append(items) => self.list.extend(items),
                ContentOp::Overwrite(new) => {
                    let quick = self.list.with_items(|old| self.differ.quick(old, &new));
                    let edits = match (quick, &self.computation) {
                        (Some(edits), _) => edits,
                        (None, DiffComputation::Synchronous) => {
                            self.list.with_items(|old| self.differ.diff(old, &new))
                        }
                        (None, DiffComputation::Asynchronous(scheduler)) => {
                            self.offload(scheduler, new);
                            return;
                        }
                    };
                    self.overwrite(edits, new);
                }
            }
            self.content_applied();
        }
    }

    fn offload(&self, scheduler: &Arc<dyn Scheduler>, new: Vec<T>) {
        let old = self.list.to_vec();
        let new = Arc::new(new);
        let (epoch, seq) = {
            let mut state = self.state.lock();
            state.seq += 1;
            let seq = state.seq;
            state.in_flight = Some(InFlight {
                seq,
                new: new.clone(),
            });
            (state.epoch, seq)
        };
        tracing::trace!(epoch, seq, old = old.len(), new = new.len(), "offloading diff");
        let differ = self.differ.clone();
        let me = self.me.clone();
        scheduler.schedule(Box::new(move || {
            let edits = differ.diff(&old, &new);
            drop(new);
            if let Some(inner) = me.upgrade() {
                inner.post(Message::Diffed { epoch, seq, edits });
            }
        }));
    }

    /// Apply a snapshot's edits one at a time, then adopt the snapshot itself.
    fn overwrite(&self, edits: Vec<Edit<T>>, new: Vec<T>) {
        for edit in edits {
            if let Err(error) = self.list.apply(edit) {
                tracing::warn!(%error, "diff produced an out-of-range edit; resetting");
                let _ = self.list.apply(Edit::Reset { items: new });
                return;
            }
        }
        if self.list.len() != new.len() {
            cov_mark::hit!(diff_length_mismatch);
            tracing::warn!(
                size = self.list.len(),
                expected = new.len(),
                "diff left the wrong number of elements; resetting"
            );
            let _ = self.list.apply(Edit::Reset { items: new });
            return;
        }
        // Matched items may differ in ways the content predicate ignores.
        self.list.replace_silently(new);
    }

    fn content_applied(&self) {
        let first = !std::mem::replace(&mut self.state.lock().content_applied, true);
        if first {
            if self.infers_available() {
                self.set_available(0);
            }
            if self.infers_loading() {
                self.set_loading(false);
            }
        }
    }

    fn clear_now(&self) {
        let requeued = {
            let mut state = self.state.lock();
            // The next content operation settles the side channels again.
            state.content_applied = false;
            let in_flight = state.in_flight.take();
            if let Some(in_flight) = &in_flight {
                state
                    .pending
                    .push_front(ContentOp::Overwrite(in_flight.new.as_ref().clone()));
            }
            in_flight.is_some()
        };
        self.list.clear();
        self.set_available(AVAILABLE_UNKNOWN);
        if requeued {
            self.pump();
        }
    }
}

/// Configuration for an [`ObservableData`].
pub struct ObservableDataBuilder<T> {
    contents: Option<Factory<Vec<T>>>,
    prepends: Option<Factory<Vec<T>>>,
    appends: Option<Factory<Vec<T>>>,
    loading: Option<Factory<bool>>,
    available: Option<Factory<usize>>,
    errors: Option<Factory<SourceError>>,
    diff_strategy: DiffStrategy<T>,
    diff_computation: DiffComputation,
    delivery_thread: Option<ThreadId>,
    waker: Option<Waker>,
    delivery_loop: Option<DeliveryHandle>,
}

impl<T: Clone + Send + Sync + 'static> Default for ObservableDataBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ObservableDataBuilder<T> {
    /// A builder with coarse, synchronous diffing delivering on the current thread.
    pub fn new() -> Self {
        Self {
            contents: None,
            prepends: None,
            appends: None,
            loading: None,
            available: None,
            errors: None,
            diff_strategy: DiffStrategy::default(),
            diff_computation: DiffComputation::default(),
            delivery_thread: None,
            waker: None,
            delivery_loop: None,
        }
    }

    /// Producer of complete snapshots. Without one the source stays empty.
    pub fn contents<P, F>(mut self, contents: F) -> Self
    where
        F: Fn(LoadType) -> P + Send + Sync + 'static,
        P: Producer<Vec<T>> + 'static,
    {
        self.contents = Some(factory(contents));
        self
    }

    /// Producer of pages inserted at the front.
    pub fn prepends<P, F>(mut self, prepends: F) -> Self
    where
        F: Fn(LoadType) -> P + Send + Sync + 'static,
        P: Producer<Vec<T>> + 'static,
    {
        self.prepends = Some(factory(prepends));
        self
    }

    /// Producer of pages appended at the end.
    pub fn appends<P, F>(mut self, appends: F) -> Self
    where
        F: Fn(LoadType) -> P + Send + Sync + 'static,
        P: Producer<Vec<T>> + 'static,
    {
        self.appends = Some(factory(appends));
        self
    }

    /// Producer of the loading flag, replacing inference.
    pub fn loading<P, F>(mut self, loading: F) -> Self
    where
        F: Fn(LoadType) -> P + Send + Sync + 'static,
        P: Producer<bool> + 'static,
    {
        self.loading = Some(factory(loading));
        self
    }

    /// Producer of the available count, replacing inference.
    pub fn available<P, F>(mut self, available: F) -> Self
    where
        F: Fn(LoadType) -> P + Send + Sync + 'static,
        P: Producer<usize> + 'static,
    {
        self.available = Some(factory(available));
        self
    }

    /// Producer of errors to forward to error observers.
    pub fn errors<P, F>(mut self, errors: F) -> Self
    where
        F: Fn(LoadType) -> P + Send + Sync + 'static,
        P: Producer<SourceError> + 'static,
    {
        self.errors = Some(factory(errors));
        self
    }

    /// How snapshots are diffed. Default: [`DiffStrategy::Coarse`].
    pub fn diff_strategy(mut self, strategy: DiffStrategy<T>) -> Self {
        self.diff_strategy = strategy;
        self
    }

    /// Where snapshots are diffed. Default: [`DiffComputation::Synchronous`].
    pub fn diff_computation(mut self, computation: DiffComputation) -> Self {
        self.diff_computation = computation;
        self
    }

    /// The thread that drains inline. Default: the thread calling `build`.
    pub fn delivery_thread(mut self, thread: ThreadId) -> Self {
        self.delivery_thread = Some(thread);
        self
    }

    /// Called once per batch of posts from other threads.
    pub fn waker(mut self, waker: Waker) -> Self {
        self.waker = Some(waker);
        self
    }

    /// Deliver on `delivery`'s thread and let it flush this source.
    pub fn delivery_loop(mut self, delivery: &DeliveryHandle) -> Self {
        self.delivery_thread = Some(delivery.thread_id());
        self.waker = Some(delivery.waker());
        self.delivery_loop = Some(delivery.clone());
        self
    }

    /// Create the source. Nothing is subscribed until the first structural observer.
    pub fn build(self) -> ObservableData<T> {
        let contents = self.contents.unwrap_or_else(|| {
            tracing::debug!("no contents producer configured");
            factory(|_| producer::empty::<Vec<T>>())
        });
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            list: NotifyingList::new(),
            mailbox: Mailbox::new(
                self.delivery_thread.unwrap_or_else(|| thread::current().id()),
                self.waker,
            ),
            producers: Producers {
                contents,
                prepends: self.prepends,
                appends: self.appends,
                loading: self.loading,
                available: self.available,
                errors: self.errors,
            },
            differ: self.diff_strategy.into_differ(),
            computation: self.diff_computation,
            state: Mutex::new(State {
                gate: LifecycleGate::new(),
                epoch: 0,
                subscriptions: Vec::new(),
                pending: VecDeque::new(),
                in_flight: None,
                seq: 0,
                content_applied: false,
                loading: false,
                available: AVAILABLE_UNKNOWN,
            }),
        });
        let data = ObservableData { inner };
        if let Some(delivery) = self.delivery_loop {
            delivery.attach(&data.as_flush());
        }
        data
    }
}
