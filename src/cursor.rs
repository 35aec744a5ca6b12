//! Data presenting the rows of a cursor.
//!
//! A [`CursorData`] loads a [`Cursor`] with a loader function on a
//! [`Scheduler`], maps rows to elements on demand, and reloads when the cursor
//! reports that its underlying data changed. Cursors are owned by the data:
//! callers never close them.
//!
//! ```ignore
//! let contacts = CursorData::builder(
//!     |_load_type| db.query("SELECT id, name FROM contacts"),
//!     |row: &Rows| Contact { id: row.get(0), name: row.get(1) },
//! )
//! .release_delay(Duration::from_secs(5))
//! .build();
//! ```
//!
//! Loading starts when the first structural observer arrives and the data is
//! stale. When the last observer leaves the change listener is detached and
//! the cursor is released after [`DEFAULT_RELEASE_DELAY`], unless an observer
//! comes back first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;

use crate::change::Change;
use crate::data::{AVAILABLE_UNKNOWN, Data, LoadType};
use crate::delivery::{DeliveryHandle, Flush, Mailbox, Waker};
use crate::error::{DataError, Result, SourceError};
use crate::observer::ObserverRegistry;
use crate::worker::{Scheduler, shared_worker};

/// How long an unobserved cursor is kept before it is closed.
pub const DEFAULT_RELEASE_DELAY: Duration = Duration::from_secs(3);

/// Callback a cursor invokes when its underlying data changed.
pub type ChangeListener = Arc<dyn Fn() + Send + Sync>;

/// A positioned view over a result set.
pub trait Cursor: Send + 'static {
    /// Number of rows.
    fn count(&self) -> usize;

    /// Position the cursor on `position`. Returns false if there is no such row.
    fn move_to(&mut self, position: usize) -> bool;

    /// Start reporting data changes to `listener`.
    fn register_change_listener(&mut self, listener: ChangeListener);

    /// Stop reporting data changes to `listener`.
    fn unregister_change_listener(&mut self, listener: &ChangeListener);

    /// Release the cursor's resources. Called exactly once.
    fn close(&mut self);
}

type Loader<C> = Arc<dyn Fn(LoadType) -> std::result::Result<C, SourceError> + Send + Sync>;
type Mapper<T, C> = Box<dyn Fn(&C) -> T + Send + Sync>;

enum Message<C> {
    Observed,
    Unobserved,
    Refresh(LoadType),
    Reload,
    Invalidate,
    Close,
    Loaded {
        task: u64,
        result: std::result::Result<C, SourceError>,
    },
    Release {
        generation: u64,
    },
}

struct Slot<C> {
    cursor: Option<C>,
    listening: bool,
}

struct Task {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

struct State {
    dirty: bool,
    clear_pending: bool,
    closed: bool,
    task: Option<Task>,
    next_task: u64,
    release_generation: u64,
    loading: bool,
    available: usize,
}

struct Inner<T, C: Cursor> {
    me: Weak<Inner<T, C>>,
    slot: Mutex<Slot<C>>,
    state: Mutex<State>,
    observers: ObserverRegistry,
    mailbox: Mailbox<Message<C>>,
    loader: Loader<C>,
    mapper: Mapper<T, C>,
    scheduler: Arc<dyn Scheduler>,
    release_delay: Duration,
    listener: ChangeListener,
}

/// Data backed by a [`Cursor`].
pub struct CursorData<T, C: Cursor> {
    inner: Arc<Inner<T, C>>,
}

impl<T, C: Cursor> Clone for CursorData<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, C> CursorData<T, C>
where
    T: Send + Sync + 'static,
    C: Cursor,
{
    /// Start configuring cursor data.
    pub fn builder<L, M>(loader: L, mapper: M) -> CursorDataBuilder<T, C>
    where
        L: Fn(LoadType) -> std::result::Result<C, SourceError> + Send + Sync + 'static,
        M: Fn(&C) -> T + Send + Sync + 'static,
    {
        CursorDataBuilder {
            loader: Arc::new(loader),
            mapper: Box::new(mapper),
            scheduler: None,
            release_delay: DEFAULT_RELEASE_DELAY,
            delivery_thread: None,
            waker: None,
            delivery_loop: None,
        }
    }

    /// Handle everything posted from other threads. Returns the number of messages.
    ///
    /// Notifications are dispatched on the calling thread.
    pub fn flush(&self) -> usize {
        self.inner.drain()
    }

    /// Cancel loading and close the cursor for good.
    pub fn close(&self) {
        self.inner.post(Message::Close);
    }

    /// This data as a flush target for a [`DeliveryLoop`](crate::DeliveryLoop).
    pub fn as_flush(&self) -> Arc<dyn Flush> {
        self.inner.clone()
    }
}

impl<T, C> Data<T> for CursorData<T, C>
where
    T: Send + Sync + 'static,
    C: Cursor,
{
    fn size(&self) -> usize {
        self.inner.slot.lock().cursor.as_ref().map_or(0, C::count)
    }

    fn try_get(&self, position: usize) -> Result<T> {
        if self.inner.state.lock().closed {
            return Err(DataError::CursorClosed);
        }
        let mut slot = self.inner.slot.lock();
        let Some(cursor) = slot.cursor.as_mut() else {
            return Err(DataError::OutOfRange { position, size: 0 });
        };
        let size = cursor.count();
        if position >= size || !cursor.move_to(position) {
            return Err(DataError::OutOfRange { position, size });
        }
        Ok((self.inner.mapper)(&*cursor))
    }

    fn is_loading(&self) -> bool {
        self.inner.state.lock().loading
    }

    fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    fn refresh(&self) {
        self.inner.post(Message::Refresh(LoadType::Refresh));
    }

    fn reload(&self) {
        self.inner.post(Message::Reload);
    }

    fn invalidate(&self) {
        self.inner.post(Message::Invalidate);
    }

    fn observers(&self) -> &ObserverRegistry {
        &self.inner.observers
    }

    fn on_data_observer_added(&self) {
        if self.inner.observers.data.len() == 1 {
            self.inner.post(Message::Observed);
        }
    }

    fn on_data_observer_removed(&self) {
        if self.inner.observers.data.is_empty() {
            self.inner.post(Message::Unobserved);
        }
    }
}

impl<T, C> Flush for Inner<T, C>
where
    T: Send + Sync + 'static,
    C: Cursor,
{
    fn flush(&self) -> usize {
        self.drain()
    }
}

impl<T, C> Inner<T, C>
where
    T: Send + Sync + 'static,
    C: Cursor,
{
    fn post(&self, message: Message<C>) {
        if self.mailbox.post(message) {
            self.drain();
        }
    }

    fn drain(&self) -> usize {
        self.mailbox.drain(|message| self.handle(message))
    }

    fn is_observed(&self) -> bool {
        !self.observers.data.is_empty()
    }

    fn handle(&self, message: Message<C>) {
        if self.state.lock().closed {
            if let Message::Loaded {
                result: Ok(mut cursor),
                ..
            } = message
            {
                cursor.close();
            }
            return;
        }
        match message {
            Message::Observed => {
                let (clear, stale) = {
                    let mut state = self.state.lock();
                    state.release_generation += 1;
                    let clear = std::mem::take(&mut state.clear_pending);
                    (clear, state.dirty)
                };
                if clear {
                    self.clear();
                }
                if self.slot.lock().cursor.is_none() || stale {
                    self.state.lock().dirty = true;
                    self.load_if_appropriate(LoadType::Implicit);
                }
                self.update_listener();
                self.update_loading();
            }
            Message::Unobserved => {
                self.update_listener();
                self.schedule_release();
            }
            Message::Refresh(load_type) => self.refresh(load_type),
            Message::Reload => {
                self.clear();
                self.refresh(LoadType::Reload);
            }
            Message::Invalidate => {
                {
                    let mut state = self.state.lock();
                    state.dirty = true;
                    state.clear_pending = true;
                }
                self.cancel_task();
                self.update_loading();
            }
            Message::Close => {
                self.cancel_task();
                self.change_cursor(None);
                let mut state = self.state.lock();
                state.closed = true;
                state.release_generation += 1;
                drop(state);
                self.update_loading();
                tracing::debug!("cursor data closed");
            }
            Message::Loaded { task, result } => {
                let current = {
                    let mut state = self.state.lock();
                    if state.task.as_ref().is_some_and(|t| t.id == task) {
                        state.task = None;
                        true
                    } else {
                        false
                    }
                };
                match (current, result) {
                    (false, Ok(mut cursor)) => {
                        cov_mark::hit!(superseded_cursor_closed);
                        cursor.close();
                    }
                    (false, Err(_)) => {}
                    (true, Ok(cursor)) => {
                        {
                            let mut state = self.state.lock();
                            state.dirty = false;
                            state.clear_pending = false;
                        }
                        self.change_cursor(Some(cursor));
                        self.set_available(0);
                        self.update_loading();
                    }
                    (true, Err(error)) => {
                        self.update_loading();
                        self.observers.notify_error(&error);
                    }
                }
            }
            Message::Release { generation } => {
                let due = self.state.lock().release_generation == generation;
                if due && !self.is_observed() {
                    cov_mark::hit!(cursor_released);
                    tracing::debug!("releasing unobserved cursor");
                    self.cancel_task();
                    self.change_cursor(None);
                    self.state.lock().dirty = true;
                    self.update_loading();
                }
            }
        }
    }

    fn refresh(&self, load_type: LoadType) {
        self.state.lock().dirty = true;
        self.cancel_task();
        self.load_if_appropriate(load_type);
        self.update_loading();
    }

    fn clear(&self) {
        self.change_cursor(None);
        self.set_available(AVAILABLE_UNKNOWN);
        self.state.lock().clear_pending = false;
    }

    fn cancel_task(&self) {
        if let Some(task) = self.state.lock().task.take() {
            tracing::debug!(task = task.id, "cancelling cursor load");
            task.cancelled.store(true, Ordering::Release);
        }
    }

    fn load_if_appropriate(&self, load_type: LoadType) {
        let (id, cancelled) = {
            let mut state = self.state.lock();
            if !state.dirty || state.task.is_some() || !self.is_observed() {
                return;
            }
            state.next_task += 1;
            let task = Task {
                id: state.next_task,
                cancelled: Arc::new(AtomicBool::new(false)),
            };
            let handle = (task.id, task.cancelled.clone());
            state.task = Some(task);
            handle
        };
        tracing::debug!(task = id, ?load_type, "loading cursor");
        let loader = self.loader.clone();
        let me = self.me.clone();
        self.scheduler.schedule(Box::new(move || {
            // Counting up front fills the cursor's window off the delivery thread.
            let result = loader(load_type).inspect(|cursor| {
                cursor.count();
            });
            if cancelled.load(Ordering::Acquire) {
                if let Ok(mut cursor) = result {
                    cov_mark::hit!(cancelled_load_closes_cursor);
                    cursor.close();
                }
                return;
            }
            match me.upgrade() {
                Some(inner) => inner.post(Message::Loaded { task: id, result }),
                None => {
                    if let Ok(mut cursor) = result {
                        cursor.close();
                    }
                }
            }
        }));
    }

    fn schedule_release(&self) {
        let generation = {
            let mut state = self.state.lock();
            state.release_generation += 1;
            state.release_generation
        };
        let me = self.me.clone();
        self.scheduler.schedule_after(
            self.release_delay,
            Box::new(move || {
                if let Some(inner) = me.upgrade() {
                    inner.post(Message::Release { generation });
                }
            }),
        );
    }

    /// Install `new`, close the previous cursor, and announce the difference.
    fn change_cursor(&self, new: Option<C>) {
        let (old, old_count, new_count) = {
            let mut slot = self.slot.lock();
            let mut old = std::mem::replace(&mut slot.cursor, new);
            if std::mem::take(&mut slot.listening)
                && let Some(old) = old.as_mut()
            {
                old.unregister_change_listener(&self.listener);
            }
            let old_count = old.as_ref().map_or(0, C::count);
            let new_count = slot.cursor.as_ref().map_or(0, C::count);
            (old, old_count, new_count)
        };
        if let Some(mut old) = old {
            old.close();
        }
        self.update_listener();

        if new_count < old_count {
            self.observers
                .notify_change(&Change::removed(new_count, old_count - new_count));
        } else if new_count > old_count {
            self.observers
                .notify_change(&Change::inserted(old_count, new_count - old_count));
        }
        self.observers
            .notify_change(&Change::changed(0, old_count.min(new_count)));
    }

    fn update_listener(&self) {
        let observed = self.is_observed();
        let mut slot = self.slot.lock();
        let Slot { cursor, listening } = &mut *slot;
        let Some(cursor) = cursor.as_mut() else {
            return;
        };
        if observed && !*listening {
            cursor.register_change_listener(self.listener.clone());
            *listening = true;
        } else if !observed && *listening {
            cursor.unregister_change_listener(&self.listener);
            *listening = false;
        }
    }

    fn update_loading(&self) {
        let (loading, changed) = {
            let mut state = self.state.lock();
            let loading = state.task.is_some();
            (loading, std::mem::replace(&mut state.loading, loading) != loading)
        };
        if changed {
            self.observers.notify_loading(loading);
        }
    }

    fn set_available(&self, available: usize) {
        let changed = std::mem::replace(&mut self.state.lock().available, available) != available;
        if changed {
            self.observers.notify_available(available);
        }
    }
}

impl<T, C: Cursor> Drop for Inner<T, C> {
    fn drop(&mut self) {
        if let Some(mut cursor) = self.slot.get_mut().cursor.take() {
            cursor.close();
        }
        if let Some(task) = self.state.get_mut().task.take() {
            task.cancelled.store(true, Ordering::Release);
        }
    }
}

/// Configuration for a [`CursorData`].
pub struct CursorDataBuilder<T, C> {
    loader: Loader<C>,
    mapper: Mapper<T, C>,
    scheduler: Option<Arc<dyn Scheduler>>,
    release_delay: Duration,
    delivery_thread: Option<ThreadId>,
    waker: Option<Waker>,
    delivery_loop: Option<DeliveryHandle>,
}

impl<T, C> CursorDataBuilder<T, C>
where
    T: Send + Sync + 'static,
    C: Cursor,
{
    /// Where the loader runs. Default: the shared worker.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// How long an unobserved cursor is kept. Default: [`DEFAULT_RELEASE_DELAY`].
    pub fn release_delay(mut self, delay: Duration) -> Self {
        self.release_delay = delay;
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

    /// Deliver on `delivery`'s thread and let it flush this data.
    pub fn delivery_loop(mut self, delivery: &DeliveryHandle) -> Self {
        self.delivery_thread = Some(delivery.thread_id());
        self.waker = Some(delivery.waker());
        self.delivery_loop = Some(delivery.clone());
        self
    }

    /// Create the data. Nothing is loaded until the first structural observer.
    pub fn build(self) -> CursorData<T, C> {
        let inner = Arc::new_cyclic(|me: &Weak<Inner<T, C>>| {
            let signal = me.clone();
            let listener: ChangeListener = Arc::new(move || {
                if let Some(inner) = signal.upgrade() {
                    tracing::trace!("cursor reported a change");
                    inner
                        .mailbox
                        .post_deferred(Message::Refresh(LoadType::Refresh));
                }
            });
            Inner {
                me: me.clone(),
                slot: Mutex::new(Slot {
                    cursor: None,
                    listening: false,
                }),
                state: Mutex::new(State {
                    dirty: true,
                    clear_pending: false,
                    closed: false,
                    task: None,
                    next_task: 0,
                    release_generation: 0,
                    loading: false,
                    available: AVAILABLE_UNKNOWN,
                }),
                observers: ObserverRegistry::new(),
                mailbox: Mailbox::new(
                    self.delivery_thread.unwrap_or_else(|| thread::current().id()),
                    self.waker,
                ),
                loader: self.loader,
                mapper: self.mapper,
                scheduler: self.scheduler.unwrap_or_else(shared_worker),
                release_delay: self.release_delay,
                listener,
            }
        });
        let data = CursorData { inner };
        if let Some(delivery) = self.delivery_loop {
            delivery.attach(&data.as_flush());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingObserver;
    use crate::worker::ManualScheduler;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Handle {
        closed: AtomicUsize,
        listeners: Mutex<Vec<ChangeListener>>,
    }

    impl Handle {
        fn dispatch_change(&self) {
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener();
            }
        }
    }

    struct FakeCursor {
        rows: Vec<&'static str>,
        position: Option<usize>,
        handle: Arc<Handle>,
    }

    impl FakeCursor {
        fn new(rows: Vec<&'static str>) -> (Self, Arc<Handle>) {
            let handle = Arc::new(Handle::default());
            (
                FakeCursor {
                    rows,
                    position: None,
                    handle: handle.clone(),
                },
                handle,
            )
        }
    }

    impl Cursor for FakeCursor {
        fn count(&self) -> usize {
            self.rows.len()
        }

        fn move_to(&mut self, position: usize) -> bool {
            self.position = Some(position);
            position < self.rows.len()
        }

        fn register_change_listener(&mut self, listener: ChangeListener) {
            self.handle.listeners.lock().push(listener);
        }

        fn unregister_change_listener(&mut self, listener: &ChangeListener) {
            self.handle
                .listeners
                .lock()
                .retain(|l| !Arc::ptr_eq(l, listener));
        }

        fn close(&mut self) {
            self.handle.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    type Rows = Vec<Vec<&'static str>>;

    /// Loader handing out one fake cursor per call, cycling through `sets`.
    fn loader(
        sets: Rows,
    ) -> (
        impl Fn(LoadType) -> std::result::Result<FakeCursor, SourceError> + Send + Sync + 'static,
        Arc<Mutex<Vec<(LoadType, Arc<Handle>)>>>,
    ) {
        let calls: Arc<Mutex<Vec<(LoadType, Arc<Handle>)>>> = Arc::default();
        let log = calls.clone();
        let load = move |load_type| {
            let mut log = log.lock();
            let rows = sets[log.len() % sets.len()].clone();
            let (cursor, handle) = FakeCursor::new(rows);
            log.push((load_type, handle));
            Ok(cursor)
        };
        (load, calls)
    }

    fn build(
        sets: Rows,
    ) -> (
        Arc<CursorData<String, FakeCursor>>,
        Arc<ManualScheduler>,
        Arc<Mutex<Vec<(LoadType, Arc<Handle>)>>>,
    ) {
        let scheduler = Arc::new(ManualScheduler::new());
        let (load, calls) = loader(sets);
        let data = CursorData::builder(load, |cursor: &FakeCursor| {
            let position = cursor.position.unwrap_or(usize::MAX);
            cursor.rows[position].to_owned()
        })
        .scheduler(scheduler.clone())
        .build();
        (Arc::new(data), scheduler, calls)
    }

    #[test]
    fn first_observer_loads_on_the_scheduler() {
        let (data, scheduler, calls) = build(vec![vec!["a", "b", "c"]]);
        let recorder = RecordingObserver::attach(&data);
        assert!(data.is_loading());
        assert_eq!(data.size(), 0);

        scheduler.run_pending();
        assert_eq!(data.size(), 3);
        assert_eq!(data.get(1), "b");
        assert_eq!(calls.lock()[0].0, LoadType::Implicit);
        assert_eq!(recorder.loading(), vec![false, true, false]);
        assert_eq!(recorder.available(), vec![AVAILABLE_UNKNOWN, 0]);
        assert_eq!(recorder.changes(), vec![Change::inserted(0, 3)]);
        recorder.assert_consistent();
    }

    #[test]
    fn old_cursor_is_closed_after_the_new_one_is_installed() {
        let (data, scheduler, calls) = build(vec![vec!["a", "b", "c"], vec!["d", "e"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        data.refresh();
        scheduler.run_pending();

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, LoadType::Refresh);
        assert_eq!(calls[0].1.closed.load(Ordering::Relaxed), 1);
        assert_eq!(calls[1].1.closed.load(Ordering::Relaxed), 0);
        assert_eq!(
            recorder.changes(),
            vec![
                Change::inserted(0, 3),
                Change::removed(2, 1),
                Change::changed(0, 2)
            ]
        );
        recorder.assert_consistent();
    }

    #[test]
    fn change_signal_schedules_a_refresh() {
        let (data, scheduler, calls) = build(vec![vec!["a"], vec!["a", "b"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();

        let handle = calls.lock()[0].1.clone();
        handle.dispatch_change();
        // Nothing reloads inline.
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(data.flush(), 1);
        scheduler.run_pending();
        assert_eq!(calls.lock().len(), 2);
        assert_eq!(data.size(), 2);
        recorder.assert_consistent();
    }

    #[test]
    fn unobserved_cursor_is_released_after_the_delay() {
        cov_mark::check!(cursor_released);
        let (data, scheduler, calls) = build(vec![vec!["a", "b"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();

        recorder.set_observing(false);
        let handle = calls.lock()[0].1.clone();
        assert!(handle.listeners.lock().is_empty(), "listener detached");
        scheduler.advance(DEFAULT_RELEASE_DELAY - Duration::from_millis(1));
        assert_eq!(handle.closed.load(Ordering::Relaxed), 0);
        scheduler.advance(Duration::from_millis(1));
        assert_eq!(handle.closed.load(Ordering::Relaxed), 1);
        assert_eq!(data.size(), 0);
    }

    #[test]
    fn reobserving_cancels_the_release() {
        let (data, scheduler, calls) = build(vec![vec!["a"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        recorder.set_observing(false);
        recorder.set_observing(true);
        scheduler.advance(DEFAULT_RELEASE_DELAY * 2);
        assert_eq!(calls.lock()[0].1.closed.load(Ordering::Relaxed), 0);
        assert_eq!(calls.lock().len(), 1);
        assert_eq!(data.size(), 1);
    }

    #[test]
    fn cancelled_load_closes_its_cursor() {
        cov_mark::check!(cancelled_load_closes_cursor);
        let (data, scheduler, calls) = build(vec![vec!["a"], vec!["b"]]);
        let _recorder = RecordingObserver::attach(&data);
        data.refresh();
        scheduler.run_pending();

        let calls = calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1.closed.load(Ordering::Relaxed), 1);
        assert_eq!(data.get(0), "b");
    }

    #[test]
    fn load_finishing_after_a_refresh_is_discarded() {
        cov_mark::check!(superseded_cursor_closed);
        let scheduler = Arc::new(ManualScheduler::new());
        let (load, calls) = loader(vec![vec!["a"], vec!["b"]]);
        let data = Arc::new(
            CursorData::builder(load, |cursor: &FakeCursor| {
                cursor.rows[cursor.position.unwrap_or(usize::MAX)].to_owned()
            })
            .scheduler(scheduler.clone())
            .delivery_thread(thread::spawn(|| thread::current().id()).join().unwrap())
            .build(),
        );
        let recorder = RecordingObserver::attach(&data);
        data.flush();
        data.refresh();
        // The first load completes before the refresh is handled.
        scheduler.run_pending();
        data.flush();
        scheduler.run_pending();
        data.flush();

        assert_eq!(calls.lock()[0].1.closed.load(Ordering::Relaxed), 1);
        assert_eq!(data.to_vec(), vec!["b".to_owned()]);
        assert_eq!(recorder.changes(), vec![Change::inserted(0, 1)]);
    }

    #[test]
    fn load_errors_are_reported_and_settle_loading() {
        let scheduler = Arc::new(ManualScheduler::new());
        let data = Arc::new(
            CursorData::builder(
                |_| Err(crate::source_error("disk full")),
                |_: &FakeCursor| String::new(),
            )
            .scheduler(scheduler.clone())
            .build(),
        );
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        assert_eq!(recorder.loading(), vec![false, true, false]);
        assert_eq!(recorder.errors().len(), 1);
        assert_eq!(data.size(), 0);
    }

    #[test]
    fn closed_data_refuses_reads() {
        let (data, scheduler, calls) = build(vec![vec!["a"]]);
        let _recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        data.close();
        assert!(matches!(data.try_get(0), Err(DataError::CursorClosed)));
        assert_eq!(calls.lock()[0].1.closed.load(Ordering::Relaxed), 1);
    }
}
