//! Data loaded one page at a time.
//!
//! A [`PagedData`] runs a page loader on a [`Scheduler`] and appends each page
//! to its elements. After a page lands it waits until more are asked for, with
//! [`load_next`](PagedData::load_next) or by reporting presented positions
//! through [`presented`](PagedData::presented):
//!
//! ```ignore
//! let feed = PagedData::builder(|request: PageRequest| {
//!     let items = api.news(request.index)?;
//!     Ok(if items.is_empty() { Page::last(items) } else { Page::more(items) })
//! })
//! .look_ahead(10)
//! .build();
//!
//! // While binding row `position`:
//! feed.presented(position);
//! ```
//!
//! Refreshing restarts from page 0 and keeps the current elements until the
//! first page replaces them. A failed page is requested again by the next
//! `load_next`, or when an observer arrives after the failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::data::{AVAILABLE_UNKNOWN, Data, LoadType};
use crate::delivery::{DeliveryHandle, Flush, Mailbox, Waker};
use crate::error::{Result, SourceError};
use crate::notifying::NotifyingList;
use crate::observer::ObserverRegistry;
use crate::worker::{Scheduler, shared_worker};

/// Rows from the end of the data at which presenting a row loads the next page.
pub const DEFAULT_LOOK_AHEAD: usize = 5;

/// One page of elements.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page<T> {
    /// Elements to append.
    pub items: Vec<T>,
    /// Elements known to remain after this page; 0 ends loading.
    pub remaining: usize,
}

impl<T> Page<T> {
    /// A page followed by `remaining` more elements.
    pub fn new(items: Vec<T>, remaining: usize) -> Self {
        Self { items, remaining }
    }

    /// A page followed by an unknown number of elements.
    pub fn more(items: Vec<T>) -> Self {
        Self::new(items, AVAILABLE_UNKNOWN)
    }

    /// The final page.
    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, 0)
    }
}

/// What the loader is asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Zero-based page number within the current load.
    pub index: usize,
    /// Why the current load started.
    pub load_type: LoadType,
}

type Loader<T> =
    Arc<dyn Fn(PageRequest) -> std::result::Result<Page<T>, SourceError> + Send + Sync>;

enum Message<T> {
    Observed,
    Refresh(LoadType),
    Reload,
    Invalidate,
    LoadNext,
    Loaded {
        task: u64,
        index: usize,
        result: std::result::Result<Page<T>, SourceError>,
    },
}

struct Task {
    id: u64,
    cancelled: Arc<AtomicBool>,
}

struct State {
    dirty: bool,
    clear_pending: bool,
    load_type: LoadType,
    next_page: usize,
    more: bool,
    failed: bool,
    task: Option<Task>,
    next_task: u64,
    loading: bool,
    available: usize,
    look_ahead: usize,
}

struct Inner<T> {
    me: Weak<Inner<T>>,
    list: NotifyingList<T>,
    state: Mutex<State>,
    mailbox: Mailbox<Message<T>>,
    loader: Loader<T>,
    scheduler: Arc<dyn Scheduler>,
}

/// Data appending pages from a loader. See the [module docs](self).
pub struct PagedData<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PagedData<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PagedData<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Start configuring paged data.
    pub fn builder<L>(loader: L) -> PagedDataBuilder<T>
    where
        L: Fn(PageRequest) -> std::result::Result<Page<T>, SourceError> + Send + Sync + 'static,
    {
        PagedDataBuilder {
            loader: Arc::new(loader),
            scheduler: None,
            look_ahead: DEFAULT_LOOK_AHEAD,
            delivery_thread: None,
            waker: None,
            delivery_loop: None,
        }
    }

    /// Request the next page, retrying a failed one.
    ///
    /// Does nothing while a page is loading or after the last page.
    pub fn load_next(&self) {
        self.inner.post(Message::LoadNext);
    }

    /// Report that the row at `position` is being shown.
    ///
    /// Loads the next page when `position` is within the look-ahead of the end.
    pub fn presented(&self, position: usize) {
        let look_ahead = self.inner.state.lock().look_ahead;
        if position.saturating_add(look_ahead).saturating_add(1) >= self.inner.list.len() {
            self.load_next();
        }
    }

    /// Rows from the end at which [`presented`](Self::presented) loads more.
    pub fn look_ahead(&self) -> usize {
        self.inner.state.lock().look_ahead
    }

    /// Change the look-ahead used by [`presented`](Self::presented).
    pub fn set_look_ahead(&self, rows: usize) {
        self.inner.state.lock().look_ahead = rows;
    }

    /// Handle everything posted from other threads. Returns the number of messages.
    ///
    /// Notifications are dispatched on the calling thread.
    pub fn flush(&self) -> usize {
        self.inner.drain()
    }

    /// This data as a flush target for a [`DeliveryLoop`](crate::DeliveryLoop).
    pub fn as_flush(&self) -> Arc<dyn Flush> {
        self.inner.clone()
    }
}

impl<T> Data<T> for PagedData<T>
where
    T: Clone + Send + Sync + 'static,
{
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
        self.inner.post(Message::Refresh(LoadType::Refresh));
    }

    fn reload(&self) {
        self.inner.post(Message::Reload);
    }

    fn invalidate(&self) {
        self.inner.post(Message::Invalidate);
    }

    fn observers(&self) -> &ObserverRegistry {
        self.inner.list.observers()
    }

    fn on_data_observer_added(&self) {
        if self.inner.list.observers().data.len() == 1 {
            self.inner.post(Message::Observed);
        }
    }

    fn to_vec(&self) -> Vec<T> {
        self.inner.list.to_vec()
    }
}

impl<T> Flush for Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn flush(&self) -> usize {
        self.drain()
    }
}

impl<T> Inner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn post(&self, message: Message<T>) {
        if self.mailbox.post(message) {
            self.drain();
        }
    }

    fn drain(&self) -> usize {
        self.mailbox.drain(|message| self.handle(message))
    }

    fn is_observed(&self) -> bool {
        !self.list.observers().data.is_empty()
    }

    fn handle(&self, message: Message<T>) {
        match message {
            Message::Observed => {
                let (clear, retry) = {
                    let mut state = self.state.lock();
                    (
                        std::mem::take(&mut state.clear_pending),
                        std::mem::take(&mut state.failed),
                    )
                };
                if clear {
                    self.list.clear();
                }
                if retry {
                    tracing::debug!("retrying the failed page");
                    self.request_page();
                }
                self.start_if_dirty();
                self.update_loading();
            }
            Message::Refresh(load_type) => self.refresh(load_type),
            Message::Reload => {
                self.list.clear();
                self.state.lock().clear_pending = false;
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
            Message::LoadNext => {
                self.state.lock().failed = false;
                self.request_page();
                self.update_loading();
            }
            Message::Loaded {
                task,
                index,
                result,
            } => {
                let current = {
                    let mut state = self.state.lock();
                    let current = state.task.as_ref().is_some_and(|t| t.id == task);
                    if current {
                        state.task = None;
                    }
                    current
                };
                if !current {
                    cov_mark::hit!(superseded_page_dropped);
                    return;
                }
                match result {
                    Ok(page) => self.apply_page(index, page),
                    Err(error) => {
                        tracing::debug!(page = index, %error, "page failed to load");
                        self.state.lock().failed = true;
                        self.list.observers().notify_error(&error);
                    }
                }
                self.update_loading();
            }
        }
    }

    fn refresh(&self, load_type: LoadType) {
        self.cancel_task();
        {
            let mut state = self.state.lock();
            state.dirty = true;
            state.load_type = load_type;
        }
        self.set_available(AVAILABLE_UNKNOWN);
        self.start_if_dirty();
        self.update_loading();
    }

    /// Restart from page 0 if the elements are stale and someone is watching.
    fn start_if_dirty(&self) {
        {
            let mut state = self.state.lock();
            if !state.dirty || !self.is_observed() {
                return;
            }
            state.dirty = false;
            state.next_page = 0;
            state.more = true;
            state.failed = false;
        }
        self.request_page();
    }

    fn apply_page(&self, index: usize, page: Page<T>) {
        let Page { items, remaining } = page;
        tracing::debug!(page = index, items = items.len(), remaining, "page loaded");
        if index == 0 {
            // The first page of a load replaces whatever the previous load left.
            self.list.replace_all(items);
        } else {
            self.list.extend(items);
        }
        {
            let mut state = self.state.lock();
            state.next_page = index + 1;
            state.more = remaining > 0;
        }
        self.set_available(remaining);
    }

    fn cancel_task(&self) {
        if let Some(task) = self.state.lock().task.take() {
            tracing::debug!(task = task.id, "cancelling page load");
            task.cancelled.store(true, Ordering::Release);
        }
    }

    fn request_page(&self) {
        let (id, cancelled, request) = {
            let mut state = self.state.lock();
            if state.task.is_some() || !state.more || state.dirty || !self.is_observed() {
                return;
            }
            state.next_task += 1;
            let task = Task {
                id: state.next_task,
                cancelled: Arc::new(AtomicBool::new(false)),
            };
            let request = PageRequest {
                index: state.next_page,
                load_type: state.load_type,
            };
            let handle = (task.id, task.cancelled.clone(), request);
            state.task = Some(task);
            handle
        };
        tracing::debug!(task = id, page = request.index, "loading page");
        let loader = self.loader.clone();
        let me = self.me.clone();
        self.scheduler.schedule(Box::new(move || {
            let result = loader(request);
            if cancelled.load(Ordering::Acquire) {
                cov_mark::hit!(cancelled_page_dropped);
                return;
            }
            if let Some(inner) = me.upgrade() {
                inner.post(Message::Loaded {
                    task: id,
                    index: request.index,
                    result,
                });
            }
        }));
    }

    fn update_loading(&self) {
        let (loading, changed) = {
            let mut state = self.state.lock();
            let loading = state.task.is_some();
            (loading, std::mem::replace(&mut state.loading, loading) != loading)
        };
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
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(task) = self.state.get_mut().task.take() {
            task.cancelled.store(true, Ordering::Release);
        }
    }
}

/// Configuration for a [`PagedData`].
pub struct PagedDataBuilder<T> {
    loader: Loader<T>,
    scheduler: Option<Arc<dyn Scheduler>>,
    look_ahead: usize,
    delivery_thread: Option<ThreadId>,
    waker: Option<Waker>,
    delivery_loop: Option<DeliveryHandle>,
}

impl<T> PagedDataBuilder<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Where the loader runs. Default: the shared worker.
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Rows from the end at which presenting loads more. Default: [`DEFAULT_LOOK_AHEAD`].
    pub fn look_ahead(mut self, rows: usize) -> Self {
        self.look_ahead = rows;
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
    pub fn build(self) -> PagedData<T> {
        let inner = Arc::new_cyclic(|me: &Weak<Inner<T>>| Inner {
            me: me.clone(),
            list: NotifyingList::new(),
            state: Mutex::new(State {
                dirty: true,
                clear_pending: false,
                load_type: LoadType::Implicit,
                next_page: 0,
                more: true,
                failed: false,
                task: None,
                next_task: 0,
                loading: false,
                available: AVAILABLE_UNKNOWN,
                look_ahead: self.look_ahead,
            }),
            mailbox: Mailbox::new(
                self.delivery_thread.unwrap_or_else(|| thread::current().id()),
                self.waker,
            ),
            loader: self.loader,
            scheduler: self.scheduler.unwrap_or_else(shared_worker),
        });
        let data = PagedData { inner };
        if let Some(delivery) = self.delivery_loop {
            delivery.attach(&data.as_flush());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::testing::RecordingObserver;
    use crate::worker::ManualScheduler;

    type Calls = Arc<Mutex<Vec<PageRequest>>>;

    /// Serves `pages` in order; the last one ends loading.
    fn build(pages: Vec<Vec<&'static str>>) -> (Arc<PagedData<String>>, Arc<ManualScheduler>, Calls) {
        build_with(move |request| {
            let items: Vec<String> = pages[request.index].iter().map(|s| s.to_string()).collect();
            if request.index + 1 == pages.len() {
                Ok(Page::last(items))
            } else {
                Ok(Page::more(items))
            }
        })
    }

    fn build_with(
        load: impl Fn(PageRequest) -> std::result::Result<Page<String>, SourceError>
        + Send
        + Sync
        + 'static,
    ) -> (Arc<PagedData<String>>, Arc<ManualScheduler>, Calls) {
        let scheduler = Arc::new(ManualScheduler::new());
        let calls: Calls = Arc::default();
        let log = calls.clone();
        let data = PagedData::builder(move |request| {
            log.lock().push(request);
            load(request)
        })
        .scheduler(scheduler.clone())
        .look_ahead(1)
        .build();
        (Arc::new(data), scheduler, calls)
    }

    fn request(index: usize, load_type: LoadType) -> PageRequest {
        PageRequest { index, load_type }
    }

    #[test]
    fn first_observer_loads_the_first_page() {
        let (data, scheduler, calls) = build(vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(scheduler.pending(), 0);

        let recorder = RecordingObserver::attach(&data);
        assert!(data.is_loading());
        scheduler.run_pending();

        assert_eq!(data.to_vec(), vec!["a", "b"]);
        assert_eq!(*calls.lock(), vec![request(0, LoadType::Implicit)]);
        assert_eq!(recorder.changes(), vec![Change::inserted(0, 2)]);
        assert_eq!(recorder.loading(), vec![false, true, false]);
        assert_eq!(recorder.available(), vec![AVAILABLE_UNKNOWN]);
        // Waits to be asked for the next page.
        assert_eq!(scheduler.pending(), 0);
        recorder.assert_consistent();
    }

    #[test]
    fn load_next_appends_until_the_last_page() {
        let (data, scheduler, calls) = build(vec![vec!["a", "b"], vec!["c", "d"], vec!["e"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();

        data.load_next();
        // A second request while the page is loading is ignored.
        data.load_next();
        scheduler.run_pending();
        data.load_next();
        scheduler.run_pending();
        data.load_next();
        assert_eq!(scheduler.pending(), 0);

        assert_eq!(data.to_vec(), vec!["a", "b", "c", "d", "e"]);
        assert_eq!(calls.lock().len(), 3);
        assert_eq!(calls.lock()[2], request(2, LoadType::Implicit));
        assert_eq!(
            recorder.changes(),
            vec![
                Change::inserted(0, 2),
                Change::inserted(2, 2),
                Change::inserted(4, 1)
            ]
        );
        assert_eq!(recorder.available(), vec![AVAILABLE_UNKNOWN, 0]);
        assert!(!data.is_loading());
        recorder.assert_consistent();
    }

    #[test]
    fn presenting_rows_near_the_end_loads_more() {
        let (data, scheduler, _calls) = build(vec![vec!["a", "b", "c"], vec!["d"]]);
        let _recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();

        data.presented(0);
        assert!(!data.is_loading());
        data.presented(1);
        assert!(data.is_loading());
        scheduler.run_pending();
        assert_eq!(data.size(), 4);

        data.set_look_ahead(10);
        assert_eq!(data.look_ahead(), 10);
        data.presented(0);
        // Nothing remains.
        assert!(!data.is_loading());
    }

    #[test]
    fn failed_page_is_retried_on_demand() {
        let remaining = Arc::new(Mutex::new(1));
        let (data, scheduler, calls) = build_with(move |request| match request.index {
            0 => Ok(Page::more(vec!["a".to_owned()])),
            _ if std::mem::replace(&mut *remaining.lock(), 0) > 0 => {
                Err(crate::source_error("timed out"))
            }
            _ => Ok(Page::last(vec!["b".to_owned()])),
        });
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        data.load_next();
        scheduler.run_pending();

        assert_eq!(recorder.errors().len(), 1);
        assert!(!data.is_loading());
        assert_eq!(data.size(), 1);

        data.load_next();
        scheduler.run_pending();
        assert_eq!(data.to_vec(), vec!["a", "b"]);
        assert_eq!(calls.lock()[1..], [request(1, LoadType::Implicit); 2]);
        recorder.assert_consistent();
    }

    #[test]
    fn returning_observer_retries_a_failed_page() {
        let remaining = Arc::new(Mutex::new(1));
        let (data, scheduler, _calls) = build_with(move |request| match request.index {
            0 => Ok(Page::more(vec!["a".to_owned()])),
            _ if std::mem::replace(&mut *remaining.lock(), 0) > 0 => {
                Err(crate::source_error("timed out"))
            }
            _ => Ok(Page::last(vec!["b".to_owned()])),
        });
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        data.load_next();
        scheduler.run_pending();
        assert_eq!(recorder.errors().len(), 1);

        recorder.set_observing(false);
        recorder.set_observing(true);
        assert!(data.is_loading());
        scheduler.run_pending();
        assert_eq!(data.to_vec(), vec!["a", "b"]);
        recorder.assert_consistent();
    }

    #[test]
    fn refresh_keeps_elements_until_the_first_page_replaces_them() {
        let generation = Arc::new(Mutex::new(0));
        let current = generation.clone();
        let (data, scheduler, calls) = build_with(move |request| {
            let generation = *current.lock();
            let item = format!("{generation}.{}", request.index);
            Ok(match request.index {
                0 => Page::more(vec![item.clone(), item]),
                _ => Page::last(vec![item]),
            })
        });
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        data.load_next();
        scheduler.run_pending();
        assert_eq!(data.size(), 3);

        *generation.lock() = 1;
        recorder.clear();
        data.refresh();
        assert!(data.is_loading());
        assert_eq!(data.available(), AVAILABLE_UNKNOWN);
        assert_eq!(data.size(), 3);

        scheduler.run_pending();
        assert_eq!(data.to_vec(), vec!["1.0", "1.0"]);
        assert_eq!(calls.lock()[2], request(0, LoadType::Refresh));
        assert_eq!(
            recorder.changes(),
            vec![Change::removed(2, 1), Change::changed(0, 2)]
        );
        recorder.assert_consistent();
    }

    #[test]
    fn refresh_drops_the_page_in_flight() {
        cov_mark::check!(cancelled_page_dropped);
        let (data, scheduler, calls) = build(vec![vec!["a"]]);
        let recorder = RecordingObserver::attach(&data);
        data.refresh();
        scheduler.run_pending();

        assert_eq!(
            *calls.lock(),
            vec![request(0, LoadType::Implicit), request(0, LoadType::Refresh)]
        );
        assert_eq!(recorder.changes(), vec![Change::inserted(0, 1)]);
        recorder.assert_consistent();
    }

    #[test]
    fn reload_clears_before_loading() {
        let (data, scheduler, calls) = build(vec![vec!["a", "b"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        data.reload();
        assert_eq!(data.size(), 0);
        scheduler.run_pending();

        assert_eq!(calls.lock()[1], request(0, LoadType::Reload));
        assert_eq!(
            recorder.changes(),
            vec![
                Change::inserted(0, 2),
                Change::removed(0, 2),
                Change::inserted(0, 2)
            ]
        );
        recorder.assert_consistent();
    }

    #[test]
    fn invalidated_data_clears_when_observed_again() {
        let (data, scheduler, calls) = build(vec![vec!["a", "b"], vec!["c"]]);
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();

        recorder.set_observing(false);
        data.invalidate();
        assert_eq!(data.size(), 2);
        assert_eq!(scheduler.pending(), 0);

        recorder.set_observing(true);
        assert_eq!(data.size(), 0);
        scheduler.run_pending();
        assert_eq!(data.to_vec(), vec!["a", "b"]);
        assert_eq!(calls.lock().len(), 2);
        recorder.assert_consistent();
    }
}
