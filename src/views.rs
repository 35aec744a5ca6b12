//! Views that re-map the positions of another data.
//!
//! A [`View`] presents a subset of an inner [`Data`] chosen by a
//! [`Projection`]. While the view has structural observers it observes the
//! inner data and translates every inner change into changes of its own
//! positions; side-channel observers are registered on the inner data
//! directly.
//!
//! ```ignore
//! let visible = views::filter(contacts.clone(), |c: &Contact| !c.archived);
//! let first_page = views::limit(Arc::new(visible), 20);
//! ```
//!
//! One inner change may become several view changes, for example an insertion
//! into a full window pushes elements out of its tail. The view announces them
//! in order and reports, after each, the size that change leaves behind.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::change::Change;
use crate::data::Data;
use crate::error::{DataError, Result};
use crate::observer::{
    AvailableObserver, DataObserver, ErrorObserver, LoadingObserver, ObserverRegistry,
};

/// Maps view positions onto an inner data and translates its changes.
pub trait Projection<T>: Send + 'static {
    /// Size of the view over `inner` as it stands.
    fn size(&self, inner: &dyn Data<T>) -> usize;

    /// Inner position of the element shown at `position`.
    fn inner_position(&self, inner: &dyn Data<T>, position: usize) -> Option<usize>;

    /// Called before the view starts observing `inner`.
    fn attach(&mut self, inner: &dyn Data<T>) {
        let _ = inner;
    }

    /// Called after the view stopped observing its inner data.
    fn detach(&mut self) {}

    /// Translate `change`, already applied to `inner`, into view changes.
    fn translate(&mut self, inner: &dyn Data<T>, change: &Change, out: &mut Vec<Change>);
}

struct Shared<T, P> {
    inner: Arc<dyn Data<T>>,
    observers: ObserverRegistry,
    projection: Mutex<P>,
    // Size announced to observers; `None` while unobserved.
    published: Mutex<Option<usize>>,
    forward: Arc<dyn DataObserver>,
}

struct Forward<T, P>(Weak<Shared<T, P>>);

impl<T: 'static, P: Projection<T>> DataObserver for Forward<T, P> {
    fn on_change(&self, change: &Change) {
        if let Some(shared) = self.0.upgrade() {
            let mut out = Vec::new();
            shared
                .projection
                .lock()
                .translate(&*shared.inner, change, &mut out);
            shared.publish(out);
        }
    }
}

impl<T: 'static, P: Projection<T>> Shared<T, P> {
    fn publish(&self, changes: Vec<Change>) {
        for change in changes {
            if change.is_empty() {
                continue;
            }
            let actual = match change {
                Change::Reset => self.projection.lock().size(&*self.inner),
                _ => 0,
            };
            {
                let mut published = self.published.lock();
                let Some(size) = published.as_mut() else {
                    return;
                };
                *size = change.apply_to_size(*size, actual);
            }
            self.observers.notify_change(&change);
        }
    }
}

/// A [`Data`] showing part of another data. See the [module docs](self).
pub struct View<T, P> {
    shared: Arc<Shared<T, P>>,
}

impl<T, P> Clone for View<T, P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: 'static, P: Projection<T>> View<T, P> {
    /// View `inner` through `projection`.
    pub fn new(inner: Arc<dyn Data<T>>, projection: P) -> Self {
        let shared = Arc::new_cyclic(|me: &Weak<Shared<T, P>>| Shared {
            inner,
            observers: ObserverRegistry::new(),
            projection: Mutex::new(projection),
            published: Mutex::new(None),
            forward: Arc::new(Forward(me.clone())),
        });
        Self { shared }
    }

    /// Change the projection and announce the result.
    ///
    /// `update` receives the projection, the inner data and a buffer for the
    /// changes it causes, valid in order against the view as it stands.
    pub fn update(&self, update: impl FnOnce(&mut P, &dyn Data<T>, &mut Vec<Change>)) {
        let mut out = Vec::new();
        update(
            &mut self.shared.projection.lock(),
            &*self.shared.inner,
            &mut out,
        );
        self.shared.publish(out);
    }

    /// Read the projection.
    pub fn with_projection<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        f(&self.shared.projection.lock())
    }
}

impl<T: 'static, P: Projection<T>> Data<T> for View<T, P> {
    fn size(&self) -> usize {
        if let Some(size) = *self.shared.published.lock() {
            return size;
        }
        self.shared.projection.lock().size(&*self.shared.inner)
    }

    fn try_get(&self, position: usize) -> Result<T> {
        let size = self.size();
        let inner_position = if position < size {
            self.shared
                .projection
                .lock()
                .inner_position(&*self.shared.inner, position)
        } else {
            None
        };
        match inner_position {
            Some(inner_position) => self.shared.inner.try_get(inner_position),
            None => Err(DataError::OutOfRange { position, size }),
        }
    }

    fn is_loading(&self) -> bool {
        self.shared.inner.is_loading()
    }

    fn available(&self) -> usize {
        self.shared.inner.available()
    }

    fn refresh(&self) {
        self.shared.inner.refresh();
    }

    fn reload(&self) {
        self.shared.inner.reload();
    }

    fn invalidate(&self) {
        self.shared.inner.invalidate();
    }

    fn observers(&self) -> &ObserverRegistry {
        &self.shared.observers
    }

    fn register_data_observer(&self, observer: Arc<dyn DataObserver>) {
        if !self.shared.observers.data.register(observer).is_first() {
            return;
        }
        {
            let mut projection = self.shared.projection.lock();
            projection.attach(&*self.shared.inner);
            *self.shared.published.lock() = Some(projection.size(&*self.shared.inner));
        }
        tracing::trace!("view observing its inner data");
        self.shared
            .inner
            .register_data_observer(self.shared.forward.clone());
    }

    fn unregister_data_observer(&self, observer: &Arc<dyn DataObserver>) {
        if !self.shared.observers.data.unregister(observer).is_last() {
            return;
        }
        self.shared
            .inner
            .unregister_data_observer(&self.shared.forward);
        self.shared.projection.lock().detach();
        *self.shared.published.lock() = None;
    }

    fn register_loading_observer(&self, observer: Arc<dyn LoadingObserver>) {
        self.shared.inner.register_loading_observer(observer);
    }

    fn unregister_loading_observer(&self, observer: &Arc<dyn LoadingObserver>) {
        self.shared.inner.unregister_loading_observer(observer);
    }

    fn register_available_observer(&self, observer: Arc<dyn AvailableObserver>) {
        self.shared.inner.register_available_observer(observer);
    }

    fn unregister_available_observer(&self, observer: &Arc<dyn AvailableObserver>) {
        self.shared.inner.unregister_available_observer(observer);
    }

    fn register_error_observer(&self, observer: Arc<dyn ErrorObserver>) {
        self.shared.inner.register_error_observer(observer);
    }

    fn unregister_error_observer(&self, observer: &Arc<dyn ErrorObserver>) {
        self.shared.inner.unregister_error_observer(observer);
    }
}

/// Append `change`, merging it into the previous change where the two touch.
fn push_merged(out: &mut Vec<Change>, change: Change) {
    if let Some(last) = out.last_mut() {
        if merge(last, &change) {
            return;
        }
    }
    out.push(change);
}

fn merge(last: &mut Change, next: &Change) -> bool {
    match (last, next) {
        (
            Change::Inserted { position, count },
            Change::Inserted {
                position: at,
                count: more,
            },
        ) if *position + *count == *at => *count += *more,
        (
            Change::Removed { position, count },
            Change::Removed {
                position: at,
                count: more,
            },
        ) if *position == *at => *count += *more,
        (
            Change::Changed {
                position,
                count,
                payload,
            },
            Change::Changed {
                position: at,
                count: more,
                payload: next_payload,
            },
        ) if *position + *count == *at && *payload == *next_payload => *count += *more,
        _ => return false,
    }
    true
}

// ── Window ──────────────────────────────────────────────────────────────

/// Skips the first `offset` inner elements and shows at most `limit` of the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    offset: usize,
    limit: usize,
}

/// A [`View`] through a [`Window`].
pub type WindowData<T> = View<T, Window>;

impl Window {
    /// A window starting at `offset` showing at most `limit` elements.
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Number of leading inner elements skipped.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Maximum number of elements shown. `usize::MAX` means unbounded.
    pub fn limit(&self) -> usize {
        self.limit
    }

    fn len(&self, inner_size: usize) -> usize {
        inner_size.saturating_sub(self.offset).min(self.limit)
    }

    /// Translate an inner change into the offset-only view, whose sizes are
    /// `before` and `after`.
    fn skip_offset(&self, change: &Change, before: usize, after: usize) -> Option<Change> {
        let offset = self.offset;
        match *change {
            Change::Inserted { position, .. } => Some(Change::inserted(
                position.saturating_sub(offset),
                after - before,
            )),
            Change::Removed { position, .. } => Some(Change::removed(
                position.saturating_sub(offset),
                before - after,
            )),
            Change::Changed {
                position,
                count,
                ref payload,
            } => {
                let start = position.max(offset);
                let end = position + count;
                (end > start).then(|| Change::Changed {
                    position: start - offset,
                    count: end - start,
                    payload: payload.clone(),
                })
            }
            Change::Moved { from, to, count } => {
                let low = from.min(to);
                let high = from.max(to) + count;
                if low >= offset {
                    Some(Change::moved(from - offset, to - offset, count))
                } else if high <= offset {
                    None
                } else {
                    // Elements shifted across the window edge.
                    Some(Change::changed(0, high - offset))
                }
            }
            Change::Reset => Some(Change::Reset),
        }
    }

    /// Clip a change of the offset-only view, sized `before` then `after`, to the limit.
    fn clip_limit(&self, change: Change, before: usize, after: usize, out: &mut Vec<Change>) {
        let limit = self.limit;
        let shown_before = before.min(limit);
        let shown_after = after.min(limit);
        match change {
            Change::Inserted { position, count } if position < limit => {
                let shown = count.min(limit - position);
                let pushed_out = shown_before + shown - shown_after;
                if pushed_out > 0 {
                    out.push(Change::removed(shown_before - pushed_out, pushed_out));
                }
                out.push(Change::inserted(position, shown));
            }
            Change::Removed { position, count } if position < limit => {
                let shown = count.min(shown_before - position);
                out.push(Change::removed(position, shown));
                let pulled_in = shown_after - (shown_before - shown);
                if pulled_in > 0 {
                    out.push(Change::inserted(shown_before - shown, pulled_in));
                }
            }
            Change::Changed {
                position,
                count,
                payload,
            } if position < limit => out.push(Change::Changed {
                position,
                count: count.min(limit - position),
                payload,
            }),
            Change::Moved { from, to, count } => {
                let low = from.min(to);
                let high = from.max(to) + count;
                if high <= limit {
                    out.push(Change::moved(from, to, count));
                } else if low < limit {
                    out.push(Change::changed(low, shown_before - low));
                }
            }
            Change::Reset => out.push(Change::Reset),
            _ => {}
        }
    }
}

impl<T> Projection<T> for Window {
    fn size(&self, inner: &dyn Data<T>) -> usize {
        self.len(inner.size())
    }

    fn inner_position(&self, _inner: &dyn Data<T>, position: usize) -> Option<usize> {
        self.offset.checked_add(position)
    }

    fn translate(&mut self, inner: &dyn Data<T>, change: &Change, out: &mut Vec<Change>) {
        let inner_after = inner.size();
        let inner_before = match *change {
            Change::Inserted { count, .. } => inner_after.saturating_sub(count),
            Change::Removed { count, .. } => inner_after + count,
            _ => inner_after,
        };
        let before = inner_before.saturating_sub(self.offset);
        let after = inner_after.saturating_sub(self.offset);
        if let Some(change) = self.skip_offset(change, before, after) {
            self.clip_limit(change, before, after, out);
        }
    }
}

impl<T: 'static> View<T, Window> {
    /// Number of leading inner elements skipped.
    pub fn offset(&self) -> usize {
        self.with_projection(Window::offset)
    }

    /// Maximum number of elements shown.
    pub fn limit(&self) -> usize {
        self.with_projection(Window::limit)
    }

    /// Skip `offset` inner elements instead.
    ///
    /// Announces the size difference at the tail, then `Changed` over the rest.
    pub fn set_offset(&self, offset: usize) {
        self.update(|window, inner, out| {
            if window.offset == offset {
                return;
            }
            let inner_size = inner.size();
            let before = window.len(inner_size);
            window.offset = offset;
            let after = window.len(inner_size);
            if after < before {
                out.push(Change::removed(after, before - after));
            } else if after > before {
                out.push(Change::inserted(before, after - before));
            }
            out.push(Change::changed(0, before.min(after)));
        });
    }

    /// Show at most `limit` elements instead.
    pub fn set_limit(&self, limit: usize) {
        self.update(|window, inner, out| {
            let inner_size = inner.size();
            let before = window.len(inner_size);
            window.limit = limit;
            let after = window.len(inner_size);
            if after < before {
                out.push(Change::removed(after, before - after));
            } else if after > before {
                out.push(Change::inserted(before, after - before));
            }
        });
    }
}

/// View `data` without its first `offset` elements.
pub fn offset<T: 'static, D: Data<T> + 'static>(data: Arc<D>, offset: usize) -> WindowData<T> {
    View::new(data, Window::new(offset, usize::MAX))
}

/// View at most the first `limit` elements of `data`.
pub fn limit<T: 'static, D: Data<T> + 'static>(data: Arc<D>, limit: usize) -> WindowData<T> {
    View::new(data, Window::new(0, limit))
}

// ── Filter ──────────────────────────────────────────────────────────────

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Shows the inner elements matching a predicate, in inner order.
///
/// While observed it keeps a sorted index of matching inner positions; while
/// unobserved every read scans the inner data.
pub struct Filter<T> {
    predicate: Predicate<T>,
    index: Option<Vec<usize>>,
}

/// A [`View`] through a [`Filter`].
pub type FilterData<T> = View<T, Filter<T>>;

impl<T> Filter<T> {
    /// A filter keeping elements for which `predicate` returns true.
    pub fn new(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Arc::new(predicate),
            index: None,
        }
    }

    fn matches(&self, inner: &dyn Data<T>, position: usize) -> bool {
        match inner.try_get(position) {
            Ok(item) => (self.predicate)(&item),
            Err(error) => {
                tracing::warn!(%error, "inner data changed without notifying; skipping element");
                false
            }
        }
    }

    fn scan(&self, inner: &dyn Data<T>) -> Vec<usize> {
        (0..inner.size())
            .filter(|&position| self.matches(inner, position))
            .collect()
    }
}

/// Drop the index entries for inner `position..position + count`, shifting the
/// rest down. Returns which of the removed inner positions were shown.
fn remove_rows(
    index: &mut Vec<usize>,
    position: usize,
    count: usize,
    out: &mut Vec<Change>,
) -> Vec<bool> {
    let start = index.partition_point(|&p| p < position);
    let end = index.partition_point(|&p| p < position + count);
    let shown = (position..position + count)
        .map(|p| index[start..end].binary_search(&p).is_ok())
        .collect();
    if end > start {
        index.drain(start..end);
        push_merged(out, Change::removed(start, end - start));
    }
    for p in &mut index[start..] {
        *p -= count;
    }
    shown
}

/// Make room for inner rows inserted at `position` and index the shown ones.
fn insert_rows(index: &mut Vec<usize>, position: usize, shown: &[bool], out: &mut Vec<Change>) {
    let start = index.partition_point(|&p| p < position);
    for p in &mut index[start..] {
        *p += shown.len();
    }
    let added: Vec<usize> = shown
        .iter()
        .enumerate()
        .filter(|&(_, &shown)| shown)
        .map(|(offset, _)| position + offset)
        .collect();
    if !added.is_empty() {
        let count = added.len();
        index.splice(start..start, added);
        push_merged(out, Change::inserted(start, count));
    }
}

impl<T: 'static> Projection<T> for Filter<T> {
    fn size(&self, inner: &dyn Data<T>) -> usize {
        match &self.index {
            Some(index) => index.len(),
            None => self.scan(inner).len(),
        }
    }

    fn inner_position(&self, inner: &dyn Data<T>, position: usize) -> Option<usize> {
        match &self.index {
            Some(index) => index.get(position).copied(),
            None => (0..inner.size())
                .filter(|&p| self.matches(inner, p))
                .nth(position),
        }
    }

    fn attach(&mut self, inner: &dyn Data<T>) {
        self.index = Some(self.scan(inner));
    }

    fn detach(&mut self) {
        self.index = None;
    }

    fn translate(&mut self, inner: &dyn Data<T>, change: &Change, out: &mut Vec<Change>) {
        let Some(mut index) = self.index.take() else {
            return;
        };
        match *change {
            Change::Inserted { position, count } => {
                let shown: Vec<bool> = (position..position + count)
                    .map(|p| self.matches(inner, p))
                    .collect();
                insert_rows(&mut index, position, &shown, out);
            }
            Change::Removed { position, count } => {
                remove_rows(&mut index, position, count, out);
            }
            Change::Moved { from, to, count } => {
                // The moved elements keep their match state.
                let shown = remove_rows(&mut index, from, count, out);
                insert_rows(&mut index, to, &shown, out);
            }
            Change::Changed {
                position,
                count,
                ref payload,
            } => {
                for p in position..position + count {
                    match (index.binary_search(&p), self.matches(inner, p)) {
                        (Ok(i), true) => push_merged(
                            out,
                            Change::Changed {
                                position: i,
                                count: 1,
                                payload: payload.clone(),
                            },
                        ),
                        (Ok(i), false) => {
                            index.remove(i);
                            push_merged(out, Change::removed(i, 1));
                        }
                        (Err(i), true) => {
                            index.insert(i, p);
                            push_merged(out, Change::inserted(i, 1));
                        }
                        (Err(_), false) => {}
                    }
                }
            }
            Change::Reset => {
                index = self.scan(inner);
                out.push(Change::Reset);
            }
        }
        self.index = Some(index);
    }
}

impl<T: 'static> View<T, Filter<T>> {
    /// Filter with `predicate` instead, announcing elements that appear or disappear.
    pub fn set_predicate(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) {
        self.update(|filter, inner, out| {
            filter.predicate = Arc::new(predicate);
            let Some(mut index) = filter.index.take() else {
                return;
            };
            for p in 0..inner.size() {
                match (index.binary_search(&p), filter.matches(inner, p)) {
                    (Ok(i), false) => {
                        index.remove(i);
                        push_merged(out, Change::removed(i, 1));
                    }
                    (Err(i), true) => {
                        index.insert(i, p);
                        push_merged(out, Change::inserted(i, 1));
                    }
                    _ => {}
                }
            }
            filter.index = Some(index);
        });
    }
}

/// View the elements of `data` for which `predicate` returns true.
pub fn filter<T, D, F>(data: Arc<D>, predicate: F) -> FilterData<T>
where
    T: 'static,
    D: Data<T> + 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    View::new(data, Filter::new(predicate))
}
