//! In-memory data backed by a [`NotifyingList`].

use std::ops::Deref;

use parking_lot::Mutex;

use crate::data::Data;
use crate::error::{Result, SourceError};
use crate::notifying::NotifyingList;
use crate::observer::ObserverRegistry;

struct SideChannels {
    loading: bool,
    available: usize,
}

/// A [`Data`] whose elements are edited directly.
///
/// Every [`NotifyingList`] operation is available through `Deref`. Loading and
/// available state are plain settable values that notify only on change, and
/// errors can be injected, which makes `ListData` a convenient stand-in for a
/// remote source in tests.
///
/// `refresh`, `reload` and `invalidate` do nothing: there is nothing to fetch.
pub struct ListData<T> {
    list: NotifyingList<T>,
    side: Mutex<SideChannels>,
}

impl<T> Default for ListData<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ListData<T> {
    /// Empty data, not loading, with nothing available.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// Data holding `items`.
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            list: NotifyingList::from_vec(items),
            side: Mutex::new(SideChannels {
                loading: false,
                available: 0,
            }),
        }
    }

    /// Set the loading flag, notifying if it changed.
    pub fn set_loading(&self, loading: bool) {
        let changed = {
            let mut side = self.side.lock();
            std::mem::replace(&mut side.loading, loading) != loading
        };
        if changed {
            self.list.observers().notify_loading(loading);
        }
    }

    /// Set the available count, notifying if it changed.
    pub fn set_available(&self, available: usize) {
        let changed = {
            let mut side = self.side.lock();
            std::mem::replace(&mut side.available, available) != available
        };
        if changed {
            self.list.observers().notify_available(available);
        }
    }

    /// Deliver `error` to the error observers.
    pub fn error(&self, error: SourceError) {
        self.list.observers().notify_error(&error);
    }
}

impl<T> Deref for ListData<T> {
    type Target = NotifyingList<T>;

    fn deref(&self) -> &NotifyingList<T> {
        &self.list
    }
}

impl<T: Clone + Send + Sync> Data<T> for ListData<T> {
    fn size(&self) -> usize {
        self.list.len()
    }

    fn try_get(&self, position: usize) -> Result<T> {
        self.list.get(position)
    }

    fn is_loading(&self) -> bool {
        self.side.lock().loading
    }

    fn available(&self) -> usize {
        self.side.lock().available
    }

    fn refresh(&self) {}

    fn reload(&self) {}

    fn invalidate(&self) {}

    fn observers(&self) -> &ObserverRegistry {
        self.list.observers()
    }

    fn to_vec(&self) -> Vec<T> {
        self.list.to_vec()
    }
}
