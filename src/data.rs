//! The read and observe interface shared by every data implementation.

use std::sync::Arc;

use crate::error::Result;
use crate::observer::{
    AvailableObserver, DataObserver, ErrorObserver, LoadingObserver, ObserverRegistry,
    Registration, Unregistration,
};

/// Available count reported before anything is known about the remaining elements.
pub const AVAILABLE_UNKNOWN: usize = usize::MAX;

/// Why a subscription was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadType {
    /// The first structural observer arrived.
    Implicit,
    /// [`Data::refresh`] was called; existing elements are kept.
    Refresh,
    /// [`Data::reload`] was called; existing elements were cleared first.
    Reload,
}

/// An ordered, observable collection of elements.
///
/// Implementations own an [`ObserverRegistry`] and announce every structural
/// change through it. Between two notifications [`size`](Data::size) equals the
/// size an observer computes by applying every notification it has received.
///
/// Registering the first structural observer and unregistering the last one are
/// reported to the implementation through
/// [`on_data_observer_added`](Data::on_data_observer_added) and
/// [`on_data_observer_removed`](Data::on_data_observer_removed), which is where
/// asynchronous sources start and stop their subscriptions.
pub trait Data<T>: Send + Sync {
    /// Number of elements currently materialized.
    fn size(&self) -> usize;

    /// The element at `position`.
    fn try_get(&self, position: usize) -> Result<T>;

    /// The element at `position`.
    ///
    /// # Panics
    ///
    /// Panics if `position >= size()`.
    fn get(&self, position: usize) -> T {
        match self.try_get(position) {
            Ok(element) => element,
            Err(error) => panic!("Data::get: {error}"),
        }
    }

    /// Whether more elements are currently being fetched.
    fn is_loading(&self) -> bool;

    /// How many more elements could be loaded, or [`AVAILABLE_UNKNOWN`].
    fn available(&self) -> usize;

    /// Re-fetch the contents, keeping the current elements until new ones arrive.
    fn refresh(&self);

    /// Clear the contents and fetch them again.
    fn reload(&self);

    /// Mark the contents stale. They are cleared and re-fetched the next time a
    /// structural observer arrives.
    fn invalidate(&self);

    /// The observer sets of this data.
    fn observers(&self) -> &ObserverRegistry;

    /// Called after a structural observer was added.
    fn on_data_observer_added(&self) {}

    /// Called after a structural observer was removed.
    fn on_data_observer_removed(&self) {}

    /// Register a structural observer.
    fn register_data_observer(&self, observer: Arc<dyn DataObserver>) {
        if let Registration::Added { .. } = self.observers().data.register(observer) {
            self.on_data_observer_added();
        }
    }

    /// Unregister a structural observer. Unknown observers are ignored.
    fn unregister_data_observer(&self, observer: &Arc<dyn DataObserver>) {
        if let Unregistration::Removed { .. } = self.observers().data.unregister(observer) {
            self.on_data_observer_removed();
        }
    }

    /// Register a loading observer.
    fn register_loading_observer(&self, observer: Arc<dyn LoadingObserver>) {
        self.observers().loading.register(observer);
    }

    /// Unregister a loading observer. Unknown observers are ignored.
    fn unregister_loading_observer(&self, observer: &Arc<dyn LoadingObserver>) {
        self.observers().loading.unregister(observer);
    }

    /// Register an available-count observer.
    fn register_available_observer(&self, observer: Arc<dyn AvailableObserver>) {
        self.observers().available.register(observer);
    }

    /// Unregister an available-count observer. Unknown observers are ignored.
    fn unregister_available_observer(&self, observer: &Arc<dyn AvailableObserver>) {
        self.observers().available.unregister(observer);
    }

    /// Register an error observer.
    fn register_error_observer(&self, observer: Arc<dyn ErrorObserver>) {
        self.observers().error.register(observer);
    }

    /// Unregister an error observer. Unknown observers are ignored.
    fn unregister_error_observer(&self, observer: &Arc<dyn ErrorObserver>) {
        self.observers().error.unregister(observer);
    }

    /// Copy every element out. Elements that disappear concurrently are skipped.
    fn to_vec(&self) -> Vec<T> {
        (0..self.size())
            .map_while(|position| self.try_get(position).ok())
            .collect()
    }
}
