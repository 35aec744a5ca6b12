//! Observer traits and the four-channel observer registry.
//!
//! Every [`Data`](crate::Data) owns one [`ObserverRegistry`]: an aggregate of four
//! independent multicast sets, one per observer kind. Each kind has its own narrow
//! trait so a consumer only implements what it listens to:
//!
//! - [`DataObserver`] - structural changes ([`Change`])
//! - [`LoadingObserver`] - the loading flag
//! - [`AvailableObserver`] - the remaining-available count
//! - [`ErrorObserver`] - producer errors
//!
//! Closures implement the traits directly:
//!
//! ```ignore
//! let observer: Arc<dyn DataObserver> = Arc::new(|change: &Change| println!("{change}"));
//! data.register_data_observer(observer.clone());
//! ```
//!
//! ## Re-entrancy
//!
//! Notifying takes a snapshot of the set and releases the lock before calling
//! out, so observers may read the data, or register and unregister observers,
//! from inside a callback. Membership changes apply from the next notification.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::SourceError;
use crate::change::Change;
use crate::hash::{FastHashBuilder, address_of};

/// Receives structural change notifications.
pub trait DataObserver: Send + Sync {
    /// Called after the change has been applied to the data.
    fn on_change(&self, change: &Change);
}

/// Receives loading-state transitions.
pub trait LoadingObserver: Send + Sync {
    /// Called when the loading flag flips.
    fn on_loading_change(&self, loading: bool);
}

/// Receives available-count transitions.
pub trait AvailableObserver: Send + Sync {
    /// Called when the available count changes.
    fn on_available_change(&self, available: usize);
}

/// Receives producer errors.
pub trait ErrorObserver: Send + Sync {
    /// Called for every error raised by an active subscription.
    fn on_error(&self, error: &SourceError);
}

impl<F> DataObserver for F
where
    F: Fn(&Change) + Send + Sync,
{
    fn on_change(&self, change: &Change) {
        self(change)
    }
}

impl<F> LoadingObserver for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_loading_change(&self, loading: bool) {
        self(loading)
    }
}

impl<F> AvailableObserver for F
where
    F: Fn(usize) + Send + Sync,
{
    fn on_available_change(&self, available: usize) {
        self(available)
    }
}

impl<F> ErrorObserver for F
where
    F: Fn(&SourceError) + Send + Sync,
{
    fn on_error(&self, error: &SourceError) {
        self(error)
    }
}

/// Outcome of a registration request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The observer was added; the set now holds `count` observers.
    Added {
        /// Number of observers after the registration.
        count: usize,
    },
    /// The observer was already present and nothing changed.
    AlreadyRegistered,
}

impl Registration {
    /// Whether this registration took the set from empty to one observer.
    pub fn is_first(self) -> bool {
        matches!(self, Registration::Added { count: 1 })
    }
}

/// Outcome of an unregistration request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unregistration {
    /// The observer was removed; `remaining` observers are left.
    Removed {
        /// Number of observers after the removal.
        remaining: usize,
    },
    /// The observer was not registered and nothing changed.
    NotRegistered,
}

impl Unregistration {
    /// Whether this removal emptied the set.
    pub fn is_last(self) -> bool {
        matches!(self, Unregistration::Removed { remaining: 0 })
    }
}

/// A multicast set of observers of one kind.
///
/// Observers are identified by the allocation behind their `Arc`, so registering
/// the same `Arc` twice is a no-op and unregistering needs the same `Arc` (or a
/// clone of it).
pub struct ObserverSet<O: ?Sized> {
    observers: RwLock<IndexMap<usize, Arc<O>, FastHashBuilder>>,
}

impl<O: ?Sized> Default for ObserverSet<O> {
    fn default() -> Self {
        Self {
            observers: RwLock::new(IndexMap::with_hasher(FastHashBuilder)),
        }
    }
}

impl<O: ?Sized> ObserverSet<O> {
    /// Add an observer.
    pub fn register(&self, observer: Arc<O>) -> Registration {
        let key = address_of(Arc::as_ptr(&observer));
        let mut observers = self.observers.write();
        if observers.contains_key(&key) {
            tracing::debug!(key, "observer already registered");
            return Registration::AlreadyRegistered;
        }
        observers.insert(key, observer);
        Registration::Added {
            count: observers.len(),
        }
    }

    /// Remove an observer. Removing one that is not registered is a no-op.
    pub fn unregister(&self, observer: &Arc<O>) -> Unregistration {
        let key = address_of(Arc::as_ptr(observer));
        let mut observers = self.observers.write();
        match observers.shift_remove(&key) {
            Some(_) => Unregistration::Removed {
                remaining: observers.len(),
            },
            None => {
                tracing::debug!(key, "unregistering an observer that is not registered");
                Unregistration::NotRegistered
            }
        }
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    /// Whether no observers are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call `f` for each observer registered at the time of the call.
    ///
    /// The lock is released before the first call.
    pub fn for_each(&self, mut f: impl FnMut(&O)) {
        let snapshot: Vec<Arc<O>> = self.observers.read().values().cloned().collect();
        for observer in &snapshot {
            f(observer);
        }
    }
}

/// The four observer sets of one data instance.
#[derive(Default)]
pub struct ObserverRegistry {
    /// Structural observers.
    pub data: ObserverSet<dyn DataObserver>,
    /// Loading observers.
    pub loading: ObserverSet<dyn LoadingObserver>,
    /// Available-count observers.
    pub available: ObserverSet<dyn AvailableObserver>,
    /// Error observers.
    pub error: ObserverSet<dyn ErrorObserver>,
}

impl ObserverRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch a structural change. Changes touching zero elements are dropped.
    pub fn notify_change(&self, change: &Change) {
        if change.is_empty() {
            return;
        }
        tracing::trace!(%change, observers = self.data.len(), "dispatching change");
        self.data.for_each(|observer| observer.on_change(change));
    }

    /// Dispatch a loading transition.
    pub fn notify_loading(&self, loading: bool) {
        self.loading
            .for_each(|observer| observer.on_loading_change(loading));
    }

    /// Dispatch an available-count transition.
    pub fn notify_available(&self, available: usize) {
        self.available
            .for_each(|observer| observer.on_available_change(available));
    }

    /// Dispatch an error. Without error observers the error is dropped.
    pub fn notify_error(&self, error: &SourceError) {
        if self.error.is_empty() {
            tracing::debug!(%error, "error dropped: no error observers");
            return;
        }
        self.error.for_each(|observer| observer.on_error(error));
    }
}
