//! Test support.
//!
//! [`RecordingObserver`] listens on all four channels of a [`Data`] and keeps a
//! log of everything it saw. After every structural notification it applies the
//! change to a shadow size and compares it with `size()`; mismatches are kept as
//! violations and reported by [`assert_consistent`](RecordingObserver::assert_consistent).
//!
//! ```ignore
//! let recorder = RecordingObserver::attach(&data);
//! data.flush();
//! assert_eq!(recorder.loading(), vec![false, true, false]);
//! recorder.assert_consistent();
//! ```

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::change::Change;
use crate::data::Data;
use crate::error::SourceError;
use crate::observer::{AvailableObserver, DataObserver, ErrorObserver, LoadingObserver};

struct Log<T> {
    shadow: usize,
    changes: Vec<Change>,
    loading: Vec<bool>,
    available: Vec<usize>,
    errors: Vec<SourceError>,
    elements: Vec<Vec<T>>,
    violations: Vec<String>,
}

/// Records every notification of one data instance.
pub struct RecordingObserver<T> {
    me: Weak<RecordingObserver<T>>,
    data: Option<Weak<dyn Data<T>>>,
    log: Mutex<Log<T>>,
    observing: Mutex<bool>,
}

impl<T: Clone + Send + Sync + 'static> RecordingObserver<T> {
    /// Record the current state of `data`, then register on all four channels.
    ///
    /// The structural observer is registered last, so a subscription it starts
    /// is recorded from its first side-channel transition.
    pub fn attach<D: Data<T> + 'static>(data: &Arc<D>) -> Arc<Self> {
        let weak: Weak<dyn Data<T>> = Arc::downgrade(data) as Weak<D>;
        let recorder = Arc::new_cyclic(|me| RecordingObserver {
            me: me.clone(),
            data: Some(weak),
            log: Mutex::new(Log {
                shadow: data.size(),
                changes: Vec::new(),
                loading: vec![data.is_loading()],
                available: vec![data.available()],
                errors: Vec::new(),
                elements: vec![data.to_vec()],
                violations: Vec::new(),
            }),
            observing: Mutex::new(false),
        });
        data.register_loading_observer(recorder.clone());
        data.register_available_observer(recorder.clone());
        data.register_error_observer(recorder.clone());
        recorder.set_observing(true);
        recorder
    }

    /// A recorder not bound to any data. It logs changes but checks nothing.
    pub fn detached(initial_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|me| RecordingObserver {
            me: me.clone(),
            data: None,
            log: Mutex::new(Log {
                shadow: initial_size,
                changes: Vec::new(),
                loading: Vec::new(),
                available: Vec::new(),
                errors: Vec::new(),
                elements: Vec::new(),
                violations: Vec::new(),
            }),
            observing: Mutex::new(false),
        })
    }

    fn data(&self) -> Option<Arc<dyn Data<T>>> {
        self.data.as_ref().and_then(Weak::upgrade)
    }

    /// Register or unregister the structural observer.
    ///
    /// Re-registering resynchronises the shadow size, as a consumer that
    /// rebinds would.
    pub fn set_observing(&self, observing: bool) {
        let (Some(data), Some(me)) = (self.data(), self.me.upgrade()) else {
            return;
        };
        {
            let mut current = self.observing.lock();
            if *current == observing {
                return;
            }
            *current = observing;
        }
        let observer: Arc<dyn DataObserver> = me;
        if observing {
            self.log.lock().shadow = data.size();
            data.register_data_observer(observer);
        } else {
            data.unregister_data_observer(&observer);
        }
    }

    /// Structural changes, in delivery order.
    pub fn changes(&self) -> Vec<Change> {
        self.log.lock().changes.clone()
    }

    /// Loading values: the value at attach time, then every transition.
    pub fn loading(&self) -> Vec<bool> {
        self.log.lock().loading.clone()
    }

    /// Available counts: the value at attach time, then every transition.
    pub fn available(&self) -> Vec<usize> {
        self.log.lock().available.clone()
    }

    /// Delivered errors.
    pub fn errors(&self) -> Vec<SourceError> {
        self.log.lock().errors.clone()
    }

    /// Element snapshots: the contents at attach time, then after every change.
    pub fn elements(&self) -> Vec<Vec<T>> {
        self.log.lock().elements.clone()
    }

    /// Forget the recorded history, keeping the shadow size.
    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.changes.clear();
        log.loading.clear();
        log.available.clear();
        log.errors.clear();
        log.elements.clear();
    }

    /// Panic if any notification left the shadow size out of step with `size()`.
    #[track_caller]
    pub fn assert_consistent(&self) {
        let log = self.log.lock();
        assert!(
            log.violations.is_empty(),
            "size consistency violated:\n{}",
            log.violations.join("\n")
        );
    }
}

impl<T: Clone + Send + Sync + 'static> DataObserver for RecordingObserver<T> {
    fn on_change(&self, change: &Change) {
        let current = self.data().map(|data| (data.size(), data.to_vec()));
        let mut log = self.log.lock();
        let actual = current.as_ref().map_or(log.shadow, |(size, _)| *size);
        let shadow = change.apply_to_size(log.shadow, actual);
        if current.is_some() && shadow != actual {
            let violation =
                format!("after {change}: shadow size {shadow} but data reports {actual}");
            tracing::error!("{violation}");
            log.violations.push(violation);
        }
        // Resynchronise so one violation does not cascade.
        log.shadow = if current.is_some() { actual } else { shadow };
        log.changes.push(change.clone());
        if let Some((_, elements)) = current {
            log.elements.push(elements);
        }
    }
}

impl<T: Send + Sync> LoadingObserver for RecordingObserver<T> {
    fn on_loading_change(&self, loading: bool) {
        self.log.lock().loading.push(loading);
    }
}

impl<T: Send + Sync> AvailableObserver for RecordingObserver<T> {
    fn on_available_change(&self, available: usize) {
        self.log.lock().available.push(available);
    }
}

impl<T: Send + Sync> ErrorObserver for RecordingObserver<T> {
    fn on_error(&self, error: &SourceError) {
        self.log.lock().errors.push(error.clone());
    }
}
