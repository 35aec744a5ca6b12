//! Ready-made data sources: loader-backed, fixed, and derived.

use std::sync::Arc;

use crate::data::{Data, LoadType};
use crate::diff::DiffStrategy;
use crate::error::{DataError, Result, SourceError};
use crate::observer::{
    AvailableObserver, DataObserver, ErrorObserver, LoadingObserver, ObserverRegistry,
};
use crate::producer::{self, Emitter, Subscription};
use crate::source::{ObservableData, ObservableDataBuilder};
use crate::worker::{Scheduler, shared_worker};

/// Data filled by running `loader` on the shared worker.
///
/// Each subscription calls the loader once. A successful result replaces the
/// contents wholesale; a failure is reported to error observers and the
/// current elements are kept.
pub fn from_list<T, F>(loader: F) -> ObservableData<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(LoadType) -> std::result::Result<Vec<T>, SourceError> + Send + Sync + 'static,
{
    from_list_on(shared_worker(), loader).build()
}

/// Like [`from_list`], running the loader on `scheduler` and returning the
/// builder for further configuration.
pub fn from_list_on<T, F>(scheduler: Arc<dyn Scheduler>, loader: F) -> ObservableDataBuilder<T>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(LoadType) -> std::result::Result<Vec<T>, SourceError> + Send + Sync + 'static,
{
    let loader = Arc::new(loader);
    ObservableData::builder()
        .diff_strategy(DiffStrategy::Coarse)
        .contents(move |load_type| {
            let loader = loader.clone();
            let load = producer::from_fn(move |emitter: Emitter<Vec<T>>| {
                tracing::debug!(?load_type, "running list loader");
                match loader(load_type) {
                    Ok(items) => {
                        emitter.next(items);
                        emitter.complete();
                    }
                    Err(error) => emitter.error_shared(error),
                }
                Subscription::empty()
            });
            producer::on_scheduler(scheduler.clone(), load)
        })
}

/// Data that never changes.
pub struct ImmutableData<T> {
    items: Vec<T>,
    observers: ObserverRegistry,
}

impl<T> ImmutableData<T> {
    /// Data holding `items` forever.
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            observers: ObserverRegistry::new(),
        }
    }
}

impl<T: Clone + Send + Sync> Data<T> for ImmutableData<T> {
    fn size(&self) -> usize {
        self.items.len()
    }

    fn try_get(&self, position: usize) -> Result<T> {
        self.items
            .get(position)
            .cloned()
            .ok_or(DataError::OutOfRange {
                position,
                size: self.items.len(),
            })
    }

    fn is_loading(&self) -> bool {
        false
    }

    fn available(&self) -> usize {
        0
    }

    fn refresh(&self) {}

    fn reload(&self) {}

    fn invalidate(&self) {}

    fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    fn to_vec(&self) -> Vec<T> {
        self.items.clone()
    }
}

/// A view of another data with every element passed through a function.
///
/// Observers are registered directly on the inner data, so its lifecycle is
/// driven by observers of the view. See [`map`].
pub struct MappedData<T, U> {
    inner: Arc<dyn Data<T>>,
    f: Arc<dyn Fn(T) -> U + Send + Sync>,
}

impl<T, U> Clone for MappedData<T, U> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            f: self.f.clone(),
        }
    }
}

/// View `data` through `f`.
pub fn map<T, U, D, F>(data: Arc<D>, f: F) -> MappedData<T, U>
where
    T: 'static,
    D: Data<T> + 'static,
    F: Fn(T) -> U + Send + Sync + 'static,
{
    MappedData {
        inner: data,
        f: Arc::new(f),
    }
}

impl<T, U> Data<U> for MappedData<T, U> {
    fn size(&self) -> usize {
        self.inner.size()
    }

    fn try_get(&self, position: usize) -> Result<U> {
        self.inner.try_get(position).map(&*self.f)
    }

    fn is_loading(&self) -> bool {
        self.inner.is_loading()
    }

    fn available(&self) -> usize {
        self.inner.available()
    }

    fn refresh(&self) {
        self.inner.refresh();
    }

    fn reload(&self) {
        self.inner.reload();
    }

    fn invalidate(&self) {
        self.inner.invalidate();
    }

    fn observers(&self) -> &ObserverRegistry {
        self.inner.observers()
    }

    fn register_data_observer(&self, observer: Arc<dyn DataObserver>) {
        self.inner.register_data_observer(observer);
    }

    fn unregister_data_observer(&self, observer: &Arc<dyn DataObserver>) {
        self.inner.unregister_data_observer(observer);
    }

    fn register_loading_observer(&self, observer: Arc<dyn LoadingObserver>) {
        self.inner.register_loading_observer(observer);
    }

    fn unregister_loading_observer(&self, observer: &Arc<dyn LoadingObserver>) {
        self.inner.unregister_loading_observer(observer);
    }

    fn register_available_observer(&self, observer: Arc<dyn AvailableObserver>) {
        self.inner.register_available_observer(observer);
    }

    fn unregister_available_observer(&self, observer: &Arc<dyn AvailableObserver>) {
        self.inner.unregister_available_observer(observer);
    }

    fn register_error_observer(&self, observer: Arc<dyn ErrorObserver>) {
        self.inner.register_error_observer(observer);
    }

    fn unregister_error_observer(&self, observer: &Arc<dyn ErrorObserver>) {
        self.inner.unregister_error_observer(observer);
    }

    fn to_vec(&self) -> Vec<U> {
        self.inner.to_vec().into_iter().map(&*self.f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Change;
    use crate::data::AVAILABLE_UNKNOWN;
    use crate::error::source_error;
    use crate::list::ListData;
    use crate::testing::RecordingObserver;
    use crate::worker::ManualScheduler;
    use parking_lot::Mutex;

    #[test]
    fn list_loader_runs_on_the_scheduler() {
        let scheduler = Arc::new(ManualScheduler::new());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let log = calls.clone();
        let data = Arc::new(
            from_list_on(scheduler.clone(), move |load_type| {
                log.lock().push(load_type);
                Ok(vec![1, 2, 3])
            })
            .build(),
        );
        let recorder = RecordingObserver::attach(&data);
        assert_eq!(data.size(), 0);
        assert_eq!(scheduler.run_pending(), 1);

        assert_eq!(data.to_vec(), vec![1, 2, 3]);
        assert_eq!(recorder.loading(), vec![false, true, false]);
        assert_eq!(recorder.available(), vec![AVAILABLE_UNKNOWN, 0]);
        assert_eq!(recorder.changes(), vec![Change::inserted(0, 3)]);

        data.refresh();
        scheduler.run_pending();
        assert_eq!(*calls.lock(), vec![LoadType::Implicit, LoadType::Refresh]);
        recorder.assert_consistent();
    }

    #[test]
    fn list_loader_failure_is_reported() {
        let scheduler = Arc::new(ManualScheduler::new());
        let data = Arc::new(
            from_list_on::<u8, _>(scheduler.clone(), |_| Err(source_error("timeout"))).build(),
        );
        let recorder = RecordingObserver::attach(&data);
        scheduler.run_pending();
        assert_eq!(recorder.loading(), vec![false, true, false]);
        assert_eq!(recorder.errors().len(), 1);
        assert!(data.to_vec().is_empty());
    }

    #[test]
    fn immutable_data_is_settled() {
        let data = Arc::new(ImmutableData::new(vec!['x', 'y']));
        let recorder = RecordingObserver::attach(&data);
        data.refresh();
        data.reload();
        data.invalidate();
        assert_eq!(data.get(1), 'y');
        assert!(data.try_get(2).is_err());
        assert_eq!(recorder.loading(), vec![false]);
        assert_eq!(recorder.available(), vec![0]);
        assert!(recorder.changes().is_empty());
    }

    #[test]
    fn mapped_data_forwards_to_the_inner_data() {
        let list = Arc::new(ListData::from_vec(vec![1, 2]));
        let mapped = Arc::new(map(list.clone(), |n: i32| n * 10));
        let recorder = RecordingObserver::attach(&mapped);
        list.push(3);
        list.set_loading(true);
        assert_eq!(mapped.to_vec(), vec![10, 20, 30]);
        assert_eq!(recorder.changes(), vec![Change::inserted(2, 1)]);
        assert_eq!(recorder.elements().last(), Some(&vec![10, 20, 30]));
        assert_eq!(recorder.loading(), vec![false, true]);
        assert_eq!(list.observers().data.len(), 1);
        recorder.set_observing(false);
        assert!(list.observers().data.is_empty());
    }
}
