//! End-to-end scenarios: sources driven by producers, observed by recorders.
use crate::testing::RecordingObserver;
use crate::{
    AVAILABLE_UNKNOWN, Change, Data, DataObserver, DeliveryLoop, DiffComputation, DiffOracle,
    DiffStrategy, Edit, FineGrained, ItemMatcher, LoadType, ManualScheduler, ObservableData,
    Subject, producer,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// Fixture: an item with a stable identity and a presentable name
#[derive(Clone, Debug, PartialEq)]
struct Item {
    id: u32,
    name: &'static str,
}

fn item(id: u32, name: &'static str) -> Item {
    Item { id, name }
}

fn fine() -> FineGrained<Item> {
    FineGrained::with_content(|a: &Item, b: &Item| a.id == b.id, |a: &Item, b: &Item| {
        a.name == b.name
    })
}

/// A source fed by a hot subject, delivering on the test thread.
fn fed_by<T: Clone + Send + Sync + 'static>(
    strategy: DiffStrategy<T>,
) -> (Arc<ObservableData<T>>, Subject<Vec<T>>) {
    let subject = Subject::new();
    let feed = subject.clone();
    let data = ObservableData::builder()
        .contents(move |_| feed.clone())
        .diff_strategy(strategy)
        .build();
    (Arc::new(data), subject)
}

/// A thread id nobody drains on, so every post waits for an explicit flush.
fn foreign_thread() -> thread::ThreadId {
    thread::spawn(|| thread::current().id())
        .join()
        .expect("thread exits")
}

#[test]
fn coarse_snapshot_reports_tail_insert_then_overlap() {
    let (data, subject) = fed_by(DiffStrategy::Coarse);
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec!['a', 'b', 'c']);
    recorder.clear();

    subject.emit(vec!['a', 'x', 'y', 'z']);
    assert_eq!(
        recorder.changes(),
        vec![Change::inserted(3, 1), Change::changed(0, 3)]
    );
    assert_eq!(data.to_vec(), vec!['a', 'x', 'y', 'z']);
    recorder.assert_consistent();
}

#[test]
fn fine_snapshots_report_minimal_changes() {
    let (data, subject) = fed_by(DiffStrategy::Fine(fine()));
    let recorder = RecordingObserver::attach(&data);

    subject.emit(vec![item(1, "a"), item(2, "b")]);
    subject.emit(vec![item(1, "x"), item(2, "b"), item(3, "c")]);
    subject.emit(vec![item(2, "b"), item(1, "x"), item(3, "c")]);
    subject.emit(vec![item(3, "c")]);
    subject.emit(vec![]);

    assert_eq!(
        recorder.changes(),
        vec![
            Change::inserted(0, 2),
            Change::inserted(2, 1),
            Change::changed(0, 1),
            Change::moved(0, 1, 1),
            Change::removed(0, 2),
            Change::removed(0, 1),
        ]
    );
    recorder.assert_consistent();
}

#[test]
fn fine_overwrite_adopts_the_new_snapshot() {
    // Content ignores `name`, so the rename produces no notification but is still visible.
    let strategy = FineGrained::with_content(|a: &Item, b: &Item| a.id == b.id, |_, _| true);
    let (data, subject) = fed_by(DiffStrategy::Fine(strategy));
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![item(1, "a")]);
    subject.emit(vec![item(1, "renamed")]);

    assert_eq!(recorder.changes(), vec![Change::inserted(0, 1)]);
    assert_eq!(data.get(0).name, "renamed");
}

#[test]
fn disabled_move_detection_never_reports_moves() {
    let (data, subject) = fed_by(DiffStrategy::Fine(fine().detect_moves(false)));
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![item(1, "a"), item(2, "b")]);
    subject.emit(vec![item(2, "b"), item(1, "a")]);

    assert_eq!(
        recorder.changes(),
        vec![
            Change::inserted(0, 2),
            Change::inserted(2, 1),
            Change::removed(0, 1),
        ]
    );
    assert_eq!(data.to_vec(), vec![item(2, "b"), item(1, "a")]);
    recorder.assert_consistent();
}

#[test]
fn no_diff_strategy_resets_observers() {
    let (data, subject) = fed_by(DiffStrategy::None);
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![1, 2]);
    subject.emit(vec![3]);
    assert_eq!(recorder.changes(), vec![Change::inserted(0, 2), Change::Reset]);
    assert_eq!(data.to_vec(), vec![3]);
    recorder.assert_consistent();
}

#[test]
fn payload_reaches_changed_notifications() {
    let strategy = fine().change_payload(|_, new| Some(crate::Payload::new(new.name)));
    let (data, subject) = fed_by(DiffStrategy::Fine(strategy));
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![item(1, "a")]);
    subject.emit(vec![item(1, "b")]);

    let changes = recorder.changes();
    let Change::Changed { payload, .. } = &changes[1] else {
        panic!("expected a change, got {}", changes[1]);
    };
    let payload = payload.as_ref().expect("payload attached");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"b"));
}

#[test]
fn loading_settles_on_first_content() {
    for contents in [vec![], vec!['a']] {
        let data = Arc::new(
            ObservableData::builder()
                .contents(move |_| producer::just(contents.clone()))
                .build(),
        );
        let recorder = RecordingObserver::attach(&data);
        assert_eq!(recorder.loading(), vec![false, true, false]);
    }
}

#[test]
fn available_is_unknown_until_first_content() {
    let data = Arc::new(
        ObservableData::builder()
            .contents(|_| producer::just(vec!['a']))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    assert_eq!(recorder.available(), vec![AVAILABLE_UNKNOWN, 0]);
}

#[test]
fn first_content_announces_elements_before_side_channels() {
    let data = Arc::new(
        ObservableData::builder()
            .contents(|_| producer::just(vec!['a']))
            .build(),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    data.register_loading_observer(Arc::new(move |loading: bool| {
        log.lock().push(format!("loading {loading}"));
    }));
    let log = order.clone();
    data.register_available_observer(Arc::new(move |available: usize| {
        log.lock().push(format!("available {available}"));
    }));
    let log = order.clone();
    data.register_data_observer(Arc::new(move |change: &Change| {
        log.lock().push(change.to_string());
    }));

    assert_eq!(
        *order.lock(),
        vec!["loading true", "Inserted(0, 1)", "available 0", "loading false"]
    );
}

#[test]
fn explicit_side_channels_replace_inference() {
    let data = Arc::new(
        ObservableData::builder()
            .contents(|_| producer::just(vec!['a']))
            .loading(|_| producer::from_iter(vec![true, false, true]))
            .available(|_| producer::just(5))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    assert_eq!(recorder.loading(), vec![false, true, false, true]);
    assert_eq!(recorder.available(), vec![AVAILABLE_UNKNOWN, 5]);
}

#[test]
fn content_error_is_delivered_once_and_settles_loading() {
    let data = Arc::new(
        ObservableData::<char>::builder()
            .contents(|_| producer::fail("backend unavailable"))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    assert_eq!(recorder.loading(), vec![false, true, false]);
    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].to_string(), "backend unavailable");
}

#[test]
fn errors_after_teardown_are_not_delivered() {
    let (data, subject) = fed_by::<char>(DiffStrategy::Coarse);
    let recorder = RecordingObserver::attach(&data);
    recorder.set_observing(false);
    subject.error("late");
    assert!(recorder.errors().is_empty());
}

#[test]
fn queued_error_from_a_disposed_subscription_is_dropped() {
    cov_mark::check!(stale_error_discarded);
    let subject = Subject::<Vec<char>>::new();
    let feed = subject.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| feed.clone())
            .delivery_thread(foreign_thread())
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    subject.error("raced with teardown");
    recorder.set_observing(false);
    data.flush();
    assert!(recorder.errors().is_empty());
}

#[test]
fn queued_content_from_a_disposed_subscription_is_dropped() {
    cov_mark::check!(stale_content_discarded);
    let subject = Subject::new();
    let feed = subject.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| feed.clone())
            .delivery_thread(foreign_thread())
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![1, 2, 3]);
    recorder.set_observing(false);
    data.flush();
    assert_eq!(data.size(), 0);
}

#[test]
fn one_subscription_per_observed_lifetime() {
    let (data, subject) = fed_by::<u8>(DiffStrategy::Coarse);
    let first = RecordingObserver::attach(&data);
    let second = RecordingObserver::attach(&data);
    assert_eq!(subject.subscriber_count(), 1);

    first.set_observing(false);
    assert_eq!(subject.subscriber_count(), 1);
    second.set_observing(false);
    assert_eq!(subject.subscriber_count(), 0);
}

#[test]
fn refresh_and_reload_resubscribe_with_their_load_type() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let load_types = Arc::new(Mutex::new(Vec::new()));
    let data = {
        let subscriptions = subscriptions.clone();
        let load_types = load_types.clone();
        Arc::new(
            ObservableData::builder()
                .contents(move |load_type| {
                    subscriptions.fetch_add(1, Ordering::Relaxed);
                    load_types.lock().push(load_type);
                    producer::just(vec!["a"])
                })
                .build(),
        )
    };
    let recorder = RecordingObserver::attach(&data);
    assert_eq!(subscriptions.load(Ordering::Relaxed), 1);

    data.refresh();
    data.refresh();
    assert_eq!(subscriptions.load(Ordering::Relaxed), 3);

    data.reload();
    assert_eq!(
        *load_types.lock(),
        vec![
            LoadType::Implicit,
            LoadType::Refresh,
            LoadType::Refresh,
            LoadType::Reload
        ]
    );
    // Reload clears first; refresh keeps the elements.
    assert_eq!(
        recorder.elements(),
        vec![vec![], vec!["a"], vec!["a"], vec!["a"], vec![], vec!["a"]]
    );
    recorder.assert_consistent();
}

#[test]
fn invalidate_clears_on_the_next_observer() {
    let data = Arc::new(
        ObservableData::builder()
            .contents(|_| producer::just(vec!['a']))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    recorder.set_observing(false);
    data.invalidate();
    // Nothing happens until someone observes again.
    assert_eq!(data.to_vec(), vec!['a']);

    recorder.set_observing(true);
    assert_eq!(
        recorder.elements(),
        vec![vec![], vec!['a'], vec![], vec!['a']]
    );
    assert_eq!(
        recorder.available(),
        vec![AVAILABLE_UNKNOWN, 0, AVAILABLE_UNKNOWN, 0]
    );
    recorder.assert_consistent();
}

#[test]
fn prepends_and_appends_insert_at_the_edges() {
    let prepends = Subject::new();
    let appends = Subject::new();
    let data = {
        let prepends = prepends.clone();
        let appends = appends.clone();
        Arc::new(
            ObservableData::builder()
                .contents(|_| producer::just(vec!['b']))
                .prepends(move |_| prepends.clone())
                .appends(move |_| appends.clone())
                .build(),
        )
    };
    let recorder = RecordingObserver::attach(&data);
    prepends.emit(vec!['a']);
    appends.emit(vec!['c', 'd']);

    assert_eq!(
        recorder.changes(),
        vec![
            Change::inserted(0, 1),
            Change::inserted(0, 1),
            Change::inserted(2, 2)
        ]
    );
    assert_eq!(data.to_vec(), vec!['a', 'b', 'c', 'd']);
    recorder.assert_consistent();
}

#[test]
fn offloaded_diffs_apply_in_order_against_the_current_base() {
    let scheduler = Arc::new(ManualScheduler::new());
    let subject = Subject::new();
    let feed = subject.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| feed.clone())
            .diff_computation(DiffComputation::Asynchronous(scheduler.clone()))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);

    // Diffing against an empty list never needs the scheduler.
    subject.emit(vec!['a', 'b']);
    assert_eq!(scheduler.pending(), 0);

    subject.emit(vec!['a', 'b', 'c']);
    subject.emit(vec!['b', 'c', 'd']);
    assert_eq!(scheduler.pending(), 1, "one diff in flight at a time");
    assert_eq!(data.to_vec(), vec!['a', 'b']);

    assert_eq!(scheduler.run_pending(), 2);
    assert_eq!(data.to_vec(), vec!['b', 'c', 'd']);
    assert_eq!(
        recorder.changes(),
        vec![
            Change::inserted(0, 2),
            Change::inserted(2, 1),
            Change::changed(0, 2),
            Change::changed(0, 3),
        ]
    );
    recorder.assert_consistent();
}

#[test]
fn offloaded_diff_is_dropped_after_unsubscribe() {
    cov_mark::check!(stale_diff_discarded);
    let scheduler = Arc::new(ManualScheduler::new());
    let subject = Subject::new();
    let feed = subject.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| feed.clone())
            .diff_computation(DiffComputation::Asynchronous(scheduler.clone()))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![1]);
    subject.emit(vec![1, 2]);
    recorder.set_observing(false);

    scheduler.run_pending();
    assert_eq!(data.to_vec(), vec![1]);
}

#[test]
fn clear_requeues_the_snapshot_being_diffed() {
    let scheduler = Arc::new(ManualScheduler::new());
    let subject = Subject::new();
    let feed = subject.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| feed.clone())
            .diff_computation(DiffComputation::Asynchronous(scheduler.clone()))
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![1, 2]);
    subject.emit(vec![3, 4, 5]);
    data.clear();

    // The snapshot is re-applied against the now empty list.
    assert_eq!(data.to_vec(), vec![3, 4, 5]);
    assert_eq!(data.available(), 0);
    scheduler.run_pending();
    assert_eq!(data.to_vec(), vec![3, 4, 5]);
    recorder.assert_consistent();
}

#[test]
fn offloaded_refresh_settles_loading_after_the_diff_lands() {
    let scheduler = Arc::new(ManualScheduler::new());
    let contents = Arc::new(Mutex::new(vec![1]));
    let source = contents.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| producer::just(source.lock().clone()))
            .diff_computation(DiffComputation::Asynchronous(scheduler.clone()))
            .build(),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = order.clone();
    data.register_loading_observer(Arc::new(move |loading: bool| {
        log.lock().push(format!("loading {loading}"));
    }));
    let log = order.clone();
    data.register_available_observer(Arc::new(move |available: usize| {
        log.lock().push(if available == AVAILABLE_UNKNOWN {
            "available unknown".to_owned()
        } else {
            format!("available {available}")
        });
    }));
    let log = order.clone();
    data.register_data_observer(Arc::new(move |change: &Change| {
        log.lock().push(change.to_string());
    }));
    order.lock().clear();

    *contents.lock() = vec![1, 2];
    data.refresh();
    // The producer has completed but its snapshot is still being diffed.
    assert_eq!(*order.lock(), vec!["loading true", "available unknown"]);
    assert!(data.is_loading());
    assert_eq!(data.to_vec(), vec![1]);

    scheduler.run_pending();
    assert_eq!(
        *order.lock(),
        vec![
            "loading true",
            "available unknown",
            "Inserted(1, 1)",
            "Changed(0, 1)",
            "available 0",
            "loading false",
        ]
    );
    assert_eq!(data.to_vec(), vec![1, 2]);
}

// An oracle that forgets to emit anything
struct ForgetfulOracle;

impl DiffOracle<Item> for ForgetfulOracle {
    fn diff(
        &self,
        _old: &[Item],
        _new: &[Item],
        _matcher: &dyn ItemMatcher<Item>,
        _detect_moves: bool,
    ) -> Vec<Edit<Item>> {
        Vec::new()
    }
}

#[test]
fn inconsistent_oracle_falls_back_to_a_reset() {
    cov_mark::check!(diff_length_mismatch);
    let (data, subject) = fed_by(DiffStrategy::Fine(fine().oracle(ForgetfulOracle)));
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![item(1, "a")]);
    subject.emit(vec![item(1, "a"), item(2, "b")]);

    assert_eq!(recorder.changes().last(), Some(&Change::Reset));
    assert_eq!(data.size(), 2);
    recorder.assert_consistent();
}

#[test]
fn observer_leaving_during_subscribe_disposes_the_new_subscriptions() {
    cov_mark::check!(subscribe_superseded);
    let data = Arc::new(
        ObservableData::builder()
            .contents(|_| producer::just(vec![1]))
            .build(),
    );
    let slot: Arc<Mutex<Option<Arc<dyn DataObserver>>>> = Arc::default();
    let observer: Arc<dyn DataObserver> = {
        let slot = slot.clone();
        let data = Arc::downgrade(&data);
        Arc::new(move |_: &Change| {
            let me = slot.lock().take();
            if let (Some(data), Some(me)) = (data.upgrade(), me) {
                data.unregister_data_observer(&me);
            }
        })
    };
    *slot.lock() = Some(observer.clone());
    data.register_data_observer(observer);

    assert!(data.observers().data.is_empty());
    assert_eq!(data.to_vec(), vec![1]);
}

#[test]
fn foreign_emissions_wake_once_per_batch() {
    let wakes = Arc::new(AtomicUsize::new(0));
    let subject = Subject::new();
    let feed = subject.clone();
    let data = {
        let wakes = wakes.clone();
        Arc::new(
            ObservableData::builder()
                .contents(move |_| feed.clone())
                .waker(Arc::new(move || {
                    wakes.fetch_add(1, Ordering::Relaxed);
                }))
                .build(),
        )
    };
    let recorder = RecordingObserver::attach(&data);

    let emitter = subject.clone();
    thread::spawn(move || {
        emitter.emit(vec!["a"]);
        emitter.emit(vec!["a", "b"]);
    })
    .join()
    .expect("emitting thread");

    assert_eq!(wakes.load(Ordering::Relaxed), 1);
    assert_eq!(data.pending_messages(), 2);
    assert_eq!(data.size(), 0);
    assert_eq!(data.flush(), 2);
    assert_eq!(data.to_vec(), vec!["a", "b"]);
    recorder.assert_consistent();
}

#[test]
fn delivery_loop_flushes_attached_sources() {
    let delivery = DeliveryLoop::new()
        .debounce(Duration::from_millis(1))
        .max_debounce(Duration::from_millis(5))
        .spawn();
    let subject = Subject::new();
    let feed = subject.clone();
    let data = Arc::new(
        ObservableData::builder()
            .contents(move |_| feed.clone())
            .delivery_loop(&delivery)
            .build(),
    );
    let recorder = RecordingObserver::attach(&data);
    subject.emit(vec![1, 2, 3]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while data.size() < 3 {
        assert!(Instant::now() < deadline, "delivery loop never flushed");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(data.to_vec(), vec![1, 2, 3]);
    assert_eq!(data.available(), 0);
    recorder.assert_consistent();
}
