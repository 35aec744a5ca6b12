#![deny(missing_docs)]

//! Observable ordered data with precise change notifications.
//!
//! A [`Data`] is an ordered collection that tells its observers exactly what
//! changed: which range was inserted, removed, moved or modified. Observers can
//! therefore keep a view in step with the data without re-reading all of it.
//! Besides structural changes every data exposes three side channels: whether
//! it is loading, how many more elements are available, and errors.
//!
//! # Quick Start
//!
//! ```ignore
//! use datafeed::{Data, DiffStrategy, FineGrained, ObservableData, producer};
//!
//! let contacts = ObservableData::builder()
//!     .contents(|_load_type| producer::just(fetch_contacts()))
//!     .diff_strategy(DiffStrategy::Fine(FineGrained::new(|a: &Contact, b: &Contact| {
//!         a.id == b.id
//!     })))
//!     .build();
//!
//! // Subscribes to the producer: the first structural observer starts loading.
//! contacts.register_data_observer(Arc::new(|change: &Change| view.apply(change)));
//! ```
//!
//! # Core Types
//!
//! - [`ObservableData`] - Materializes snapshots from [`Producer`]s, diffing
//!   each one against the current elements.
//! - [`NotifyingList`] and [`ListData`] - Vec-like lists that announce every
//!   mutation.
//! - [`CursorData`] - Rows of a [`Cursor`], reloaded when the cursor reports a
//!   change.
//! - [`ImmutableData`], [`MappedData`] and [`from_list`] - Fixed, derived and
//!   loader-backed data.
//! - [`PagedData`] - Elements appended a page at a time as rows are presented.
//! - [`views`] - Offset, limit and filter views that re-map another data's
//!   changes to their own positions.
//!
//! # Lifecycle
//!
//! Sources subscribe while they have at least one structural observer. The
//! last observer leaving unsubscribes them; stale results from the old
//! subscription are dropped.
//!
//! ```ignore
//! data.refresh();     // re-fetch, keeping elements until the new ones arrive
//! data.reload();      // clear, then re-fetch
//! data.invalidate();  // clear and re-fetch on the next observer
//! ```
//!
//! # Delivery
//!
//! Producer emissions are handled on one delivery thread per source, by
//! default the thread that built it. Emissions from other threads are queued
//! and picked up by [`ObservableData::flush`], or automatically by a
//! [`DeliveryLoop`]:
//!
//! ```ignore
//! let delivery = DeliveryLoop::new().debounce(Duration::from_millis(2)).spawn();
//! let data = ObservableData::builder()
//!     .contents(|_| producer::on_scheduler(shared_worker(), query()))
//!     .delivery_loop(&delivery)
//!     .build();
//! ```

mod change;
mod cursor;
mod data;
mod delivery;
mod diff;
mod error;
mod hash;
mod lifecycle;
mod list;
mod notifying;
mod observer;
mod paged;
pub mod producer;
mod source;
mod sources;
pub mod testing;
pub mod views;
mod worker;

// Core types
pub use change::{Change, Payload};
pub use data::{AVAILABLE_UNKNOWN, Data, LoadType};
pub use error::{DataError, Result, SourceError, source_error};
pub use observer::{
    AvailableObserver, DataObserver, ErrorObserver, LoadingObserver, ObserverRegistry,
    ObserverSet, Registration, Unregistration,
};

// Data implementations
pub use cursor::{ChangeListener, Cursor, CursorData, CursorDataBuilder, DEFAULT_RELEASE_DELAY};
pub use lifecycle::{GateState, LifecycleGate, Transition};
pub use list::ListData;
pub use notifying::{NotificationType, NotifyingList};
pub use paged::{DEFAULT_LOOK_AHEAD, Page, PageRequest, PagedData, PagedDataBuilder};
pub use source::{DiffComputation, ObservableData, ObservableDataBuilder};
pub use sources::{ImmutableData, MappedData, from_list, from_list_on, map};
pub use views::{FilterData, View, WindowData};

// Diffing
pub use diff::{DiffOracle, DiffStrategy, Differ, Edit, FineGrained, ItemMatcher, MyersDiff};

// Producers and scheduling
pub use producer::{Emitter, Event, Producer, Subject, Subscription};
pub use worker::{Job, ManualScheduler, Scheduler, Worker, shared_worker};

// Delivery (for custom event loops)
pub use delivery::{
    DEFAULT_DEBOUNCE, DEFAULT_MAX_DEBOUNCE, DeliveryHandle, DeliveryLoop, Flush, Waker,
};

#[cfg(test)]
mod tests;
