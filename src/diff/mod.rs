//! Snapshot diffing.
//!
//! A [`DiffStrategy`] is chosen once per data instance and resolved into a
//! [`Differ`], which turns an `(old, new)` pair of snapshots into an ordered list
//! of [`Edit`]s. Each edit carries enough of the new snapshot to be applied to a
//! working copy of the old one, and yields exactly one [`Change`] notification
//! when applied. Replaying every edit in order transforms `old` into `new`.
//!
//! # Strategies
//!
//! - [`DiffStrategy::None`] - a single [`Change::Reset`].
//! - [`DiffStrategy::Coarse`] - size delta at the tail, then `Changed` over the
//!   overlapping prefix. Constant time, imprecise.
//! - [`DiffStrategy::Fine`] - identity/content matching through a [`DiffOracle`],
//!   [`MyersDiff`] by default, with optional move detection.
//!
//! Every strategy shares the same fast paths: identical or both-empty snapshots
//! produce nothing, an empty old snapshot produces one insert, and an empty new
//! snapshot produces one removal.

mod batch;
mod myers;

use std::fmt;
use std::sync::Arc;

pub use myers::MyersDiff;

use crate::DataError;
use crate::change::{Change, Payload};

/// A primitive edit produced by a [`Differ`] or [`DiffOracle`].
#[derive(Clone, Debug, PartialEq)]
pub enum Edit<T> {
    /// Insert `items` starting at `position`.
    Insert {
        /// First inserted position.
        position: usize,
        /// Inserted elements, in order.
        items: Vec<T>,
    },
    /// Remove `count` elements starting at `position`.
    Remove {
        /// First removed position.
        position: usize,
        /// Number of removed elements.
        count: usize,
    },
    /// Move a block of `count` elements from `from` so it starts at `to`.
    Move {
        /// Position of the block before the move.
        from: usize,
        /// Position of the block after the move.
        to: usize,
        /// Length of the block.
        count: usize,
    },
    /// Replace the elements starting at `position` with `items`.
    Change {
        /// First replaced position.
        position: usize,
        /// Replacement elements, in order.
        items: Vec<T>,
        /// Optional partial-update hint.
        payload: Option<Payload>,
    },
    /// Replace everything with `items`.
    Reset {
        /// The complete new contents.
        items: Vec<T>,
    },
}

impl<T> Edit<T> {
    /// The notification that describes this edit.
    pub fn to_change(&self) -> Change {
        match self {
            Edit::Insert { position, items } => Change::inserted(*position, items.len()),
            Edit::Remove { position, count } => Change::removed(*position, *count),
            Edit::Move { from, to, count } => Change::moved(*from, *to, *count),
            Edit::Change {
                position,
                items,
                payload,
            } => Change::Changed {
                position: *position,
                count: items.len(),
                payload: payload.clone(),
            },
            Edit::Reset { .. } => Change::Reset,
        }
    }

    /// Apply the edit to `list` and return its notification.
    ///
    /// Out-of-range edits leave `list` untouched and return an error.
    pub fn apply(self, list: &mut Vec<T>) -> Result<Change, DataError> {
        let change = self.to_change();
        let size = list.len();
        match self {
            Edit::Insert { position, items } => {
                if position > size {
                    return Err(DataError::OutOfRange { position, size });
                }
                list.splice(position..position, items);
            }
            Edit::Remove { position, count } => {
                check_range(position, count, size)?;
                list.drain(position..position + count);
            }
            Edit::Move { from, to, count } => {
                check_range(from, count, size)?;
                if to + count > size {
                    return Err(DataError::InvalidMove {
                        from,
                        to,
                        count,
                        size,
                    });
                }
                let block: Vec<T> = list.drain(from..from + count).collect();
                list.splice(to..to, block);
            }
            Edit::Change {
                position, items, ..
            } => {
                check_range(position, items.len(), size)?;
                let count = items.len();
                list.splice(position..position + count, items);
            }
            Edit::Reset { items } => *list = items,
        }
        Ok(change)
    }
}

fn check_range(start: usize, count: usize, size: usize) -> Result<(), DataError> {
    if start.checked_add(count).is_none_or(|end| end > size) {
        return Err(DataError::InvalidRange { start, count, size });
    }
    Ok(())
}

/// Matching predicates consumed by a [`DiffOracle`].
pub trait ItemMatcher<T> {
    /// Whether `old` and `new` represent the same logical item.
    fn same_item(&self, old: &T, new: &T) -> bool;

    /// Whether two items for which [`same_item`](Self::same_item) holds look the same.
    fn same_content(&self, old: &T, new: &T) -> bool;

    /// Partial-update hint for a matched item whose content changed.
    fn change_payload(&self, _old: &T, _new: &T) -> Option<Payload> {
        None
    }
}

/// Computes an edit script between two snapshots.
///
/// Implementations must return edits that, applied in order to `old`, yield a
/// list of `new.len()` elements matching `new` under the matcher. When
/// `detect_moves` is false no [`Edit::Move`] may be produced.
pub trait DiffOracle<T>: Send + Sync {
    /// Produce the ordered edit script from `old` to `new`.
    fn diff(
        &self,
        old: &[T],
        new: &[T],
        matcher: &dyn ItemMatcher<T>,
        detect_moves: bool,
    ) -> Vec<Edit<T>>;
}

type Predicate<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;
type PayloadFn<T> = Arc<dyn Fn(&T, &T) -> Option<Payload> + Send + Sync>;

/// Configuration of the fine-grained strategy.
pub struct FineGrained<T> {
    identity: Predicate<T>,
    content: Predicate<T>,
    payload: Option<PayloadFn<T>>,
    detect_moves: bool,
    oracle: Arc<dyn DiffOracle<T>>,
}

impl<T: Clone + PartialEq + 'static> FineGrained<T> {
    /// Match items with `identity`; compare contents with `PartialEq`.
    pub fn new(identity: impl Fn(&T, &T) -> bool + Send + Sync + 'static) -> Self {
        Self::with_content(identity, |a: &T, b: &T| a == b)
    }
}

impl<T: Clone + 'static> FineGrained<T> {
    /// Match items with `identity`; compare contents with `content`.
    pub fn with_content(
        identity: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
        content: impl Fn(&T, &T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            identity: Arc::new(identity),
            content: Arc::new(content),
            payload: None,
            detect_moves: true,
            oracle: Arc::new(MyersDiff),
        }
    }

    /// Attach a payload to `Changed` notifications.
    pub fn change_payload(
        mut self,
        payload: impl Fn(&T, &T) -> Option<Payload> + Send + Sync + 'static,
    ) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Enable or disable move detection. Enabled by default.
    pub fn detect_moves(mut self, detect_moves: bool) -> Self {
        self.detect_moves = detect_moves;
        self
    }

    /// Replace the diff oracle.
    pub fn oracle(mut self, oracle: impl DiffOracle<T> + 'static) -> Self {
        self.oracle = Arc::new(oracle);
        self
    }
}

impl<T> ItemMatcher<T> for FineGrained<T> {
    fn same_item(&self, old: &T, new: &T) -> bool {
        (self.identity)(old, new)
    }

    fn same_content(&self, old: &T, new: &T) -> bool {
        (self.content)(old, new)
    }

    fn change_payload(&self, old: &T, new: &T) -> Option<Payload> {
        self.payload.as_ref().and_then(|payload| payload(old, new))
    }
}

impl<T> fmt::Debug for FineGrained<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FineGrained")
            .field("detect_moves", &self.detect_moves)
            .field("payload", &self.payload.is_some())
            .finish_non_exhaustive()
    }
}

/// How successive snapshots are turned into notifications.
#[derive(Debug)]
pub enum DiffStrategy<T> {
    /// One generic [`Change::Reset`] per snapshot.
    None,
    /// Size delta plus `Changed` over the overlap. The default.
    Coarse,
    /// Identity/content-based diff with optional move detection.
    Fine(FineGrained<T>),
}

impl<T> Default for DiffStrategy<T> {
    fn default() -> Self {
        DiffStrategy::Coarse
    }
}

impl<T: Clone + Send + Sync + 'static> DiffStrategy<T> {
    /// Resolve the strategy into a concrete differ.
    pub fn into_differ(self) -> Differ<T> {
        match self {
            DiffStrategy::None => Differ {
                compute: Arc::new(|_old: &[T], new: &[T]| vec![Edit::Reset { items: new.to_vec() }]),
                offloadable: false,
            },
            DiffStrategy::Coarse => Differ {
                compute: Arc::new(|old: &[T], new: &[T]| coarse(old, new)),
                offloadable: true,
            },
            DiffStrategy::Fine(fine) => {
                let fine = Arc::new(fine);
                Differ {
                    compute: Arc::new(move |old: &[T], new: &[T]| {
                        fine.oracle.diff(old, new, &*fine, fine.detect_moves)
                    }),
                    offloadable: true,
                }
            }
        }
    }
}

type ComputeFn<T> = Arc<dyn Fn(&[T], &[T]) -> Vec<Edit<T>> + Send + Sync>;

/// A resolved diff strategy.
pub struct Differ<T> {
    compute: ComputeFn<T>,
    offloadable: bool,
}

impl<T> Clone for Differ<T> {
    fn clone(&self) -> Self {
        Self {
            compute: self.compute.clone(),
            offloadable: self.offloadable,
        }
    }
}

impl<T: Clone> Differ<T> {
    /// The complete edit script from `old` to `new`.
    pub fn diff(&self, old: &[T], new: &[T]) -> Vec<Edit<T>> {
        fast_path(old, new).unwrap_or_else(|| (self.compute)(old, new))
    }

    /// The edit script if it is cheap enough to compute on the delivery context,
    /// or `None` if it should be offloaded to a worker.
    pub fn quick(&self, old: &[T], new: &[T]) -> Option<Vec<Edit<T>>> {
        fast_path(old, new).or_else(|| (!self.offloadable).then(|| (self.compute)(old, new)))
    }
}

fn fast_path<T: Clone>(old: &[T], new: &[T]) -> Option<Vec<Edit<T>>> {
    if std::ptr::eq(old, new) || (old.is_empty() && new.is_empty()) {
        return Some(Vec::new());
    }
    if old.is_empty() {
        return Some(vec![Edit::Insert {
            position: 0,
            items: new.to_vec(),
        }]);
    }
    if new.is_empty() {
        return Some(vec![Edit::Remove {
            position: 0,
            count: old.len(),
        }]);
    }
    None
}

/// The coarse edit script: tail insert or removal, then a prefix change.
pub(crate) fn coarse<T: Clone>(old: &[T], new: &[T]) -> Vec<Edit<T>> {
    let mut edits = Vec::with_capacity(2);
    let overlap = old.len().min(new.len());
    if new.len() < old.len() {
        edits.push(Edit::Remove {
            position: new.len(),
            count: old.len() - new.len(),
        });
    } else if new.len() > old.len() {
        edits.push(Edit::Insert {
            position: old.len(),
            items: new[old.len()..].to_vec(),
        });
    }
    if overlap > 0 {
        edits.push(Edit::Change {
            position: 0,
            items: new[..overlap].to_vec(),
            payload: None,
        });
    }
    edits
}
