//! Structural change notifications.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque payload attached to a [`Change::Changed`] notification.
///
/// Payloads let observers perform partial rebinds. Two payloads compare equal
/// only when they share an allocation, which is how consecutive changes are
/// recognised as batchable.
#[derive(Clone)]
pub struct Payload(Arc<dyn Any + Send + Sync>);

impl Payload {
    /// Wrap a value as a payload.
    pub fn new<P: Any + Send + Sync>(value: P) -> Self {
        Payload(Arc::new(value))
    }

    /// Borrow the payload as `P`, if that is its type.
    pub fn downcast_ref<P: Any>(&self) -> Option<&P> {
        self.0.downcast_ref()
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Payload")
            .field(&Arc::as_ptr(&self.0).cast::<()>())
            .finish()
    }
}

/// A structural change to an ordered data set.
///
/// Positions refer to the data as it stands immediately before the change is
/// applied, except for `Moved::to`, which addresses the post-removal index space:
/// the block of `count` elements at `from` is taken out and reinserted so that it
/// starts at `to`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Change {
    /// `count` elements were inserted starting at `position`.
    Inserted {
        /// First inserted position.
        position: usize,
        /// Number of inserted elements.
        count: usize,
    },
    /// `count` elements were removed starting at `position`.
    Removed {
        /// First removed position.
        position: usize,
        /// Number of removed elements.
        count: usize,
    },
    /// A block of `count` elements moved from `from` so that it now starts at `to`.
    Moved {
        /// Position of the block before the move.
        from: usize,
        /// Position of the block after the move.
        to: usize,
        /// Length of the block.
        count: usize,
    },
    /// `count` elements starting at `position` were replaced in place.
    Changed {
        /// First changed position.
        position: usize,
        /// Number of changed elements.
        count: usize,
        /// Optional partial-update hint.
        payload: Option<Payload>,
    },
    /// Anything may have changed; observers should resynchronise from `size()`.
    Reset,
}

impl Change {
    /// Shorthand for [`Change::Inserted`].
    pub fn inserted(position: usize, count: usize) -> Self {
        Change::Inserted { position, count }
    }

    /// Shorthand for [`Change::Removed`].
    pub fn removed(position: usize, count: usize) -> Self {
        Change::Removed { position, count }
    }

    /// Shorthand for [`Change::Moved`].
    pub fn moved(from: usize, to: usize, count: usize) -> Self {
        Change::Moved { from, to, count }
    }

    /// Shorthand for [`Change::Changed`] without a payload.
    pub fn changed(position: usize, count: usize) -> Self {
        Change::Changed {
            position,
            count,
            payload: None,
        }
    }

    /// Number of elements the change touches. `Reset` reports zero.
    pub fn count(&self) -> usize {
        match self {
            Change::Inserted { count, .. }
            | Change::Removed { count, .. }
            | Change::Moved { count, .. }
            | Change::Changed { count, .. } => *count,
            Change::Reset => 0,
        }
    }

    /// Whether dispatching this change would tell observers nothing.
    pub(crate) fn is_empty(&self) -> bool {
        !matches!(self, Change::Reset) && self.count() == 0
    }

    /// Apply the change to a shadow size.
    ///
    /// `actual` is the size reported by the data after the change; a `Reset`
    /// resynchronises the shadow to it.
    pub fn apply_to_size(&self, shadow: usize, actual: usize) -> usize {
        match self {
            Change::Inserted { count, .. } => shadow + count,
            Change::Removed { count, .. } => shadow.saturating_sub(*count),
            Change::Moved { .. } | Change::Changed { .. } => shadow,
            Change::Reset => actual,
        }
    }
}

impl fmt::Display for Change {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Change::Inserted { position, count } => write!(f, "Inserted({position}, {count})"),
            Change::Removed { position, count } => write!(f, "Removed({position}, {count})"),
            Change::Moved { from, to, count } => write!(f, "Moved({from}, {to}, {count})"),
            Change::Changed {
                position, count, ..
            } => write!(f, "Changed({position}, {count})"),
            Change::Reset => f.write_str("Reset"),
        }
    }
}
