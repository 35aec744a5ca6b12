//! A list that announces its own mutations.

use std::fmt;

use parking_lot::{ReentrantMutex, RwLock};

use crate::change::Change;
use crate::diff::{self, Edit};
use crate::error::{DataError, Result};
use crate::observer::ObserverRegistry;

/// How a [`NotifyingList`] describes its mutations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NotificationType {
    /// The exact insert, remove, move or change.
    #[default]
    Fine,
    /// A [`Change::Reset`] for every mutation.
    Coarse,
}

/// An ordered sequence whose every mutation emits the matching [`Change`].
///
/// Each operation mutates the elements, releases the element lock, and then
/// notifies the structural observers of its [`ObserverRegistry`] before
/// returning. Readers never wait on observers.
///
/// Mutations are serialized by a reentrant writer lock held across
/// mutate-then-notify, so notifications from concurrent writers arrive in
/// mutation order. An observer may mutate the list from inside its callback;
/// the nested notification is delivered before the outer call returns.
pub struct NotifyingList<T> {
    items: RwLock<Vec<T>>,
    writer: ReentrantMutex<()>,
    notification_type: RwLock<NotificationType>,
    observers: ObserverRegistry,
}

impl<T> Default for NotifyingList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for NotifyingList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingList")
            .field("len", &self.len())
            .field("notification_type", &self.notification_type())
            .finish_non_exhaustive()
    }
}

impl<T> NotifyingList<T> {
    /// An empty list.
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    /// A list holding `items`. No notification is emitted.
    pub fn from_vec(items: Vec<T>) -> Self {
        Self {
            items: RwLock::new(items),
            writer: ReentrantMutex::new(()),
            notification_type: RwLock::new(NotificationType::Fine),
            observers: ObserverRegistry::new(),
        }
    }

    /// The observers notified of mutations.
    pub fn observers(&self) -> &ObserverRegistry {
        &self.observers
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current notification granularity.
    pub fn notification_type(&self) -> NotificationType {
        *self.notification_type.read()
    }

    /// Change the notification granularity for subsequent mutations.
    pub fn set_notification_type(&self, notification_type: NotificationType) {
        *self.notification_type.write() = notification_type;
    }

    /// Read the elements without copying them.
    pub fn with_items<R>(&self, f: impl FnOnce(&[T]) -> R) -> R {
        f(&self.items.read())
    }

    /// Run `f` against the elements and announce the change it reports.
    ///
    /// `f` must leave the elements consistent with the returned change.
    pub(crate) fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Vec<T>) -> Result<(R, Change)>,
    ) -> Result<R> {
        let _writer = self.writer.lock();
        let (result, change) = {
            let mut items = self.items.write();
            f(&mut items)?
        };
        self.notify(&change);
        Ok(result)
    }

    /// Swap in `items` of the same length without notifying.
    pub(crate) fn replace_silently(&self, items: Vec<T>) {
        let _writer = self.writer.lock();
        let mut current = self.items.write();
        debug_assert_eq!(current.len(), items.len());
        *current = items;
    }

    /// Apply `edit` and announce it.
    pub fn apply(&self, edit: Edit<T>) -> Result<()> {
        self.mutate(|items| edit.apply(items).map(|change| ((), change)))
    }

    fn notify(&self, change: &Change) {
        if change.is_empty() {
            return;
        }
        match self.notification_type() {
            NotificationType::Fine => self.observers.notify_change(change),
            NotificationType::Coarse => self.observers.notify_change(&Change::Reset),
        }
    }

    /// Append one element.
    pub fn push(&self, item: T) {
        self.extend(std::iter::once(item));
    }

    /// Append every element of `items`.
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        let items: Vec<T> = items.into_iter().collect();
        // Appending at the current end cannot be out of range.
        let _ = self.mutate(|list| {
            let position = list.len();
            Edit::Insert { position, items }.apply(list).map(|c| ((), c))
        });
    }

    /// Insert `item` at `index`.
    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        self.insert_all(index, vec![item])
    }

    /// Insert `items` starting at `index`.
    pub fn insert_all(&self, index: usize, items: impl IntoIterator<Item = T>) -> Result<()> {
        self.apply(Edit::Insert {
            position: index,
            items: items.into_iter().collect(),
        })
    }

    /// Replace the element at `index`, returning the previous one.
    pub fn set(&self, index: usize, item: T) -> Result<T> {
        self.mutate(|list| {
            let size = list.len();
            let slot = list
                .get_mut(index)
                .ok_or(DataError::OutOfRange { position: index, size })?;
            Ok((std::mem::replace(slot, item), Change::changed(index, 1)))
        })
    }

    /// Replace consecutive elements starting at `index`.
    pub fn set_all(&self, index: usize, items: impl IntoIterator<Item = T>) -> Result<()> {
        self.apply(Edit::Change {
            position: index,
            items: items.into_iter().collect(),
            payload: None,
        })
    }

    /// Remove and return the element at `index`.
    pub fn remove(&self, index: usize) -> Result<T> {
        self.mutate(|list| {
            if index >= list.len() {
                return Err(DataError::OutOfRange {
                    position: index,
                    size: list.len(),
                });
            }
            Ok((list.remove(index), Change::removed(index, 1)))
        })
    }

    /// Remove `count` elements starting at `start`.
    pub fn remove_range(&self, start: usize, count: usize) -> Result<()> {
        self.apply(Edit::Remove {
            position: start,
            count,
        })
    }

    /// Remove every element.
    pub fn clear(&self) {
        // Removing 0..len cannot be out of range.
        let _ = self.mutate(|list| {
            let count = list.len();
            list.clear();
            Ok(((), Change::removed(0, count)))
        });
    }

    /// Move `count` elements from `from` so that they start at `to`.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn move_range(&self, from: usize, to: usize, count: usize) -> Result<()> {
        assert!(count > 0, "move_range: count must be at least 1");
        self.apply(Edit::Move { from, to, count })
    }
}

impl<T: Clone> NotifyingList<T> {
    /// The element at `index`.
    pub fn get(&self, index: usize) -> Result<T> {
        let items = self.items.read();
        items.get(index).cloned().ok_or(DataError::OutOfRange {
            position: index,
            size: items.len(),
        })
    }

    /// Copy the elements out.
    pub fn to_vec(&self) -> Vec<T> {
        self.items.read().clone()
    }

    /// Overwrite the contents with `items`.
    ///
    /// Emits the size delta at the tail, then `Changed` over the overlap.
    pub fn replace_all(&self, items: Vec<T>) {
        let _writer = self.writer.lock();
        let edits = {
            let old = self.items.read();
            diff::coarse(&old, &items)
        };
        for edit in edits {
            // Coarse edits are derived from the current contents under the writer lock.
            let _ = self.apply(edit);
        }
    }
}

impl<T: PartialEq> NotifyingList<T> {
    /// Remove the first element equal to `item`. Returns whether one was found.
    pub fn remove_item(&self, item: &T) -> bool {
        self.mutate(|list| match list.iter().position(|candidate| candidate == item) {
            Some(index) => {
                list.remove(index);
                Ok((true, Change::removed(index, 1)))
            }
            None => Ok((false, Change::removed(0, 0))),
        })
        .unwrap_or(false)
    }
}
