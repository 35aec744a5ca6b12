// Coalesces consecutive single-element edits emitted by the oracle's dispatch
// pass into runs, the way a list-update batching callback does:
// - inserts merge when the new position touches the pending run
// - removals merge when the pending run starts inside the new removal's extent
// - changes merge when they touch and carry the same payload
// - moves never merge and always flush

use super::Edit;
use crate::change::Payload;

pub(super) struct Batcher<T> {
    edits: Vec<Edit<T>>,
    pending: Option<Edit<T>>,
}

impl<T> Batcher<T> {
    pub(super) fn new() -> Self {
        Self {
            edits: Vec::new(),
            pending: None,
        }
    }

    pub(super) fn inserted(&mut self, position: usize, items: Vec<T>) {
        if items.is_empty() {
            return;
        }
        if let Some(Edit::Insert {
            position: last,
            items: run,
        }) = &mut self.pending
            && position >= *last
            && position <= *last + run.len()
        {
            let offset = position - *last;
            run.splice(offset..offset, items);
            return;
        }
        self.push(Edit::Insert { position, items });
    }

    pub(super) fn removed(&mut self, position: usize, count: usize) {
        if count == 0 {
            return;
        }
        if let Some(Edit::Remove {
            position: last,
            count: run,
        }) = &mut self.pending
            && *last >= position
            && *last <= position + count
        {
            *run += count;
            *last = position;
            return;
        }
        self.push(Edit::Remove { position, count });
    }

    pub(super) fn moved(&mut self, from: usize, to: usize) {
        self.flush();
        self.edits.push(Edit::Move { from, to, count: 1 });
    }

    pub(super) fn changed(&mut self, position: usize, item: T, payload: Option<Payload>) {
        if let Some(Edit::Change {
            position: last,
            items: run,
            payload: run_payload,
        }) = &mut self.pending
            && *run_payload == payload
            && position + 1 >= *last
            && position <= *last + run.len()
        {
            let end = *last + run.len();
            if position < *last {
                run.insert(0, item);
                *last = position;
            } else if position < end {
                run[position - *last] = item;
            } else {
                run.push(item);
            }
            return;
        }
        self.push(Edit::Change {
            position,
            items: vec![item],
            payload,
        });
    }

    pub(super) fn finish(mut self) -> Vec<Edit<T>> {
        self.flush();
        self.edits
    }

    fn push(&mut self, edit: Edit<T>) {
        self.flush();
        self.pending = Some(edit);
    }

    fn flush(&mut self) {
        if let Some(edit) = self.pending.take() {
            self.edits.push(edit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_inserts_at_one_position_form_an_ordered_run() {
        let mut batch = Batcher::new();
        batch.inserted(2, vec!['c']);
        batch.inserted(2, vec!['b']);
        batch.inserted(2, vec!['a']);
        assert_eq!(
            batch.finish(),
            vec![Edit::Insert {
                position: 2,
                items: vec!['a', 'b', 'c']
            }]
        );
    }

    #[test]
    fn descending_removals_merge() {
        let mut batch = Batcher::<char>::new();
        batch.removed(1, 1);
        batch.removed(0, 1);
        assert_eq!(
            batch.finish(),
            vec![Edit::Remove {
                position: 0,
                count: 2
            }]
        );
    }

    #[test]
    fn changes_with_different_payloads_stay_apart() {
        let mut batch = Batcher::new();
        batch.changed(1, 'b', None);
        batch.changed(0, 'a', Some(Payload::new(1)));
        assert_eq!(batch.finish().len(), 2);
    }

    #[test]
    fn descending_changes_merge_into_one_run() {
        let mut batch = Batcher::new();
        batch.changed(3, 'd', None);
        batch.changed(2, 'c', None);
        assert_eq!(
            batch.finish(),
            vec![Edit::Change {
                position: 2,
                items: vec!['c', 'd'],
                payload: None
            }]
        );
    }

    #[test]
    fn moves_flush_the_pending_run() {
        let mut batch = Batcher::new();
        batch.inserted(0, vec!['x']);
        batch.moved(3, 1);
        batch.inserted(0, vec!['y']);
        let edits = batch.finish();
        assert_eq!(edits.len(), 3);
        assert_eq!(edits[1], Edit::Move { from: 3, to: 1, count: 1 });
    }
}
