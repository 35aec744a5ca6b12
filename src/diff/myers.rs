//! Myers diff with move detection.
//!
//! The edit graph is searched with the linear-space divide-and-conquer variant
//! of Myers' algorithm: each range is split at the middle snake found by running
//! the forward and reverse searches towards each other, and the two halves are
//! pushed back onto a work stack. Each snake contributes its diagonal (the run
//! of matching items it slid along). The sorted diagonals are then used twice:
//!
//! 1. To classify each item as unchanged or changed, and (with move detection)
//!    to pair every unmatched removal with the first unclaimed insertion of an
//!    item with the same identity.
//! 2. To dispatch updates from the end. Working backwards keeps every position
//!    in front of the cursor valid in the list as it stands. A move whose other
//!    half has not been reached yet is postponed with its distance from the end
//!    of the list, which later edits in front of it leave untouched.

use super::batch::Batcher;
use super::{DiffOracle, Edit, ItemMatcher};

const FLAG_NOT_CHANGED: usize = 1;
const FLAG_CHANGED: usize = 1 << 1;
const FLAG_MOVED_CHANGED: usize = 1 << 2;
const FLAG_MOVED_NOT_CHANGED: usize = 1 << 3;
const FLAG_MOVED: usize = FLAG_MOVED_CHANGED | FLAG_MOVED_NOT_CHANGED;
const FLAG_OFFSET: usize = 4;
const FLAG_MASK: usize = (1 << FLAG_OFFSET) - 1;

/// The default [`DiffOracle`].
#[derive(Clone, Copy, Debug, Default)]
pub struct MyersDiff;

impl<T: Clone> DiffOracle<T> for MyersDiff {
    fn diff(
        &self,
        old: &[T],
        new: &[T],
        matcher: &dyn ItemMatcher<T>,
        detect_moves: bool,
    ) -> Vec<Edit<T>> {
        let diagonals = find_diagonals(old, new, matcher);
        Script::new(old, new, matcher, diagonals, detect_moves).dispatch()
    }
}

/// A run of `size` matching items starting at `old[x]` and `new[y]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Diagonal {
    x: usize,
    y: usize,
    size: usize,
}

impl Diagonal {
    fn end_x(&self) -> usize {
        self.x + self.size
    }

    fn end_y(&self) -> usize {
        self.y + self.size
    }
}

/// The path found by one search step: at most one removal or insertion plus
/// the slide along a diagonal. Coordinates are absolute.
#[derive(Clone, Copy, Debug)]
struct Snake {
    start_x: isize,
    start_y: isize,
    end_x: isize,
    end_y: isize,
    /// Found by the reverse search, so the non-diagonal step is at the end.
    reverse: bool,
}

impl Snake {
    fn diagonal(&self) -> Diagonal {
        let width = self.end_x - self.start_x;
        let height = self.end_y - self.start_y;
        let size = width.min(height) as usize;
        let (x, y) = if width == height || self.reverse {
            (self.start_x, self.start_y)
        } else if height > width {
            (self.start_x, self.start_y + 1)
        } else {
            (self.start_x + 1, self.start_y)
        };
        Diagonal {
            x: x as usize,
            y: y as usize,
            size,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Range {
    old_start: isize,
    old_end: isize,
    new_start: isize,
    new_end: isize,
}

impl Range {
    fn old_size(&self) -> isize {
        self.old_end - self.old_start
    }

    fn new_size(&self) -> isize {
        self.new_end - self.new_start
    }
}

/// Furthest-reaching x per diagonal `k`, addressable for negative `k`.
struct Diagonals {
    values: Vec<isize>,
    offset: isize,
}

impl Diagonals {
    fn new(bound: isize) -> Self {
        Self {
            values: vec![0; (2 * bound + 1) as usize],
            offset: bound,
        }
    }

    #[inline]
    fn get(&self, k: isize) -> isize {
        self.values[(self.offset + k) as usize]
    }

    #[inline]
    fn set(&mut self, k: isize, x: isize) {
        self.values[(self.offset + k) as usize] = x;
    }
}

fn find_diagonals<T>(old: &[T], new: &[T], matcher: &dyn ItemMatcher<T>) -> Vec<Diagonal> {
    // Search depth stays below half the combined length; k reaches one past it.
    let bound = ((old.len() + new.len() + 1) / 2 + 1) as isize;
    let mut forward = Diagonals::new(bound);
    let mut backward = Diagonals::new(bound);

    let mut diagonals = Vec::new();
    let mut stack = vec![Range {
        old_start: 0,
        old_end: old.len() as isize,
        new_start: 0,
        new_end: new.len() as isize,
    }];

    while let Some(range) = stack.pop() {
        let Some(snake) = middle_snake(old, new, matcher, range, &mut forward, &mut backward)
        else {
            continue;
        };
        let diagonal = snake.diagonal();
        if diagonal.size > 0 {
            diagonals.push(diagonal);
        }
        stack.push(Range {
            old_start: range.old_start,
            old_end: snake.start_x,
            new_start: range.new_start,
            new_end: snake.start_y,
        });
        stack.push(Range {
            old_start: snake.end_x,
            old_end: range.old_end,
            new_start: snake.end_y,
            new_end: range.new_end,
        });
    }

    diagonals.sort_unstable();
    if diagonals.first().is_none_or(|first| first.x != 0 || first.y != 0) {
        diagonals.insert(0, Diagonal { x: 0, y: 0, size: 0 });
    }
    diagonals.push(Diagonal {
        x: old.len(),
        y: new.len(),
        size: 0,
    });
    diagonals
}

fn middle_snake<T>(
    old: &[T],
    new: &[T],
    matcher: &dyn ItemMatcher<T>,
    range: Range,
    forward: &mut Diagonals,
    backward: &mut Diagonals,
) -> Option<Snake> {
    let old_size = range.old_size();
    let new_size = range.new_size();
    if old_size < 1 || new_size < 1 {
        return None;
    }
    let same = |x: isize, y: isize| matcher.same_item(&old[x as usize], &new[y as usize]);

    let max = (old_size + new_size + 1) / 2;
    forward.set(1, range.old_start);
    backward.set(1, range.old_end);
    for d in 0..max {
        if let Some(snake) = search_forward(&same, range, forward, backward, d) {
            return Some(snake);
        }
        if let Some(snake) = search_backward(&same, range, forward, backward, d) {
            return Some(snake);
        }
    }

    tracing::warn!(
        old_size,
        new_size,
        "no middle snake found; item identity is not an equivalence relation"
    );
    None
}

fn search_forward(
    same: &impl Fn(isize, isize) -> bool,
    range: Range,
    forward: &mut Diagonals,
    backward: &Diagonals,
    d: isize,
) -> Option<Snake> {
    let delta = range.old_size() - range.new_size();
    let check_overlap = delta.rem_euclid(2) == 1;
    for k in (-d..=d).step_by(2) {
        let (start_x, mut x) = if k == -d || (k != d && forward.get(k + 1) > forward.get(k - 1)) {
            // insertion
            let x = forward.get(k + 1);
            (x, x)
        } else {
            // removal
            let x = forward.get(k - 1);
            (x, x + 1)
        };
        let mut y = range.new_start + (x - range.old_start) - k;
        let start_y = if d == 0 || x != start_x { y } else { y - 1 };
        while x < range.old_end && y < range.new_end && same(x, y) {
            x += 1;
            y += 1;
        }
        forward.set(k, x);
        if check_overlap {
            let backward_k = delta - k;
            if backward_k >= -d + 1 && backward_k <= d - 1 && backward.get(backward_k) <= x {
                return Some(Snake {
                    start_x,
                    start_y,
                    end_x: x,
                    end_y: y,
                    reverse: false,
                });
            }
        }
    }
    None
}

fn search_backward(
    same: &impl Fn(isize, isize) -> bool,
    range: Range,
    forward: &Diagonals,
    backward: &mut Diagonals,
    d: isize,
) -> Option<Snake> {
    let delta = range.old_size() - range.new_size();
    let check_overlap = delta.rem_euclid(2) == 0;
    // Here k counts from the end of the range.
    for k in (-d..=d).step_by(2) {
        let (start_x, mut x) = if k == -d || (k != d && backward.get(k + 1) < backward.get(k - 1))
        {
            let x = backward.get(k + 1);
            (x, x)
        } else {
            let x = backward.get(k - 1);
            (x, x - 1)
        };
        let mut y = range.new_end - ((range.old_end - x) - k);
        let start_y = if d == 0 || x != start_x { y } else { y + 1 };
        while x > range.old_start && y > range.new_start && same(x - 1, y - 1) {
            x -= 1;
            y -= 1;
        }
        backward.set(k, x);
        if check_overlap {
            let forward_k = delta - k;
            if forward_k >= -d && forward_k <= d && forward.get(forward_k) >= x {
                return Some(Snake {
                    start_x: x,
                    start_y: y,
                    end_x: start_x,
                    end_y: start_y,
                    reverse: true,
                });
            }
        }
    }
    None
}

/// A move half waiting for its partner during dispatch.
#[derive(Clone, Copy, Debug)]
struct Postponed {
    /// Index in the owning list (old for removals, new for insertions).
    owner_index: usize,
    /// Distance from the end of the list being edited.
    from_end: usize,
    removal: bool,
}

fn take_postponed(
    postponed: &mut Vec<Postponed>,
    owner_index: usize,
    removal: bool,
) -> Option<Postponed> {
    let index = postponed
        .iter()
        .position(|update| update.owner_index == owner_index && update.removal == removal)?;
    let update = postponed.remove(index);
    for later in &mut postponed[index..] {
        if removal {
            later.from_end -= 1;
        } else {
            later.from_end += 1;
        }
    }
    Some(update)
}

struct Script<'a, T> {
    old: &'a [T],
    new: &'a [T],
    matcher: &'a dyn ItemMatcher<T>,
    diagonals: Vec<Diagonal>,
    old_status: Vec<usize>,
    new_status: Vec<usize>,
}

impl<'a, T: Clone> Script<'a, T> {
    fn new(
        old: &'a [T],
        new: &'a [T],
        matcher: &'a dyn ItemMatcher<T>,
        diagonals: Vec<Diagonal>,
        detect_moves: bool,
    ) -> Self {
        let mut script = Self {
            old,
            new,
            matcher,
            diagonals,
            old_status: vec![0; old.len()],
            new_status: vec![0; new.len()],
        };
        script.classify();
        if detect_moves {
            script.find_moves();
        }
        script
    }

    fn classify(&mut self) {
        for diagonal in &self.diagonals {
            for offset in 0..diagonal.size {
                let x = diagonal.x + offset;
                let y = diagonal.y + offset;
                let flag = if self.matcher.same_content(&self.old[x], &self.new[y]) {
                    FLAG_NOT_CHANGED
                } else {
                    FLAG_CHANGED
                };
                self.old_status[x] = (y << FLAG_OFFSET) | flag;
                self.new_status[y] = (x << FLAG_OFFSET) | flag;
            }
        }
    }

    /// Pair each removal with an insertion of the same item, if one is unclaimed.
    fn find_moves(&mut self) {
        let mut x = 0;
        for index in 0..self.diagonals.len() {
            let diagonal = self.diagonals[index];
            while x < diagonal.x {
                if self.old_status[x] == 0 {
                    self.pair_removal(x);
                }
                x += 1;
            }
            x = diagonal.end_x();
        }
    }

    fn pair_removal(&mut self, old_index: usize) {
        let mut y = 0;
        for diagonal in &self.diagonals {
            while y < diagonal.y {
                // Claimed insertions belong to another removal.
                if self.new_status[y] == 0
                    && self.matcher.same_item(&self.old[old_index], &self.new[y])
                {
                    let flag = if self.matcher.same_content(&self.old[old_index], &self.new[y]) {
                        FLAG_MOVED_NOT_CHANGED
                    } else {
                        FLAG_MOVED_CHANGED
                    };
                    self.old_status[old_index] = (y << FLAG_OFFSET) | flag;
                    self.new_status[y] = (old_index << FLAG_OFFSET) | flag;
                    return;
                }
                y += 1;
            }
            y = diagonal.end_y();
        }
    }

    fn dispatch(self) -> Vec<Edit<T>> {
        let mut batch = Batcher::new();
        let mut postponed = Vec::new();
        let mut size = self.old.len();
        let mut x = self.old.len();
        let mut y = self.new.len();

        for diagonal in self.diagonals.iter().rev() {
            while x > diagonal.end_x() {
                x -= 1;
                let status = self.old_status[x];
                if status & FLAG_MOVED == 0 {
                    batch.removed(x, 1);
                    size -= 1;
                    continue;
                }
                let new_index = status >> FLAG_OFFSET;
                match take_postponed(&mut postponed, new_index, false) {
                    Some(insertion) => {
                        let to = size - insertion.from_end - 1;
                        batch.moved(x, to);
                        if status & FLAG_MASK == FLAG_MOVED_CHANGED {
                            self.changed(&mut batch, to, x, new_index);
                        }
                    }
                    None => postponed.push(Postponed {
                        owner_index: x,
                        from_end: size - x - 1,
                        removal: true,
                    }),
                }
            }

            while y > diagonal.end_y() {
                y -= 1;
                let status = self.new_status[y];
                if status & FLAG_MOVED == 0 {
                    batch.inserted(x, vec![self.new[y].clone()]);
                    size += 1;
                    continue;
                }
                let old_index = status >> FLAG_OFFSET;
                match take_postponed(&mut postponed, old_index, true) {
                    Some(removal) => {
                        let from = size - removal.from_end - 1;
                        batch.moved(from, x);
                        if status & FLAG_MASK == FLAG_MOVED_CHANGED {
                            self.changed(&mut batch, x, old_index, y);
                        }
                    }
                    None => postponed.push(Postponed {
                        owner_index: y,
                        from_end: size - x,
                        removal: false,
                    }),
                }
            }

            for offset in 0..diagonal.size {
                let (x, y) = (diagonal.x + offset, diagonal.y + offset);
                if self.old_status[x] & FLAG_MASK == FLAG_CHANGED {
                    self.changed(&mut batch, x, x, y);
                }
            }
            x = diagonal.x;
            y = diagonal.y;
        }

        if !postponed.is_empty() {
            tracing::warn!(
                unresolved = postponed.len(),
                "diff finished with unpaired moves; item identity is not an equivalence relation"
            );
        }
        batch.finish()
    }

    fn changed(&self, batch: &mut Batcher<T>, position: usize, old_index: usize, new_index: usize) {
        let payload = self
            .matcher
            .change_payload(&self.old[old_index], &self.new[new_index]);
        batch.changed(position, self.new[new_index].clone(), payload);
    }
}
