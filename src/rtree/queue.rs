use super::node::Node;
use super::RTreeError;
use crate::rect::{Rect, Scalar};

pub(crate) const INITIAL_QUEUE_CAPACITY: usize = 256;

/// Frontier element of the nearest-neighbor traversal. Item elements
/// borrow straight into a leaf; the borrows stay valid because a `nearest`
/// call never mutates the tree it walks.
pub(crate) enum Element<const D: usize, C: Scalar, I, const M: usize> {
    Branch(*mut Node<D, C, I, M>),
    Leaf(*mut Node<D, C, I, M>),
    /// Item keyed by the distance to its bounding rect; may still be
    /// re-queued with a refined distance.
    ItemByBb {
        item: *const I,
        rect: *const Rect<D, C>,
    },
    /// Item re-queued with its exact distance.
    Item(*const I),
}

pub(crate) struct QueueEntry<const D: usize, C: Scalar, I, const M: usize> {
    pub(crate) distance: C,
    pub(crate) element: Element<D, C, I, M>,
}

/// Binary min-heap ordered by `distance`. Owned by a tree handle and
/// reused across `nearest` calls to amortize the allocation.
pub(crate) struct PriorityQueue<const D: usize, C: Scalar, I, const M: usize> {
    entries: Vec<QueueEntry<D, C, I, M>>,
}

impl<const D: usize, C: Scalar, I, const M: usize> PriorityQueue<D, C, I, M> {
    pub(crate) fn new() -> Result<Self, RTreeError> {
        let mut entries = Vec::new();
        entries
            .try_reserve_exact(INITIAL_QUEUE_CAPACITY)
            .map_err(|_| RTreeError::OutOfMemory)?;
        Ok(Self { entries })
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn peek_distance(&self) -> Option<C> {
        self.entries.first().map(|entry| entry.distance)
    }

    pub(crate) fn enqueue(&mut self, entry: QueueEntry<D, C, I, M>) -> Result<(), RTreeError> {
        if self.entries.len() == self.entries.capacity() {
            // grow by doubling
            self.entries
                .try_reserve_exact(self.entries.capacity().max(1))
                .map_err(|_| RTreeError::OutOfMemory)?;
        }
        self.entries.push(entry);
        self.sift_up(self.entries.len() - 1);
        Ok(())
    }

    pub(crate) fn dequeue(&mut self) -> QueueEntry<D, C, I, M> {
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let top = self.entries.pop().expect("dequeue on an empty queue");
        self.sift_down(0);
        // reclaim some memory when the queue is shrinking
        if self.entries.len() < self.entries.capacity() / 4 {
            self.entries.shrink_to(self.entries.capacity() / 2);
        }
        top
    }

    fn sift_up(&mut self, index: usize) {
        if index == 0 {
            return;
        }
        let midpoint = (index - 1) / 2;
        if self.entries[midpoint].distance > self.entries[index].distance {
            self.entries.swap(midpoint, index);
            self.sift_up(midpoint);
        }
    }

    fn sift_down(&mut self, index: usize) {
        let mut smallest = index;
        let left = 2 * index + 1;
        let right = 2 * index + 2;
        if left < self.entries.len()
            && self.entries[left].distance < self.entries[smallest].distance
        {
            smallest = left;
        }
        if right < self.entries.len()
            && self.entries[right].distance < self.entries[smallest].distance
        {
            smallest = right;
        }
        if smallest != index {
            self.entries.swap(index, smallest);
            self.sift_down(smallest);
        }
    }
}
