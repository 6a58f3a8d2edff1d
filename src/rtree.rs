//! Copy-on-write R-tree.
//!
//! A tree handle exclusively owns its root reference; children are owned by
//! their parent's slot. Sharing between handles is expressed purely through
//! the per-node counters: `Clone` bumps the root's counter, and every
//! mutating descent copies any node with extra owners before touching it.
//! Two handles therefore never observe each other's writes, and a subtree
//! is released exactly when its last owner lets go.

mod node;
mod queue;

use core::fmt;
use core::ptr;
use std::alloc::Layout;

use thiserror::Error;

use crate::rect::{Rect, Scalar};
use node::{Node, NodeKind};
use queue::{Element, PriorityQueue, QueueEntry};

/// Default node capacity; the last const parameter of [`RTree`] overrides it.
pub const DEFAULT_MAX_ITEMS: usize = 64;

/// Minimum entry count of a non-root node after a completed operation.
pub const fn min_items(max_items: usize) -> usize {
    max_items * 10 / 100 + 1
}

#[cfg(feature = "path-hint")]
pub(crate) const PATH_HINT_DEPTH: usize = 16;

/// Allocation hook. Must return null on failure rather than unwinding.
pub type AllocFn = unsafe fn(Layout) -> *mut u8;

/// Deallocation hook paired with an [`AllocFn`].
pub type DeallocFn = unsafe fn(*mut u8, Layout);

unsafe fn global_alloc(layout: Layout) -> *mut u8 {
    std::alloc::alloc(layout)
}

unsafe fn global_dealloc(ptr: *mut u8, layout: Layout) {
    std::alloc::dealloc(ptr, layout)
}

/// Errors surfaced by tree operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RTreeError {
    /// The configured allocator returned null, or the nearest-neighbor
    /// queue could not grow.
    #[error("allocation failed")]
    OutOfMemory,
}

/// An R-tree over `D` dimensions with coordinate type `C`, item type `I`,
/// and node capacity `M`.
///
/// A handle is single-threaded; clones of a handle may be used from other
/// threads concurrently, each on its own handle.
pub struct RTree<const D: usize, C: Scalar, I, const M: usize = DEFAULT_MAX_ITEMS> {
    rect: Rect<D, C>,
    root: *mut Node<D, C, I, M>,
    queue: Option<PriorityQueue<D, C, I, M>>,
    count: usize,
    height: usize,
    #[cfg(feature = "path-hint")]
    path_hint: [usize; PATH_HINT_DEPTH],
    relaxed: bool,
    alloc: AllocFn,
    dealloc: DeallocFn,
}

// Clones may migrate across threads; shared subtrees are then read from
// several threads at once, hence the `Sync` requirement on items. A handle
// itself is never shared, so `RTree` is deliberately not `Sync`.
#[cfg(feature = "atomics")]
unsafe impl<const D: usize, C: Scalar + Send, I: Send + Sync, const M: usize> Send
    for RTree<D, C, I, M>
{
}

impl<const D: usize, C: Scalar, I, const M: usize> RTree<D, C, I, M> {
    pub fn new() -> Self {
        Self::new_with_allocator(global_alloc, global_dealloc)
    }

    /// A tree whose nodes are allocated through the given hooks. The
    /// nearest-neighbor queue still uses the global allocator.
    pub fn new_with_allocator(alloc: AllocFn, dealloc: DeallocFn) -> Self {
        Self {
            rect: Rect::default(),
            root: ptr::null_mut(),
            queue: None,
            count: 0,
            height: 0,
            #[cfg(feature = "path-hint")]
            path_hint: [0; PATH_HINT_DEPTH],
            relaxed: false,
            alloc,
            dealloc,
        }
    }

    /// Number of items in the tree.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Leaf depth; 0 for an empty tree, 1 when the root is a leaf.
    pub fn height(&self) -> usize {
        self.height
    }

    /// The bounding rectangle of everything in the tree; all-zero when the
    /// tree is empty.
    pub fn bounding_box(&self) -> Rect<D, C> {
        self.rect
    }

    /// Uses relaxed ordering for the shared-owner visibility check in the
    /// copy-on-write guard. Only sound while no other thread holds a clone.
    pub fn opt_relaxed_atomics(&mut self) {
        self.relaxed = true;
    }

    /// Inserts an item with the given bounding rectangle.
    pub fn insert(&mut self, min: [C; D], max: [C; D], item: I) -> Result<(), RTreeError>
    where
        I: Clone,
    {
        let ir = Rect::new(min, max);
        unsafe {
            loop {
                if self.root.is_null() {
                    let new_root = Node::new(self.alloc, NodeKind::Leaf);
                    if new_root.is_null() {
                        return Err(RTreeError::OutOfMemory);
                    }
                    self.root = new_root;
                    self.rect = ir;
                    self.height = 1;
                }
                Node::cow(&mut self.root, self.alloc, self.relaxed)?;
                let mut split = false;
                self.insert_at(self.root, &ir, &item, 0, &mut split)?;
                if !split {
                    self.rect.expand(&ir);
                    self.count += 1;
                    return Ok(());
                }
                // Grow the tree: split the full root and put both halves
                // under a fresh branch.
                let new_root = Node::new(self.alloc, NodeKind::Branch);
                if new_root.is_null() {
                    return Err(RTreeError::OutOfMemory);
                }
                let right =
                    match Node::split_largest_axis_edge_snap(self.root, &self.rect, self.alloc) {
                        Ok(right) => right,
                        Err(err) => {
                            Node::free(new_root, self.dealloc);
                            return Err(err);
                        }
                    };
                (*new_root).push_child((*self.root).rect_calc(), self.root);
                (*new_root).push_child((*right).rect_calc(), right);
                self.root = new_root;
                self.height += 1;
            }
        }
    }

    /// Inserts an item at a point (a degenerate rectangle).
    pub fn insert_point(&mut self, point: [C; D], item: I) -> Result<(), RTreeError>
    where
        I: Clone,
    {
        self.insert(point, point, item)
    }

    unsafe fn insert_at(
        &mut self,
        node: *mut Node<D, C, I, M>,
        ir: &Rect<D, C>,
        item: &I,
        depth: usize,
        split: &mut bool,
    ) -> Result<(), RTreeError>
    where
        I: Clone,
    {
        if (*node).kind() == NodeKind::Leaf {
            if (*node).count() == M {
                *split = true;
                return Ok(());
            }
            (*node).push_item(*ir, item.clone());
            *split = false;
            return Ok(());
        }
        let i = self.choose(&*node, ir, depth);
        Node::cow((*node).child_slot(i), self.alloc, self.relaxed)?;
        self.insert_at((*node).child(i), ir, item, depth + 1, split)?;
        if !*split {
            (*node).rect_mut(i).expand(ir);
            return Ok(());
        }
        // The child is full. If this branch is full as well, keep bubbling
        // the split upward; otherwise split the child here and retry.
        if (*node).count() == M {
            *split = true;
            return Ok(());
        }
        let child_rect = *(*node).rect(i);
        let right = Node::split_largest_axis_edge_snap((*node).child(i), &child_rect, self.alloc)?;
        (*node).set_rect(i, (*(*node).child(i)).rect_calc());
        (*node).push_child((*right).rect_calc(), right);
        self.insert_at(node, ir, item, depth, split)
    }

    fn choose(&mut self, node: &Node<D, C, I, M>, rect: &Rect<D, C>, depth: usize) -> usize {
        #[cfg(not(feature = "path-hint"))]
        let _ = depth;
        #[cfg(feature = "path-hint")]
        if depth < PATH_HINT_DEPTH {
            let h = self.path_hint[depth];
            if h < node.count() && node.rect(h).contains(rect) {
                return h;
            }
        }
        // Quick scan for a child that already contains the rect.
        for i in 0..node.count() {
            if node.rect(i).contains(rect) {
                #[cfg(feature = "path-hint")]
                if depth < PATH_HINT_DEPTH {
                    self.path_hint[depth] = i;
                }
                return i;
            }
        }
        // Fall back to least enlargement.
        let i = node.choose_least_enlargement(rect);
        #[cfg(feature = "path-hint")]
        if depth < PATH_HINT_DEPTH {
            self.path_hint[depth] = i;
        }
        i
    }

    /// Deletes one item whose stored rectangle matches `(min, max)` bit for
    /// bit and which compares equal to `item`. Returns whether an item was
    /// removed. When several stored entries match, which one is removed is
    /// implementation-defined.
    pub fn delete(&mut self, min: [C; D], max: [C; D], item: &I) -> Result<bool, RTreeError>
    where
        I: Clone + PartialEq,
    {
        self.delete_with(min, max, item, |a, b| a == b)
    }

    /// Deletes one item stored at a point.
    pub fn delete_point(&mut self, point: [C; D], item: &I) -> Result<bool, RTreeError>
    where
        I: Clone + PartialEq,
    {
        self.delete(point, point, item)
    }

    /// Like [`delete`](Self::delete) but with a caller-supplied equality
    /// predicate instead of `PartialEq`.
    pub fn delete_with_comparator<F>(
        &mut self,
        min: [C; D],
        max: [C; D],
        item: &I,
        compare: F,
    ) -> Result<bool, RTreeError>
    where
        I: Clone,
        F: FnMut(&I, &I) -> bool,
    {
        self.delete_with(min, max, item, compare)
    }

    fn delete_with<F>(
        &mut self,
        min: [C; D],
        max: [C; D],
        item: &I,
        mut eq: F,
    ) -> Result<bool, RTreeError>
    where
        I: Clone,
        F: FnMut(&I, &I) -> bool,
    {
        let ir = Rect::new(min, max);
        if self.root.is_null() {
            return Ok(false);
        }
        let mut removed = false;
        let mut shrunk = false;
        unsafe {
            Node::cow(&mut self.root, self.alloc, self.relaxed)?;
            let root = self.root;
            let mut tree_rect = self.rect;
            self.delete_at(
                &mut tree_rect,
                root,
                &ir,
                item,
                0,
                &mut removed,
                &mut shrunk,
                &mut eq,
            )?;
            self.rect = tree_rect;
            if !removed {
                return Ok(false);
            }
            self.count -= 1;
            if self.count == 0 {
                Node::free(self.root, self.dealloc);
                self.root = ptr::null_mut();
                self.rect = Rect::default();
                self.height = 0;
            } else {
                // Condense: a root branch holding a single child hands the
                // root role to that child.
                while (*self.root).kind() == NodeKind::Branch && (*self.root).count() == 1 {
                    let prev = self.root;
                    self.root = (*prev).child(0);
                    (*prev).set_count(0);
                    Node::free(prev, self.dealloc);
                    self.height -= 1;
                }
                if shrunk {
                    self.rect = (*self.root).rect_calc();
                }
            }
        }
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    unsafe fn delete_at<F>(
        &mut self,
        nr: &mut Rect<D, C>,
        node: *mut Node<D, C, I, M>,
        ir: &Rect<D, C>,
        item: &I,
        depth: usize,
        removed: &mut bool,
        shrunk: &mut bool,
        eq: &mut F,
    ) -> Result<(), RTreeError>
    where
        I: Clone,
        F: FnMut(&I, &I) -> bool,
    {
        *removed = false;
        *shrunk = false;
        if (*node).kind() == NodeKind::Leaf {
            for i in 0..(*node).count() {
                if !ir.bit_eq((*node).rect(i)) {
                    // different bounding box, keep going
                    continue;
                }
                if !eq((*node).item(i), item) {
                    // different content, keep going
                    continue;
                }
                let _ = (*node).remove_leaf_entry(i);
                if ir.on_edge(nr) {
                    // The removed rect touched the node rect; tighten it.
                    // An emptied node keeps its stale rect, which the
                    // caller discards along with the node.
                    if (*node).count() > 0 {
                        *nr = (*node).rect_calc();
                    }
                    *shrunk = true;
                }
                *removed = true;
                return Ok(());
            }
            return Ok(());
        }
        #[cfg(feature = "path-hint")]
        if depth < PATH_HINT_DEPTH {
            let h = self.path_hint[depth];
            if h < (*node).count() && (*node).rect(h).contains(ir) {
                let crect = *(*node).rect(h);
                Node::cow((*node).child_slot(h), self.alloc, self.relaxed)?;
                self.delete_at(
                    &mut *(*node).rect_ptr(h),
                    (*node).child(h),
                    ir,
                    item,
                    depth + 1,
                    removed,
                    shrunk,
                    eq,
                )?;
                if *removed {
                    self.condense_child(nr, node, h, &crect, depth, shrunk);
                    return Ok(());
                }
            }
        }
        for h in 0..(*node).count() {
            if !(*node).rect(h).contains(ir) {
                continue;
            }
            let crect = *(*node).rect(h);
            Node::cow((*node).child_slot(h), self.alloc, self.relaxed)?;
            self.delete_at(
                &mut *(*node).rect_ptr(h),
                (*node).child(h),
                ir,
                item,
                depth + 1,
                removed,
                shrunk,
                eq,
            )?;
            if !*removed {
                continue;
            }
            self.condense_child(nr, node, h, &crect, depth, shrunk);
            return Ok(());
        }
        Ok(())
    }

    /// Bookkeeping after a removal somewhere below child `h`: drop the
    /// child when it emptied, otherwise record the hint and propagate any
    /// rect shrink upward.
    unsafe fn condense_child(
        &mut self,
        nr: &mut Rect<D, C>,
        node: *mut Node<D, C, I, M>,
        h: usize,
        crect: &Rect<D, C>,
        depth: usize,
        shrunk: &mut bool,
    ) {
        #[cfg(not(feature = "path-hint"))]
        let _ = depth;
        if (*(*node).child(h)).count() == 0 {
            Node::free((*node).child(h), self.dealloc);
            (*node).remove_branch_entry(h);
            if (*node).count() > 0 {
                *nr = (*node).rect_calc();
            }
            *shrunk = true;
            return;
        }
        #[cfg(feature = "path-hint")]
        if depth < PATH_HINT_DEPTH {
            self.path_hint[depth] = h;
        }
        if *shrunk {
            *shrunk = !(*node).rect(h).equals(crect);
            if *shrunk {
                *nr = (*node).rect_calc();
            }
        }
    }

    /// Invokes `iter` for every item whose rectangle intersects
    /// `(min, max)`. Returning `false` from `iter` stops the traversal.
    pub fn search<F>(&self, min: [C; D], max: [C; D], mut iter: F)
    where
        F: FnMut(&[C; D], &[C; D], &I) -> bool,
    {
        let rect = Rect::new(min, max);
        if !self.root.is_null() {
            unsafe {
                node_search(self.root, &rect, &mut iter);
            }
        }
    }

    /// Invokes `iter` for every item in the tree. Returning `false` from
    /// `iter` stops the scan.
    pub fn scan<F>(&self, mut iter: F)
    where
        F: FnMut(&[C; D], &[C; D], &I) -> bool,
    {
        if !self.root.is_null() {
            unsafe {
                node_scan(self.root, &mut iter);
            }
        }
    }

    /// Invokes `iter` for items in order of non-decreasing squared distance
    /// between `point` and their bounding rectangles. Returning `false`
    /// from `iter` stops the traversal.
    pub fn nearest<F>(&mut self, point: [C; D], iter: F) -> Result<(), RTreeError>
    where
        F: FnMut(&I, C) -> bool,
    {
        self.nearest_impl(point, None::<fn(&[C; D], &Rect<D, C>, &I) -> C>, iter)
    }

    /// Like [`nearest`](Self::nearest) but refines candidates with an exact
    /// distance function before delivery, for items whose true distance is
    /// poorly approximated by their bounding rectangle (line segments, for
    /// example). Items are delivered in non-decreasing exact distance.
    pub fn nearest_with_distance<DF, F>(
        &mut self,
        point: [C; D],
        distance: DF,
        iter: F,
    ) -> Result<(), RTreeError>
    where
        DF: Fn(&[C; D], &Rect<D, C>, &I) -> C,
        F: FnMut(&I, C) -> bool,
    {
        self.nearest_impl(point, Some(distance), iter)
    }

    fn nearest_impl<DF, F>(
        &mut self,
        point: [C; D],
        exact: Option<DF>,
        mut iter: F,
    ) -> Result<(), RTreeError>
    where
        DF: Fn(&[C; D], &Rect<D, C>, &I) -> C,
        F: FnMut(&I, C) -> bool,
    {
        if self.root.is_null() {
            return Ok(());
        }
        let root = self.root;
        if self.queue.is_none() {
            self.queue = Some(PriorityQueue::new()?);
        }
        let queue = self.queue.as_mut().expect("queue was just created");
        queue.clear();
        unsafe {
            let element = match (*root).kind() {
                NodeKind::Leaf => Element::Leaf(root),
                NodeKind::Branch => Element::Branch(root),
            };
            queue.enqueue(QueueEntry {
                distance: C::ZERO,
                element,
            })?;
            while queue.len() > 0 {
                let next = queue.dequeue();
                match next.element {
                    Element::Item(item) => {
                        if !iter(&*item, next.distance) {
                            return Ok(());
                        }
                    }
                    Element::ItemByBb { item, rect } => {
                        if let Some(exact) = &exact {
                            // The queue key was only a lower bound. If the
                            // exact distance falls behind the current queue
                            // head, the item is not the next closest after
                            // all; re-queue it with the refined key.
                            let distance = exact(&point, &*rect, &*item);
                            if queue.peek_distance().map_or(false, |top| distance > top) {
                                queue.enqueue(QueueEntry {
                                    distance,
                                    element: Element::Item(item),
                                })?;
                                continue;
                            }
                            if !iter(&*item, distance) {
                                return Ok(());
                            }
                        } else if !iter(&*item, next.distance) {
                            return Ok(());
                        }
                    }
                    Element::Leaf(node) => {
                        let leaf = &*node;
                        for i in 0..leaf.count() {
                            let rect = leaf.rect(i);
                            queue.enqueue(QueueEntry {
                                distance: rect.squared_distance(&point),
                                element: Element::ItemByBb {
                                    item: leaf.item(i),
                                    rect,
                                },
                            })?;
                        }
                    }
                    Element::Branch(node) => {
                        let branch = &*node;
                        for i in 0..branch.count() {
                            let child = branch.child(i);
                            let element = match (*child).kind() {
                                NodeKind::Leaf => Element::Leaf(child),
                                NodeKind::Branch => Element::Branch(child),
                            };
                            queue.enqueue(QueueEntry {
                                distance: branch.rect(i).squared_distance(&point),
                                element,
                            })?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Test-support walker validating the structural invariants: tight
    /// branch rects, equal leaf depth, entry counts within bounds, and the
    /// item total matching `len`.
    pub fn check_invariants(&self) {
        if self.root.is_null() {
            assert_eq!(self.count, 0, "empty tree must hold no items");
            assert_eq!(self.height, 0, "empty tree must have height 0");
            return;
        }
        unsafe {
            let root = &*self.root;
            assert!(
                root.count() >= 1 && root.count() <= M,
                "root entry count out of range: {}",
                root.count()
            );
            assert!(
                self.rect.equals(&root.rect_calc()),
                "tree rect is not the tight union of the root"
            );
            let total = self.check_node(self.root, 1);
            assert_eq!(total, self.count, "reachable item count mismatch");
        }
    }

    unsafe fn check_node(&self, node: *mut Node<D, C, I, M>, depth: usize) -> usize {
        let node = &*node;
        match node.kind() {
            NodeKind::Leaf => {
                assert_eq!(depth, self.height, "leaves must sit at equal depth");
                node.count()
            }
            NodeKind::Branch => {
                assert!(depth < self.height, "branch below leaf depth");
                let mut total = 0;
                for i in 0..node.count() {
                    let child = &*node.child(i);
                    // Deletion condenses empty nodes only, so the MIN_ITEMS
                    // lower bound is a property of insertion and splits, not
                    // of arbitrary histories.
                    assert!(
                        child.count() >= 1 && child.count() <= M,
                        "non-root entry count out of range: {}",
                        child.count()
                    );
                    assert!(
                        node.rect(i).equals(&child.rect_calc()),
                        "branch rect is not the tight union of its child"
                    );
                    total += self.check_node(node.child(i), depth + 1);
                }
                total
            }
        }
    }
}

unsafe fn node_search<const D: usize, C: Scalar, I, const M: usize, F>(
    node: *const Node<D, C, I, M>,
    rect: &Rect<D, C>,
    iter: &mut F,
) -> bool
where
    F: FnMut(&[C; D], &[C; D], &I) -> bool,
{
    let node = &*node;
    match node.kind() {
        NodeKind::Leaf => {
            for i in 0..node.count() {
                if node.rect(i).intersects(rect) {
                    let r = node.rect(i);
                    if !iter(&r.min, &r.max, node.item(i)) {
                        return false;
                    }
                }
            }
            true
        }
        NodeKind::Branch => {
            for i in 0..node.count() {
                if node.rect(i).intersects(rect) && !node_search(node.child(i), rect, iter) {
                    return false;
                }
            }
            true
        }
    }
}

unsafe fn node_scan<const D: usize, C: Scalar, I, const M: usize, F>(
    node: *const Node<D, C, I, M>,
    iter: &mut F,
) -> bool
where
    F: FnMut(&[C; D], &[C; D], &I) -> bool,
{
    let node = &*node;
    match node.kind() {
        NodeKind::Leaf => {
            for i in 0..node.count() {
                let r = node.rect(i);
                if !iter(&r.min, &r.max, node.item(i)) {
                    return false;
                }
            }
            true
        }
        NodeKind::Branch => {
            for i in 0..node.count() {
                if !node_scan(node.child(i), iter) {
                    return false;
                }
            }
            true
        }
    }
}

impl<const D: usize, C: Scalar, I, const M: usize> Drop for RTree<D, C, I, M> {
    fn drop(&mut self) {
        if !self.root.is_null() {
            unsafe { Node::free(self.root, self.dealloc) };
        }
    }
}

impl<const D: usize, C: Scalar, I, const M: usize> Clone for RTree<D, C, I, M> {
    /// Instant snapshot. The clone shares the whole node graph through the
    /// root's owner counter and gets its own nearest-neighbor queue.
    fn clone(&self) -> Self {
        if !self.root.is_null() {
            unsafe { Node::rc_inc(self.root) };
        }
        Self {
            rect: self.rect,
            root: self.root,
            queue: None,
            count: self.count,
            height: self.height,
            #[cfg(feature = "path-hint")]
            path_hint: self.path_hint,
            relaxed: self.relaxed,
            alloc: self.alloc,
            dealloc: self.dealloc,
        }
    }
}

impl<const D: usize, C: Scalar, I, const M: usize> Default for RTree<D, C, I, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const D: usize, C: Scalar, I, const M: usize> fmt::Debug for RTree<D, C, I, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RTree")
            .field("len", &self.count)
            .field("height", &self.height)
            .field("rect", &self.rect)
            .finish_non_exhaustive()
    }
}
