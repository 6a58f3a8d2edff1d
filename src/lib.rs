#![doc = include_str!("../README.md")]

pub mod rect;
pub mod rtree;

pub use rect::{Rect, Scalar};
pub use rtree::{AllocFn, DeallocFn, RTree, RTreeError, DEFAULT_MAX_ITEMS};
