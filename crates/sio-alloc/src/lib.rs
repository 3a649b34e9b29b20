#![forbid(unsafe_code)]
//! Persistent bitmap allocator.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation plus [`RawBitmap`], the growable
//!    in-memory map.
//! 2. **Storage**: the [`AllocatorStorage`] trait and its block-backed
//!    implementation [`PersistentStorage`], which owns the pool counters
//!    and stages bitmap and metadata blocks into a [`WriteTxn`].
//! 3. **Allocator**: [`Allocator`] ties a map to a storage backend and
//!    adds reservations, next-fit single-unit and contiguous allocation,
//!    double-free detection and growth on exhaustion.
//!
//! The pool never shrinks. `pool_available() + allocated == pool_total()`
//! holds after every completed call.
//!
//! [`WriteTxn`]: sio_block::WriteTxn

pub mod allocator;
pub mod bitmap;
pub mod storage;

use asupersync::Cx;
use sio_error::{Result, SioError};

pub use allocator::Allocator;
pub use bitmap::{
    bitmap_clear, bitmap_count_free, bitmap_find_free, bitmap_get, bitmap_set, bytes_for_units,
    RawBitmap,
};
pub use storage::{AllocatorLayout, AllocatorStorage, GrowMapFn, PersistentStorage};

// ── Helpers ─────────────────────────────────────────────────────────────────

pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SioError::Interrupted)
}
