//! Unit allocator over an [`AllocatorStorage`] backend.
//!
//! Every mutation follows the same order: validate and grow the pool if
//! needed, change the in-memory map, then stage the affected bitmap blocks
//! and the counters into the caller's transaction. Reservations are
//! consumed only once staging succeeded. Callers serialize mutating transactions against one
//! allocator; the `&mut self` receivers enforce that within a process.

use crate::bitmap::RawBitmap;
use crate::cx_checkpoint;
use crate::storage::{AllocatorStorage, GrowMapFn};
use asupersync::Cx;
use sio_block::{ReadTxn, WriteTxn};
use sio_error::{Result, SioError};

pub struct Allocator<S: AllocatorStorage> {
    storage: S,
    map: RawBitmap,
    grow_map: GrowMapFn,
    reserved: u32,
    /// Next-fit search start.
    hint: u32,
}

impl<S: AllocatorStorage> std::fmt::Debug for Allocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("pool_total", &self.storage.pool_total())
            .field("pool_available", &self.storage.pool_available())
            .field("reserved", &self.reserved)
            .finish_non_exhaustive()
    }
}

impl<S: AllocatorStorage> Allocator<S> {
    /// Wrap a storage backend whose counters already match `map`, e.g.
    /// right after `PersistentStorage::format`.
    pub fn new(storage: S, map: RawBitmap, grow_map: GrowMapFn) -> Result<Self> {
        let used = map.count_allocated();
        if map.len() != storage.pool_total()
            || used != storage.pool_total() - storage.pool_available()
        {
            return Err(SioError::Internal(format!(
                "map ({} units, {used} used) disagrees with storage ({} units, {} free)",
                map.len(),
                storage.pool_total(),
                storage.pool_available()
            )));
        }
        Ok(Self {
            storage,
            map,
            grow_map,
            reserved: 0,
            hint: 0,
        })
    }

    /// Load the persisted map through `txn` and build an allocator on it.
    pub fn load(cx: &Cx, mut storage: S, txn: &mut ReadTxn<'_>, grow_map: GrowMapFn) -> Result<Self> {
        let mut map = RawBitmap::default();
        storage.load(cx, txn, &mut map)?;
        Self::new(storage, map, grow_map)
    }

    #[must_use]
    pub fn pool_total(&self) -> u32 {
        self.storage.pool_total()
    }

    #[must_use]
    pub fn pool_available(&self) -> u32 {
        self.storage.pool_available()
    }

    #[must_use]
    pub fn allocated(&self) -> u32 {
        self.pool_total() - self.pool_available()
    }

    #[must_use]
    pub fn reserved(&self) -> u32 {
        self.reserved
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    #[must_use]
    pub fn map(&self) -> &RawBitmap {
        &self.map
    }

    pub fn is_allocated(&self, unit: u32) -> Result<bool> {
        self.map.get(unit)
    }

    /// Allocated runs as `(start, len)`, ascending.
    #[must_use]
    pub fn allocated_regions(&self) -> Vec<(u32, u32)> {
        self.map.allocated_runs()
    }

    fn unreserved_available(&self) -> u32 {
        self.pool_available().saturating_sub(self.reserved)
    }

    /// Grow once through the storage backend.
    pub fn extend(&mut self, cx: &Cx, txn: &mut WriteTxn) -> Result<()> {
        self.storage
            .extend(cx, txn, &mut self.map, &mut *self.grow_map)
    }

    /// Extend until `count` unreserved units are free.
    fn ensure_available(&mut self, cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<()> {
        while self.unreserved_available() < count {
            self.extend(cx, txn)?;
        }
        Ok(())
    }

    /// Set aside `count` units for later `allocate` calls, growing the pool
    /// if needed.
    pub fn reserve(&mut self, cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<()> {
        if count == 0 {
            return Err(SioError::InvalidArgument(
                "reservation of zero units".to_owned(),
            ));
        }
        self.ensure_available(cx, txn, count)?;
        self.reserved += count;
        tracing::debug!(
            target: "sio::alloc",
            count,
            reserved = self.reserved,
            available = self.pool_available(),
            "units_reserved"
        );
        Ok(())
    }

    /// Return unused reserved units.
    pub fn unreserve(&mut self, count: u32) {
        self.reserved = self.reserved.saturating_sub(count);
    }

    /// Units of a `count`-unit request that the reservation covers.
    fn reserved_share(&self, count: u32) -> u32 {
        count.min(self.reserved)
    }

    /// Mark `start..start + count` allocated and stage it. On failure the
    /// bits are cleared again and restaged, leaving map and counters as
    /// they were.
    fn commit_allocated(&mut self, cx: &Cx, txn: &mut WriteTxn, start: u32, count: u32) -> Result<()> {
        self.map.set_range(start, count)?;
        let staged = self
            .storage
            .persist_range(cx, txn, &self.map, start, count)
            .and_then(|()| self.storage.persist_allocate(cx, txn, count));
        if let Err(err) = staged {
            self.map.clear_range(start, count)?;
            self.storage.persist_range(cx, txn, &self.map, start, count)?;
            return Err(err);
        }
        Ok(())
    }

    /// Allocate one unit. Draws from the reservation first, then grows the
    /// pool if it is exhausted. A failed call leaves the reservation and
    /// the map untouched.
    pub fn allocate(&mut self, cx: &Cx, txn: &mut WriteTxn) -> Result<u32> {
        cx_checkpoint(cx)?;
        let from_reserve = self.reserved_share(1);
        self.ensure_available(cx, txn, 1 - from_reserve)?;
        let Some(unit) = self.map.find_free(self.hint) else {
            return Err(SioError::Internal(
                "free count is positive but bitmap has no free unit".to_owned(),
            ));
        };
        self.commit_allocated(cx, txn, unit, 1)?;
        self.reserved -= from_reserve;
        self.hint = unit + 1;
        tracing::trace!(target: "sio::alloc", unit, "unit_allocated");
        Ok(unit)
    }

    /// Allocate `count` contiguous units and return the first.
    pub fn allocate_range(&mut self, cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<u32> {
        cx_checkpoint(cx)?;
        if count == 0 {
            return Err(SioError::InvalidArgument(
                "allocation of zero units".to_owned(),
            ));
        }
        let from_reserve = self.reserved_share(count);
        self.ensure_available(cx, txn, count - from_reserve)?;
        let start = loop {
            if let Some(start) = self.map.find_contiguous(count) {
                break start;
            }
            // New units land at the end, so each extend can only lengthen
            // the trailing free run.
            self.extend(cx, txn)?;
        };
        self.commit_allocated(cx, txn, start, count)?;
        self.reserved -= from_reserve;
        tracing::debug!(target: "sio::alloc", start, count, "range_allocated");
        Ok(start)
    }

    /// Free one unit. Freeing an already free unit is `Corruption`.
    pub fn free(&mut self, cx: &Cx, txn: &mut WriteTxn, unit: u32) -> Result<()> {
        self.free_range(cx, txn, unit, 1)
    }

    /// Free `count` units starting at `start`. Nothing changes unless every
    /// unit in the range is currently allocated.
    pub fn free_range(&mut self, cx: &Cx, txn: &mut WriteTxn, start: u32, count: u32) -> Result<()> {
        cx_checkpoint(cx)?;
        self.map.check_range(start, count)?;
        for unit in start..start + count {
            if !self.map.get(unit)? {
                tracing::error!(target: "sio::alloc", unit, "double_free");
                return Err(SioError::Corruption {
                    unit: u64::from(unit),
                    detail: "double free: unit already free in bitmap".to_owned(),
                });
            }
        }
        self.map.clear_range(start, count)?;
        let staged = self
            .storage
            .persist_range(cx, txn, &self.map, start, count)
            .and_then(|()| self.storage.persist_release(cx, txn, count));
        if let Err(err) = staged {
            self.map.set_range(start, count)?;
            self.storage.persist_range(cx, txn, &self.map, start, count)?;
            return Err(err);
        }
        if start < self.hint {
            self.hint = start;
        }
        tracing::trace!(target: "sio::alloc", start, count, "units_freed");
        Ok(())
    }
}
