//! Persistence backend for allocation maps.
//!
//! ## On-disk layout
//!
//! ```text
//! meta_block:    [magic 8][version u32][pool_total u32][allocated u32][crc32c u32][zero pad]
//! bitmap_start:  bitmap bytes, block after block, zero padded
//! ```
//!
//! All integers are little-endian. The checksum covers the 20 bytes before
//! it. Nothing here writes to a device: every mutation is staged into the
//! caller's [`WriteTxn`], after the in-memory map has already changed.
//! Staging itself cannot fail once its arguments are validated.

use crate::bitmap::{bytes_for_units, RawBitmap};
use crate::cx_checkpoint;
use asupersync::Cx;
use serde::{Deserialize, Serialize};
use sio_block::{ReadTxn, WriteTxn};
use sio_error::{Result, SioError};
use sio_types::BlockNumber;

const META_MAGIC: [u8; 8] = *b"SIOALLOC";
const META_VERSION: u32 = 1;
const META_CRC_OFFSET: usize = 20;
const META_LEN: usize = 24;

/// Where an allocation pool keeps its state on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorLayout {
    pub meta_block: u64,
    pub bitmap_start: u64,
    /// Bitmap blocks reserved for growth. Extending past them fails with
    /// `NoSpace`.
    pub bitmap_blocks_max: u64,
    /// Units added by one `extend`.
    pub units_per_extend: u32,
}

impl Default for AllocatorLayout {
    fn default() -> Self {
        Self {
            meta_block: 0,
            bitmap_start: 1,
            bitmap_blocks_max: 16,
            units_per_extend: 1024,
        }
    }
}

/// Pool growth hook supplied by the owning filesystem.
///
/// Called with the proposed unit count; grows the backing extent and
/// returns the previous unit count.
pub type GrowMapFn = Box<dyn FnMut(u32) -> Result<u32> + Send>;

/// Persistence operations an allocator needs from its backend.
///
/// Implementations only stage writes; committing the transaction is the
/// caller's job. The staging calls (`persist_*`) validate their arguments
/// before touching the transaction and do not poll `cx`, so a failed call
/// stages nothing and a caller that checkpointed before mutating can
/// always restage a rolled-back range.
pub trait AllocatorStorage: Send {
    /// Replace `map` with the persisted image and adopt its counters.
    fn load(&mut self, cx: &Cx, txn: &mut ReadTxn<'_>, map: &mut RawBitmap) -> Result<()>;

    /// Grow the pool through `grow_map`. On any error the map and the
    /// counters are unchanged.
    fn extend(
        &mut self,
        cx: &Cx,
        txn: &mut WriteTxn,
        map: &mut RawBitmap,
        grow_map: &mut dyn FnMut(u32) -> Result<u32>,
    ) -> Result<()>;

    fn pool_available(&self) -> u32;

    fn pool_total(&self) -> u32;

    /// Stage the blocks holding bits `index..index + count`.
    fn persist_range(
        &mut self,
        cx: &Cx,
        txn: &mut WriteTxn,
        map: &RawBitmap,
        index: u32,
        count: u32,
    ) -> Result<()>;

    /// Record `count` newly allocated units.
    fn persist_allocate(&mut self, cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<()>;

    /// Record `count` released units.
    fn persist_release(&mut self, cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<()>;
}

/// Block-backed [`AllocatorStorage`].
#[derive(Debug, Clone)]
pub struct PersistentStorage {
    layout: AllocatorLayout,
    block_size: u32,
    pool_total: u32,
    allocated: u32,
}

impl PersistentStorage {
    pub fn new(layout: AllocatorLayout, block_size: u32) -> Result<Self> {
        if (block_size as usize) < META_LEN {
            return Err(SioError::InvalidArgument(format!(
                "block_size {block_size} cannot hold allocator metadata"
            )));
        }
        if layout.units_per_extend == 0 {
            return Err(SioError::InvalidArgument(
                "units_per_extend must be at least 1".to_owned(),
            ));
        }
        let bitmap_end = layout
            .bitmap_start
            .checked_add(layout.bitmap_blocks_max)
            .ok_or_else(|| SioError::InvalidArgument("bitmap region overflows".to_owned()))?;
        if (layout.bitmap_start..bitmap_end).contains(&layout.meta_block) {
            return Err(SioError::InvalidArgument(
                "metadata block overlaps bitmap region".to_owned(),
            ));
        }
        Ok(Self {
            layout,
            block_size,
            pool_total: 0,
            allocated: 0,
        })
    }

    #[must_use]
    pub fn layout(&self) -> &AllocatorLayout {
        &self.layout
    }

    /// Units covered by the bitmap region at its maximum size.
    #[must_use]
    pub fn max_units(&self) -> u64 {
        self.layout
            .bitmap_blocks_max
            .saturating_mul(u64::from(self.block_size))
            .saturating_mul(8)
    }

    /// Initialize a fresh pool of `pool_total` free units.
    pub fn format(
        &mut self,
        cx: &Cx,
        txn: &mut WriteTxn,
        map: &mut RawBitmap,
        pool_total: u32,
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        if u64::from(pool_total) > self.max_units() {
            return Err(SioError::NoSpace);
        }
        *map = RawBitmap::new(pool_total);
        self.pool_total = pool_total;
        self.allocated = 0;
        if pool_total > 0 {
            self.persist_range(cx, txn, map, 0, pool_total)?;
        }
        self.write_meta(txn);
        tracing::info!(target: "sio::alloc", pool_total, "allocator_formatted");
        Ok(())
    }

    fn bitmap_blocks_for(&self, units: u32) -> u64 {
        (bytes_for_units(units) as u64).div_ceil(u64::from(self.block_size))
    }

    /// Stage the blocks holding bits `index..index + count`. The range must
    /// already be checked against `map`.
    fn stage_bitmap(&self, txn: &mut WriteTxn, map: &RawBitmap, index: u32, count: u32) {
        if count == 0 {
            return;
        }
        let bs = self.block_size as usize;
        let first_byte = (index / 8) as usize;
        let last_byte = ((index + count - 1) / 8) as usize;
        let bytes = map.as_bytes();
        for rel in first_byte / bs..=last_byte / bs {
            let start = rel * bs;
            let end = (start + bs).min(bytes.len());
            let mut block = vec![0_u8; bs];
            block[..end - start].copy_from_slice(&bytes[start..end]);
            txn.enqueue(BlockNumber(self.layout.bitmap_start + rel as u64), block);
        }
        tracing::trace!(target: "sio::alloc", index, count, "bitmap_staged");
    }

    fn write_meta(&self, txn: &mut WriteTxn) {
        let mut block = vec![0_u8; self.block_size as usize];
        block[..8].copy_from_slice(&META_MAGIC);
        block[8..12].copy_from_slice(&META_VERSION.to_le_bytes());
        block[12..16].copy_from_slice(&self.pool_total.to_le_bytes());
        block[16..20].copy_from_slice(&self.allocated.to_le_bytes());
        let crc = crc32c::crc32c(&block[..META_CRC_OFFSET]);
        block[META_CRC_OFFSET..META_LEN].copy_from_slice(&crc.to_le_bytes());
        txn.enqueue(BlockNumber(self.layout.meta_block), block);
    }

    fn corrupt(&self, detail: impl Into<String>) -> SioError {
        SioError::Corruption {
            unit: self.layout.meta_block,
            detail: detail.into(),
        }
    }

    fn decode_meta(&self, bytes: &[u8]) -> Result<(u32, u32)> {
        if bytes.len() < META_LEN {
            return Err(self.corrupt("metadata block truncated"));
        }
        if bytes[..8] != META_MAGIC {
            return Err(self.corrupt("bad allocator magic"));
        }
        let stored_crc = read_u32(bytes, META_CRC_OFFSET);
        let computed = crc32c::crc32c(&bytes[..META_CRC_OFFSET]);
        if stored_crc != computed {
            return Err(self.corrupt(format!(
                "metadata checksum mismatch: stored={stored_crc:#010x} computed={computed:#010x}"
            )));
        }
        let version = read_u32(bytes, 8);
        if version != META_VERSION {
            return Err(self.corrupt(format!("unsupported metadata version {version}")));
        }
        let pool_total = read_u32(bytes, 12);
        let allocated = read_u32(bytes, 16);
        if allocated > pool_total {
            return Err(self.corrupt(format!(
                "allocated {allocated} exceeds pool_total {pool_total}"
            )));
        }
        if u64::from(pool_total) > self.max_units() {
            return Err(self.corrupt(format!(
                "pool_total {pool_total} exceeds bitmap region"
            )));
        }
        Ok((pool_total, allocated))
    }
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut raw = [0_u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

impl AllocatorStorage for PersistentStorage {
    fn load(&mut self, cx: &Cx, txn: &mut ReadTxn<'_>, map: &mut RawBitmap) -> Result<()> {
        cx_checkpoint(cx)?;
        if txn.block_size() != self.block_size {
            return Err(SioError::InvalidArgument(format!(
                "device block_size {} does not match allocator block_size {}",
                txn.block_size(),
                self.block_size
            )));
        }
        txn.enqueue(BlockNumber(self.layout.meta_block), 1);
        let meta = txn.transact(cx)?;
        let (pool_total, allocated) = self.decode_meta(&meta)?;

        cx_checkpoint(cx)?;
        let blocks = self.bitmap_blocks_for(pool_total);
        let loaded = if blocks == 0 {
            RawBitmap::new(0)
        } else {
            txn.enqueue(BlockNumber(self.layout.bitmap_start), blocks);
            RawBitmap::from_bytes(txn.transact(cx)?, pool_total)?
        };
        let counted = loaded.count_allocated();
        if counted != allocated {
            return Err(SioError::Corruption {
                unit: self.layout.bitmap_start,
                detail: format!("bitmap marks {counted} units allocated, metadata says {allocated}"),
            });
        }

        *map = loaded;
        self.pool_total = pool_total;
        self.allocated = allocated;
        tracing::debug!(
            target: "sio::alloc",
            pool_total,
            allocated,
            bitmap_blocks = blocks,
            "allocator_loaded"
        );
        Ok(())
    }

    fn extend(
        &mut self,
        cx: &Cx,
        txn: &mut WriteTxn,
        map: &mut RawBitmap,
        grow_map: &mut dyn FnMut(u32) -> Result<u32>,
    ) -> Result<()> {
        cx_checkpoint(cx)?;
        let old_total = self.pool_total;
        if map.len() != old_total {
            return Err(SioError::Internal(format!(
                "map holds {} units, pool_total is {old_total}",
                map.len()
            )));
        }
        let Some(new_total) = old_total.checked_add(self.layout.units_per_extend) else {
            tracing::warn!(target: "sio::alloc", old_total, "extend_refused_overflow");
            return Err(SioError::NoSpace);
        };
        if u64::from(new_total) > self.max_units() {
            tracing::warn!(
                target: "sio::alloc",
                old_total,
                new_total,
                max_units = self.max_units(),
                "extend_refused_bitmap_full"
            );
            return Err(SioError::NoSpace);
        }

        let reported_old = grow_map(new_total).map_err(|err| {
            tracing::warn!(target: "sio::alloc", new_total, error = %err, "grow_map_failed");
            err
        })?;
        if reported_old != old_total {
            return Err(SioError::Internal(format!(
                "grow_map reported old size {reported_old}, allocator had {old_total}"
            )));
        }

        // The extent has grown. Nothing below fails: new_total > map.len().
        map.grow(new_total)?;
        self.pool_total = new_total;
        self.stage_bitmap(txn, map, old_total, new_total - old_total);
        self.write_meta(txn);
        tracing::info!(target: "sio::alloc", old_total, new_total, "allocator_extended");
        Ok(())
    }

    fn pool_available(&self) -> u32 {
        self.pool_total - self.allocated
    }

    fn pool_total(&self) -> u32 {
        self.pool_total
    }

    fn persist_range(
        &mut self,
        _cx: &Cx,
        txn: &mut WriteTxn,
        map: &RawBitmap,
        index: u32,
        count: u32,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        map.check_range(index, count)?;
        self.stage_bitmap(txn, map, index, count);
        Ok(())
    }

    fn persist_allocate(&mut self, _cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<()> {
        if count > self.pool_available() {
            return Err(SioError::Internal(format!(
                "persist_allocate({count}) with only {} units available",
                self.pool_available()
            )));
        }
        self.allocated += count;
        self.write_meta(txn);
        Ok(())
    }

    fn persist_release(&mut self, _cx: &Cx, txn: &mut WriteTxn, count: u32) -> Result<()> {
        if count > self.allocated {
            return Err(SioError::Internal(format!(
                "persist_release({count}) with only {} units allocated",
                self.allocated
            )));
        }
        self.allocated -= count;
        self.write_meta(txn);
        Ok(())
    }
}
