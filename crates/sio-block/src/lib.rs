#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the `BlockDevice` trait with a `&Cx` cancellation context on
//! every call, an in-memory and a file-backed device, and the two
//! transaction objects the allocator consumes:
//!
//! - [`ReadTxn`] batches block reads and executes them in one `transact`.
//! - [`WriteTxn`] collects block images. The core only appends to it; the
//!   owning filesystem layer decides when to [`apply`](WriteTxn::apply) it.

pub mod txn;

pub use txn::{ReadTxn, WriteTxn};

use asupersync::Cx;
use parking_lot::Mutex;
use sio_error::{Result, SioError};
use sio_types::BlockNumber;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Device block size in bytes.
    fn block_size(&self) -> u32;

    /// Total number of blocks.
    fn block_count(&self) -> u64;

    /// Flush pending writes to stable storage.
    fn sync(&self, cx: &Cx) -> Result<()>;
}

fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SioError::Interrupted)
}

fn block_size_usize(block_size: u32) -> Result<usize> {
    usize::try_from(block_size)
        .map_err(|_| SioError::InvalidArgument("block_size does not fit usize".to_owned()))
}

fn check_range(block: BlockNumber, block_count: u64) -> Result<()> {
    if block.0 >= block_count {
        return Err(SioError::OutOfRange {
            index: block.0,
            total: block_count,
        });
    }
    Ok(())
}

// ── Memory device ───────────────────────────────────────────────────────────

/// Sparse in-memory block device. Unwritten blocks read as zeroes.
///
/// Clones share the same backing map, so a test can keep a handle while
/// handing another to the code under test.
#[derive(Debug, Clone)]
pub struct MemBlockDevice {
    blocks: Arc<Mutex<HashMap<BlockNumber, Vec<u8>>>>,
    block_size: u32,
    block_count: u64,
}

impl MemBlockDevice {
    #[must_use]
    pub fn new(block_size: u32, block_count: u64) -> Self {
        Self {
            blocks: Arc::new(Mutex::new(HashMap::new())),
            block_size,
            block_count,
        }
    }

    /// Number of blocks that have been written at least once.
    #[must_use]
    pub fn written_blocks(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        check_range(block, self.block_count)?;
        let bs = block_size_usize(self.block_size)?;
        let data = self
            .blocks
            .lock()
            .get(&block)
            .cloned()
            .unwrap_or_else(|| vec![0_u8; bs]);
        Ok(BlockBuf::new(data))
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        check_range(block, self.block_count)?;
        let expected = block_size_usize(self.block_size)?;
        if data.len() != expected {
            return Err(SioError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        self.blocks.lock().insert(block, data.to_vec());
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)
    }
}

// ── File device ─────────────────────────────────────────────────────────────

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// `FileExt` is thread-safe and does not need a shared seek position, so
/// concurrent workers can issue I/O through one handle.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    block_size: u32,
    block_count: u64,
}

impl FileBlockDevice {
    /// Open an existing image. Its length must be a multiple of `block_size`.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(SioError::InvalidArgument(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let len = file.metadata()?.len();
        let block_size_u64 = u64::from(block_size);
        if len % block_size_u64 != 0 {
            return Err(SioError::InvalidArgument(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size}"
            )));
        }
        Ok(Self {
            file: Arc::new(file),
            block_size,
            block_count: len / block_size_u64,
        })
    }

    /// Create (or truncate) an image of `block_count` zeroed blocks.
    pub fn create(path: impl AsRef<Path>, block_size: u32, block_count: u64) -> Result<Self> {
        let len = u64::from(block_size)
            .checked_mul(block_count)
            .ok_or_else(|| SioError::InvalidArgument("image length overflows u64".to_owned()))?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len)?;
        drop(file);
        Self::open(path, block_size)
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        check_range(block, self.block_count)?;
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| SioError::InvalidArgument("block offset overflow".to_owned()))
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_block(&self, cx: &Cx, block: BlockNumber) -> Result<BlockBuf> {
        cx_checkpoint(cx)?;
        let offset = self.offset_of(block)?;
        let mut buf = vec![0_u8; block_size_usize(self.block_size)?];
        self.file.read_exact_at(&mut buf, offset)?;
        cx_checkpoint(cx)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, cx: &Cx, block: BlockNumber, data: &[u8]) -> Result<()> {
        cx_checkpoint(cx)?;
        let expected = block_size_usize(self.block_size)?;
        if data.len() != expected {
            return Err(SioError::InvalidArgument(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.file.write_all_at(data, offset)?;
        cx_checkpoint(cx)?;
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self, cx: &Cx) -> Result<()> {
        cx_checkpoint(cx)?;
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_device_reads_zero_for_unwritten_blocks() {
        let cx = Cx::for_testing();
        let dev = MemBlockDevice::new(512, 8);
        let buf = dev.read_block(&cx, BlockNumber(3)).unwrap();
        assert_eq!(buf.as_slice(), &[0_u8; 512]);
        assert_eq!(dev.written_blocks(), 0);
    }

    #[test]
    fn mem_device_write_then_read() {
        let cx = Cx::for_testing();
        let dev = MemBlockDevice::new(512, 8);
        dev.write_block(&cx, BlockNumber(2), &[0xAB; 512]).unwrap();
        assert_eq!(
            dev.read_block(&cx, BlockNumber(2)).unwrap().as_slice(),
            &[0xAB; 512]
        );
    }

    #[test]
    fn mem_device_rejects_out_of_range_and_bad_sizes() {
        let cx = Cx::for_testing();
        let dev = MemBlockDevice::new(512, 8);
        assert!(matches!(
            dev.read_block(&cx, BlockNumber(8)),
            Err(SioError::OutOfRange { index: 8, total: 8 })
        ));
        assert!(matches!(
            dev.write_block(&cx, BlockNumber(0), &[0; 100]),
            Err(SioError::InvalidArgument(_))
        ));
    }

    #[test]
    fn cancelled_context_interrupts_io() {
        let cx = Cx::for_testing();
        let dev = MemBlockDevice::new(512, 8);
        cx.set_cancel_requested(true);
        assert!(matches!(
            dev.read_block(&cx, BlockNumber(0)),
            Err(SioError::Interrupted)
        ));
    }

    #[test]
    fn file_device_round_trips() {
        let cx = Cx::for_testing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.img");
        let dev = FileBlockDevice::create(&path, 4096, 4).unwrap();
        assert_eq!(dev.block_count(), 4);

        dev.write_block(&cx, BlockNumber(1), &[0x42; 4096]).unwrap();
        dev.sync(&cx).unwrap();

        let reopened = FileBlockDevice::open(&path, 4096).unwrap();
        assert_eq!(
            reopened.read_block(&cx, BlockNumber(1)).unwrap().as_slice(),
            &[0x42; 4096]
        );
        assert_eq!(
            reopened.read_block(&cx, BlockNumber(0)).unwrap().as_slice(),
            &[0; 4096]
        );
    }

    #[test]
    fn file_device_rejects_unaligned_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0_u8; 1000]).unwrap();
        assert!(FileBlockDevice::open(&path, 512).is_err());
        assert!(FileBlockDevice::open(&path, 1000).is_err());
    }
}
