//! Read and write transaction objects.
//!
//! A `WriteTxn` is an ordered set of whole-block images keyed by block
//! number. Writing the same block twice keeps only the newer image, which
//! lets the allocator re-persist its metadata block after every mutation
//! without growing the transaction. Applying a transaction is the caller's
//! business; nothing in the core commits one.

use crate::BlockDevice;
use asupersync::Cx;
use sio_error::{Result, SioError};
use sio_types::BlockNumber;
use std::collections::BTreeMap;

/// Batched block writes, applied atomically by the owning layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteTxn {
    writes: BTreeMap<BlockNumber, Vec<u8>>,
}

impl WriteTxn {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a full block image. Replaces any earlier image for `block`.
    pub fn enqueue(&mut self, block: BlockNumber, data: Vec<u8>) {
        tracing::trace!(
            target: "sio::txn",
            block = block.0,
            len = data.len(),
            "write_txn_enqueue"
        );
        self.writes.insert(block, data);
    }

    /// Staged image for `block`, if any.
    #[must_use]
    pub fn staged(&self, block: BlockNumber) -> Option<&[u8]> {
        self.writes.get(&block).map(Vec::as_slice)
    }

    /// Blocks touched by this transaction, ascending.
    pub fn blocks(&self) -> impl Iterator<Item = BlockNumber> + '_ {
        self.writes.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Write every staged block to `dev` in block order, then sync.
    ///
    /// Returns the number of blocks written.
    pub fn apply(self, cx: &Cx, dev: &dyn BlockDevice) -> Result<usize> {
        let count = self.writes.len();
        for (block, data) in self.writes {
            dev.write_block(cx, block, &data)?;
        }
        dev.sync(cx)?;
        tracing::debug!(target: "sio::txn", blocks = count, "write_txn_applied");
        Ok(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadRequest {
    block: BlockNumber,
    count: u64,
}

/// Batched block reads against one device.
pub struct ReadTxn<'a> {
    dev: &'a dyn BlockDevice,
    requests: Vec<ReadRequest>,
}

impl std::fmt::Debug for ReadTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTxn")
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl<'a> ReadTxn<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice) -> Self {
        Self {
            dev,
            requests: Vec::new(),
        }
    }

    /// Queue `count` consecutive blocks starting at `block`.
    pub fn enqueue(&mut self, block: BlockNumber, count: u64) {
        self.requests.push(ReadRequest { block, count });
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.dev.block_size()
    }

    /// Execute every queued request in order and return the concatenated
    /// block contents. The queue is empty afterwards.
    pub fn transact(&mut self, cx: &Cx) -> Result<Vec<u8>> {
        let requests = std::mem::take(&mut self.requests);
        let mut out = Vec::new();
        for req in requests {
            for i in 0..req.count {
                let block = req.block.checked_add(i).ok_or_else(|| {
                    SioError::InvalidArgument("read request overflows block address".to_owned())
                })?;
                out.extend_from_slice(self.dev.read_block(cx, block)?.as_slice());
            }
        }
        Ok(out)
    }
}
