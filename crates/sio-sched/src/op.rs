//! Schedulable operations and the reorder policy.

use serde::{Deserialize, Serialize};
use sio_error::{Result, SioError};
use sio_types::{OpId, StreamId};
use std::ops::BitOr;

/// Opcode class. Reordering decisions only look at the class and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpClass {
    Read,
    Write,
    /// Flush, trim and anything else that must stay in submission order.
    Flush,
}

/// A single I/O request bound to a stream.
///
/// Ownership moves with the op: the client builds it, hands it to
/// [`Scheduler::enqueue`](crate::Scheduler::enqueue), receives it back from
/// [`SchedulerClient::issue`](crate::SchedulerClient::issue), and gets it
/// for good in [`SchedulerClient::release`](crate::SchedulerClient::release).
#[derive(Debug)]
pub struct StreamOp {
    pub id: OpId,
    pub stream: StreamId,
    pub class: OpClass,
    /// Device offset in blocks.
    pub offset: u64,
    /// Length in blocks.
    pub length: u32,
    /// Write payload or read destination.
    pub data: Vec<u8>,
    result: Option<Result<()>>,
}

impl StreamOp {
    #[must_use]
    pub fn new(id: OpId, stream: StreamId, class: OpClass, offset: u64, length: u32) -> Self {
        Self {
            id,
            stream,
            class,
            offset,
            length,
            data: Vec::new(),
            result: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Record the completion status.
    pub fn set_result(&mut self, result: Result<()>) {
        self.result = Some(result);
    }

    #[must_use]
    pub fn result(&self) -> Option<&Result<()>> {
        self.result.as_ref()
    }

    pub fn take_result(&mut self) -> Option<Result<()>> {
        self.result.take()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

/// Bit set selecting which same-stream reorderings are allowed.
///
/// The policy is applied when an op is inserted into its stream, so the
/// pending list is always in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ReorderOptions(u32);

impl ReorderOptions {
    /// Strict FIFO within every stream.
    pub const NONE: Self = Self(0);
    /// A read may pass an earlier read at a higher offset.
    pub const READS_AMONG_READS: Self = Self(1 << 0);
    /// A write may pass an earlier write at a higher offset.
    pub const WRITES_AMONG_WRITES: Self = Self(1 << 1);
    /// A read may pass earlier writes.
    pub const READS_AHEAD_OF_WRITES: Self = Self(1 << 2);
    /// A write may pass earlier reads.
    pub const WRITES_AHEAD_OF_READS: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    /// Validate a raw mask. Unknown bits are rejected.
    pub fn from_bits(bits: u32) -> Result<Self> {
        if bits & !Self::ALL.0 != 0 {
            return Err(SioError::InvalidArgument(format!(
                "unknown reorder option bits {bits:#x}"
            )));
        }
        Ok(Self(bits))
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `incoming` may be placed ahead of the already queued `queued`.
    #[must_use]
    pub fn may_pass(self, incoming: &StreamOp, queued: &StreamOp) -> bool {
        match (incoming.class, queued.class) {
            (OpClass::Read, OpClass::Read) => {
                self.contains(Self::READS_AMONG_READS) && incoming.offset < queued.offset
            }
            (OpClass::Write, OpClass::Write) => {
                self.contains(Self::WRITES_AMONG_WRITES) && incoming.offset < queued.offset
            }
            (OpClass::Read, OpClass::Write) => self.contains(Self::READS_AHEAD_OF_WRITES),
            (OpClass::Write, OpClass::Read) => self.contains(Self::WRITES_AHEAD_OF_READS),
            (OpClass::Flush, _) | (_, OpClass::Flush) => false,
        }
    }
}

impl TryFrom<u32> for ReorderOptions {
    type Error = SioError;

    fn try_from(bits: u32) -> Result<Self> {
        Self::from_bits(bits)
    }
}

impl From<ReorderOptions> for u32 {
    fn from(options: ReorderOptions) -> Self {
        options.0
    }
}

impl BitOr for ReorderOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}
