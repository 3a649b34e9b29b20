#![forbid(unsafe_code)]
//! Identifiers shared across the storage I/O core.
//!
//! Everything here is a plain value type: copyable newtypes that keep
//! stream ids, op ids, block numbers and content digests from being mixed
//! up.

use serde::{Deserialize, Serialize};
use sio_error::{Result, SioError};
use std::fmt;

/// Highest stream priority accepted by the scheduler.
pub const MAX_PRIORITY: u32 = 31;

/// Length in bytes of a content digest.
pub const DIGEST_LEN: usize = 32;

/// Stream identifier, unique among open streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

/// Identifier of a single schedulable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId(pub u64);

/// Device block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

impl BlockNumber {
    /// Add a block count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

/// Validated stream priority in `0..=MAX_PRIORITY`. Larger is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOWEST: Self = Self(0);
    pub const HIGHEST: Self = Self(31);

    /// Create a `Priority` if `value <= MAX_PRIORITY`.
    pub fn new(value: u32) -> Result<Self> {
        if value > MAX_PRIORITY {
            return Err(SioError::InvalidArgument(format!(
                "priority {value} exceeds maximum {MAX_PRIORITY}"
            )));
        }
        u8::try_from(value)
            .map(Self)
            .map_err(|_| SioError::InvalidArgument(format!("priority {value} does not fit u8")))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        u32::from(self.0)
    }
}

/// blake3 digest naming an immutable object (tree node or value blob).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectIdentifier(pub [u8; DIGEST_LEN]);

impl ObjectIdentifier {
    /// Content address of `bytes`.
    #[must_use]
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

/// blake3 digest naming a commit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitId(pub [u8; DIGEST_LEN]);

impl CommitId {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

/// Sync priority of a tree entry's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPriority {
    /// Value is fetched together with the tree.
    Eager,
    /// Value may be fetched on first read.
    Lazy,
}

impl KeyPriority {
    #[must_use]
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Eager => 0,
            Self::Lazy => 1,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Eager),
            1 => Some(Self::Lazy),
            _ => None,
        }
    }
}

fn write_short_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes.iter().take(8) {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_short_hex(f, &self.0)
    }
}

impl fmt::Debug for ObjectIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectIdentifier(")?;
        write_short_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_short_hex(f, &self.0)
    }
}

impl fmt::Debug for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommitId(")?;
        write_short_hex(f, &self.0)?;
        write!(f, ")")
    }
}
