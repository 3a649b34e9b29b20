//! Tree nodes, entries and their canonical encoding.
//!
//! ## Shape
//!
//! Every key has a level derived from its blake3 digest: the number of
//! leading zero nibbles. A node holds all keys of one level within its key
//! range, sorted, with `entries.len() + 1` child slots for the ranges in
//! between. Child subtrees only hold lower-level keys. Since the level
//! depends on the key alone, a given entry set has exactly one tree and
//! one root id, whatever order the changes arrived in.
//!
//! ## Encoding
//!
//! ```text
//! [level u8][entry_count u32]
//! entry_count x [key_len u32][key][value 32][priority u8]
//! (entry_count + 1) x [0]  or  [1][child id 32]
//! ```
//!
//! Integers are little-endian.

use crate::store::ObjectStore;
use serde::{Deserialize, Serialize};
use sio_error::{Result, SioError};
use sio_types::{KeyPriority, ObjectIdentifier, DIGEST_LEN};

/// One key/value pair stored in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: ObjectIdentifier,
    pub priority: KeyPriority,
}

impl Entry {
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>, value: ObjectIdentifier, priority: KeyPriority) -> Self {
        Self {
            key: key.into(),
            value,
            priority,
        }
    }
}

/// A buffered mutation: insert/overwrite `entry`, or delete `entry.key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryChange {
    pub entry: Entry,
    pub deleted: bool,
}

impl EntryChange {
    #[must_use]
    pub fn put(key: impl Into<Vec<u8>>, value: ObjectIdentifier, priority: KeyPriority) -> Self {
        Self {
            entry: Entry::new(key, value, priority),
            deleted: false,
        }
    }

    /// Deletion of `key`. The value slot is unused and zeroed.
    #[must_use]
    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            entry: Entry::new(key, ObjectIdentifier([0; DIGEST_LEN]), KeyPriority::Eager),
            deleted: true,
        }
    }

    /// Deletion that remembers the removed entry, as produced by diffs.
    #[must_use]
    pub fn removal(entry: Entry) -> Self {
        Self {
            entry,
            deleted: true,
        }
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.entry.key
    }
}

/// Level of `key` in the tree.
#[must_use]
pub fn key_level(key: &[u8]) -> u8 {
    let digest = blake3::hash(key);
    let mut level = 0_u8;
    for byte in digest.as_bytes() {
        if *byte == 0 {
            level += 2;
            continue;
        }
        if byte >> 4 == 0 {
            level += 1;
        }
        break;
    }
    level
}

/// Decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub level: u8,
    pub entries: Vec<Entry>,
    pub children: Vec<Option<ObjectIdentifier>>,
}

impl TreeNode {
    /// Store the empty node and return its id. This is the root of every
    /// empty tree.
    pub fn empty(store: &ObjectStore) -> ObjectIdentifier {
        Self::empty_node().write(store).0
    }

    fn empty_node() -> Self {
        Self {
            level: 0,
            entries: Vec::new(),
            children: vec![None],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load and decode node `id`.
    pub fn from_id(store: &ObjectStore, id: &ObjectIdentifier) -> Result<Self> {
        let bytes = store.get(id)?;
        Self::decode(&bytes).map_err(|detail| {
            SioError::Internal(format!("malformed tree node {id}: {detail}"))
        })
    }

    /// Encode and store. Returns the id and whether it was new.
    pub fn write(&self, store: &ObjectStore) -> (ObjectIdentifier, bool) {
        store.put(self.encode())
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.entries.len() * 48);
        out.push(self.level);
        out.extend_from_slice(&len_u32(self.entries.len()).to_le_bytes());
        for entry in &self.entries {
            out.extend_from_slice(&len_u32(entry.key.len()).to_le_bytes());
            out.extend_from_slice(&entry.key);
            out.extend_from_slice(entry.value.as_bytes());
            out.push(entry.priority.as_byte());
        }
        for child in &self.children {
            match child {
                Some(id) => {
                    out.push(1);
                    out.extend_from_slice(id.as_bytes());
                }
                None => out.push(0),
            }
        }
        out
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        let mut cur = Cursor { bytes, pos: 0 };
        let level = cur.u8()?;
        let count = cur.u32()? as usize;
        let mut entries = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let key_len = cur.u32()? as usize;
            let key = cur.take(key_len)?.to_vec();
            let value = cur.digest()?;
            let priority_byte = cur.u8()?;
            let priority = KeyPriority::from_byte(priority_byte)
                .ok_or_else(|| format!("bad key priority {priority_byte}"))?;
            entries.push(Entry {
                key,
                value,
                priority,
            });
        }
        let mut children = Vec::with_capacity(count + 1);
        for _ in 0..=count {
            match cur.u8()? {
                0 => children.push(None),
                1 => children.push(Some(cur.digest()?)),
                other => return Err(format!("bad child tag {other}")),
            }
        }
        if cur.pos != bytes.len() {
            return Err(format!("{} trailing bytes", bytes.len() - cur.pos));
        }
        if entries.windows(2).any(|w| w[0].key >= w[1].key) {
            return Err("entries not strictly sorted".to_owned());
        }
        Ok(Self {
            level,
            entries,
            children,
        })
    }
}

fn len_u32(len: usize) -> u32 {
    // Keys and fan-out are far below 4 GiB; saturate rather than wrap.
    u32::try_from(len).unwrap_or(u32::MAX)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| format!("truncated at offset {}", self.pos))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let mut raw = [0_u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn digest(&mut self) -> std::result::Result<ObjectIdentifier, String> {
        let mut raw = [0_u8; DIGEST_LEN];
        raw.copy_from_slice(self.take(DIGEST_LEN)?);
        Ok(ObjectIdentifier(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_node() {
        let node = TreeNode {
            level: 3,
            entries: vec![
                Entry::new("a", ObjectIdentifier::for_bytes(b"1"), KeyPriority::Eager),
                Entry::new("b", ObjectIdentifier::for_bytes(b"2"), KeyPriority::Lazy),
            ],
            children: vec![None, Some(ObjectIdentifier::for_bytes(b"child")), None],
        };
        assert_eq!(TreeNode::decode(&node.encode()).unwrap(), node);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(TreeNode::decode(&[]).is_err());
        assert!(TreeNode::decode(&[0, 1, 0, 0, 0]).is_err());
        let mut bytes = TreeNode::empty_node().encode();
        bytes.push(0);
        assert!(TreeNode::decode(&bytes).is_err());
    }

    #[test]
    fn empty_tree_id_is_stable() {
        let a = ObjectStore::new();
        let b = ObjectStore::new();
        assert_eq!(TreeNode::empty(&a), TreeNode::empty(&b));
        assert!(TreeNode::from_id(&a, &TreeNode::empty(&a)).unwrap().is_empty());
    }

    #[test]
    fn malformed_node_is_internal_error() {
        let store = ObjectStore::new();
        let id = store.add_object(vec![9, 9]);
        assert!(matches!(
            TreeNode::from_id(&store, &id),
            Err(SioError::Internal(_))
        ));
    }

    #[test]
    fn key_levels_are_mostly_zero() {
        let zero = (0..1000)
            .filter(|i| key_level(format!("key-{i}").as_bytes()) == 0)
            .count();
        // Level 0 has probability 15/16.
        assert!(zero > 850, "{zero}");
    }
}
