#![forbid(unsafe_code)]
//! Content-addressed, history-independent B-tree.
//!
//! Keys are byte strings mapped to [`ObjectIdentifier`]s. Nodes are stored
//! in an [`ObjectStore`] under the blake3 digest of their encoding, so a
//! tree is named by its root id and unchanged subtrees are shared between
//! versions.
//!
//! The shape of a tree depends only on its entry set (see [`node`]), which
//! gives two useful equalities:
//!
//! - applying changes that cancel out returns the original root id;
//! - two ways of reaching the same entries produce the same root id.
//!
//! [`ObjectIdentifier`]: sio_types::ObjectIdentifier

pub mod diff;
pub mod node;
pub mod store;
pub mod tree;

use asupersync::Cx;
use sio_error::{Result, SioError};

pub use diff::{diff, three_way_diff, ThreeWayChange};
pub use node::{key_level, Entry, EntryChange, TreeNode};
pub use store::ObjectStore;
pub use tree::{apply_changes, entries, for_each_entry, lookup};

// ── Helpers ─────────────────────────────────────────────────────────────────

pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SioError::Interrupted)
}
