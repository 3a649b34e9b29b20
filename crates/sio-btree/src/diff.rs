//! Two-way and three-way tree diffs.

use crate::cx_checkpoint;
use crate::node::{Entry, EntryChange};
use crate::store::ObjectStore;
use crate::tree::entries;
use asupersync::Cx;
use serde::Serialize;
use sio_error::Result;
use sio_types::ObjectIdentifier;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Changes that turn the tree at `left` into the tree at `right`, in key
/// order. Removals carry the removed entry.
pub fn diff(
    cx: &Cx,
    store: &ObjectStore,
    left: &ObjectIdentifier,
    right: &ObjectIdentifier,
) -> Result<Vec<EntryChange>> {
    cx_checkpoint(cx)?;
    if left == right {
        return Ok(Vec::new());
    }
    let old = entries(cx, store, left)?;
    cx_checkpoint(cx)?;
    let new = entries(cx, store, right)?;

    let mut out = Vec::new();
    let mut old_iter = old.into_iter().peekable();
    let mut new_iter = new.into_iter().peekable();
    loop {
        let order = match (old_iter.peek(), new_iter.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some(a), Some(b)) => a.key.cmp(&b.key),
        };
        match order {
            Ordering::Less => {
                if let Some(gone) = old_iter.next() {
                    out.push(EntryChange::removal(gone));
                }
            }
            Ordering::Greater => {
                if let Some(added) = new_iter.next() {
                    out.push(EntryChange {
                        entry: added,
                        deleted: false,
                    });
                }
            }
            Ordering::Equal => {
                if let (Some(a), Some(b)) = (old_iter.next(), new_iter.next()) {
                    if a != b {
                        out.push(EntryChange {
                            entry: b,
                            deleted: false,
                        });
                    }
                }
            }
        }
    }
    debug!(target: "sio::btree", changes = out.len(), "tree_diff");
    Ok(out)
}

/// One key that changed on at least one side of a three-way diff.
/// `None` means the key is absent in that tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreeWayChange {
    pub base: Option<Entry>,
    pub left: Option<Entry>,
    pub right: Option<Entry>,
}

impl ThreeWayChange {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        self.base
            .as_ref()
            .or(self.left.as_ref())
            .or(self.right.as_ref())
            .map_or(&[][..], |e| e.key.as_slice())
    }

    /// Both sides made the same change.
    #[must_use]
    pub fn is_same_on_both_sides(&self) -> bool {
        self.left == self.right
    }
}

/// Every key whose entry in `left` or `right` differs from `base`, in key
/// order. The side that did not touch a key reports the base entry.
pub fn three_way_diff(
    cx: &Cx,
    store: &ObjectStore,
    base: &ObjectIdentifier,
    left: &ObjectIdentifier,
    right: &ObjectIdentifier,
) -> Result<Vec<ThreeWayChange>> {
    let left_changes = side(diff(cx, store, base, left)?);
    let right_changes = side(diff(cx, store, base, right)?);
    cx_checkpoint(cx)?;
    let base_entries: BTreeMap<Vec<u8>, Entry> = entries(cx, store, base)?
        .into_iter()
        .map(|e| (e.key.clone(), e))
        .collect();

    let keys: BTreeSet<&Vec<u8>> = left_changes.keys().chain(right_changes.keys()).collect();
    let out: Vec<ThreeWayChange> = keys
        .into_iter()
        .map(|key| {
            let base = base_entries.get(key).cloned();
            let left = left_changes.get(key).cloned().unwrap_or_else(|| base.clone());
            let right = right_changes.get(key).cloned().unwrap_or_else(|| base.clone());
            ThreeWayChange { base, left, right }
        })
        .collect();
    debug!(target: "sio::btree", changes = out.len(), "tree_three_way_diff");
    Ok(out)
}

/// Key to resulting entry (`None` for a removal) for one side of a diff.
fn side(changes: Vec<EntryChange>) -> BTreeMap<Vec<u8>, Option<Entry>> {
    changes
        .into_iter()
        .map(|c| {
            let key = c.entry.key.clone();
            (key, (!c.deleted).then_some(c.entry))
        })
        .collect()
}
