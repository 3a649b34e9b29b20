//! Tree mutation and traversal.

use crate::cx_checkpoint;
use crate::node::{key_level, Entry, EntryChange, TreeNode};
use crate::store::ObjectStore;
use asupersync::Cx;
use sio_error::Result;
use sio_types::ObjectIdentifier;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// Apply `changes` to the tree at `root`.
///
/// Later changes to the same key win. Returns the new root id and the ids
/// of nodes this call added to the store. Subtrees no change touches are
/// shared with the old tree.
///
/// New nodes are staged and reach the store only once every change is
/// applied, so an interrupted call leaves the store as it was.
pub fn apply_changes(
    cx: &Cx,
    store: &ObjectStore,
    root: &ObjectIdentifier,
    changes: impl IntoIterator<Item = EntryChange>,
) -> Result<(ObjectIdentifier, BTreeSet<ObjectIdentifier>)> {
    cx_checkpoint(cx)?;
    let mut by_key = BTreeMap::new();
    for change in changes {
        by_key.insert(change.entry.key.clone(), change);
    }
    let changes: Vec<EntryChange> = by_key.into_values().collect();

    let mut builder = Builder {
        cx,
        store,
        staged: BTreeMap::new(),
    };
    let new_root = match builder.apply(Some(*root), &changes)? {
        Some(id) => id,
        None => builder.write(&TreeNode {
            level: 0,
            entries: Vec::new(),
            children: vec![None],
        }),
    };
    let new_nodes = builder.flush();
    debug!(
        target: "sio::btree",
        changes = changes.len(),
        new_nodes = new_nodes.len(),
        root = %new_root,
        "tree_apply"
    );
    Ok((new_root, new_nodes))
}

struct Builder<'a> {
    cx: &'a Cx,
    store: &'a ObjectStore,
    /// Encoded nodes built by this call, not yet in the store.
    staged: BTreeMap<ObjectIdentifier, Vec<u8>>,
}

impl Builder<'_> {
    fn write(&mut self, node: &TreeNode) -> ObjectIdentifier {
        let bytes = node.encode();
        let id = ObjectIdentifier::for_bytes(&bytes);
        self.staged.entry(id).or_insert(bytes);
        id
    }

    /// Move staged nodes into the store. Returns the ids that were new to it.
    fn flush(self) -> BTreeSet<ObjectIdentifier> {
        let store = self.store;
        self.staged
            .into_values()
            .filter_map(|bytes| match store.put(bytes) {
                (id, true) => Some(id),
                (_, false) => None,
            })
            .collect()
    }

    /// `changes` is sorted by key and falls inside this subtree's range.
    fn apply(
        &mut self,
        node_id: Option<ObjectIdentifier>,
        changes: &[EntryChange],
    ) -> Result<Option<ObjectIdentifier>> {
        if changes.is_empty() {
            return Ok(node_id);
        }
        cx_checkpoint(self.cx)?;
        let Some(id) = node_id else {
            let entries: Vec<(u8, Entry)> = changes
                .iter()
                .filter(|c| !c.deleted)
                .map(|c| (key_level(&c.entry.key), c.entry.clone()))
                .collect();
            return Ok(self.build(&entries));
        };

        let node = TreeNode::from_id(self.store, &id)?;
        if changes.iter().any(|c| key_level(c.key()) >= node.level) {
            // The change set touches this node's own level or above, so
            // its shape may change: rebuild the subtree.
            let mut merged = BTreeMap::new();
            collect(self.cx, self.store, &id, &mut |entry| {
                merged.insert(entry.key.clone(), entry.clone());
            })?;
            for change in changes {
                if change.deleted {
                    merged.remove(&change.entry.key);
                } else {
                    merged.insert(change.entry.key.clone(), change.entry.clone());
                }
            }
            let entries: Vec<(u8, Entry)> = merged
                .into_values()
                .map(|e| (key_level(&e.key), e))
                .collect();
            trace!(target: "sio::btree", level = node.level, entries = entries.len(), "subtree_rebuild");
            return Ok(self.build(&entries));
        }

        let mut children = node.children.clone();
        let mut rest = changes;
        for (slot, entry) in node.entries.iter().enumerate() {
            let split = rest.partition_point(|c| c.key() < entry.key.as_slice());
            let (here, tail) = rest.split_at(split);
            children[slot] = self.apply(children[slot], here)?;
            rest = tail;
        }
        let last = node.entries.len();
        children[last] = self.apply(children[last], rest)?;

        if children == node.children {
            return Ok(Some(id));
        }
        Ok(Some(self.write(&TreeNode {
            level: node.level,
            entries: node.entries,
            children,
        })))
    }

    /// Canonical subtree for sorted `entries`.
    fn build(&mut self, entries: &[(u8, Entry)]) -> Option<ObjectIdentifier> {
        let level = entries.iter().map(|(level, _)| *level).max()?;
        let mut node_entries = Vec::new();
        let mut children = Vec::new();
        let mut segment_start = 0;
        for (i, (entry_level, entry)) in entries.iter().enumerate() {
            if *entry_level == level {
                children.push(self.build(&entries[segment_start..i]));
                node_entries.push(entry.clone());
                segment_start = i + 1;
            }
        }
        children.push(self.build(&entries[segment_start..]));
        Some(self.write(&TreeNode {
            level,
            entries: node_entries,
            children,
        }))
    }
}

/// Visit every entry of the subtree at `id` in key order.
fn collect(
    cx: &Cx,
    store: &ObjectStore,
    id: &ObjectIdentifier,
    f: &mut dyn FnMut(&Entry),
) -> Result<()> {
    walk(cx, store, id, &[], &mut |entry| {
        f(entry);
        true
    })
    .map(|_| ())
}

/// In-order walk from `min_key`. Returns `false` once `f` asked to stop.
fn walk(
    cx: &Cx,
    store: &ObjectStore,
    id: &ObjectIdentifier,
    min_key: &[u8],
    f: &mut dyn FnMut(&Entry) -> bool,
) -> Result<bool> {
    cx_checkpoint(cx)?;
    let node = TreeNode::from_id(store, id)?;
    let first = node
        .entries
        .partition_point(|e| e.key.as_slice() < min_key);
    if let Some(child) = &node.children[first] {
        if !walk(cx, store, child, min_key, f)? {
            return Ok(false);
        }
    }
    for (slot, entry) in node.entries.iter().enumerate().skip(first) {
        if !f(entry) {
            return Ok(false);
        }
        if let Some(child) = &node.children[slot + 1] {
            if !walk(cx, store, child, min_key, f)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Call `f` on every entry with `key >= min_key`, in key order, until it
/// returns `false`.
pub fn for_each_entry(
    cx: &Cx,
    store: &ObjectStore,
    root: &ObjectIdentifier,
    min_key: &[u8],
    mut f: impl FnMut(&Entry) -> bool,
) -> Result<()> {
    walk(cx, store, root, min_key, &mut f).map(|_| ())
}

/// All entries of the tree, in key order.
pub fn entries(cx: &Cx, store: &ObjectStore, root: &ObjectIdentifier) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    collect(cx, store, root, &mut |entry| out.push(entry.clone()))?;
    Ok(out)
}

/// Find the entry for `key`.
pub fn lookup(
    cx: &Cx,
    store: &ObjectStore,
    root: &ObjectIdentifier,
    key: &[u8],
) -> Result<Option<Entry>> {
    let mut current = *root;
    loop {
        cx_checkpoint(cx)?;
        let node = TreeNode::from_id(store, &current)?;
        match node.entries.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(found) => return Ok(Some(node.entries[found].clone())),
            Err(slot) => match node.children[slot] {
                Some(child) => current = child,
                None => return Ok(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sio_error::SioError;
    use sio_types::KeyPriority;

    fn value(tag: &str) -> ObjectIdentifier {
        ObjectIdentifier::for_bytes(tag.as_bytes())
    }

    fn put(key: &str, tag: &str) -> EntryChange {
        EntryChange::put(key, value(tag), KeyPriority::Eager)
    }

    fn keys(cx: &Cx, store: &ObjectStore, root: &ObjectIdentifier) -> Vec<String> {
        entries(cx, store, root)
            .unwrap()
            .into_iter()
            .map(|e| String::from_utf8(e.key).unwrap())
            .collect()
    }

    #[test]
    fn insert_lookup_delete() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        let (root, new_nodes) =
            apply_changes(&cx, &store, &empty, [put("b", "2"), put("a", "1"), put("c", "3")])
                .unwrap();
        assert!(!new_nodes.is_empty());
        assert_eq!(keys(&cx, &store, &root), vec!["a", "b", "c"]);
        assert_eq!(
            lookup(&cx, &store, &root, b"b").unwrap().unwrap().value,
            value("2")
        );
        assert!(lookup(&cx, &store, &root, b"zz").unwrap().is_none());

        let (root, _) = apply_changes(&cx, &store, &root, [EntryChange::delete("b")]).unwrap();
        assert_eq!(keys(&cx, &store, &root), vec!["a", "c"]);
    }

    #[test]
    fn deleting_everything_yields_the_empty_tree() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        let (root, _) = apply_changes(&cx, &store, &empty, [put("k", "v")]).unwrap();
        let (root, new_nodes) =
            apply_changes(&cx, &store, &root, [EntryChange::delete("k")]).unwrap();
        assert_eq!(root, empty);
        assert!(new_nodes.is_empty());
    }

    #[test]
    fn no_op_changes_keep_the_root_and_create_nothing() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        let (root, _) = apply_changes(&cx, &store, &empty, [put("a", "1"), put("b", "2")]).unwrap();
        let (again, new_nodes) = apply_changes(&cx, &store, &root, [put("a", "1")]).unwrap();
        assert_eq!(again, root);
        assert!(new_nodes.is_empty());
        let (again, _) =
            apply_changes(&cx, &store, &root, [EntryChange::delete("missing")]).unwrap();
        assert_eq!(again, root);
    }

    #[test]
    fn last_change_per_key_wins() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        let (root, _) = apply_changes(
            &cx,
            &store,
            &empty,
            [put("a", "1"), put("a", "2"), EntryChange::delete("b"), put("b", "3")],
        )
        .unwrap();
        let all = entries(&cx, &store, &root).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, value("2"));
        assert_eq!(all[1].value, value("3"));
    }

    #[test]
    fn for_each_entry_starts_at_min_key_and_stops() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        let changes: Vec<_> = (0..200).map(|i| put(&format!("k{i:03}"), "v")).collect();
        let (root, _) = apply_changes(&cx, &store, &empty, changes).unwrap();

        let mut seen = Vec::new();
        for_each_entry(&cx, &store, &root, b"k150", |e| {
            seen.push(String::from_utf8(e.key.clone()).unwrap());
            seen.len() < 5
        })
        .unwrap();
        assert_eq!(seen, vec!["k150", "k151", "k152", "k153", "k154"]);
    }

    #[test]
    fn cancelled_context_interrupts_apply() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        cx.set_cancel_requested(true);
        assert!(matches!(
            apply_changes(&cx, &store, &empty, [put("a", "1")]),
            Err(SioError::Interrupted)
        ));
    }

    #[test]
    fn interrupted_apply_stages_nothing_into_the_store() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        let empty = TreeNode::empty(&store);
        let (root, _) = apply_changes(&cx, &store, &empty, [put("a", "1")]).unwrap();
        let before = store.len();

        let mut builder = Builder {
            cx: &cx,
            store: &store,
            staged: BTreeMap::new(),
        };
        let built: Vec<(u8, Entry)> = ["x", "y", "z"]
            .iter()
            .map(|k| {
                let change = put(k, k);
                (key_level(change.key()), change.entry)
            })
            .collect();
        assert!(builder.build(&built).is_some());
        cx.set_cancel_requested(true);
        assert!(matches!(
            builder.apply(Some(root), &[put("b", "2")]),
            Err(SioError::Interrupted)
        ));
        drop(builder);
        assert_eq!(store.len(), before);
    }

    #[test]
    fn unknown_root_is_not_found() {
        let cx = Cx::for_testing();
        let store = ObjectStore::new();
        assert!(matches!(
            lookup(&cx, &store, &value("nowhere"), b"a"),
            Err(SioError::NotFound(_))
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// The root depends only on the final entry set.
        #[test]
        fn root_is_history_independent(
            keys in proptest::collection::btree_set("[a-z]{1,6}", 1..120),
            split in any::<prop::sample::Index>(),
        ) {
            let cx = Cx::for_testing();
            let store = ObjectStore::new();
            let empty = TreeNode::empty(&store);
            let keys: Vec<String> = keys.into_iter().collect();
            let all: Vec<_> = keys.iter().map(|k| put(k, k)).collect();

            let (one_shot, _) = apply_changes(&cx, &store, &empty, all.clone()).unwrap();

            // Insert in two batches, reverse order, with a transient key.
            let cut = split.index(all.len());
            let mut first: Vec<_> = all[cut..].to_vec();
            first.reverse();
            first.push(put("~transient", "x"));
            let (mid, _) = apply_changes(&cx, &store, &empty, first).unwrap();
            let mut second: Vec<_> = all[..cut].to_vec();
            second.push(EntryChange::delete("~transient"));
            let (incremental, _) = apply_changes(&cx, &store, &mid, second).unwrap();

            prop_assert_eq!(one_shot, incremental);
            let listed: Vec<String> = entries(&cx, &store, &one_shot)
                .unwrap()
                .into_iter()
                .map(|e| String::from_utf8(e.key).unwrap())
                .collect();
            prop_assert_eq!(listed, keys);
        }
    }
}
