//! Buffered mutations that fold into one commit.

use crate::commit::Commit;
use crate::cx_checkpoint;
use crate::storage::PageStorage;
use asupersync::Cx;
use sio_btree::{apply_changes, EntryChange, TreeNode};
use sio_error::Result;
use sio_types::{CommitId, KeyPriority, ObjectIdentifier};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JournalKind {
    Simple { parent: CommitId },
    /// The left commit's tree is the base the changes apply to.
    Merge { left: CommitId, right: CommitId },
}

/// Result of a commit that produced a new commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub commit: Arc<Commit>,
    /// New objects the commit references that peers have not seen yet.
    pub objects_to_sync: BTreeSet<ObjectIdentifier>,
}

/// Pending changes against one parent (or two, for a merge).
///
/// Changes are last-write-wins per key. [`commit`](Self::commit) consumes
/// the journal, so it can be committed only once.
#[derive(Debug)]
pub struct Journal<'a> {
    storage: &'a PageStorage,
    kind: JournalKind,
    changes: BTreeMap<Vec<u8>, EntryChange>,
    cleared: bool,
}

impl<'a> Journal<'a> {
    pub(crate) fn simple(storage: &'a PageStorage, parent: CommitId) -> Self {
        Self {
            storage,
            kind: JournalKind::Simple { parent },
            changes: BTreeMap::new(),
            cleared: false,
        }
    }

    pub(crate) fn merge(storage: &'a PageStorage, left: CommitId, right: CommitId) -> Self {
        Self {
            storage,
            kind: JournalKind::Merge { left, right },
            changes: BTreeMap::new(),
            cleared: false,
        }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: ObjectIdentifier, priority: KeyPriority) {
        let change = EntryChange::put(key, value, priority);
        trace!(target: "sio::journal", key_len = change.key().len(), "journal_put");
        self.changes.insert(change.entry.key.clone(), change);
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        let change = EntryChange::delete(key);
        trace!(target: "sio::journal", key_len = change.key().len(), "journal_delete");
        self.changes.insert(change.entry.key.clone(), change);
    }

    /// Drop every buffered change and commit onto an empty tree.
    pub fn clear(&mut self) {
        self.changes.clear();
        self.cleared = true;
    }

    /// Record a change produced elsewhere, such as a diff.
    pub fn apply(&mut self, change: EntryChange) {
        if change.deleted {
            self.delete(change.entry.key);
        } else {
            let entry = change.entry;
            self.put(entry.key, entry.value, entry.priority);
        }
    }

    #[must_use]
    pub fn parents(&self) -> Vec<CommitId> {
        match self.kind {
            JournalKind::Simple { parent } => vec![parent],
            JournalKind::Merge { left, right } => vec![left, right],
        }
    }

    #[must_use]
    pub fn is_merge(&self) -> bool {
        matches!(self.kind, JournalKind::Merge { .. })
    }

    #[must_use]
    pub fn is_cleared(&self) -> bool {
        self.cleared
    }

    /// Number of buffered changes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Fold the changes into a new commit and make it a head.
    ///
    /// Returns `None` when a simple journal leaves its parent's tree
    /// unchanged; no commit is created then. Merge journals always commit.
    pub fn commit(self, cx: &Cx) -> Result<Option<CommitOutcome>> {
        cx_checkpoint(cx)?;
        let is_merge = self.is_merge();
        let storage = self.storage;
        let objects = storage.objects();
        let parents: Vec<Arc<Commit>> = self
            .parents()
            .iter()
            .map(|id| storage.get_commit(id))
            .collect::<Result<_>>()?;
        let base = &parents[0];

        let base_root = if self.cleared {
            TreeNode::empty(objects)
        } else {
            base.root()
        };
        let referenced: Vec<ObjectIdentifier> = self
            .changes
            .values()
            .filter(|c| !c.deleted)
            .map(|c| c.entry.value)
            .collect();
        let change_count = self.changes.len();
        // Nothing below can fail once the new nodes are stored.
        let (root, new_nodes) = apply_changes(cx, objects, &base_root, self.changes.into_values())?;

        if !is_merge && root == base.root() {
            debug!(target: "sio::journal", parent = %base.id(), changes = change_count, "journal_commit_elided");
            return Ok(None);
        }

        let generation = parents
            .iter()
            .map(|p| p.generation())
            .max()
            .unwrap_or(0)
            .saturating_add(1);
        let commit = Commit::new(parents.iter().map(|p| p.id()).collect(), root, generation);

        let objects_to_sync: BTreeSet<ObjectIdentifier> = new_nodes
            .into_iter()
            .chain(referenced.into_iter().filter(|id| objects.contains(id)))
            .filter(|id| !objects.is_synced(id))
            .collect();

        let commit = storage.add_commit(commit);
        debug!(
            target: "sio::journal",
            commit = %commit.id(),
            generation,
            parents = commit.parents().len(),
            changes = change_count,
            objects_to_sync = objects_to_sync.len(),
            "journal_commit"
        );
        Ok(Some(CommitOutcome {
            commit,
            objects_to_sync,
        }))
    }
}
