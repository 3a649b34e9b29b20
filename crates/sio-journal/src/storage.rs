//! Commit graph and head tracking for one page.

use crate::commit::Commit;
use crate::cx_checkpoint;
use crate::journal::{CommitOutcome, Journal};
use asupersync::Cx;
use parking_lot::RwLock;
use serde::Serialize;
use sio_btree::{Entry, EntryChange, ObjectStore, ThreeWayChange, TreeNode};
use sio_error::{Result, SioError};
use sio_types::{CommitId, ObjectIdentifier};
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// How two commits relate in the commit graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommitRelation {
    Same,
    /// The first commit is an ancestor of the second.
    Ancestor,
    /// The first commit descends from the second.
    Descendant,
    Diverged,
}

/// How the changes behind two commits compare. Only non-merge commits
/// count as changes, so two merges of the same parents are equivalent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeComparison {
    Equivalent,
    /// Every change behind the left commit is also behind the right one.
    LeftSubsetOfRight,
    RightSubsetOfLeft,
    Unordered,
}

#[derive(Debug, Default)]
struct Graph {
    commits: HashMap<CommitId, Arc<Commit>>,
    heads: BTreeSet<CommitId>,
    /// Merge commits keyed by their sorted parent pair.
    merges: HashMap<(CommitId, CommitId), BTreeSet<CommitId>>,
}

/// Object store plus the commit graph built on top of it.
///
/// Starts with a single parentless commit holding the empty tree. Every
/// added commit replaces its parents in the head set.
#[derive(Debug)]
pub struct PageStorage {
    objects: ObjectStore,
    graph: RwLock<Graph>,
    first: Arc<Commit>,
}

impl Default for PageStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStorage {
    #[must_use]
    pub fn new() -> Self {
        let objects = ObjectStore::new();
        let first = Arc::new(Commit::root_commit(TreeNode::empty(&objects)));
        let mut graph = Graph::default();
        graph.commits.insert(first.id(), Arc::clone(&first));
        graph.heads.insert(first.id());
        Self {
            objects,
            graph: RwLock::new(graph),
            first,
        }
    }

    #[must_use]
    pub fn objects(&self) -> &ObjectStore {
        &self.objects
    }

    /// Store a value blob.
    pub fn add_object(&self, bytes: impl Into<Vec<u8>>) -> ObjectIdentifier {
        self.objects.add_object(bytes)
    }

    #[must_use]
    pub fn objects_to_sync(&self) -> BTreeSet<ObjectIdentifier> {
        self.objects.unsynced()
    }

    pub fn mark_synced(&self, ids: &BTreeSet<ObjectIdentifier>) {
        self.objects.mark_synced(ids);
    }

    #[must_use]
    pub fn first_commit(&self) -> Arc<Commit> {
        Arc::clone(&self.first)
    }

    pub fn get_commit(&self, id: &CommitId) -> Result<Arc<Commit>> {
        self.graph
            .read()
            .commits
            .get(id)
            .cloned()
            .ok_or_else(|| SioError::NotFound(format!("commit {id}")))
    }

    /// Current heads, oldest first.
    #[must_use]
    pub fn head_commits(&self) -> Vec<Arc<Commit>> {
        let graph = self.graph.read();
        let mut heads: Vec<Arc<Commit>> = graph
            .heads
            .iter()
            .filter_map(|id| graph.commits.get(id).cloned())
            .collect();
        heads.sort_by(|a, b| a.age_order(b));
        heads
    }

    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.graph.read().commits.len()
    }

    /// Journal on top of `parent`.
    pub fn start_commit(&self, parent: &CommitId) -> Result<Journal<'_>> {
        self.get_commit(parent)?;
        Ok(Journal::simple(self, *parent))
    }

    /// Merge journal with two parents. Its changes apply to `left`'s tree.
    pub fn start_merge_commit(&self, left: &CommitId, right: &CommitId) -> Result<Journal<'_>> {
        if left == right {
            return Err(SioError::InvalidArgument(format!(
                "cannot merge commit {left} with itself"
            )));
        }
        self.get_commit(left)?;
        self.get_commit(right)?;
        Ok(Journal::merge(self, *left, *right))
    }

    /// Commit `journal`. Same as [`Journal::commit`].
    pub fn commit_journal(&self, cx: &Cx, journal: Journal<'_>) -> Result<Option<CommitOutcome>> {
        journal.commit(cx)
    }

    /// Insert `commit` and update the head set. Adding a commit that is
    /// already known returns the stored copy.
    pub(crate) fn add_commit(&self, commit: Commit) -> Arc<Commit> {
        let mut graph = self.graph.write();
        if let Some(existing) = graph.commits.get(&commit.id()) {
            return Arc::clone(existing);
        }
        let commit = Arc::new(commit);
        for parent in commit.parents() {
            graph.heads.remove(parent);
        }
        graph.heads.insert(commit.id());
        if let [left, right] = commit.parents() {
            graph
                .merges
                .entry((*left, *right))
                .or_default()
                .insert(commit.id());
        }
        graph.commits.insert(commit.id(), Arc::clone(&commit));
        info!(
            target: "sio::journal",
            commit = %commit.id(),
            generation = commit.generation(),
            merge = commit.is_merge(),
            heads = graph.heads.len(),
            "commit_added"
        );
        commit
    }

    /// Most recent common ancestor of `a` and `b`. When there are several
    /// lowest ones, [`find_common_ancestors`](Self::find_common_ancestors)
    /// returns them all.
    ///
    /// Walks both histories newest first. A commit is final once popped,
    /// since all of its descendants have a higher generation. Ties between
    /// equally recent ancestors go to the larger id.
    pub fn find_common_ancestor(
        &self,
        cx: &Cx,
        a: &CommitId,
        b: &CommitId,
    ) -> Result<Arc<Commit>> {
        const FROM_A: u8 = 1;
        const FROM_B: u8 = 2;

        let start_a = self.get_commit(a)?;
        let start_b = self.get_commit(b)?;
        let mut marks: HashMap<CommitId, u8> = HashMap::new();
        let mut frontier = BinaryHeap::new();
        *marks.entry(start_a.id()).or_default() |= FROM_A;
        *marks.entry(start_b.id()).or_default() |= FROM_B;
        frontier.push((start_a.generation(), start_a.id()));
        frontier.push((start_b.generation(), start_b.id()));

        let mut visited = BTreeSet::new();
        while let Some((_, id)) = frontier.pop() {
            cx_checkpoint(cx)?;
            if !visited.insert(id) {
                continue;
            }
            let mark = marks.get(&id).copied().unwrap_or(0);
            let commit = self.get_commit(&id)?;
            if mark == FROM_A | FROM_B {
                debug!(target: "sio::journal", ancestor = %id, visited = visited.len(), "common_ancestor");
                return Ok(commit);
            }
            for parent in commit.parents() {
                let parent_commit = self.get_commit(parent)?;
                *marks.entry(*parent).or_default() |= mark;
                frontier.push((parent_commit.generation(), *parent));
            }
        }
        Err(SioError::Internal(format!(
            "commits {a} and {b} share no ancestor"
        )))
    }

    /// Existing merge commits whose parents are exactly `a` and `b`.
    #[must_use]
    pub fn merge_commit_ids(&self, a: &CommitId, b: &CommitId) -> Vec<CommitId> {
        let key = if a <= b { (*a, *b) } else { (*b, *a) };
        self.graph
            .read()
            .merges
            .get(&key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Compare the changes behind `left` and `right`, and when neither
    /// side covers the other, return all their lowest common ancestors,
    /// oldest first.
    ///
    /// A common ancestor is lowest when no other common ancestor descends
    /// from it. Criss-cross histories have several.
    pub fn find_common_ancestors(
        &self,
        cx: &Cx,
        left: &CommitId,
        right: &CommitId,
    ) -> Result<(ChangeComparison, Vec<Arc<Commit>>)> {
        let left_history = self.history(cx, left)?;
        let right_history = self.history(cx, right)?;
        let has_own_changes = |own: &HashMap<CommitId, Arc<Commit>>,
                               other: &HashMap<CommitId, Arc<Commit>>| {
            own.iter()
                .any(|(id, commit)| !commit.is_merge() && !other.contains_key(id))
        };
        let comparison = match (
            has_own_changes(&left_history, &right_history),
            has_own_changes(&right_history, &left_history),
        ) {
            (false, false) => ChangeComparison::Equivalent,
            (false, true) => ChangeComparison::LeftSubsetOfRight,
            (true, false) => ChangeComparison::RightSubsetOfLeft,
            (true, true) => ChangeComparison::Unordered,
        };
        if comparison != ChangeComparison::Unordered {
            debug!(target: "sio::journal", left = %left, right = %right, ?comparison, "compare_changes");
            return Ok((comparison, Vec::new()));
        }

        let common: Vec<Arc<Commit>> = left_history
            .into_iter()
            .filter(|(id, _)| right_history.contains_key(id))
            .map(|(_, commit)| commit)
            .collect();
        // Every ancestor of a common commit is common, so a common commit
        // is not lowest exactly when it is the parent of another one.
        let covered: HashSet<CommitId> = common
            .iter()
            .flat_map(|commit| commit.parents().iter().copied())
            .collect();
        let mut lowest: Vec<Arc<Commit>> = common
            .into_iter()
            .filter(|commit| !covered.contains(&commit.id()))
            .collect();
        if lowest.is_empty() {
            return Err(SioError::Internal(format!(
                "commits {left} and {right} share no ancestor"
            )));
        }
        lowest.sort_by(|a, b| a.age_order(b));
        debug!(
            target: "sio::journal",
            left = %left,
            right = %right,
            ancestors = lowest.len(),
            "common_ancestors"
        );
        Ok((comparison, lowest))
    }

    /// `id` and every commit it descends from.
    fn history(&self, cx: &Cx, id: &CommitId) -> Result<HashMap<CommitId, Arc<Commit>>> {
        let mut seen = HashMap::new();
        let mut pending = vec![*id];
        while let Some(next) = pending.pop() {
            if seen.contains_key(&next) {
                continue;
            }
            cx_checkpoint(cx)?;
            let commit = self.get_commit(&next)?;
            pending.extend(commit.parents().iter().copied());
            seen.insert(next, commit);
        }
        Ok(seen)
    }

    pub fn compare_commits(&self, cx: &Cx, a: &CommitId, b: &CommitId) -> Result<CommitRelation> {
        if a == b {
            self.get_commit(a)?;
            return Ok(CommitRelation::Same);
        }
        let ancestor = self.find_common_ancestor(cx, a, b)?.id();
        Ok(if ancestor == *a {
            CommitRelation::Ancestor
        } else if ancestor == *b {
            CommitRelation::Descendant
        } else {
            CommitRelation::Diverged
        })
    }

    /// Every entry of `commit`'s tree, in key order.
    pub fn contents(&self, cx: &Cx, commit: &CommitId) -> Result<Vec<Entry>> {
        let root = self.get_commit(commit)?.root();
        sio_btree::entries(cx, &self.objects, &root)
    }

    /// Entries of `commit` with `key >= min_key`, visited until `f` returns
    /// `false`.
    pub fn for_each_entry(
        &self,
        cx: &Cx,
        commit: &CommitId,
        min_key: &[u8],
        f: impl FnMut(&Entry) -> bool,
    ) -> Result<()> {
        let root = self.get_commit(commit)?.root();
        sio_btree::for_each_entry(cx, &self.objects, &root, min_key, f)
    }

    pub fn entry(&self, cx: &Cx, commit: &CommitId, key: &[u8]) -> Result<Option<Entry>> {
        let root = self.get_commit(commit)?.root();
        sio_btree::lookup(cx, &self.objects, &root, key)
    }

    /// Changes that turn `from`'s tree into `to`'s tree.
    pub fn diff(&self, cx: &Cx, from: &CommitId, to: &CommitId) -> Result<Vec<EntryChange>> {
        let from = self.get_commit(from)?.root();
        let to = self.get_commit(to)?.root();
        sio_btree::diff(cx, &self.objects, &from, &to)
    }

    pub fn three_way_diff(
        &self,
        cx: &Cx,
        base: &CommitId,
        left: &CommitId,
        right: &CommitId,
    ) -> Result<Vec<ThreeWayChange>> {
        let base = self.get_commit(base)?.root();
        let left = self.get_commit(left)?.root();
        let right = self.get_commit(right)?.root();
        sio_btree::three_way_diff(cx, &self.objects, &base, &left, &right)
    }
}
