//! Immutable commits.

use serde::Serialize;
use sio_types::{CommitId, ObjectIdentifier};
use std::cmp::Ordering;

const COMMIT_ID_DOMAIN: &[u8] = b"sio-commit-v1";

/// Snapshot of a tree plus its parent links.
///
/// Parents are referenced by id and kept sorted, so a merge commit's id
/// does not depend on which head was named first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    id: CommitId,
    parents: Vec<CommitId>,
    root: ObjectIdentifier,
    generation: u64,
}

impl Commit {
    pub(crate) fn new(mut parents: Vec<CommitId>, root: ObjectIdentifier, generation: u64) -> Self {
        parents.sort_unstable();
        parents.dedup();
        let id = compute_id(&parents, &root, generation);
        Self {
            id,
            parents,
            root,
            generation,
        }
    }

    /// Parentless commit at generation 0 holding `empty_root`.
    pub(crate) fn root_commit(empty_root: ObjectIdentifier) -> Self {
        Self::new(Vec::new(), empty_root, 0)
    }

    #[must_use]
    pub fn id(&self) -> CommitId {
        self.id
    }

    #[must_use]
    pub fn parents(&self) -> &[CommitId] {
        &self.parents
    }

    /// Root id of the commit's tree.
    #[must_use]
    pub fn root(&self) -> ObjectIdentifier {
        self.root
    }

    /// Longest parent chain down to the first commit.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }

    /// Older first: by generation, then by id.
    #[must_use]
    pub fn age_order(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.id.cmp(&other.id))
    }
}

fn compute_id(parents: &[CommitId], root: &ObjectIdentifier, generation: u64) -> CommitId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(COMMIT_ID_DOMAIN);
    hasher.update(&(parents.len() as u64).to_le_bytes());
    for parent in parents {
        hasher.update(parent.as_bytes());
    }
    hasher.update(root.as_bytes());
    hasher.update(&generation.to_le_bytes());
    CommitId(*hasher.finalize().as_bytes())
}
