#![forbid(unsafe_code)]
//! Journals, commits and merges over the content-addressed B-tree.
//!
//! A [`PageStorage`] owns an object store and a commit graph that starts
//! with one empty commit. Writers open a [`Journal`] on a parent commit,
//! buffer puts and deletes, and commit it:
//!
//! ```text
//! start_commit(parent) -> put/delete/clear ... -> commit(cx)
//!                                                  |-> None            (tree unchanged)
//!                                                  '-> CommitOutcome   (new head)
//! ```
//!
//! Commits made on the same parent diverge into several heads.
//! [`AutoMergeStrategy`] merges two of them against their common
//! ancestor, and [`MergeResolver`] repeats that until one head is left.
//!
//! Every step takes a [`Cx`](asupersync::Cx); a cancelled context ends
//! the call with `Interrupted` and leaves the graph unchanged.

pub mod commit;
pub mod journal;
pub mod merge;
pub mod storage;

use asupersync::Cx;
use sio_error::{Result, SioError};

pub use commit::Commit;
pub use journal::{CommitOutcome, Journal};
pub use merge::{
    AutoMergeStrategy, ConflictResolver, MergeConfig, MergeReport, MergeResolver, PreferLeft,
};
pub use storage::{ChangeComparison, CommitRelation, PageStorage};

// ── Helpers ─────────────────────────────────────────────────────────────────

pub(crate) fn cx_checkpoint(cx: &Cx) -> Result<()> {
    cx.checkpoint().map_err(|_| SioError::Interrupted)
}
