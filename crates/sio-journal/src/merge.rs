//! Three-way merge of diverging heads.
//!
//! [`AutoMergeStrategy`] merges two commits against their common ancestor.
//! When the two sides touched disjoint keys, or made the same change to a
//! key, the right side's diff is replayed onto the left commit's tree. Any
//! other overlap goes to a [`ConflictResolver`].
//!
//! [`MergeResolver`] drives the strategy until a page has one head left.
//! Heads with several lowest common ancestors are merged against a merge
//! of those ancestors, built recursively.

use crate::commit::Commit;
use crate::cx_checkpoint;
use crate::storage::{ChangeComparison, PageStorage};
use asupersync::Cx;
use serde::{Deserialize, Serialize};
use sio_btree::{EntryChange, ThreeWayChange};
use sio_error::{Result, SioError};
use sio_types::CommitId;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Resolves keys that both sides of a merge changed differently.
pub trait ConflictResolver: Send + Sync {
    /// Returns the changes to apply onto the left commit's tree. `changes`
    /// holds every key either side touched, not only the conflicting ones.
    fn resolve(&self, cx: &Cx, changes: &[ThreeWayChange]) -> Result<Vec<EntryChange>>;
}

/// Resolver that keeps the left side and adds the right side's changes to
/// keys the left side did not touch.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferLeft;

impl ConflictResolver for PreferLeft {
    fn resolve(&self, _cx: &Cx, changes: &[ThreeWayChange]) -> Result<Vec<EntryChange>> {
        Ok(changes
            .iter()
            .filter(|c| c.left == c.base)
            .map(|c| match &c.right {
                Some(entry) => EntryChange {
                    entry: entry.clone(),
                    deleted: false,
                },
                None => EntryChange::delete(c.key()),
            })
            .collect())
    }
}

/// Merges two heads. Can be cancelled from another thread; a cancelled
/// merge fails with `Internal` at its next step.
#[derive(Default)]
pub struct AutoMergeStrategy {
    resolver: Option<Arc<dyn ConflictResolver>>,
    cancelled: AtomicBool,
}

impl std::fmt::Debug for AutoMergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoMergeStrategy")
            .field("has_resolver", &self.resolver.is_some())
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish()
    }
}

impl AutoMergeStrategy {
    /// Strategy without a conflict resolver: conflicting merges fail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_resolver(resolver: Arc<dyn ConflictResolver>) -> Self {
        Self {
            resolver: Some(resolver),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn check(&self, cx: &Cx) -> Result<()> {
        if self.is_cancelled() {
            return Err(SioError::Internal("merge cancelled".to_owned()));
        }
        cx_checkpoint(cx)
    }

    /// Merge `left` and `right`, whose common ancestor is `ancestor`, into
    /// a new merge commit.
    pub fn merge(
        &self,
        cx: &Cx,
        storage: &PageStorage,
        left: &CommitId,
        right: &CommitId,
        ancestor: &CommitId,
    ) -> Result<Arc<Commit>> {
        self.check(cx)?;
        let left_diff = storage.diff(cx, ancestor, left)?;
        self.check(cx)?;
        let right_diff = storage.diff(cx, ancestor, right)?;
        self.check(cx)?;

        let left_by_key: BTreeMap<&[u8], &EntryChange> =
            left_diff.iter().map(|c| (c.key(), c)).collect();
        let conflicts = right_diff
            .iter()
            .filter(|r| {
                left_by_key
                    .get(r.key())
                    .is_some_and(|l| !same_outcome(l, r))
            })
            .count();

        let changes = if conflicts == 0 {
            debug!(
                target: "sio::merge",
                left_changes = left_diff.len(),
                right_changes = right_diff.len(),
                "merge_distinct"
            );
            right_diff
        } else {
            let Some(resolver) = &self.resolver else {
                warn!(target: "sio::merge", conflicts, "merge_conflict_unresolved");
                return Err(SioError::BadState(format!(
                    "{conflicts} conflicting keys and no conflict resolver"
                )));
            };
            let three_way = storage.three_way_diff(cx, ancestor, left, right)?;
            self.check(cx)?;
            debug!(target: "sio::merge", conflicts, changes = three_way.len(), "merge_resolve");
            resolver.resolve(cx, &three_way)?
        };
        self.check(cx)?;

        let mut journal = storage.start_merge_commit(left, right)?;
        for change in changes {
            journal.apply(change);
        }
        let outcome = journal
            .commit(cx)?
            .ok_or_else(|| SioError::Internal("merge journal produced no commit".to_owned()))?;
        info!(
            target: "sio::merge",
            commit = %outcome.commit.id(),
            left = %left,
            right = %right,
            ancestor = %ancestor,
            conflicts,
            "merge_commit"
        );
        Ok(outcome.commit)
    }
}

/// Both changes leave the key in the same state.
fn same_outcome(a: &EntryChange, b: &EntryChange) -> bool {
    match (a.deleted, b.deleted) {
        (true, true) => true,
        (false, false) => a.entry == b.entry,
        _ => false,
    }
}

/// Limits for [`MergeResolver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Most head merges one `resolve` call performs.
    pub max_merge_rounds: usize,
    /// First delay before merging two merge commits that came from a peer.
    pub merge_backoff_initial_ms: u64,
    /// Cap for the doubling delay.
    pub merge_backoff_max_ms: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_merge_rounds: 64,
            merge_backoff_initial_ms: 100,
            merge_backoff_max_ms: 60_000,
        }
    }
}

impl MergeConfig {
    /// Delay for the given consecutive deferral (0-indexed).
    #[must_use]
    pub fn merge_backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let delay = self.merge_backoff_initial_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.merge_backoff_max_ms))
    }
}

/// Summary of one [`MergeResolver::resolve`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub rounds: usize,
    pub fast_forwards: usize,
    /// Merges of common ancestors built to serve as a merge base.
    pub base_merges: usize,
    /// Every commit the call created, in order.
    pub merges: Vec<CommitId>,
    pub remaining_heads: usize,
    /// Set when the call held off merging two merge commits. Retry with
    /// [`MergeResolver::resolve`] once it has elapsed.
    pub deferred: Option<Duration>,
}

/// Merges a page's heads pairwise, oldest first, until one remains.
#[derive(Debug)]
pub struct MergeResolver {
    strategy: AutoMergeStrategy,
    config: MergeConfig,
    /// Consecutive deferred merges of two merge commits.
    deferrals: AtomicU32,
}

impl MergeResolver {
    #[must_use]
    pub fn new(strategy: AutoMergeStrategy, config: MergeConfig) -> Self {
        Self {
            strategy,
            config,
            deferrals: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn strategy(&self) -> &AutoMergeStrategy {
        &self.strategy
    }

    #[must_use]
    pub fn config(&self) -> MergeConfig {
        self.config
    }

    /// Merge heads until one is left or the round limit is hit.
    pub fn resolve(&self, cx: &Cx, storage: &PageStorage) -> Result<MergeReport> {
        self.run(cx, storage, false)
    }

    /// Same as [`resolve`](Self::resolve) for heads that arrived from a
    /// peer. When the two oldest heads are both merge commits the call
    /// stops and reports a delay that doubles with each consecutive
    /// deferral.
    pub fn resolve_after_sync(&self, cx: &Cx, storage: &PageStorage) -> Result<MergeReport> {
        self.run(cx, storage, true)
    }

    fn run(&self, cx: &Cx, storage: &PageStorage, may_defer: bool) -> Result<MergeReport> {
        let mut report = MergeReport::default();
        loop {
            let heads = storage.head_commits();
            report.remaining_heads = heads.len();
            if heads.len() < 2 || report.rounds >= self.config.max_merge_rounds {
                break;
            }
            cx_checkpoint(cx)?;
            let (older, newer) = (&heads[0], &heads[1]);
            if older.is_merge() && newer.is_merge() {
                if may_defer {
                    let attempt = self.deferrals.fetch_add(1, Ordering::AcqRel);
                    let delay = self.config.merge_backoff(attempt);
                    debug!(target: "sio::merge", attempt, ?delay, "merge_deferred");
                    report.deferred = Some(delay);
                    break;
                }
            } else {
                self.deferrals.store(0, Ordering::Release);
            }
            let merged = self.merge_pair(cx, storage, older, newer, &mut report)?;
            report.rounds += 1;
            report.merges.push(merged.id());
            debug!(
                target: "sio::merge",
                round = report.rounds,
                commit = %merged.id(),
                "merge_round"
            );
        }
        info!(
            target: "sio::merge",
            rounds = report.rounds,
            fast_forwards = report.fast_forwards,
            base_merges = report.base_merges,
            remaining_heads = report.remaining_heads,
            deferred = report.deferred.is_some(),
            "merge_resolve_done"
        );
        Ok(report)
    }

    /// Merge `left` with the newer `right`.
    ///
    /// When one side's changes cover the other's, the result takes the
    /// covering side's content. Otherwise the strategy runs against a
    /// single base built from all lowest common ancestors.
    fn merge_pair(
        &self,
        cx: &Cx,
        storage: &PageStorage,
        left: &Arc<Commit>,
        right: &Arc<Commit>,
        report: &mut MergeReport,
    ) -> Result<Arc<Commit>> {
        self.strategy.check(cx)?;
        let (comparison, ancestors) = storage.find_common_ancestors(cx, &left.id(), &right.id())?;
        match comparison {
            ChangeComparison::LeftSubsetOfRight => {
                report.fast_forwards += 1;
                self.fast_forward(cx, storage, &right.id(), &left.id())
            }
            ChangeComparison::RightSubsetOfLeft | ChangeComparison::Equivalent => {
                report.fast_forwards += 1;
                self.fast_forward(cx, storage, &left.id(), &right.id())
            }
            ChangeComparison::Unordered => {
                let base = self.merge_base(cx, storage, ancestors, report)?;
                self.strategy
                    .merge(cx, storage, &right.id(), &left.id(), &base.id())
            }
        }
    }

    /// One commit holding the merged content of `ancestors` (oldest first).
    ///
    /// Folds the ancestors in order. A merge of the running result and the
    /// next ancestor that already exists is reused; otherwise one is built
    /// with [`merge_pair`](Self::merge_pair). Among several candidates the
    /// lowest id wins.
    fn merge_base(
        &self,
        cx: &Cx,
        storage: &PageStorage,
        ancestors: Vec<Arc<Commit>>,
        report: &mut MergeReport,
    ) -> Result<Arc<Commit>> {
        let mut ancestors = ancestors.into_iter();
        let first = ancestors
            .next()
            .ok_or_else(|| SioError::Internal("merge without a common ancestor".to_owned()))?;
        let mut merged = vec![first.id()];
        for next in ancestors {
            cx_checkpoint(cx)?;
            let existing: Vec<CommitId> = merged
                .iter()
                .flat_map(|id| storage.merge_commit_ids(id, &next.id()))
                .collect();
            if !existing.is_empty() {
                merged = existing;
                continue;
            }
            let current = storage.get_commit(&lowest(&merged)?)?;
            let (older, newer) = if current.age_order(&next).is_le() {
                (current, next)
            } else {
                (next, current)
            };
            let built = self.merge_pair(cx, storage, &older, &newer, report)?;
            report.base_merges += 1;
            report.merges.push(built.id());
            debug!(
                target: "sio::merge",
                commit = %built.id(),
                left = %older.id(),
                right = %newer.id(),
                "merge_base_built"
            );
            merged = vec![built.id()];
        }
        storage.get_commit(&lowest(&merged)?)
    }

    /// Merge commit carrying `content`'s tree unchanged.
    fn fast_forward(
        &self,
        cx: &Cx,
        storage: &PageStorage,
        content: &CommitId,
        other: &CommitId,
    ) -> Result<Arc<Commit>> {
        if self.strategy.is_cancelled() {
            return Err(SioError::Internal("merge cancelled".to_owned()));
        }
        let journal = storage.start_merge_commit(content, other)?;
        let commit = journal
            .commit(cx)?
            .map(|outcome| outcome.commit)
            .ok_or_else(|| SioError::Internal("merge journal produced no commit".to_owned()))?;
        debug!(target: "sio::merge", commit = %commit.id(), content = %content, "merge_fast_forward");
        Ok(commit)
    }
}

fn lowest(ids: &[CommitId]) -> Result<CommitId> {
    ids.iter()
        .min()
        .copied()
        .ok_or_else(|| SioError::Internal("empty merge candidate list".to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sio_types::{KeyPriority, ObjectIdentifier};

    fn commit(
        cx: &Cx,
        storage: &PageStorage,
        parent: &CommitId,
        puts: &[(&str, &str)],
    ) -> CommitId {
        let mut journal = storage.start_commit(parent).unwrap();
        for (key, value) in puts {
            let id = storage.add_object(value.as_bytes().to_vec());
            journal.put(*key, id, KeyPriority::Eager);
        }
        journal.commit(cx).unwrap().unwrap().commit.id()
    }

    fn merge_commit(
        cx: &Cx,
        storage: &PageStorage,
        left: &CommitId,
        right: &CommitId,
        puts: &[(&str, &str)],
    ) -> CommitId {
        let mut journal = storage.start_merge_commit(left, right).unwrap();
        for (key, value) in puts {
            let id = storage.add_object(value.as_bytes().to_vec());
            journal.put(*key, id, KeyPriority::Eager);
        }
        journal.commit(cx).unwrap().unwrap().commit.id()
    }

    /// Criss-cross history whose two heads share the lowest common
    /// ancestors `a` and `b`. `a` adds a key, `b` changes `x` from 0 to 2,
    /// and the newer head later sets `x` back to 0.
    ///
    /// ```text
    ///          (p)
    ///         /   \
    ///       (a)   (b)
    ///        | \ / |
    ///       (c) X (d)
    ///        | / \ |
    ///       (e)   (f)
    ///        |
    ///      (revert)
    /// ```
    struct CrissCross {
        p: CommitId,
        a: CommitId,
        b: CommitId,
        f: CommitId,
        revert: CommitId,
    }

    fn criss_cross(cx: &Cx, storage: &PageStorage) -> CrissCross {
        let p = commit(cx, storage, &storage.first_commit().id(), &[("x", "0")]);
        let a = commit(cx, storage, &p, &[("a", "1")]);
        let b = commit(cx, storage, &p, &[("x", "2")]);
        let c = commit(cx, storage, &a, &[("c", "1")]);
        let d = commit(cx, storage, &b, &[("d", "1")]);
        let e = merge_commit(cx, storage, &c, &b, &[("x", "2")]);
        let f = merge_commit(cx, storage, &a, &d, &[("x", "2"), ("d", "1")]);
        let revert = commit(cx, storage, &e, &[("x", "0")]);
        CrissCross { p, a, b, f, revert }
    }

    fn value_of(cx: &Cx, storage: &PageStorage, commit: &CommitId, key: &str) -> Option<ObjectIdentifier> {
        storage
            .entry(cx, commit, key.as_bytes())
            .unwrap()
            .map(|e| e.value)
    }

    #[test]
    fn disjoint_changes_merge_without_resolver() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let base = commit(&cx, &storage, &storage.first_commit().id(), &[("shared", "0")]);
        let left = commit(&cx, &storage, &base, &[("l", "1")]);
        let right = commit(&cx, &storage, &base, &[("r", "2")]);

        let merged = AutoMergeStrategy::new()
            .merge(&cx, &storage, &left, &right, &base)
            .unwrap();
        assert!(merged.is_merge());
        let keys: Vec<Vec<u8>> = storage
            .contents(&cx, &merged.id())
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec![b"l".to_vec(), b"r".to_vec(), b"shared".to_vec()]);
        assert_eq!(storage.head_commits().len(), 1);
    }

    #[test]
    fn identical_change_on_both_sides_is_not_a_conflict() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        let left = commit(&cx, &storage, &first, &[("k", "same"), ("l", "1")]);
        let right = commit(&cx, &storage, &first, &[("k", "same")]);
        let merged = AutoMergeStrategy::new()
            .merge(&cx, &storage, &left, &right, &first)
            .unwrap();
        assert_eq!(
            value_of(&cx, &storage, &merged.id(), "k"),
            Some(ObjectIdentifier::for_bytes(b"same"))
        );
    }

    #[test]
    fn conflict_without_resolver_fails() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        let left = commit(&cx, &storage, &first, &[("k", "left")]);
        let right = commit(&cx, &storage, &first, &[("k", "right")]);
        assert!(matches!(
            AutoMergeStrategy::new().merge(&cx, &storage, &left, &right, &first),
            Err(SioError::BadState(_))
        ));
        assert_eq!(storage.head_commits().len(), 2);
    }

    #[test]
    fn conflict_goes_to_resolver() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        let left = commit(&cx, &storage, &first, &[("k", "left")]);
        let right = commit(&cx, &storage, &first, &[("k", "right"), ("r", "x")]);
        let strategy = AutoMergeStrategy::with_resolver(Arc::new(PreferLeft));
        let merged = strategy.merge(&cx, &storage, &left, &right, &first).unwrap();
        assert_eq!(
            value_of(&cx, &storage, &merged.id(), "k"),
            Some(ObjectIdentifier::for_bytes(b"left"))
        );
        assert_eq!(
            value_of(&cx, &storage, &merged.id(), "r"),
            Some(ObjectIdentifier::for_bytes(b"x"))
        );
    }

    #[test]
    fn resolver_error_propagates() {
        struct Refuse;
        impl ConflictResolver for Refuse {
            fn resolve(&self, _cx: &Cx, _changes: &[ThreeWayChange]) -> Result<Vec<EntryChange>> {
                Err(SioError::Canceled)
            }
        }
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        let left = commit(&cx, &storage, &first, &[("k", "left")]);
        let right = commit(&cx, &storage, &first, &[("k", "right")]);
        let strategy = AutoMergeStrategy::with_resolver(Arc::new(Refuse));
        assert!(matches!(
            strategy.merge(&cx, &storage, &left, &right, &first),
            Err(SioError::Canceled)
        ));
    }

    #[test]
    fn cancelled_merge_is_internal_error() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        let left = commit(&cx, &storage, &first, &[("l", "1")]);
        let right = commit(&cx, &storage, &first, &[("r", "2")]);
        let strategy = AutoMergeStrategy::new();
        strategy.cancel();
        assert!(matches!(
            strategy.merge(&cx, &storage, &left, &right, &first),
            Err(SioError::Internal(_))
        ));
        assert_eq!(storage.head_commits().len(), 2);
    }

    #[test]
    fn interrupted_context_wins_over_merge() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        let left = commit(&cx, &storage, &first, &[("l", "1")]);
        let right = commit(&cx, &storage, &first, &[("r", "2")]);
        cx.set_cancel_requested(true);
        assert!(matches!(
            AutoMergeStrategy::new().merge(&cx, &storage, &left, &right, &first),
            Err(SioError::Interrupted)
        ));
    }

    #[test]
    fn resolver_collapses_many_heads() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        for i in 0..5 {
            let key = format!("k{i}");
            commit(&cx, &storage, &first, &[(key.as_str(), "v")]);
        }
        assert_eq!(storage.head_commits().len(), 5);

        let resolver = MergeResolver::new(AutoMergeStrategy::new(), MergeConfig::default());
        let report = resolver.resolve(&cx, &storage).unwrap();
        assert_eq!(report.remaining_heads, 1);
        assert_eq!(report.rounds, 4);
        let head = storage.head_commits()[0].id();
        assert_eq!(storage.contents(&cx, &head).unwrap().len(), 5);
    }

    #[test]
    fn resolver_stops_at_round_limit() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let first = storage.first_commit().id();
        for i in 0..4 {
            let key = format!("k{i}");
            commit(&cx, &storage, &first, &[(key.as_str(), "v")]);
        }
        let resolver = MergeResolver::new(
            AutoMergeStrategy::new(),
            MergeConfig {
                max_merge_rounds: 1,
                ..MergeConfig::default()
            },
        );
        let report = resolver.resolve(&cx, &storage).unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(report.remaining_heads, 3);
    }

    #[test]
    fn single_head_needs_no_merge() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let report = MergeResolver::new(AutoMergeStrategy::new(), MergeConfig::default())
            .resolve(&cx, &storage)
            .unwrap();
        assert_eq!(report, MergeReport {
            remaining_heads: 1,
            ..MergeReport::default()
        });
    }

    #[test]
    fn criss_cross_merges_against_merged_ancestors() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let graph = criss_cross(&cx, &storage);
        let heads: Vec<CommitId> = storage.head_commits().iter().map(|c| c.id()).collect();
        assert_eq!(heads, vec![graph.f, graph.revert]);

        let report = MergeResolver::new(AutoMergeStrategy::new(), MergeConfig::default())
            .resolve(&cx, &storage)
            .unwrap();
        // The ancestor merge is left as a head and then covered by the
        // head merge, which takes one fast-forward.
        assert_eq!(report.base_merges, 1);
        assert_eq!(report.rounds, 2);
        assert_eq!(report.fast_forwards, 1);
        assert_eq!(report.merges.len(), 3);
        assert_eq!(report.remaining_heads, 1);

        let base = storage.get_commit(&report.merges[0]).unwrap();
        let mut base_parents = vec![graph.a, graph.b];
        base_parents.sort_unstable();
        assert_eq!(base.parents(), base_parents.as_slice());

        // Against either single ancestor one side of the revert looks
        // untouched; against their merge only the revert changed `x`.
        let head = storage.head_commits()[0].id();
        assert_eq!(
            value_of(&cx, &storage, &head, "x"),
            Some(ObjectIdentifier::for_bytes(b"0"))
        );
        let keys: Vec<Vec<u8>> = storage
            .contents(&cx, &head)
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"c".to_vec(), b"d".to_vec(), b"x".to_vec()]
        );
    }

    #[test]
    fn existing_merge_of_ancestors_is_reused() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let graph = criss_cross(&cx, &storage);
        let existing = AutoMergeStrategy::new()
            .merge(&cx, &storage, &graph.b, &graph.a, &graph.p)
            .unwrap();
        let commits_before = storage.commit_count();

        let resolver = MergeResolver::new(AutoMergeStrategy::new(), MergeConfig::default());
        let mut report = MergeReport::default();
        let left = storage.get_commit(&graph.f).unwrap();
        let right = storage.get_commit(&graph.revert).unwrap();
        let merged = resolver
            .merge_pair(&cx, &storage, &left, &right, &mut report)
            .unwrap();

        assert_eq!(report.base_merges, 0);
        assert_eq!(storage.commit_count(), commits_before + 1);
        assert!(storage.merge_commit_ids(&graph.a, &graph.b).contains(&existing.id()));
        assert_eq!(
            value_of(&cx, &storage, &merged.id(), "x"),
            Some(ObjectIdentifier::for_bytes(b"0"))
        );
    }

    /// Two merge heads with the same parents and different content.
    fn equivalent_merge_heads(cx: &Cx, storage: &PageStorage) -> (CommitId, CommitId) {
        let first = storage.first_commit().id();
        let a = commit(cx, storage, &first, &[("a", "1")]);
        let b = commit(cx, storage, &first, &[("b", "1")]);
        let m = merge_commit(cx, storage, &a, &b, &[("b", "1")]);
        let n = merge_commit(cx, storage, &b, &a, &[("a", "1"), ("n", "1")]);
        (m, n)
    }

    #[test]
    fn equivalent_heads_take_the_older_content() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        equivalent_merge_heads(&cx, &storage);
        let older = storage.head_commits()[0].id();
        let older_contents = storage.contents(&cx, &older).unwrap();

        let report = MergeResolver::new(AutoMergeStrategy::new(), MergeConfig::default())
            .resolve(&cx, &storage)
            .unwrap();
        assert_eq!(report.rounds, 1);
        assert_eq!(report.fast_forwards, 1);
        assert_eq!(report.base_merges, 0);
        let head = storage.head_commits()[0].id();
        assert_eq!(storage.contents(&cx, &head).unwrap(), older_contents);
    }

    #[test]
    fn merge_backoff_doubles_up_to_cap() {
        let config = MergeConfig {
            merge_backoff_initial_ms: 10,
            merge_backoff_max_ms: 25,
            ..MergeConfig::default()
        };
        assert_eq!(config.merge_backoff(0), Duration::from_millis(10));
        assert_eq!(config.merge_backoff(1), Duration::from_millis(20));
        assert_eq!(config.merge_backoff(2), Duration::from_millis(25));
        assert_eq!(config.merge_backoff(200), Duration::from_millis(25));
    }

    #[test]
    fn merge_of_merges_after_sync_backs_off() {
        let cx = Cx::for_testing();
        let storage = PageStorage::new();
        let (m, _) = equivalent_merge_heads(&cx, &storage);
        let resolver = MergeResolver::new(
            AutoMergeStrategy::new(),
            MergeConfig {
                merge_backoff_initial_ms: 10,
                merge_backoff_max_ms: 1_000,
                ..MergeConfig::default()
            },
        );

        let report = resolver.resolve_after_sync(&cx, &storage).unwrap();
        assert_eq!(report.deferred, Some(Duration::from_millis(10)));
        assert_eq!(report.rounds, 0);
        assert_eq!(report.remaining_heads, 2);
        let report = resolver.resolve_after_sync(&cx, &storage).unwrap();
        assert_eq!(report.deferred, Some(Duration::from_millis(20)));

        // A plain head resets the backoff and merges right away.
        let tip = commit(&cx, &storage, &m, &[("z", "1")]);
        let report = resolver.resolve_after_sync(&cx, &storage).unwrap();
        assert_eq!(report.deferred, None);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.remaining_heads, 1);
        let head = storage.head_commits()[0].id();
        assert_eq!(storage.contents(&cx, &head).unwrap(), storage.contents(&cx, &tip).unwrap());

        let (q1, q2) = (
            commit(&cx, &storage, &head, &[("q1", "1")]),
            commit(&cx, &storage, &head, &[("q2", "1")]),
        );
        merge_commit(&cx, &storage, &q1, &q2, &[("q2", "1")]);
        merge_commit(&cx, &storage, &q2, &q1, &[("q1", "1"), ("r", "1")]);
        let report = resolver.resolve_after_sync(&cx, &storage).unwrap();
        assert_eq!(report.deferred, Some(Duration::from_millis(10)));

        // An explicit resolve does not wait.
        let report = resolver.resolve(&cx, &storage).unwrap();
        assert_eq!(report.deferred, None);
        assert_eq!(report.remaining_heads, 1);
    }
}
