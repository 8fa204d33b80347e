//! Fan-out bookkeeping shared by the RAID, cache and multi engines.
//!
//! Engines describe one member call as a closure and pick the success rule they need from
//! [`Outcomes`]. Best-effort work comes in two shapes: [`mirror`] is awaited but its failure is
//! only logged, [`detach`] runs as a background task the caller never observes.

use std::ffi::OsString;
use std::future::Future;

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tracing::warn;

use super::{DynProvider, FileStat, FsError};

/// One name of a merged directory listing with each member's stat, `None` where it is missing.
pub type MergedEntry = (OsString, Vec<Option<FileStat>>);

/// Per-member results of one fanned-out call, in member order.
pub struct Outcomes<T> {
    results: Vec<Result<T, FsError>>,
}

impl<T> Outcomes<T> {
    /// Wrap results collected elsewhere.
    #[must_use]
    pub const fn new(results: Vec<Result<T, FsError>>) -> Self {
        Self { results }
    }

    /// Number of members that succeeded.
    #[must_use]
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }

    /// The first success in member order. Failures of other members are logged, not surfaced.
    pub fn first_ok(self, op: &'static str) -> Result<T, FsError> {
        let mut first = None;
        let mut errors = Vec::new();
        for (idx, result) in self.results.into_iter().enumerate() {
            match result {
                Ok(val) if first.is_none() => first = Some(val),
                Ok(_) => {}
                Err(e) => errors.push((idx, e)),
            }
        }
        match first {
            Some(val) => {
                for (member, e) in errors.iter().filter(|(_, e)| !e.is_not_found()) {
                    warn!(op, member, error = %e, "member failed, continuing with the others");
                }
                Ok(val)
            }
            None => Err(collapse(errors.into_iter().map(|(_, e)| e).collect())),
        }
    }

    /// Every member's success, or the collapsed failures if any member failed.
    pub fn all_ok(self) -> Result<Vec<T>, FsError> {
        let mut values = Vec::with_capacity(self.results.len());
        let mut errors = Vec::new();
        for result in self.results {
            match result {
                Ok(val) => values.push(val),
                Err(e) => errors.push(e),
            }
        }
        if errors.is_empty() {
            Ok(values)
        } else {
            Err(collapse(errors))
        }
    }

    /// Successes as per-member options, plus the failures.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Option<T>>, Vec<FsError>) {
        let mut values = Vec::with_capacity(self.results.len());
        let mut errors = Vec::new();
        for result in self.results {
            match result {
                Ok(val) => values.push(Some(val)),
                Err(e) => {
                    values.push(None);
                    errors.push(e);
                }
            }
        }
        (values, errors)
    }

    /// The raw per-member results.
    #[must_use]
    pub fn into_results(self) -> Vec<Result<T, FsError>> {
        self.results
    }
}

/// Pick the error reported when no member succeeded.
///
/// If every member failed the same way (all `NotFound`, all `NotEmpty`, ...) that error is kept;
/// mixed failures become [`FsError::AllMembersFailed`].
#[must_use]
pub fn collapse(errors: Vec<FsError>) -> FsError {
    let mut iter = errors.into_iter();
    let Some(first) = iter.next() else {
        return FsError::AllMembersFailed;
    };
    let errno = first.errno();
    let agree = iter.all(|e| e.errno() == errno);
    if agree && errno.0 != libc::EIO {
        first
    } else {
        FsError::AllMembersFailed
    }
}

/// The error reported when fewer than `required` members succeeded.
///
/// A failure that at least `required` members agree on is an answer, not a lost quorum: a name
/// absent from a majority of replicas is `NotFound`. `EIO` never counts as agreement.
#[must_use]
pub fn quorum_failure(successes: usize, required: usize, errors: Vec<FsError>) -> FsError {
    let agreed = errors.iter().position(|e| {
        let errno = e.errno();
        errno.0 != libc::EIO && errors.iter().filter(|o| o.errno() == errno).count() >= required
    });
    match agreed {
        Some(idx) => {
            let mut errors = errors;
            errors.swap_remove(idx)
        }
        None => FsError::QuorumNotReached {
            successes,
            required,
        },
    }
}

/// Run `op` against every member concurrently.
pub async fn all_settled<T, F, Fut>(members: &[DynProvider], op: F) -> Outcomes<T>
where
    F: Fn(usize, DynProvider) -> Fut,
    Fut: Future<Output = Result<T, FsError>>,
{
    let futs = members
        .iter()
        .enumerate()
        .map(|(idx, member)| op(idx, DynProvider::clone(member)));
    Outcomes::new(join_all(futs).await)
}

/// Run `op` concurrently against every member bound in `binding`.
///
/// Members whose slot is empty are not called and report [`FsError::NotFound`].
pub async fn each_bound<S, T, F, Fut>(
    members: &[DynProvider],
    binding: &[Option<S>],
    op: F,
) -> Outcomes<T>
where
    S: Copy,
    F: Fn(usize, DynProvider, S) -> Fut,
    Fut: Future<Output = Result<T, FsError>>,
{
    let futs = members.iter().enumerate().map(|(idx, member)| {
        let fut = binding
            .get(idx)
            .copied()
            .flatten()
            .map(|slot| op(idx, DynProvider::clone(member), slot));
        async move {
            match fut {
                Some(fut) => fut.await,
                None => Err(FsError::NotFound),
            }
        }
    });
    Outcomes::new(join_all(futs).await)
}

/// Like [`first_success`], skipping members with an empty slot in `binding`.
pub async fn first_bound<S, T, F, Fut>(
    members: &[DynProvider],
    binding: &[Option<S>],
    op: F,
) -> Result<(usize, T), FsError>
where
    S: Copy,
    F: Fn(usize, DynProvider, S) -> Fut,
    Fut: Future<Output = Result<T, FsError>>,
{
    let mut errors = Vec::with_capacity(members.len());
    for (idx, member) in members.iter().enumerate() {
        let Some(slot) = binding.get(idx).copied().flatten() else {
            continue;
        };
        match op(idx, DynProvider::clone(member), slot).await {
            Ok(val) => return Ok((idx, val)),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        return Err(FsError::NotFound);
    }
    Err(collapse(errors))
}

/// Run `op` against members one at a time in registration order and stop at the first success.
pub async fn first_success<T, F, Fut>(members: &[DynProvider], op: F) -> Result<(usize, T), FsError>
where
    F: Fn(usize, DynProvider) -> Fut,
    Fut: Future<Output = Result<T, FsError>>,
{
    let mut errors = Vec::with_capacity(members.len());
    for (idx, member) in members.iter().enumerate() {
        match op(idx, DynProvider::clone(member)).await {
            Ok(val) => return Ok((idx, val)),
            Err(e) => errors.push(e),
        }
    }
    Err(collapse(errors))
}

/// Await best-effort work, logging its failure instead of returning it.
pub async fn mirror<T>(op: &'static str, fut: impl Future<Output = Result<T, FsError>>) -> Option<T> {
    match fut.await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(op, error = %e, "best-effort mirror failed");
            None
        }
    }
}

/// Run best-effort work as a detached background task.
///
/// The caller's result never depends on it; a failure is only visible in the log.
pub fn detach<F>(op: &'static str, fut: F)
where
    F: Future<Output = Result<(), FsError>> + Send + 'static,
{
    drop(tokio::spawn(async move {
        if let Err(e) = fut.await {
            warn!(op, error = %e, "background mirror failed");
        }
    }));
}

/// Members required for a majority of `n`.
#[must_use]
pub const fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Merge per-member listings by name, in order of first appearance.
#[must_use]
pub fn merge_listings(listings: Vec<Option<Vec<(OsString, FileStat)>>>) -> Vec<MergedEntry> {
    let n = listings.len();
    let mut merged: Vec<MergedEntry> = Vec::new();
    let mut index: FxHashMap<OsString, usize> = FxHashMap::default();
    for (idx, listing) in listings.into_iter().enumerate() {
        for (name, stat) in listing.into_iter().flatten() {
            let pos = match index.get(&name) {
                Some(&pos) => pos,
                None => {
                    index.insert(name.clone(), merged.len());
                    merged.push((name, vec![None; n]));
                    merged.len() - 1
                }
            };
            merged[pos].1[idx] = Some(stat);
        }
    }
    merged
}

/// Hand back the lookup reference each member took for a `readdirplus` entry that was never
/// passed up.
pub async fn forget_unseen(members: &[DynProvider], stats: &[Option<FileStat>]) {
    join_all(
        members
            .iter()
            .zip(stats)
            .filter_map(|(member, stat)| stat.as_ref().map(|s| member.forget(s.ino, 1))),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileKind;

    #[test]
    fn collapse_keeps_agreeing_errors() {
        let err = collapse(vec![FsError::NotEmpty, FsError::NotEmpty]);
        assert!(matches!(err, FsError::NotEmpty));
    }

    #[test]
    fn collapse_mixed_errors_to_all_members_failed() {
        let err = collapse(vec![FsError::NotFound, FsError::io()]);
        assert!(matches!(err, FsError::AllMembersFailed));
    }

    #[test]
    fn majority_of_three_is_two() {
        assert_eq!(majority(3), 2);
        assert_eq!(majority(4), 3);
        assert_eq!(majority(5), 3);
    }

    #[test]
    fn merged_listing_keeps_first_appearance_order() {
        let stat = |ino| FileStat::new(ino, FileKind::RegularFile.type_bits() | 0o644, 0, 0);
        let merged = merge_listings(vec![
            Some(vec![("b".into(), stat(2)), ("a".into(), stat(3))]),
            None,
            Some(vec![("c".into(), stat(4)), ("b".into(), stat(5))]),
        ]);
        let names: Vec<&str> = merged.iter().filter_map(|(n, _)| n.to_str()).collect();
        assert_eq!(names, ["b", "a", "c"]);
        let inos: Vec<Option<u64>> = merged[0].1.iter().map(|s| s.map(|s| s.ino)).collect();
        assert_eq!(inos, [Some(2), None, Some(5)]);
    }

    #[test]
    fn quorum_of_agreeing_failures_is_an_answer() {
        let err = quorum_failure(0, 2, vec![FsError::NotFound, FsError::NotFound, FsError::io()]);
        assert!(matches!(err, FsError::NotFound));

        let err = quorum_failure(1, 2, vec![FsError::NotFound, FsError::io()]);
        assert!(matches!(
            err,
            FsError::QuorumNotReached {
                successes: 1,
                required: 2
            }
        ));

        let err = quorum_failure(0, 2, vec![FsError::io(), FsError::io(), FsError::io()]);
        assert!(matches!(err, FsError::QuorumNotReached { .. }));
    }
}
