//! Deterministic selection rules over registry entries.
//!
//! The registry loads entries from disk and hands slices to these functions, so
//! every lookup rule (prefix matching, per-directory choice, recency order) is
//! testable without touching the filesystem.

use std::cmp::Ordering;
use std::path::Path;

use super::types::SessionRegistryEntry;

/// Exact id match.
pub fn find_by_id<'a>(
    entries: &'a [SessionRegistryEntry],
    session_id: &str,
) -> Option<&'a SessionRegistryEntry> {
    entries.iter().find(|entry| entry.session_id == session_id)
}

/// Every entry whose id starts with `prefix`, in input order.
pub fn filter_by_prefix<'a>(
    entries: &'a [SessionRegistryEntry],
    prefix: &str,
) -> Vec<&'a SessionRegistryEntry> {
    entries
        .iter()
        .filter(|entry| entry.session_id.starts_with(prefix))
        .collect()
}

/// The entry that represents `cwd`: the most recently updated one when several
/// entries share the directory.
pub fn select_for_cwd<'a>(
    entries: &'a [SessionRegistryEntry],
    cwd: &Path,
) -> Option<&'a SessionRegistryEntry> {
    entries
        .iter()
        .filter(|entry| entry.cwd == cwd)
        .min_by(|a, b| recency_order(a, b))
}

/// Newest `updated_at` first; ties broken by ascending id so output is stable.
pub fn recency_order(a: &SessionRegistryEntry, b: &SessionRegistryEntry) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| a.session_id.cmp(&b.session_id))
}

pub fn sort_by_recency(entries: &mut [SessionRegistryEntry]) {
    entries.sort_by(recency_order);
}

/// Resumable entries whose persisted state still exists, newest first.
pub fn resumable<F>(entries: &[SessionRegistryEntry], has_state: F) -> Vec<SessionRegistryEntry>
where
    F: Fn(&Path) -> bool,
{
    let mut out: Vec<SessionRegistryEntry> = entries
        .iter()
        .filter(|entry| entry.status.is_resumable() && has_state(&entry.cwd))
        .cloned()
        .collect();
    sort_by_recency(&mut out);
    out
}

/// Ids of entries whose persisted state is gone.
pub fn stale_ids<F>(entries: &[SessionRegistryEntry], has_state: F) -> Vec<String>
where
    F: Fn(&Path) -> bool,
{
    entries
        .iter()
        .filter(|entry| !has_state(&entry.cwd))
        .map(|entry| entry.session_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionStatus;
    use crate::test_support::entry_at;

    #[test]
    fn prefix_matches_all_candidates() {
        let entries = vec![
            entry_at("a1b2c3d4-0001", "/p1", SessionStatus::Paused, 1),
            entry_at("a1b2c3d5-0002", "/p2", SessionStatus::Paused, 2),
            entry_at("ffff0000-0003", "/p3", SessionStatus::Paused, 3),
        ];
        let ids: Vec<&str> = filter_by_prefix(&entries, "a1b2c3d")
            .iter()
            .map(|e| e.session_id.as_str())
            .collect();
        assert_eq!(ids, vec!["a1b2c3d4-0001", "a1b2c3d5-0002"]);
        assert_eq!(filter_by_prefix(&entries, "a1b2c3d4").len(), 1);
        assert!(filter_by_prefix(&entries, "zzz").is_empty());
    }

    #[test]
    fn cwd_lookup_prefers_most_recently_updated() {
        let entries = vec![
            entry_at("old", "/project", SessionStatus::Paused, 10),
            entry_at("new", "/project", SessionStatus::Running, 20),
            entry_at("other", "/elsewhere", SessionStatus::Paused, 30),
        ];
        let picked = select_for_cwd(&entries, Path::new("/project")).expect("entry");
        assert_eq!(picked.session_id, "new");
        assert!(select_for_cwd(&entries, Path::new("/missing")).is_none());
    }

    #[test]
    fn cwd_lookup_ties_break_on_id() {
        let entries = vec![
            entry_at("b", "/project", SessionStatus::Paused, 10),
            entry_at("a", "/project", SessionStatus::Paused, 10),
        ];
        let picked = select_for_cwd(&entries, Path::new("/project")).expect("entry");
        assert_eq!(picked.session_id, "a");
    }

    #[test]
    fn resumable_filters_status_and_state_and_sorts() {
        let entries = vec![
            entry_at("done", "/a", SessionStatus::Completed, 50),
            entry_at("paused", "/b", SessionStatus::Paused, 10),
            entry_at("gone", "/gone", SessionStatus::Paused, 40),
            entry_at("running", "/c", SessionStatus::Running, 30),
        ];
        let out = resumable(&entries, |cwd| cwd != Path::new("/gone"));
        let ids: Vec<&str> = out.iter().map(|e| e.session_id.as_str()).collect();
        assert_eq!(ids, vec!["running", "paused"]);
    }

    #[test]
    fn stale_ids_ignores_status() {
        let entries = vec![
            entry_at("done", "/gone", SessionStatus::Completed, 1),
            entry_at("live", "/here", SessionStatus::Paused, 2),
        ];
        assert_eq!(
            stale_ids(&entries, |cwd| cwd == Path::new("/here")),
            vec!["done".to_string()]
        );
    }
}
