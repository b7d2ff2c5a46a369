//! Diff Engine - which of the currently starred repositories are new

use std::collections::HashSet;

use crate::models::StarredRepo;

/// Repository ids known to be starred as of the last successful poll.
/// Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KnownStarSet {
    ids: HashSet<u64>,
}

impl KnownStarSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.ids.contains(&id)
    }

    pub fn insert_all<'a>(&mut self, repos: impl IntoIterator<Item = &'a StarredRepo>) {
        self.ids.extend(repos.into_iter().map(|repo| repo.id));
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl FromIterator<u64> for KnownStarSet {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

/// Repositories in `current` whose id is absent from `known`, in `current`'s
/// order (most recently starred first). An id repeated within `current` is
/// reported once, at its first position.
pub fn diff(current: &[StarredRepo], known: &KnownStarSet) -> Vec<StarredRepo> {
    let mut seen = HashSet::new();
    current
        .iter()
        .filter(|repo| !known.contains(repo.id) && seen.insert(repo.id))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use quickcheck_macros::quickcheck;

    fn repos(ids: &[u64]) -> Vec<StarredRepo> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        ids.iter()
            .enumerate()
            .map(|(i, id)| StarredRepo {
                id: *id,
                full_name: format!("owner/repo-{}", id),
                starred_at: base - Duration::minutes(i as i64),
                html_url: format!("https://github.com/owner/repo-{}", id),
                description: None,
                language: None,
                stargazers_count: 0,
                forks_count: 0,
                default_branch: None,
            })
            .collect()
    }

    fn ids(repos: &[StarredRepo]) -> Vec<u64> {
        repos.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_diff_preserves_order() {
        let current = repos(&[5, 4, 3, 2, 1]);
        let known: KnownStarSet = [1, 3].into_iter().collect();
        assert_eq!(ids(&diff(&current, &known)), vec![5, 4, 2]);
    }

    #[test]
    fn test_diff_empty_when_all_known() {
        let current = repos(&[2, 1]);
        let known: KnownStarSet = [1, 2, 3].into_iter().collect();
        assert!(diff(&current, &known).is_empty());
    }

    #[test]
    fn test_diff_identical_timestamps_keep_listing_order() {
        let mut current = repos(&[9, 8, 7]);
        let same = current[0].starred_at;
        for repo in &mut current {
            repo.starred_at = same;
        }
        assert_eq!(ids(&diff(&current, &KnownStarSet::new())), vec![9, 8, 7]);
    }

    #[test]
    fn test_diff_reports_repeated_id_once() {
        let current = repos(&[4, 3, 4]);
        assert_eq!(ids(&diff(&current, &KnownStarSet::new())), vec![4, 3]);
    }

    #[quickcheck]
    fn prop_diff_is_exactly_current_minus_known(current: Vec<u8>, known: Vec<u8>) -> bool {
        let current_ids: Vec<u64> = current.iter().map(|&i| i as u64).collect();
        let known_set: KnownStarSet = known.iter().map(|&i| i as u64).collect();

        let result = ids(&diff(&repos(&current_ids), &known_set));

        let mut expected = Vec::new();
        for id in &current_ids {
            if !known_set.contains(*id) && !expected.contains(id) {
                expected.push(*id);
            }
        }
        result == expected
    }

    #[quickcheck]
    fn prop_diff_is_idempotent_after_insert(current: Vec<u8>, known: Vec<u8>) -> bool {
        let current = repos(&current.iter().map(|&i| i as u64).collect::<Vec<_>>());
        let mut known_set: KnownStarSet = known.iter().map(|&i| i as u64).collect();

        let first = diff(&current, &known_set);
        known_set.insert_all(&first);
        diff(&current, &known_set).is_empty()
    }
}
