//! Version history and conflict resolution.
//!
//! All instances of one logical record form a tree through `parent`. The leaves
//! are the competing heads; the newest by `created_at` wins (ties broken by the
//! larger instance id so every replica picks the same head). The winner and its
//! ancestor chain make up the visible history. Losing leaves stay stored but
//! are not surfaced.
//!
//! `created_at` is the originating replica's wall clock, so a node with a fast
//! clock wins concurrent edits.

use pvault_core::types::Version;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn newest_first(a: &Version, b: &Version) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.version.cmp(&a.version))
}

/// Order the instances of a single record: current head first, then its
/// ancestors, oldest last.
pub fn sort_history(instances: &[Version]) -> Vec<Version> {
    let by_version: HashMap<Uuid, &Version> = instances.iter().map(|v| (v.version, v)).collect();
    let parents: HashSet<Uuid> = instances.iter().filter_map(|v| v.parent).collect();

    let mut leaves: Vec<&Version> = by_version
        .values()
        .copied()
        .filter(|v| !parents.contains(&v.version))
        .collect();
    leaves.sort_by(|a, b| newest_first(a, b));

    let Some(head) = leaves.first() else {
        return Vec::new();
    };

    let mut history = vec![(*head).clone()];
    let mut seen = HashSet::from([head.version]);
    let mut cursor = head.parent;
    while let Some(parent) = cursor {
        let Some(version) = by_version.get(&parent) else {
            break;
        };
        if !seen.insert(version.version) {
            break;
        }
        history.push((*version).clone());
        cursor = version.parent;
    }
    history
}

/// Competing heads that lost against the current one.
pub fn conflicts(instances: &[Version]) -> Vec<Version> {
    let parents: HashSet<Uuid> = instances.iter().filter_map(|v| v.parent).collect();
    let mut leaves: Vec<&Version> = instances
        .iter()
        .filter(|v| !parents.contains(&v.version))
        .collect();
    leaves.sort_by(|a, b| newest_first(a, b));
    leaves.dedup_by_key(|v| v.version);
    leaves.into_iter().skip(1).cloned().collect()
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;
    use serde_json::Map;

    /// Random tree: instance i (i > 0) picks a parent among 0..i.
    fn arb_tree() -> impl Strategy<Value = Vec<Version>> {
        prop::collection::vec((any::<prop::sample::Index>(), 0u64..50), 1..12).prop_map(|specs| {
            specs
                .iter()
                .enumerate()
                .map(|(i, (pick, created_at))| Version {
                    id: Uuid::from_u128(1),
                    version: Uuid::from_u128(1000 + i as u128),
                    parent: (i > 0).then(|| Uuid::from_u128(1000 + pick.index(i) as u128)),
                    created_at: *created_at,
                    deleted: false,
                    fields: Map::new(),
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn head_is_a_newest_leaf(tree in arb_tree()) {
            let history = sort_history(&tree);
            prop_assert!(!history.is_empty());
            let head = &history[0];
            prop_assert!(tree.iter().all(|v| v.parent != Some(head.version)));
            for other in conflicts(&tree) {
                prop_assert!(other.created_at <= head.created_at);
            }
        }

        #[test]
        fn history_follows_parents_to_root(tree in arb_tree()) {
            let history = sort_history(&tree);
            for pair in history.windows(2) {
                prop_assert_eq!(pair[0].parent, Some(pair[1].version));
            }
            prop_assert_eq!(history.last().unwrap().parent, None);
        }

        #[test]
        fn order_independent(tree in arb_tree()) {
            let mut reversed = tree.clone();
            reversed.reverse();
            prop_assert_eq!(sort_history(&tree), sort_history(&reversed));
        }
    }
}
