//! Dependency graph ordering
//!
//! Kahn's algorithm over the dependency edges of one batch of stories. Edges
//! pointing outside the batch are ignored here; the assignment engine checks
//! those against the store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;

use crate::domain::Story;

/// The batch contains a dependency cycle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Dependency cycle among stories: {}", stories.join(", "))]
pub struct CycleError {
    /// Stories that could not be ordered, in input order
    pub stories: Vec<String>,
}

/// Order ids so that every dependency comes before its dependent
///
/// Zero in-degree nodes are emitted in input order, so the result is stable.
pub fn topological_sort(ids: &[String], deps: &BTreeMap<String, Vec<String>>) -> Result<Vec<String>, CycleError> {
    let in_batch: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();

    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (id.as_str(), 0)).collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for id in ids {
        let mut seen = HashSet::new();
        for dep in deps.get(id).into_iter().flatten() {
            if !in_batch.contains(dep.as_str()) || !seen.insert(dep.as_str()) {
                continue;
            }
            *in_degree.entry(id.as_str()).or_default() += 1;
            dependents.entry(dep.as_str()).or_default().push(id.as_str());
        }
    }
    for list in dependents.values_mut() {
        list.sort_by_key(|id| position[id]);
    }

    let mut queue: VecDeque<&str> = ids
        .iter()
        .map(String::as_str)
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(ids.len());
    let mut emitted = HashSet::new();

    while let Some(id) = queue.pop_front() {
        if !emitted.insert(id) {
            continue;
        }
        ordered.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if ordered.len() < in_batch.len() {
        let stories = ids
            .iter()
            .filter(|id| !emitted.contains(id.as_str()))
            .cloned()
            .collect();
        return Err(CycleError { stories });
    }
    Ok(ordered)
}

/// Order stories by their dependencies, keeping input order among peers
pub fn sort_stories(stories: Vec<Story>, deps: &BTreeMap<String, Vec<String>>) -> Result<Vec<Story>, CycleError> {
    let ids: Vec<String> = stories.iter().map(|s| s.id.clone()).collect();
    let order = topological_sort(&ids, deps)?;
    let mut by_id: HashMap<String, Story> = stories.into_iter().map(|s| (s.id.clone(), s)).collect();
    Ok(order.into_iter().filter_map(|id| by_id.remove(&id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (story, dep) in pairs {
            deps.entry(story.to_string()).or_default().push(dep.to_string());
        }
        deps
    }

    #[test]
    fn test_no_edges_keeps_input_order() {
        let order = topological_sort(&ids(&["c", "a", "b"]), &BTreeMap::new()).unwrap();
        assert_eq!(order, ids(&["c", "a", "b"]));
    }

    #[test]
    fn test_dependency_first() {
        let order = topological_sort(&ids(&["s1", "s2", "s3"]), &edges(&[("s1", "s3"), ("s2", "s1")])).unwrap();
        assert_eq!(order, ids(&["s3", "s1", "s2"]));
    }

    #[test]
    fn test_edges_outside_batch_ignored() {
        let order = topological_sort(&ids(&["s1"]), &edges(&[("s1", "elsewhere")])).unwrap();
        assert_eq!(order, ids(&["s1"]));
    }

    #[test]
    fn test_duplicate_edges_counted_once() {
        let order = topological_sort(&ids(&["a", "b"]), &edges(&[("a", "b"), ("a", "b")])).unwrap();
        assert_eq!(order, ids(&["b", "a"]));
    }

    #[test]
    fn test_cycle_reports_members() {
        let err = topological_sort(
            &ids(&["free", "x", "y", "z"]),
            &edges(&[("x", "y"), ("y", "z"), ("z", "x")]),
        )
        .unwrap_err();
        assert_eq!(err.stories, ids(&["x", "y", "z"]));
        assert!(err.to_string().contains("x, y, z"));
    }

    #[test]
    fn test_self_loop_is_cycle() {
        assert!(topological_sort(&ids(&["a"]), &edges(&[("a", "a")])).is_err());
    }

    #[test]
    fn test_sort_stories() {
        let stories = vec![Story::with_id("s1", "t", "one"), Story::with_id("s2", "t", "two")];
        let sorted = sort_stories(stories, &edges(&[("s1", "s2")])).unwrap();
        let order: Vec<&str> = sorted.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["s2", "s1"]);
    }

    /// Random DAG: node i may only depend on nodes with a lower index
    fn dag() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (1usize..20).prop_flat_map(|n| {
            let edge = (1..n.max(2)).prop_flat_map(|i| (Just(i), 0..i));
            (Just(n), proptest::collection::vec(edge, 0..40))
        })
    }

    proptest! {
        #[test]
        fn prop_acyclic_orders_every_story_once((n, raw_edges) in dag(), reverse in any::<bool>()) {
            let mut names: Vec<String> = (0..n).map(|i| format!("s{}", i)).collect();
            if reverse {
                names.reverse();
            }
            let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for (from, to) in raw_edges.iter().filter(|(from, _)| *from < n) {
                deps.entry(format!("s{}", from)).or_default().push(format!("s{}", to));
            }

            let order = topological_sort(&names, &deps).unwrap();
            prop_assert_eq!(order.len(), n);
            let pos: HashMap<&str, usize> = order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
            prop_assert_eq!(pos.len(), n);
            for (story, story_deps) in &deps {
                for dep in story_deps {
                    prop_assert!(pos[dep.as_str()] < pos[story.as_str()]);
                }
            }
        }

        #[test]
        fn prop_cycle_always_fails(len in 1usize..8, extra in 0usize..5) {
            let mut names: Vec<String> = (0..len).map(|i| format!("c{}", i)).collect();
            names.extend((0..extra).map(|i| format!("free{}", i)));
            let mut deps: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for i in 0..len {
                deps.entry(format!("c{}", i)).or_default().push(format!("c{}", (i + 1) % len));
            }

            let err = topological_sort(&names, &deps).unwrap_err();
            prop_assert_eq!(err.stories.len(), len);
        }
    }
}
