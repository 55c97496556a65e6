use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use flux_kustomize_operator_crd::{is_ready_with_generation, Kustomization};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

/// (namespace, name) of a Kustomization.
pub type Key = (String, String);

/// (kind, namespace, name) of a source object.
pub type SourceKey = (String, String, String);

#[derive(Default)]
struct Edges {
    /// Kustomization -> its direct dependencies.
    forward: HashMap<Key, Vec<Key>>,
    /// Dependency -> the Kustomizations gated on it.
    reverse: HashMap<Key, HashSet<Key>>,
    /// Source object -> the Kustomizations built from it.
    sources: HashMap<SourceKey, HashSet<Key>>,
}

/// Process-wide trigger index. The watch mappers read it to fan a single
/// object event out to every Kustomization that must react; reconciliations
/// write it. Dependency readiness itself is never answered from here — it is
/// a single-hop API query per direct dependency, which bottoms out along the
/// DAG as each layer completes.
#[derive(Default)]
pub struct WatchIndex {
    edges: RwLock<Edges>,
}

impl WatchIndex {
    /// Replaces the dependency edges of `key`. Returns the cycle path when
    /// the new edges make `key` reachable from itself.
    pub fn set_dependencies(&self, key: Key, dependencies: Vec<Key>) -> Option<Vec<Key>> {
        let mut edges = self.edges.write().expect("dependency index poisoned");

        if let Some(previous) = edges.forward.remove(&key) {
            for dep in previous {
                if let Some(dependents) = edges.reverse.get_mut(&dep) {
                    dependents.remove(&key);
                }
            }
        }
        for dep in &dependencies {
            edges
                .reverse
                .entry(dep.clone())
                .or_default()
                .insert(key.clone());
        }
        edges.forward.insert(key.clone(), dependencies);

        find_cycle(&edges.forward, &key)
    }

    /// All Kustomizations that declare `key` as a direct dependency.
    pub fn dependents(&self, key: &Key) -> Vec<Key> {
        let edges = self.edges.read().expect("dependency index poisoned");
        edges
            .reverse
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Records which source object `key` is built from.
    pub fn set_source(&self, key: Key, source: SourceKey) {
        let mut edges = self.edges.write().expect("dependency index poisoned");
        for consumers in edges.sources.values_mut() {
            consumers.remove(&key);
        }
        edges.sources.entry(source).or_default().insert(key);
    }

    /// All Kustomizations built from the given source object.
    pub fn consumers(&self, source: &SourceKey) -> Vec<Key> {
        let edges = self.edges.read().expect("dependency index poisoned");
        edges
            .sources
            .get(source)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, key: &Key) {
        let mut edges = self.edges.write().expect("dependency index poisoned");
        if let Some(previous) = edges.forward.remove(key) {
            for dep in previous {
                if let Some(dependents) = edges.reverse.get_mut(&dep) {
                    dependents.remove(key);
                }
            }
        }
        for consumers in edges.sources.values_mut() {
            consumers.remove(key);
        }
    }
}

/// Depth-first walk looking for a path from `start` back to itself.
fn find_cycle(forward: &HashMap<Key, Vec<Key>>, start: &Key) -> Option<Vec<Key>> {
    fn walk(
        forward: &HashMap<Key, Vec<Key>>,
        start: &Key,
        current: &Key,
        path: &mut Vec<Key>,
        seen: &mut HashSet<Key>,
    ) -> bool {
        for next in forward.get(current).into_iter().flatten() {
            if next == start {
                path.push(next.clone());
                return true;
            }
            if seen.insert(next.clone()) {
                path.push(next.clone());
                if walk(forward, start, next, path, seen) {
                    return true;
                }
                path.pop();
            }
        }
        false
    }

    let mut path = vec![start.clone()];
    let mut seen = HashSet::new();
    if walk(forward, start, start, &mut path, &mut seen) {
        debug!("Detected dependency back-edge: {:?}", path);
        Some(path)
    } else {
        None
    }
}

/// Single-hop readiness check of one direct dependency: it must exist, carry
/// `Ready=True` and have caught up with its own spec generation.
pub async fn dependency_ready(client: &Client, key: &Key) -> Result<(), String> {
    let (namespace, name) = key;
    let api: Api<Kustomization> = Api::namespaced(client.clone(), namespace);
    match api.get_opt(name).await {
        Err(error) => Err(format!(
            "failed to look up dependency {namespace}/{name}: {error}"
        )),
        Ok(None) => Err(format!("dependency {namespace}/{name} does not exist")),
        Ok(Some(dependency)) => {
            if is_ready_with_generation(
                dependency.status.as_ref(),
                dependency.metadata.generation,
            ) {
                Ok(())
            } else {
                Err(format!("dependency {namespace}/{name} is not ready"))
            }
        }
    }
}

/// The object key of a Kustomization, used everywhere the index is consulted.
pub fn key_of(kustomization: &Kustomization) -> Key {
    (
        kustomization.namespace().unwrap_or_default(),
        kustomization.name_any(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(namespace: &str, name: &str) -> Key {
        (namespace.to_string(), name.to_string())
    }

    #[test]
    fn reverse_index_tracks_dependents() {
        let index = WatchIndex::default();
        index.set_dependencies(key("dev", "backend"), vec![key("dev", "common")]);
        index.set_dependencies(key("dev", "frontend"), vec![key("dev", "common")]);

        let mut dependents = index.dependents(&key("dev", "common"));
        dependents.sort();
        assert_eq!(
            dependents,
            vec![key("dev", "backend"), key("dev", "frontend")]
        );
    }

    #[test]
    fn edges_are_replaced_not_accumulated() {
        let index = WatchIndex::default();
        index.set_dependencies(key("dev", "backend"), vec![key("dev", "common")]);
        index.set_dependencies(key("dev", "backend"), vec![key("infra", "base")]);

        assert!(index.dependents(&key("dev", "common")).is_empty());
        assert_eq!(
            index.dependents(&key("infra", "base")),
            vec![key("dev", "backend")]
        );
    }

    #[test]
    fn two_node_cycle_is_detected() {
        let index = WatchIndex::default();
        assert!(index
            .set_dependencies(key("dev", "a"), vec![key("dev", "b")])
            .is_none());
        let cycle = index
            .set_dependencies(key("dev", "b"), vec![key("dev", "a")])
            .expect("cycle");
        assert_eq!(cycle.first(), Some(&key("dev", "b")));
        assert_eq!(cycle.last(), Some(&key("dev", "b")));
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let index = WatchIndex::default();
        assert!(index
            .set_dependencies(key("dev", "a"), vec![key("dev", "a")])
            .is_some());
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let index = WatchIndex::default();
        assert!(index
            .set_dependencies(key("dev", "b"), vec![key("dev", "d")])
            .is_none());
        assert!(index
            .set_dependencies(key("dev", "c"), vec![key("dev", "d")])
            .is_none());
        assert!(index
            .set_dependencies(key("dev", "a"), vec![key("dev", "b"), key("dev", "c")])
            .is_none());
    }

    #[test]
    fn source_index_fans_out_to_consumers() {
        let index = WatchIndex::default();
        let source = (
            "GitRepository".to_string(),
            "dev".to_string(),
            "webapp".to_string(),
        );
        index.set_source(key("dev", "backend"), source.clone());
        index.set_source(key("dev", "frontend"), source.clone());
        // Re-pointing a consumer removes the old edge.
        index.set_source(
            key("dev", "frontend"),
            (
                "OCIRepository".to_string(),
                "dev".to_string(),
                "webapp-oci".to_string(),
            ),
        );

        assert_eq!(index.consumers(&source), vec![key("dev", "backend")]);
    }

    #[test]
    fn forget_clears_every_edge() {
        let index = WatchIndex::default();
        let source = (
            "GitRepository".to_string(),
            "dev".to_string(),
            "webapp".to_string(),
        );
        index.set_dependencies(key("dev", "backend"), vec![key("dev", "common")]);
        index.set_source(key("dev", "backend"), source.clone());

        index.forget(&key("dev", "backend"));
        assert!(index.dependents(&key("dev", "common")).is_empty());
        assert!(index.consumers(&source).is_empty());
    }
}
