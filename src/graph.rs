//! Graph views of a registry.
//!
//! The scheduler itself works on plain index vectors. These helpers lift a
//! registry into a [`petgraph::Graph`] for the questions Kahn's algorithm
//! cannot answer on its own, such as which tasks actually form a cycle.

use petgraph::Graph;
use petgraph::algo::tarjan_scc;
use petgraph::graph::NodeIndex;

use crate::registry::Registry;
use crate::task::StartupTask;

/// Builds the dependency graph of `registry`.
///
/// Node `i` is the `i`-th registry entry, weighted with its key. Every
/// resolvable dependency becomes an edge from the dependency to the dependent.
/// Unresolved entries and dangling names contribute no edges.
pub fn dependency_graph<T: StartupTask>(registry: &Registry<T>) -> Graph<&str, ()> {
    let mut graph = Graph::with_capacity(registry.len(), registry.len());

    for (key, _) in registry.iter() {
        graph.add_node(key);
    }

    for (index, (_, task)) in registry.iter().enumerate() {
        let Some(task) = task else {
            continue;
        };

        for dependency in task.dependencies() {
            if let Some(parent) = registry.position(dependency) {
                graph.add_edge(NodeIndex::new(parent), NodeIndex::new(index), ());
            }
        }
    }

    graph
}

/// Finds every dependency cycle in `registry`.
///
/// Each cycle is a strongly connected component with more than one task, or a
/// single task depending on itself. Members are listed in registry order and
/// cycles are ordered by their first member.
pub fn find_cycles<T: StartupTask>(registry: &Registry<T>) -> Vec<Vec<String>> {
    let graph = dependency_graph(registry);

    let mut cycles: Vec<Vec<NodeIndex>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .map(|mut scc| {
            scc.sort();
            scc
        })
        .collect();

    cycles.sort_by_key(|scc| scc[0]);

    cycles
        .into_iter()
        .map(|scc| scc.into_iter().map(|n| graph[n].to_string()).collect())
        .collect()
}

/// Renders the registry as a Mermaid graph. Nodes are labelled with their
/// execution context; unresolved entries are marked as such.
pub fn render_mermaid<T: StartupTask>(registry: &Registry<T>) -> String {
    use std::fmt::Write;

    let graph = dependency_graph(registry);
    let mut f = String::new();
    writeln!(f, "graph LR").unwrap();

    for (index, (key, task)) in registry.iter().enumerate() {
        let name = key.replace('"', "\\\"");
        let label = match task {
            Some(task) => task.context().to_string(),
            None => "unresolved".to_string(),
        };
        writeln!(f, "    {index}[\"{name}\\n{label}\"]").unwrap();
    }

    for edge in graph.raw_edges() {
        writeln!(
            f,
            "    {} --> {}",
            edge.source().index(),
            edge.target().index()
        )
        .unwrap();
    }

    f
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescriptor;

    fn registry() -> Registry {
        Registry::from_iter([
            TaskDescriptor::new("a"),
            TaskDescriptor::new("b").depends_on(["a", "d"]),
            TaskDescriptor::new("c").depends_on(["b"]).on_worker(),
            TaskDescriptor::new("d").depends_on(["c"]),
            TaskDescriptor::new("e").depends_on(["e"]),
            TaskDescriptor::new("f").depends_on(["ghost"]),
        ])
    }

    #[test]
    fn test_dependency_graph() {
        let registry = registry();
        let graph = dependency_graph(&registry);

        assert_eq!(graph.node_count(), 6);
        assert_eq!(graph.edge_count(), 5);
        assert!(graph.contains_edge(NodeIndex::new(0), NodeIndex::new(1)));
        assert!(graph.contains_edge(NodeIndex::new(3), NodeIndex::new(1)));
    }

    #[test]
    fn test_find_cycles() {
        let cycles = find_cycles(&registry());
        assert_eq!(cycles, [vec!["b", "c", "d"], vec!["e"]]);
    }

    #[test]
    fn test_no_cycles() {
        let registry = Registry::from_iter([
            TaskDescriptor::new("a"),
            TaskDescriptor::new("b").depends_on(["a"]),
        ]);
        assert!(find_cycles(&registry).is_empty());
    }

    #[test]
    fn test_render_mermaid() {
        let mut registry = Registry::from_iter([
            TaskDescriptor::new("a"),
            TaskDescriptor::new("b").depends_on(["a"]).on_worker(),
        ]);
        registry.insert_unresolved("c");

        assert_eq!(
            render_mermaid(&registry),
            "graph LR\n    0[\"a\\nmain\"]\n    1[\"b\\nworker\"]\n    2[\"c\\nunresolved\"]\n    0 --> 1\n"
        );
    }
}
