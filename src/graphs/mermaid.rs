//! Mermaid rendering of a graph's dependency structure.
//!
//! Diagnostic output only; never consulted by the scheduler.

use crate::types::{is_system_node, NodeKind};

use super::Graph;

/// Render a graph as a mermaid `graph TD` diagram.
///
/// Inputs render as stadium shapes, schedules as hexagons, mutates as
/// double-edged boxes, computes as plain boxes. Mutation targets are drawn
/// with a dotted arrow. System nodes are omitted.
#[must_use]
pub fn generate_mermaid_graph(graph: &Graph) -> String {
    let mut out = String::from("graph TD\n");

    for node in graph.nodes() {
        if is_system_node(&node.name) {
            continue;
        }
        let shape = match node.kind {
            NodeKind::Input => format!("{0}([{0}])", node.name),
            NodeKind::Compute => format!("{0}[{0}]", node.name),
            NodeKind::ScheduleOnce | NodeKind::ScheduleRecurring => {
                format!("{0}{{{{{0}}}}}", node.name)
            }
            NodeKind::Mutate => format!("{0}[[{0}]]", node.name),
        };
        out.push_str(&format!("    {shape}\n"));
    }

    for node in graph.nodes() {
        for dep in node.upstreams() {
            out.push_str(&format!("    {dep} --> {}\n", node.name));
        }
        if let Some(target) = &node.mutates {
            out.push_str(&format!("    {} -.-> {target}\n", node.name));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphs::{Graph, Predicate};
    use crate::node::{node_fn, NodeOutput};
    use serde_json::json;

    #[test]
    fn renders_nodes_and_edges() {
        let graph = Graph::builder("g", "v1")
            .input("user_name")
            .compute(
                "greeting",
                Predicate::provided("user_name"),
                node_fn(|_| async { Ok(NodeOutput::Value(json!("hi"))) }),
            )
            .build()
            .unwrap();
        let rendered = generate_mermaid_graph(&graph);
        assert!(rendered.starts_with("graph TD"));
        assert!(rendered.contains("user_name([user_name])"));
        assert!(rendered.contains("user_name --> greeting"));
        assert!(!rendered.contains("execution_id"));
    }
}
