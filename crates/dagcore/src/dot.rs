use crate::graph::{Expect, Graph, GraphCluster};
use std::fmt::Write;

impl GraphCluster {
    /// Render the cluster in Graphviz DOT syntax, one subgraph per graph
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph G {\n    rankdir=LR;\n");
        for (idx, graph) in self.graphs().iter().enumerate() {
            write_graph(&mut out, idx, graph);
        }
        out.push_str("}\n");
        out
    }
}

/// Escape text placed inside a quoted DOT string
fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

fn write_graph(out: &mut String, idx: usize, graph: &Graph) {
    let name = escape(graph.name());
    let node = |id: &str| format!("\"{}_{}\"", name, escape(id));
    let start = node("__START__");
    let stop = node("__STOP__");

    // write! into a String cannot fail
    let _ = writeln!(out, "    subgraph cluster_{} {{", idx);
    let _ = writeln!(out, "        label=\"{}\";", name);
    let _ = writeln!(
        out,
        "        {} [label=\"START\" color=black fillcolor=deepskyblue style=filled];",
        start
    );
    let _ = writeln!(
        out,
        "        {} [label=\"STOP\" color=black fillcolor=deepskyblue style=filled];",
        stop
    );

    for vertex in graph.vertices() {
        let id = node(vertex.id());
        match vertex.condition() {
            Some(cond) => {
                let _ = writeln!(
                    out,
                    "        {} [label=\"{}\" shape=diamond color=black fillcolor=aquamarine style=filled];",
                    id,
                    escape(cond.source())
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "        {} [label=\"{}\" color=black fillcolor=linen style=filled];",
                    id,
                    escape(vertex.id())
                );
            }
        }

        if vertex.deps().is_empty() {
            let _ = writeln!(out, "        {} -> {};", start, id);
        }
        if vertex.next().is_empty() {
            let _ = writeln!(out, "        {} -> {};", id, stop);
        }
        for succ in vertex.next() {
            let target = &graph.vertices()[succ.vertex];
            let style = match target.deps()[succ.slot].expect {
                Expect::Any => "[style=solid]",
                Expect::Ok => "[style=dashed color=green label=\"ok\"]",
                Expect::Fail => "[style=dashed color=red label=\"fail\"]",
            };
            let _ = writeln!(out, "        {} -> {} {};", id, node(target.id()), style);
        }
    }
    out.push_str("    }\n");
}
