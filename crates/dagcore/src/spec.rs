//! Declarative graph source.
//!
//! A cluster document is a list of graphs, each a list of vertices:
//!
//! ```toml
//! [[graph]]
//! name = "example"
//!
//! [[graph.vertex]]
//! op = "fetch"
//! start = true
//! next = ["check"]
//!
//! [[graph.vertex]]
//! id = "check"
//! cond = "status == 200"
//! next_on_ok = ["store"]
//! next_on_fail = ["alert"]
//! ```

use crate::{DagError, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A named set of graphs, built and installed together
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    #[serde(default, rename = "graph")]
    pub graphs: Vec<GraphSpec>,
}

impl ClusterSpec {
    pub fn from_toml(source: &str) -> Result<Self, DagError> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_json(source: &str) -> Result<Self, DagError> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn with_graph(mut self, graph: GraphSpec) -> Self {
        self.graphs.push(graph);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    pub name: String,
    #[serde(default, rename = "vertex")]
    pub vertices: Vec<VertexSpec>,
}

impl GraphSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vertices: Vec::new(),
        }
    }

    pub fn with_vertex(mut self, vertex: VertexSpec) -> Self {
        self.vertices.push(vertex);
        self
    }
}

/// One vertex as written in the source document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "op")]
    pub operator: Option<String>,
    #[serde(default)]
    pub start: bool,
    #[serde(default)]
    pub cond: Option<String>,

    #[serde(default)]
    pub next: Vec<String>,
    #[serde(default)]
    pub next_on_ok: Vec<String>,
    #[serde(default)]
    pub next_on_fail: Vec<String>,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub deps_on_ok: Vec<String>,
    #[serde(default)]
    pub deps_on_fail: Vec<String>,

    #[serde(default)]
    pub input: Vec<DataBinding>,
    #[serde(default)]
    pub output: Vec<DataBinding>,

    /// Static configuration handed to the operator factory
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

impl VertexSpec {
    /// Vertex bound to operator `op`; its id defaults to `op`
    pub fn operator(op: impl Into<String>) -> Self {
        Self {
            operator: Some(op.into()),
            ..Self::default()
        }
    }

    /// Condition vertex; condition vertices always need an id
    pub fn condition(id: impl Into<String>, cond: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            cond: Some(cond.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn start(mut self) -> Self {
        self.start = true;
        self
    }

    pub fn next(mut self, id: impl Into<String>) -> Self {
        self.next.push(id.into());
        self
    }

    pub fn next_on_ok(mut self, id: impl Into<String>) -> Self {
        self.next_on_ok.push(id.into());
        self
    }

    pub fn next_on_fail(mut self, id: impl Into<String>) -> Self {
        self.next_on_fail.push(id.into());
        self
    }

    pub fn deps(mut self, id: impl Into<String>) -> Self {
        self.deps.push(id.into());
        self
    }

    pub fn deps_on_ok(mut self, id: impl Into<String>) -> Self {
        self.deps_on_ok.push(id.into());
        self
    }

    pub fn deps_on_fail(mut self, id: impl Into<String>) -> Self {
        self.deps_on_fail.push(id.into());
        self
    }

    pub fn with_input(mut self, binding: DataBinding) -> Self {
        self.input.push(binding);
        self
    }

    pub fn with_output(mut self, binding: DataBinding) -> Self {
        self.output.push(binding);
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// Link between an operator port and a graph-wide data id.
///
/// `name` is what the operator calls the value; `id` is what producer and
/// consumer agree on. `id` defaults to `name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBinding {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl DataBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn data_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_toml_document() {
        let spec = ClusterSpec::from_toml(
            r#"
            [[graph]]
            name = "g"

            [[graph.vertex]]
            op = "producer"
            start = true
            output = [{ name = "d1" }, { name = "out", id = "d2" }]
            config = { delay_ms = 10 }

            [[graph.vertex]]
            id = "cond1"
            cond = "x > y"
            deps = ["producer"]
            next_on_ok = ["a"]
            next_on_fail = ["b"]
            "#,
        )
        .unwrap();

        assert_eq!(spec.graphs.len(), 1);
        let graph = &spec.graphs[0];
        assert_eq!(graph.name, "g");
        assert_eq!(graph.vertices.len(), 2);

        let producer = &graph.vertices[0];
        assert_eq!(producer.operator.as_deref(), Some("producer"));
        assert!(producer.start);
        assert_eq!(producer.output[1].data_id(), "d2");
        assert_eq!(producer.output[0].data_id(), "d1");
        assert_eq!(producer.config["delay_ms"].as_f64(), Some(10.0));

        let cond = &graph.vertices[1];
        assert_eq!(cond.cond.as_deref(), Some("x > y"));
        assert_eq!(cond.next_on_fail, vec!["b".to_string()]);
    }

    #[test]
    fn decodes_json_document() {
        let spec = ClusterSpec::from_json(
            r#"{"graph": [{"name": "g", "vertex": [{"op": "a", "start": true}]}]}"#,
        )
        .unwrap();
        assert_eq!(spec.graphs[0].vertices[0].operator.as_deref(), Some("a"));
    }

    #[test]
    fn reports_decode_errors() {
        let err = ClusterSpec::from_toml("[[graph]]\nname = 3").unwrap_err();
        assert!(matches!(err, DagError::Decode(_)));
    }
}
