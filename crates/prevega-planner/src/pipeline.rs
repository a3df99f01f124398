//! Data sources and the graph of references between them.

use std::collections::HashMap;

use serde_json::Value;

use prevega_core::error::{Error, Result};
use prevega_core::types::Table;

use crate::spec::Specification;
use crate::transform::TransformSpec;

/// URL schemes that name a dataset supplied by the caller.
pub const DATASET_URL_SCHEMES: [&str; 2] = ["vegafusion+dataset://", "table://"];

/// Where a data source's rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    /// Another data source in the same specification (`source`).
    Source(String),
    /// A caller-bound dataset (reserved URL scheme).
    Dataset(String),
    /// Inline `values`.
    Values(Table),
    /// Any other URL; loaded by the client.
    Url(String),
    /// Several sources (`source: [a, b]`); unioned by the client.
    Sources(Vec<String>),
    /// Inline values that do not form a table (e.g. primitives).
    Opaque(String),
    /// No input at all.
    None,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub name: String,
    pub upstream: Upstream,
    pub transforms: Vec<TransformSpec>,
    /// Position in the specification's `data` array.
    pub position: usize,
}

impl DataSource {
    /// Parse one `data` entry.
    pub fn from_entry(entry: &Value, position: usize) -> Result<DataSource> {
        let obj = entry.as_object().ok_or_else(|| {
            Error::MalformedSpec(format!("data entry {} is not an object", position))
        })?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::MalformedSpec(format!("data entry {} has no name", position)))?
            .to_string();

        let upstream = if let Some(source) = obj.get("source") {
            match source {
                Value::String(s) => Upstream::Source(s.clone()),
                Value::Array(items) => {
                    let names = items
                        .iter()
                        .map(|v| {
                            v.as_str().map(str::to_string).ok_or_else(|| {
                                Error::MalformedSpec(format!(
                                    "data '{}' has a non-string source",
                                    name
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    match names.as_slice() {
                        [single] => Upstream::Source(single.clone()),
                        _ => Upstream::Sources(names),
                    }
                }
                other => {
                    return Err(Error::MalformedSpec(format!(
                        "data '{}' has an invalid source {}",
                        name, other
                    )))
                }
            }
        } else if let Some(values) = obj.get("values") {
            let has_format = obj.get("format").is_some();
            match values.as_array() {
                Some(rows) if !has_format => match Table::from_json_rows(rows) {
                    Ok(table) => Upstream::Values(table),
                    Err(e) => Upstream::Opaque(e.to_string()),
                },
                _ => Upstream::Opaque("values require client-side parsing".into()),
            }
        } else if let Some(url) = obj.get("url") {
            match url.as_str() {
                Some(u) => match dataset_name_from_url(u) {
                    Some(dataset) => Upstream::Dataset(dataset.to_string()),
                    None => Upstream::Url(u.to_string()),
                },
                None => Upstream::Url(url.to_string()),
            }
        } else {
            Upstream::None
        };

        let transforms = match obj.get("transform") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(TransformSpec::parse).collect(),
            Some(other) => {
                return Err(Error::MalformedSpec(format!(
                    "data '{}' has a non-array transform: {}",
                    name, other
                )))
            }
        };

        Ok(DataSource {
            name,
            upstream,
            transforms,
            position,
        })
    }

    /// Names of other data sources this one reads.
    pub fn source_refs(&self) -> Vec<&str> {
        match &self.upstream {
            Upstream::Source(s) => vec![s.as_str()],
            Upstream::Sources(names) => names.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }
}

/// Extract a bound dataset name from a reserved URL.
pub fn dataset_name_from_url(url: &str) -> Option<&str> {
    DATASET_URL_SCHEMES
        .iter()
        .find_map(|scheme| url.strip_prefix(scheme))
        .filter(|name| !name.is_empty())
}

/// DAG of data sources keyed by name.
#[derive(Debug, Clone)]
pub struct SourceGraph {
    sources: Vec<DataSource>,
    index: HashMap<String, usize>,
    parents: Vec<Vec<usize>>,
    children: Vec<Vec<usize>>,
    order: Vec<usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

impl SourceGraph {
    /// Walk the specification's `data` array.
    ///
    /// Fails with `MalformedSpec` on a missing or duplicate name, a `source`
    /// that names no declared data source, or a reference cycle.
    pub fn extract(spec: &Specification) -> Result<SourceGraph> {
        let sources = spec
            .data()
            .iter()
            .enumerate()
            .map(|(i, entry)| DataSource::from_entry(entry, i))
            .collect::<Result<Vec<_>>>()?;
        Self::from_sources(sources)
    }

    pub fn from_sources(sources: Vec<DataSource>) -> Result<SourceGraph> {
        let mut index = HashMap::with_capacity(sources.len());
        for (i, s) in sources.iter().enumerate() {
            if index.insert(s.name.clone(), i).is_some() {
                return Err(Error::MalformedSpec(format!(
                    "duplicate data source name '{}'",
                    s.name
                )));
            }
        }

        let mut parents = vec![Vec::new(); sources.len()];
        let mut children = vec![Vec::new(); sources.len()];
        for (i, s) in sources.iter().enumerate() {
            for r in s.source_refs() {
                let p = *index.get(r).ok_or_else(|| {
                    Error::MalformedSpec(format!(
                        "data source '{}' references undeclared source '{}'",
                        s.name, r
                    ))
                })?;
                parents[i].push(p);
                children[p].push(i);
            }
        }

        let mut graph = SourceGraph {
            sources,
            index,
            parents,
            children,
            order: Vec::new(),
        };
        graph.order = graph.compute_order()?;
        Ok(graph)
    }

    /// DFS post-order over parents; declaration order breaks ties.
    fn compute_order(&self) -> Result<Vec<usize>> {
        let n = self.sources.len();
        let mut marks = vec![Mark::Unvisited; n];
        let mut order = Vec::with_capacity(n);
        let mut stack: Vec<usize> = Vec::new();
        for root in 0..n {
            self.visit(root, &mut marks, &mut stack, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        node: usize,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match marks[node] {
            Mark::Visited => return Ok(()),
            Mark::Visiting => {
                let start = stack.iter().position(|&n| n == node).unwrap_or(0);
                let members = stack[start..]
                    .iter()
                    .map(|&i| self.sources[i].name.as_str())
                    .collect::<Vec<_>>();
                return Err(Error::MalformedSpec(format!(
                    "data source reference cycle: {}",
                    members.join(" -> ")
                )));
            }
            Mark::Unvisited => {}
        }
        marks[node] = Mark::Visiting;
        stack.push(node);
        for &p in &self.parents[node] {
            self.visit(p, marks, stack, order)?;
        }
        stack.pop();
        marks[node] = Mark::Visited;
        order.push(node);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub fn get(&self, name: &str) -> Option<&DataSource> {
        self.index.get(name).map(|&i| &self.sources[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn source(&self, idx: usize) -> &DataSource {
        &self.sources[idx]
    }

    /// Indices in topological order (parents first).
    pub fn topo_order(&self) -> &[usize] {
        &self.order
    }

    pub fn parents(&self, idx: usize) -> &[usize] {
        &self.parents[idx]
    }

    pub fn children(&self, idx: usize) -> &[usize] {
        &self.children[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(data: Value) -> Result<SourceGraph> {
        SourceGraph::extract(&Specification::new(json!({ "data": data })).unwrap())
    }

    #[test]
    fn classifies_upstreams() {
        let g = graph(json!([
            {"name": "a", "url": "vegafusion+dataset://movies"},
            {"name": "b", "url": "table://orders"},
            {"name": "c", "url": "data/cars.json"},
            {"name": "d", "values": [{"x": 1}]},
            {"name": "e", "source": "d", "transform": [{"type": "filter", "expr": "true"}]},
            {"name": "f", "source": ["a", "b"]},
            {"name": "g"}
        ]))
        .unwrap();
        assert_eq!(g.len(), 7);
        assert_eq!(
            g.get("a").unwrap().upstream,
            Upstream::Dataset("movies".into())
        );
        assert_eq!(
            g.get("b").unwrap().upstream,
            Upstream::Dataset("orders".into())
        );
        assert!(matches!(g.get("c").unwrap().upstream, Upstream::Url(_)));
        assert!(matches!(g.get("d").unwrap().upstream, Upstream::Values(_)));
        assert_eq!(g.get("e").unwrap().upstream, Upstream::Source("d".into()));
        assert_eq!(g.get("e").unwrap().transforms.len(), 1);
        assert!(matches!(g.get("f").unwrap().upstream, Upstream::Sources(_)));
        assert_eq!(g.get("g").unwrap().upstream, Upstream::None);
    }

    #[test]
    fn orders_parents_first_in_declaration_order() {
        let g = graph(json!([
            {"name": "child", "source": "parent"},
            {"name": "other", "values": []},
            {"name": "parent", "values": []}
        ]))
        .unwrap();
        let names: Vec<_> = g
            .topo_order()
            .iter()
            .map(|&i| g.source(i).name.as_str())
            .collect();
        assert_eq!(names, vec!["parent", "child", "other"]);
        let p = g.index_of("parent").unwrap();
        assert_eq!(g.children(p), &[g.index_of("child").unwrap()]);
    }

    #[test]
    fn rejects_structural_errors() {
        let dup = graph(json!([{"name": "a"}, {"name": "a"}])).unwrap_err();
        assert!(matches!(dup, Error::MalformedSpec(_)));

        let missing = graph(json!([{"name": "a", "source": "nope"}])).unwrap_err();
        assert!(missing.to_string().contains("nope"));

        let unnamed = graph(json!([{"values": []}])).unwrap_err();
        assert!(matches!(unnamed, Error::MalformedSpec(_)));

        let cycle = graph(json!([
            {"name": "a", "source": "c"},
            {"name": "b", "source": "a"},
            {"name": "c", "source": "b"}
        ]))
        .unwrap_err();
        let msg = cycle.to_string();
        assert!(msg.contains("cycle"));
        for n in ["a", "b", "c"] {
            assert!(msg.contains(n));
        }
    }

    #[test]
    fn empty_spec_has_no_sources() {
        let g = SourceGraph::extract(&Specification::new(json!({"width": 1})).unwrap()).unwrap();
        assert!(g.is_empty());
    }
}
