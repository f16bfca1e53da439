//! Static route table for multi-hop traversal.
use std::{collections::HashMap, io, path::Path};

use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};

/// A route table error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum RouteTableError {
    /// Failed to read the route table file.
    #[snafu(display("failed to read route table file '{}': {}", path, source))]
    ReadFile {
        /// Path to the file.
        path: String,

        /// Source of the error.
        source: io::Error,
    },

    /// Failed to parse the route table definition.
    #[snafu(display("failed to parse route table: {}", source))]
    Parse {
        /// Source of the error.
        source: serde_yaml::Error,
    },
}

/// Next-hop table, keyed by route key and then by the identity of the current node.
///
/// Each route describes a path through the mesh one hop at a time: a node only ever learns where the route goes next
/// from itself. A node with no entry for a route (or an empty next hop) is the leaf of that route.
///
/// The table is built once at startup and never mutated afterwards.
///
/// ```yaml
/// checkout:
///   frontend: cart
///   cart: payments
///   payments: ""
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct RouteTable {
    routes: HashMap<String, HashMap<String, Option<String>>>,
}

impl RouteTable {
    /// Creates an empty `RouteTable`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hop to the given route, returning the updated table.
    ///
    /// An empty `next` marks `node` as the leaf of the route.
    pub fn with_hop(mut self, route_key: impl Into<String>, node: impl Into<String>, next: impl Into<String>) -> Self {
        self.routes
            .entry(route_key.into())
            .or_default()
            .insert(node.into(), Some(next.into()));
        self
    }

    /// Parses a `RouteTable` from its YAML representation.
    ///
    /// # Errors
    ///
    /// If the input is not a mapping of route keys to node/next-hop mappings, an error is returned.
    pub fn from_yaml(raw: &str) -> Result<Self, RouteTableError> {
        serde_yaml::from_str(raw).context(Parse)
    }

    /// Loads a `RouteTable` from a YAML file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or its contents are not a valid route table, an error is returned.
    pub fn try_from_file<P>(path: P) -> Result<Self, RouteTableError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).context(ReadFile {
            path: path.display().to_string(),
        })?;
        Self::from_yaml(&raw)
    }

    /// Returns `true` if the table defines the given route.
    pub fn contains_route(&self, route_key: &str) -> bool {
        self.routes.contains_key(route_key)
    }

    /// Returns the next hop for `route_key` when at `node`, or `None` if `node` is the leaf of the route.
    pub fn next_hop(&self, route_key: &str, node: &str) -> Option<&str> {
        self.routes
            .get(route_key)?
            .get(node)?
            .as_deref()
            .filter(|next| !next.is_empty())
    }

    /// Returns all route keys in the table, sorted.
    pub fn route_keys(&self) -> Vec<&str> {
        let mut keys = self.routes.keys().map(String::as_str).collect::<Vec<_>>();
        keys.sort_unstable();
        keys
    }

    /// Returns the number of routes in the table.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if the table has no routes.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHAIN: &str = r#"
r1:
  n0: n1
  n1: n2
  n2: ""
r2:
  n1: n0
  n0: ~
"#;

    #[test]
    fn parses_yaml_chain() {
        let table = RouteTable::from_yaml(CHAIN).unwrap();
        assert_eq!(table.route_keys(), vec!["r1", "r2"]);

        assert_eq!(table.next_hop("r1", "n0"), Some("n1"));
        assert_eq!(table.next_hop("r1", "n1"), Some("n2"));
        assert_eq!(table.next_hop("r1", "n2"), None);
        assert_eq!(table.next_hop("r2", "n1"), Some("n0"));
        assert_eq!(table.next_hop("r2", "n0"), None);
    }

    #[test]
    fn missing_entries_are_leaves() {
        let table = RouteTable::new().with_hop("r1", "n0", "n1");
        assert!(table.contains_route("r1"));
        assert_eq!(table.next_hop("r1", "n9"), None);
        assert_eq!(table.next_hop("unknown", "n0"), None);
    }

    #[test]
    fn rejects_malformed_yaml() {
        let result = RouteTable::from_yaml("- just\n- a\n- list\n");
        assert!(matches!(result, Err(RouteTableError::Parse { .. })));
    }

    #[test]
    fn missing_file_is_reported() {
        let result = RouteTable::try_from_file("/definitely/not/a/route/table.yaml");
        assert!(matches!(result, Err(RouteTableError::ReadFile { .. })));
    }
}
