use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crucible_common::paths;

/// Precomputed dependency bundle produced by the packager service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Manifest {
    /// Dependency file contents, keyed by absolute `/node_modules/...` path
    pub contents: HashMap<String, ManifestEntry>,

    /// Top-level dependencies of the sandbox
    pub dependencies: Vec<Dependency>,

    /// Nested dependency metadata, keyed by name
    pub dependency_dependencies: HashMap<String, DependencyInfo>,

    /// Per-dependency alias tables, used to split conflicting versions:
    /// `aliases["react-dom"]["react"] = "react/17.0.0"`
    pub dependency_aliases: HashMap<String, HashMap<String, String>>,
}

/// One precomputed file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub content: String,

    /// Literal request strings, present when the packager pretranspiled
    /// the file
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires: Option<Vec<String>>,
}

/// A top-level dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// Metadata for a nested dependency
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencyInfo {
    pub semver: String,
    pub resolved: String,
    pub parents: Vec<String>,
}

impl Manifest {
    /// Alias lookup for a request made from inside `/node_modules/<dep>/`
    pub fn alias_for(&self, dep: &str, requested: &str) -> Option<&str> {
        self.dependency_aliases
            .get(dep)
            .and_then(|table| table.get(requested))
            .map(String::as_str)
    }

    /// Whether the manifest knows a dependency by name, directly or nested
    pub fn knows_dependency(&self, name: &str) -> bool {
        self.dependencies.iter().any(|dep| dep.name == name)
            || self.dependency_dependencies.contains_key(name)
    }

    /// Resolved version for a dependency name, if the manifest has one
    pub fn resolved_version(&self, name: &str) -> Option<String> {
        if let Some(info) = self.dependency_dependencies.get(name) {
            if !info.resolved.is_empty() {
                return Some(info.resolved.clone());
            }
        }
        self.dependencies
            .iter()
            .find(|dep| dep.name == name)
            .map(|dep| dep.version.clone())
    }

    /// Canonical cache key for the top-level dependency set
    pub fn dependencies_query(&self) -> String {
        dependencies_query(&self.dependencies)
    }
}

/// Encode a dependency set as a canonical, order-independent string
pub fn dependencies_query(dependencies: &[Dependency]) -> String {
    let mut entries: Vec<String> = dependencies
        .iter()
        .map(|dep| format!("{}@{}", dep.name, dep.version))
        .collect();
    entries.sort();
    entries.join("&")
}

/// Group known npm file paths by directory, the persisted `meta` shape
pub fn meta_index<'a>(paths_iter: impl Iterator<Item = &'a String>) -> HashMap<String, Vec<String>> {
    let mut index: HashMap<String, Vec<String>> = HashMap::new();
    for path in paths_iter {
        let dir = paths::dirname(path);
        index
            .entry(dir)
            .or_default()
            .push(paths::basename(path).to_string());
    }
    for files in index.values_mut() {
        files.sort();
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        serde_json::from_str(
            r#"{
                "contents": {
                    "/node_modules/react/index.js": {"content": "module.exports = {};", "requires": []}
                },
                "dependencies": [{"name": "react", "version": "17.0.2"}],
                "dependencyDependencies": {
                    "object-assign": {"semver": "^4.1.1", "resolved": "4.1.1", "parents": ["react"]}
                },
                "dependencyAliases": {
                    "react-dom": {"react": "react/17.0.0"}
                }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_deserialize_camel_case() {
        let manifest = manifest();
        assert_eq!(manifest.dependencies.len(), 1);
        assert!(manifest
            .contents
            .contains_key("/node_modules/react/index.js"));
        assert_eq!(
            manifest.dependency_dependencies["object-assign"].parents,
            vec!["react"]
        );
    }

    #[test]
    fn test_alias_lookup() {
        let manifest = manifest();
        assert_eq!(manifest.alias_for("react-dom", "react"), Some("react/17.0.0"));
        assert_eq!(manifest.alias_for("react-dom", "lodash"), None);
        assert_eq!(manifest.alias_for("vue", "react"), None);
    }

    #[test]
    fn test_knows_dependency() {
        let manifest = manifest();
        assert!(manifest.knows_dependency("react"));
        assert!(manifest.knows_dependency("object-assign"));
        assert!(!manifest.knows_dependency("lodash"));
    }

    #[test]
    fn test_dependencies_query_is_canonical() {
        let forward = dependencies_query(&[
            Dependency { name: "a".into(), version: "1".into() },
            Dependency { name: "b".into(), version: "2".into() },
        ]);
        let reversed = dependencies_query(&[
            Dependency { name: "b".into(), version: "2".into() },
            Dependency { name: "a".into(), version: "1".into() },
        ]);
        assert_eq!(forward, reversed);
        assert_eq!(forward, "a@1&b@2");
    }

    #[test]
    fn test_meta_index_groups_by_directory() {
        let paths = vec![
            "/node_modules/react/index.js".to_string(),
            "/node_modules/react/cjs/react.js".to_string(),
            "/node_modules/react/package.json".to_string(),
        ];
        let index = meta_index(paths.iter());
        assert_eq!(
            index["/node_modules/react"],
            vec!["index.js".to_string(), "package.json".to_string()]
        );
        assert_eq!(index["/node_modules/react/cjs"], vec!["react.js".to_string()]);
    }
}
