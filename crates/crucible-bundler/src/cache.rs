//! Persistence of the transpile graph across reloads.
//!
//! The graph serializes to a single JSON record keyed by engine version
//! and the canonical dependencies query; restore is two-phase so edge
//! hashes always have a target before they are reconnected.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crucible_common::{hash_from_hex, hash_to_hex};

use crate::config::ParsedConfigurations;
use crate::error::Result;
use crate::hmr::HmrConfig;
use crate::transpiled_module::{TranspiledModule, TranspiledSource};

/// Serialized form of one transpiled module
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTranspiledModule {
    pub hash: String,
    pub path: String,
    pub query: String,
    pub source: Option<TranspiledSource>,
    #[serde(default)]
    pub assets: HashMap<String, String>,
    #[serde(default)]
    pub child_modules: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub transpilation_dependencies: Vec<String>,
    #[serde(default)]
    pub initiators: Vec<String>,
    #[serde(default)]
    pub transpilation_initiators: Vec<String>,
    #[serde(default)]
    pub hmr_config: HmrConfig,
    #[serde(default)]
    pub is_entry: bool,
    #[serde(default)]
    pub is_test_file: bool,
    #[serde(default)]
    pub has_missing_dependencies: bool,
}

fn hex_set(hashes: &HashSet<u64>) -> Vec<String> {
    let mut rendered: Vec<String> = hashes.iter().map(|hash| hash_to_hex(*hash)).collect();
    rendered.sort();
    rendered
}

impl SerializedTranspiledModule {
    pub fn from_tm(tm: &TranspiledModule) -> Self {
        Self {
            hash: hash_to_hex(tm.hash),
            path: tm.path.clone(),
            query: tm.query.clone(),
            source: tm.source.clone(),
            assets: tm.assets.clone(),
            child_modules: tm.child_modules.clone(),
            dependencies: hex_set(&tm.dependencies),
            transpilation_dependencies: hex_set(&tm.transpilation_dependencies),
            initiators: hex_set(&tm.initiators),
            transpilation_initiators: hex_set(&tm.transpilation_initiators),
            hmr_config: tm.hmr_config.clone(),
            is_entry: tm.is_entry,
            is_test_file: tm.is_test_file,
            has_missing_dependencies: tm.has_missing_dependencies,
        }
    }

    /// Phase one of restore: the node without its edges
    pub fn instantiate(&self) -> TranspiledModule {
        let mut tm = TranspiledModule::new(&self.path, &self.query);
        tm.source = self.source.clone();
        tm.assets = self.assets.clone();
        tm.child_modules = self.child_modules.clone();
        tm.hmr_config = self.hmr_config.clone();
        tm.is_entry = self.is_entry;
        tm.is_test_file = self.is_test_file;
        tm.has_missing_dependencies = self.has_missing_dependencies;
        tm
    }

    /// Parse an edge list; `None` when any reference is malformed
    pub fn parse_edges(edges: &[String]) -> Option<HashSet<u64>> {
        edges.iter().map(|hex| hash_from_hex(hex)).collect()
    }
}

/// The persisted cache record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSandbox {
    pub transpiled_modules: Vec<SerializedTranspiledModule>,
    pub cached_paths: HashMap<String, HashMap<String, String>>,
    pub version: String,
    pub timestamp: u64,
    pub configurations: ParsedConfigurations,
    pub entry: Option<String>,

    /// directory -> file names of known npm files
    #[serde(default)]
    pub meta: HashMap<String, Vec<String>>,

    pub dependencies_query: String,
}

/// Browser-side key/value store stand-in
pub trait CacheStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

/// In-memory cache store
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: DashMap<String, String>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    fn set(&self, key: &str, value: String) {
        self.entries.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

pub fn cache_key(id: &str) -> String {
    format!("crucible-cache-{}", id)
}

pub fn save_cache(store: &dyn CacheStore, id: &str, data: &SerializedSandbox) -> Result<()> {
    let raw = serde_json::to_string(data)?;
    store.set(&cache_key(id), raw);
    Ok(())
}

pub fn load_cache(store: &dyn CacheStore, id: &str) -> Option<SerializedSandbox> {
    let raw = store.get(&cache_key(id))?;
    match serde_json::from_str(&raw) {
        Ok(data) => Some(data),
        Err(err) => {
            tracing::warn!("Discarding unreadable cache for '{}': {}", id, err);
            None
        }
    }
}

pub fn delete_cache(store: &dyn CacheStore, id: &str) {
    store.remove(&cache_key(id));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tm() -> TranspiledModule {
        let mut tm = TranspiledModule::new("/index.js", "");
        tm.source = Some(TranspiledSource {
            code: "module.exports = 1;".to_string(),
            source_map: None,
        });
        tm.dependencies.insert(crucible_common::module_hash("/dep.js", ""));
        tm.is_entry = true;
        tm
    }

    #[test]
    fn test_tm_round_trip() {
        let tm = sample_tm();
        let serialized = SerializedTranspiledModule::from_tm(&tm);
        let restored = serialized.instantiate();

        assert_eq!(restored.hash, tm.hash);
        assert_eq!(restored.path, tm.path);
        assert_eq!(restored.source, tm.source);
        assert!(restored.is_entry);
        // Edges are reconnected in phase two
        assert!(restored.dependencies.is_empty());

        let edges = SerializedTranspiledModule::parse_edges(&serialized.dependencies).unwrap();
        assert_eq!(edges, tm.dependencies);
    }

    #[test]
    fn test_malformed_edge_is_rejected() {
        assert!(SerializedTranspiledModule::parse_edges(&["nonsense!".to_string()]).is_none());
    }

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryCacheStore::new();
        let data = SerializedSandbox {
            transpiled_modules: vec![SerializedTranspiledModule::from_tm(&sample_tm())],
            cached_paths: HashMap::new(),
            version: "0.1.0".to_string(),
            timestamp: 1,
            configurations: ParsedConfigurations::default(),
            entry: Some("/index.js".to_string()),
            meta: HashMap::new(),
            dependencies_query: "react@17.0.2".to_string(),
        };

        save_cache(&store, "sandbox-1", &data).unwrap();
        let loaded = load_cache(&store, "sandbox-1").unwrap();
        assert_eq!(loaded.version, data.version);
        assert_eq!(loaded.transpiled_modules.len(), 1);

        delete_cache(&store, "sandbox-1");
        assert!(load_cache(&store, "sandbox-1").is_none());
    }
}
