use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crucible_common::module_hash;

use crate::hmr::HmrConfig;

/// Transpiler output for one module variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranspiledSource {
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_map: Option<String>,
}

/// Marker recorded once a module variant has been evaluated. The live
/// exports object is owned by the evaluator, keyed by this module's hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Compilation {}

/// A structured error attached to a transpiled module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleError {
    pub path: String,
    pub message: String,
}

/// One node in the compile graph: a module under a loader-query prefix
///
/// Edges are stored as hashes into the registry, never as references;
/// disposal is explicit.
#[derive(Debug, Clone)]
pub struct TranspiledModule {
    /// Deterministic identity of `(path, query)`
    pub hash: u64,

    pub path: String,

    /// Loader chain prefix, possibly empty
    pub query: String,

    /// `None` until transpiled, and again after invalidation
    pub source: Option<TranspiledSource>,

    /// Emitted asset path -> content
    pub assets: HashMap<String, String>,

    /// Paths of modules emitted during this module's transpilation
    pub child_modules: Vec<String>,

    /// Modules required at runtime
    pub dependencies: HashSet<u64>,

    /// Modules whose transpilation output was consumed at compile time
    /// (e.g. a babel config)
    pub transpilation_dependencies: HashSet<u64>,

    /// Reverse edges of `dependencies`
    pub initiators: HashSet<u64>,

    /// Reverse edges of `transpilation_dependencies`
    pub transpilation_initiators: HashSet<u64>,

    /// Present once evaluated; cleared by invalidation
    pub compilation: Option<Compilation>,

    pub hmr_config: HmrConfig,

    pub errors: Vec<ModuleError>,
    pub warnings: Vec<String>,

    pub is_entry: bool,
    pub is_test_file: bool,

    /// A dependency was unresolvable; retried after the next manifest
    /// update
    pub has_missing_dependencies: bool,
}

impl TranspiledModule {
    pub fn new(path: &str, query: &str) -> Self {
        Self {
            hash: module_hash(path, query),
            path: path.to_string(),
            query: query.to_string(),
            source: None,
            assets: HashMap::new(),
            child_modules: Vec::new(),
            dependencies: HashSet::new(),
            transpilation_dependencies: HashSet::new(),
            initiators: HashSet::new(),
            transpilation_initiators: HashSet::new(),
            compilation: None,
            hmr_config: HmrConfig::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            is_entry: false,
            is_test_file: false,
            has_missing_dependencies: false,
        }
    }

    /// Whether the next transpile pass must process this module
    pub fn should_transpile(&self) -> bool {
        self.source.is_none() || !self.errors.is_empty() || self.has_missing_dependencies
    }

    /// Drop transpilation state so the module is rebuilt from scratch
    pub fn reset_transpilation(&mut self) {
        self.source = None;
        self.compilation = None;
        self.errors.clear();
        self.warnings.clear();
        self.has_missing_dependencies = false;
    }

    /// Drop evaluation state only
    pub fn reset_compilation(&mut self) {
        self.compilation = None;
    }

    /// React to an update of the underlying source module
    pub fn update(&mut self) {
        self.reset_transpilation();
        self.hmr_config.set_dirty();
    }
}
