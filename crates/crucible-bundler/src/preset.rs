use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crucible_resolver::FileProvider;

use crate::error::Result;
use crate::module::Module;

/// Output of one transpiler stage
#[derive(Debug, Clone)]
pub struct TranspilerOutput {
    pub code: String,
    pub source_map: Option<String>,
}

impl TranspilerOutput {
    pub fn code_only(code: String) -> Self {
        Self {
            code,
            source_map: None,
        }
    }
}

/// Per-stage context handed to transpilers
///
/// Collects everything a stage declares: emitted child modules, runtime
/// and compile-time dependencies, and assets. Stages read other files
/// through the snapshot view, never through the store itself.
pub struct LoaderContext<'a> {
    pub path: String,
    pub query: String,

    /// The configuration bundle, for transpilers that read options
    pub options: serde_json::Value,

    /// Parsed `/.env` variables
    pub env: HashMap<String, String>,

    files: &'a dyn FileProvider,

    emitted_modules: Vec<Module>,
    dependencies: Vec<String>,
    transpilation_dependencies: Vec<String>,
    assets: HashMap<String, String>,
}

impl<'a> LoaderContext<'a> {
    pub fn new(
        path: &str,
        query: &str,
        options: serde_json::Value,
        env: HashMap<String, String>,
        files: &'a dyn FileProvider,
    ) -> Self {
        Self {
            path: path.to_string(),
            query: query.to_string(),
            options,
            env,
            files,
            emitted_modules: Vec::new(),
            dependencies: Vec::new(),
            transpilation_dependencies: Vec::new(),
            assets: HashMap::new(),
        }
    }

    /// Emit a synthetic child module (e.g. extracted CSS)
    pub fn emit_module(&mut self, path: &str, code: &str) {
        let mut module = Module::new(path, code);
        module.parent = Some(self.path.clone());
        self.emitted_modules.push(module);
    }

    /// Declare a runtime dependency by request string
    pub fn add_dependency(&mut self, request: &str) {
        let request = request.to_string();
        if !self.dependencies.contains(&request) {
            self.dependencies.push(request);
        }
    }

    /// Declare a file whose content this stage consumed at compile time
    pub fn add_transpilation_dependency(&mut self, request: &str) {
        let request = request.to_string();
        if !self.transpilation_dependencies.contains(&request) {
            self.transpilation_dependencies.push(request);
        }
    }

    /// Emit a standalone asset
    pub fn emit_asset(&mut self, path: &str, content: &str) {
        self.assets.insert(path.to_string(), content.to_string());
    }

    /// Read another file from the snapshot view
    pub fn read_file(&self, path: &str) -> Option<String> {
        self.files.read_file(path)
    }

    pub fn into_collected(self) -> CollectedLoaderState {
        CollectedLoaderState {
            emitted_modules: self.emitted_modules,
            dependencies: self.dependencies,
            transpilation_dependencies: self.transpilation_dependencies,
            assets: self.assets,
        }
    }
}

/// Everything the loader chain declared, drained after the last stage
#[derive(Debug, Default)]
pub struct CollectedLoaderState {
    pub emitted_modules: Vec<Module>,
    pub dependencies: Vec<String>,
    pub transpilation_dependencies: Vec<String>,
    pub assets: HashMap<String, String>,
}

/// One stage of the transpilation pipeline
///
/// Transpilers may suspend (network, config decode); the evaluation stage
/// never calls them.
#[async_trait(?Send)]
pub trait Transpiler {
    fn name(&self) -> &str;

    async fn transpile(
        &self,
        code: String,
        ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput>;

    /// Extra context exposed to embedders (e.g. the loader's version and
    /// capabilities)
    fn transpiler_context(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Release any internal caches
    fn dispose(&self) {}
}

/// Pluggable policy object supplying transpiler chains and resolution
/// defaults
pub trait Preset {
    fn name(&self) -> &str;

    /// Ordered transpiler chain for a module under a query
    fn get_loaders(&self, module: &Module, query: &str) -> Vec<Arc<dyn Transpiler>>;

    /// Preset-level path aliasing, applied before resolution
    fn get_aliased_path(&self, path: &str) -> Option<String> {
        let _ = path;
        None
    }

    /// Extensions probed during resolution, in priority order
    fn default_extensions(&self) -> Vec<String> {
        vec![
            ".js".to_string(),
            ".jsx".to_string(),
            ".ts".to_string(),
            ".tsx".to_string(),
            ".json".to_string(),
            ".mjs".to_string(),
        ]
    }

    /// Extensions treated as opaque assets rather than code
    fn ignored_extensions(&self) -> Vec<String> {
        vec![
            "png".to_string(),
            "jpg".to_string(),
            "jpeg".to_string(),
            "gif".to_string(),
            "svg".to_string(),
            "webp".to_string(),
            "woff".to_string(),
            "woff2".to_string(),
            "ttf".to_string(),
            "eot".to_string(),
        ]
    }

    /// Whether `/.env` is parsed into evaluation-time `process.env`
    fn has_dot_env(&self) -> bool {
        false
    }

    /// Release transpiler resources on manager teardown
    fn dispose(&self) {}
}
