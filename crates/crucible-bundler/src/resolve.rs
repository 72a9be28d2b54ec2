use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::RwLock;

use crucible_common::{paths, EMPTY_SHIM_PATH, EMPTY_SHIM_REQUEST};
use crucible_pkg::Manifest;
use crucible_resolver::{parse_package_specifier, FileProvider, ResolveOptions, Resolver};

use crate::error::{BundlerError, Result};
use crate::preset::Preset;

/// Placeholder in preset alias tables substituted with the sandbox root
pub const SANDBOX_ROOT_PLACEHOLDER: &str = "{{sandboxRoot}}";

/// Node built-ins that are meaningless in the browser and redirect to the
/// empty shim
const NODE_BUILTINS: &[&str] = &[
    "assert",
    "buffer",
    "child_process",
    "cluster",
    "console",
    "constants",
    "crypto",
    "dgram",
    "dns",
    "domain",
    "events",
    "fs",
    "http",
    "http2",
    "https",
    "module",
    "net",
    "os",
    "path",
    "punycode",
    "querystring",
    "readline",
    "repl",
    "stream",
    "string_decoder",
    "sys",
    "timers",
    "tls",
    "tty",
    "url",
    "util",
    "v8",
    "vm",
    "zlib",
];

/// The full resolution stack: preset aliasing, manifest dependency
/// aliasing, built-in shims, Node-style resolution, and the directory
/// cache
pub struct ResolutionEngine {
    resolver: RefCell<Resolver>,
    preset: Arc<dyn Preset>,
    manifest: Rc<RefCell<Manifest>>,

    /// dirname(from) -> request -> resolved path
    cached_paths: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl ResolutionEngine {
    pub fn new(preset: Arc<dyn Preset>, manifest: Rc<RefCell<Manifest>>) -> Self {
        Self {
            resolver: RefCell::new(Resolver::new(ResolveOptions::default())),
            preset,
            manifest,
            cached_paths: RwLock::new(HashMap::new()),
        }
    }

    /// Swap resolver options (extensions, module directories) after a
    /// configuration change
    pub fn set_options(&self, options: ResolveOptions) {
        *self.resolver.borrow_mut() = Resolver::new(options);
        self.clear_cached_paths();
    }

    /// Invalidate every directory-scoped resolution
    pub fn clear_cached_paths(&self) {
        self.cached_paths.write().clear();
    }

    pub fn cached_paths_snapshot(&self) -> HashMap<String, HashMap<String, String>> {
        self.cached_paths.read().clone()
    }

    pub fn restore_cached_paths(&self, cached: HashMap<String, HashMap<String, String>>) {
        *self.cached_paths.write() = cached;
    }

    pub fn is_cache_empty(&self) -> bool {
        self.cached_paths.read().is_empty()
    }

    /// Resolve a request to an absolute virtual path
    pub fn resolve_module(
        &self,
        provider: &dyn FileProvider,
        request: &str,
        from: &str,
        extensions: &[String],
    ) -> Result<String> {
        if request == EMPTY_SHIM_REQUEST || request == EMPTY_SHIM_PATH {
            return Ok(EMPTY_SHIM_PATH.to_string());
        }

        let from_dir = paths::dirname(from);
        if let Some(cached) = self
            .cached_paths
            .read()
            .get(&from_dir)
            .and_then(|requests| requests.get(request))
        {
            return Ok(cached.clone());
        }

        let aliased = self.apply_aliases(request, from);

        if is_shimmed_builtin(&aliased) {
            self.write_cache(&from_dir, request, EMPTY_SHIM_PATH);
            return Ok(EMPTY_SHIM_PATH.to_string());
        }

        match self
            .resolver
            .borrow()
            .resolve(provider, &aliased, from, extensions)
        {
            Ok(resolved) => {
                self.write_cache(&from_dir, request, &resolved);
                Ok(resolved)
            }
            Err(err) => {
                tracing::debug!("Resolution failed: {}", err);
                self.purge_cache_entry(&from_dir, request);
                Err(self.classify_failure(&aliased, from))
            }
        }
    }

    /// Steps 1 and 2: preset aliasing, then manifest dependency aliasing
    fn apply_aliases(&self, request: &str, from: &str) -> String {
        let mut request = request.replace(SANDBOX_ROOT_PLACEHOLDER, "");
        if let Some(aliased) = self.preset.get_aliased_path(&request) {
            request = aliased;
        }

        // A request from inside /node_modules/<dep>/ may be pinned to a
        // version-split copy, letting two versions of one library coexist
        if let Some(dep) = paths::node_modules_package(from) {
            if is_bare_specifier(&request) {
                let (package_name, subpath) = parse_package_specifier(&request);
                let manifest = self.manifest.borrow();
                if let Some(actual) = manifest.alias_for(&dep, &package_name) {
                    let rewritten = match &subpath {
                        Some(sub) => format!("{}/{}", actual, sub.trim_start_matches("./")),
                        None => actual.to_string(),
                    };
                    tracing::debug!(
                        "Aliased '{}' to '{}' for '{}'",
                        request,
                        rewritten,
                        dep
                    );
                    return rewritten;
                }
            }
        }

        request
    }

    /// Failure classification per the target location and manifest
    /// knowledge
    fn classify_failure(&self, request: &str, from: &str) -> BundlerError {
        let target = if is_bare_specifier(request) {
            format!("/node_modules/{}", request)
        } else {
            paths::join(&paths::dirname(from), request)
        };

        match paths::node_modules_package(&target) {
            Some(name) => {
                if self.manifest.borrow().knows_dependency(&name) {
                    BundlerError::ModuleNotFound {
                        path: target,
                        is_dependency: true,
                        from: from.to_string(),
                    }
                } else {
                    BundlerError::DependencyNotFound {
                        name,
                        from: from.to_string(),
                    }
                }
            }
            None => BundlerError::ModuleNotFound {
                path: target,
                is_dependency: false,
                from: from.to_string(),
            },
        }
    }

    fn write_cache(&self, from_dir: &str, request: &str, resolved: &str) {
        self.cached_paths
            .write()
            .entry(from_dir.to_string())
            .or_default()
            .insert(request.to_string(), resolved.to_string());
    }

    fn purge_cache_entry(&self, from_dir: &str, request: &str) {
        let mut cached = self.cached_paths.write();
        if let Some(requests) = cached.get_mut(from_dir) {
            requests.remove(request);
            if requests.is_empty() {
                cached.remove(from_dir);
            }
        }
    }
}

fn is_bare_specifier(request: &str) -> bool {
    !request.starts_with("./") && !request.starts_with("../") && !request.starts_with('/')
}

fn is_shimmed_builtin(request: &str) -> bool {
    NODE_BUILTINS.contains(&request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vanilla::VanillaPreset;
    use std::collections::HashMap as StdHashMap;

    fn engine_with_manifest(manifest: Manifest) -> ResolutionEngine {
        ResolutionEngine::new(
            Arc::new(VanillaPreset::new()),
            Rc::new(RefCell::new(manifest)),
        )
    }

    fn files(entries: &[(&str, &str)]) -> StdHashMap<String, String> {
        entries
            .iter()
            .map(|(path, code)| (path.to_string(), code.to_string()))
            .collect()
    }

    #[test]
    fn test_builtin_resolves_to_shim() {
        let engine = engine_with_manifest(Manifest::default());
        let provider = files(&[("/index.js", "")]);

        let resolved = engine
            .resolve_module(&provider, "fs", "/index.js", &[])
            .unwrap();
        assert_eq!(resolved, EMPTY_SHIM_PATH);
    }

    #[test]
    fn test_empty_sentinel() {
        let engine = engine_with_manifest(Manifest::default());
        let provider = files(&[]);
        assert_eq!(
            engine
                .resolve_module(&provider, "//empty.js", "/index.js", &[])
                .unwrap(),
            EMPTY_SHIM_PATH
        );
    }

    #[test]
    fn test_second_resolution_hits_cache() {
        let engine = engine_with_manifest(Manifest::default());
        let provider = files(&[("/index.js", ""), ("/dep.js", "")]);

        let first = engine
            .resolve_module(&provider, "./dep", "/index.js", &[])
            .unwrap();
        assert!(!engine.is_cache_empty());

        // Same answer straight from the cache, even without the file
        let empty = files(&[]);
        let second = engine
            .resolve_module(&empty, "./dep", "/index.js", &[])
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_dependency_alias_rewrites_top_segment() {
        let manifest: Manifest = serde_json::from_str(
            r#"{
                "dependencies": [{"name": "react", "version": "17.0.2"}],
                "dependencyAliases": {"react-dom": {"react": "react/17.0.0"}}
            }"#,
        )
        .unwrap();
        let engine = engine_with_manifest(manifest);
        let provider = files(&[
            ("/node_modules/react/17.0.0/index.js", ""),
            ("/node_modules/react-dom/index.js", ""),
        ]);

        let resolved = engine
            .resolve_module(&provider, "react", "/node_modules/react-dom/index.js", &[])
            .unwrap();
        assert!(resolved.starts_with("/node_modules/react/17.0.0/"));
    }

    #[test]
    fn test_failure_classification() {
        let manifest: Manifest = serde_json::from_str(
            r#"{"dependencies": [{"name": "react", "version": "17.0.2"}]}"#,
        )
        .unwrap();
        let engine = engine_with_manifest(manifest);
        let provider = files(&[("/index.js", "")]);

        // Known dependency, file missing
        let err = engine
            .resolve_module(&provider, "react", "/index.js", &[])
            .unwrap_err();
        assert!(matches!(
            err,
            BundlerError::ModuleNotFound {
                is_dependency: true,
                ..
            }
        ));

        // Unknown package
        let err = engine
            .resolve_module(&provider, "lodash", "/index.js", &[])
            .unwrap_err();
        assert!(matches!(err, BundlerError::DependencyNotFound { .. }));

        // Plain local miss
        let err = engine
            .resolve_module(&provider, "./missing", "/index.js", &[])
            .unwrap_err();
        assert!(matches!(
            err,
            BundlerError::ModuleNotFound {
                is_dependency: false,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_lookup_purges_cache() {
        let engine = engine_with_manifest(Manifest::default());
        let provider = files(&[("/index.js", ""), ("/dep.js", "")]);

        engine
            .resolve_module(&provider, "./dep", "/index.js", &[])
            .unwrap();
        engine
            .resolve_module(&provider, "./missing", "/index.js", &[])
            .unwrap_err();

        let snapshot = engine.cached_paths_snapshot();
        let dir = snapshot.get("/").unwrap();
        assert!(dir.contains_key("./dep"));
        assert!(!dir.contains_key("./missing"));
    }
}
