use std::collections::HashSet;

use crucible_common::paths;

pub mod package;

/// Files the resolver can see. Implemented by the sandbox module store and,
/// in tests, by a plain map. The resolver itself never performs I/O.
pub trait FileProvider {
    /// Whether an exact file exists at `path`
    fn is_file(&self, path: &str) -> bool;

    /// Read a file's content, if present
    fn read_file(&self, path: &str) -> Option<String>;
}

impl FileProvider for std::collections::HashMap<String, String> {
    fn is_file(&self, path: &str) -> bool {
        self.contains_key(path)
    }

    fn read_file(&self, path: &str) -> Option<String> {
        self.get(path).cloned()
    }
}

/// Module resolution options
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Extensions to try when resolving, in priority order (with dots)
    pub extensions: Vec<String>,

    /// Directory names probed while walking up the tree (`node_modules`),
    /// plus absolute roots (tsconfig `baseUrl`, `NODE_PATH` entries)
    pub module_directories: Vec<String>,

    /// Packages whose `browser` field is known-hostile and skipped
    pub skip_browser_field: HashSet<String>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            extensions: vec![
                ".js".to_string(),
                ".jsx".to_string(),
                ".ts".to_string(),
                ".tsx".to_string(),
                ".json".to_string(),
                ".mjs".to_string(),
            ],
            module_directories: vec!["node_modules".to_string()],
            skip_browser_field: HashSet::new(),
        }
    }
}

/// Resolution error
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("Cannot resolve '{request}' from '{from}'")]
    NotFound { request: String, from: String },

    #[error("Invalid package.json at '{path}': {message}")]
    InvalidPackage { path: String, message: String },
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Parse a bare specifier into package name and subpath
///
/// - `react` -> `("react", None)`
/// - `react/jsx-runtime` -> `("react", Some("./jsx-runtime"))`
/// - `@babel/core/lib` -> `("@babel/core", Some("./lib"))`
pub fn parse_package_specifier(specifier: &str) -> (String, Option<String>) {
    if specifier.starts_with('@') {
        let parts: Vec<&str> = specifier.splitn(3, '/').collect();
        match parts.len() {
            3 => (
                format!("{}/{}", parts[0], parts[1]),
                Some(format!("./{}", parts[2])),
            ),
            _ => (specifier.to_string(), None),
        }
    } else {
        match specifier.split_once('/') {
            Some((pkg, rest)) => (pkg.to_string(), Some(format!("./{}", rest))),
            None => (specifier.to_string(), None),
        }
    }
}

/// Node-style module resolver over a virtual file system
pub struct Resolver {
    options: ResolveOptions,
}

impl Resolver {
    pub fn new(options: ResolveOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &ResolveOptions {
        &self.options
    }

    /// Resolve a specifier to an absolute virtual path
    ///
    /// `extensions` overrides the configured probe order when non-empty
    /// (loaders may restrict what they accept).
    pub fn resolve(
        &self,
        provider: &dyn FileProvider,
        specifier: &str,
        from: &str,
        extensions: &[String],
    ) -> Result<String> {
        tracing::debug!("Resolving '{}' from '{}'", specifier, from);

        let extensions = if extensions.is_empty() {
            &self.options.extensions
        } else {
            extensions
        };

        if specifier.starts_with("./") || specifier.starts_with("../") {
            let base = paths::dirname(from);
            let candidate = paths::join(&base, specifier);
            return self
                .load_as_file_or_directory(provider, &candidate, extensions)
                .ok_or_else(|| not_found(specifier, from));
        }

        if paths::is_absolute(specifier) {
            return self
                .load_as_file_or_directory(provider, &paths::normalize(specifier), extensions)
                .ok_or_else(|| not_found(specifier, from));
        }

        self.resolve_bare(provider, specifier, from, extensions)
    }

    /// Resolve a bare specifier through the module directories
    fn resolve_bare(
        &self,
        provider: &dyn FileProvider,
        specifier: &str,
        from: &str,
        extensions: &[String],
    ) -> Result<String> {
        let (package_name, subpath) = parse_package_specifier(specifier);

        for module_dir in &self.options.module_directories {
            if paths::is_absolute(module_dir) {
                // Absolute roots (baseUrl, NODE_PATH) are joined directly
                let candidate = paths::join(module_dir, specifier);
                if let Some(found) =
                    self.load_as_file_or_directory(provider, &candidate, extensions)
                {
                    return Ok(found);
                }
                continue;
            }

            let mut dir = paths::dirname(from);
            loop {
                let package_dir = format!(
                    "{}/{}/{}",
                    dir.trim_end_matches('/'),
                    module_dir,
                    package_name
                );
                let package_dir = paths::normalize(&package_dir);

                if let Some(found) = self.load_package(
                    provider,
                    &package_dir,
                    &package_name,
                    subpath.as_deref(),
                    extensions,
                )? {
                    return Ok(found);
                }

                if dir == "/" || dir == "." {
                    break;
                }
                dir = paths::dirname(&dir);
            }
        }

        Err(not_found(specifier, from))
    }

    /// Resolve inside a package directory: `exports` first, then the
    /// subpath, then the legacy entry fields
    fn load_package(
        &self,
        provider: &dyn FileProvider,
        package_dir: &str,
        package_name: &str,
        subpath: Option<&str>,
        extensions: &[String],
    ) -> Result<Option<String>> {
        let manifest_path = format!("{}/package.json", package_dir);
        let manifest = match provider.read_file(&manifest_path) {
            Some(content) => Some(package::PackageJson::parse(&manifest_path, &content)?),
            None => None,
        };

        let use_browser = !self.options.skip_browser_field.contains(package_name);

        if let Some(manifest) = &manifest {
            if let Some(target) = manifest.resolve_exports(subpath, use_browser) {
                let candidate = paths::join(package_dir, &target);
                if let Some(found) = self.load_as_file(provider, &candidate, extensions) {
                    return Ok(Some(self.apply_browser_map(
                        provider,
                        manifest,
                        package_dir,
                        found,
                        use_browser,
                    )));
                }
            }
        }

        if let Some(sub) = subpath {
            let candidate = paths::join(package_dir, sub);
            if let Some(found) = self.load_as_file_or_directory(provider, &candidate, extensions) {
                let found = match &manifest {
                    Some(manifest) => self.apply_browser_map(
                        provider,
                        manifest,
                        package_dir,
                        found,
                        use_browser,
                    ),
                    None => found,
                };
                return Ok(Some(found));
            }
            return Ok(None);
        }

        if let Some(manifest) = &manifest {
            for entry in manifest.entry_fields(use_browser) {
                let candidate = paths::join(package_dir, &entry);
                if let Some(found) =
                    self.load_as_file_or_directory(provider, &candidate, extensions)
                {
                    return Ok(Some(self.apply_browser_map(
                        provider,
                        manifest,
                        package_dir,
                        found,
                        use_browser,
                    )));
                }
            }
        }

        // package.json#main beats index.<ext>; index is the last resort
        if let Some(found) = self.load_index(provider, package_dir, extensions) {
            return Ok(Some(found));
        }

        Ok(None)
    }

    /// Rewrite a resolved file through the package's `browser` object form
    fn apply_browser_map(
        &self,
        provider: &dyn FileProvider,
        manifest: &package::PackageJson,
        package_dir: &str,
        resolved: String,
        use_browser: bool,
    ) -> String {
        if !use_browser {
            return resolved;
        }
        let relative = match resolved.strip_prefix(package_dir) {
            Some(rest) => format!(".{}", rest),
            None => return resolved,
        };
        match manifest.browser_replacement(&relative) {
            Some(package::BrowserReplacement::Path(target)) => {
                let candidate = paths::join(package_dir, &target);
                self.load_as_file(provider, &candidate, &self.options.extensions)
                    .unwrap_or(resolved)
            }
            Some(package::BrowserReplacement::Ignore) => {
                crucible_common::EMPTY_SHIM_PATH.to_string()
            }
            None => resolved,
        }
    }

    /// Probe a path as a file: exact, then with each extension
    fn load_as_file(
        &self,
        provider: &dyn FileProvider,
        candidate: &str,
        extensions: &[String],
    ) -> Option<String> {
        if provider.is_file(candidate) {
            return Some(candidate.to_string());
        }
        for ext in extensions {
            let with_ext = format!("{}{}", candidate, ext);
            if provider.is_file(&with_ext) {
                return Some(with_ext);
            }
        }
        None
    }

    /// Probe `index.<ext>` inside a directory
    fn load_index(
        &self,
        provider: &dyn FileProvider,
        dir: &str,
        extensions: &[String],
    ) -> Option<String> {
        for ext in extensions {
            let index = format!("{}/index{}", dir.trim_end_matches('/'), ext);
            if provider.is_file(&index) {
                return Some(index);
            }
        }
        None
    }

    /// Probe a path as a file, then as a directory (package.json main
    /// fields, then index files)
    fn load_as_file_or_directory(
        &self,
        provider: &dyn FileProvider,
        candidate: &str,
        extensions: &[String],
    ) -> Option<String> {
        if let Some(found) = self.load_as_file(provider, candidate, extensions) {
            return Some(found);
        }

        let manifest_path = format!("{}/package.json", candidate.trim_end_matches('/'));
        if let Some(content) = provider.read_file(&manifest_path) {
            if let Ok(manifest) = package::PackageJson::parse(&manifest_path, &content) {
                for entry in manifest.entry_fields(true) {
                    let entry_path = paths::join(candidate, &entry);
                    if let Some(found) = self.load_as_file(provider, &entry_path, extensions) {
                        return Some(found);
                    }
                    if let Some(found) = self.load_index(provider, &entry_path, extensions) {
                        return Some(found);
                    }
                }
            }
        }

        self.load_index(provider, candidate, extensions)
    }
}

fn not_found(request: &str, from: &str) -> ResolveError {
    ResolveError::NotFound {
        request: request.to_string(),
        from: from.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn fs(files: &[(&str, &str)]) -> HashMap<String, String> {
        files
            .iter()
            .map(|(path, code)| (path.to_string(), code.to_string()))
            .collect()
    }

    fn resolver() -> Resolver {
        Resolver::new(ResolveOptions::default())
    }

    #[test]
    fn test_relative_with_extension_probe() {
        let files = fs(&[("/src/index.js", ""), ("/src/dep.js", "")]);
        let resolved = resolver()
            .resolve(&files, "./dep", "/src/index.js", &[])
            .unwrap();
        assert_eq!(resolved, "/src/dep.js");
    }

    #[test]
    fn test_extension_order_first_match_wins() {
        let files = fs(&[("/src/a.ts", ""), ("/src/a.js", ""), ("/index.js", "")]);
        let resolved = resolver().resolve(&files, "./src/a", "/index.js", &[]).unwrap();
        assert_eq!(resolved, "/src/a.js");
    }

    #[test]
    fn test_directory_index() {
        let files = fs(&[("/src/lib/index.js", ""), ("/src/index.js", "")]);
        let resolved = resolver()
            .resolve(&files, "./lib", "/src/index.js", &[])
            .unwrap();
        assert_eq!(resolved, "/src/lib/index.js");
    }

    #[test]
    fn test_package_main_beats_index() {
        let files = fs(&[
            ("/node_modules/dep/package.json", r#"{"main": "lib/entry.js"}"#),
            ("/node_modules/dep/lib/entry.js", ""),
            ("/node_modules/dep/index.js", ""),
            ("/index.js", ""),
        ]);
        let resolved = resolver().resolve(&files, "dep", "/index.js", &[]).unwrap();
        assert_eq!(resolved, "/node_modules/dep/lib/entry.js");
    }

    #[test]
    fn test_node_modules_walk_up() {
        let files = fs(&[
            ("/node_modules/dep/index.js", ""),
            ("/src/deep/nested/file.js", ""),
        ]);
        let resolved = resolver()
            .resolve(&files, "dep", "/src/deep/nested/file.js", &[])
            .unwrap();
        assert_eq!(resolved, "/node_modules/dep/index.js");
    }

    #[test]
    fn test_scoped_package_subpath() {
        let files = fs(&[("/node_modules/@org/pkg/lib/util.js", ""), ("/index.js", "")]);
        let resolved = resolver()
            .resolve(&files, "@org/pkg/lib/util", "/index.js", &[])
            .unwrap();
        assert_eq!(resolved, "/node_modules/@org/pkg/lib/util.js");
    }

    #[test]
    fn test_exports_field() {
        let files = fs(&[
            (
                "/node_modules/dep/package.json",
                r#"{"main": "dist/cjs.js", "exports": {".": {"browser": "./dist/browser.js", "default": "./dist/cjs.js"}}}"#,
            ),
            ("/node_modules/dep/dist/browser.js", ""),
            ("/node_modules/dep/dist/cjs.js", ""),
            ("/index.js", ""),
        ]);
        let resolved = resolver().resolve(&files, "dep", "/index.js", &[]).unwrap();
        assert_eq!(resolved, "/node_modules/dep/dist/browser.js");
    }

    #[test]
    fn test_browser_object_rewrites_subpath() {
        let files = fs(&[
            (
                "/node_modules/dep/package.json",
                r#"{"main": "./lib/server.js", "browser": {"./lib/server.js": "./lib/client.js"}}"#,
            ),
            ("/node_modules/dep/lib/server.js", ""),
            ("/node_modules/dep/lib/client.js", ""),
            ("/index.js", ""),
        ]);
        let resolved = resolver().resolve(&files, "dep", "/index.js", &[]).unwrap();
        assert_eq!(resolved, "/node_modules/dep/lib/client.js");
    }

    #[test]
    fn test_browser_field_opt_out() {
        let files = fs(&[
            (
                "/node_modules/hostile/package.json",
                r#"{"main": "./lib/server.js", "browser": {"./lib/server.js": "./lib/client.js"}}"#,
            ),
            ("/node_modules/hostile/lib/server.js", ""),
            ("/node_modules/hostile/lib/client.js", ""),
            ("/index.js", ""),
        ]);
        let mut options = ResolveOptions::default();
        options.skip_browser_field.insert("hostile".to_string());
        let resolved = Resolver::new(options)
            .resolve(&files, "hostile", "/index.js", &[])
            .unwrap();
        assert_eq!(resolved, "/node_modules/hostile/lib/server.js");
    }

    #[test]
    fn test_absolute_module_directory_root() {
        let files = fs(&[("/app/components/Button.js", ""), ("/app/index.js", "")]);
        let mut options = ResolveOptions::default();
        options.module_directories.push("/app".to_string());
        let resolved = Resolver::new(options)
            .resolve(&files, "components/Button", "/app/index.js", &[])
            .unwrap();
        assert_eq!(resolved, "/app/components/Button.js");
    }

    #[test]
    fn test_not_found() {
        let files = fs(&[("/index.js", "")]);
        let err = resolver()
            .resolve(&files, "./missing", "/index.js", &[])
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[test]
    fn test_parse_package_specifier() {
        assert_eq!(parse_package_specifier("react"), ("react".to_string(), None));
        assert_eq!(
            parse_package_specifier("react/jsx-runtime"),
            ("react".to_string(), Some("./jsx-runtime".to_string()))
        );
        assert_eq!(
            parse_package_specifier("@babel/core"),
            ("@babel/core".to_string(), None)
        );
        assert_eq!(
            parse_package_specifier("@babel/core/lib/config"),
            ("@babel/core".to_string(), Some("./lib/config".to_string()))
        );
    }
}
