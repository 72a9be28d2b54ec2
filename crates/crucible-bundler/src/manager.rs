use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::RwLock;

use crucible_bridge::FileResolver;
use crucible_common::{paths, split_query, EMPTY_SHIM_PATH};
use crucible_pkg::{manifest::meta_index, DependencyFetcher, Manifest};
use crucible_resolver::ResolveOptions;

use crate::cache::{SerializedSandbox, SerializedTranspiledModule};
use crate::config::{module_directories, parse_env, ParsedConfigurations};
use crate::error::{BundlerError, Result};
use crate::evaluator::{ActiveEvaluation, Evaluator};
use crate::hmr::{HmrBroadcast, HmrStatus};
use crate::module::Module;
use crate::preset::{LoaderContext, Preset};
use crate::registry::TmRegistry;
use crate::resolve::ResolutionEngine;
use crate::store::ModuleStore;
use crate::transpiled_module::{ModuleError, TranspiledSource};
use crate::SCRIPT_VERSION;

/// Packages whose `browser` field points at stubs that break in-sandbox
/// evaluation; resolution skips the field for them
const BROWSER_FIELD_OPT_OUT: &[&str] = &["ws"];

/// Lifecycle stage of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transpilation,
    Evaluation,
}

/// Manager construction options
#[derive(Debug, Clone, Default)]
pub struct ManagerOptions {
    /// Whether a host file resolver will be attached; kept so embedders
    /// can decide eagerly, the attached resolver is what actually counts
    pub has_file_resolver: bool,

    /// Host framework drives the HMR cycle instead of the engine
    pub enable_webpack_hmr: bool,
}

/// Options for `evaluate_module`
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationOptions {
    /// Drop the entry's cached exports first
    pub force: bool,

    /// Expose test globals (`process.env.NODE_ENV = "test"`)
    pub test_globals: bool,
}

/// Options for `serialize`
#[derive(Debug, Clone, Default)]
pub struct SerializeOptions {
    pub entry_path: Option<String>,

    /// Skip modules the manifest can regenerate
    pub optimize_for_size: bool,
}

/// Orchestrator of the sandbox: owns the module store, the transpiled
/// module registry, the resolution engine and the evaluator, and drives
/// the transpilation/evaluation stages, HMR, and persistence.
pub struct Manager {
    id: String,
    preset: Arc<dyn Preset>,

    store: Rc<RefCell<ModuleStore>>,
    registry: Rc<RefCell<TmRegistry>>,
    manifest: Rc<RefCell<Manifest>>,
    resolution: Rc<ResolutionEngine>,
    evaluator: Evaluator,
    hmr: HmrBroadcast,

    configurations: ParsedConfigurations,
    env_variables: HashMap<String, String>,

    /// Known npm file paths, append-only per session
    combined_metas: RwLock<HashSet<String>>,

    file_resolver: Option<Arc<dyn FileResolver>>,
    fetcher: Option<Arc<dyn DependencyFetcher>>,

    /// Dedup set for the current transpile walk
    transpile_jobs: HashSet<u64>,

    /// Dirty modules that had been evaluated before the update; they are
    /// re-applied at the start of the next evaluation
    reapply_queue: Vec<u64>,

    pending_hard_reload: bool,
    webpack_hmr: bool,
    stage: Stage,
}

impl Manager {
    pub fn new(
        id: &str,
        preset: Arc<dyn Preset>,
        modules: HashMap<String, Module>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let mut store = ModuleStore::new();
        store.add(Module::empty_shim());
        for (path, module) in modules {
            debug_assert_eq!(path, module.path);
            store.add(module);
        }

        let manifest = Rc::new(RefCell::new(Manifest::default()));
        let resolution = Rc::new(ResolutionEngine::new(preset.clone(), manifest.clone()));

        let mut manager = Self {
            id: id.to_string(),
            preset,
            store: Rc::new(RefCell::new(store)),
            registry: Rc::new(RefCell::new(TmRegistry::new())),
            manifest,
            resolution,
            evaluator: Evaluator::new()?,
            hmr: HmrBroadcast::new(),
            configurations: ParsedConfigurations::default(),
            env_variables: HashMap::new(),
            combined_metas: RwLock::new(HashSet::new()),
            file_resolver: None,
            fetcher: None,
            transpile_jobs: HashSet::new(),
            reapply_queue: Vec::new(),
            pending_hard_reload: false,
            webpack_hmr: options.enable_webpack_hmr,
            stage: Stage::Transpilation,
        };

        manager.refresh_env();
        manager.resolution.set_options(manager.build_resolve_options());

        tracing::info!(
            "Initialized sandbox manager '{}' ({} modules, file resolver: {})",
            manager.id,
            manager.store.borrow().len(),
            options.has_file_resolver
        );
        Ok(manager)
    }

    pub fn with_file_resolver(mut self, resolver: Arc<dyn FileResolver>) -> Self {
        self.file_resolver = Some(resolver);
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DependencyFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn hmr_status(&self) -> HmrStatus {
        self.hmr.status()
    }

    pub fn subscribe_hmr(&self) -> tokio::sync::broadcast::Receiver<HmrStatus> {
        self.hmr.subscribe()
    }

    pub fn has_pending_hard_reload(&self) -> bool {
        self.pending_hard_reload
    }

    pub fn module_count(&self) -> usize {
        self.store.borrow().len()
    }

    pub fn has_module(&self, path: &str) -> bool {
        self.store.borrow().contains(path)
    }

    pub fn module_code(&self, path: &str) -> Option<String> {
        self.store.borrow().get(path).map(|module| module.code.clone())
    }

    pub fn transpiled_count(&self) -> usize {
        self.registry.borrow().len()
    }

    /// Snapshot of one transpiled module, for inspection
    pub fn transpiled_module(
        &self,
        path: &str,
        query: &str,
    ) -> Option<crate::transpiled_module::TranspiledModule> {
        let registry = self.registry.borrow();
        let hash = registry.hash_of(path, query)?;
        registry.get(hash).cloned()
    }

    pub fn cached_paths_is_empty(&self) -> bool {
        self.resolution.is_cache_empty()
    }

    pub fn env_variables(&self) -> &HashMap<String, String> {
        &self.env_variables
    }

    /// Resolution roots derived from tsconfig/jsconfig and `NODE_PATH`
    pub fn module_directories(&self) -> Vec<String> {
        module_directories(&self.configurations, &self.env_variables)
    }

    /// Synchronous read facade over the virtual FS
    pub fn read_file_sync(&self, path: &str) -> Result<String> {
        self.store
            .borrow()
            .get(path)
            .map(|module| module.code.clone())
            .ok_or_else(|| BundlerError::Enoent {
                path: path.to_string(),
            })
    }

    /// Synchronous resolution; agrees with the async sibling on identical
    /// inputs
    pub fn resolve_sync(&self, request: &str, from: &str) -> Result<String> {
        let (_, bare) = split_query(request);
        let store = self.store.borrow();
        self.resolution.resolve_module(&*store, &bare, from, &[])
    }

    /// Async resolution sibling; may fall back to the host file resolver
    /// and the dependency fetcher
    pub async fn resolve_async(&mut self, request: &str, from: &str) -> Result<String> {
        let (_, bare) = split_query(request);
        self.resolve_request_async(&bare, from).await
    }

    /// Absorb the packager's precomputed dependency bundle
    pub fn set_manifest(&mut self, manifest: Manifest) {
        tracing::info!(
            "Manifest set: {} files, {} dependencies",
            manifest.contents.len(),
            manifest.dependencies.len()
        );

        {
            let mut store = self.store.borrow_mut();
            let mut metas = self.combined_metas.write();
            for (path, entry) in &manifest.contents {
                let mut module = Module::new(path, &entry.content);
                module.requires = entry.requires.clone();
                store.add(module);
                metas.insert(path.clone());
            }
        }

        *self.manifest.borrow_mut() = manifest;

        // Unresolvable requests get retried on the next transpile pass
        let mut registry = self.registry.borrow_mut();
        for hash in registry.hashes() {
            if let Some(tm) = registry.get_mut(hash) {
                if tm.has_missing_dependencies {
                    tm.reset_transpilation();
                }
            }
        }
        drop(registry);

        self.resolution.clear_cached_paths();
    }

    /// Replace the set of known npm file paths (fetched manifest metas)
    pub fn set_combined_metas(&self, metas: HashSet<String>) {
        *self.combined_metas.write() = metas;
    }

    /// Deep-compare and swap the configuration bundle; a change resets
    /// every transpiled module
    pub fn update_configurations(&mut self, parsed: ParsedConfigurations) -> bool {
        if parsed == self.configurations {
            return false;
        }

        tracing::info!("Configurations changed, resetting transpilation state");
        self.configurations = parsed;

        let mut registry = self.registry.borrow_mut();
        for hash in registry.hashes() {
            if let Some(tm) = registry.get_mut(hash) {
                tm.reset_transpilation();
            }
            self.evaluator.invalidate(hash);
        }
        drop(registry);

        self.resolution.set_options(self.build_resolve_options());
        true
    }

    pub fn set_webpack_hmr(&mut self, enabled: bool) {
        self.webpack_hmr = enabled;
    }

    fn build_resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            extensions: self.preset.default_extensions(),
            module_directories: module_directories(&self.configurations, &self.env_variables),
            skip_browser_field: BROWSER_FIELD_OPT_OUT
                .iter()
                .map(|name| name.to_string())
                .collect(),
        }
    }

    fn refresh_env(&mut self) {
        if !self.preset.has_dot_env() {
            return;
        }
        let dot_env = self
            .store
            .borrow()
            .get("/.env")
            .map(|module| module.code.clone());
        if let Some(content) = dot_env {
            self.env_variables = parse_env(&content);
        }
    }

    fn active(&self) -> ActiveEvaluation {
        ActiveEvaluation {
            shared: self.evaluator.shared(),
            store: self.store.clone(),
            registry: self.registry.clone(),
            resolution: self.resolution.clone(),
            asset_extensions: self.preset.ignored_extensions(),
        }
    }

    // ---------------------------------------------------------------
    // Transpilation stage
    // ---------------------------------------------------------------

    /// Transpile the entry and everything reachable from it
    pub async fn transpile_modules(
        &mut self,
        entry_path: &str,
        is_test_file: bool,
    ) -> Result<Vec<u64>> {
        self.stage = Stage::Transpilation;
        self.hmr.set_status(HmrStatus::Check);

        if !self.store.borrow().contains(entry_path) {
            return Err(BundlerError::ModuleNotFound {
                path: entry_path.to_string(),
                is_dependency: false,
                from: "/".to_string(),
            });
        }

        let entry_hash = {
            let mut registry = self.registry.borrow_mut();
            let hash = registry.get_or_create(entry_path, "");
            if let Some(tm) = registry.get_mut(hash) {
                tm.is_entry = true;
                tm.is_test_file = is_test_file;
            }
            hash
        };

        self.transpile_walk(vec![entry_hash]).await
    }

    /// Work-queue walk over the compile graph; each node is transpiled at
    /// most once per walk
    async fn transpile_walk(&mut self, starts: Vec<u64>) -> Result<Vec<u64>> {
        self.transpile_jobs.clear();
        let mut queue = starts;
        let mut transpiled = Vec::new();

        while let Some(hash) = queue.pop() {
            if !self.transpile_jobs.insert(hash) {
                continue;
            }

            let should = match self.registry.borrow().get(hash) {
                Some(tm) => tm.should_transpile(),
                None => continue,
            };

            if should {
                self.transpile_one(hash).await?;
                transpiled.push(hash);
            }

            let registry = self.registry.borrow();
            if let Some(tm) = registry.get(hash) {
                queue.extend(tm.dependencies.iter().copied());
                queue.extend(tm.transpilation_dependencies.iter().copied());
            }
        }

        tracing::debug!("Transpiled {} modules", transpiled.len());
        Ok(transpiled)
    }

    /// Run one module through its loader chain and reconnect its edges
    async fn transpile_one(&mut self, hash: u64) -> Result<()> {
        let (path, query) = {
            let registry = self.registry.borrow();
            let tm = registry.get(hash).ok_or_else(|| BundlerError::Transpile {
                path: String::new(),
                message: "unknown transpiled module".to_string(),
            })?;
            (tm.path.clone(), tm.query.clone())
        };

        let module = self
            .store
            .borrow()
            .get(&path)
            .cloned()
            .ok_or_else(|| BundlerError::ModuleNotFound {
                path: path.clone(),
                is_dependency: false,
                from: "/".to_string(),
            })?;

        tracing::debug!("Transpiling {}{}", query, path);

        // Old children and edges do not survive a retranspile
        let old_children = {
            let mut registry = self.registry.borrow_mut();
            registry.clear_dependencies(hash);
            registry
                .get_mut(hash)
                .map(|tm| {
                    tm.errors.clear();
                    tm.warnings.clear();
                    tm.has_missing_dependencies = false;
                    tm.assets.clear();
                    std::mem::take(&mut tm.child_modules)
                })
                .unwrap_or_default()
        };
        for child in old_children {
            let hashes = self.registry.borrow().hashes_for_path(&child);
            for child_hash in hashes {
                self.registry.borrow_mut().dispose(child_hash);
                self.evaluator.invalidate(child_hash);
            }
            self.store.borrow_mut().remove(&child);
        }

        let (code, source_map, runtime_requests, transpilation_requests) =
            if module.requires.is_some() && query.is_empty() {
                // Pretranspiled by the packager; the chain is skipped
                let requests = module.requires.clone().unwrap_or_default();
                (module.code.clone(), None, requests, Vec::new())
            } else {
                self.run_loader_chain(hash, &module, &query).await?
            };

        // Runtime dependency edges
        for request in runtime_requests {
            let (request_query, bare) = split_query(&request);
            let resolved = match self.resolve_request_async(&bare, &path).await {
                Ok(resolved) => resolved,
                Err(err) => {
                    let mut registry = self.registry.borrow_mut();
                    if let Some(tm) = registry.get_mut(hash) {
                        tm.has_missing_dependencies = true;
                        tm.errors.push(ModuleError {
                            path: path.clone(),
                            message: err.to_string(),
                        });
                    }
                    return Err(err);
                }
            };
            let mut registry = self.registry.borrow_mut();
            let target = registry.get_or_create(&resolved, &request_query);
            registry.add_dependency(hash, target);
        }

        // Compile-time dependency edges
        for request in transpilation_requests {
            let (request_query, bare) = split_query(&request);
            let resolved = self.resolve_request_async(&bare, &path).await?;
            let mut registry = self.registry.borrow_mut();
            let target = registry.get_or_create(&resolved, &request_query);
            registry.add_transpilation_dependency(hash, target);
        }

        {
            let mut registry = self.registry.borrow_mut();
            if let Some(tm) = registry.get_mut(hash) {
                tm.source = Some(TranspiledSource { code, source_map });
                tm.compilation = None;
            }
        }
        self.evaluator.invalidate(hash);

        Ok(())
    }

    /// Execute the preset's loader chain for one module
    async fn run_loader_chain(
        &mut self,
        hash: u64,
        module: &Module,
        query: &str,
    ) -> Result<(String, Option<String>, Vec<String>, Vec<String>)> {
        let loaders = self.preset.get_loaders(module, query);

        // Stages see a snapshot, not the live store
        let snapshot: HashMap<String, String> = self
            .store
            .borrow()
            .modules()
            .map(|entry| (entry.path.clone(), entry.code.clone()))
            .collect();

        let options = serde_json::to_value(&self.configurations)?;
        let mut ctx = LoaderContext::new(
            &module.path,
            query,
            options,
            self.env_variables.clone(),
            &snapshot,
        );

        let mut code = module.code.clone();
        let mut source_map = None;
        for loader in loaders {
            tracing::debug!("Running {} on {}", loader.name(), module.path);
            let output = loader
                .transpile(code, &mut ctx)
                .await
                .map_err(|err| {
                    let error = BundlerError::Transpile {
                        path: module.path.clone(),
                        message: err.to_string(),
                    };
                    let mut registry = self.registry.borrow_mut();
                    if let Some(tm) = registry.get_mut(hash) {
                        tm.errors.push(ModuleError {
                            path: module.path.clone(),
                            message: error.to_string(),
                        });
                    }
                    error
                })?;
            code = output.code;
            if output.source_map.is_some() {
                source_map = output.source_map;
            }
        }

        let collected = ctx.into_collected();

        {
            let mut store = self.store.borrow_mut();
            let mut registry = self.registry.borrow_mut();
            for child in &collected.emitted_modules {
                store.add(child.clone());
                if let Some(tm) = registry.get_mut(hash) {
                    tm.child_modules.push(child.path.clone());
                }
            }
            if let Some(tm) = registry.get_mut(hash) {
                tm.assets = collected.assets;
            }
        }

        Ok((
            code,
            source_map,
            collected.dependencies,
            collected.transpilation_dependencies,
        ))
    }

    /// Resolve with async fallbacks: the host file resolver first, then
    /// an on-demand dependency fetch
    async fn resolve_request_async(&mut self, request: &str, from: &str) -> Result<String> {
        let initial = {
            let store = self.store.borrow();
            self.resolution.resolve_module(&*store, request, from, &[])
        };
        let err = match initial {
            Ok(resolved) => return Ok(resolved),
            Err(err) => err,
        };

        if let Some(resolver) = self.file_resolver.clone() {
            if self.fetch_from_host(&resolver, request, from).await {
                let store = self.store.borrow();
                if let Ok(resolved) =
                    self.resolution.resolve_module(&*store, request, from, &[])
                {
                    return Ok(resolved);
                }
            }
        }

        if err.is_retryable_after_fetch() {
            if let Some(fetcher) = self.fetcher.clone() {
                let name = match &err {
                    BundlerError::DependencyNotFound { name, .. } => name.clone(),
                    _ => paths::node_modules_package(&format!("/node_modules/{}", request))
                        .unwrap_or_else(|| request.to_string()),
                };
                if self.download_dependency(&*fetcher, &name).await {
                    let store = self.store.borrow();
                    if let Ok(resolved) =
                        self.resolution.resolve_module(&*store, request, from, &[])
                    {
                        return Ok(resolved);
                    }
                }
            }
        }

        Err(err)
    }

    /// Ask the host for the files resolution would have probed; returns
    /// whether anything was added to the store
    async fn fetch_from_host(
        &mut self,
        resolver: &Arc<dyn FileResolver>,
        request: &str,
        from: &str,
    ) -> bool {
        let base = if request.starts_with("./") || request.starts_with("../") {
            paths::join(&paths::dirname(from), request)
        } else if request.starts_with('/') {
            paths::normalize(request)
        } else {
            format!("/node_modules/{}", request)
        };

        let mut candidates = vec![base.clone(), format!("{}/package.json", base)];
        for ext in self.preset.default_extensions() {
            candidates.push(format!("{}{}", base, ext));
            candidates.push(format!("{}/index{}", base, ext));
        }
        candidates.retain(|candidate| !self.store.borrow().contains(candidate));

        // Probe everything in one round trip; the bridge correlates
        // responses by id
        let checks = join_all(
            candidates
                .iter()
                .map(|candidate| resolver.is_file(candidate)),
        )
        .await;
        let hits: Vec<String> = candidates
            .into_iter()
            .zip(checks)
            .filter_map(|(candidate, check)| matches!(check, Ok(true)).then_some(candidate))
            .collect();

        let contents = join_all(hits.iter().map(|candidate| resolver.read_file(candidate))).await;

        let mut added = false;
        for (candidate, content) in hits.iter().zip(contents) {
            if let Ok(Some(content)) = content {
                tracing::debug!("Host resolver supplied {}", candidate);
                self.store.borrow_mut().add(Module::new(candidate, &content));
                added = true;
            }
        }

        if added {
            self.resolution.clear_cached_paths();
        }
        added
    }

    /// Fetch a dependency from the registry and feed its files into the
    /// store; returns whether anything was added
    async fn download_dependency(&mut self, fetcher: &dyn DependencyFetcher, name: &str) -> bool {
        let version = self
            .manifest
            .borrow()
            .resolved_version(name)
            .unwrap_or_else(|| "latest".to_string());

        tracing::info!("Downloading dependency {}@{}", name, version);
        let package = match fetcher.fetch_package(name, &version).await {
            Ok(package) => package,
            Err(err) => {
                tracing::warn!("Dependency fetch failed for {}: {}", name, err);
                return false;
            }
        };

        {
            let mut store = self.store.borrow_mut();
            let mut metas = self.combined_metas.write();
            for (relative, content) in &package.files {
                let path = format!("/node_modules/{}/{}", name, relative);
                let mut module = Module::new(&path, content);
                module.downloaded = true;
                store.add(module);
                metas.insert(path);
            }
        }
        self.resolution.clear_cached_paths();
        true
    }

    // ---------------------------------------------------------------
    // Evaluation stage
    // ---------------------------------------------------------------

    /// Evaluate the entry, re-applying dirty modules first
    pub fn evaluate_module(
        &mut self,
        entry_path: &str,
        options: EvaluationOptions,
    ) -> Result<serde_json::Value> {
        self.stage = Stage::Evaluation;

        if self.pending_hard_reload {
            self.pending_hard_reload = false;
            self.hmr.set_status(HmrStatus::Fail);
            self.perform_hard_reset(options.test_globals)?;
        }
        self.evaluator
            .set_env(&self.env_variables, options.test_globals)?;

        let entry_hash = self
            .registry
            .borrow()
            .hash_of(entry_path, "")
            .ok_or_else(|| BundlerError::ModuleNotFound {
                path: entry_path.to_string(),
                is_dependency: false,
                from: "/".to_string(),
            })?;

        if !self.webpack_hmr {
            if let Err(err) = self.apply_hot_updates(options.test_globals) {
                self.hmr.set_status(HmrStatus::Fail);
                return Err(err);
            }
        }

        if options.force {
            self.evaluator.invalidate(entry_hash);
            if let Some(tm) = self.registry.borrow_mut().get_mut(entry_hash) {
                tm.reset_compilation();
            }
        }

        let active = self.active();
        let result = self.evaluator.evaluate(entry_hash, active);

        match result {
            Ok(exports) => {
                let mut registry = self.registry.borrow_mut();
                for hash in registry.hashes() {
                    if let Some(tm) = registry.get_mut(hash) {
                        tm.hmr_config.post_evaluate();
                    }
                }
                drop(registry);

                self.hmr.set_status(HmrStatus::Idle);
                Ok(exports)
            }
            Err(err) => {
                self.hmr.set_status(HmrStatus::Fail);
                if self.configurations.sandbox.hard_reload_on_change {
                    self.pending_hard_reload = true;
                }
                Err(err)
            }
        }
    }

    /// Re-evaluate dirty modules before normal evaluation resumes
    fn apply_hot_updates(&mut self, test_globals: bool) -> Result<()> {
        let dirty: Vec<u64> = {
            let registry = self.registry.borrow();
            registry
                .hashes()
                .into_iter()
                .filter(|hash| {
                    registry
                        .get(*hash)
                        .map(|tm| tm.hmr_config.dirty)
                        .unwrap_or(false)
                })
                .collect()
        };
        if dirty.is_empty() {
            return Ok(());
        }

        let force_reload = {
            let registry = self.registry.borrow();
            dirty.iter().any(|hash| {
                registry
                    .get(*hash)
                    .map(|tm| tm.hmr_config.declined)
                    .unwrap_or(false)
            })
        };
        if force_reload {
            tracing::warn!("Dirty declined module, forcing hard reload");
            self.hmr.set_status(HmrStatus::Fail);
            self.perform_hard_reset(test_globals)?;
            return Ok(());
        }

        self.hmr.set_status(HmrStatus::Apply);

        let mut reapply = std::mem::take(&mut self.reapply_queue);
        reapply.sort_unstable();
        reapply.dedup();

        for hash in reapply {
            if !self.registry.borrow().contains(hash) {
                continue;
            }
            {
                let mut registry = self.registry.borrow_mut();
                if let Some(tm) = registry.get_mut(hash) {
                    tm.hmr_config.reset_runtime_state();
                }
            }
            self.evaluator.run_dispose(hash);

            let active = self.active();
            self.evaluator.evaluate(hash, active)?;

            let active = self.active();
            self.evaluator.fire_accept_callbacks(hash, active);
        }

        Ok(())
    }

    /// The in-process rendition of reloading the host page
    fn perform_hard_reset(&mut self, test_globals: bool) -> Result<()> {
        self.evaluator.hard_reset()?;
        self.evaluator.set_env(&self.env_variables, test_globals)?;
        self.reapply_queue.clear();

        let mut registry = self.registry.borrow_mut();
        for hash in registry.hashes() {
            if let Some(tm) = registry.get_mut(hash) {
                tm.reset_compilation();
                tm.hmr_config.post_evaluate();
                tm.hmr_config.reset_runtime_state();
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Incremental update
    // ---------------------------------------------------------------

    /// Diff a full new module map against the store, invalidate what
    /// changed, and retranspile the dirty set
    pub async fn update_data(
        &mut self,
        modules: HashMap<String, Module>,
    ) -> Result<Vec<u64>> {
        self.stage = Stage::Transpilation;
        self.hmr.set_status(HmrStatus::Check);

        // Captured up front: the diff is computed against this snapshot
        let existing: Vec<(String, String)> = self
            .store
            .borrow()
            .modules()
            .filter(|module| {
                !module.is_child()
                    && module.path != EMPTY_SHIM_PATH
                    && !module.path.starts_with("/node_modules")
            })
            .map(|module| (module.path.clone(), module.code.clone()))
            .collect();

        let mut added = Vec::new();
        let mut updated = Vec::new();
        for (path, module) in &modules {
            match existing.iter().find(|(existing_path, _)| existing_path == path) {
                None => added.push(module.clone()),
                Some((_, existing_code)) if existing_code != &module.code => {
                    updated.push(module.clone())
                }
                Some(_) => {}
            }
        }
        let deleted: Vec<String> = existing
            .iter()
            .filter(|(path, _)| !modules.contains_key(path))
            .map(|(path, _)| path.clone())
            .collect();

        let changed = !added.is_empty() || !updated.is_empty() || !deleted.is_empty();
        tracing::debug!(
            "update_data: {} added, {} updated, {} deleted",
            added.len(),
            updated.len(),
            deleted.len()
        );

        if changed {
            self.resolution.clear_cached_paths();
        }

        for path in &deleted {
            let hashes = self.registry.borrow().hashes_for_path(path);
            for hash in hashes {
                self.registry.borrow_mut().dispose(hash);
                self.evaluator.invalidate(hash);
            }
            self.store.borrow_mut().remove(path);
        }

        for module in &added {
            self.store.borrow_mut().add(module.clone());
            self.registry.borrow_mut().get_or_create(&module.path, "");
        }

        let previously_evaluated: HashSet<u64> = {
            let registry = self.registry.borrow();
            registry
                .hashes()
                .into_iter()
                .filter(|hash| {
                    registry
                        .get(*hash)
                        .map(|tm| tm.compilation.is_some())
                        .unwrap_or(false)
                })
                .collect()
        };

        let mut retranspile: HashSet<u64> = HashSet::new();
        for module in &updated {
            self.store.borrow_mut().update(module.clone());
            let hashes = self.registry.borrow().hashes_for_path(&module.path);
            for hash in hashes {
                let (rebuilt, invalidated) = self.registry.borrow_mut().propagate_update(hash);
                for affected in rebuilt.iter().chain(invalidated.iter()) {
                    self.evaluator.invalidate(*affected);
                }
                for dirty in &rebuilt {
                    if previously_evaluated.contains(dirty) {
                        self.reapply_queue.push(*dirty);
                    }
                }
                retranspile.extend(rebuilt);
            }
        }

        // Modules that failed on a missing dependency get another chance
        {
            let mut registry = self.registry.borrow_mut();
            for hash in registry.hashes() {
                if let Some(tm) = registry.get_mut(hash) {
                    if tm.has_missing_dependencies {
                        tm.reset_transpilation();
                        retranspile.insert(hash);
                    }
                }
            }
        }

        self.refresh_env();

        let mut starts: Vec<u64> = retranspile.into_iter().collect();
        starts.sort_unstable();
        let transpiled = self.transpile_walk(starts).await?;

        if changed && self.configurations.sandbox.hard_reload_on_change {
            self.pending_hard_reload = true;
        }

        Ok(transpiled)
    }

    // ---------------------------------------------------------------
    // Persistence
    // ---------------------------------------------------------------

    pub fn serialize(&self, options: SerializeOptions) -> SerializedSandbox {
        let registry = self.registry.borrow();
        let store = self.store.borrow();
        let manifest = self.manifest.borrow();

        let mut transpiled_modules = Vec::new();
        for hash in registry.hashes() {
            let Some(tm) = registry.get(hash) else { continue };

            if options.optimize_for_size && self.is_precomputed(&store, &manifest, &tm.path) {
                continue;
            }
            transpiled_modules.push(SerializedTranspiledModule::from_tm(tm));
        }
        transpiled_modules.sort_by(|left, right| left.hash.cmp(&right.hash));

        let entry = options.entry_path.clone().or_else(|| {
            registry
                .hashes()
                .into_iter()
                .filter_map(|hash| registry.get(hash))
                .find(|tm| tm.is_entry)
                .map(|tm| tm.path.clone())
        });

        let metas = self.combined_metas.read();
        SerializedSandbox {
            transpiled_modules,
            cached_paths: self.resolution.cached_paths_snapshot(),
            version: SCRIPT_VERSION.to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
            configurations: self.configurations.clone(),
            entry,
            meta: meta_index(metas.iter()),
            dependencies_query: manifest.dependencies_query(),
        }
    }

    /// A module the manifest can regenerate does not need persisting
    fn is_precomputed(&self, store: &ModuleStore, manifest: &Manifest, path: &str) -> bool {
        if !manifest.contents.contains_key(path) {
            return false;
        }
        match store.get(path) {
            Some(module) => module.requires.is_some() && !module.downloaded,
            None => false,
        }
    }

    /// Restore a serialized graph. Returns `false` (leaving the registry
    /// untouched) when the version or dependency set does not match.
    pub fn load(&mut self, data: SerializedSandbox) -> Result<bool> {
        if data.version != SCRIPT_VERSION {
            tracing::debug!(
                "Discarding cache: version '{}' != '{}'",
                data.version,
                SCRIPT_VERSION
            );
            return Ok(false);
        }
        if data.dependencies_query != self.manifest.borrow().dependencies_query() {
            tracing::debug!("Discarding cache: dependency set changed");
            return Ok(false);
        }

        self.configurations = data.configurations.clone();
        self.resolution.set_options(self.build_resolve_options());

        // Phase one: instantiate every node so all hashes exist
        {
            let mut registry = self.registry.borrow_mut();
            registry.clear();
            for serialized in &data.transpiled_modules {
                registry.insert(serialized.instantiate());
            }
        }

        // Phase two: reconnect edges by hash; a broken reference resets
        // that module instead of restoring it half-wired
        {
            let mut registry = self.registry.borrow_mut();
            for serialized in &data.transpiled_modules {
                let Some(hash) = crucible_common::hash_from_hex(&serialized.hash) else {
                    continue;
                };

                let edges = [
                    SerializedTranspiledModule::parse_edges(&serialized.dependencies),
                    SerializedTranspiledModule::parse_edges(
                        &serialized.transpilation_dependencies,
                    ),
                    SerializedTranspiledModule::parse_edges(&serialized.initiators),
                    SerializedTranspiledModule::parse_edges(
                        &serialized.transpilation_initiators,
                    ),
                ];

                let all_known = edges.iter().all(|set| {
                    set.as_ref()
                        .map(|hashes| hashes.iter().all(|hash| registry.contains(*hash)))
                        .unwrap_or(false)
                });

                if let Some(tm) = registry.get_mut(hash) {
                    if all_known {
                        let [deps, transpilation_deps, initiators, transpilation_initiators] =
                            edges;
                        tm.dependencies = deps.unwrap_or_default();
                        tm.transpilation_dependencies = transpilation_deps.unwrap_or_default();
                        tm.initiators = initiators.unwrap_or_default();
                        tm.transpilation_initiators =
                            transpilation_initiators.unwrap_or_default();
                    } else {
                        tracing::debug!(
                            "Broken edge references for {}, resetting",
                            serialized.path
                        );
                        tm.reset_transpilation();
                    }
                }
            }
        }

        self.resolution.restore_cached_paths(data.cached_paths);

        {
            let mut metas = self.combined_metas.write();
            for (dir, files) in &data.meta {
                for file in files {
                    metas.insert(format!("{}/{}", dir.trim_end_matches('/'), file));
                }
            }
        }

        tracing::info!(
            "Restored {} transpiled modules from cache",
            self.registry.borrow().len()
        );
        Ok(true)
    }

    /// Persist through a cache store
    pub fn save_cache(
        &self,
        store: &dyn crate::cache::CacheStore,
        options: SerializeOptions,
    ) -> Result<()> {
        let data = self.serialize(options);
        crate::cache::save_cache(store, &self.id, &data)
    }

    /// Restore from a cache store, if a matching record exists
    pub fn load_cache(&mut self, store: &dyn crate::cache::CacheStore) -> Result<bool> {
        match crate::cache::load_cache(store, &self.id) {
            Some(data) => self.load(data),
            None => Ok(false),
        }
    }

    /// Drop the persisted record for this sandbox
    pub fn delete_api_cache(&self, store: &dyn crate::cache::CacheStore) {
        crate::cache::delete_cache(store, &self.id);
    }

    // ---------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------

    /// Reset every session-scoped cache
    pub fn clear_cache(&mut self) -> Result<()> {
        self.registry.borrow_mut().clear();
        self.resolution.clear_cached_paths();
        self.combined_metas.write().clear();
        self.reapply_queue.clear();
        self.evaluator.hard_reset()?;
        Ok(())
    }

    /// Tear the sandbox down
    pub fn dispose(&mut self) -> Result<()> {
        self.hmr.set_status(HmrStatus::Dispose);
        self.preset.dispose();
        self.clear_cache()?;
        self.store.borrow_mut().clear();
        tracing::info!("Disposed sandbox manager '{}'", self.id);
        Ok(())
    }
}
