use std::collections::{HashMap, HashSet};

use crucible_common::module_hash;

use crate::transpiled_module::TranspiledModule;

/// Central owner of all transpiled modules
///
/// Nodes live here, indexed by hash; the per-path variant table maps
/// `(path, query)` back to hashes. Neighbors refer to each other by hash
/// only, so disposal is explicit edge surgery rather than dropping
/// reference cycles.
#[derive(Debug, Default)]
pub struct TmRegistry {
    by_hash: HashMap<u64, TranspiledModule>,

    /// path -> query -> hash
    variants: HashMap<String, HashMap<String, u64>>,
}

impl TmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the variant for `(path, query)`, creating it lazily
    pub fn get_or_create(&mut self, path: &str, query: &str) -> u64 {
        if let Some(hash) = self.hash_of(path, query) {
            return hash;
        }

        let tm = TranspiledModule::new(path, query);
        let hash = tm.hash;
        self.by_hash.insert(hash, tm);
        self.variants
            .entry(path.to_string())
            .or_default()
            .insert(query.to_string(), hash);

        tracing::debug!("Created transpiled module {}{}", query, path);
        hash
    }

    pub fn hash_of(&self, path: &str, query: &str) -> Option<u64> {
        let hash = module_hash(path, query);
        self.by_hash.contains_key(&hash).then_some(hash)
    }

    pub fn get(&self, hash: u64) -> Option<&TranspiledModule> {
        self.by_hash.get(&hash)
    }

    pub fn get_mut(&mut self, hash: u64) -> Option<&mut TranspiledModule> {
        self.by_hash.get_mut(&hash)
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.by_hash.contains_key(&hash)
    }

    /// All variants of one source path
    pub fn hashes_for_path(&self, path: &str) -> Vec<u64> {
        self.variants
            .get(path)
            .map(|queries| queries.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn hashes(&self) -> Vec<u64> {
        self.by_hash.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Insert a fully-formed module (cache restore path)
    pub fn insert(&mut self, tm: TranspiledModule) {
        self.variants
            .entry(tm.path.clone())
            .or_default()
            .insert(tm.query.clone(), tm.hash);
        self.by_hash.insert(tm.hash, tm);
    }

    /// Remove a module and erase it from every neighbor's edge sets
    ///
    /// Returns the disposed module. Surviving initiators are left with a
    /// missing dependency so the break surfaces on the next transpile.
    pub fn dispose(&mut self, hash: u64) -> Option<TranspiledModule> {
        let tm = self.by_hash.remove(&hash)?;

        if let Some(queries) = self.variants.get_mut(&tm.path) {
            queries.retain(|_, candidate| *candidate != hash);
            if queries.is_empty() {
                self.variants.remove(&tm.path);
            }
        }

        for dep in &tm.dependencies {
            if let Some(neighbor) = self.by_hash.get_mut(dep) {
                neighbor.initiators.remove(&hash);
            }
        }
        for dep in &tm.transpilation_dependencies {
            if let Some(neighbor) = self.by_hash.get_mut(dep) {
                neighbor.transpilation_initiators.remove(&hash);
            }
        }
        for initiator in &tm.initiators {
            if let Some(neighbor) = self.by_hash.get_mut(initiator) {
                neighbor.dependencies.remove(&hash);
                neighbor.has_missing_dependencies = true;
            }
        }
        for initiator in &tm.transpilation_initiators {
            if let Some(neighbor) = self.by_hash.get_mut(initiator) {
                neighbor.transpilation_dependencies.remove(&hash);
                neighbor.has_missing_dependencies = true;
            }
        }

        tracing::debug!("Disposed transpiled module {}{}", tm.query, tm.path);
        Some(tm)
    }

    /// Add a runtime dependency edge (and its reverse)
    pub fn add_dependency(&mut self, from: u64, to: u64) {
        if let Some(tm) = self.by_hash.get_mut(&from) {
            tm.dependencies.insert(to);
        }
        if let Some(tm) = self.by_hash.get_mut(&to) {
            tm.initiators.insert(from);
        }
    }

    /// Add a compile-time dependency edge (and its reverse)
    pub fn add_transpilation_dependency(&mut self, from: u64, to: u64) {
        if let Some(tm) = self.by_hash.get_mut(&from) {
            tm.transpilation_dependencies.insert(to);
        }
        if let Some(tm) = self.by_hash.get_mut(&to) {
            tm.transpilation_initiators.insert(from);
        }
    }

    /// Detach all outgoing edges of a module, before retranspilation
    pub fn clear_dependencies(&mut self, hash: u64) {
        let (deps, transpilation_deps) = match self.by_hash.get_mut(&hash) {
            Some(tm) => (
                std::mem::take(&mut tm.dependencies),
                std::mem::take(&mut tm.transpilation_dependencies),
            ),
            None => return,
        };

        for dep in deps {
            if let Some(neighbor) = self.by_hash.get_mut(&dep) {
                neighbor.initiators.remove(&hash);
            }
        }
        for dep in transpilation_deps {
            if let Some(neighbor) = self.by_hash.get_mut(&dep) {
                neighbor.transpilation_initiators.remove(&hash);
            }
        }
    }

    /// Propagate an update: the module itself and its transpilation
    /// initiators are retranspiled and marked dirty; every transitive
    /// initiator loses its cached compilation.
    ///
    /// Returns `(retranspile set, invalidated set)`.
    pub fn propagate_update(&mut self, start: u64) -> (HashSet<u64>, HashSet<u64>) {
        let mut retranspile = HashSet::new();
        let mut invalidated = HashSet::new();

        // Transpilation initiators are rebuilt transitively
        let mut queue = vec![start];
        while let Some(hash) = queue.pop() {
            if !retranspile.insert(hash) {
                continue;
            }
            if let Some(tm) = self.by_hash.get_mut(&hash) {
                tm.update();
                queue.extend(tm.transpilation_initiators.iter().copied());
            }
        }

        // Runtime initiators only lose their evaluation result
        let mut queue: Vec<u64> = retranspile.iter().copied().collect();
        let mut seen: HashSet<u64> = retranspile.clone();
        while let Some(hash) = queue.pop() {
            let initiators: Vec<u64> = match self.by_hash.get(&hash) {
                Some(tm) => tm.initiators.iter().copied().collect(),
                None => continue,
            };
            for initiator in initiators {
                if seen.insert(initiator) {
                    if let Some(tm) = self.by_hash.get_mut(&initiator) {
                        tm.reset_compilation();
                    }
                    invalidated.insert(initiator);
                    queue.push(initiator);
                }
            }
        }

        (retranspile, invalidated)
    }

    pub fn clear(&mut self) {
        self.by_hash.clear();
        self.variants.clear();
    }
}
