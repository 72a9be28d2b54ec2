//! In-process bundling and evaluation engine for a sandboxed code
//! playground.
//!
//! A virtual file system of source modules plus a precomputed dependency
//! manifest go in; the engine resolves inter-module references, drives
//! per-module transpilation through a pluggable preset, evaluates the
//! resulting graph inside an embedded JavaScript context, and applies hot
//! module replacement when files change. The transpile graph can be
//! serialized and restored across reloads.

pub mod cache;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod hmr;
pub mod manager;
pub mod module;
pub mod preset;
pub mod registry;
pub mod resolve;
pub mod scanner;
pub mod store;
pub mod transpiled_module;
pub mod vanilla;

pub use cache::{CacheStore, MemoryCacheStore, SerializedSandbox};
pub use config::{ParsedConfigurations, SandboxConfig};
pub use error::{BundlerError, Result};
pub use hmr::{HmrConfig, HmrState, HmrStatus};
pub use manager::{EvaluationOptions, Manager, ManagerOptions, SerializeOptions, Stage};
pub use module::Module;
pub use preset::{LoaderContext, Preset, Transpiler, TranspilerOutput};
pub use store::ModuleStore;
pub use transpiled_module::{TranspiledModule, TranspiledSource};
pub use vanilla::VanillaPreset;

/// Version stamp persisted with serialized caches; a mismatch discards
/// the cache
pub const SCRIPT_VERSION: &str = env!("CARGO_PKG_VERSION");
