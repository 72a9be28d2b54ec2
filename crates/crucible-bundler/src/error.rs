//! Error types for the bundling and evaluation engine

use thiserror::Error;

/// Result type alias for bundler operations
pub type Result<T> = std::result::Result<T, BundlerError>;

/// Unified error type for bundler operations
#[derive(Error, Debug, Clone)]
pub enum BundlerError {
    /// Resolution failed. `is_dependency` is true when the target lies
    /// under a `node_modules` name the manifest knows about.
    #[error("Cannot find module '{path}' from '{from}'")]
    ModuleNotFound {
        path: String,
        is_dependency: bool,
        from: String,
    },

    /// Resolution reached a `node_modules` package the manifest does not
    /// provide
    #[error("Dependency '{name}' not found (required from '{from}')")]
    DependencyNotFound { name: String, from: String },

    /// A transpiler stage threw
    #[error("Transpilation of '{path}' failed: {message}")]
    Transpile { path: String, message: String },

    /// A runtime exception during evaluation
    #[error("Evaluation of '{path}' failed: {message}")]
    Evaluation { path: String, message: String },

    /// Persisted cache was produced by a different engine version or
    /// dependency set. Non-fatal; the cache is discarded.
    #[error("Cache version mismatch: expected '{expected}', found '{found}'")]
    CacheVersionMismatch { expected: String, found: String },

    /// The synchronous read facade found nothing in the store and had no
    /// file resolver to ask
    #[error("ENOENT: no such file '{path}'")]
    Enoent { path: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BundlerError {
    /// Whether a manifest refresh or dependency fetch could fix this
    pub fn is_retryable_after_fetch(&self) -> bool {
        matches!(
            self,
            BundlerError::DependencyNotFound { .. }
                | BundlerError::ModuleNotFound {
                    is_dependency: true,
                    ..
                }
        )
    }
}

impl From<serde_json::Error> for BundlerError {
    fn from(err: serde_json::Error) -> Self {
        BundlerError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_module_not_found() {
        let err = BundlerError::ModuleNotFound {
            path: "/src/missing.js".to_string(),
            is_dependency: false,
            from: "/src/index.js".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Cannot find module '/src/missing.js' from '/src/index.js'"
        );
    }

    #[test]
    fn test_error_display_dependency_not_found() {
        let err = BundlerError::DependencyNotFound {
            name: "lodash".to_string(),
            from: "/src/index.js".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Dependency 'lodash' not found (required from '/src/index.js')"
        );
    }

    #[test]
    fn test_is_retryable_after_fetch() {
        assert!(BundlerError::DependencyNotFound {
            name: "lodash".to_string(),
            from: "/".to_string(),
        }
        .is_retryable_after_fetch());
        assert!(!BundlerError::Enoent {
            path: "/a".to_string()
        }
        .is_retryable_after_fetch());
    }
}
