use serde::{Deserialize, Serialize};

/// A single source file in the virtual file system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    /// Absolute POSIX path; unique per module in the store
    pub path: String,

    pub code: String,

    /// Literal request strings, supplied when the packager pretranspiled
    /// this file. Such modules skip the transpiler chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<Vec<String>>,

    /// Set when the module was fetched from the registry at runtime
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub downloaded: bool,

    /// Path of the transpiled module that emitted this one, when this is
    /// a loader child (e.g. extracted CSS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl Module {
    pub fn new(path: &str, code: &str) -> Self {
        Self {
            path: path.to_string(),
            code: code.to_string(),
            requires: None,
            downloaded: false,
            parent: None,
        }
    }

    /// The empty shim injected for Node built-ins
    pub fn empty_shim() -> Self {
        Self::new(
            crucible_common::EMPTY_SHIM_PATH,
            crucible_common::EMPTY_SHIM_CODE,
        )
    }

    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }
}
