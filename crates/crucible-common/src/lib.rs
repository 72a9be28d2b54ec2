//! Shared primitives for the crucible crates: virtual path handling,
//! loader-query splitting, and stable module hashing.

pub mod hash;
pub mod paths;
pub mod query;

pub use hash::{hash_from_hex, hash_to_hex, module_hash};
pub use query::{split_query, with_query};

/// Request sentinel that always resolves to the empty shim
pub const EMPTY_SHIM_REQUEST: &str = "//empty.js";

/// Canonical virtual path of the empty shim module
pub const EMPTY_SHIM_PATH: &str = "/node_modules/empty/index.js";

/// Content of the empty shim module
pub const EMPTY_SHIM_CODE: &str = "// empty";
