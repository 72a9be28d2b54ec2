//! Umbrella crate for the crucible sandbox engine.

pub use crucible_bridge as bridge;
pub use crucible_bundler as bundler;
pub use crucible_common as common;
pub use crucible_pkg as pkg;
pub use crucible_resolver as resolver;

pub use crucible_bundler::{
    BundlerError, EvaluationOptions, HmrStatus, Manager, ManagerOptions, Module, Preset,
    SerializeOptions, VanillaPreset, SCRIPT_VERSION,
};
pub use crucible_pkg::Manifest;
