use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sandbox behavior switches, from `sandbox.config.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxConfig {
    /// Any file change schedules a hard reload instead of HMR
    pub hard_reload_on_change: bool,
}

/// Parsed configuration files the engine reacts to
///
/// Any change resets every transpiled module: configuration may affect
/// every transpiler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParsedConfigurations {
    /// package.json, verbatim
    pub package: Option<serde_json::Value>,

    /// tsconfig.json, verbatim
    pub typescript: Option<serde_json::Value>,

    /// jsconfig.json, verbatim
    pub javascript: Option<serde_json::Value>,

    pub sandbox: SandboxConfig,
}

impl ParsedConfigurations {
    /// `compilerOptions.baseUrl` from tsconfig, else jsconfig
    pub fn base_url(&self) -> Option<String> {
        for config in [&self.typescript, &self.javascript] {
            if let Some(base_url) = config
                .as_ref()
                .and_then(|value| value.get("compilerOptions"))
                .and_then(|options| options.get("baseUrl"))
                .and_then(|value| value.as_str())
            {
                return Some(base_url.to_string());
            }
        }
        None
    }
}

/// Build the resolution roots: `node_modules`, the configured `baseUrl`,
/// and `NODE_PATH` entries
pub fn module_directories(
    configurations: &ParsedConfigurations,
    env: &HashMap<String, String>,
) -> Vec<String> {
    let mut directories = vec!["node_modules".to_string()];

    if let Some(base_url) = configurations.base_url() {
        let absolute = if base_url.starts_with('/') {
            base_url
        } else {
            format!("/{}", base_url.trim_start_matches("./"))
        };
        directories.push(absolute);
    }

    if let Some(node_path) = env.get("NODE_PATH") {
        for entry in node_path.split(':').filter(|entry| !entry.is_empty()) {
            directories.push(entry.to_string());
        }
    }

    directories
}

/// Parse a `/.env` file: `KEY=VALUE` lines, `#` comments, optional quotes
pub fn parse_env(content: &str) -> HashMap<String, String> {
    let mut env = HashMap::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().trim_start_matches("export ").trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if !key.is_empty() {
            env.insert(key.to_string(), value.to_string());
        }
    }

    env
}
