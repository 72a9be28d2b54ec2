use serde::Deserialize;

use crate::{ResolveError, Result};

/// Simplified package.json structure
#[derive(Debug, Deserialize)]
pub struct PackageJson {
    pub name: Option<String>,
    pub version: Option<String>,
    pub main: Option<String>,
    pub module: Option<String>,
    pub browser: Option<serde_json::Value>,
    pub exports: Option<serde_json::Value>,
}

/// Outcome of a `browser` object-form lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowserReplacement {
    /// Substitute file, relative to the package directory
    Path(String),

    /// Mapped to `false`: the module is meaningless in the browser
    Ignore,
}

impl PackageJson {
    pub fn parse(path: &str, content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|err| ResolveError::InvalidPackage {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    /// Candidate entry fields for a root import, in priority order
    ///
    /// `browser` (string form) wins over `module` over `main`, matching
    /// browser bundlers.
    pub fn entry_fields(&self, use_browser: bool) -> Vec<String> {
        let mut entries = Vec::new();
        if use_browser {
            if let Some(serde_json::Value::String(path)) = &self.browser {
                entries.push(path.clone());
            }
        }
        if let Some(module) = &self.module {
            entries.push(module.clone());
        }
        if let Some(main) = &self.main {
            entries.push(main.clone());
        }
        entries
    }

    /// Resolve through the `exports` field, if present
    ///
    /// Returns the target relative to the package directory. `None` means
    /// no `exports` entry matched (fall back to legacy resolution).
    pub fn resolve_exports(&self, subpath: Option<&str>, use_browser: bool) -> Option<String> {
        let exports = self.exports.as_ref()?;
        let subpath = subpath.unwrap_or(".");
        let conditions: &[&str] = if use_browser {
            &["browser", "import", "require", "default"]
        } else {
            &["import", "require", "default"]
        };

        match exports {
            serde_json::Value::String(target) if subpath == "." => Some(target.clone()),

            serde_json::Value::Object(map) => {
                // A map of conditions (no "./" keys) applies to the root
                let is_conditions_map =
                    map.keys().all(|key| !key.starts_with('.') && key != ".");
                if is_conditions_map {
                    if subpath == "." {
                        return resolve_export_value(exports, conditions);
                    }
                    return None;
                }

                if let Some(value) = map.get(subpath) {
                    return resolve_export_value(value, conditions);
                }

                for (pattern, value) in map {
                    if let Some(matched) = match_export_pattern(pattern, subpath) {
                        if let Some(target) = resolve_export_value(value, conditions) {
                            return Some(target.replace('*', &matched));
                        }
                    }
                }

                None
            }

            _ => None,
        }
    }

    /// Look up a resolved file (relative to the package directory, with a
    /// leading `./`) or a bare name in the `browser` object form
    pub fn browser_replacement(&self, relative: &str) -> Option<BrowserReplacement> {
        let map = match &self.browser {
            Some(serde_json::Value::Object(map)) => map,
            _ => return None,
        };

        let candidates = [
            relative.to_string(),
            relative.trim_start_matches("./").to_string(),
        ];

        for key in candidates {
            match map.get(&key) {
                Some(serde_json::Value::String(target)) => {
                    return Some(BrowserReplacement::Path(target.clone()));
                }
                Some(serde_json::Value::Bool(false)) => {
                    return Some(BrowserReplacement::Ignore);
                }
                _ => {}
            }
        }

        None
    }
}

/// Resolve an export value, walking conditional nestings
fn resolve_export_value(value: &serde_json::Value, conditions: &[&str]) -> Option<String> {
    match value {
        serde_json::Value::String(target) => Some(target.clone()),

        serde_json::Value::Object(map) => {
            for condition in conditions {
                if let Some(nested) = map.get(*condition) {
                    if let Some(target) = resolve_export_value(nested, conditions) {
                        return Some(target);
                    }
                }
            }
            None
        }

        serde_json::Value::Array(values) => values
            .iter()
            .find_map(|nested| resolve_export_value(nested, conditions)),

        _ => None,
    }
}

/// Match a single-wildcard export pattern, returning the captured part
fn match_export_pattern(pattern: &str, subpath: &str) -> Option<String> {
    if !pattern.contains('*') {
        return None;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() != 2 {
        return None;
    }

    let (prefix, suffix) = (parts[0], parts[1]);
    if subpath.starts_with(prefix) && subpath.ends_with(suffix) {
        let start = prefix.len();
        let end = subpath.len() - suffix.len();
        if start <= end {
            return Some(subpath[start..end].to_string());
        }
    }

    None
}
