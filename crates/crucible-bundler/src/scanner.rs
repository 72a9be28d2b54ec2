//! Request scanner for plain JavaScript sources.
//!
//! Finds `require('...')`, static `import ... from '...'`, `export ... from`
//! and dynamic `import('...')` request strings with regexes. Loader-emitted
//! dependencies and packager-precomputed `requires` lists bypass this.

use once_cell::sync::Lazy;
use regex::Regex;

static REQUIRE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap()
});

static IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*import\s+(?:[\w*\s{},$]+\s+from\s+)?['"]([^'"]+)['"]"#).unwrap()
});

static EXPORT_FROM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*export\s+[\w*\s{},$]+\s+from\s+['"]([^'"]+)['"]"#).unwrap()
});

static DYNAMIC_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)"#).unwrap()
});

/// Extract request strings in source order, deduplicated
pub fn scan_requests(code: &str) -> Vec<String> {
    let mut requests = Vec::new();

    for re in [&*REQUIRE_RE, &*IMPORT_RE, &*EXPORT_FROM_RE, &*DYNAMIC_IMPORT_RE] {
        for capture in re.captures_iter(code) {
            let request = capture[1].to_string();
            if !requests.contains(&request) {
                requests.push(request);
            }
        }
    }

    requests
}
