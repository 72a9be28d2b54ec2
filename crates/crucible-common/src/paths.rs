//! Utilities for absolute POSIX paths inside the virtual file system.
//!
//! The sandbox never touches the real file system, so paths are plain
//! strings with `/` separators regardless of host platform.

/// Check whether a path is absolute in the virtual FS
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Return the directory portion of a path
///
/// Mirrors POSIX `dirname`: `/a/b.js` -> `/a`, `/a` -> `/`, `a` -> `.`.
pub fn dirname(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Return the file portion of a path
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
}

/// Return the extension (without the dot), if any
pub fn extension(path: &str) -> Option<&str> {
    let name = basename(path);
    match name.rfind('.') {
        Some(0) | None => None,
        Some(idx) => Some(&name[idx + 1..]),
    }
}

/// Collapse `.`, `..` and duplicate separators
pub fn normalize(path: &str) -> String {
    let absolute = is_absolute(path);
    let mut parts: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                match parts.last() {
                    Some(&"..") | None if !absolute => parts.push(".."),
                    Some(_) => {
                        parts.pop();
                    }
                    None => {}
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    if absolute {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join a relative request onto a base directory and normalize the result
pub fn join(base: &str, rel: &str) -> String {
    if is_absolute(rel) {
        return normalize(rel);
    }
    if base.is_empty() || base == "." {
        return normalize(rel);
    }
    normalize(&format!("{}/{}", base.trim_end_matches('/'), rel))
}

/// The package name of a `/node_modules/...` path, handling scopes
///
/// `/node_modules/@org/pkg/lib/a.js` -> `Some("@org/pkg")`.
pub fn node_modules_package(path: &str) -> Option<String> {
    let rest = path.strip_prefix("/node_modules/")?;
    let mut segments = rest.split('/');
    let first = segments.next()?;
    if first.is_empty() {
        return None;
    }
    if first.starts_with('@') {
        let second = segments.next()?;
        Some(format!("{}/{}", first, second))
    } else {
        Some(first.to_string())
    }
}
