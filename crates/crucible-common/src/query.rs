//! Loader-query splitting.
//!
//! A request may carry a leading `!`-separated loader chain, e.g.
//! `style-loader!css-loader!./app.css`. The chain (the "query")
//! distinguishes transpiled variants that share the same module path.

/// Split a request into `(query, path)`
///
/// The query keeps a leading `!` so it can be prepended verbatim when a
/// child request is reconstructed: `split_query("a!b!./x")` yields
/// `("!a!b", "./x")`. Requests without a chain yield an empty query.
pub fn split_query(request: &str) -> (String, String) {
    match request.rfind('!') {
        Some(idx) => {
            let chain = &request[..idx];
            let path = &request[idx + 1..];
            (format!("!{}", chain), path.to_string())
        }
        None => (String::new(), request.to_string()),
    }
}

/// Reattach a query prefix to a path
pub fn with_query(query: &str, path: &str) -> String {
    if query.is_empty() {
        path.to_string()
    } else {
        format!("{}!{}", query.trim_start_matches('!'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_request() {
        assert_eq!(split_query("./dep"), (String::new(), "./dep".to_string()));
    }

    #[test]
    fn test_split_single_loader() {
        assert_eq!(
            split_query("raw-loader!./readme.md"),
            ("!raw-loader".to_string(), "./readme.md".to_string())
        );
    }

    #[test]
    fn test_split_loader_chain() {
        assert_eq!(
            split_query("style-loader!css-loader!./app.css"),
            (
                "!style-loader!css-loader".to_string(),
                "./app.css".to_string()
            )
        );
    }

    #[test]
    fn test_with_query_round_trip() {
        let (query, path) = split_query("a!b!./x");
        assert_eq!(with_query(&query, &path), "a!b!./x");
        assert_eq!(with_query("", "./x"), "./x");
    }
}
