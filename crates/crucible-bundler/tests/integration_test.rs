/// End-to-end tests for the sandbox engine

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crucible_bundler::{
    EvaluationOptions, HmrStatus, Manager, ManagerOptions, Module, SerializeOptions,
    VanillaPreset,
};
use crucible_pkg::{DependencyFetcher, FetchedPackage, Manifest};

static TRACING: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
});

fn modules(entries: &[(&str, &str)]) -> HashMap<String, Module> {
    entries
        .iter()
        .map(|(path, code)| (path.to_string(), Module::new(path, code)))
        .collect()
}

fn new_manager(entries: &[(&str, &str)]) -> Manager {
    Lazy::force(&TRACING);
    Manager::new(
        "test-sandbox",
        Arc::new(VanillaPreset::new()),
        modules(entries),
        ManagerOptions::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn test_fresh_transpile_and_evaluate() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = require('./dep') + 1;"),
        ("/dep.js", "module.exports = 41;"),
    ]);

    manager.transpile_modules("/index.js", false).await.unwrap();
    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();

    assert_eq!(result, serde_json::json!(42));
}

#[tokio::test]
async fn test_transpile_is_idempotent() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = require('./dep') + 1;"),
        ("/dep.js", "module.exports = 41;"),
    ]);

    let first = manager.transpile_modules("/index.js", false).await.unwrap();
    assert_eq!(first.len(), 2);
    let before = manager.transpiled_count();

    let second = manager.transpile_modules("/index.js", false).await.unwrap();
    assert!(second.is_empty(), "no input changed, nothing to retranspile");
    assert_eq!(manager.transpiled_count(), before);
}

#[tokio::test]
async fn test_json_dependency() {
    let mut manager = new_manager(&[
        (
            "/index.js",
            "const data = require('./data.json'); module.exports = data.answer;",
        ),
        ("/data.json", r#"{"answer": 42}"#),
    ]);

    manager.transpile_modules("/index.js", false).await.unwrap();
    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();

    assert_eq!(result, serde_json::json!(42));
}

#[tokio::test]
async fn test_dependency_alias_resolves_version_split() {
    let manifest: Manifest = serde_json::from_str(
        r#"{
            "contents": {
                "/node_modules/react/17.0.0/index.js": {"content": "module.exports = 'react-17';"},
                "/node_modules/react-dom/index.js": {"content": "module.exports = require('react');"}
            },
            "dependencies": [{"name": "react", "version": "17.0.2"}],
            "dependencyAliases": {"react-dom": {"react": "react/17.0.0"}}
        }"#,
    )
    .unwrap();

    let mut manager = new_manager(&[("/index.js", "module.exports = 1;")]);
    manager.set_manifest(manifest);

    let resolved = manager
        .resolve_sync("react", "/node_modules/react-dom/index.js")
        .unwrap();
    assert!(resolved.starts_with("/node_modules/react/17.0.0/"));
}

#[tokio::test]
async fn test_hmr_accept_without_hard_reload() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = require('./dep') + 1;"),
        (
            "/dep.js",
            "module.exports = 41;\nif (module.hot) { module.hot.accept(); }",
        ),
    ]);

    manager.transpile_modules("/index.js", false).await.unwrap();
    let first = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(first, serde_json::json!(42));

    let mut rx = manager.subscribe_hmr();

    manager
        .update_data(modules(&[
            ("/index.js", "module.exports = require('./dep') + 1;"),
            (
                "/dep.js",
                "module.exports = 100;\nif (module.hot) { module.hot.accept(); }",
            ),
        ]))
        .await
        .unwrap();

    let second = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(second, serde_json::json!(101));
    assert!(!manager.has_pending_hard_reload());

    let mut statuses = Vec::new();
    while let Ok(status) = rx.try_recv() {
        statuses.push(status);
    }
    assert_eq!(
        statuses,
        vec![HmrStatus::Check, HmrStatus::Apply, HmrStatus::Idle]
    );
}

#[tokio::test]
async fn test_dirty_declined_module_forces_hard_reload() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = require('./dep');"),
        (
            "/dep.js",
            "module.exports = 1;\nif (module.hot) { module.hot.decline(); }",
        ),
    ]);

    manager.transpile_modules("/index.js", false).await.unwrap();
    manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();

    let mut rx = manager.subscribe_hmr();
    manager
        .update_data(modules(&[
            ("/index.js", "module.exports = require('./dep');"),
            (
                "/dep.js",
                "module.exports = 2;\nif (module.hot) { module.hot.decline(); }",
            ),
        ]))
        .await
        .unwrap();

    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!(2));

    let mut statuses = Vec::new();
    while let Ok(status) = rx.try_recv() {
        statuses.push(status);
    }
    assert!(statuses.contains(&HmrStatus::Fail));
}

#[tokio::test]
async fn test_cycle_yields_partial_exports() {
    let mut manager = new_manager(&[
        (
            "/a.js",
            "const b = require('./b'); module.exports = { b: b, v: 1 };",
        ),
        (
            "/b.js",
            "const a = require('./a'); module.exports = { a: a, v: 2 };",
        ),
    ]);

    manager.transpile_modules("/a.js", false).await.unwrap();
    let result = manager
        .evaluate_module("/a.js", EvaluationOptions::default())
        .unwrap();

    // CommonJS partial-export semantics: both modules finish with defined
    // exports, and the cycle edge observed a's exports as they were
    // mid-evaluation.
    assert_eq!(result["v"], serde_json::json!(1));
    assert_eq!(result["b"]["v"], serde_json::json!(2));
    assert!(result["b"]["a"].is_object());
}

#[tokio::test]
async fn test_serialize_load_round_trip() {
    let entries = [
        ("/index.js", "module.exports = require('./dep') + 1;"),
        ("/dep.js", "module.exports = 41;"),
    ];
    let mut manager = new_manager(&entries);
    manager.transpile_modules("/index.js", false).await.unwrap();

    let data = manager.serialize(SerializeOptions {
        entry_path: Some("/index.js".to_string()),
        optimize_for_size: false,
    });
    assert_eq!(data.entry.as_deref(), Some("/index.js"));

    let mut restored = new_manager(&entries);
    assert!(restored.load(data).unwrap());
    assert_eq!(restored.transpiled_count(), manager.transpiled_count());

    let entry = restored.transpiled_module("/index.js", "").unwrap();
    let dep = restored.transpiled_module("/dep.js", "").unwrap();
    assert!(entry.dependencies.contains(&dep.hash));
    assert!(dep.initiators.contains(&entry.hash));

    // The restored graph evaluates without a fresh transpile pass
    let result = restored
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!(42));
}

#[tokio::test]
async fn test_cache_discarded_on_dependency_change() {
    let manifest_a: Manifest = serde_json::from_str(
        r#"{"dependencies": [{"name": "react", "version": "17.0.2"}]}"#,
    )
    .unwrap();
    let manifest_b: Manifest = serde_json::from_str(
        r#"{"dependencies": [{"name": "react", "version": "18.0.0"}]}"#,
    )
    .unwrap();

    let entries = [("/index.js", "module.exports = 1;")];
    let mut manager = new_manager(&entries);
    manager.set_manifest(manifest_a);
    manager.transpile_modules("/index.js", false).await.unwrap();
    let data = manager.serialize(SerializeOptions::default());

    let mut other = new_manager(&entries);
    other.set_manifest(manifest_b);

    // Silently discarded: no error, registry untouched
    assert!(!other.load(data).unwrap());
    assert_eq!(other.transpiled_count(), 0);
}

/// In-memory fetcher standing in for the CDN client
struct StaticFetcher {
    packages: HashMap<String, FetchedPackage>,
}

#[async_trait::async_trait]
impl DependencyFetcher for StaticFetcher {
    async fn fetch_package(&self, name: &str, _version: &str) -> anyhow::Result<FetchedPackage> {
        self.packages
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown package: {}", name))
    }
}

#[tokio::test]
async fn test_missing_dependency_triggers_download() {
    let manifest: Manifest = serde_json::from_str(
        r#"{"dependencies": [{"name": "lodash", "version": "4.17.21"}]}"#,
    )
    .unwrap();

    let mut files = HashMap::new();
    files.insert(
        "package.json".to_string(),
        r#"{"name": "lodash", "version": "4.17.21", "main": "index.js"}"#.to_string(),
    );
    files.insert(
        "index.js".to_string(),
        "module.exports = { VERSION: '4.17.21' };".to_string(),
    );
    let fetcher = StaticFetcher {
        packages: HashMap::from([(
            "lodash".to_string(),
            FetchedPackage {
                version: "4.17.21".to_string(),
                files,
            },
        )]),
    };

    Lazy::force(&TRACING);
    let mut manager = Manager::new(
        "test-sandbox",
        Arc::new(VanillaPreset::new()),
        modules(&[(
            "/index.js",
            "module.exports = require('lodash').VERSION;",
        )]),
        ManagerOptions::default(),
    )
    .unwrap()
    .with_fetcher(Arc::new(fetcher));
    manager.set_manifest(manifest);

    manager.transpile_modules("/index.js", false).await.unwrap();
    assert!(manager.has_module("/node_modules/lodash/index.js"));

    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!("4.17.21"));
}

#[tokio::test]
async fn test_node_builtin_resolves_to_empty_shim() {
    let mut manager = new_manager(&[(
        "/index.js",
        "const fs = require('fs'); module.exports = typeof fs;",
    )]);

    assert_eq!(
        manager.resolve_sync("fs", "/index.js").unwrap(),
        "/node_modules/empty/index.js"
    );

    manager.transpile_modules("/index.js", false).await.unwrap();
    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!("object"));
}

#[tokio::test]
async fn test_sync_and_async_resolution_agree() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = 1;"),
        ("/nested/dep.js", "module.exports = 2;"),
    ]);

    let sync = manager.resolve_sync("./nested/dep", "/index.js").unwrap();
    let r#async = manager
        .resolve_async("./nested/dep", "/index.js")
        .await
        .unwrap();
    assert_eq!(sync, r#async);
    assert_eq!(sync, "/nested/dep.js");
}

#[tokio::test]
async fn test_read_file_sync_enoent() {
    let manager = new_manager(&[("/index.js", "module.exports = 1;")]);
    let err = manager.read_file_sync("/missing.js").unwrap_err();
    assert!(err.to_string().starts_with("ENOENT"));
}

#[tokio::test]
async fn test_update_data_diff_and_cache_invalidation() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = require('./dep');"),
        ("/dep.js", "module.exports = 1;"),
        ("/stale.js", "module.exports = 'old';"),
    ]);

    manager.transpile_modules("/index.js", false).await.unwrap();
    assert!(!manager.cached_paths_is_empty());

    manager
        .update_data(modules(&[
            ("/index.js", "module.exports = require('./dep');"),
            ("/dep.js", "module.exports = 2;"),
            ("/fresh.js", "module.exports = 'new';"),
        ]))
        .await
        .unwrap();

    // Structural change wipes the resolution cache and the deleted file
    assert!(manager.cached_paths_is_empty());
    assert!(!manager.has_module("/stale.js"));
    assert!(manager.has_module("/fresh.js"));
    assert_eq!(manager.module_code("/dep.js").unwrap(), "module.exports = 2;");

    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!(2));
}

#[tokio::test]
async fn test_update_data_without_changes_is_a_no_op() {
    let entries = [
        ("/index.js", "module.exports = require('./dep');"),
        ("/dep.js", "module.exports = 1;"),
    ];
    let mut manager = new_manager(&entries);
    manager.transpile_modules("/index.js", false).await.unwrap();
    assert!(!manager.cached_paths_is_empty());

    let retranspiled = manager.update_data(modules(&entries)).await.unwrap();
    assert!(retranspiled.is_empty());
    assert!(!manager.cached_paths_is_empty());
}

#[tokio::test]
async fn test_hard_reload_on_change_configuration() {
    let mut manager = new_manager(&[("/index.js", "module.exports = 1;")]);

    let configs: crucible_bundler::ParsedConfigurations =
        serde_json::from_str(r#"{"sandbox": {"hardReloadOnChange": true}}"#).unwrap();
    assert!(manager.update_configurations(configs));

    manager.transpile_modules("/index.js", false).await.unwrap();
    manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();

    manager
        .update_data(modules(&[("/index.js", "module.exports = 7;")]))
        .await
        .unwrap();
    assert!(manager.has_pending_hard_reload());

    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!(7));
    assert!(!manager.has_pending_hard_reload());
}

#[tokio::test]
async fn test_serialize_skips_precomputed_modules() {
    let manifest: Manifest = serde_json::from_str(
        r#"{
            "contents": {
                "/node_modules/left-pad/index.js": {
                    "content": "module.exports = function (s) { return ' ' + s; };",
                    "requires": []
                }
            },
            "dependencies": [{"name": "left-pad", "version": "1.3.0"}]
        }"#,
    )
    .unwrap();

    let mut manager = new_manager(&[(
        "/index.js",
        "module.exports = require('left-pad')('x');",
    )]);
    manager.set_manifest(manifest);
    manager.transpile_modules("/index.js", false).await.unwrap();

    let full = manager.serialize(SerializeOptions::default());
    let slim = manager.serialize(SerializeOptions {
        entry_path: None,
        optimize_for_size: true,
    });

    assert_eq!(full.transpiled_modules.len(), 2);
    assert_eq!(slim.transpiled_modules.len(), 1);
    assert_eq!(slim.transpiled_modules[0].path, "/index.js");
}

#[tokio::test]
async fn test_dot_env_surfaces_as_process_env() {
    let mut manager = new_manager(&[
        ("/index.js", "module.exports = process.env.GREETING;"),
        ("/.env", "GREETING=hello"),
    ]);

    manager.transpile_modules("/index.js", false).await.unwrap();
    let result = manager
        .evaluate_module("/index.js", EvaluationOptions::default())
        .unwrap();
    assert_eq!(result, serde_json::json!("hello"));
}
