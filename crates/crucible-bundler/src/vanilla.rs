//! Built-in minimal preset.
//!
//! Proves the pipeline seams without a real compiler: plain JavaScript is
//! passed through with its requests scanned, JSON becomes a CommonJS
//! export, stylesheets become injection code, and a `raw` loader serves
//! any file as a string. Real sandboxes plug in their own presets.

use std::sync::Arc;

use async_trait::async_trait;

use crucible_common::paths;

use crate::error::Result;
use crate::module::Module;
use crate::preset::{LoaderContext, Preset, Transpiler, TranspilerOutput};
use crate::scanner::scan_requests;

/// Passthrough for CommonJS sources; declares scanned requests
pub struct CommonJsTranspiler;

#[async_trait(?Send)]
impl Transpiler for CommonJsTranspiler {
    fn name(&self) -> &str {
        "commonjs-loader"
    }

    async fn transpile(
        &self,
        code: String,
        ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput> {
        for request in scan_requests(&code) {
            ctx.add_dependency(&request);
        }
        Ok(TranspilerOutput::code_only(code))
    }
}

/// Wraps JSON content into a CommonJS export
pub struct JsonTranspiler;

#[async_trait(?Send)]
impl Transpiler for JsonTranspiler {
    fn name(&self) -> &str {
        "json-loader"
    }

    async fn transpile(
        &self,
        code: String,
        _ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput> {
        Ok(TranspilerOutput::code_only(format!(
            "module.exports = {};",
            code.trim()
        )))
    }
}

/// Turns a stylesheet into JS that injects a `<style>` tag
pub struct StyleTranspiler;

fn escape_template_literal(source: &str) -> String {
    source
        .replace('\\', "\\\\")
        .replace('`', "\\`")
        .replace("${", "\\${")
}

#[async_trait(?Send)]
impl Transpiler for StyleTranspiler {
    fn name(&self) -> &str {
        "style-loader"
    }

    async fn transpile(
        &self,
        code: String,
        _ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput> {
        let escaped = escape_template_literal(&code);
        let injection = format!(
            r#"(function() {{
  if (typeof document !== 'undefined') {{
    var style = document.createElement('style');
    style.textContent = `{}`;
    document.head.appendChild(style);
  }}
}})();
module.exports = {{}};
"#,
            escaped
        );
        Ok(TranspilerOutput::code_only(injection))
    }
}

/// Serves any file verbatim as a string export
pub struct RawTranspiler;

#[async_trait(?Send)]
impl Transpiler for RawTranspiler {
    fn name(&self) -> &str {
        "raw-loader"
    }

    async fn transpile(
        &self,
        code: String,
        _ctx: &mut LoaderContext<'_>,
    ) -> Result<TranspilerOutput> {
        Ok(TranspilerOutput::code_only(format!(
            "module.exports = {};",
            serde_json::to_string(&code)?
        )))
    }
}

/// The default preset
pub struct VanillaPreset {
    commonjs: Arc<dyn Transpiler>,
    json: Arc<dyn Transpiler>,
    style: Arc<dyn Transpiler>,
    raw: Arc<dyn Transpiler>,
}

impl VanillaPreset {
    pub fn new() -> Self {
        Self {
            commonjs: Arc::new(CommonJsTranspiler),
            json: Arc::new(JsonTranspiler),
            style: Arc::new(StyleTranspiler),
            raw: Arc::new(RawTranspiler),
        }
    }

    fn by_name(&self, name: &str) -> Option<Arc<dyn Transpiler>> {
        match name {
            "commonjs-loader" => Some(self.commonjs.clone()),
            "json-loader" => Some(self.json.clone()),
            "style-loader" => Some(self.style.clone()),
            "raw-loader" => Some(self.raw.clone()),
            _ => None,
        }
    }
}

impl Default for VanillaPreset {
    fn default() -> Self {
        Self::new()
    }
}

impl Preset for VanillaPreset {
    fn name(&self) -> &str {
        "vanilla"
    }

    fn get_loaders(&self, module: &Module, query: &str) -> Vec<Arc<dyn Transpiler>> {
        // An explicit loader chain overrides extension dispatch
        if !query.is_empty() {
            let loaders: Vec<Arc<dyn Transpiler>> = query
                .split('!')
                .filter(|segment| !segment.is_empty())
                .filter_map(|segment| self.by_name(segment))
                .collect();
            if !loaders.is_empty() {
                return loaders;
            }
        }

        match paths::extension(&module.path) {
            Some("json") => vec![self.json.clone()],
            Some("css") => vec![self.style.clone()],
            _ => vec![self.commonjs.clone()],
        }
    }

    fn has_dot_env(&self) -> bool {
        true
    }
}
