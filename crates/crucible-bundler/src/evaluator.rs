//! Synchronous evaluation of the transpiled module graph.
//!
//! Each transpiled module is wrapped in a CommonJS factory
//! `(module, exports, require, __filename, __dirname)` and executed inside
//! a persistent embedded JavaScript context. `require` resolves through
//! the resolution engine and recurses; a module already on the evaluation
//! stack returns its current (possibly partial) `module.exports`, which is
//! what makes cycles safe. Evaluation never suspends: every source must be
//! present and transpiled before it starts.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use boa_engine::{
    js_string, Context, JsArgs, JsError, JsNativeError, JsObject, JsResult, JsString, JsValue,
    NativeFunction, Source,
};

use crucible_common::{hash_from_hex, hash_to_hex, paths, split_query};
use crucible_resolver::FileProvider;

use crate::error::{BundlerError, Result};
use crate::registry::TmRegistry;
use crate::resolve::ResolutionEngine;
use crate::store::ModuleStore;
use crate::transpiled_module::{Compilation, ModuleError};

/// An accept registration made by `module.hot.accept(dep, callback)`
pub struct AcceptCallback {
    pub owner: u64,
    pub dep: u64,
    pub callback: Option<JsObject>,
}

/// Runtime state of the module graph: live module objects and HMR
/// registrations
#[derive(Default)]
pub struct EvalShared {
    /// hash -> `module` object (its `exports` property is the cache)
    pub instances: HashMap<u64, JsObject>,

    /// Modules whose factory finished
    pub completed: HashSet<u64>,

    /// On-stack set for cycle detection, in call order
    pub stack: Vec<u64>,

    pub accept_callbacks: Vec<AcceptCallback>,
    pub dispose_callbacks: HashMap<u64, JsObject>,
}

impl EvalShared {
    fn clear(&mut self) {
        self.instances.clear();
        self.completed.clear();
        self.stack.clear();
        self.accept_callbacks.clear();
        self.dispose_callbacks.clear();
    }
}

/// Everything `require` needs, installed for the duration of one
/// evaluation session
#[derive(Clone)]
pub struct ActiveEvaluation {
    pub shared: Rc<RefCell<EvalShared>>,
    pub store: Rc<RefCell<ModuleStore>>,
    pub registry: Rc<RefCell<TmRegistry>>,
    pub resolution: Rc<ResolutionEngine>,

    /// Extensions that evaluate to their stringified content
    pub asset_extensions: Vec<String>,
}

thread_local! {
    static ACTIVE: RefCell<Option<ActiveEvaluation>> = const { RefCell::new(None) };
}

struct ActiveGuard;

impl ActiveGuard {
    fn install(active: ActiveEvaluation) -> Self {
        ACTIVE.with(|slot| *slot.borrow_mut() = Some(active));
        ActiveGuard
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        ACTIVE.with(|slot| *slot.borrow_mut() = None);
    }
}

fn get_active() -> JsResult<ActiveEvaluation> {
    ACTIVE
        .with(|slot| slot.borrow().clone())
        .ok_or_else(|| js_error("no evaluation in progress".to_string()))
}

fn js_error(message: String) -> JsError {
    JsNativeError::error().with_message(message).into()
}

/// JS glue evaluated once per context: console stub, per-module `require`
/// and `module.hot` factories, and the exports snapshot helper
const PRELUDE: &str = r#"
var console = {
  log: function () {},
  info: function () {},
  warn: function () {},
  error: function () {},
  debug: function () {}
};
function __make_require(path) {
  return function require(request) {
    return __crucible_require(path, request);
  };
}
function __make_hot(id, path) {
  return {
    accept: function (dep, callback) {
      if (typeof dep === 'function') {
        return __crucible_hot_accept(id, path, undefined, dep);
      }
      return __crucible_hot_accept(id, path, dep, callback);
    },
    decline: function () {
      return __crucible_hot_decline(id);
    },
    dispose: function (callback) {
      return __crucible_hot_dispose(id, callback);
    },
    data: {}
  };
}
function __snapshot(value) {
  try {
    return JSON.stringify(value);
  } catch (err) {
    return null;
  }
}
"#;

/// Owner of the embedded JavaScript context and the runtime module graph
pub struct Evaluator {
    context: Context,
    shared: Rc<RefCell<EvalShared>>,
}

impl Evaluator {
    pub fn new() -> Result<Self> {
        let mut context = Context::default();

        context
            .register_global_callable(
                js_string!("__crucible_require"),
                2,
                NativeFunction::from_fn_ptr(require_native),
            )
            .map_err(setup_error)?;
        context
            .register_global_callable(
                js_string!("__crucible_hot_accept"),
                4,
                NativeFunction::from_fn_ptr(hot_accept_native),
            )
            .map_err(setup_error)?;
        context
            .register_global_callable(
                js_string!("__crucible_hot_decline"),
                1,
                NativeFunction::from_fn_ptr(hot_decline_native),
            )
            .map_err(setup_error)?;
        context
            .register_global_callable(
                js_string!("__crucible_hot_dispose"),
                2,
                NativeFunction::from_fn_ptr(hot_dispose_native),
            )
            .map_err(setup_error)?;

        context
            .eval(Source::from_bytes(PRELUDE.as_bytes()))
            .map_err(setup_error)?;

        Ok(Self {
            context,
            shared: Rc::new(RefCell::new(EvalShared::default())),
        })
    }

    pub fn shared(&self) -> Rc<RefCell<EvalShared>> {
        self.shared.clone()
    }

    /// Define `process.env` from the sandbox environment
    pub fn set_env(&mut self, env: &HashMap<String, String>, test_globals: bool) -> Result<()> {
        let mut table = serde_json::Map::new();
        for (key, value) in env {
            table.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
        table
            .entry("NODE_ENV".to_string())
            .or_insert_with(|| {
                serde_json::Value::String(
                    if test_globals { "test" } else { "development" }.to_string(),
                )
            });

        let script = format!(
            "var process = {{ env: {} }};",
            serde_json::Value::Object(table)
        );
        self.context
            .eval(Source::from_bytes(script.as_bytes()))
            .map_err(setup_error)?;
        Ok(())
    }

    /// Evaluate one module, returning a JSON snapshot of its exports
    pub fn evaluate(&mut self, hash: u64, active: ActiveEvaluation) -> Result<serde_json::Value> {
        let path = active
            .registry
            .borrow()
            .get(hash)
            .map(|tm| tm.path.clone())
            .unwrap_or_else(|| hash_to_hex(hash));

        let _guard = ActiveGuard::install(active);

        let exports = evaluate_by_hash(&mut self.context, hash).map_err(|err| {
            BundlerError::Evaluation {
                path: path.clone(),
                message: err.to_string(),
            }
        })?;

        self.snapshot_value(&exports, &path)
    }

    fn snapshot_value(&mut self, value: &JsValue, path: &str) -> Result<serde_json::Value> {
        let result = call_helper(&mut self.context, "__snapshot", &[value.clone()]).map_err(
            |err| BundlerError::Evaluation {
                path: path.to_string(),
                message: err.to_string(),
            },
        )?;

        if result.is_undefined() || result.is_null() {
            return Ok(serde_json::Value::Null);
        }
        let raw = result
            .to_string(&mut self.context)
            .map_err(|err| BundlerError::Evaluation {
                path: path.to_string(),
                message: err.to_string(),
            })?
            .to_std_string_escaped();
        Ok(serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null))
    }

    /// Drop a module's runtime state so the next evaluation runs its
    /// factory again
    pub fn invalidate(&mut self, hash: u64) {
        let mut shared = self.shared.borrow_mut();
        shared.instances.remove(&hash);
        shared.completed.remove(&hash);
        shared
            .accept_callbacks
            .retain(|callback| callback.owner != hash);
        shared.dispose_callbacks.remove(&hash);
    }

    /// Run a module's `hot.dispose` handler (if any), then invalidate it
    pub fn run_dispose(&mut self, hash: u64) {
        let callback = self.shared.borrow_mut().dispose_callbacks.remove(&hash);
        if let Some(callback) = callback {
            let data = JsObject::with_object_proto(self.context.intrinsics());
            if let Err(err) =
                callback.call(&JsValue::undefined(), &[data.into()], &mut self.context)
            {
                tracing::warn!("hot.dispose handler failed: {}", err);
            }
        }
        self.invalidate(hash);
    }

    /// Fire accept handlers registered against a re-evaluated dependency
    pub fn fire_accept_callbacks(&mut self, dep: u64, active: ActiveEvaluation) {
        let _guard = ActiveGuard::install(active);

        let callbacks: Vec<JsObject> = self
            .shared
            .borrow()
            .accept_callbacks
            .iter()
            .filter(|callback| callback.dep == dep && callback.owner != dep)
            .filter_map(|callback| callback.callback.clone())
            .collect();

        for callback in callbacks {
            if let Err(err) = callback.call(&JsValue::undefined(), &[], &mut self.context) {
                tracing::warn!("hot.accept handler failed: {}", err);
            }
        }
    }

    pub fn has_instance(&self, hash: u64) -> bool {
        self.shared.borrow().instances.contains_key(&hash)
    }

    /// The in-process rendition of a hard page reload: every runtime
    /// object is dropped and the context starts over
    pub fn hard_reset(&mut self) -> Result<()> {
        self.shared.borrow_mut().clear();
        *self = Evaluator::new()?;
        Ok(())
    }
}

fn setup_error(err: JsError) -> BundlerError {
    BundlerError::Evaluation {
        path: "<runtime>".to_string(),
        message: err.to_string(),
    }
}

fn call_helper(ctx: &mut Context, name: &str, args: &[JsValue]) -> JsResult<JsValue> {
    let global = ctx.global_object();
    let helper = global.get(JsString::from(name), ctx)?;
    let Some(callable) = helper.as_callable() else {
        return Err(js_error(format!("Missing runtime helper '{}'", name)));
    };
    callable.call(&JsValue::undefined(), args, ctx)
}

/// Evaluate a transpiled module by hash, honoring the instance cache and
/// the cycle policy
fn evaluate_by_hash(ctx: &mut Context, hash: u64) -> JsResult<JsValue> {
    let active = get_active()?;

    {
        let shared = active.shared.borrow();
        if let Some(instance) = shared.instances.get(&hash) {
            // Finished modules return their cached exports; modules still
            // on the stack return whatever they have exported so far.
            if shared.completed.contains(&hash) || shared.stack.contains(&hash) {
                let instance = instance.clone();
                drop(shared);
                return instance.get(js_string!("exports"), ctx);
            }
        }
    }
    // A leftover instance from a failed run is discarded
    active.shared.borrow_mut().instances.remove(&hash);

    let (path, source) = {
        let registry = active.registry.borrow();
        let tm = registry
            .get(hash)
            .ok_or_else(|| js_error(format!("Unknown module hash {}", hash_to_hex(hash))))?;
        (tm.path.clone(), tm.source.clone())
    };
    let source = source
        .ok_or_else(|| js_error(format!("Module '{}' has not been transpiled", path)))?;

    tracing::debug!("Evaluating {}", path);

    let module_obj = JsObject::with_object_proto(ctx.intrinsics());
    let exports_obj = JsObject::with_object_proto(ctx.intrinsics());
    module_obj.set(js_string!("exports"), exports_obj.clone(), false, ctx)?;
    module_obj.set(js_string!("id"), JsString::from(path.as_str()), false, ctx)?;

    let hot = call_helper(
        ctx,
        "__make_hot",
        &[
            JsString::from(hash_to_hex(hash).as_str()).into(),
            JsString::from(path.as_str()).into(),
        ],
    )?;
    module_obj.set(js_string!("hot"), hot, false, ctx)?;

    {
        let mut shared = active.shared.borrow_mut();
        shared.instances.insert(hash, module_obj.clone());
        shared.stack.push(hash);
    }

    let result = run_factory(ctx, &path, &source.code, &module_obj, exports_obj);

    active.shared.borrow_mut().stack.pop();

    match result {
        Ok(()) => {
            active.shared.borrow_mut().completed.insert(hash);
            if let Some(tm) = active.registry.borrow_mut().get_mut(hash) {
                tm.compilation = Some(Compilation::default());
            }
            module_obj.get(js_string!("exports"), ctx)
        }
        Err(err) => {
            active.shared.borrow_mut().instances.remove(&hash);
            if let Some(tm) = active.registry.borrow_mut().get_mut(hash) {
                tm.errors.push(ModuleError {
                    path: path.clone(),
                    message: err.to_string(),
                });
            }
            Err(err)
        }
    }
}

fn run_factory(
    ctx: &mut Context,
    path: &str,
    code: &str,
    module_obj: &JsObject,
    exports_obj: JsObject,
) -> JsResult<()> {
    let wrapped = format!(
        "(function (module, exports, require, __filename, __dirname) {{\n{}\n}})",
        code
    );
    let factory = ctx.eval(Source::from_bytes(wrapped.as_bytes()))?;
    let Some(factory) = factory.as_callable() else {
        return Err(js_error(format!("Factory for '{}' is not callable", path)));
    };

    let require_fn = call_helper(ctx, "__make_require", &[JsString::from(path).into()])?;
    let filename: JsValue = JsString::from(path).into();
    let dirname: JsValue = JsString::from(paths::dirname(path).as_str()).into();

    factory.call(
        &JsValue::undefined(),
        &[
            module_obj.clone().into(),
            exports_obj.into(),
            require_fn,
            filename,
            dirname,
        ],
        ctx,
    )?;
    Ok(())
}

/// `require(request)` from inside module `from`
fn require_native(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let from = args
        .get_or_undefined(0)
        .to_string(ctx)?
        .to_std_string_escaped();
    let request = args
        .get_or_undefined(1)
        .to_string(ctx)?
        .to_std_string_escaped();

    let active = get_active()?;
    let (query, bare) = split_query(&request);

    let resolved = {
        let store = active.store.borrow();
        active
            .resolution
            .resolve_module(&*store, &bare, &from, &[])
    }
    .map_err(|err| js_error(err.to_string()))?;

    // Assets evaluate to their stringified content
    if let Some(ext) = paths::extension(&resolved) {
        if active.asset_extensions.iter().any(|asset| asset == ext) {
            let content = active.store.borrow().read_file(&resolved).unwrap_or_default();
            return Ok(JsString::from(content.as_str()).into());
        }
    }

    let hash = active
        .registry
        .borrow()
        .hash_of(&resolved, &query)
        .ok_or_else(|| js_error(format!("Module '{}' has not been transpiled", resolved)))?;

    evaluate_by_hash(ctx, hash)
}

/// `module.hot.accept(...)`
fn hot_accept_native(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let id = args
        .get_or_undefined(0)
        .to_string(ctx)?
        .to_std_string_escaped();
    let owner =
        hash_from_hex(&id).ok_or_else(|| js_error(format!("Bad module id '{}'", id)))?;
    let path = args
        .get_or_undefined(1)
        .to_string(ctx)?
        .to_std_string_escaped();
    let dep = args.get_or_undefined(2).clone();
    let callback = args.get_or_undefined(3).as_callable().map(|cb| cb.clone());

    let active = get_active()?;

    if dep.is_undefined() {
        if let Some(tm) = active.registry.borrow_mut().get_mut(owner) {
            tm.hmr_config.self_accepted = true;
        }
        if callback.is_some() {
            active.shared.borrow_mut().accept_callbacks.push(AcceptCallback {
                owner,
                dep: owner,
                callback,
            });
        }
        return Ok(JsValue::undefined());
    }

    let request = dep.to_string(ctx)?.to_std_string_escaped();
    let (query, bare) = split_query(&request);
    let resolved = {
        let store = active.store.borrow();
        active
            .resolution
            .resolve_module(&*store, &bare, &path, &[])
    }
    .map_err(|err| js_error(err.to_string()))?;
    let target = active
        .registry
        .borrow()
        .hash_of(&resolved, &query)
        .ok_or_else(|| js_error(format!("Unknown module '{}'", request)))?;

    active.shared.borrow_mut().accept_callbacks.push(AcceptCallback {
        owner,
        dep: target,
        callback,
    });
    Ok(JsValue::undefined())
}

/// `module.hot.decline()`
fn hot_decline_native(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let id = args
        .get_or_undefined(0)
        .to_string(ctx)?
        .to_std_string_escaped();
    let owner =
        hash_from_hex(&id).ok_or_else(|| js_error(format!("Bad module id '{}'", id)))?;

    let active = get_active()?;
    if let Some(tm) = active.registry.borrow_mut().get_mut(owner) {
        tm.hmr_config.declined = true;
    }
    Ok(JsValue::undefined())
}

/// `module.hot.dispose(handler)`
fn hot_dispose_native(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let id = args
        .get_or_undefined(0)
        .to_string(ctx)?
        .to_std_string_escaped();
    let owner =
        hash_from_hex(&id).ok_or_else(|| js_error(format!("Bad module id '{}'", id)))?;
    let callback = args.get_or_undefined(1).as_callable().map(|cb| cb.clone());

    let active = get_active()?;
    if let Some(callback) = callback {
        active
            .shared
            .borrow_mut()
            .dispose_callbacks
            .insert(owner, callback);
    }
    Ok(JsValue::undefined())
}
