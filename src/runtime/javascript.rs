//! JavaScript guest runtime on QuickJS.
//!
//! User code is the body of `export default function (p) { ... }` in a
//! module. Every context carries a small harness that decodes the parameter
//! JSON, calls the user function and stringifies object results.
//!
//! The shared cache holds serialized module bytecode. A slot loads it into its
//! own context, so a cache hit skips parsing entirely. The context is rebuilt
//! from the harness template on every reset.

use anyhow::{anyhow, Context as _, Result};
use rquickjs::{Context, Ctx, Function, Module, Runtime, Value};
use std::sync::Arc;

use super::cache::ProgramCache;
use super::pool::Interrupt;
use super::{GuestRuntime, ScriptError, ScriptJob};

/// Module bytecode produced by `Module::write`.
pub type Program = Arc<[u8]>;

const MEMORY_LIMIT: usize = 64 << 20;
const MAX_STACK_SIZE: usize = 512 << 10;
const MODULE_NAME: &str = "config_script";

const HARNESS: &str = r#"
function __run(runner, p) {
    var ret = runner(JSON.parse(p));
    if (typeof ret === "object" && ret !== null) {
        return JSON.stringify(ret);
    }
    return String(ret);
}
"#;

pub struct JavaScriptRuntime {
    runtime: Runtime,
    context: Context,
    cache: Arc<ProgramCache<Program>>,
    // bytecode loaded as ROM data is referenced in place, so it lives as
    // long as the context that loaded it
    loaded: Vec<Program>,
}

impl JavaScriptRuntime {
    pub fn new(interrupt: Interrupt, cache: Arc<ProgramCache<Program>>) -> Result<Self> {
        let runtime = Runtime::new().context("javascript: runtime init failed")?;
        runtime.set_memory_limit(MEMORY_LIMIT);
        runtime.set_max_stack_size(MAX_STACK_SIZE);
        runtime.set_interrupt_handler(Some(Box::new(move || interrupt.is_raised())));
        let context = harness_context(&runtime)?;
        Ok(Self {
            runtime,
            context,
            cache,
            loaded: Vec::new(),
        })
    }
}

impl GuestRuntime for JavaScriptRuntime {
    fn execute(&mut self, job: &ScriptJob) -> Result<String, ScriptError> {
        let cache = &self.cache;
        let loaded = &mut self.loaded;

        self.context.with(|ctx| {
            let module = if job.cache_id.is_empty() {
                declare(&ctx, &job.source)?
            } else {
                let mut declared = None;
                let program = cache.get_or_compile(&job.cache_id, || {
                    let module = declare(&ctx, &job.source)?;
                    let bytecode = module
                        .write(false)
                        .map_err(|e| describe(&ctx, e, ScriptError::Runtime))?;
                    declared = Some(module);
                    Ok::<Program, ScriptError>(Arc::from(bytecode))
                })?;
                match declared {
                    Some(module) => module,
                    None => {
                        loaded.push(program.clone());
                        // SAFETY: the bytes were written by `Module::write` in this
                        // process with native byte order, and `loaded` keeps them
                        // alive until the context is replaced.
                        unsafe { Module::load(ctx.clone(), &program) }
                            .map_err(|e| describe(&ctx, e, ScriptError::Runtime))?
                    }
                }
            };

            let (module, evaluated) = module
                .eval()
                .map_err(|e| describe(&ctx, e, ScriptError::Runtime))?;
            evaluated
                .finish::<Value>()
                .map_err(|e| describe(&ctx, e, ScriptError::Runtime))?;
            let runner: Function = module
                .get("default")
                .map_err(|e| describe(&ctx, e, ScriptError::Runtime))?;
            let run: Function = ctx
                .globals()
                .get("__run")
                .map_err(|e| describe(&ctx, e, ScriptError::Runtime))?;
            run.call::<_, String>((runner, job.params.as_str()))
                .map_err(|e| describe(&ctx, e, ScriptError::Runtime))
        })
    }

    fn reset(&mut self) -> Result<()> {
        self.context = harness_context(&self.runtime)?;
        self.runtime.run_gc();
        self.loaded.clear();
        Ok(())
    }
}

fn harness_context(runtime: &Runtime) -> Result<Context> {
    let context = Context::full(runtime).context("javascript: context init failed")?;
    context
        .with(|ctx| ctx.eval::<Value, _>(HARNESS).map(|_| ()))
        .map_err(|e| anyhow!("javascript: harness failed to load: {}", e))?;
    Ok(context)
}

fn wrap(source: &str) -> String {
    format!("export default function (p) {{\n{source}\n}}")
}

fn declare<'js>(ctx: &Ctx<'js>, source: &str) -> Result<Module<'js>, ScriptError> {
    Module::declare(ctx.clone(), MODULE_NAME, wrap(source))
        .map_err(|e| describe(ctx, e, ScriptError::Syntax))
}

fn describe(ctx: &Ctx<'_>, err: rquickjs::Error, kind: fn(String) -> ScriptError) -> ScriptError {
    let message = match err {
        rquickjs::Error::Exception => {
            let thrown = ctx.catch();
            if let Some(exception) = thrown.as_exception() {
                exception
                    .message()
                    .unwrap_or_else(|| "uncaught exception".to_string())
            } else if let Some(text) = thrown.as_string().and_then(|s| s.to_string().ok()) {
                text
            } else {
                "uncaught exception".to_string()
            }
        }
        other => other.to_string(),
    };
    kind(message)
}
