//! Starlark guest runtime.
//!
//! User code becomes the body of `def run(p):` after a line that decodes the
//! parameter JSON. A compiled program is the frozen module holding `run`;
//! frozen modules are immutable and shared across slots as-is.
//!
//! The evaluator has no interrupt hook, so a timed-out Starlark job keeps its
//! slot until it returns on its own.

use anyhow::Result;
use starlark::environment::{FrozenModule, Globals, GlobalsBuilder, LibraryExtension, Module};
use starlark::eval::Evaluator;
use starlark::syntax::{AstModule, Dialect};
use starlark::values::Value;
use std::sync::Arc;

use super::cache::ProgramCache;
use super::{GuestRuntime, ScriptError, ScriptJob};

pub type Program = FrozenModule;

const RUNNER_HEADER: &str = "def run(p):\n    p = json.decode(p)\n";
const INDENT: &str = "    ";

pub struct StarlarkRuntime {
    globals: Globals,
    cache: Arc<ProgramCache<Program>>,
}

impl StarlarkRuntime {
    pub fn new(cache: Arc<ProgramCache<Program>>) -> Result<Self> {
        let globals = GlobalsBuilder::extended_by(&[LibraryExtension::Json]).build();
        Ok(Self { globals, cache })
    }
}

impl GuestRuntime for StarlarkRuntime {
    fn execute(&mut self, job: &ScriptJob) -> Result<String, ScriptError> {
        let globals = &self.globals;
        let program = self
            .cache
            .get_or_compile(&job.cache_id, || compile(globals, &job.cache_id, &job.source))?;

        let module = Module::new();
        let run = program
            .get("run")
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        let run = run.owned_value(module.frozen_heap());
        let params = module.heap().alloc(job.params.as_str());

        let mut eval = Evaluator::new(&module);
        let value = eval
            .eval_function(run, &[params], &[])
            .map_err(|e| ScriptError::Runtime(e.to_string()))?;
        render(value)
    }
}

fn wrap(source: &str) -> String {
    let mut wrapped = String::with_capacity(RUNNER_HEADER.len() + source.len() + 64);
    wrapped.push_str(RUNNER_HEADER);
    for line in source.lines() {
        wrapped.push_str(INDENT);
        wrapped.push_str(line);
        wrapped.push('\n');
    }
    wrapped
}

fn compile(globals: &Globals, cache_id: &str, source: &str) -> Result<Program, ScriptError> {
    let name = if cache_id.is_empty() {
        "script.star".to_string()
    } else {
        format!("{cache_id}.star")
    };
    let ast = AstModule::parse(&name, wrap(source), &Dialect::Standard)
        .map_err(|e| ScriptError::Syntax(e.to_string()))?;

    let module = Module::new();
    {
        let mut eval = Evaluator::new(&module);
        eval.eval_module(ast, globals)
            .map_err(|e| ScriptError::Syntax(e.to_string()))?;
    }
    module
        .freeze()
        .map_err(|e| ScriptError::Syntax(e.to_string()))
}

// strings come back raw; containers as JSON; anything else as its repr
fn render(value: Value) -> Result<String, ScriptError> {
    if let Some(text) = value.unpack_str() {
        return Ok(text.to_string());
    }
    match value.get_type() {
        "dict" | "list" | "tuple" | "struct" => value
            .to_json()
            .map_err(|e| ScriptError::Runtime(format!("result is not JSON encodable: {e}"))),
        _ => Ok(value.to_str()),
    }
}
