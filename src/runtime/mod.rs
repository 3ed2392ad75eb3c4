//! Guest script execution: one interpreter pool and one compiled-program
//! cache per supported language.

pub mod cache;
pub mod javascript;
pub mod pool;
pub mod sandbox;
pub mod starlark;

use anyhow::Result;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use self::cache::{ProgramCache, DEFAULT_CACHE_TTL, DEFAULT_MAX_ENTRIES};
use self::javascript::JavaScriptRuntime;
use self::pool::{InterpreterPool, PoolConfig};
use self::starlark::StarlarkRuntime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GuestLanguage {
    JavaScript,
    Starlark,
}

impl GuestLanguage {
    pub fn as_str(self) -> &'static str {
        match self {
            GuestLanguage::JavaScript => "javascript",
            GuestLanguage::Starlark => "starlark",
        }
    }
}

impl FromStr for GuestLanguage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "javascript" | "js" => Ok(GuestLanguage::JavaScript),
            "starlark" => Ok(GuestLanguage::Starlark),
            other => Err(anyhow::anyhow!("unsupported language: {}", other)),
        }
    }
}

impl fmt::Display for GuestLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("execution timeout: {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("interpreter unavailable: {0}")]
    Unavailable(String),
}

/// One script invocation. `params` is the JSON text of the validated
/// parameter object; an empty `cache_id` disables program caching.
#[derive(Clone, Debug)]
pub struct ScriptJob {
    pub cache_id: String,
    pub source: String,
    pub params: String,
}

/// An interpreter owned by a single pool slot.
pub trait GuestRuntime {
    /// Run the job's `run(p)` entry point and return its result as text.
    fn execute(&mut self, job: &ScriptJob) -> Result<String, ScriptError>;

    /// Restore a clean interpreter. The pool calls this after every job.
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub cache_ttl: Duration,
    pub cache_max_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Both language pools with their program caches.
pub struct ScriptEngines {
    javascript: InterpreterPool,
    starlark: InterpreterPool,
    javascript_cache: Arc<ProgramCache<javascript::Program>>,
    starlark_cache: Arc<ProgramCache<starlark::Program>>,
}

impl ScriptEngines {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let javascript_cache = Arc::new(ProgramCache::new(
            config.cache_ttl,
            config.cache_max_entries,
        ));
        let starlark_cache = Arc::new(ProgramCache::new(
            config.cache_ttl,
            config.cache_max_entries,
        ));

        let cache = javascript_cache.clone();
        let javascript = InterpreterPool::new("javascript", &config.pool, move |interrupt| {
            JavaScriptRuntime::new(interrupt, cache.clone())
        })?;

        let cache = starlark_cache.clone();
        let starlark = InterpreterPool::new("starlark", &config.pool, move |_interrupt| {
            StarlarkRuntime::new(cache.clone())
        })?;

        Ok(Self {
            javascript,
            starlark,
            javascript_cache,
            starlark_cache,
        })
    }

    /// Run `source` with `params` (JSON object text) in a pooled interpreter.
    pub fn run(
        &self,
        lang: GuestLanguage,
        cache_id: &str,
        source: &str,
        params: &str,
    ) -> Result<String, ScriptError> {
        let job = ScriptJob {
            cache_id: cache_id.to_string(),
            source: source.to_string(),
            params: params.to_string(),
        };
        log::debug!("running {} script (cache id '{}')", lang, cache_id);
        self.pool(lang).run(job)
    }

    /// Drop a compiled program so the next cached run recompiles it.
    pub fn clear_cache(&self, lang: GuestLanguage, cache_id: &str) -> bool {
        match lang {
            GuestLanguage::JavaScript => self.javascript_cache.clear(cache_id),
            GuestLanguage::Starlark => self.starlark_cache.clear(cache_id),
        }
    }

    pub fn is_cached(&self, lang: GuestLanguage, cache_id: &str) -> bool {
        match lang {
            GuestLanguage::JavaScript => self.javascript_cache.contains(cache_id),
            GuestLanguage::Starlark => self.starlark_cache.contains(cache_id),
        }
    }

    pub fn cached_programs(&self, lang: GuestLanguage) -> usize {
        match lang {
            GuestLanguage::JavaScript => self.javascript_cache.len(),
            GuestLanguage::Starlark => self.starlark_cache.len(),
        }
    }

    pub fn pool(&self, lang: GuestLanguage) -> &InterpreterPool {
        match lang {
            GuestLanguage::JavaScript => &self.javascript,
            GuestLanguage::Starlark => &self.starlark,
        }
    }
}
