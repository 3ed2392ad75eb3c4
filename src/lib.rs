//! Remote configuration service core.
//!
//! A config is served by running a small user-authored script (JavaScript or
//! Starlark) against caller parameters. Before anything runs the request goes
//! through gray-release selection, targeting rules and parameter validation.
//!
//! # Module Structure
//!
//! - `runtime`: interpreter pools, compiled-program caches and the two guest
//!   language adapters
//! - `rules`, `gray`, `params`: targeting, rollout bucketing and parameter
//!   schema checks
//! - `dispatch`: the request flows tying the pieces together
//! - `storage`, `record_cache`: record persistence and the read-through cache
//! - `api`, `config`: the HTTP surface and process configuration

use anyhow::{anyhow, Result};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gray;
pub mod model;
pub mod params;
pub mod record_cache;
pub mod rules;
pub mod runtime;
pub mod storage;

pub use dispatch::{ConfigRequest, ConfigResponse, DispatchSettings, Dispatcher};
pub use error::DispatchError;
pub use model::{Code, Config, ErrorReport, ParamSpec, PlatformRule, RequestMeta, Rule, TestCase};
pub use record_cache::{MemoryRecordCache, RecordCache};
pub use runtime::{EngineConfig, GuestLanguage, ScriptEngines, ScriptError};
pub use storage::{InMemoryRecordStore, RecordStore, SqliteRecordStore};

/// Record ids arrive in URL paths and cache keys, so only a plain token
/// alphabet is accepted.
///
/// Allowed: "100000", "release_v2", "gray-1.3"
/// Disallowed: empty ids, slashes, whitespace, anything over 64 bytes.
pub fn validate_record_id(id: &str) -> Result<()> {
    static RECORD_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RECORD_ID_RE.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9_.-]{1,64}$").unwrap());

    if !re.is_match(id) {
        return Err(anyhow!("invalid record id: must match ^[A-Za-z0-9_.-]{{1,64}}$"));
    }
    Ok(())
}

pub fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}
