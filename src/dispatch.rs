//! Request orchestration: config lookup, gray selection, targeting rules,
//! parameter validation and pooled execution, plus the unit-test,
//! playground and error-report flows built from the same pieces.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::DispatchError;
use crate::gray;
use crate::model::{Code, Config, ErrorReport, RequestMeta};
use crate::params::{self, ParamError};
use crate::record_cache::{code_key, config_key, RecordCache, DEFAULT_RECORD_TTL};
use crate::rules;
use crate::runtime::{GuestLanguage, ScriptEngines};
use crate::storage::RecordStore;

pub const DEFAULT_BREAK_THRESHOLD: u32 = 10;

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    pub record_ttl: Duration,
    pub break_threshold: u32,
    /// Required in the `Secret` header of unit-test runs.
    pub test_secret: Option<String>,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            record_ttl: DEFAULT_RECORD_TTL,
            break_threshold: DEFAULT_BREAK_THRESHOLD,
            test_secret: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub meta: RequestMeta,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigResponse {
    pub result: String,
    pub code_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PlaygroundRequest {
    pub code: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    /// Execution time in microseconds.
    pub duration: u64,
    pub succeed: bool,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportOutcome {
    pub code_id: String,
    pub error_count: u32,
    pub is_broken: bool,
}

pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    records: Option<Arc<dyn RecordCache>>,
    engines: Arc<ScriptEngines>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        records: Option<Arc<dyn RecordCache>>,
        engines: Arc<ScriptEngines>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            records,
            engines,
            settings,
        }
    }

    pub fn engines(&self) -> &ScriptEngines {
        &self.engines
    }

    /// Resolve and execute the code a config currently serves to this caller.
    pub fn get_config(
        &self,
        config_id: &str,
        request: &ConfigRequest,
    ) -> Result<ConfigResponse, DispatchError> {
        let config = self
            .load_config(config_id, request.cached)
            .map_err(DispatchError::internal)?
            .ok_or_else(|| {
                DispatchError::Input(format!("config record {config_id} does not exist"))
            })?;
        if !config.is_active() {
            return Err(DispatchError::Forbidden("the config is not active".to_string()));
        }

        let selection = gray::select_code(&config, &request.meta.device_id, |code_id| {
            self.load_code(code_id, request.cached)?
                .ok_or_else(|| anyhow!("code record {} does not exist", code_id))
        })
        .map_err(|e| DispatchError::internal(format!("{e:#}")))?;
        let code = selection.code;
        if code.is_broken {
            return Err(DispatchError::Forbidden(
                "the requested config is broken".to_string(),
            ));
        }

        let eligible = rules::evaluate(&code.rules, &request.meta)
            .map_err(|e| DispatchError::internal(format!("code {}: {e:#}", code.code_id)))?;
        if !eligible {
            return Err(DispatchError::Rejected(
                "request rejected by targeting rules".to_string(),
            ));
        }

        let params = validate_params(&code, &request.params)?;
        let lang = parse_lang(&code.lang)?;

        let cache_id = if request.cached {
            format!("{}/{}", config.config_id, code.code_id)
        } else {
            String::new()
        };
        let result = self
            .engines
            .run(lang, &cache_id, &code.content, &params)
            .map_err(|e| DispatchError::Execution(format!("execution failed: {e}")))?;

        if selection.is_gray {
            log::debug!("config {} served gray code {}", config.config_id, code.code_id);
        }
        Ok(ConfigResponse {
            result,
            code_id: code.code_id,
        })
    }

    /// Run a stored unit test against its code version and compare outputs
    /// as JSON values.
    pub fn run_test(
        &self,
        test_id: &str,
        secret: Option<&str>,
    ) -> Result<TestReport, DispatchError> {
        let secret = match secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => return Err(DispatchError::Input("missing secret".to_string())),
        };
        let expected_secret = match self.settings.test_secret.as_deref() {
            Some(expected) if !expected.is_empty() => expected,
            _ => {
                return Err(DispatchError::internal(
                    "test secret is not configured on this server",
                ))
            }
        };
        if secret != expected_secret {
            return Err(DispatchError::Forbidden("wrong access secret".to_string()));
        }

        let test_case = self
            .store
            .get_test_case(test_id)
            .map_err(DispatchError::internal)?
            .ok_or_else(|| {
                DispatchError::Input(format!("test record {test_id} does not exist"))
            })?;
        let code = self
            .store
            .get_code(&test_case.code_id)
            .map_err(DispatchError::internal)?
            .ok_or_else(|| {
                DispatchError::internal(format!(
                    "code record {} for test {} does not exist",
                    test_case.code_id, test_id
                ))
            })?;

        let input: Map<String, Value> = serde_json::from_str(&test_case.input)
            .map_err(|e| DispatchError::Input(format!("invalid JSON input: {e}")))?;
        let params = validate_params(&code, &input)?;
        let lang = parse_lang(&code.lang)?;

        let started = Instant::now();
        let output = self
            .engines
            .run(lang, "", &code.content, &params)
            .map_err(|e| DispatchError::Execution(e.to_string()))?;
        let duration = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);

        // bare string results are compared as JSON strings
        let actual: Value =
            serde_json::from_str(&output).unwrap_or_else(|_| Value::String(output.clone()));
        let expected: Value = serde_json::from_str(&test_case.output).map_err(|e| {
            DispatchError::Input(format!("fail to parse JSON from expected output: {e}"))
        })?;

        let succeed = actual == expected;
        let message = if succeed {
            "success".to_string()
        } else {
            format!("wrong output:\n{output}")
        };
        log::info!(
            "unit test {} on code {}: succeed={} in {}us",
            test_id,
            code.code_id,
            succeed,
            duration
        );
        Ok(TestReport {
            duration,
            succeed,
            message,
        })
    }

    /// Execute ad-hoc code without caching or schema validation.
    pub fn run_playground(
        &self,
        lang: &str,
        request: &PlaygroundRequest,
    ) -> Result<String, DispatchError> {
        let lang = parse_lang(lang)?;
        let params = serde_json::to_string(&request.params).map_err(DispatchError::internal)?;
        self.engines
            .run(lang, "", &request.code, &params)
            .map_err(|e| DispatchError::Execution(e.to_string()))
    }

    /// Record a client-side failure of the stable or gray code of a config.
    pub fn report_error(
        &self,
        config_id: &str,
        code_id: &str,
        secret: Option<&str>,
        report: &ErrorReport,
    ) -> Result<ReportOutcome, DispatchError> {
        let secret = match secret {
            Some(secret) if !secret.is_empty() => secret,
            _ => return Err(DispatchError::Input("missing secret".to_string())),
        };

        let config = self
            .store
            .get_config(config_id)
            .map_err(DispatchError::internal)?
            .ok_or_else(|| {
                DispatchError::Input(format!("config record {config_id} does not exist"))
            })?;
        if config.secret.is_empty() || config.secret != secret {
            return Err(DispatchError::Forbidden("mismatched access secret".to_string()));
        }
        if !config.is_active() {
            return Err(DispatchError::Forbidden("the config is not active".to_string()));
        }
        if !serves_code(&config, code_id) {
            return Err(DispatchError::Input(format!(
                "code {code_id} is not a current version of config {config_id}"
            )));
        }

        let code = self
            .store
            .get_code(code_id)
            .map_err(DispatchError::internal)?
            .ok_or_else(|| {
                DispatchError::internal(format!("code record {code_id} does not exist"))
            })?;
        if code.is_broken {
            return Err(DispatchError::Forbidden(
                "the code is already disabled due to errors".to_string(),
            ));
        }

        let mut report = report.clone();
        if report.time <= 0 {
            let now = crate::now_s().map_err(DispatchError::internal)?;
            report.time = i64::try_from(now).unwrap_or(i64::MAX);
        }
        let updated = self
            .store
            .record_error(code_id, &report, self.settings.break_threshold)
            .map_err(|e| DispatchError::internal(format!("{e:#}")))?;
        self.forget(&code_key(code_id));

        if updated.is_broken {
            log::warn!(
                "code {} of config {} disabled after {} error reports",
                code_id,
                config_id,
                updated.error_count
            );
        }
        Ok(ReportOutcome {
            code_id: updated.code_id,
            error_count: updated.error_count,
            is_broken: updated.is_broken,
        })
    }

    fn load_config(&self, config_id: &str, cached: bool) -> Result<Option<Config>> {
        self.load_record(config_key(config_id), cached, || {
            self.store.get_config(config_id)
        })
    }

    fn load_code(&self, code_id: &str, cached: bool) -> Result<Option<Code>> {
        self.load_record(code_key(code_id), cached, || self.store.get_code(code_id))
    }

    // The cache is only read when the caller asked for cached data, and is
    // refreshed after every store read.
    fn load_record<T, F>(&self, key: String, cached: bool, fetch: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<Option<T>>,
    {
        let Some(cache) = self.records.as_ref() else {
            return fetch();
        };

        if cached {
            match cache.get(&key) {
                Ok(Some(raw)) => match serde_json::from_str(&raw) {
                    Ok(record) => return Ok(Some(record)),
                    Err(e) => log::warn!("discarding undecodable cached record {}: {}", key, e),
                },
                Ok(None) => {}
                Err(e) => log::warn!("record cache read failed for {}: {:#}", key, e),
            }
        }

        let record = fetch()?;
        if let Some(record) = record.as_ref() {
            match serde_json::to_string(record) {
                Ok(raw) => {
                    if let Err(e) = cache.set(&key, &raw, self.settings.record_ttl) {
                        log::warn!("record cache write failed for {}: {:#}", key, e);
                    }
                }
                Err(e) => log::warn!("failed to encode record {} for caching: {}", key, e),
            }
        }
        Ok(record)
    }

    fn forget(&self, key: &str) {
        if let Some(cache) = self.records.as_ref() {
            if let Err(e) = cache.remove(key) {
                log::warn!("record cache invalidation failed for {}: {:#}", key, e);
            }
        }
    }
}

fn serves_code(config: &Config, code_id: &str) -> bool {
    code_id == config.released_code
        || (!config.gray_release_code.is_empty() && code_id == config.gray_release_code)
}

fn parse_lang(lang: &str) -> Result<GuestLanguage, DispatchError> {
    lang.parse()
        .map_err(|_| DispatchError::Input(format!("unsupported language: {lang}")))
}

/// Validate caller params against the code's schema and re-serialize them
/// for the interpreter.
fn validate_params(code: &Code, params: &Map<String, Value>) -> Result<String, DispatchError> {
    let typed = params::validate(&code.params, params).map_err(|e: ParamError| {
        if e.is_schema_error() {
            DispatchError::internal(format!("code {}: {e}", code.code_id))
        } else {
            DispatchError::Input(format!("invalid parameters: {e}"))
        }
    })?;
    serde_json::to_string(&typed).map_err(DispatchError::internal)
}
