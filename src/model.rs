//! Records handed to the core by the record store.
//!
//! Rule and parameter types keep the stored string form; they are parsed when
//! evaluated so a bad record surfaces as an internal error on the request that
//! touches it instead of failing the whole lookup.

use serde::{Deserialize, Serialize};

pub const CONFIG_STATUS_VALID: &str = "valid";

/// Platform/version fingerprint submitted with every request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub device_id: String,
}

/// A config points at the code versions currently released for it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub config_id: String,
    pub released_code: String,
    #[serde(default)]
    pub test_code: String,
    #[serde(default)]
    pub gray_release_code: String,
    #[serde(default)]
    pub percentage: u32,
    pub status: String,
    #[serde(default)]
    pub secret: String,
}

impl Config {
    pub fn is_active(&self) -> bool {
        self.status == CONFIG_STATUS_VALID
    }
}

/// One atomic comparison, e.g. `version >= 10`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub field: String,
    pub compare: String,
    pub value: String,
}

/// Rule alternatives (OR) of rule lists (AND) scoped to one platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformRule {
    pub platform: String,
    #[serde(default)]
    pub rules: Vec<Vec<Rule>>,
}

/// Declared parameter of a code version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// An immutable code version plus its error-tracking pair.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
    pub code_id: String,
    pub lang: String,
    #[serde(default)]
    pub rules: Vec<PlatformRule>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    pub content: String,
    #[serde(default)]
    pub is_broken: bool,
    #[serde(default)]
    pub error_count: u32,
}

/// Stored unit test: JSON input for a code version and its expected JSON output.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub test_id: String,
    pub input: String,
    pub output: String,
    pub code_id: String,
}

/// Client-side execution failure reported against a code version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "err_time", default)]
    pub time: i64,
    #[serde(default)]
    pub message: String,
}
