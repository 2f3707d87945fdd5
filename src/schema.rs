//! Schema definitions for cmdspec documents.
//!
//! This module defines the shape of a test document. Parts whose shape
//! depends on a declared `type` (variable descriptors, pre-run steps and
//! assertions) are kept as generic mappings here and decoded by the module
//! that owns that kind, so unknown kinds get their own errors.

use crate::error::Error;
use crate::steps::Registration;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;

/// Root of a test document.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Document {
    /// Variables, coverage and environment shared by every case.
    #[serde(default)]
    pub config: ConfigSpec,

    /// Named, reusable lists of pre-run steps.
    #[serde(default)]
    #[schemars(with = "BTreeMap<String, Vec<serde_json::Value>>")]
    pub pre_run_definitions: BTreeMap<String, Vec<Value>>,

    /// The test cases.
    pub cases: Vec<CaseSpec>,
}

/// Top-level `config` block.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ConfigSpec {
    /// Variable declarations: a string literal or `{type: <loader>, ...}`.
    #[serde(default)]
    #[schemars(with = "BTreeMap<String, serde_json::Value>")]
    pub vars: Mapping,

    /// Coverage instrumentation of the tested command.
    #[serde(default)]
    pub coverage: Coverage,

    /// Environment variables set for every command (values are templates).
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Default command timeout in seconds. Commands block until exit when unset.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// Coverage configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, JsonSchema)]
pub struct Coverage {
    /// Prefix commands with `coverage run -a`.
    #[serde(default)]
    pub enabled: bool,

    /// Optional rcfile passed with `--rcfile`.
    #[serde(default)]
    pub coveragerc: String,

    /// Erase previous coverage data before running the document.
    #[serde(default)]
    pub reset: bool,
}

/// A named group of tests and scenarios.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CaseSpec {
    /// Case name, used as prefix of the test names.
    pub name: String,

    /// Pre-run definitions applied around every test and scenario.
    #[serde(default)]
    pub setup: Vec<String>,

    /// Pre-run definitions run after every test and scenario.
    #[serde(default)]
    pub teardown: Vec<String>,

    /// Independent tests.
    #[serde(default)]
    pub tests: Vec<TestSpec>,

    /// Ordered test sequences sharing one setup.
    #[serde(default)]
    pub scenarios: Vec<ScenarioSpec>,
}

/// One command and what to expect from it.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct TestSpec {
    /// Test name.
    pub name: String,

    /// Command line template, run through the shell.
    pub cmd: String,

    /// Shorthand for a `status` assertion.
    #[serde(default)]
    pub status: Option<i32>,

    /// Shorthand for an `output` (prefix) assertion.
    #[serde(default)]
    pub output: Option<String>,

    /// Additional assertions, each `{type: <kind>, ...}`.
    #[serde(default)]
    #[schemars(with = "Vec<serde_json::Map<String, serde_json::Value>>")]
    pub assertions: Vec<Mapping>,

    /// Steps run before this command, after the case setup.
    #[serde(default)]
    #[schemars(with = "Vec<serde_json::Value>")]
    pub pre_runs: Vec<Value>,

    /// Standard input to provide (template).
    #[serde(default)]
    pub stdin: Option<String>,

    /// Working directory (template).
    #[serde(default)]
    pub cwd: Option<String>,

    /// Timeout in seconds, overriding the document default.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// An ordered list of test-shaped steps sharing one execution state.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ScenarioSpec {
    /// Scenario name.
    pub name: String,

    /// Steps, run in order.
    pub steps: Vec<TestSpec>,
}

/// `{type: sequence, steps}` pre-run step.
#[derive(Debug, Clone, Deserialize)]
pub struct SequenceSpec {
    #[serde(default)]
    pub name: Option<String>,
    pub steps: Vec<Value>,
}

/// `{type: command, command, register}` pre-run step.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub register: Vec<Registration>,
}

/// Parameters of the `write_file` command.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteFileSpec {
    pub source: SourceSpec,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSpec {
    #[serde(rename = "type", default = "default_source_kind")]
    pub kind: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub contents: Option<String>,
}

fn default_source_kind() -> String {
    "template".to_string()
}

/// Parameters of the `shell` command.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSpec {
    pub run: String,
    #[serde(default)]
    pub undo: Option<String>,
}

/// `{type: env, name, value}` pre-run step.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvSpec {
    pub name: String,
    pub value: String,
}

/// Decode a typed view of a generic mapping.
pub(crate) fn decode<T: DeserializeOwned>(map: &Mapping, what: &str) -> Result<T, Error> {
    serde_yaml::from_value(Value::Mapping(map.clone()))
        .map_err(|e| Error::Parse(format!("{what}: {e}")))
}

/// Generate the JSON Schema for test documents.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(Document)
}
