//! Document-level configuration.

use crate::error::Error;
use crate::exec::{self, RunOptions};
use crate::schema::{ConfigSpec, Coverage};
use crate::scope::Scope;
use crate::template;
use crate::vars::{LoadContext, LoaderRegistry, VariableLoader};
use log::debug;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Resolved `config` block of a document.
///
/// Built once per document and shared read-only by every test it generates.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Variables resolved at load time; each run starts from a copy.
    pub variables: Scope,
    pub coverage: Coverage,
    /// Environment overlay for every run, already rendered.
    pub env: BTreeMap<String, String>,
    /// Default command timeout.
    pub timeout: Option<Duration>,
    loader: VariableLoader,
}

impl Config {
    /// Empty configuration for a document at `filename`.
    pub fn for_file(filename: impl Into<PathBuf>) -> Self {
        Self {
            loader: VariableLoader::new(LoaderRegistry::builtin(), LoadContext::new(filename)),
            ..Self::default()
        }
    }

    /// Resolve a `config` block.
    pub fn from_spec(
        spec: &ConfigSpec,
        filename: impl Into<PathBuf>,
        registry: LoaderRegistry,
    ) -> Result<Self, Error> {
        let loader = VariableLoader::new(registry, LoadContext::new(filename));
        let variables = loader.load_variables(&spec.vars)?;
        debug!("resolved {} variable(s)", variables.len());

        let env = spec
            .env
            .iter()
            .map(|(k, v)| Ok((k.clone(), template::render(v, &variables)?)))
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        Ok(Self {
            variables,
            coverage: spec.coverage.clone(),
            env,
            timeout: spec.timeout.map(seconds).transpose()?,
            loader,
        })
    }

    /// Path of the document this configuration was loaded from.
    pub fn context(&self) -> &LoadContext {
        self.loader.context()
    }

    /// Resolve one more variable against the document's variables.
    pub fn load_variable(&self, name: &str, raw: &Value) -> Result<String, Error> {
        self.loader.load_variable(name, raw, &self.variables)
    }
}

/// Convert a timeout in seconds from the document.
pub(crate) fn seconds(secs: f64) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(secs)
        .map_err(|e| Error::Parse(format!("invalid timeout {secs}: {e}")))
}

impl Coverage {
    /// Command prefix when coverage is enabled.
    pub fn prefix(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        let mut prefix = vec!["coverage", "run", "-a"];
        if !self.coveragerc.is_empty() {
            prefix.extend(["--rcfile", self.coveragerc.as_str()]);
        }
        Some(prefix.join(" "))
    }

    /// Apply the prefix to a command line.
    pub fn wrap(&self, line: &str) -> String {
        match self.prefix() {
            Some(prefix) => format!("{prefix} {line}"),
            None => line.to_string(),
        }
    }

    /// Erase collected coverage data.
    pub fn erase(&self) -> Result<(), Error> {
        let mut line = "coverage erase".to_string();
        if !self.coveragerc.is_empty() {
            line.push_str(" --rcfile ");
            line.push_str(&self.coveragerc);
        }
        let outcome = exec::run(&line, &RunOptions::default())?;
        if outcome.status != 0 {
            return Err(Error::StepFailed {
                step: line,
                message: outcome.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> ConfigSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn coverage_prefix() {
        let mut coverage = Coverage::default();
        assert_eq!(coverage.wrap("tool --help"), "tool --help");

        coverage.enabled = true;
        assert_eq!(coverage.wrap("tool"), "coverage run -a tool");

        coverage.coveragerc = "cov.rc".to_string();
        assert_eq!(
            coverage.prefix().as_deref(),
            Some("coverage run -a --rcfile cov.rc")
        );
    }

    #[test]
    fn env_values_are_rendered_from_variables() {
        let config = Config::from_spec(
            &spec("vars: {root: /opt/tool}\nenv: {TOOL_HOME: '${root}/home'}\n"),
            "doc.yaml",
            LoaderRegistry::builtin(),
        )
        .unwrap();
        assert_eq!(config.env["TOOL_HOME"], "/opt/tool/home");
    }

    #[test]
    fn env_with_undefined_variable_fails_loading() {
        let err = Config::from_spec(
            &spec("env: {X: '${nope}'}\n"),
            "doc.yaml",
            LoaderRegistry::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn negative_timeout_is_rejected() {
        let err = Config::from_spec(
            &spec("timeout: -1\n"),
            "doc.yaml",
            LoaderRegistry::builtin(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn load_variable_uses_document_scope() {
        let config = Config::from_spec(
            &spec("vars: {name: tool}\n"),
            "doc.yaml",
            LoaderRegistry::builtin(),
        )
        .unwrap();
        let raw: Value = serde_yaml::from_str("{type: template, value: '${name}-cli'}").unwrap();
        assert_eq!(config.load_variable("bin", &raw).unwrap(), "tool-cli");
    }
}
