//! Document loader.
//!
//! Reads test documents from disk and turns them into runnable suites. Every
//! configuration problem is reported here, before any command runs.

use crate::assertions::{Assertion, AssertionContext, AssertionRegistry, Output, Status};
use crate::config::{self, Config};
use crate::error::Error;
use crate::runner::{Case, Invocation, Lifecycle, Runnable, Scenario, Suite, Test};
use crate::schema::{CaseSpec, Document, TestSpec};
use crate::steps::{self, StepSequence};
use crate::template;
use crate::vars::LoaderRegistry;
use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Extensions recognised as test documents.
pub const DOCUMENT_EXTENSIONS: &[&str] = &["yaml", "yml", "toml"];

/// Parse a document from a file path.
pub fn load_document(path: &Path) -> Result<Document, Error> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

    let tree: serde_yaml::Value = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Parse(format!("invalid YAML: {e}")))?,
        "toml" => {
            let value: toml::Value = toml::from_str(&contents)
                .map_err(|e| Error::Parse(format!("invalid TOML: {e}")))?;
            serde_yaml::to_value(value).map_err(|e| Error::Parse(e.to_string()))?
        }
        other => {
            return Err(Error::Parse(format!(
                "unsupported file format: {other} (expected .yaml, .yml, or .toml)"
            )));
        }
    };
    serde_yaml::from_value(tree).map_err(|e| Error::Parse(e.to_string()))
}

/// Load and build the suite of one document with the built-in registries.
pub fn load_suite(path: &Path) -> Result<Suite, Error> {
    SuiteBuilder::default().load(path)
}

/// Turns parsed documents into suites.
///
/// Holds the variable loaders and assertion kinds available to documents;
/// register extra kinds on the registries before loading.
#[derive(Debug, Clone, Default)]
pub struct SuiteBuilder {
    pub loaders: LoaderRegistry,
    pub assertions: AssertionRegistry,
}

impl SuiteBuilder {
    pub fn load(&self, path: &Path) -> Result<Suite, Error> {
        self.build(load_document(path)?, path)
    }

    /// Build a suite from a parsed document located at `filename`.
    ///
    /// Kinds, registrations and definition references are checked before
    /// variables are resolved, since resolving may run commands.
    pub fn build(&self, document: Document, filename: &Path) -> Result<Suite, Error> {
        self.check(&document)?;
        let config = Arc::new(Config::from_spec(
            &document.config,
            filename,
            self.loaders.clone(),
        )?);

        let definitions = document
            .pre_run_definitions
            .iter()
            .map(|(name, raw)| {
                let sequence = StepSequence::from_values(name, raw, &config)?;
                Ok((name.clone(), Arc::new(sequence)))
            })
            .collect::<Result<BTreeMap<_, _>, Error>>()?;

        let cases = document
            .cases
            .iter()
            .map(|case| self.build_case(case, &definitions, &config))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "{}: {} case(s), {} pre-run definition(s)",
            filename.display(),
            cases.len(),
            definitions.len()
        );
        Ok(Suite { config, cases })
    }

    fn check(&self, document: &Document) -> Result<(), Error> {
        for raw in document.pre_run_definitions.values().flatten() {
            steps::check_step(raw)?;
        }
        for case in &document.cases {
            if let Some(name) = case
                .setup
                .iter()
                .chain(&case.teardown)
                .find(|name| !document.pre_run_definitions.contains_key(*name))
            {
                return Err(Error::UnknownDefinition(name.clone()));
            }
            let invocations = case
                .tests
                .iter()
                .chain(case.scenarios.iter().flat_map(|s| &s.steps));
            for spec in invocations {
                self.build_assertions(spec)?;
                spec.pre_runs.iter().try_for_each(steps::check_step)?;
            }
        }
        Ok(())
    }

    fn build_case(
        &self,
        spec: &CaseSpec,
        definitions: &BTreeMap<String, Arc<StepSequence>>,
        config: &Arc<Config>,
    ) -> Result<Case, Error> {
        let lookup = |names: &[String]| {
            names
                .iter()
                .map(|name| {
                    definitions
                        .get(name)
                        .cloned()
                        .ok_or_else(|| Error::UnknownDefinition(name.clone()))
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let lifecycle = Lifecycle {
            setup: lookup(&spec.setup)?,
            teardown: lookup(&spec.teardown)?,
        };

        let mut runnables = Vec::with_capacity(spec.tests.len() + spec.scenarios.len());
        for test in &spec.tests {
            runnables.push(Runnable::Test(Test {
                name: format!("{}:{}", spec.name, test.name),
                invocation: self.build_invocation(test, config)?,
                lifecycle: lifecycle.clone(),
                config: config.clone(),
            }));
        }
        for scenario in &spec.scenarios {
            let steps = scenario
                .steps
                .iter()
                .map(|step| self.build_invocation(step, config))
                .collect::<Result<Vec<_>, _>>()?;
            runnables.push(Runnable::Scenario(Scenario {
                name: format!("{}:{}", spec.name, scenario.name),
                steps,
                lifecycle: lifecycle.clone(),
                config: config.clone(),
            }));
        }

        Ok(Case {
            name: spec.name.clone(),
            runnables,
        })
    }

    fn build_invocation(&self, spec: &TestSpec, config: &Config) -> Result<Invocation, Error> {
        for text in [Some(&spec.cmd), spec.stdin.as_ref(), spec.cwd.as_ref()]
            .into_iter()
            .flatten()
        {
            template::placeholders(text)?;
        }

        let mut invocation = Invocation::new(&spec.name, &spec.cmd);
        invocation.stdin = spec.stdin.clone();
        invocation.cwd = spec.cwd.clone();
        invocation.timeout = spec.timeout.map(config::seconds).transpose()?;

        invocation.assertions = self.build_assertions(spec)?;
        invocation.pre_runs = spec
            .pre_runs
            .iter()
            .map(|raw| steps::build_step(raw, config))
            .collect::<Result<_, _>>()?;
        Ok(invocation)
    }

    /// Expand the `status`/`output` shorthand and construct declared
    /// assertions, in that order.
    fn build_assertions(&self, spec: &TestSpec) -> Result<Vec<Box<dyn Assertion>>, Error> {
        let mut assertions: Vec<Box<dyn Assertion>> = Vec::new();
        if let Some(status) = spec.status {
            assertions.push(Box::new(Status::new(status)));
        }
        if let Some(output) = &spec.output {
            template::placeholders(output)?;
            assertions.push(Box::new(Output::new(output)));
        }
        let ctx = AssertionContext {
            cwd: spec.cwd.clone(),
        };
        for map in &spec.assertions {
            assertions.push(self.assertions.construct(map, &ctx)?);
        }
        Ok(assertions)
    }
}

/// Find all documents in a directory or return the single file.
pub fn find_documents(path: &Path) -> Result<Vec<PathBuf>, Error> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut documents = Vec::new();
    collect_documents(path, &mut documents)?;
    documents.sort();
    Ok(documents)
}

fn collect_documents(dir: &Path, documents: &mut Vec<PathBuf>) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))? {
        let path = entry.map_err(|e| Error::io(dir, e))?.path();

        if path.is_dir() {
            collect_documents(&path, documents)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && DOCUMENT_EXTENSIONS.contains(&ext)
        {
            documents.push(path);
        }
    }
    Ok(())
}
