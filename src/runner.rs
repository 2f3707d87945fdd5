//! Test execution engine.
//!
//! Runs the tests and scenarios of a loaded document. Every run owns its
//! own [`ExecutionState`] and [`ResourceStack`], so runs can execute on
//! separate threads.

use crate::assertions::{Assertion, Verdict};
use crate::config::Config;
use crate::error::Error;
use crate::exec::{self, Outcome, RunOptions};
use crate::state::ExecutionState;
use crate::steps::{ResourceStack, ResourceStep, StepSequence};
use crate::template;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Result of running one test or scenario.
#[derive(Debug, serde::Serialize)]
pub struct TestResult {
    /// `<case>:<test>`.
    pub name: String,
    pub passed: bool,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
    /// Every assertion evaluated, in declaration order.
    pub checks: Vec<CheckResult>,
    /// Setup, execution and cleanup errors.
    pub errors: Vec<String>,
}

impl TestResult {
    /// Human-readable reasons this result failed.
    pub fn failures(&self) -> Vec<String> {
        let checks = self.checks.iter().filter_map(|check| {
            let message = match &check.outcome {
                CheckOutcome::Passed => return None,
                CheckOutcome::Failed(message) => message.clone(),
                CheckOutcome::Errored(message) => format!("{}: {message}", check.assertion),
            };
            Some(match &check.step {
                Some(step) => format!("[{step}] {message}"),
                None => message,
            })
        });
        checks.chain(self.errors.iter().cloned()).collect()
    }
}

/// One evaluated assertion.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct CheckResult {
    /// Scenario step the check belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub assertion: String,
    pub outcome: CheckOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", content = "message", rename_all = "lowercase")]
pub enum CheckOutcome {
    Passed,
    Failed(String),
    /// The check could not be evaluated.
    Errored(String),
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// A command line with the assertions applied to its outcome.
#[derive(Debug)]
pub struct Invocation {
    pub name: String,
    /// Command line template.
    pub cmd: String,
    pub stdin: Option<String>,
    pub cwd: Option<String>,
    pub timeout: Option<Duration>,
    pub assertions: Vec<Box<dyn Assertion>>,
    /// Steps run right before the command, after the case setup.
    pub pre_runs: Vec<Arc<dyn ResourceStep>>,
}

impl Invocation {
    pub fn new(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cmd: cmd.into(),
            stdin: None,
            cwd: None,
            timeout: None,
            assertions: Vec::new(),
            pre_runs: Vec::new(),
        }
    }

    pub fn with_assertion(mut self, assertion: Box<dyn Assertion>) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn with_pre_run(mut self, step: Arc<dyn ResourceStep>) -> Self {
        self.pre_runs.push(step);
        self
    }

    /// Render and run the command against the current state.
    pub fn execute(&self, config: &Config, state: &ExecutionState) -> Result<Outcome, Error> {
        let line = config.coverage.wrap(&template::render(&self.cmd, &state.scope)?);
        let options = RunOptions {
            env: state.env.clone(),
            cwd: self
                .cwd
                .as_deref()
                .map(|cwd| template::render(cwd, &state.scope).map(PathBuf::from))
                .transpose()?,
            stdin: self
                .stdin
                .as_deref()
                .map(|stdin| template::render(stdin, &state.scope))
                .transpose()?,
            timeout: self.timeout.or(config.timeout),
        };
        exec::run(&line, &options)
    }

    /// Evaluate every assertion; a failing one never hides the rest.
    pub fn check(
        &self,
        state: &ExecutionState,
        outcome: &Outcome,
        step: Option<&str>,
    ) -> Vec<CheckResult> {
        self.assertions
            .iter()
            .map(|assertion| CheckResult {
                step: step.map(str::to_string),
                assertion: assertion.describe(),
                outcome: match assertion.uphold(&state.scope, outcome) {
                    Ok(Verdict::Pass) => CheckOutcome::Passed,
                    Ok(Verdict::Fail(message)) => CheckOutcome::Failed(message),
                    Err(e) => CheckOutcome::Errored(e.to_string()),
                },
            })
            .collect()
    }
}

/// Setup and teardown shared by the runs of one case.
#[derive(Debug, Clone, Default)]
pub struct Lifecycle {
    pub setup: Vec<Arc<StepSequence>>,
    pub teardown: Vec<Arc<StepSequence>>,
}

/// Collects what happens during one run.
struct Report {
    start: Instant,
    checks: Vec<CheckResult>,
    errors: Vec<String>,
}

impl Report {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            checks: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn finish(self, name: String) -> TestResult {
        let passed = self.errors.is_empty()
            && self
                .checks
                .iter()
                .all(|check| check.outcome == CheckOutcome::Passed);
        TestResult {
            name,
            passed,
            duration: self.start.elapsed(),
            checks: self.checks,
            errors: self.errors,
        }
    }
}

/// Run `body` between the case setup and teardown.
///
/// Setup steps go on the run's stack; teardown steps run only when setup
/// succeeded and are pushed on the same stack, which is unwound last.
fn with_lifecycle(
    lifecycle: &Lifecycle,
    config: &Config,
    report: &mut Report,
    body: impl FnOnce(&mut ResourceStack, &mut ExecutionState, &mut Report),
) {
    let mut state = ExecutionState::new(config);
    let mut stack = ResourceStack::new();

    let setup = lifecycle
        .setup
        .iter()
        .try_for_each(|sequence| stack.acquire(sequence.as_ref(), &mut state));
    match setup {
        Ok(()) => {
            body(&mut stack, &mut state, report);
            for sequence in &lifecycle.teardown {
                if let Err(e) = stack.acquire(sequence.as_ref(), &mut state) {
                    report.errors.push(format!("Teardown failed: {e}"));
                }
            }
        }
        Err(e) => report.errors.push(format!("Setup failed: {e}")),
    }

    if let Err(e) = stack.unwind() {
        report.errors.push(format!("Cleanup failed: {e}"));
    }
}

/// Acquire the invocation's own pre-runs.
fn acquire_pre_runs(
    invocation: &Invocation,
    stack: &mut ResourceStack,
    state: &mut ExecutionState,
) -> Result<(), Error> {
    invocation
        .pre_runs
        .iter()
        .try_for_each(|step| stack.acquire(step.as_ref(), state))
}

/// One command with its own execution state.
#[derive(Debug)]
pub struct Test {
    pub name: String,
    pub invocation: Invocation,
    pub lifecycle: Lifecycle,
    pub config: Arc<Config>,
}

impl Test {
    pub fn run(&self) -> TestResult {
        let mut report = Report::new();
        let invocation = &self.invocation;

        with_lifecycle(&self.lifecycle, &self.config, &mut report, |stack, state, report| {
            if let Err(e) = acquire_pre_runs(invocation, stack, state) {
                report.errors.push(format!("Setup failed: {e}"));
                return;
            }
            debug!("{}: running {:?}", self.name, invocation.cmd);
            match invocation.execute(&self.config, state) {
                Ok(outcome) => report.checks.extend(invocation.check(state, &outcome, None)),
                Err(e) => report.errors.push(format!("Command execution failed: {e}")),
            }
        });

        report.finish(self.name.clone())
    }
}

/// Ordered commands sharing one execution state.
///
/// The case setup runs once before the first step and is cleaned up once
/// after the last. Resources acquired by a step's own pre-runs stay alive
/// until the end of the scenario.
#[derive(Debug)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Invocation>,
    pub lifecycle: Lifecycle,
    pub config: Arc<Config>,
}

impl Scenario {
    pub fn run(&self) -> TestResult {
        let mut report = Report::new();

        with_lifecycle(&self.lifecycle, &self.config, &mut report, |stack, state, report| {
            for step in &self.steps {
                if let Err(e) = acquire_pre_runs(step, stack, state) {
                    report.errors.push(format!("[{}] Setup failed: {e}", step.name));
                    return;
                }
                debug!("{}: step {} running {:?}", self.name, step.name, step.cmd);
                match step.execute(&self.config, state) {
                    Ok(outcome) => {
                        let checks = step.check(state, &outcome, Some(step.name.as_str()));
                        report.checks.extend(checks);
                    }
                    Err(e) => {
                        report
                            .errors
                            .push(format!("[{}] Command execution failed: {e}", step.name));
                        return;
                    }
                }
            }
        });

        report.finish(self.name.clone())
    }
}

/// Something a case runs and reports as one result.
#[derive(Debug)]
pub enum Runnable {
    Test(Test),
    Scenario(Scenario),
}

impl Runnable {
    pub fn name(&self) -> &str {
        match self {
            Runnable::Test(test) => &test.name,
            Runnable::Scenario(scenario) => &scenario.name,
        }
    }

    pub fn run(&self) -> TestResult {
        let result = match self {
            Runnable::Test(test) => test.run(),
            Runnable::Scenario(scenario) => scenario.run(),
        };
        info!(
            "{} {} ({:.2?})",
            if result.passed { "passed" } else { "failed" },
            result.name,
            result.duration
        );
        result
    }
}

/// Named group of runnables.
#[derive(Debug)]
pub struct Case {
    pub name: String,
    pub runnables: Vec<Runnable>,
}

/// Everything generated from one document.
#[derive(Debug)]
pub struct Suite {
    pub config: Arc<Config>,
    pub cases: Vec<Case>,
}

impl Suite {
    /// All runnables in declaration order.
    pub fn runnables(&self) -> impl Iterator<Item = &Runnable> {
        self.cases.iter().flat_map(|case| &case.runnables)
    }

    /// Run every runnable whose name contains `filter`.
    ///
    /// Results keep declaration order even when runs execute concurrently.
    pub fn run(&self, filter: Option<&str>, parallel: bool) -> Vec<TestResult> {
        let selected: Vec<&Runnable> = self
            .runnables()
            .filter(|runnable| filter.is_none_or(|f| runnable.name().contains(f)))
            .collect();

        if !parallel || selected.len() < 2 {
            return selected.into_iter().map(Runnable::run).collect();
        }

        thread::scope(|s| {
            let handles: Vec<_> = selected
                .iter()
                .map(|runnable| (runnable.name(), s.spawn(move || runnable.run())))
                .collect();

            handles
                .into_iter()
                .map(|(name, handle)| {
                    handle.join().unwrap_or_else(|_| TestResult {
                        name: name.to_string(),
                        passed: false,
                        duration: Duration::ZERO,
                        checks: Vec::new(),
                        errors: vec!["test thread panicked".to_string()],
                    })
                })
                .collect()
        })
    }
}
