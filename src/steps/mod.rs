//! Setup and teardown steps.
//!
//! A [`ResourceStep`] performs one side effect and hands back a [`Resource`]
//! owning the matching cleanup. Whoever runs a step pushes its resource onto
//! a [`ResourceStack`], which releases everything in reverse order on every
//! exit path.

mod command;
mod env;

pub use command::{Action, CommandStep, Registration};
pub use env::EnvStep;

use crate::config::Config;
use crate::error::Error;
use crate::schema;
use crate::state::ExecutionState;
use log::{debug, warn};
use serde_yaml::{Mapping, Value};
use std::fmt;
use std::sync::Arc;

/// One reversible setup action.
pub trait ResourceStep: fmt::Debug + Send + Sync {
    /// Short human-readable label used in logs and errors.
    fn describe(&self) -> String;

    /// Perform the action.
    ///
    /// On error nothing is left acquired: a step either returns a resource
    /// that owns everything it created, or releases it before failing.
    fn run(&self, state: &mut ExecutionState) -> Result<Box<dyn Resource>, Error>;

    /// Publish what `run` produced into the state, so later steps and the
    /// command can refer to it.
    fn update(&self, state: &mut ExecutionState, resource: &dyn Resource) -> Result<(), Error>;
}

/// Something acquired by a step, released by [`Resource::cleanup`].
pub trait Resource: fmt::Debug + Send {
    /// Value of a produced attribute, if the resource has one by that name.
    fn attribute(&self, _name: &str) -> Option<String> {
        None
    }

    /// Release the resource. Consuming `self` makes a second call impossible.
    fn cleanup(self: Box<Self>) -> Result<(), Error>;
}

/// Resources acquired by one run, released last-in first-out.
#[derive(Debug, Default)]
pub struct ResourceStack {
    resources: Vec<Box<dyn Resource>>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: Box<dyn Resource>) {
        self.resources.push(resource);
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Run `step`, keep its resource and publish its values.
    ///
    /// The resource is pushed before `update` runs, so it is released even
    /// when publishing fails.
    pub fn acquire(
        &mut self,
        step: &dyn ResourceStep,
        state: &mut ExecutionState,
    ) -> Result<(), Error> {
        debug!("running step {}", step.describe());
        let resource = step.run(state)?;
        self.push(resource);
        match self.resources.last() {
            Some(resource) => step.update(state, resource.as_ref()),
            None => Ok(()),
        }
    }

    /// Release every resource in reverse order.
    ///
    /// A failing cleanup does not stop the remaining ones; all failures are
    /// returned together.
    pub fn unwind(&mut self) -> Result<(), Error> {
        let mut errors = Vec::new();
        while let Some(resource) = self.resources.pop() {
            debug!("cleaning up {resource:?}");
            if let Err(e) = resource.cleanup() {
                errors.push(e);
            }
        }
        match Error::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if !self.resources.is_empty()
            && let Err(e) = self.unwind()
        {
            warn!("cleanup failed while dropping resources: {e}");
        }
    }
}

/// An ordered, named list of steps, usable as a single step.
#[derive(Debug, Clone)]
pub struct StepSequence {
    name: String,
    steps: Vec<Arc<dyn ResourceStep>>,
}

impl StepSequence {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn ResourceStep>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    /// Build a sequence from raw step declarations.
    pub fn from_values(name: &str, raw: &[Value], config: &Config) -> Result<Self, Error> {
        let steps = raw
            .iter()
            .map(|step| build_step(step, config))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(name, steps))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl ResourceStep for StepSequence {
    fn describe(&self) -> String {
        format!("sequence '{}'", self.name)
    }

    fn run(&self, state: &mut ExecutionState) -> Result<Box<dyn Resource>, Error> {
        let mut started = ResourceStack::new();
        for step in &self.steps {
            if let Err(e) = started.acquire(step.as_ref(), state) {
                return Err(match started.unwind() {
                    Ok(()) => e,
                    Err(cleanup) => Error::Multiple(vec![e, cleanup]),
                });
            }
        }
        Ok(Box::new(SequenceResource { started }))
    }

    fn update(&self, _state: &mut ExecutionState, _resource: &dyn Resource) -> Result<(), Error> {
        // Children were published one by one during `run`.
        Ok(())
    }
}

#[derive(Debug)]
struct SequenceResource {
    started: ResourceStack,
}

impl Resource for SequenceResource {
    fn cleanup(mut self: Box<Self>) -> Result<(), Error> {
        self.started.unwind()
    }
}

fn declaration(raw: &Value) -> Result<(&Mapping, &str), Error> {
    let map = raw
        .as_mapping()
        .ok_or_else(|| Error::Parse(format!("pre-run step must be a mapping, got {raw:?}")))?;
    match map.get("type") {
        Some(Value::String(kind)) => Ok((map, kind.as_str())),
        _ => Err(Error::InvalidParameterClass(format!(
            "missing type in {raw:?}"
        ))),
    }
}

/// Check the kinds and registrations of a step declaration, nested ones
/// included, without resolving anything it refers to.
pub fn check_step(raw: &Value) -> Result<(), Error> {
    let (map, kind) = declaration(raw)?;
    match kind {
        "command" => CommandStep::check(map),
        "env" => EnvStep::from_mapping(map).map(drop),
        "sequence" => {
            let spec: schema::SequenceSpec = schema::decode(map, "sequence step")?;
            spec.steps.iter().try_for_each(check_step)
        }
        other => Err(Error::InvalidParameterClass(format!("type '{other}'"))),
    }
}

/// Build one step from its declaration.
pub fn build_step(raw: &Value, config: &Config) -> Result<Arc<dyn ResourceStep>, Error> {
    let (map, kind) = declaration(raw)?;
    Ok(match kind {
        "command" => Arc::new(CommandStep::from_mapping(map, config)?),
        "env" => Arc::new(EnvStep::from_mapping(map)?),
        "sequence" => {
            let spec: schema::SequenceSpec = schema::decode(map, "sequence step")?;
            let name = spec.name.as_deref().unwrap_or("inline");
            Arc::new(StepSequence::from_values(name, &spec.steps, config)?)
        }
        other => return Err(Error::InvalidParameterClass(format!("type '{other}'"))),
    })
}
