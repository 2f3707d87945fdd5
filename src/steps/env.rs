//! `type: env` steps.

use super::{Resource, ResourceStep};
use crate::error::Error;
use crate::schema::{self, EnvSpec};
use crate::state::ExecutionState;
use crate::template;
use serde_yaml::Mapping;

/// Sets one variable in the environment overlay of the run.
#[derive(Debug, Clone)]
pub struct EnvStep {
    name: String,
    value: String,
}

impl EnvStep {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub(crate) fn from_mapping(map: &Mapping) -> Result<Self, Error> {
        let EnvSpec { name, value } = schema::decode(map, "env step")?;
        template::placeholders(&value)?;
        Ok(Self::new(name, value))
    }
}

impl ResourceStep for EnvStep {
    fn describe(&self) -> String {
        format!("env {}", self.name)
    }

    fn run(&self, state: &mut ExecutionState) -> Result<Box<dyn Resource>, Error> {
        let value = template::render(&self.value, &state.scope)?;
        Ok(Box::new(EnvOverride {
            name: self.name.clone(),
            value,
        }))
    }

    fn update(&self, state: &mut ExecutionState, resource: &dyn Resource) -> Result<(), Error> {
        if let Some(value) = resource.attribute("value") {
            state.env.insert(self.name.clone(), value);
        }
        Ok(())
    }
}

/// The overlay dies with the run's state, so there is nothing to release.
#[derive(Debug)]
struct EnvOverride {
    name: String,
    value: String,
}

impl Resource for EnvOverride {
    fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "name" => Some(self.name.clone()),
            "value" => Some(self.value.clone()),
            _ => None,
        }
    }

    fn cleanup(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}
