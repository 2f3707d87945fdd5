//! Per-run execution state.

use crate::config::Config;
use crate::scope::Scope;
use std::collections::BTreeMap;

/// Mutable state of one test or scenario run.
///
/// Each run gets its own copy; nothing here is shared between runs.
#[derive(Debug, Clone, Default)]
pub struct ExecutionState {
    /// Variables visible to steps, commands and assertions.
    pub scope: Scope,
    /// Environment overrides applied to every spawned process.
    pub env: BTreeMap<String, String>,
}

impl ExecutionState {
    /// Fresh state seeded from the document's resolved configuration.
    pub fn new(config: &Config) -> Self {
        Self {
            scope: config.variables.clone(),
            env: config.env.clone(),
        }
    }
}
