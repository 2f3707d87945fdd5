//! Built-in `command` steps: `mkdtemp`, `write_file` and `shell`.

use super::{Resource, ResourceStep};
use crate::config::Config;
use crate::error::{Error, TemplateError};
use crate::exec::{self, RunOptions};
use crate::schema::{self, CommandSpec, ShellSpec, WriteFileSpec};
use crate::state::ExecutionState;
use crate::template;
use crate::vars::LoadContext;
use serde::Deserialize;
use serde_yaml::Mapping;
use std::path::{Path, PathBuf};

/// Publishes a produced attribute under a variable name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Registration {
    /// Variable to bind.
    pub name: String,
    /// Attribute of the step's result to read.
    pub attribute: String,
}

/// The action performed by a [`CommandStep`].
#[derive(Debug, Clone)]
pub enum Action {
    /// Create a temporary directory.
    Mkdtemp,
    /// Render a template or inline text into a file.
    WriteFile(WriteFile),
    /// Run a shell command, optionally undone by another.
    Shell { run: String, undo: Option<String> },
}

/// Attributes produced by a built-in command, `None` for unknown commands.
fn attributes_of(command: &str) -> Option<&'static [&'static str]> {
    match command {
        "mkdtemp" | "write_file" => Some(&["path"]),
        "shell" => Some(&["stdout"]),
        _ => None,
    }
}

fn check_registrations(
    allowed: &'static [&'static str],
    registrations: &[Registration],
) -> Result<(), Error> {
    match registrations
        .iter()
        .find(|r| !allowed.contains(&r.attribute.as_str()))
    {
        Some(bad) => Err(Error::InvalidRegistrationVariable {
            attribute: bad.attribute.clone(),
            allowed: allowed.to_vec(),
        }),
        None => Ok(()),
    }
}

impl Action {
    /// Attributes the action's resource exposes for registration.
    pub fn attributes(&self) -> &'static [&'static str] {
        attributes_of(self.label()).unwrap_or(&[])
    }

    fn label(&self) -> &'static str {
        match self {
            Action::Mkdtemp => "mkdtemp",
            Action::WriteFile(_) => "write_file",
            Action::Shell { .. } => "shell",
        }
    }

    fn perform(&self, state: &ExecutionState) -> Result<Box<dyn Resource>, Error> {
        match self {
            Action::Mkdtemp => {
                let dir = tempfile::Builder::new()
                    .prefix("cmdspec-")
                    .tempdir()
                    .map_err(|e| Error::io(std::env::temp_dir(), e))?;
                Ok(Box::new(TempDir { dir }))
            }
            Action::WriteFile(write) => write.perform(state),
            Action::Shell { run, undo } => {
                let line = template::render(run, &state.scope)?;
                let undo = undo
                    .as_deref()
                    .map(|undo| template::render(undo, &state.scope))
                    .transpose()?;
                let options = RunOptions {
                    env: state.env.clone(),
                    ..RunOptions::default()
                };
                let outcome = exec::run(&line, &options)?;
                if outcome.status != 0 {
                    return Err(Error::StepFailed {
                        step: format!("shell {line:?}"),
                        message: format!(
                            "exit status {}: {}",
                            outcome.status,
                            outcome.stderr.trim()
                        ),
                    });
                }
                Ok(Box::new(ShellResult {
                    stdout: outcome.stdout.trim_end().to_string(),
                    undo,
                    options,
                }))
            }
        }
    }
}

/// Where `write_file` takes its contents from.
#[derive(Debug, Clone)]
pub enum Source {
    /// A template file, resolved against the document's directory.
    Template(String),
    /// Contents given in the document.
    Inline(String),
}

/// Parameters of a `write_file` action.
#[derive(Debug, Clone)]
pub struct WriteFile {
    source: Source,
    target: String,
    base: LoadContext,
}

impl WriteFile {
    fn from_spec(spec: WriteFileSpec, config: &Config) -> Result<Self, Error> {
        let source = match spec.source.kind.as_str() {
            "template" => {
                let file = spec.source.file.ok_or_else(|| {
                    Error::Parse("write_file template source needs a 'file'".to_string())
                })?;
                // Check the template exists now when its path is already known.
                match template::render(&file, &config.variables) {
                    Ok(path) => {
                        let path = config.context().resolve(Path::new(&path));
                        if !path.exists() {
                            return Err(Error::MissingTemplate(path));
                        }
                    }
                    Err(TemplateError::Missing { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
                Source::Template(file)
            }
            "inline" => Source::Inline(spec.source.contents.ok_or_else(|| {
                Error::Parse("write_file inline source needs 'contents'".to_string())
            })?),
            other => {
                return Err(Error::InvalidParameterClass(format!(
                    "write_file source type '{other}'"
                )));
            }
        };
        template::placeholders(&spec.target)?;
        Ok(Self {
            source,
            target: spec.target,
            base: config.context().clone(),
        })
    }

    fn perform(&self, state: &ExecutionState) -> Result<Box<dyn Resource>, Error> {
        let target = PathBuf::from(template::render(&self.target, &state.scope)?);
        let text = match &self.source {
            Source::Template(file) => {
                let path = self
                    .base
                    .resolve(Path::new(&template::render(file, &state.scope)?));
                if !path.exists() {
                    return Err(Error::MissingTemplate(path));
                }
                std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?
            }
            Source::Inline(contents) => contents.clone(),
        };
        let contents = template::render(&text, &state.scope)?;

        let previous = if target.exists() {
            Some(std::fs::read(&target).map_err(|e| Error::io(&target, e))?)
        } else {
            None
        };
        std::fs::write(&target, contents).map_err(|e| Error::io(&target, e))?;
        Ok(Box::new(WrittenFile {
            path: target,
            previous,
        }))
    }
}

/// A `type: command` step.
#[derive(Debug, Clone)]
pub struct CommandStep {
    action: Action,
    registrations: Vec<Registration>,
}

impl CommandStep {
    /// Create the step, rejecting registrations of attributes the action does
    /// not produce.
    pub fn new(action: Action, registrations: Vec<Registration>) -> Result<Self, Error> {
        check_registrations(action.attributes(), &registrations)?;
        Ok(Self {
            action,
            registrations,
        })
    }

    /// Check the command name and registrations of a declaration without
    /// building it.
    pub(crate) fn check(map: &Mapping) -> Result<(), Error> {
        let spec: CommandSpec = schema::decode(map, "command step")?;
        let allowed = attributes_of(&spec.command)
            .ok_or_else(|| Error::InvalidParameterClass(format!("command '{}'", spec.command)))?;
        check_registrations(allowed, &spec.register)
    }

    pub(crate) fn from_mapping(map: &Mapping, config: &Config) -> Result<Self, Error> {
        let spec: CommandSpec = schema::decode(map, "command step")?;
        let action = match spec.command.as_str() {
            "mkdtemp" => Action::Mkdtemp,
            "write_file" => {
                let write: WriteFileSpec = schema::decode(map, "write_file step")?;
                Action::WriteFile(WriteFile::from_spec(write, config)?)
            }
            "shell" => {
                let shell: ShellSpec = schema::decode(map, "shell step")?;
                template::placeholders(&shell.run)?;
                Action::Shell {
                    run: shell.run,
                    undo: shell.undo,
                }
            }
            other => return Err(Error::InvalidParameterClass(format!("command '{other}'"))),
        };
        Self::new(action, spec.register)
    }
}

impl ResourceStep for CommandStep {
    fn describe(&self) -> String {
        self.action.label().to_string()
    }

    fn run(&self, state: &mut ExecutionState) -> Result<Box<dyn Resource>, Error> {
        self.action.perform(state)
    }

    fn update(&self, state: &mut ExecutionState, resource: &dyn Resource) -> Result<(), Error> {
        for registration in &self.registrations {
            let value = resource.attribute(&registration.attribute).ok_or_else(|| {
                Error::InvalidRegistrationVariable {
                    attribute: registration.attribute.clone(),
                    allowed: self.action.attributes().to_vec(),
                }
            })?;
            state.scope.bind(&registration.name, value)?;
        }
        Ok(())
    }
}

/// A directory created by `mkdtemp`, removed recursively on cleanup.
#[derive(Debug)]
struct TempDir {
    dir: tempfile::TempDir,
}

impl Resource for TempDir {
    fn attribute(&self, name: &str) -> Option<String> {
        (name == "path").then(|| self.dir.path().display().to_string())
    }

    fn cleanup(self: Box<Self>) -> Result<(), Error> {
        let path = self.dir.path().to_path_buf();
        self.dir.close().map_err(|e| Error::io(path, e))
    }
}

/// A file written by `write_file`; cleanup restores what was there before.
#[derive(Debug)]
struct WrittenFile {
    path: PathBuf,
    previous: Option<Vec<u8>>,
}

impl Resource for WrittenFile {
    fn attribute(&self, name: &str) -> Option<String> {
        (name == "path").then(|| self.path.display().to_string())
    }

    fn cleanup(self: Box<Self>) -> Result<(), Error> {
        let result = match &self.previous {
            Some(contents) => std::fs::write(&self.path, contents),
            None if self.path.exists() => std::fs::remove_file(&self.path),
            None => Ok(()),
        };
        result.map_err(|e| Error::io(&self.path, e))
    }
}

/// Output of a `shell` step and its optional undo command.
#[derive(Debug)]
struct ShellResult {
    stdout: String,
    undo: Option<String>,
    options: RunOptions,
}

impl Resource for ShellResult {
    fn attribute(&self, name: &str) -> Option<String> {
        (name == "stdout").then(|| self.stdout.clone())
    }

    fn cleanup(self: Box<Self>) -> Result<(), Error> {
        let Some(undo) = &self.undo else {
            return Ok(());
        };
        let outcome = exec::run(undo, &self.options)?;
        if outcome.status != 0 {
            return Err(Error::StepFailed {
                step: format!("undo {undo:?}"),
                message: format!(
                    "exit status {}: {}",
                    outcome.status,
                    outcome.stderr.trim()
                ),
            });
        }
        Ok(())
    }
}
