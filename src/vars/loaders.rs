//! Built-in variable loaders.

use super::{Attempt, LoadContext, VarLoader, params};
use crate::error::{Error, TemplateError};
use crate::exec;
use crate::scope::Scope;
use crate::template;
use serde::Deserialize;
use serde_yaml::Mapping;
use std::path::Path;

/// Render `text`, waiting on missing variables that are declared and failing
/// on those that are not.
fn render_or_wait(
    name: &str,
    text: &str,
    ctx: &LoadContext,
    scope: &Scope,
) -> Result<String, Attempt> {
    template::render(text, scope).map_err(|e| match e {
        TemplateError::Missing { name: ref missing } if ctx.is_declared(missing) => {
            Attempt::Pending
        }
        e => Attempt::Failed(invalid(name, e)),
    })
}

fn invalid(name: &str, reason: impl ToString) -> Error {
    Error::InvalidVariable {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// A plain string declaration.
#[derive(Debug)]
pub struct Literal {
    name: String,
    value: String,
}

impl Literal {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl VarLoader for Literal {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, _ctx: &LoadContext, _scope: &Scope) -> Attempt {
        Attempt::Resolved(self.value.clone())
    }
}

/// `{type: command, command}`: trimmed stdout of a shell command.
#[derive(Debug)]
pub struct CommandLoader {
    name: String,
    command: String,
}

#[derive(Deserialize)]
struct CommandParams {
    command: String,
}

impl CommandLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let CommandParams { command } = params(name, descriptor)?;
        Ok(Box::new(Self {
            name: name.to_string(),
            command,
        }))
    }
}

impl VarLoader for CommandLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, ctx: &LoadContext, scope: &Scope) -> Attempt {
        let line = match render_or_wait(&self.name, &self.command, ctx, scope) {
            Ok(line) => line,
            Err(attempt) => return attempt,
        };
        match exec::run(&line, &exec::RunOptions::default()) {
            Ok(outcome) if outcome.status == 0 => {
                Attempt::Resolved(outcome.stdout.trim_end().to_string())
            }
            Ok(outcome) => Attempt::Failed(invalid(
                &self.name,
                format!(
                    "command {line:?} exited with {}: {}",
                    outcome.status,
                    outcome.stderr.trim()
                ),
            )),
            Err(e) => Attempt::Failed(invalid(&self.name, e)),
        }
    }
}

/// `{type: executable, executable}`: absolute path of a program on `PATH`.
#[derive(Debug)]
pub struct ExecutableLoader {
    name: String,
    executable: String,
}

#[derive(Deserialize)]
struct ExecutableParams {
    executable: String,
}

impl ExecutableLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let ExecutableParams { executable } = params(name, descriptor)?;
        Ok(Box::new(Self {
            name: name.to_string(),
            executable,
        }))
    }
}

impl VarLoader for ExecutableLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, ctx: &LoadContext, scope: &Scope) -> Attempt {
        let program = match render_or_wait(&self.name, &self.executable, ctx, scope) {
            Ok(program) => program,
            Err(attempt) => return attempt,
        };
        match which::which(&program) {
            Ok(path) => Attempt::Resolved(path.display().to_string()),
            Err(e) => Attempt::Failed(invalid(&self.name, format!("{program:?}: {e}"))),
        }
    }
}

/// `{type: ref, of}`: the value of another variable.
#[derive(Debug)]
pub struct RefLoader {
    name: String,
    of: String,
}

#[derive(Deserialize)]
struct RefParams {
    of: String,
}

impl RefLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let RefParams { of } = params(name, descriptor)?;
        Ok(Box::new(Self {
            name: name.to_string(),
            of,
        }))
    }
}

impl VarLoader for RefLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, _ctx: &LoadContext, scope: &Scope) -> Attempt {
        match scope.get(&self.of) {
            Some(value) => Attempt::Resolved(value.to_string()),
            None => Attempt::Pending,
        }
    }
}

/// `{type: template, value}`: a string built from other variables.
#[derive(Debug)]
pub struct TemplateLoader {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct TemplateParams {
    value: String,
}

impl TemplateLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let TemplateParams { value } = params(name, descriptor)?;
        // Malformed placeholders can never resolve.
        template::placeholders(&value).map_err(|e| invalid(name, e))?;
        Ok(Box::new(Self {
            name: name.to_string(),
            value,
        }))
    }
}

impl VarLoader for TemplateLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, ctx: &LoadContext, scope: &Scope) -> Attempt {
        match render_or_wait(&self.name, &self.value, ctx, scope) {
            Ok(value) => Attempt::Resolved(value),
            Err(attempt) => attempt,
        }
    }
}

/// `{type: env, name, default?}`: a host environment variable.
#[derive(Debug)]
pub struct EnvLoader {
    name: String,
    var: String,
    default: Option<String>,
}

#[derive(Deserialize)]
struct EnvParams {
    name: String,
    #[serde(default)]
    default: Option<String>,
}

impl EnvLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let EnvParams { name: var, default } = params(name, descriptor)?;
        Ok(Box::new(Self {
            name: name.to_string(),
            var,
            default,
        }))
    }
}

impl VarLoader for EnvLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, _ctx: &LoadContext, _scope: &Scope) -> Attempt {
        match (std::env::var(&self.var), &self.default) {
            (Ok(value), _) => Attempt::Resolved(value),
            (Err(_), Some(default)) => Attempt::Resolved(default.clone()),
            (Err(e), None) => Attempt::Failed(invalid(&self.name, format!("{}: {e}", self.var))),
        }
    }
}

/// `{type: file, path, trim = true}`: contents of a file next to the document.
#[derive(Debug)]
pub struct FileLoader {
    name: String,
    path: String,
    trim: bool,
}

#[derive(Deserialize)]
struct FileParams {
    path: String,
    #[serde(default = "default_trim")]
    trim: bool,
}

fn default_trim() -> bool {
    true
}

impl FileLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let FileParams { path, trim } = params(name, descriptor)?;
        Ok(Box::new(Self {
            name: name.to_string(),
            path,
            trim,
        }))
    }
}

impl VarLoader for FileLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, ctx: &LoadContext, scope: &Scope) -> Attempt {
        let path = match render_or_wait(&self.name, &self.path, ctx, scope) {
            Ok(path) => ctx.resolve(Path::new(&path)),
            Err(attempt) => return attempt,
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) if self.trim => Attempt::Resolved(contents.trim().to_string()),
            Ok(contents) => Attempt::Resolved(contents),
            Err(e) => Attempt::Failed(invalid(&self.name, Error::io(path, e))),
        }
    }
}

/// `{type: sqlite, database, query}`: first column of the first result row.
#[derive(Debug)]
pub struct SqliteLoader {
    name: String,
    database: String,
    query: String,
}

#[derive(Deserialize)]
struct SqliteParams {
    database: String,
    query: String,
}

impl SqliteLoader {
    pub fn construct(name: &str, descriptor: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
        let SqliteParams { database, query } = params(name, descriptor)?;
        Ok(Box::new(Self {
            name: name.to_string(),
            database,
            query,
        }))
    }

    fn fetch(&self, path: &Path, sql: &str) -> rusqlite::Result<String> {
        use rusqlite::types::ValueRef;

        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        conn.query_row(sql, [], |row| {
            Ok(match row.get_ref(0)? {
                ValueRef::Null => String::new(),
                ValueRef::Integer(i) => i.to_string(),
                ValueRef::Real(f) => f.to_string(),
                ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
            })
        })
    }
}

impl VarLoader for SqliteLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn attempt_load(&self, ctx: &LoadContext, scope: &Scope) -> Attempt {
        let database = match render_or_wait(&self.name, &self.database, ctx, scope) {
            Ok(database) => ctx.resolve(Path::new(&database)),
            Err(attempt) => return attempt,
        };
        let sql = match render_or_wait(&self.name, &self.query, ctx, scope) {
            Ok(sql) => sql,
            Err(attempt) => return attempt,
        };
        match self.fetch(&database, &sql) {
            Ok(value) => Attempt::Resolved(value),
            Err(e) => Attempt::Failed(invalid(
                &self.name,
                format!("query on {}: {e}", database.display()),
            )),
        }
    }
}
