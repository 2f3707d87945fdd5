//! Variable resolution.
//!
//! Variables are declared as literals or as loader descriptors
//! (`{type: <loader>, ...params}`). Loaders may depend on each other in any
//! order; resolution is a fixed-point iteration over the unresolved loaders
//! rather than a topological sort, since only a loader knows when it is ready.

mod loaders;

pub use loaders::{
    CommandLoader, EnvLoader, ExecutableLoader, FileLoader, Literal, RefLoader, SqliteLoader,
    TemplateLoader,
};

use crate::error::Error;
use crate::scope::Scope;
use log::debug;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

/// Outcome of one load attempt.
#[derive(Debug)]
pub enum Attempt {
    /// The variable now has a value.
    Resolved(String),
    /// A prerequisite is not in scope yet; try again on a later pass.
    Pending,
    /// The variable can never be resolved.
    Failed(Error),
}

/// Where a document being loaded lives and what it declares.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    /// Path of the document; empty for documents built in memory.
    pub filename: PathBuf,
    /// Names declared alongside the variable being loaded. Only these are
    /// worth waiting for.
    pub declared: BTreeSet<String>,
}

impl LoadContext {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            declared: BTreeSet::new(),
        }
    }

    /// The same document with a different set of declared names.
    pub fn declaring<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            filename: self.filename.clone(),
            declared: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains(name)
    }

    /// Resolve `path` against the document's directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.filename.parent() {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }
}

/// A source of one variable value.
pub trait VarLoader: fmt::Debug + Send {
    /// Name of the variable this loader produces.
    fn name(&self) -> &str;

    /// Try to produce the value given the variables resolved so far.
    ///
    /// Must depend only on the loader's own parameters and `scope`. It is
    /// never called again once it has returned [`Attempt::Resolved`].
    /// A template placeholder is only worth [`Attempt::Pending`] when it
    /// names one of [`LoadContext::declared`].
    fn attempt_load(&self, ctx: &LoadContext, scope: &Scope) -> Attempt;
}

/// Builds a loader from a variable name and its descriptor mapping.
pub type LoaderConstructor = fn(&str, &Mapping) -> Result<Box<dyn VarLoader>, Error>;

/// Loader constructors keyed by descriptor `type`.
#[derive(Clone)]
pub struct LoaderRegistry {
    constructors: HashMap<String, LoaderConstructor>,
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("LoaderRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl LoaderRegistry {
    /// Registry with no loader kinds; only literals can be resolved.
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in loader kind.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("command", CommandLoader::construct);
        registry.register("executable", ExecutableLoader::construct);
        registry.register("ref", RefLoader::construct);
        registry.register("template", TemplateLoader::construct);
        registry.register("env", EnvLoader::construct);
        registry.register("file", FileLoader::construct);
        registry.register("sqlite", SqliteLoader::construct);
        registry
    }

    /// Add or replace a loader kind.
    pub fn register(&mut self, kind: impl Into<String>, constructor: LoaderConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    /// Build the loader for one raw declaration.
    pub fn construct(&self, name: &str, raw: &Value) -> Result<Box<dyn VarLoader>, Error> {
        match raw {
            Value::String(s) => Ok(Box::new(Literal::new(name, s.clone()))),
            Value::Mapping(descriptor) => {
                let kind = match descriptor.get("type") {
                    Some(Value::String(kind)) => kind,
                    Some(other) => {
                        return Err(Error::InvalidVariableType {
                            name: name.to_string(),
                            reason: format!("type must be a string, got {other:?}"),
                        });
                    }
                    None => {
                        return Err(Error::InvalidVariableType {
                            name: name.to_string(),
                            reason: "missing type".to_string(),
                        });
                    }
                };
                let constructor =
                    self.constructors
                        .get(kind)
                        .ok_or_else(|| Error::InvalidVariableType {
                            name: name.to_string(),
                            reason: format!("unknown loader '{kind}'"),
                        })?;
                constructor(name, descriptor)
            }
            other => Err(Error::InvalidVariable {
                name: name.to_string(),
                reason: format!("expected a string or a mapping, got {other:?}"),
            }),
        }
    }
}

/// Resolves variable declarations into a [`Scope`].
#[derive(Debug, Clone, Default)]
pub struct VariableLoader {
    registry: LoaderRegistry,
    ctx: LoadContext,
}

impl VariableLoader {
    pub fn new(registry: LoaderRegistry, ctx: LoadContext) -> Self {
        Self { registry, ctx }
    }

    pub fn context(&self) -> &LoadContext {
        &self.ctx
    }

    /// Resolve every declaration of `vars`, in whatever order they become
    /// resolvable.
    ///
    /// All loaders are constructed before any of them runs, so malformed
    /// descriptors fail before any side effect.
    pub fn load_variables(&self, vars: &Mapping) -> Result<Scope, Error> {
        let mut loaders = Vec::with_capacity(vars.len());
        for (name, raw) in vars {
            let name = match name {
                Value::String(name) => name.as_str(),
                other => {
                    return Err(Error::InvalidVariable {
                        name: format!("{other:?}"),
                        reason: "variable names must be strings".to_string(),
                    });
                }
            };
            loaders.push(self.registry.construct(name, raw)?);
        }
        self.resolve(loaders)
    }

    /// Run the fixed-point iteration over already constructed loaders.
    ///
    /// Every pass attempts each pending loader against the scope as it stood
    /// at the start of the pass. A pass that resolves nothing while loaders
    /// remain fails with [`Error::VariableLoop`].
    pub fn resolve(&self, mut pending: Vec<Box<dyn VarLoader>>) -> Result<Scope, Error> {
        let ctx = self.ctx.declaring(pending.iter().map(|l| l.name()));
        let mut scope = Scope::new();
        let mut pass = 0;

        while !pending.is_empty() {
            pass += 1;
            let mut resolved = Vec::new();
            let mut waiting = Vec::with_capacity(pending.len());
            for loader in pending {
                match loader.attempt_load(&ctx, &scope) {
                    Attempt::Resolved(value) => resolved.push((loader.name().to_string(), value)),
                    Attempt::Pending => waiting.push(loader),
                    Attempt::Failed(e) => return Err(e),
                }
            }

            if resolved.is_empty() {
                let mut names: Vec<String> =
                    waiting.iter().map(|l| l.name().to_string()).collect();
                names.sort();
                return Err(Error::VariableLoop(names));
            }

            debug!(
                "variable pass {pass}: resolved {}, {} pending",
                resolved.len(),
                waiting.len()
            );
            for (name, value) in resolved {
                scope.bind(name, value)?;
            }
            pending = waiting;
        }

        Ok(scope)
    }

    /// Resolve a single declaration against an existing scope, without
    /// retrying.
    pub fn load_variable(&self, name: &str, raw: &Value, scope: &Scope) -> Result<String, Error> {
        let loader = self.registry.construct(name, raw)?;
        let ctx = self.ctx.declaring(scope.iter().map(|(name, _)| name));
        match loader.attempt_load(&ctx, scope) {
            Attempt::Resolved(value) => Ok(value),
            Attempt::Pending => Err(Error::InvalidVariable {
                name: name.to_string(),
                reason: "depends on variables that are not defined".to_string(),
            }),
            Attempt::Failed(e) => Err(e),
        }
    }
}

/// Decode a descriptor's parameters, ignoring its `type` tag.
pub(crate) fn params<T: serde::de::DeserializeOwned>(
    name: &str,
    descriptor: &Mapping,
) -> Result<T, Error> {
    let mut descriptor = descriptor.clone();
    descriptor.remove("type");
    serde_yaml::from_value(Value::Mapping(descriptor)).map_err(|e| Error::InvalidVariable {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn vars(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn loader() -> VariableLoader {
        VariableLoader::default()
    }

    #[test]
    fn literals_resolve_in_one_pass() {
        let scope = loader()
            .load_variables(&vars("a: one\nb: two\n"))
            .unwrap();
        assert_eq!(scope.get("a"), Some("one"));
        assert_eq!(scope.get("b"), Some("two"));
    }

    #[test]
    fn forward_references_resolve() {
        let scope = loader()
            .load_variables(&vars(
                r#"
c: {type: template, value: "${b}/c"}
b: {type: template, value: "${a}/b"}
a: root
"#,
            ))
            .unwrap();
        assert_eq!(scope.get("c"), Some("root/b/c"));
    }

    #[test]
    fn cycle_is_a_loop_error() {
        let err = loader()
            .load_variables(&vars(
                "a: {type: ref, of: b}\nb: {type: ref, of: a}\nc: fine\n",
            ))
            .unwrap_err();
        match err {
            Error::VariableLoop(names) => assert_eq!(names, vec!["a", "b"]),
            other => panic!("expected loop error, got {other:?}"),
        }
    }

    #[test]
    fn unsatisfiable_reference_is_a_loop_error() {
        let err = loader()
            .load_variables(&vars("a: {type: ref, of: missing}\n"))
            .unwrap_err();
        assert!(matches!(err, Error::VariableLoop(_)));
    }

    #[test]
    #[cfg(unix)]
    fn shell_variables_in_commands_are_not_dependencies() {
        let err = loader()
            .load_variables(&vars("home: {type: command, command: 'echo $HOME'}\n"))
            .unwrap_err();
        match err {
            Error::InvalidVariable { name, reason } => {
                assert_eq!(name, "home");
                assert!(reason.contains("undefined variable 'HOME'"), "{reason}");
            }
            other => panic!("expected invalid variable, got {other:?}"),
        }

        let scope = loader()
            .load_variables(&vars("greet: {type: command, command: 'x=hi; echo $$x'}\n"))
            .unwrap();
        assert_eq!(scope.get("greet"), Some("hi"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = loader()
            .load_variables(&vars("a: {type: nope}\n"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVariableType { .. }));

        let err = loader()
            .load_variables(&vars("a: {command: ls}\n"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVariableType { .. }));
    }

    #[test]
    fn non_string_non_mapping_is_invalid() {
        let err = loader().load_variables(&vars("a: [1, 2]\n")).unwrap_err();
        assert!(matches!(err, Error::InvalidVariable { .. }));
    }

    #[test]
    fn load_single_variable_against_scope() {
        let scope: Scope = [("a", "x")].into_iter().collect();
        let raw: Value = serde_yaml::from_str("{type: template, value: '${a}y'}").unwrap();
        assert_eq!(loader().load_variable("b", &raw, &scope).unwrap(), "xy");

        let raw: Value = serde_yaml::from_str("{type: ref, of: zz}").unwrap();
        let err = loader().load_variable("b", &raw, &scope).unwrap_err();
        assert!(matches!(err, Error::InvalidVariable { .. }));
    }

    /// Resolves once `after` is in scope and counts its attempts.
    #[derive(Debug)]
    struct Counting {
        name: String,
        after: Option<String>,
        attempts: Arc<AtomicUsize>,
    }

    impl VarLoader for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        fn attempt_load(&self, _ctx: &LoadContext, scope: &Scope) -> Attempt {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match &self.after {
                Some(dep) if !scope.contains(dep) => Attempt::Pending,
                _ => Attempt::Resolved(format!("{}!", self.name)),
            }
        }
    }

    #[test]
    fn resolved_loaders_are_not_attempted_again() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));
        let loaders: Vec<Box<dyn VarLoader>> = vec![
            Box::new(Counting {
                name: "c".into(),
                after: Some("b".into()),
                attempts: third.clone(),
            }),
            Box::new(Counting {
                name: "b".into(),
                after: Some("a".into()),
                attempts: second.clone(),
            }),
            Box::new(Counting {
                name: "a".into(),
                after: None,
                attempts: first.clone(),
            }),
        ];

        let scope = loader().resolve(loaders).unwrap();
        assert_eq!(scope.len(), 3);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(third.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn failed_attempt_aborts_resolution() {
        let err = loader()
            .load_variables(&vars(
                "a: ok\nb: {type: env, name: CMDSPEC_SURELY_UNSET_VARIABLE}\n",
            ))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidVariable { .. }));
    }

    #[test]
    fn custom_loader_kind_can_be_registered() {
        fn constant(name: &str, _: &Mapping) -> Result<Box<dyn VarLoader>, Error> {
            Ok(Box::new(Literal::new(name, "42")))
        }

        let mut registry = LoaderRegistry::builtin();
        registry.register("answer", constant);
        let loader = VariableLoader::new(registry, LoadContext::default());
        let scope = loader.load_variables(&vars("x: {type: answer}\n")).unwrap();
        assert_eq!(scope.get("x"), Some("42"));
    }
}
