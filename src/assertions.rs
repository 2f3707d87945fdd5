//! Checks applied to a finished command.
//!
//! Every assertion kind implements [`Assertion::uphold`] and is built from
//! its `{type: <kind>, ...}` mapping through an [`AssertionRegistry`], so an
//! unknown kind is rejected while the document loads.

use crate::error::Error;
use crate::exec::Outcome;
use crate::schema;
use crate::scope::Scope;
use crate::template;
use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Result of upholding one assertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail(String),
}

impl Verdict {
    pub fn passed(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    fn check(ok: bool, message: impl FnOnce() -> String) -> Self {
        if ok { Verdict::Pass } else { Verdict::Fail(message()) }
    }
}

/// A check evaluated against a command's outcome.
///
/// Implementations hold only their configuration, so upholding the same
/// assertion twice against the same outcome gives the same verdict.
pub trait Assertion: fmt::Debug + Send + Sync {
    /// Label used in reports, e.g. `status 0`.
    fn describe(&self) -> String;

    /// Evaluate against `outcome`, rendering templates with `scope`.
    ///
    /// An `Err` means the check could not be evaluated at all (undefined
    /// variable, invalid pattern) and is reported as an error.
    fn uphold(&self, scope: &Scope, outcome: &Outcome) -> Result<Verdict, Error>;
}

/// Settings of the test an assertion belongs to.
#[derive(Debug, Clone, Default)]
pub struct AssertionContext {
    /// Working directory template of the test, base for relative paths.
    pub cwd: Option<String>,
}

/// Builds an assertion from its mapping.
pub type AssertionConstructor =
    fn(&Mapping, &AssertionContext) -> Result<Box<dyn Assertion>, Error>;

/// Assertion kinds keyed by their `type` tag.
#[derive(Clone)]
pub struct AssertionRegistry {
    constructors: HashMap<String, AssertionConstructor>,
}

impl fmt::Debug for AssertionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.constructors.keys().collect();
        kinds.sort();
        f.debug_struct("AssertionRegistry").field("kinds", &kinds).finish()
    }
}

impl Default for AssertionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl AssertionRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in kind.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("status", Status::construct);
        registry.register("output", Output::construct);
        registry.register("startswith", StartsWith::construct);
        registry.register("contains", Contains::construct);
        registry.register("regex", RegexMatch::construct);
        registry.register("file", FileExists::construct);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, constructor: AssertionConstructor) {
        self.constructors.insert(kind.into(), constructor);
    }

    /// Build the assertion described by `map`.
    pub fn construct(
        &self,
        map: &Mapping,
        ctx: &AssertionContext,
    ) -> Result<Box<dyn Assertion>, Error> {
        let kind = match map.get("type") {
            Some(Value::String(kind)) => kind.as_str(),
            Some(other) => {
                return Err(Error::InvalidAssertionClass(format!("{other:?}")));
            }
            None => return Err(Error::InvalidAssertionClass("<missing type>".to_string())),
        };
        let constructor = self
            .constructors
            .get(kind)
            .ok_or_else(|| Error::InvalidAssertionClass(kind.to_string()))?;
        constructor(map, ctx)
    }
}

#[derive(Deserialize)]
struct ExpectedText {
    expected: String,
}

/// Decode `{expected}` and reject malformed templates up front.
fn expected_text(map: &Mapping, what: &str) -> Result<String, Error> {
    let ExpectedText { expected } = schema::decode(map, what)?;
    template::placeholders(&expected)?;
    Ok(expected)
}

/// Exit status equals an expected code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    expected: i32,
}

#[derive(Deserialize)]
struct StatusParams {
    expected: i32,
}

impl Status {
    pub fn new(expected: i32) -> Self {
        Self { expected }
    }

    pub fn construct(map: &Mapping, _: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
        let StatusParams { expected } = schema::decode(map, "status assertion")?;
        Ok(Box::new(Self::new(expected)))
    }
}

impl Assertion for Status {
    fn describe(&self) -> String {
        format!("status {}", self.expected)
    }

    fn uphold(&self, _: &Scope, outcome: &Outcome) -> Result<Verdict, Error> {
        Ok(Verdict::check(outcome.status == self.expected, || {
            format!("Exit code: expected {}, got {}", self.expected, outcome.status)
        }))
    }
}

/// Combined output starts with the rendered text.
///
/// This is what the `output` shorthand of a test expands to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    expected: String,
}

impl Output {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    pub fn construct(map: &Mapping, _: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
        Ok(Box::new(Self::new(expected_text(map, "output assertion")?)))
    }
}

impl Assertion for Output {
    fn describe(&self) -> String {
        format!("output {:?}", self.expected)
    }

    fn uphold(&self, scope: &Scope, outcome: &Outcome) -> Result<Verdict, Error> {
        starts_with("output", &self.expected, scope, outcome)
    }
}

/// Same check as [`Output`], under its explicit name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartsWith {
    expected: String,
}

impl StartsWith {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    pub fn construct(map: &Mapping, _: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
        Ok(Box::new(Self::new(expected_text(
            map,
            "startswith assertion",
        )?)))
    }
}

impl Assertion for StartsWith {
    fn describe(&self) -> String {
        format!("startswith {:?}", self.expected)
    }

    fn uphold(&self, scope: &Scope, outcome: &Outcome) -> Result<Verdict, Error> {
        starts_with("startswith", &self.expected, scope, outcome)
    }
}

fn starts_with(
    label: &str,
    expected: &str,
    scope: &Scope,
    outcome: &Outcome,
) -> Result<Verdict, Error> {
    let expected = template::render(expected, scope)?;
    let actual = outcome.combined();
    Ok(Verdict::check(actual.starts_with(&expected), || {
        format!("{label}: expected to start with {expected:?}\n  got: {actual:?}")
    }))
}

/// Combined output contains the rendered text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contains {
    expected: String,
}

impl Contains {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    pub fn construct(map: &Mapping, _: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
        Ok(Box::new(Self::new(expected_text(map, "contains assertion")?)))
    }
}

impl Assertion for Contains {
    fn describe(&self) -> String {
        format!("contains {:?}", self.expected)
    }

    fn uphold(&self, scope: &Scope, outcome: &Outcome) -> Result<Verdict, Error> {
        let expected = template::render(&self.expected, scope)?;
        let actual = outcome.combined();
        Ok(Verdict::check(actual.contains(&expected), || {
            format!("contains: expected to contain {expected:?}\n  got: {actual:?}")
        }))
    }
}

/// The rendered pattern matches somewhere in the right-trimmed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegexMatch {
    expected: String,
}

impl RegexMatch {
    pub fn new(expected: impl Into<String>) -> Self {
        Self {
            expected: expected.into(),
        }
    }

    pub fn construct(map: &Mapping, _: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
        Ok(Box::new(Self::new(expected_text(map, "regex assertion")?)))
    }
}

impl Assertion for RegexMatch {
    fn describe(&self) -> String {
        format!("regex {:?}", self.expected)
    }

    fn uphold(&self, scope: &Scope, outcome: &Outcome) -> Result<Verdict, Error> {
        let rendered = template::render(&self.expected, scope)?;
        let pattern = rendered.trim_end();
        let re = Regex::new(pattern).map_err(|e| Error::StepFailed {
            step: self.describe(),
            message: format!("invalid regex {pattern:?}: {e}"),
        })?;
        let combined = outcome.combined();
        let actual = combined.trim_end();
        Ok(Verdict::check(re.is_match(actual), || {
            format!("regex: expected to match {pattern:?}\n  got: {actual:?}")
        }))
    }
}

/// A path exists, or does not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileExists {
    path: String,
    exists: bool,
    base: Option<String>,
}

#[derive(Deserialize)]
struct FileParams {
    path: String,
    #[serde(default = "yes")]
    exists: bool,
}

fn yes() -> bool {
    true
}

impl FileExists {
    pub fn new(path: impl Into<String>, exists: bool) -> Self {
        Self {
            path: path.into(),
            exists,
            base: None,
        }
    }

    /// Resolve relative paths against `base` (a template) instead of the
    /// process working directory.
    pub fn relative_to(mut self, base: Option<String>) -> Self {
        self.base = base;
        self
    }

    pub fn construct(map: &Mapping, ctx: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
        let FileParams { path, exists } = schema::decode(map, "file assertion")?;
        template::placeholders(&path)?;
        Ok(Box::new(
            Self::new(path, exists).relative_to(ctx.cwd.clone()),
        ))
    }

    fn resolve(&self, scope: &Scope) -> Result<PathBuf, Error> {
        let path = PathBuf::from(template::render(&self.path, scope)?);
        match &self.base {
            Some(base) if path.is_relative() => {
                Ok(Path::new(&template::render(base, scope)?).join(path))
            }
            _ => Ok(path),
        }
    }
}

impl Assertion for FileExists {
    fn describe(&self) -> String {
        if self.exists {
            format!("file {} exists", self.path)
        } else {
            format!("file {} absent", self.path)
        }
    }

    fn uphold(&self, scope: &Scope, _: &Outcome) -> Result<Verdict, Error> {
        let path = self.resolve(scope)?;
        let exists = path.exists();
        Ok(Verdict::check(exists == self.exists, || {
            if self.exists {
                format!("File should exist: {}", path.display())
            } else {
                format!("File should not exist: {}", path.display())
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TemplateError;

    fn outcome(status: i32, stdout: &str, stderr: &str) -> Outcome {
        Outcome {
            status,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn build(yaml: &str) -> Box<dyn Assertion> {
        AssertionRegistry::builtin()
            .construct(&mapping(yaml), &AssertionContext::default())
            .unwrap()
    }

    fn scope(pairs: &[(&str, &str)]) -> Scope {
        pairs.iter().copied().collect()
    }

    #[test]
    fn status_compares_exactly() {
        let out = outcome(1, "", "");
        assert!(!Status::new(0).uphold(&Scope::new(), &out).unwrap().passed());
        assert!(Status::new(1).uphold(&Scope::new(), &out).unwrap().passed());
        assert!(!Status::new(-9).uphold(&Scope::new(), &out).unwrap().passed());
    }

    #[test]
    fn output_is_a_rendered_prefix_of_combined_output() {
        let out = outcome(0, "hi there", "warn");
        let vars = scope(&[("msg", "hi")]);

        assert!(Output::new("${msg} the").uphold(&vars, &out).unwrap().passed());
        // The combined text crosses into stderr.
        assert!(Output::new("hi there\nwa").uphold(&vars, &out).unwrap().passed());
        assert!(!Output::new("there").uphold(&vars, &out).unwrap().passed());
    }

    #[test]
    fn undefined_variable_is_an_error_not_a_failure() {
        let err = StartsWith::new("${nope}")
            .uphold(&Scope::new(), &outcome(0, "", ""))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Template(TemplateError::Missing { ref name }) if name == "nope"
        ));
    }

    #[test]
    fn contains_checks_substring() {
        let out = outcome(0, "alpha", "beta gamma");
        assert!(Contains::new("gam").uphold(&Scope::new(), &out).unwrap().passed());
        assert!(!Contains::new("delta").uphold(&Scope::new(), &out).unwrap().passed());
    }

    #[test]
    fn regex_searches_trimmed_output() {
        let out = outcome(0, "version 1.2.3\n", "");
        let vars = scope(&[("major", "1")]);

        assert!(RegexMatch::new(r"${major}\.\d+\.\d+$$").uphold(&vars, &out).unwrap().passed());
        assert!(RegexMatch::new(r"\d").uphold(&vars, &out).unwrap().passed());
        assert!(!RegexMatch::new(r"^\d").uphold(&vars, &out).unwrap().passed());
    }

    #[test]
    fn invalid_regex_is_an_error() {
        let result = RegexMatch::new("(unclosed").uphold(&Scope::new(), &outcome(0, "", ""));
        assert!(matches!(result, Err(Error::StepFailed { .. })));
    }

    #[test]
    fn file_existence_and_absence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present"), "").unwrap();
        let vars = scope(&[("dir", dir.path().to_str().unwrap())]);
        let out = outcome(0, "", "");

        assert!(FileExists::new("${dir}/present", true).uphold(&vars, &out).unwrap().passed());
        assert!(!FileExists::new("${dir}/missing", true).uphold(&vars, &out).unwrap().passed());
        assert!(FileExists::new("${dir}/missing", false).uphold(&vars, &out).unwrap().passed());
    }

    #[test]
    fn relative_file_paths_use_the_test_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("made"), "").unwrap();
        let vars = scope(&[("dir", dir.path().to_str().unwrap())]);

        let assertion = FileExists::new("made", true).relative_to(Some("${dir}".to_string()));
        assert!(assertion.uphold(&vars, &outcome(0, "", "")).unwrap().passed());
    }

    #[test]
    fn upholding_twice_gives_the_same_verdict() {
        let out = outcome(2, "abc", "");
        for assertion in [
            build("{type: status, expected: 0}"),
            build("{type: output, expected: ab}"),
            build("{type: regex, expected: 'b.'}"),
            build("{type: file, path: /definitely/not/here, exists: false}"),
        ] {
            let first = assertion.uphold(&Scope::new(), &out).unwrap();
            let second = assertion.uphold(&Scope::new(), &out).unwrap();
            assert_eq!(first, second, "{}", assertion.describe());
        }
    }

    #[test]
    fn registry_rejects_unknown_and_missing_types() {
        let registry = AssertionRegistry::builtin();
        let ctx = AssertionContext::default();

        let err = registry.construct(&mapping("{type: json, expected: x}"), &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidAssertionClass(ref kind) if kind == "json"));

        let err = registry.construct(&mapping("{expected: x}"), &ctx).unwrap_err();
        assert!(matches!(err, Error::InvalidAssertionClass(_)));
    }

    #[test]
    fn registry_rejects_bad_parameters_at_load() {
        let registry = AssertionRegistry::builtin();
        let ctx = AssertionContext::default();

        let err = registry.construct(&mapping("{type: status}"), &ctx).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));

        let err = registry.construct(&mapping("{type: output, expected: '${'}"), &ctx).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn file_defaults_to_expecting_existence() {
        let assertion = build("{type: file, path: /definitely/not/here}");
        let verdict = assertion.uphold(&Scope::new(), &outcome(0, "", "")).unwrap();
        assert!(matches!(verdict, Verdict::Fail(ref m) if m.contains("should exist")));
    }

    #[test]
    fn custom_kinds_can_be_registered() {
        fn always(_: &Mapping, _: &AssertionContext) -> Result<Box<dyn Assertion>, Error> {
            Ok(Box::new(Status::new(0)))
        }
        let mut registry = AssertionRegistry::empty();
        registry.register("ok", always);
        let assertion = registry
            .construct(&mapping("{type: ok}"), &AssertionContext::default())
            .unwrap();
        assert_eq!(assertion.describe(), "status 0");
    }
}
