//! Variable scopes.

use crate::error::Error;
use std::collections::BTreeMap;

/// Mapping from variable name to resolved value.
///
/// A name is bound at most once: re-binding it to the same value is a no-op,
/// re-binding it to a different value is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scope {
    values: BTreeMap<String, String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Bind `name` to `value`.
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        let name = name.into();
        let value = value.into();
        match self.values.get(&name) {
            Some(existing) if *existing == value => Ok(()),
            Some(existing) => Err(Error::VariableRedefined {
                existing: existing.clone(),
                name,
                value,
            }),
            None => {
                self.values.insert(name, value);
                Ok(())
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Scope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_is_write_once() {
        let mut scope = Scope::new();
        scope.bind("dir", "/tmp/a").unwrap();
        scope.bind("dir", "/tmp/a").unwrap();

        let err = scope.bind("dir", "/tmp/b").unwrap_err();
        assert!(matches!(err, Error::VariableRedefined { .. }));
        assert_eq!(scope.get("dir"), Some("/tmp/a"));
        assert_eq!(scope.len(), 1);
    }

    #[test]
    fn collect_from_pairs() {
        let scope: Scope = [("a", "1"), ("b", "2")].into_iter().collect();
        assert_eq!(scope.get("b"), Some("2"));
        assert!(!scope.contains("c"));
    }
}
