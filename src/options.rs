//! Solver Option Store
//!
//! A typed key/value table mutated between solves and marshaled into the
//! vendor API at solve time. A key's kind is fixed the first time it is set;
//! later sets with a different kind fail instead of coercing. Keys are not
//! validated against the vendor's accepted-option list here — an unknown or
//! misspelled name is only detected by the vendor library itself during the
//! next solve.

use std::fmt;

use thiserror::Error;

/// The kind of an option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    /// Integer-valued option.
    Integer,
    /// Floating-point option.
    Real,
    /// Boolean option (WORHP-style solvers only).
    Bool,
    /// String option.
    Str,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::Integer => write!(f, "integer"),
            OptionKind::Real => write!(f, "real"),
            OptionKind::Bool => write!(f, "bool"),
            OptionKind::Str => write!(f, "string"),
        }
    }
}

/// One option value.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    /// Integer-valued option.
    Integer(i32),
    /// Floating-point option.
    Real(f64),
    /// Boolean option.
    Bool(bool),
    /// String option.
    Str(String),
}

impl OptionValue {
    /// The kind of this value.
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Integer(_) => OptionKind::Integer,
            OptionValue::Real(_) => OptionKind::Real,
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Str(_) => OptionKind::Str,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Integer(v) => write!(f, "{}", v),
            OptionValue::Real(v) => write!(f, "{}", v),
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Str(v) => write!(f, "{}", v),
        }
    }
}

/// A key was re-set with an incompatible kind.
#[derive(Debug, Clone, Error)]
#[error("option '{key}' was set as {first} and cannot be re-set as {requested}")]
pub struct OptionTypeError {
    /// The offending key.
    pub key: String,
    /// The kind fixed by the first set.
    pub first: OptionKind,
    /// The kind of the rejected set.
    pub requested: OptionKind,
}

/// Ordered option table with last-write-wins per key.
#[derive(Debug, Clone, Default)]
pub struct OptionStore {
    // Insertion-ordered; a re-set overwrites the value in place so the
    // original position is kept.
    entries: Vec<(String, OptionValue)>,
}

impl OptionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&mut self, key: &str, value: OptionValue) -> Result<(), OptionTypeError> {
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| k == key) {
            if existing.kind() != value.kind() {
                return Err(OptionTypeError {
                    key: key.to_string(),
                    first: existing.kind(),
                    requested: value.kind(),
                });
            }
            *existing = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
        Ok(())
    }

    /// Set an integer option.
    pub fn set_integer(&mut self, key: &str, value: i32) -> Result<(), OptionTypeError> {
        self.set(key, OptionValue::Integer(value))
    }

    /// Set a floating-point option.
    pub fn set_numeric(&mut self, key: &str, value: f64) -> Result<(), OptionTypeError> {
        self.set(key, OptionValue::Real(value))
    }

    /// Set a boolean option.
    pub fn set_bool(&mut self, key: &str, value: bool) -> Result<(), OptionTypeError> {
        self.set(key, OptionValue::Bool(value))
    }

    /// Set a string option.
    pub fn set_string(&mut self, key: &str, value: &str) -> Result<(), OptionTypeError> {
        self.set(key, OptionValue::Str(value.to_string()))
    }

    /// Current value of a key, if set.
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Whether a key is set.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Snapshot of all entries, in insertion order, one entry per key.
    pub fn entries(&self) -> Vec<(String, OptionValue)> {
        self.entries.clone()
    }

    /// Iterate over integer options.
    pub fn integers(&self) -> impl Iterator<Item = (&str, i32)> {
        self.entries.iter().filter_map(|(k, v)| match v {
            OptionValue::Integer(value) => Some((k.as_str(), *value)),
            _ => None,
        })
    }

    /// Iterate over floating-point options.
    pub fn numerics(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().filter_map(|(k, v)| match v {
            OptionValue::Real(value) => Some((k.as_str(), *value)),
            _ => None,
        })
    }

    /// Iterate over boolean options.
    pub fn bools(&self) -> impl Iterator<Item = (&str, bool)> {
        self.entries.iter().filter_map(|(k, v)| match v {
            OptionValue::Bool(value) => Some((k.as_str(), *value)),
            _ => None,
        })
    }

    /// Iterate over string options.
    pub fn strings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(k, v)| match v {
            OptionValue::Str(value) => Some((k.as_str(), value.as_str())),
            _ => None,
        })
    }

    /// Remove all entries of the given kind.
    pub fn reset(&mut self, kind: OptionKind) {
        self.entries.retain(|(_, v)| v.kind() != kind);
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of set keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no keys are set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_per_key() {
        let mut store = OptionStore::new();
        store.set_integer("Major Iteration Limit", 100).unwrap();
        store.set_integer("Major Iteration Limit", 1000).unwrap();
        assert_eq!(
            store.get("Major Iteration Limit"),
            Some(&OptionValue::Integer(1000))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn kind_is_fixed_at_first_set() {
        let mut store = OptionStore::new();
        store.set_integer("limit", 10).unwrap();

        let err = store.set_string("limit", "ten").unwrap_err();
        assert_eq!(err.key, "limit");
        assert_eq!(err.first, OptionKind::Integer);
        assert_eq!(err.requested, OptionKind::Str);

        // The failed set did not disturb the stored value, and the key can
        // still be overwritten with the right kind.
        assert_eq!(store.get("limit"), Some(&OptionValue::Integer(10)));
        store.set_integer("limit", 20).unwrap();
        assert_eq!(store.get("limit"), Some(&OptionValue::Integer(20)));
    }

    #[test]
    fn entries_snapshot_preserves_insertion_order() {
        let mut store = OptionStore::new();
        store.set_integer("a", 1).unwrap();
        store.set_numeric("b", 2.5).unwrap();
        store.set_bool("c", true).unwrap();
        store.set_integer("a", 7).unwrap(); // overwrite keeps position

        let keys: Vec<String> = store.entries().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(store.get("a"), Some(&OptionValue::Integer(7)));
    }

    #[test]
    fn typed_iterators_split_by_kind() {
        let mut store = OptionStore::new();
        store.set_integer("i1", 1).unwrap();
        store.set_numeric("n1", 1.5).unwrap();
        store.set_numeric("n2", 2.5).unwrap();
        store.set_bool("b1", false).unwrap();

        assert_eq!(store.integers().collect::<Vec<_>>(), vec![("i1", 1)]);
        assert_eq!(
            store.numerics().collect::<Vec<_>>(),
            vec![("n1", 1.5), ("n2", 2.5)]
        );
        assert_eq!(store.bools().collect::<Vec<_>>(), vec![("b1", false)]);
    }

    #[test]
    fn reset_removes_one_kind_only() {
        let mut store = OptionStore::new();
        store.set_integer("i", 1).unwrap();
        store.set_numeric("n", 1.5).unwrap();
        store.reset(OptionKind::Integer);
        assert!(!store.contains("i"));
        assert!(store.contains("n"));
    }
}
