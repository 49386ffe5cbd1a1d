//! Result of a cache lookup

/// Cached value, or the knowledge that there is none
///
/// A [`Entry::Nonexistent`] carries no value. [`Entry::Permanent`] marks
/// values that never change once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry<T> {
    Exists { revision: u64, value: T },
    Permanent(T),
    Nonexistent,
}

impl<T> Entry<T> {
    pub fn exists(revision: u64, value: T) -> Self {
        Entry::Exists { revision, value }
    }

    pub fn permanent(value: T) -> Self {
        Entry::Permanent(value)
    }

    pub fn nonexistent() -> Self {
        Entry::Nonexistent
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, Entry::Nonexistent)
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Entry::Permanent(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Entry::Exists { value, .. } | Entry::Permanent(value) => Some(value),
            Entry::Nonexistent => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            Entry::Exists { value, .. } | Entry::Permanent(value) => Some(value),
            Entry::Nonexistent => None,
        }
    }

    /// Revision of an existing entry
    pub fn revision(&self) -> Option<u64> {
        match self {
            Entry::Exists { revision, .. } => Some(*revision),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Entry<U> {
        match self {
            Entry::Exists { revision, value } => Entry::Exists {
                revision,
                value: f(value),
            },
            Entry::Permanent(value) => Entry::Permanent(f(value)),
            Entry::Nonexistent => Entry::Nonexistent,
        }
    }
}
