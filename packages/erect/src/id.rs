//! Task identity.
//!
//! A [`TaskId`] is an ordered tuple of atoms (strings, paths, or integers)
//! that uniquely names a task within a [`crate::context::Context`]. It has
//! two renderings: a [`TaskId::mangled`] form used as the cache key, and a
//! [`TaskId::display`] form used in diagnostics.

use std::fmt;

use derive_more::Display;

/// A single component of a [`TaskId`].
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
pub enum Atom {
    #[display("{_0}")]
    Str(String),
    #[display("{}", _0.display())]
    Path(std::path::PathBuf),
    #[display("{_0}")]
    Int(i64),
}

impl From<&str> for Atom {
    fn from(value: &str) -> Self {
        Atom::Str(value.to_owned())
    }
}

impl From<String> for Atom {
    fn from(value: String) -> Self {
        Atom::Str(value)
    }
}

impl From<&std::path::Path> for Atom {
    fn from(value: &std::path::Path) -> Self {
        Atom::Path(value.to_owned())
    }
}

impl From<std::path::PathBuf> for Atom {
    fn from(value: std::path::PathBuf) -> Self {
        Atom::Path(value)
    }
}

impl From<i64> for Atom {
    fn from(value: i64) -> Self {
        Atom::Int(value)
    }
}

/// An ordered, non-empty tuple of atoms identifying a task within a
/// [`crate::context::Context`].
///
/// IDs are unique within a context: constructing a task with an id that
/// already exists does not create a second task (see
/// [`crate::context::Context::task`]).
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TaskId(Vec<Atom>);

impl TaskId {
    /// Build a task id from its ordered atoms.
    ///
    /// Panics if `atoms` is empty: a zero-length id cannot be a useful cache
    /// key or diagnostic label, and no caller should ever construct one.
    pub fn new(atoms: impl IntoIterator<Item = impl Into<Atom>>) -> Self {
        let atoms = atoms.into_iter().map(Into::into).collect::<Vec<_>>();
        assert!(!atoms.is_empty(), "TaskId must have at least one atom");
        Self(atoms)
    }

    /// The cache-key rendering: components joined by `;`.
    ///
    /// This must be safe enough to use as a key in a string-keyed store; in
    /// particular it must not contain characters that the persistent cache
    /// backend treats specially.
    pub fn mangled(&self) -> String {
        self.0
            .iter()
            .map(|atom| atom.to_string())
            .collect::<Vec<_>>()
            .join(";")
    }

    /// The human-readable rendering: components joined by a space.
    pub fn display(&self) -> String {
        self.0
            .iter()
            .map(|atom| atom.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn mangled_and_display_join_differently() {
        let id = TaskId::new(["compile", "build/", "a.c"]);
        assert_eq!(id.mangled(), "compile;build/;a.c");
        assert_eq!(id.display(), "compile build/ a.c");
    }

    #[test]
    #[should_panic(expected = "at least one atom")]
    fn empty_id_panics() {
        let _ = TaskId::new(Vec::<&str>::new());
    }
}
