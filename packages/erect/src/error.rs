//! Named error kinds layered over `erect`'s `color_eyre`-based error plumbing.
//!
//! Most fallible operations in this crate return [`color_eyre::Result`] with
//! context attached via [`color_eyre::eyre::Context`]; this is sufficient for
//! diagnostics, but callers (the CLI front-end, tests) sometimes need to
//! distinguish error *kinds* without parsing message strings. [`EngineError`]
//! exists for that purpose and is usually found wrapped inside a
//! [`color_eyre::Report`] via [`color_eyre::eyre::eyre`].
use derive_more::Display;

/// A named, matchable error kind for the failures enumerated in the engine's
/// error-handling design.
///
/// This is intentionally small: most failures (subprocess non-zero, IO
/// errors) are perfectly well served by an ad-hoc [`color_eyre::Report`] with
/// context strings attached at each layer. This enum exists only for the
/// handful of conditions a caller plausibly wants to branch on.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum EngineError {
    /// Two tasks declared the same output file.
    #[display("duplicate output generator")]
    DuplicateOutputGenerator,

    /// A task was constructed with an id that already names another task.
    #[display("duplicate task id")]
    DuplicateTaskId,

    /// A task's declared input file does not exist on disk at drive time.
    #[display("missing declared input")]
    MissingDeclaredInput,

    /// A task was otherwise up-to-date but one of its declared outputs is
    /// missing from disk.
    #[display("stale output missing")]
    StaleOutputMissing,

    /// The scheduler's watchdog detected that every live task is suspended
    /// on a signal that will never arrive.
    #[display("scheduler stalled")]
    Stall,

    /// An attempt was made to open a second [`crate::context::Context`] while
    /// one was already active, or to use the global context outside of one.
    #[display("nested or missing context")]
    NestedContext,
}

impl std::error::Error for EngineError {}
