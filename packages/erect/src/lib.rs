//! `erect`: an incremental task-execution engine with first-class support
//! for GCC's C++20 module-mapper protocol.
//!
//! This library is not a build tool on its own. A blueprint binary
//! populates a [`context::Context`] with [`task::Task`]s naming
//! [`file::File`] inputs and outputs, then hands a set of roots to
//! [`context::Context::run`]. See `packages/demo` for a worked example.

pub mod cache;
pub mod cli;
pub mod context;
pub mod depfile;
pub mod error;
pub mod file;
pub mod fingerprint;
pub mod fs;
pub mod gcc;
pub mod id;
pub mod mapper;
pub mod path;
pub mod registry;
pub mod subprocess;
pub mod suspend;
pub mod task;
