//! File interning.
//!
//! Exactly one [`File`] exists per absolute path within a [`crate::context::Context`]
//! (see [`crate::context::Context::file`]); tasks reference these shared handles
//! rather than bare paths so that "the task which produces this path" is a
//! property of the path itself.

use std::sync::{OnceLock, Weak};

use color_eyre::{Result, eyre::ensure};

use crate::{error::EngineError, path::AbsFilePath, task::Task};

/// An interned filesystem path, optionally owned by the task that produces
/// it.
///
/// `generator_task` is a non-owning ([`Weak`]) reference: the task owns its
/// output files, not the other way around, so a `File` holding a strong
/// reference to its generator would create a reference cycle.
#[derive(Debug)]
pub struct File {
    path: AbsFilePath,
    generator_task: OnceLock<Weak<Task>>,
}

impl File {
    pub(crate) fn new(path: AbsFilePath) -> Self {
        Self {
            path,
            generator_task: OnceLock::new(),
        }
    }

    /// The path this file represents.
    pub fn path(&self) -> &AbsFilePath {
        &self.path
    }

    /// Record `task` as the unique generator of this file.
    ///
    /// This may only be called once per file; a second call is a programmer
    /// error, matching the invariant that each output file has exactly one
    /// generator task.
    pub(crate) fn set_generator(&self, task: &std::sync::Arc<Task>) -> Result<()> {
        let set = self
            .generator_task
            .set(std::sync::Arc::downgrade(task))
            .is_ok();
        ensure!(set, EngineError::DuplicateOutputGenerator);
        Ok(())
    }

    /// The task that produces this file, if any.
    pub fn generator_task(&self) -> Option<std::sync::Arc<Task>> {
        self.generator_task.get().and_then(Weak::upgrade)
    }

    /// If this file has a generator task, drive it to completion, then
    /// assert that the file exists on disk.
    ///
    /// Files with no generator are assumed to be pre-existing inputs
    /// (source files the blueprint author wrote by hand); their existence
    /// is the caller's responsibility.
    pub async fn run(&self) -> Result<()> {
        if let Some(task) = self.generator_task() {
            task.drive().await?;
        }
        Ok(())
    }
}
