//! Reusable `clap` front-end for the `build` command described in the
//! engine design: `build [TARGET...] [-j N] [--timeline] [--graph]
//! [--no-cache]`.
//!
//! This is ambient tooling for a blueprint binary to compose, not the
//! blueprint loader itself: [`BuildArgs`] only knows how to parse flags and
//! select roots out of an already-populated [`Context`]; populating that
//! `Context` with tasks remains the blueprint's job.

use std::path::PathBuf;

use clap::Args;
use color_eyre::{Result, eyre::bail};

use crate::{
    context::{CacheConfig, Config},
    path::AbsFilePath,
    task::Task,
};

/// Default cache file, relative to the current directory.
const DEFAULT_CACHE_FILE: &str = ".erect";

/// Environment variable overriding the cache file path, mirroring the
/// reference build tool's `HURRY_CACHE_DIR`.
const CACHE_PATH_ENV: &str = "ERECT_CACHE_DIR";

/// Flags shared by every `build`-shaped subcommand. A blueprint binary
/// embeds this with `#[command(flatten)]` alongside whatever arguments it
/// needs for selecting or describing its own tasks.
#[derive(Clone, Debug, Args)]
pub struct BuildArgs {
    /// Only run tasks whose declared output path falls under one of these
    /// prefixes. With none given, every task runs.
    pub targets: Vec<PathBuf>,

    /// Maximum number of tasks allowed to be `running` concurrently.
    #[arg(short = 'j', long, default_value_t = num_cpus::get())]
    pub jobs: usize,

    /// Emit a timeline of task running/suspended intervals after the
    /// build completes. Diagnostic plotting itself is out of scope here;
    /// this only toggles whether [`Task::events`] gets collected into a
    /// report.
    #[arg(long)]
    pub timeline: bool,

    /// Emit the task dependency graph after the build completes.
    /// Rendering is out of scope here; this only toggles whether the
    /// caller should walk and print it.
    #[arg(long)]
    pub graph: bool,

    /// Use an in-memory cache instead of the persistent cache file.
    #[arg(long)]
    pub no_cache: bool,

    /// Override the persistent cache file path (ignored with
    /// `--no-cache`). Falls back to `ERECT_CACHE_DIR`, then
    /// `./.erect`.
    #[arg(long)]
    pub cache_path: Option<PathBuf>,
}

impl BuildArgs {
    /// Build the engine [`Config`] these flags describe.
    pub fn config(&self) -> Result<Config> {
        let cache = if self.no_cache {
            CacheConfig::InMemory
        } else {
            let path = self
                .cache_path
                .clone()
                .or_else(|| std::env::var_os(CACHE_PATH_ENV).map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_FILE));
            let path = if path.is_absolute() {
                path
            } else {
                std::env::current_dir()?.join(path)
            };
            CacheConfig::Persistent(AbsFilePath::try_from(path)?)
        };

        Ok(Config {
            jobs: self.jobs.max(1),
            cache,
            ..Config::default()
        })
    }

    /// Filter `all_tasks` down to the roots this invocation should drive:
    /// every task with no target given, or every task whose output paths
    /// all fall under at least one given prefix. A target prefix matching
    /// no task's output is an error, per the engine design's CLI
    /// semantics.
    pub fn select_roots(&self, all_tasks: &[std::sync::Arc<Task>]) -> Result<Vec<std::sync::Arc<Task>>> {
        if self.targets.is_empty() {
            return Ok(all_tasks.to_vec());
        }

        let mut matched_any = vec![false; self.targets.len()];
        let mut roots = Vec::new();

        for task in all_tasks {
            let hits = task
                .output_files()
                .iter()
                .any(|file| path_under_any(file.path(), &self.targets, &mut matched_any));
            if hits {
                roots.push(std::sync::Arc::clone(task));
            }
        }

        if let Some((index, _)) = matched_any.iter().enumerate().find(|(_, hit)| !**hit) {
            bail!("target matched no task: {}", self.targets[index].display());
        }

        Ok(roots)
    }
}

fn path_under_any(file: &AbsFilePath, targets: &[PathBuf], matched_any: &mut [bool]) -> bool {
    let mut any = false;
    for (index, target) in targets.iter().enumerate() {
        if file.as_std_path().starts_with(target) {
            matched_any[index] = true;
            any = true;
        }
    }
    any
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn config_defaults_to_persistent_cache_file() {
        let args = BuildArgs {
            targets: vec![],
            jobs: 2,
            timeline: false,
            graph: false,
            no_cache: false,
            cache_path: None,
        };
        let config = args.config().unwrap();
        assert_eq!(config.jobs, 2);
        match config.cache {
            CacheConfig::Persistent(path) => assert!(path.as_str_lossy().ends_with(".erect")),
            CacheConfig::InMemory => panic!("expected persistent cache"),
        }
    }

    #[test]
    fn no_cache_flag_forces_in_memory() {
        let args = BuildArgs {
            targets: vec![],
            jobs: 1,
            timeline: false,
            graph: false,
            no_cache: true,
            cache_path: Some(PathBuf::from("/tmp/ignored")),
        };
        let config = args.config().unwrap();
        assert!(matches!(config.cache, CacheConfig::InMemory));
    }

    #[test]
    fn jobs_floor_is_one() {
        let args = BuildArgs {
            targets: vec![],
            jobs: 0,
            timeline: false,
            graph: false,
            no_cache: true,
            cache_path: None,
        };
        assert_eq!(args.config().unwrap().jobs, 1);
    }
}
