//! The GCC C++20 module-aware compile task: the reference collaborator
//! that exercises suspension, the scheduler, the module registry, and the
//! mapper end to end (§4.8 of the engine design).
//!
//! This is intentionally a thin, demonstrative [`crate::task::TaskBody`]
//! impl, not a general-purpose compiler driver; a real blueprint is free
//! to implement its own instead.

use std::sync::{Arc, Mutex};

use color_eyre::{Result, eyre::Context as _};
use tracing::instrument;

use crate::{
    cache::CacheBackend,
    context::Context,
    depfile,
    id::TaskId,
    mapper::Mapper,
    path::{AbsDirPath, AbsFilePath},
    registry::ModuleRegistry,
    subprocess,
    task::{BodyFuture, Task, TaskBody, TaskHandle},
};

/// A single `gcc -std=c++20 -fmodules-ts` translation unit, wired up to
/// the module mapper so the compiler can request and provide modules
/// during the run.
#[derive(Debug)]
pub struct Compile {
    id: TaskId,
    compiler: String,
    source: AbsFilePath,
    output: AbsFilePath,
    build_dir: AbsDirPath,
    extra_flags: Vec<String>,
    ctx: Context,
    mapper: Arc<Mapper>,
    registry: Arc<ModuleRegistry>,
    cache: Arc<dyn CacheBackend>,
    modules_required: Mutex<Vec<String>>,
    modules_generated: Mutex<Vec<String>>,
}

impl Compile {
    /// `compiler` names the executable to invoke (`"gcc"`, `"g++"`, or a
    /// test double that speaks the mapper protocol directly without
    /// understanding C++20 modules itself).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        compiler: impl Into<String>,
        source: AbsFilePath,
        output: AbsFilePath,
        build_dir: AbsDirPath,
        extra_flags: Vec<String>,
        ctx: Context,
        mapper: Arc<Mapper>,
        registry: Arc<ModuleRegistry>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            id,
            compiler: compiler.into(),
            source,
            output,
            build_dir,
            extra_flags,
            ctx,
            mapper,
            registry,
            cache,
            modules_required: Mutex::new(Vec::new()),
            modules_generated: Mutex::new(Vec::new()),
        }
    }

    fn ident(&self) -> String {
        self.source.as_str_lossy().into_owned()
    }

    /// Where `-MF` writes this translation unit's dependency file:
    /// the object path with its extension replaced by `.d`.
    fn depfile_path(&self) -> AbsFilePath {
        AbsFilePath::try_from(self.output.as_std_path().with_extension("d")).expect("replacing an extension keeps the path absolute")
    }

    fn argv(&self) -> Vec<String> {
        let mapper_spec = format!("-fmodule-mapper=localhost:{}?{}", self.mapper.port(), self.ident());
        vec![
            self.compiler.clone(),
            "-std=c++20".to_owned(),
            "-fmodules-ts".to_owned(),
            mapper_spec,
            "-MMD".to_owned(),
            "-MF".to_owned(),
            self.depfile_path().as_str_lossy().into_owned(),
            "-c".to_owned(),
            self.source.as_str_lossy().into_owned(),
            "-o".to_owned(),
            self.output.as_str_lossy().into_owned(),
        ]
        .into_iter()
        .chain(self.extra_flags.clone())
        .collect()
    }

    fn previous_modules_required(&self) -> Vec<String> {
        self.cache
            .get(&self.id.mangled())
            .ok()
            .flatten()
            .and_then(|record| record.result.get("modules_required").cloned())
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default()
    }

    /// Read the dependency file from the previous run (if any) and intern
    /// every header it names as a `File`, resolving paths relative to the
    /// build directory.
    async fn previous_header_deps(&self) -> Vec<Arc<crate::file::File>> {
        let Ok(Some(bytes)) = crate::fs::read_buffered(&self.depfile_path()).await else {
            return Vec::new();
        };
        let content = String::from_utf8_lossy(&bytes);

        depfile::parse_all_deps(&content)
            .into_iter()
            .map(|dep| if dep.is_absolute() { dep } else { self.build_dir.as_std_path().join(dep) })
            .filter_map(|dep| AbsFilePath::try_from(dep).ok())
            .map(|path| self.ctx.file(path))
            .collect()
    }
}

impl TaskBody for Compile {
    fn input_metadata(&self) -> serde_json::Value {
        serde_json::json!({ "extra_flags": self.extra_flags })
    }

    /// Discover transitive header inputs recorded in the previous run's
    /// `.d` file, so the up-to-date check sees them without the blueprint
    /// having declared them by hand.
    fn dynamic_deps<'a>(&'a self, handle: &'a TaskHandle) -> BodyFuture<'a, Vec<Arc<Task>>> {
        Box::pin(async move {
            let headers = self.previous_header_deps().await;
            handle.add_input_files(headers).await;
            Ok(Vec::new())
        })
    }

    /// Await every module this translation unit required last time,
    /// before even consulting the cache. Module producers must run first
    /// even on a build that will turn out to be a pure cache hit; see the
    /// open question this preserves.
    fn pre_run<'a>(&'a self, _handle: &'a TaskHandle) -> BodyFuture<'a, ()> {
        Box::pin(async move {
            for module in self.previous_modules_required() {
                self.registry.module_required(&module).await;
            }
            Ok(())
        })
    }

    #[instrument(name = "Compile::run", skip(self, _handle), fields(source = %self.source))]
    fn run<'a>(&'a self, _handle: &'a TaskHandle) -> BodyFuture<'a, serde_json::Value> {
        Box::pin(async move {
            crate::fs::create_dir_all(self.build_dir.as_std_path())
                .await
                .context("create build dir")?;
            subprocess::run(&self.argv()).await.context("run gcc")?;

            Ok(serde_json::json!({
                "modules_required": self.modules_required.lock().expect("poisoned").clone(),
                "modules_generated": self.modules_generated.lock().expect("poisoned").clone(),
            }))
        })
    }

    /// Republish everything this compile generated, in case the mapper
    /// connection closed before `MODULE-COMPILED` was answered.
    /// `module_provided` is idempotent, so this is safe even when the
    /// mapper already did it.
    fn post_run<'a>(&'a self, _handle: &'a TaskHandle, result: &'a serde_json::Value) -> BodyFuture<'a, ()> {
        Box::pin(async move {
            let generated: Vec<String> = result
                .get("modules_generated")
                .cloned()
                .and_then(|value| serde_json::from_value(value).ok())
                .unwrap_or_default();
            for module in generated {
                self.registry.module_provided(&module);
            }
            Ok(())
        })
    }

    fn record_module_required(&self, module: &str) {
        self.modules_required.lock().expect("poisoned").push(module.to_owned());
    }

    fn record_module_generated(&self, module: &str) {
        self.modules_generated.lock().expect("poisoned").push(module.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::{cache::memory::MemoryCache, context::Context, registry::ModuleRegistry};

    fn test_compile(dir: &TempDir) -> Compile {
        let build_dir = AbsDirPath::try_from(dir.path()).unwrap();
        let ctx = Context::new(crate::context::Config::default()).unwrap();
        let mapper = Mapper::new(
            ctx.clone(),
            Arc::new(ModuleRegistry::new()),
            build_dir.clone(),
            build_dir.clone(),
        );
        Compile::new(
            TaskId::new(["compile", "build", "a.cpp"]),
            "gcc",
            AbsFilePath::try_from(dir.path().join("a.cpp")).unwrap(),
            AbsFilePath::try_from(dir.path().join("a.o")).unwrap(),
            build_dir,
            vec![],
            ctx,
            mapper,
            Arc::new(ModuleRegistry::new()),
            Arc::new(MemoryCache::new()),
        )
    }

    #[tokio::test]
    async fn argv_embeds_ident_and_port_spec_shape() {
        let dir = TempDir::new().unwrap();
        let compile = test_compile(&dir);
        compile.mapper.bind().await.unwrap();

        assert!(compile.ident().ends_with("a.cpp"));
        assert_eq!(compile.argv()[0], "gcc");
        assert!(compile.argv().contains(&"-fmodules-ts".to_owned()));
        assert!(compile.argv().iter().any(|arg| arg.starts_with("-fmodule-mapper=localhost:")));
        assert!(compile.argv().contains(&"-MMD".to_owned()));
        assert!(compile.argv().iter().any(|arg| arg.ends_with("a.d")));
    }

    #[test]
    fn records_modules_via_body_hooks() {
        let dir = TempDir::new().unwrap();
        let compile = test_compile(&dir);
        compile.record_module_required("std.io");
        compile.record_module_generated("app");
        assert_eq!(compile.modules_required.lock().unwrap().as_slice(), ["std.io"]);
        assert_eq!(compile.modules_generated.lock().unwrap().as_slice(), ["app"]);
    }

    #[tokio::test]
    async fn previous_header_deps_reads_prior_depfile() {
        let dir = TempDir::new().unwrap();
        let compile = test_compile(&dir);
        std::fs::write(dir.path().join("a.h"), "").unwrap();
        std::fs::write(compile.depfile_path().as_std_path(), "a.o: a.cpp a.h\n").unwrap();

        let headers = compile.previous_header_deps().await;
        let paths: Vec<_> = headers.iter().map(|f| f.path().as_str_lossy().into_owned()).collect();
        assert!(paths.iter().any(|p| p.ends_with("a.h")));
    }

    #[tokio::test]
    async fn previous_header_deps_empty_without_a_depfile() {
        let dir = TempDir::new().unwrap();
        let compile = test_compile(&dir);
        assert!(compile.previous_header_deps().await.is_empty());
    }
}
