//! End-to-end exercises of the scheduler against plain [`FnBody`] tasks:
//! caching, fingerprint fallback, and concurrency bounds. The GCC collaborator
//! and the module mapper get their own coverage in `modules.rs`.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use color_eyre::Result;
use erect::{
    context::{CacheConfig, Config, Context},
    id::{Atom, TaskId},
    path::AbsFilePath,
    task::FnBody,
};
use pretty_assertions::assert_eq;

use crate::temporary_directory;

fn memory_context(jobs: usize) -> Context {
    Context::new(Config { jobs, cache: CacheConfig::InMemory, ..Config::default() }).expect("open context")
}

/// A context backed by a persistent cache file. Building a second one
/// against the same path simulates a later process invocation reusing a
/// warm on-disk cache, as opposed to reusing the very same `Context` (whose
/// `Task`s memoize their own completion and would never re-run regardless
/// of the cache backend).
fn persistent_context(jobs: usize, cache_path: &AbsFilePath) -> Context {
    Context::new(Config { jobs, cache: CacheConfig::Persistent(cache_path.clone()), ..Config::default() })
        .expect("open context")
}

async fn write(path: &AbsFilePath, content: &str) {
    tokio::fs::write(path.as_std_path(), content).await.expect("write test file");
}

/// A compile-like task: reads `source`, writes its content (possibly
/// transformed) to `output`, and counts how many times it actually ran.
fn copy_task(
    ctx: &Context,
    id: TaskId,
    source: AbsFilePath,
    output: AbsFilePath,
    runs: Arc<AtomicUsize>,
) -> Arc<erect::task::Task> {
    let input_file = ctx.file(source.clone());
    let output_file = ctx.file(output.clone());
    let body = FnBody::new(move || {
        let source = source.clone();
        let output = output.clone();
        let runs = Arc::clone(&runs);
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            let content = tokio::fs::read_to_string(source.as_std_path()).await?;
            tokio::fs::write(output.as_std_path(), content).await?;
            Ok(serde_json::Value::Null)
        }
    });
    ctx.task(id, body, vec![], vec![input_file], vec![output_file]).into_fresh_task().unwrap()
}

#[tokio::test]
async fn cold_build_runs_the_task_once() -> Result<()> {
    let (_dir, root) = temporary_directory();
    let source = root.as_std_path().join("a.txt");
    let output = root.as_std_path().join("a.out");
    tokio::fs::write(&source, "hello").await?;
    let source = AbsFilePath::try_from(source)?;
    let output = AbsFilePath::try_from(output)?;

    let ctx = memory_context(1);
    let runs = Arc::new(AtomicUsize::new(0));
    let task = copy_task(&ctx, TaskId::new(["copy", "a"]), source, output.clone(), Arc::clone(&runs));

    ctx.run(vec![task]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(tokio::fs::read_to_string(output.as_std_path()).await?, "hello");
    Ok(())
}

#[tokio::test]
async fn warm_rebuild_does_not_rerun_the_body() -> Result<()> {
    let (_dir, root) = temporary_directory();
    let source = AbsFilePath::try_from(root.as_std_path().join("a.txt"))?;
    let output = AbsFilePath::try_from(root.as_std_path().join("a.out"))?;
    let cache_path = AbsFilePath::try_from(root.as_std_path().join("cache.sqlite"))?;
    write(&source, "hello").await;

    let runs = Arc::new(AtomicUsize::new(0));

    let ctx = persistent_context(1, &cache_path);
    let first = copy_task(&ctx, TaskId::new(["copy", "a"]), source.clone(), output.clone(), Arc::clone(&runs));
    ctx.run(vec![first]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // A second `Context` reopening the same cache file, standing in for a
    // second invocation of a blueprint binary against a warm on-disk cache.
    let ctx = persistent_context(1, &cache_path);
    let second = copy_task(&ctx, TaskId::new(["copy", "a"]), source, output, Arc::clone(&runs));
    ctx.run(vec![second]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "unchanged inputs must not re-run the body");
    Ok(())
}

#[tokio::test]
async fn mtime_bump_without_content_change_skips_rerun() -> Result<()> {
    let (_dir, root) = temporary_directory();
    let source = AbsFilePath::try_from(root.as_std_path().join("a.txt"))?;
    let output = AbsFilePath::try_from(root.as_std_path().join("a.out"))?;
    let cache_path = AbsFilePath::try_from(root.as_std_path().join("cache.sqlite"))?;
    write(&source, "hello").await;

    let runs = Arc::new(AtomicUsize::new(0));

    let ctx = persistent_context(1, &cache_path);
    let first = copy_task(&ctx, TaskId::new(["copy", "a"]), source.clone(), output.clone(), Arc::clone(&runs));
    ctx.run(vec![first]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let bumped = filetime::FileTime::from_system_time(std::time::SystemTime::now() + Duration::from_secs(5));
    filetime::set_file_mtime(source.as_std_path(), bumped)?;

    let ctx = persistent_context(1, &cache_path);
    let second = copy_task(&ctx, TaskId::new(["copy", "a"]), source, output, Arc::clone(&runs));
    ctx.run(vec![second]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "hash fallback should recognise unchanged content");
    Ok(())
}

#[tokio::test]
async fn content_change_forces_a_rerun() -> Result<()> {
    let (_dir, root) = temporary_directory();
    let source = AbsFilePath::try_from(root.as_std_path().join("a.txt"))?;
    let output = AbsFilePath::try_from(root.as_std_path().join("a.out"))?;
    let cache_path = AbsFilePath::try_from(root.as_std_path().join("cache.sqlite"))?;
    write(&source, "hello").await;

    let runs = Arc::new(AtomicUsize::new(0));

    let ctx = persistent_context(1, &cache_path);
    let first = copy_task(&ctx, TaskId::new(["copy", "a"]), source.clone(), output.clone(), Arc::clone(&runs));
    ctx.run(vec![first]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    write(&source, "goodbye").await;

    let ctx = persistent_context(1, &cache_path);
    let second = copy_task(&ctx, TaskId::new(["copy", "a"]), source, output.clone(), Arc::clone(&runs));
    ctx.run(vec![second]).await?;
    assert_eq!(runs.load(Ordering::SeqCst), 2, "changed content must re-run the body");
    assert_eq!(tokio::fs::read_to_string(output.as_std_path()).await?, "goodbye");
    Ok(())
}

#[tokio::test]
async fn jobs_limit_bounds_concurrent_running_tasks() -> Result<()> {
    let (_dir, root) = temporary_directory();
    let ctx = memory_context(2);
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_concurrent = Arc::new(AtomicUsize::new(0));

    let mut roots = Vec::new();
    for i in 0..6 {
        let source = AbsFilePath::try_from(root.as_std_path().join(format!("s{i}.txt")))?;
        write(&source, "x").await;
        let output = ctx.file(AbsFilePath::try_from(root.as_std_path().join(format!("s{i}.out")))?);
        let input = ctx.file(source);

        let concurrent = Arc::clone(&concurrent);
        let max_concurrent = Arc::clone(&max_concurrent);
        let body = FnBody::new(move || {
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            async move {
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
                Ok(serde_json::Value::Null)
            }
        });
        let id = TaskId::new([Atom::from("busy"), Atom::from(i as i64)]);
        roots.push(ctx.task(id, body, vec![], vec![input], vec![output]).into_fresh_task()?);
    }

    ctx.run(roots).await?;
    assert!(max_concurrent.load(Ordering::SeqCst) <= 2, "observed more than the configured job limit running at once");
    assert!(max_concurrent.load(Ordering::SeqCst) >= 2, "jobs=2 should allow at least two tasks to overlap");
    Ok(())
}
