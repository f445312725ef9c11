//! End-to-end exercises of the module mapper: attribution, suspend/resume
//! rendezvous through the [`erect::registry::ModuleRegistry`], and the
//! deadlock watchdog's reaction to a module cycle.
//!
//! Rather than shelling out to a real (or fake) compiler binary, these tests
//! speak the mapper's wire protocol directly over a `TcpStream`, the same
//! handful of lines `packages/demo/src/bin/fakecc.rs` sends: `HELLO`,
//! `MODULE-IMPORT`, `MODULE-EXPORT`, `MODULE-COMPILED`.

use std::{sync::Arc, time::Duration};

use color_eyre::Result;
use erect::{
    context::{CacheConfig, Config, Context},
    id::TaskId,
    mapper::Mapper,
    path::AbsDirPath,
    registry::ModuleRegistry,
    task::FnBody,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, tcp::OwnedReadHalf},
};

use crate::temporary_directory;

async fn line(stream: &mut BufReader<OwnedReadHalf>) -> String {
    let mut buf = String::new();
    stream.read_line(&mut buf).await.expect("read mapper reply");
    buf.trim_end().to_owned()
}

/// Speak just enough of the protocol to exercise attribution and the
/// import/export rendezvous: `HELLO`, then a `MODULE-IMPORT` per `requires`,
/// then a `MODULE-EXPORT`/`MODULE-COMPILED` pair per `provides`.
async fn fake_compile(port: u16, ident: &str, requires: &[&str], provides: &[&str]) -> Result<()> {
    let stream = TcpStream::connect(("::1", port)).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    writer.write_all(format!("HELLO 1 fakecc {ident}\n").as_bytes()).await?;
    let hello = line(&mut reader).await;
    assert!(hello.starts_with("HELLO"), "unexpected HELLO reply: {hello}");

    for module in requires {
        writer.write_all(format!("MODULE-IMPORT {module}\n").as_bytes()).await?;
        let reply = line(&mut reader).await;
        assert!(reply.starts_with("PATHNAME"), "unexpected MODULE-IMPORT reply: {reply}");
    }

    for module in provides {
        writer.write_all(format!("MODULE-EXPORT {module}\n").as_bytes()).await?;
        let reply = line(&mut reader).await;
        assert!(reply.starts_with("PATHNAME"), "unexpected MODULE-EXPORT reply: {reply}");

        writer.write_all(format!("MODULE-COMPILED {module}\n").as_bytes()).await?;
        let reply = line(&mut reader).await;
        assert_eq!(reply, "OK");
    }

    Ok(())
}

async fn bound_mapper(ctx: &Context, build_dir: &AbsDirPath) -> (Arc<Mapper>, u16) {
    let registry = Arc::new(ModuleRegistry::new());
    let mapper = Mapper::new(ctx.clone(), registry, build_dir.clone(), build_dir.clone());
    mapper.bind().await.expect("bind mapper");
    let port = mapper.port();
    (mapper, port)
}

/// A task that just talks to the mapper as a stand-in compiler; its own
/// body does nothing file-system-visible, so the test can focus on the
/// suspend/resume handshake.
fn module_task(ctx: &Context, build_dir: &AbsDirPath, ident: &str, port: u16, requires: Vec<&'static str>, provides: Vec<&'static str>) -> Arc<erect::task::Task> {
    let id = TaskId::new(["compile", build_dir.as_str_lossy().as_ref(), ident]);
    let ident = ident.to_owned();
    let body = FnBody::new(move || {
        let ident = ident.clone();
        let requires = requires.clone();
        let provides = provides.clone();
        async move {
            fake_compile(port, &ident, &requires, &provides).await?;
            Ok(serde_json::Value::Null)
        }
    });
    ctx.task(id, body, vec![], vec![], vec![]).into_fresh_task().expect("fresh task id")
}

#[tokio::test]
async fn importer_blocks_until_provider_exports_the_module() -> Result<()> {
    let (_dir, build_dir) = temporary_directory();
    let ctx = Context::new(Config { jobs: 2, cache: CacheConfig::InMemory, ..Config::default() })?;
    let (_mapper, port) = bound_mapper(&ctx, &build_dir).await;

    let provider = module_task(&ctx, &build_dir, "mod.cpp", port, vec![], vec!["greet"]);
    let consumer = module_task(&ctx, &build_dir, "use.cpp", port, vec!["greet"], vec![]);

    tokio::time::timeout(Duration::from_secs(5), ctx.run(vec![provider, consumer]))
        .await
        .expect("module import/export should complete well within the timeout")?;
    Ok(())
}

#[tokio::test]
async fn provider_running_first_does_not_block_the_importer() -> Result<()> {
    let (_dir, build_dir) = temporary_directory();
    let ctx = Context::new(Config { jobs: 1, cache: CacheConfig::InMemory, ..Config::default() })?;
    let (_mapper, port) = bound_mapper(&ctx, &build_dir).await;

    let provider = module_task(&ctx, &build_dir, "mod.cpp", port, vec![], vec!["greet"]);
    provider.drive().await?;

    let consumer = module_task(&ctx, &build_dir, "use.cpp", port, vec!["greet"], vec![]);
    tokio::time::timeout(Duration::from_millis(500), consumer.drive())
        .await
        .expect("module already provided, import must return immediately")?;
    Ok(())
}

/// Two tasks each waiting on a module only the other provides: neither can
/// make progress, so the deadlock watchdog must fail the build rather than
/// hang forever.
#[tokio::test]
async fn module_cycle_trips_the_deadlock_watchdog() -> Result<()> {
    let (_dir, build_dir) = temporary_directory();
    let ctx = Context::new(Config {
        jobs: 2,
        cache: CacheConfig::InMemory,
        watchdog_interval: Duration::from_millis(20),
    })?;
    let (_mapper, port) = bound_mapper(&ctx, &build_dir).await;

    let a = module_task(&ctx, &build_dir, "a.cpp", port, vec!["b"], vec!["a"]);
    let b = module_task(&ctx, &build_dir, "b.cpp", port, vec!["a"], vec!["b"]);

    let result = tokio::time::timeout(Duration::from_secs(5), ctx.run(vec![a, b]))
        .await
        .expect("watchdog should trip well within the timeout, not hang");
    assert!(result.is_err(), "a module cycle must surface as a scheduler error, not a silent hang");
    Ok(())
}
