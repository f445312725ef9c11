//! A hand-written stand-in for the blueprint the engine design leaves out
//! of scope: ordinary Rust code, linked against `erect`, that builds a
//! [`Context`], declares a handful of compile tasks, and hands them to the
//! engine's [`BuildArgs`] helper. There is no interpreter for an external
//! build-file format here, by design.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use color_eyre::Result;
use erect::{
    cli::BuildArgs,
    context::Context,
    gcc::Compile,
    id::TaskId,
    mapper::Mapper,
    path::{AbsDirPath, AbsFilePath},
    registry::ModuleRegistry,
    task::Task,
};
use tracing_subscriber::util::SubscriberInitExt;

mod log;

#[derive(Clone, Debug, Parser)]
#[command(name = "demo", about = "Hand-written blueprint exercising the erect engine")]
struct Cli {
    #[command(flatten)]
    build: BuildArgs,

    /// Directory holding the demo's source files and build outputs.
    #[arg(long, default_value = "demo-workspace")]
    workspace: PathBuf,

    /// Compiler executable to invoke for every compile task. Defaults to
    /// the `fakecc` double built alongside this binary, so the demo runs
    /// without a module-aware GCC on the build machine.
    #[arg(long)]
    compiler: Option<String>,

    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    log::make_logger(cli.color).init();

    std::fs::create_dir_all(&cli.workspace)?;
    let workspace = std::fs::canonicalize(&cli.workspace)?;
    let build_dir = AbsDirPath::try_from(workspace.join("build"))?;
    let cmi_dir = AbsDirPath::try_from(workspace.join("build").join("cmi"))?;

    let ctx = Context::new(cli.build.config()?)?;

    let registry = Arc::new(ModuleRegistry::new());
    let mapper = Mapper::new(ctx.clone(), Arc::clone(&registry), build_dir.clone(), cmi_dir.clone());
    ctx.start_async({
        let mapper = Arc::clone(&mapper);
        async move { mapper.bind().await }
    })
    .await;

    let compiler = cli.compiler.unwrap_or_else(default_compiler);

    let mut roots = Vec::new();
    roots.push(compile_task(
        &ctx,
        &workspace,
        &build_dir,
        &compiler,
        &registry,
        &mapper,
        "a.cpp",
        "int a() { return 0; }\n",
        &[],
    )?);
    roots.push(compile_task(
        &ctx,
        &workspace,
        &build_dir,
        &compiler,
        &registry,
        &mapper,
        "b.cpp",
        "int b() { return 0; }\n",
        &[],
    )?);
    roots.push(compile_task(
        &ctx,
        &workspace,
        &build_dir,
        &compiler,
        &registry,
        &mapper,
        "mod.cpp",
        "export module greet;\nexport int hello() { return 0; }\n",
        &["--provides=greet".to_owned()],
    )?);
    roots.push(compile_task(
        &ctx,
        &workspace,
        &build_dir,
        &compiler,
        &registry,
        &mapper,
        "use.cpp",
        "import greet;\nint main() { return hello(); }\n",
        &["--requires=greet".to_owned()],
    )?);

    let roots = cli.build.select_roots(&roots)?;
    ctx.run(roots).await
}

fn default_compiler() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("fakecc")))
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|| "fakecc".to_owned())
}

#[allow(clippy::too_many_arguments)]
fn compile_task(
    ctx: &Context,
    workspace: &std::path::Path,
    build_dir: &AbsDirPath,
    compiler: &str,
    registry: &Arc<ModuleRegistry>,
    mapper: &Arc<Mapper>,
    file_name: &str,
    source_body: &str,
    extra_flags: &[String],
) -> Result<Arc<Task>> {
    let source_path = workspace.join(file_name);
    std::fs::write(&source_path, source_body)?;
    let source = AbsFilePath::try_from(source_path)?;
    let output = AbsFilePath::try_from(build_dir.as_std_path().join(file_name).with_extension("o"))?;

    let id = TaskId::new(["compile", build_dir.as_str_lossy().as_ref(), source.as_str_lossy().as_ref()]);
    let input_file = ctx.file(source.clone());
    let output_file = ctx.file(output.clone());

    let body = Compile::new(
        id.clone(),
        compiler,
        source,
        output,
        build_dir.clone(),
        extra_flags.to_vec(),
        ctx.clone(),
        Arc::clone(mapper),
        Arc::clone(registry),
        Arc::clone(ctx.cache()),
    );

    Ok(ctx
        .task(id, body, vec![], vec![input_file], vec![output_file])
        .into_task())
}
