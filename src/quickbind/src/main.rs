use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use clap::Parser;
use quickbind::{register_builtins, Runtime, RuntimeConfig};
use quickbind_reflect::Registry;
use tracing::info;
use tracing_subscriber::EnvFilter;

const EXAMPLES: &str = "\u{001b}[1;4mExamples:\u{001b}[0m
  Build and run the TypeScript project in the current directory:
    $ quickbind .

  Run a project with the debugger endpoints on port 9229:
    $ quickbind ./my-project --debug-port 9229

  Run already-compiled output without rebuilding:
    $ quickbind ./my-project --no-build --entry out/main
";

/// Compile and run a TypeScript project against the native bindings.
///
/// The project tree is compiled with the configured TypeScript compiler,
/// the compiled AMD modules are loaded, and the entry module is required.
#[derive(Parser)]
#[command(version, about)]
#[clap(after_help = EXAMPLES)]
struct Cli {
    /// The project root directory (containing tsconfig.json).
    #[arg(default_value = ".")]
    project: PathBuf,

    /// The module id to require once the project is loaded.
    #[arg(long, default_value = "out/main")]
    entry: String,

    /// Path to the TypeScript compiler source (tsc.js).
    #[arg(long, default_value = "tsc.js")]
    compiler: PathBuf,

    /// Skip compilation and run existing output.
    #[arg(long)]
    no_build: bool,

    /// Serve the debugger discovery and WebSocket endpoints on this port.
    #[arg(long)]
    debug_port: Option<u16>,

    /// Worker threads for asynchronous calls (0 = one per hardware thread).
    #[arg(long, default_value_t = 0)]
    workers: usize,
}

/// Evaluates every compiled module file under `dir` so its `define` calls
/// register with the module system.
fn load_compiled(runtime: &Runtime, dir: &PathBuf) -> Result<usize> {
    let mut loaded = 0;
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut stack = vec![dir.clone()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("listing {}", current.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "js") {
                let source = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                runtime
                    .execute(source)
                    .with_context(|| format!("loading {}", path.display()))?;
                loaded += 1;
            }
        }
    }
    Ok(loaded)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let registry = Rc::new(Registry::new());
    register_builtins(&registry);

    let mut runtime = Runtime::new(
        registry,
        RuntimeConfig {
            script_root: cli.project.clone(),
            compiler_path: (!cli.no_build).then_some(cli.compiler),
            debugger_port: cli.debug_port,
            worker_threads: cli.workers,
            ..RuntimeConfig::default()
        },
    )?;

    runtime.commit_bindings()?;

    if !cli.no_build && !runtime.build_project()? {
        anyhow::bail!("project build failed");
    }

    let out_dir = cli.project.join("out");
    let loaded = load_compiled(&runtime, &out_dir)?;
    info!(loaded, "modules loaded");

    runtime
        .require(&cli.entry)
        .with_context(|| format!("running entry module '{}'", cli.entry))?;

    runtime.run_until_idle();
    Ok(())
}
