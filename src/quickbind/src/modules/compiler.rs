//! TypeScript compiler host. The compiler itself (`tsc.js`) is loaded into
//! the engine from a configured path; a small shim script evaluated on top
//! of it returns the `compileFile` / `compileDirectory` entry points, which
//! drive the compiler over the `fs` and `path` built-in modules.

use std::fs;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context as _};
use rquickjs::{Coerced, Ctx, Function, Object, Persistent, Value};
use tracing::{debug, error, info, instrument};

use crate::CatchJsErrorExt;

const COMPILER_SHIM: &str = include_str!("compiler_shim.js");

/// Handles onto the in-engine compilation entry points.
pub struct CompilerModule {
    compile_file: Persistent<Function<'static>>,
    compile_directory: Persistent<Function<'static>>,
    version: String,
}

impl CompilerModule {
    /// Loads the compiler and the shim. The `fs` and `path` modules must be
    /// bound already; the shim requires them.
    #[instrument(skip(ctx), err(Debug))]
    pub fn initialize(ctx: &Ctx<'_>, compiler_path: &Path) -> anyhow::Result<Self> {
        let source = fs::read_to_string(compiler_path).with_context(|| {
            format!("reading the TypeScript compiler from {}", compiler_path.display())
        })?;

        ctx.eval::<(), _>(source)
            .catch_js(ctx)
            .context("executing the TypeScript compiler")?;

        let ts: Object = ctx
            .globals()
            .get("ts")
            .catch_js(ctx)
            .context("TypeScript compiler not found in the global scope")?;
        let version = ts
            .get::<_, Coerced<String>>("version")
            .map(|v| v.0)
            .unwrap_or_else(|_| String::from("unknown"));

        let factory: Value = ctx
            .eval(COMPILER_SHIM)
            .catch_js(ctx)
            .context("executing the compilation shim")?;
        let Some(factory) = factory.as_function() else {
            bail!("compilation shim did not produce a factory function");
        };
        let shims: Object = factory.call(()).catch_js(ctx).context("building compilation shims")?;

        let compile_file: Function = shims
            .get("compileFile")
            .catch_js(ctx)
            .context("compileFile shim not found")?;
        let compile_directory: Function = shims
            .get("compileDirectory")
            .catch_js(ctx)
            .context("compileDirectory shim not found")?;

        debug!(version, "TypeScript compiler initialized");
        Ok(Self {
            compile_file: Persistent::save(ctx, compile_file),
            compile_directory: Persistent::save(ctx, compile_directory),
            version,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn run(&self, ctx: &Ctx<'_>, entry: &Persistent<Function<'static>>, arg: &str) -> bool {
        let start = Instant::now();
        let result: anyhow::Result<bool> = (|| {
            let entry = entry.clone().restore(ctx).catch_js(ctx)?;
            let ok: Value = entry.call((arg,)).catch_js(ctx)?;
            Ok(ok.as_bool().unwrap_or(false))
        })();
        let elapsed = start.elapsed().as_millis();
        match result {
            Ok(true) => {
                info!(target = arg, elapsed_ms = elapsed, "compilation succeeded");
                true
            }
            Ok(false) => {
                error!(target = arg, elapsed_ms = elapsed, "compilation failed");
                false
            }
            Err(err) => {
                error!(target = arg, elapsed_ms = elapsed, %err, "compilation raised");
                false
            }
        }
    }

    /// Compiles a single file. Returns `false` on any diagnostic.
    pub fn compile_file(&self, ctx: &Ctx<'_>, file: &str) -> bool {
        info!(file, "compiling TypeScript file");
        self.run(ctx, &self.compile_file, file)
    }

    /// Compiles the project tree rooted at `path`.
    pub fn compile_directory(&self, ctx: &Ctx<'_>, path: &str) -> bool {
        info!(path, "compiling TypeScript project");
        self.run(ctx, &self.compile_directory, path)
    }

    /// Drops the engine handles; must run before the context goes away.
    pub fn release(self) {
        drop(self.compile_file);
        drop(self.compile_directory);
    }
}
