//! quickbind embeds a QuickJS-hosted TypeScript runtime in a native process
//! and bridges the reflection registry into it.
//!
//! The [`Runtime`] owns the engine, the worker pool, the timer queue and the
//! AMD module registry. Host code registers its types and functions with a
//! [`quickbind_reflect::Registry`], hands it to the runtime, commits the
//! bindings once and then executes compiled modules, ticking [`service`]
//! until the script side goes idle.
//!
//! [`service`]: Runtime::service

pub mod bridge;
pub mod docs;
pub mod modules;
pub mod pool;

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use quickbind_reflect::Registry;
use rquickjs::{CatchResultExt, Ctx, Exception, Value};
use tracing::{debug, instrument, warn};

use crate::bridge::callbacks;
use crate::modules::amd::AmdModules;
use crate::modules::compiler::CompilerModule;
use crate::modules::debugger::{DebuggerServer, InspectorChannel, LoggingChannel};
use crate::modules::timers::TimerQueue;
use crate::pool::{PoolHandle, WorkerPool};

pub use crate::bridge::host_objects::{HostObject, PoolStats, TOMBSTONE};
pub use crate::docs::describe_type;
pub use quickbind_reflect as reflect;

/// Converts a caught script exception into an `anyhow` error.
pub trait CatchJsErrorExt {
    type Ok;
    fn catch_js(self, ctx: &Ctx<'_>) -> anyhow::Result<Self::Ok>;
}

impl<T> CatchJsErrorExt for rquickjs::Result<T> {
    type Ok = T;
    fn catch_js(self, ctx: &Ctx<'_>) -> anyhow::Result<T> {
        match CatchResultExt::catch(self, ctx) {
            Ok(value) => Ok(value),
            Err(e) => Err(anyhow!("script error: {e:#?}")),
        }
    }
}

struct ActiveRuntime {
    context: rquickjs::Context,
    pool: PoolHandle,
}

thread_local! {
    // One runtime per host thread; bridge internals that cannot carry a
    // handle (the callback trampolines, the async proxies) reach it here.
    static ACTIVE: RefCell<Option<ActiveRuntime>> = const { RefCell::new(None) };
}

pub(crate) fn runtime_context(ctx: &Ctx<'_>) -> rquickjs::Result<rquickjs::Context> {
    ACTIVE.with(|active| {
        active
            .borrow()
            .as_ref()
            .map(|a| a.context.clone())
            .ok_or_else(|| Exception::throw_internal(ctx, "no runtime is active on this thread"))
    })
}

pub(crate) fn runtime_pool(ctx: &Ctx<'_>) -> rquickjs::Result<PoolHandle> {
    ACTIVE.with(|active| {
        active
            .borrow()
            .as_ref()
            .map(|a| a.pool.clone())
            .ok_or_else(|| Exception::throw_internal(ctx, "no runtime is active on this thread"))
    })
}

/// Runtime configuration. Everything has a sensible default; the CLI maps
/// its arguments onto this.
pub struct RuntimeConfig {
    /// Process working directory to switch to, if any.
    pub working_dir: Option<PathBuf>,
    /// Root of the TypeScript project tree; generated declarations land in
    /// `<script_root>/internal/lib/`.
    pub script_root: PathBuf,
    /// Path to the TypeScript compiler source (`tsc.js`). `None` disables
    /// in-engine compilation.
    pub compiler_path: Option<PathBuf>,
    /// Port for the debugger wire endpoints. `None` disables the server.
    pub debugger_port: Option<u16>,
    /// Worker threads for asynchronous calls; zero means one per hardware
    /// thread.
    pub worker_threads: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            working_dir: None,
            script_root: PathBuf::from("."),
            compiler_path: None,
            debugger_port: None,
            worker_threads: 0,
        }
    }
}

/// Registers every built-in namespace (`DataBuffer`, `fs`, `path`,
/// `process`) with the given registry.
pub fn register_builtins(registry: &Registry) {
    let buffer_ty = modules::buffer::register(registry);
    modules::fs::register(registry, &buffer_ty);
    modules::path::register(registry);
    modules::process::register(registry);
}

/// The embedded script runtime.
pub struct Runtime {
    registry: Rc<Registry>,
    config: RuntimeConfig,
    rt: rquickjs::Runtime,
    context: rquickjs::Context,
    pool: WorkerPool,
    timers: TimerQueue,
    amd: AmdModules,
    compiler: Option<CompilerModule>,
    debugger: Option<DebuggerServer>,
    committed: bool,
    shut_down: bool,
}

impl Runtime {
    /// Creates the engine, installs the core globals and starts the worker
    /// pool. Binding happens separately, in [`commit_bindings`].
    ///
    /// [`commit_bindings`]: Runtime::commit_bindings
    #[instrument(skip_all, err(Debug))]
    pub fn new(registry: Rc<Registry>, config: RuntimeConfig) -> anyhow::Result<Self> {
        if let Some(dir) = &config.working_dir {
            std::env::set_current_dir(dir)
                .with_context(|| format!("switching to working directory {}", dir.display()))?;
        }

        let rt = rquickjs::Runtime::new().context("creating the script engine")?;
        let context = rquickjs::Context::full(&rt).context("creating the script context")?;

        let pool = WorkerPool::start(config.worker_threads);
        let timers = TimerQueue::new();
        let amd = AmdModules::new();

        ACTIVE.with(|active| {
            *active.borrow_mut() = Some(ActiveRuntime {
                context: context.clone(),
                pool: pool.handle(),
            });
        });

        context.with(|ctx| -> anyhow::Result<()> {
            amd.install(&ctx).catch_js(&ctx)?;
            modules::console::install(&ctx).catch_js(&ctx)?;
            timers.install(&ctx).catch_js(&ctx)?;
            Ok(())
        })?;

        let debugger = match config.debugger_port {
            Some(port) => Some(DebuggerServer::start(port, Arc::new(LoggingChannel))?),
            None => None,
        };

        debug!("runtime initialized");
        Ok(Self {
            registry,
            config,
            rt,
            context,
            pool,
            timers,
            amd,
            compiler: None,
            debugger,
            committed: false,
            shut_down: false,
        })
    }

    /// Replaces the inspector channel by restarting the debugger endpoint.
    pub fn set_inspector_channel(&mut self, channel: Arc<dyn InspectorChannel>) -> anyhow::Result<()> {
        if let Some(port) = self.config.debugger_port {
            self.debugger = Some(DebuggerServer::start(port, channel)?);
        }
        Ok(())
    }

    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    /// Walks the registry and installs every binding, then loads the
    /// TypeScript compiler if one is configured. One shot.
    #[instrument(skip_all, err(Debug))]
    pub fn commit_bindings(&mut self) -> anyhow::Result<()> {
        if self.committed {
            warn!("bindings were already committed");
            return Ok(());
        }

        self.context.with(|ctx| -> anyhow::Result<()> {
            bridge::commit::commit(
                &ctx,
                &self.registry,
                &self.amd,
                Some(self.config.script_root.as_path()),
            )
            .catch_js(&ctx)
        })?;
        self.committed = true;

        if let Some(compiler_path) = self.config.compiler_path.clone() {
            self.compiler = Some(self.context.with(|ctx| {
                CompilerModule::initialize(&ctx, &compiler_path)
            })?);
        }

        Ok(())
    }

    /// Compiles the project tree at the script root. Requires a configured
    /// compiler and committed bindings.
    pub fn build_project(&self) -> anyhow::Result<bool> {
        let Some(compiler) = &self.compiler else {
            anyhow::bail!("no TypeScript compiler is configured");
        };
        let root = self.config.script_root.display().to_string();
        Ok(self.context.with(|ctx| compiler.compile_directory(&ctx, &root)))
    }

    /// Executes a script source in the global scope.
    pub fn execute(&self, source: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        self.context.with(|ctx| {
            ctx.eval::<Value, _>(source.into()).catch_js(&ctx)?;
            Ok(())
        })
    }

    /// Requires a module and drops its exports.
    pub fn require(&self, id: &str) -> anyhow::Result<()> {
        self.context.with(|ctx| {
            self.amd.require(&ctx, id).catch_js(&ctx)?;
            Ok(())
        })
    }

    /// Runs a closure against the engine context.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(Ctx<'js>) -> R,
    {
        self.context.with(f)
    }

    /// One service tick: drains completed asynchronous jobs (in enqueue
    /// order), fires due timers and pumps engine jobs. Returns `true` while
    /// there is still script-related work outstanding.
    pub fn service(&self) -> bool {
        let mut had_work = self.context.with(|ctx| {
            let drained = self.pool.drain(&ctx);
            let timers = self.timers.service(&ctx);
            drained || timers
        });

        while self.rt.is_job_pending() {
            had_work = true;
            if let Err(err) = self.rt.execute_pending_job() {
                warn!(?err, "pending engine job failed");
                break;
            }
        }

        had_work || self.pool.is_busy() || self.timers.has_pending()
    }

    /// Services until the pool, the timers and the engine job queue are all
    /// idle.
    pub fn run_until_idle(&self) {
        while self.service() {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Tears everything down in dependency order: worker pool first, then
    /// the callback registry, then per-type script state, then the engine.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        debug!("shutting down");

        if let Some(mut debugger) = self.debugger.take() {
            debugger.shutdown();
        }
        self.pool.shutdown();
        callbacks::destroy_all();

        // Engine handles held outside the context must go before it does.
        if let Some(compiler) = self.compiler.take() {
            compiler.release();
        }
        self.timers.release();
        self.amd.release();
        bridge::release_script_state(&self.registry);

        ACTIVE.with(|active| {
            *active.borrow_mut() = None;
        });
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}
