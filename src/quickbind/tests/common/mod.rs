#![allow(dead_code)]

use std::rc::Rc;

use quickbind::{register_builtins, Runtime, RuntimeConfig};
use quickbind_reflect::Registry;
use tempfile::TempDir;

/// Builds a runtime over a fresh registry (builtins included), lets the
/// test register its own bindings, and commits. The temp dir receives the
/// generated declarations.
pub fn runtime_with(register: impl FnOnce(&Registry)) -> (Runtime, TempDir) {
    runtime_with_workers(register, 0)
}

pub fn runtime_with_workers(
    register: impl FnOnce(&Registry),
    workers: usize,
) -> (Runtime, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Rc::new(Registry::new());
    register_builtins(&registry);
    register(&registry);

    let mut runtime = Runtime::new(
        registry,
        RuntimeConfig {
            script_root: dir.path().to_path_buf(),
            worker_threads: workers,
            ..RuntimeConfig::default()
        },
    )
    .expect("runtime");
    runtime.commit_bindings().expect("commit");
    (runtime, dir)
}

/// Evaluates a script, panicking with the caught exception on failure.
pub fn eval<T: for<'js> rquickjs::FromJs<'js>>(runtime: &Runtime, source: &str) -> T {
    runtime.with(|ctx| match ctx.eval::<T, _>(source) {
        Ok(value) => value,
        Err(rquickjs::Error::Exception) => {
            panic!("script threw: {:?}", ctx.catch());
        }
        Err(err) => panic!("eval failed: {err}"),
    })
}

/// Evaluates a script expecting a script exception; returns its message.
pub fn eval_err(runtime: &Runtime, source: &str) -> String {
    runtime.with(|ctx| match ctx.eval::<rquickjs::Value, _>(source) {
        Ok(_) => panic!("expected an exception"),
        Err(rquickjs::Error::Exception) => {
            let caught = ctx.catch();
            caught
                .as_exception()
                .and_then(|e| e.message())
                .unwrap_or_else(|| format!("{caught:?}"))
        }
        Err(err) => err.to_string(),
    })
}
