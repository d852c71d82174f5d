//! The `process` builtin: a bound namespace with `cwd()` and `os`, plus the
//! `env` object filled from the OS environment at commit time.

use quickbind_reflect::{describe, wrap0, Registry};
use rquickjs::{Ctx, Object};

pub fn register(registry: &Registry) {
    let ns = registry.namespace("process");

    let cwd = ns.function("cwd", registry.string_type(), &[], wrap0(|| -> String {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    }));
    describe(&cwd)
        .desc("Gets the current working directory")
        .returns("The current working directory");

    let os: &'static mut String = Box::leak(Box::new(String::from(std::env::consts::OS)));
    ns.value("os", registry.string_type(), (os as *mut String).cast());
}

/// Fills `process.env` with the OS environment. Runs once, when the binding
/// commit builds the `process` module exports.
pub fn populate_env<'js>(ctx: &Ctx<'js>, exports: &Object<'js>) -> rquickjs::Result<()> {
    let env = Object::new(ctx.clone())?;
    for (key, value) in std::env::vars() {
        env.set(key.as_str(), value.as_str())?;
    }
    exports.set("env", env)?;
    Ok(())
}
