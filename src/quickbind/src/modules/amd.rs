//! Asynchronous Module Definition loader.
//!
//! Compiled TypeScript modules arrive as `define(id?, deps?, factory)`
//! calls; built-in modules (one per bound namespace) are registered by the
//! binding commit. `require` resolves and instantiates on demand, with the
//! AMD pseudo-dependencies `require`, `exports` and `module`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, IntoJs, JsLifetime, Object, Persistent, Value};
use tracing::{debug, warn};

enum ModuleState {
    Registered {
        dependencies: Vec<String>,
        factory: Persistent<Function<'static>>,
    },
    Loading,
    Loaded {
        exports: Persistent<Value<'static>>,
    },
}

#[derive(Default)]
struct AmdInner {
    modules: RefCell<HashMap<String, ModuleState>>,
    next_anonymous: RefCell<u64>,
}

/// The module registry, shared between the runtime and the context userdata.
#[derive(Clone, Default, JsLifetime)]
pub struct AmdModules {
    inner: Rc<AmdInner>,
}

fn js_fn<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

impl AmdModules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the global `define` and `require` functions and stores the
    /// registry as context userdata.
    pub fn install(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let globals = ctx.globals();

        let modules = self.clone();
        let define = Function::new(
            ctx.clone(),
            js_fn(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
                modules.define_from_args(&ctx, args.into_inner())?;
                Ok(Value::new_undefined(ctx))
            }),
        )?
        .with_name("define")?;
        // AMD compliance marker.
        let define_value = define.into_js(ctx)?;
        if let Some(obj) = define_value.as_object() {
            obj.set("amd", Object::new(ctx.clone())?)?;
        }
        globals.set("define", define_value)?;

        let modules = self.clone();
        let require = Function::new(
            ctx.clone(),
            js_fn(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
                let args = args.into_inner();
                let Some(id) = args.first().and_then(|v| v.as_string()) else {
                    return Err(Exception::throw_type(&ctx, "require needs a module id string"));
                };
                modules.require(&ctx, &id.to_string()?)
            }),
        )?
        .with_name("require")?;
        globals.set("require", require)?;

        Ok(())
    }

    /// Registers an already-instantiated built-in module.
    pub fn register_builtin<'js>(
        &self,
        ctx: &Ctx<'js>,
        id: &str,
        exports: Value<'js>,
    ) -> bool {
        let mut modules = self.inner.modules.borrow_mut();
        if modules.contains_key(id) {
            warn!(id, "module is already registered");
            return false;
        }
        modules.insert(
            id.to_string(),
            ModuleState::Loaded { exports: Persistent::save(ctx, exports) },
        );
        debug!(id, "registered built-in module");
        true
    }

    /// `true` once `id` is known, loaded or not.
    pub fn contains(&self, id: &str) -> bool {
        self.inner.modules.borrow().contains_key(id)
    }

    /// Drops every engine handle. Runs at shutdown before the context does.
    pub fn release(&self) {
        self.inner.modules.borrow_mut().clear();
    }

    fn define_from_args<'js>(&self, ctx: &Ctx<'js>, args: Vec<Value<'js>>) -> rquickjs::Result<()> {
        if args.is_empty() {
            return Err(Exception::throw_type(ctx, "define requires a factory function"));
        }

        let mut index = 0;
        let mut id = None;
        if args.len() > 1 {
            if let Some(s) = args[0].as_string() {
                id = Some(s.to_string()?);
                index += 1;
            }
        }

        let mut dependencies = Vec::new();
        if index < args.len() {
            if let Some(deps) = args[index].as_array() {
                for dep in deps.iter::<Value>() {
                    let dep = dep?;
                    let Some(dep) = dep.as_string() else {
                        return Err(Exception::throw_type(
                            ctx,
                            "define dependencies must be an array of strings",
                        ));
                    };
                    dependencies.push(dep.to_string()?);
                }
                index += 1;
            }
        }

        let factory = args
            .get(index)
            .and_then(|v| v.as_function())
            .cloned()
            .ok_or_else(|| Exception::throw_type(ctx, "define requires a factory function"))?;

        let id = id.unwrap_or_else(|| {
            let mut counter = self.inner.next_anonymous.borrow_mut();
            *counter += 1;
            format!("anonymous_{counter}")
        });

        let mut modules = self.inner.modules.borrow_mut();
        if modules.contains_key(&id) {
            warn!(id, "module is already defined");
            return Err(Exception::throw_type(ctx, &format!("module '{id}' is already defined")));
        }
        modules.insert(
            id.clone(),
            ModuleState::Registered {
                dependencies,
                factory: Persistent::save(ctx, factory),
            },
        );
        debug!(id, "defined module");
        Ok(())
    }

    /// Loads a module by id and returns its exports.
    pub fn require<'js>(&self, ctx: &Ctx<'js>, id: &str) -> rquickjs::Result<Value<'js>> {
        let resolved = resolve_id(id, "");
        self.load(ctx, &resolved)
    }

    fn load<'js>(&self, ctx: &Ctx<'js>, id: &str) -> rquickjs::Result<Value<'js>> {
        // Careful with borrow scope: the factory below may re-enter.
        let (dependencies, factory) = {
            let mut modules = self.inner.modules.borrow_mut();
            match modules.get_mut(id) {
                None => {
                    return Err(Exception::throw_reference(
                        ctx,
                        &format!("module '{id}' not found"),
                    ));
                }
                Some(ModuleState::Loaded { exports }) => {
                    return exports.clone().restore(ctx);
                }
                Some(ModuleState::Loading) => {
                    return Err(Exception::throw_internal(
                        ctx,
                        &format!("circular dependency detected for module '{id}'"),
                    ));
                }
                Some(state @ ModuleState::Registered { .. }) => {
                    let ModuleState::Registered { dependencies, factory } =
                        std::mem::replace(state, ModuleState::Loading)
                    else {
                        unreachable!()
                    };
                    (dependencies, factory)
                }
            }
        };

        let result = self.instantiate(ctx, id, dependencies, factory);
        match &result {
            Ok(exports) => {
                self.inner.modules.borrow_mut().insert(
                    id.to_string(),
                    ModuleState::Loaded { exports: Persistent::save(ctx, exports.clone()) },
                );
            }
            Err(_) => {
                // Leave the module absent so a later require can retry.
                self.inner.modules.borrow_mut().remove(id);
            }
        }
        result
    }

    fn instantiate<'js>(
        &self,
        ctx: &Ctx<'js>,
        id: &str,
        dependencies: Vec<String>,
        factory: Persistent<Function<'static>>,
    ) -> rquickjs::Result<Value<'js>> {
        let module_obj = Object::new(ctx.clone())?;
        let exports_obj = Object::new(ctx.clone())?;
        module_obj.set("id", id)?;
        module_obj.set("exports", exports_obj.clone())?;

        // A require that resolves relative ids against this module.
        let modules = self.clone();
        let base = id.to_string();
        let scoped_require = Function::new(
            ctx.clone(),
            js_fn(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
                let args = args.into_inner();
                let Some(target) = args.first().and_then(|v| v.as_string()) else {
                    return Err(Exception::throw_type(&ctx, "require needs a module id string"));
                };
                let target = resolve_id(&target.to_string()?, &base);
                modules.load(&ctx, &target)
            }),
        )?
        .with_name("require")?;

        let mut factory_args: Vec<Value<'js>> = Vec::with_capacity(dependencies.len());
        for dep in &dependencies {
            let value = match dep.as_str() {
                "require" => scoped_require.clone().into_value(),
                "exports" => exports_obj.clone().into_value(),
                "module" => module_obj.clone().into_value(),
                other => self.load(ctx, &resolve_id(other, id))?,
            };
            factory_args.push(value);
        }

        let factory = factory.restore(ctx)?;
        let result: Value = {
            let mut call_args = rquickjs::function::Args::new(ctx.clone(), factory_args.len());
            for arg in factory_args {
                call_args.push_arg(arg)?;
            }
            factory.call_arg(call_args)?
        };

        if !result.is_undefined() {
            return Ok(result);
        }
        // The factory may have replaced module.exports wholesale.
        module_obj.get("exports")
    }
}

/// Resolves `./` and `../` segments of `id` against the directory of the
/// requiring module's id. Absolute (bare) ids pass through.
pub fn resolve_id(id: &str, base: &str) -> String {
    if !id.starts_with("./") && !id.starts_with("../") {
        return id.to_string();
    }

    let mut segments: Vec<&str> = match base.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    for segment in id.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_ids_resolve_against_the_requiring_module() {
        assert_eq!(resolve_id("./c", "a/b"), "a/c");
        assert_eq!(resolve_id("../c", "a/b/d"), "a/c");
        assert_eq!(resolve_id("lib", "a/b"), "lib");
        assert_eq!(resolve_id("./c", "top"), "c");
    }

    #[test]
    fn define_and_require_round_trip() {
        let rt = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&rt).unwrap();
        let amd = AmdModules::new();

        context.with(|ctx| {
            amd.install(&ctx).unwrap();
            ctx.eval::<(), _>(
                r#"
                define("math/add", ["exports"], function (exports) {
                    exports.add = function (a, b) { return a + b; };
                });
                define("main", ["require"], function (require) {
                    const math = require("./math/add");
                    return { six: math.add(2, 4) };
                });
                "#,
            )
            .unwrap();

            let exports = amd.require(&ctx, "main").unwrap();
            let six: i32 = exports.as_object().unwrap().get("six").unwrap();
            assert_eq!(six, 6);
        });
    }

    #[test]
    fn missing_modules_are_an_error() {
        let rt = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&rt).unwrap();
        let amd = AmdModules::new();

        context.with(|ctx| {
            amd.install(&ctx).unwrap();
            assert!(amd.require(&ctx, "nope").is_err());
        });
    }
}
