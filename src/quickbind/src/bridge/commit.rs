//! The binding commit: the one-shot phase that walks the registry, installs
//! marshallers and script-visible bindings, and emits the declaration files.
//! Runs once, before any script executes.

use std::path::Path;
use std::rc::Rc;

use quickbind_reflect::{NativeFunction, Registry, Symbol, TypeRef, ValueBinding};
use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Function, Object, Value};
use tracing::{debug, instrument};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::host_objects::HostObjectManager;
use crate::bridge::marshal;
use crate::bridge::prototype;
use crate::bridge::proxies;
use crate::bridge::declgen;
use crate::modules::amd::AmdModules;
use crate::modules::process;

fn js_fn<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

/// Builds the script function dispatching to a bound native function,
/// synchronously or through the worker pool per its documentation.
pub fn bind_function<'js>(
    ctx: &Ctx<'js>,
    func: Rc<NativeFunction>,
) -> rquickjs::Result<Function<'js>> {
    let is_async = func.is_async();
    let name = func.name().to_string();
    let body = js_fn(move |ctx: Ctx<'_>, args: Rest<Value<'_>>| {
        if is_async {
            proxies::call_async(&ctx, &func, None, &args.into_inner())
        } else {
            proxies::call_sync(&ctx, &func, None, &args.into_inner())
        }
    });
    Function::new(ctx.clone(), body)?.with_name(&name)
}

fn bind_value<'js>(ctx: &Ctx<'js>, value: &ValueBinding) -> rquickjs::Result<Value<'js>> {
    let m = bridge::marshaller(ctx, &value.ty)?;
    let mut cx = CallContext::new(ctx.clone());
    m.to_script(&mut cx, value.addr.0, false, false)
}

/// Runtime artifact of a data type: enums become frozen-ish field objects,
/// non-trivial classes become constructors. Trivial structs and primitives
/// have no runtime value.
fn bind_data_type<'js>(ctx: &Ctx<'js>, ty: &TypeRef) -> rquickjs::Result<Option<Value<'js>>> {
    if ty.is_enum() {
        let obj = Object::new(ctx.clone())?;
        for field in ty.enum_fields().iter() {
            obj.set(field.name.as_str(), Value::new_number(ctx.clone(), field.value as f64))?;
        }
        return Ok(Some(obj.into_value()));
    }

    if ty.is_primitive()
        || ty.is_pointer()
        || ty.is_function()
        || ty.is_trivially_constructible()
        || ty.array_element().is_some()
    {
        return Ok(None);
    }

    let data = bridge::data(ty);
    if data.manager.borrow().is_none() {
        *data.manager.borrow_mut() = Some(HostObjectManager::new(ty.clone()));
    }
    let ctor = prototype::build_class(ctx, ty)?;
    Ok(Some(ctor))
}

fn bind_namespace<'js>(
    ctx: &Ctx<'js>,
    amd: &AmdModules,
    ns: &quickbind_reflect::Namespace,
) -> rquickjs::Result<()> {
    debug!(name = ns.name(), "binding namespace as built-in module");
    let exports = Object::new(ctx.clone())?;

    for symbol in ns.symbols() {
        match symbol {
            Symbol::Function(func) => {
                exports.set(func.name(), bind_function(ctx, func.clone())?)?;
            }
            Symbol::Type(ty) => {
                if let Some(value) = bind_data_type(ctx, &ty)? {
                    exports.set(bridge::script_name(&ty).as_str(), value)?;
                }
            }
            Symbol::Value(value) => {
                exports.set(value.name.as_str(), bind_value(ctx, &value)?)?;
            }
            Symbol::Namespace(_) => {
                // One level of namespaces maps onto modules; anything deeper
                // is not part of the data model.
            }
        }
    }

    if ns.name() == "process" {
        process::populate_env(ctx, &exports)?;
    }

    amd.register_builtin(ctx, ns.name(), exports.into_value());
    Ok(())
}

/// Numeric limit constants installed on the global scope.
fn install_intrinsics(ctx: &Ctx<'_>) -> rquickjs::Result<()> {
    let globals = ctx.globals();
    let constants: &[(&str, f64)] = &[
        ("I8_MIN", f64::from(i8::MIN)),
        ("I8_MAX", f64::from(i8::MAX)),
        ("I16_MIN", f64::from(i16::MIN)),
        ("I16_MAX", f64::from(i16::MAX)),
        ("I32_MIN", f64::from(i32::MIN)),
        ("I32_MAX", f64::from(i32::MAX)),
        ("I64_MIN", i64::MIN as f64),
        ("I64_MAX", i64::MAX as f64),
        ("U8_MAX", f64::from(u8::MAX)),
        ("U16_MAX", f64::from(u16::MAX)),
        ("U32_MAX", f64::from(u32::MAX)),
        ("U64_MAX", u64::MAX as f64),
        ("F32_MIN", f64::from(f32::MIN)),
        ("F32_MAX", f64::from(f32::MAX)),
        ("F64_MIN", f64::MIN),
        ("F64_MAX", f64::MAX),
    ];
    for (name, value) in constants {
        globals.set(*name, *value)?;
    }
    Ok(())
}

/// Walks the registry and installs every binding. `script_root`, when
/// given, receives the generated declaration files.
/// The host string type converts as a plain script string; set up manually
/// so the generic installer leaves it alone.
fn bind_host_string(registry: &Registry) {
    let string_ty = registry.string_type();
    let data = bridge::data(&string_ty);
    if data.marshaller.borrow().is_none() {
        *data.marshaller.borrow_mut() =
            Some(Rc::new(marshal::StringMarshaller::new(string_ty.clone())));
        *data.ts_name.borrow_mut() = Some(String::from("string"));
    }
}

#[instrument(skip_all)]
pub fn commit(
    ctx: &Ctx<'_>,
    registry: &Registry,
    amd: &AmdModules,
    script_root: Option<&Path>,
) -> rquickjs::Result<()> {
    // Phase 1: every type gets its marshaller.
    bind_host_string(registry);
    marshal::install(registry);

    // Phase 2: symbol walk.
    let globals = ctx.globals();
    for symbol in registry.global_symbols() {
        match symbol {
            Symbol::Namespace(ns) => bind_namespace(ctx, amd, &ns)?,
            Symbol::Function(func) => {
                globals.set(func.name(), bind_function(ctx, func.clone())?)?;
            }
            Symbol::Type(ty) => {
                if let Some(value) = bind_data_type(ctx, &ty)? {
                    globals.set(bridge::script_name(&ty).as_str(), value)?;
                }
            }
            Symbol::Value(value) => {
                globals.set(value.name.as_str(), bind_value(ctx, &value)?)?;
            }
        }
    }

    // Phase 3: intrinsics. Timer globals are wired by the runtime itself.
    install_intrinsics(ctx)?;

    // Phase 4: declaration emission.
    if let Some(root) = script_root {
        declgen::emit(registry, root);
    }

    Ok(())
}
