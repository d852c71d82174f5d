//! Builds the script-side class surface of a bound non-trivial type:
//! constructor, prototype with accessors and methods, statics and the
//! `destroy` entry point.

use std::rc::Rc;

use quickbind_reflect::{Property, PropFlags, TypeFlags, TypeRef};
use rquickjs::function::Constructor;
use rquickjs::object::Accessor;
use rquickjs::prelude::{Rest, This};
use rquickjs::{Ctx, Exception, Function, IntoJs, Object, Persistent, Value};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::host_objects::wrapper_of;
use crate::bridge::proxies;
use crate::bridge::ScriptClass;

fn js_method<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, This<Value<'js>>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn js_getter<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, This<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn js_setter<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, This<Value<'js>>, Value<'js>) -> rquickjs::Result<()>,
{
    f
}

fn js_static_getter<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>) -> rquickjs::Result<Value<'js>>,
{
    f
}

fn js_static_setter<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Value<'js>) -> rquickjs::Result<()>,
{
    f
}

/// Integer and float widths the accessor fast path handles without going
/// through the marshaller.
#[derive(Clone, Copy)]
enum FastKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

fn fast_kind(ty: &TypeRef) -> Option<FastKind> {
    let flags = ty.flags();
    if flags.contains(TypeFlags::FLOAT) {
        return match ty.size() {
            4 => Some(FastKind::F32),
            8 => Some(FastKind::F64),
            _ => None,
        };
    }
    // Enums and booleans keep marshaller semantics; the fast path is for
    // plain integer storage only.
    if !flags.contains(TypeFlags::INTEGRAL) || flags.contains(TypeFlags::ENUM) || ty.name() == "bool"
    {
        return None;
    }
    let unsigned = flags.contains(TypeFlags::UNSIGNED);
    match (ty.size(), unsigned) {
        (1, false) => Some(FastKind::I8),
        (2, false) => Some(FastKind::I16),
        (4, false) => Some(FastKind::I32),
        (8, false) => Some(FastKind::I64),
        (1, true) => Some(FastKind::U8),
        (2, true) => Some(FastKind::U16),
        (4, true) => Some(FastKind::U32),
        (8, true) => Some(FastKind::U64),
        _ => None,
    }
}

unsafe fn fast_read<'js>(ctx: Ctx<'js>, kind: FastKind, ptr: *const u8) -> Value<'js> {
    let num = unsafe {
        match kind {
            FastKind::I8 => f64::from(ptr.cast::<i8>().read()),
            FastKind::I16 => f64::from(ptr.cast::<i16>().read()),
            FastKind::I32 => f64::from(ptr.cast::<i32>().read()),
            FastKind::I64 => ptr.cast::<i64>().read() as f64,
            FastKind::U8 => f64::from(ptr.cast::<u8>().read()),
            FastKind::U16 => f64::from(ptr.cast::<u16>().read()),
            FastKind::U32 => f64::from(ptr.cast::<u32>().read()),
            FastKind::U64 => ptr.cast::<u64>().read() as f64,
            FastKind::F32 => f64::from(ptr.cast::<f32>().read()),
            FastKind::F64 => ptr.cast::<f64>().read(),
        }
    };
    Value::new_number(ctx, num)
}

unsafe fn fast_write(kind: FastKind, ptr: *mut u8, num: f64) {
    unsafe {
        match kind {
            FastKind::I8 => ptr.cast::<i8>().write(num as i8),
            FastKind::I16 => ptr.cast::<i16>().write(num as i16),
            FastKind::I32 => ptr.cast::<i32>().write(num as i32),
            FastKind::I64 => ptr.cast::<i64>().write(num as i64),
            FastKind::U8 => ptr.cast::<u8>().write(num as u8),
            FastKind::U16 => ptr.cast::<u16>().write(num as u16),
            FastKind::U32 => ptr.cast::<u32>().write(num as u32),
            FastKind::U64 => ptr.cast::<u64>().write(num as u64),
            FastKind::F32 => ptr.cast::<f32>().write(num as f32),
            FastKind::F64 => ptr.cast::<f64>().write(num),
        }
    }
}

/// Builds (or returns the already-built) constructor for a non-trivial
/// class and records the class artifacts in the type's bridge data.
pub fn build_class<'js>(ctx: &Ctx<'js>, ty: &TypeRef) -> rquickjs::Result<Value<'js>> {
    let data = bridge::data(ty);
    if let Some(existing) = data.constructor(ctx)? {
        return Ok(existing);
    }

    let proto = Object::new(ctx.clone())?;

    // Base classes chain through the prototype so inherited members resolve
    // script-side the way they do host-side.
    let first_base = ty.bases().first().map(|b| b.ty.clone());
    if let Some(base) = first_base {
        if !base.is_trivially_constructible() && !base.is_primitive() {
            build_class(ctx, &base)?;
            if let Some(base_proto) = bridge::data(&base).prototype(ctx)? {
                proto.set_prototype(Some(&base_proto))?;
            }
        }
    }

    for prop in ty.props() {
        if let Some(offset) = prop.offset {
            install_instance_field(ctx, &proto, ty, &prop, offset)?;
        } else if prop.is_method() && !prop.flags.contains(PropFlags::STATIC) {
            install_method(ctx, &proto, ty, &prop)?;
        }
    }

    install_destroy(ctx, &proto, ty)?;

    let ctor_ty = ty.clone();
    let ctor = Constructor::new_prototype(
        ctx,
        proto.clone(),
        js_method(move |ctx: Ctx<'_>, _this: This<Value<'_>>, args: Rest<Value<'_>>| {
            proxies::construct(&ctx, &ctor_ty, &args.into_inner())
        }),
    )?;

    let ctor_value = ctor.into_js(ctx)?;
    let Some(ctor_obj) = ctor_value.as_object().cloned() else {
        return Err(Exception::throw_internal(ctx, "constructor is not an object"));
    };

    for prop in ty.props() {
        if !prop.flags.contains(PropFlags::STATIC) {
            continue;
        }
        if prop.is_method() {
            install_static_method(ctx, &ctor_obj, &prop)?;
        } else if let Some(addr) = prop.address {
            install_static_field(ctx, &ctor_obj, &prop, addr.0)?;
        }
    }

    proto.set("constructor", ctor_obj.clone())?;

    *data.class.borrow_mut() = Some(ScriptClass {
        constructor: Persistent::save(ctx, ctor_value.clone()),
        prototype: Persistent::save(ctx, proto),
    });

    Ok(ctor_value)
}

fn install_instance_field<'js>(
    ctx: &Ctx<'js>,
    proto: &Object<'js>,
    owner: &TypeRef,
    prop: &Rc<Property>,
    offset: usize,
) -> rquickjs::Result<()> {
    let fast = fast_kind(&prop.ty);

    let get_owner = owner.clone();
    let get_prop = prop.clone();
    let getter = js_getter(move |ctx: Ctx<'_>, this: This<Value<'_>>| {
        let base = proxies::method_receiver(&ctx, &get_owner, &this.0, 0)?;
        let field = unsafe { base.add(offset) };
        if let Some(kind) = fast {
            return Ok(unsafe { fast_read(ctx.clone(), kind, field) });
        }
        let m = bridge::marshaller(&ctx, &get_prop.ty)?;
        let mut cx = CallContext::new(ctx.clone());
        m.to_script(&mut cx, field, false, false)
    });

    if prop.writable() {
        let set_owner = owner.clone();
        let set_prop = prop.clone();
        let setter = js_setter(move |ctx: Ctx<'_>, this: This<Value<'_>>, value: Value<'_>| {
            let base = proxies::method_receiver(&ctx, &set_owner, &this.0, 0)?;
            let field = unsafe { base.add(offset) };
            if let Some(kind) = fast {
                let Some(num) = value.as_number() else {
                    return Err(Exception::throw_type(&ctx, "value is not a number"));
                };
                unsafe { fast_write(kind, field, if num.is_nan() { 0.0 } else { num }) };
                return Ok(());
            }
            let m = bridge::marshaller(&ctx, &set_prop.ty)?;
            let mut cx = CallContext::new(ctx.clone());
            cx.set_next_allocation(field);
            m.from_script(&mut cx, value)?;
            Ok(())
        });
        proto.prop(prop.name.as_str(), Accessor::from(getter).set(setter).enumerable())?;
    } else {
        proto.prop(prop.name.as_str(), Accessor::from(getter).enumerable())?;
    }
    Ok(())
}

fn install_method<'js>(
    ctx: &Ctx<'js>,
    proto: &Object<'js>,
    owner: &TypeRef,
    prop: &Rc<Property>,
) -> rquickjs::Result<()> {
    let Some(func) = prop.func.clone() else {
        return Ok(());
    };
    let owner = owner.clone();
    let this_offset = prop.this_offset;
    let pseudo = prop.flags.contains(PropFlags::PSEUDO_METHOD);
    let is_async = func.is_async();

    let body = js_method(move |ctx: Ctx<'_>, this: This<Value<'_>>, args: Rest<Value<'_>>| {
        if pseudo {
            // The receiver travels as the first explicit argument.
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(this.0.clone());
            full.extend(args.into_inner());
            return if is_async {
                proxies::call_async(&ctx, &func, None, &full)
            } else {
                proxies::call_sync(&ctx, &func, None, &full)
            };
        }
        let recv = proxies::method_receiver(&ctx, &owner, &this.0, this_offset)?;
        if is_async {
            proxies::call_async(&ctx, &func, Some(recv), &args.into_inner())
        } else {
            proxies::call_sync(&ctx, &func, Some(recv), &args.into_inner())
        }
    });

    let f = Function::new(ctx.clone(), body)?.with_name(prop.name.as_str())?;
    proto.set(prop.name.as_str(), f)?;
    Ok(())
}

fn install_static_method<'js>(
    ctx: &Ctx<'js>,
    ctor: &Object<'js>,
    prop: &Rc<Property>,
) -> rquickjs::Result<()> {
    let Some(func) = prop.func.clone() else {
        return Ok(());
    };
    let is_async = func.is_async();
    let body = js_method(move |ctx: Ctx<'_>, _this: This<Value<'_>>, args: Rest<Value<'_>>| {
        if is_async {
            proxies::call_async(&ctx, &func, None, &args.into_inner())
        } else {
            proxies::call_sync(&ctx, &func, None, &args.into_inner())
        }
    });
    let f = Function::new(ctx.clone(), body)?.with_name(prop.name.as_str())?;
    ctor.set(prop.name.as_str(), f)?;
    Ok(())
}

fn install_static_field<'js>(
    ctx: &Ctx<'js>,
    ctor: &Object<'js>,
    prop: &Rc<Property>,
    addr: *mut u8,
) -> rquickjs::Result<()> {
    let addr = addr as usize;

    let get_prop = prop.clone();
    let getter = js_static_getter(move |ctx: Ctx<'_>| {
        let m = bridge::marshaller(&ctx, &get_prop.ty)?;
        let mut cx = CallContext::new(ctx.clone());
        m.to_script(&mut cx, addr as *mut u8, false, false)
    });

    if prop.writable() {
        let set_prop = prop.clone();
        let setter = js_static_setter(move |ctx: Ctx<'_>, value: Value<'_>| {
            let m = bridge::marshaller(&ctx, &set_prop.ty)?;
            let mut cx = CallContext::new(ctx.clone());
            cx.set_next_allocation(addr as *mut u8);
            m.from_script(&mut cx, value)?;
            Ok(())
        });
        ctor.prop(prop.name.as_str(), Accessor::from(getter).set(setter).enumerable())?;
    } else {
        ctor.prop(prop.name.as_str(), Accessor::from(getter).enumerable())?;
    }
    Ok(())
}

fn install_destroy<'js>(ctx: &Ctx<'js>, proto: &Object<'js>, ty: &TypeRef) -> rquickjs::Result<()> {
    let ty = ty.clone();
    let body = js_method(move |ctx: Ctx<'_>, this: This<Value<'_>>, _args: Rest<Value<'_>>| {
        let name = bridge::script_name(&ty);
        let Some(wrapper) = wrapper_of(&this.0) else {
            return Err(Exception::throw_type(
                &ctx,
                &format!("'this' is not an object of type '{name}'"),
            ));
        };
        let payload = wrapper.borrow();
        if payload.is_externally_owned() {
            return Err(Exception::throw_type(
                &ctx,
                &format!("cannot destroy externally managed object of type '{name}'"),
            ));
        }
        if payload.is_destroyed() {
            return Err(Exception::throw_type(
                &ctx,
                &format!("object of type '{name}' has already been destroyed"),
            ));
        }
        let Some(manager) = payload.manager().or_else(|| bridge::manager_of(&ty)) else {
            return Err(Exception::throw_type(
                &ctx,
                &format!("no host object manager found for type '{name}'"),
            ));
        };

        // Tombstone first so re-entrant uses fail cleanly, then release.
        let ptr = payload.ptr();
        payload.mark_destroyed();
        manager.free(ptr);
        Ok(Value::new_undefined(ctx.clone()))
    });
    let f = Function::new(ctx.clone(), body)?.with_name("destroy")?;
    proto.set("destroy", f)?;
    Ok(())
}
