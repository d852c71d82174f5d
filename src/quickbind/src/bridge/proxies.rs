//! Call dispatch: synchronous and asynchronous proxies for free functions
//! and methods, and the constructor proxy with overload resolution.

use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::rc::Rc;

use quickbind_reflect::{NativeFunction, RawFn, TypeRef};
use rquickjs::promise::Promise;
use rquickjs::{Ctx, Exception, Function, IntoJs, Persistent, Value};
use tracing::error;

use crate::bridge;
use crate::bridge::call_context::{CallArena, CallContext};
use crate::bridge::callbacks;
use crate::bridge::host_objects::{instantiate_wrapper, wrapper_of, HostObjectManager};
use crate::pool::Job;

/// Converts every script argument into raw storage owned by `cx`.
fn convert_args<'js>(
    cx: &mut CallContext<'js>,
    target: &NativeFunction,
    this_ptr: Option<*mut u8>,
    this_slot: &mut *mut u8,
    args: &[Value<'js>],
) -> rquickjs::Result<Vec<*mut u8>> {
    let ctx = cx.ctx.clone();
    let sig = target.signature();
    if sig.args.len() != args.len() {
        return Err(Exception::throw_range(&ctx, "invalid number of arguments"));
    }

    let mut raw_args = Vec::with_capacity(args.len() + 1);
    if let Some(this) = this_ptr {
        *this_slot = this;
        raw_args.push((this_slot as *mut *mut u8).cast::<u8>());
    }
    for (arg, value) in sig.args.iter().zip(args.iter().cloned()) {
        let m = bridge::marshaller(&ctx, &arg.ty)?;
        raw_args.push(m.from_script(cx, value)?);
    }
    Ok(raw_args)
}

/// Allocates the return slot: pooled for managed types, arena otherwise.
fn return_slot<'js>(
    cx: &mut CallContext<'js>,
    ret_ty: &TypeRef,
    manager: Option<&Rc<HostObjectManager>>,
) -> *mut u8 {
    if ret_ty.size() == 0 {
        return ptr::null_mut();
    }
    match manager {
        Some(manager) => manager.preemptive_alloc(),
        None => cx.alloc(ret_ty),
    }
}

/// Converts a finished native call's return value and, for managed types,
/// binds the fresh wrapper to its block.
fn deliver_return<'js>(
    cx: &mut CallContext<'js>,
    ret_ty: &TypeRef,
    ret_ptr: *mut u8,
    manager: Option<&Rc<HostObjectManager>>,
) -> rquickjs::Result<Value<'js>> {
    let ctx = cx.ctx.clone();
    if ret_ty.size() == 0 {
        return Ok(Value::new_undefined(ctx));
    }
    let needs_copy = manager.is_none() && !ret_ty.is_pointer();
    let m = bridge::marshaller(&ctx, ret_ty)?;
    let value = m.to_script(cx, ret_ptr, needs_copy, true)?;
    if let Some(manager) = manager {
        match value.as_object() {
            Some(obj) => manager.assign_target(ret_ptr, obj),
            None => error!(
                ty = ret_ty.name(),
                "managed return did not convert to an object"
            ),
        }
    }
    Ok(value)
}

/// Synchronous dispatch for free functions (`this_ptr` = None) and methods.
pub fn call_sync<'js>(
    ctx: &Ctx<'js>,
    target: &NativeFunction,
    this_ptr: Option<*mut u8>,
    args: &[Value<'js>],
) -> rquickjs::Result<Value<'js>> {
    let sig = target.signature();
    let ret_ty = sig.ret.clone();
    let manager = bridge::manager_of(&ret_ty);

    let mut cx = CallContext::new(ctx.clone());
    let mut this_slot: *mut u8 = ptr::null_mut();
    let raw_args = match convert_args(&mut cx, target, this_ptr, &mut this_slot, args) {
        Ok(raw) => raw,
        Err(e) => return Err(e),
    };

    let ret_ptr = return_slot(&mut cx, &ret_ty, manager.as_ref());

    target.call(ret_ptr, &raw_args);

    if let Some(message) = callbacks::take_pending_error() {
        if let Some(manager) = &manager {
            manager.abandon(ret_ptr);
        }
        return Err(Exception::throw_message(ctx, &message));
    }

    deliver_return(&mut cx, &ret_ty, ret_ptr, manager.as_ref())
}

/// Asynchronous dispatch: arguments convert on the host thread, the native
/// call runs on a worker, and the returned promise settles during the
/// completion drain.
pub fn call_async<'js>(
    ctx: &Ctx<'js>,
    target: &NativeFunction,
    this_ptr: Option<*mut u8>,
    args: &[Value<'js>],
) -> rquickjs::Result<Value<'js>> {
    let sig = target.signature();
    let ret_ty = sig.ret.clone();
    let manager = bridge::manager_of(&ret_ty);

    let mut cx = CallContext::new(ctx.clone());
    let mut this_box: Box<*mut u8> = Box::new(ptr::null_mut());
    let raw_args = convert_args(&mut cx, target, this_ptr, &mut *this_box, args)?;
    let ret_ptr = return_slot(&mut cx, &ret_ty, manager.as_ref());

    let (promise, resolve, reject) = Promise::new(ctx)?;

    let job = AsyncCallJob {
        raw: target.raw(),
        raw_args,
        ret_ptr,
        failure: None,
        arena: cx.into_arena(),
        _this_slot: this_box,
        ret_ty,
        manager,
        resolve: Persistent::save(ctx, resolve),
        reject: Persistent::save(ctx, reject),
    };

    crate::runtime_pool(ctx)?.submit(Box::new(job));

    promise.into_js(ctx)
}

/// One asynchronous native call in flight.
///
/// `run` happens on a worker thread and touches only the raw callable, the
/// argument storage and the failure slot. Every other field is host-thread
/// state, used exclusively from `after_complete` on the thread that built
/// the job.
struct AsyncCallJob {
    raw: RawFn,
    raw_args: Vec<*mut u8>,
    ret_ptr: *mut u8,
    failure: Option<String>,

    // Host-thread state from here on.
    arena: CallArena,
    _this_slot: Box<*mut u8>,
    ret_ty: TypeRef,
    manager: Option<Rc<HostObjectManager>>,
    resolve: Persistent<Function<'static>>,
    reject: Persistent<Function<'static>>,
}

// SAFETY: the job crosses to a worker thread once, runs `run()` there, and
// comes back to the thread that created it for `after_complete()`. The
// worker only touches `raw`, `raw_args`, `ret_ptr` and `failure`; the
// `Rc`/`Persistent`/arena fields are never accessed off the host thread.
unsafe impl Send for AsyncCallJob {}

impl Job for AsyncCallJob {
    fn run(&mut self) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            (self.raw)(self.ret_ptr, &self.raw_args);
        }));
        if let Err(payload) = result {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "native call failed".to_string()
            };
            self.failure = Some(message);
        }
    }

    fn after_complete(self: Box<Self>, ctx: &Ctx<'_>) {
        let job = *self;
        let AsyncCallJob {
            arena,
            ret_ty,
            manager,
            resolve,
            reject,
            ret_ptr,
            failure,
            ..
        } = job;

        let mut cx = CallContext::resume(ctx.clone(), arena);

        let settled: rquickjs::Result<()> = (|| {
            if let Some(message) = failure {
                if let Some(manager) = &manager {
                    manager.abandon(ret_ptr);
                }
                let reason = Exception::from_message(ctx.clone(), &message)?;
                reject.clone().restore(ctx)?.call::<_, ()>((reason,))?;
                return Ok(());
            }

            match deliver_return(&mut cx, &ret_ty, ret_ptr, manager.as_ref()) {
                Ok(value) => resolve.clone().restore(ctx)?.call::<_, ()>((value,))?,
                Err(err) => {
                    let reason: Value = match err {
                        rquickjs::Error::Exception => ctx.catch(),
                        other => Exception::from_message(ctx.clone(), &other.to_string())?
                            .into_js(ctx)?,
                    };
                    reject.clone().restore(ctx)?.call::<_, ()>((reason,))?;
                }
            }
            Ok(())
        })();

        if let Err(err) = settled {
            error!(?err, "failed to settle an async call promise");
        }
    }
}

/// The constructor proxy: deterministic overload resolution on arity plus
/// per-argument `can_accept`; ambiguity is a hard error.
pub fn construct<'js>(
    ctx: &Ctx<'js>,
    ty: &TypeRef,
    args: &[Value<'js>],
) -> rquickjs::Result<Value<'js>> {
    let name = bridge::script_name(ty);
    let Some(manager) = bridge::manager_of(ty) else {
        return Err(Exception::throw_type(
            ctx,
            &format!("no host object manager found for type '{name}'"),
        ));
    };

    let ctors = ty.constructors();
    if ctors.is_empty() {
        return Err(Exception::throw_type(
            ctx,
            &format!("no constructor found for type '{name}'"),
        ));
    }

    let mut selected: Option<Rc<NativeFunction>> = None;
    for ctor in &ctors {
        let sig = ctor.signature();
        if sig.args.len() != args.len() {
            continue;
        }
        let accepted = sig.args.iter().zip(args.iter()).all(|(arg, value)| {
            bridge::data(&arg.ty)
                .marshaller
                .borrow()
                .as_ref()
                .is_some_and(|m| m.can_accept(value))
        });
        if !accepted {
            continue;
        }
        if selected.is_some() {
            return Err(Exception::throw_type(
                ctx,
                &format!(
                    "more than one constructor of type '{name}' accepts the provided arguments"
                ),
            ));
        }
        selected = Some(ctor.clone());
    }
    let Some(ctor) = selected else {
        return Err(Exception::throw_type(
            ctx,
            &format!("no constructor of type '{name}' accepts the provided arguments"),
        ));
    };

    // Convert the arguments before any block exists so a conversion failure
    // has nothing to unwind.
    let mut cx = CallContext::new(ctx.clone());
    let mut this_slot: *mut u8 = ptr::null_mut();
    let raw_args = convert_args(&mut cx, &ctor, Some(ptr::null_mut()), &mut this_slot, args)?;

    let obj = instantiate_wrapper(ctx, ty, ptr::null_mut(), false)?;
    let block = manager.alloc(&obj);
    this_slot = block;

    ctor.call(ptr::null_mut(), &raw_args);

    if let Some(message) = callbacks::take_pending_error() {
        return Err(Exception::throw_message(ctx, &message));
    }

    obj.into_js(ctx)
}

/// Reads the dispatch pointer out of a method call's `this`, rejecting
/// destroyed and foreign receivers.
pub fn method_receiver<'js>(
    ctx: &Ctx<'js>,
    ty: &TypeRef,
    this: &Value<'js>,
    this_offset: usize,
) -> rquickjs::Result<*mut u8> {
    let Some(wrapper) = wrapper_of(this) else {
        return Err(Exception::throw_type(
            ctx,
            &format!("'this' is not an object of type '{}'", bridge::script_name(ty)),
        ));
    };
    let payload = wrapper.borrow();
    if payload.is_destroyed() {
        return Err(Exception::throw_type(
            ctx,
            &format!("object of type '{}' has been destroyed", bridge::script_name(ty)),
        ));
    }
    Ok(unsafe { payload.ptr().add(this_offset) })
}
