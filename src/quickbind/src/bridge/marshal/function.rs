use std::ffi::c_void;

use quickbind_reflect::TypeRef;
use rquickjs::prelude::Rest;
use rquickjs::{Ctx, Exception, Function, Value};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::callbacks;
use crate::bridge::marshal::Marshal;

/// Function-typed values.
///
/// Host-bound: the script function is registered with the callback registry
/// and the resulting trampoline address is the converted value; the call
/// context holds the reference until the call ends, so native code wanting
/// to keep the pointer must `add_ref` it.
///
/// Script-bound: a native function pointer becomes a script function that
/// marshals its arguments and dispatches through the pointer.
pub struct FunctionMarshaller {
    ty: TypeRef,
}

impl FunctionMarshaller {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty }
    }
}

fn coerce_fn<F>(f: F) -> F
where
    F: for<'js> Fn(Ctx<'js>, Rest<Value<'js>>) -> rquickjs::Result<Value<'js>>,
{
    f
}

impl Marshal for FunctionMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        value.is_function()
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        _needs_copy: bool,
        _is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let ctx = cx.ctx.clone();
        let fn_ptr = unsafe { ptr.cast::<*const c_void>().read() };
        if fn_ptr.is_null() {
            return Ok(Value::new_null(ctx));
        }

        let sig_ty = self.ty.clone();
        let fn_addr = fn_ptr as usize;
        let proxy = coerce_fn(move |ctx: Ctx<'_>, script_args: Rest<Value<'_>>| {
            let sig = sig_ty
                .signature()
                .ok_or_else(|| Exception::throw_internal(&ctx, "function type lost its signature"))?;
            if sig.args.len() != script_args.len() {
                return Err(Exception::throw_range(&ctx, "invalid number of arguments"));
            }

            let mut cx = CallContext::new(ctx.clone());
            let mut raw_args: Vec<*mut u8> = Vec::with_capacity(sig.args.len());
            for (arg, value) in sig.args.iter().zip(script_args.into_inner()) {
                let m = bridge::marshaller(&ctx, &arg.ty)?;
                raw_args.push(m.from_script(&mut cx, value)?);
            }

            // Registers can widen small integral returns; keep the slot
            // aligned for any primitive width.
            let ret_ty = sig.ret.clone();
            let mut ret_buf = vec![0u64; ret_ty.size().div_ceil(8).max(1)];
            let ret_ptr = if ret_ty.size() > 0 {
                ret_buf.as_mut_ptr().cast::<u8>()
            } else {
                std::ptr::null_mut()
            };

            let called = unsafe {
                callbacks::call_indirect(&sig, fn_addr as *const c_void, ret_ptr, &raw_args)
            };
            if called.is_err() {
                return Err(Exception::throw_type(
                    &ctx,
                    "function signature cannot cross the native boundary",
                ));
            }
            if let Some(message) = callbacks::take_pending_error() {
                return Err(Exception::throw_message(&ctx, &message));
            }

            if ret_ty.size() == 0 {
                return Ok(Value::new_undefined(ctx));
            }
            let m = bridge::marshaller(&ctx, &ret_ty)?;
            m.to_script(&mut cx, ret_buf.as_mut_ptr().cast::<u8>(), true, true)
        });

        let func = Function::new(ctx.clone(), proxy)?;
        Ok(func.into_value())
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        let Some(func) = value.as_function() else {
            return Err(Exception::throw_type(&ctx, "value is not a function"));
        };

        let context = crate::runtime_context(&ctx)?;
        let Some(trampoline) = callbacks::create(&ctx, context, &self.ty, func.clone()) else {
            return Err(Exception::throw_type(
                &ctx,
                &format!("unable to create a native closure for '{}'", self.ty.name()),
            ));
        };

        cx.arena.add_callback(trampoline);
        let data = cx.alloc(&self.ty);
        unsafe { data.cast::<*const c_void>().write(trampoline) };
        Ok(data)
    }
}
