use quickbind_reflect::TypeRef;
use rquickjs::{Exception, Value};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::marshal::Marshal;

/// Pointers to a bound pointee type. Null maps to script `null` in both
/// directions; a non-null pointer dispatches to the pointee's marshaller.
///
/// Pointer returns are never copied: a native function returning a pointer
/// asserts the pointee outlives the call. Scripts holding such a wrapper
/// past the pointee's lifetime are on their own, as documented.
pub struct PointerMarshaller {
    ty: TypeRef,
}

impl PointerMarshaller {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty }
    }

    fn pointee<'js>(&self, cx: &CallContext<'js>) -> rquickjs::Result<TypeRef> {
        self.ty.pointee().ok_or_else(|| {
            Exception::throw_internal(
                &cx.ctx,
                &format!("pointer type '{}' has no destination type", self.ty.name()),
            )
        })
    }
}

impl Marshal for PointerMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        if value.is_null() || value.is_undefined() {
            return true;
        }
        let Some(pointee) = self.ty.pointee() else {
            return false;
        };
        bridge::data(&pointee)
            .marshaller
            .borrow()
            .as_ref()
            .is_some_and(|m| m.can_accept(value))
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        _needs_copy: bool,
        _is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let ctx = cx.ctx.clone();
        let target = unsafe { ptr.cast::<*mut u8>().read() };
        if target.is_null() {
            return Ok(Value::new_null(ctx));
        }
        let pointee = self.pointee(cx)?;
        let m = bridge::marshaller(&ctx, &pointee)?;
        m.to_script(cx, target, false, false)
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let pointee = self.pointee(cx)?;
        let data = cx.alloc(&self.ty);
        if value.is_null() || value.is_undefined() {
            unsafe { data.cast::<*mut u8>().write(std::ptr::null_mut()) };
            return Ok(data);
        }
        let m = bridge::marshaller(&cx.ctx.clone(), &pointee)?;
        let target = m.from_script(cx, value)?;
        unsafe { data.cast::<*mut u8>().write(target) };
        Ok(data)
    }
}
