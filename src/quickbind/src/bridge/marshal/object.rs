use std::ptr;
use std::rc::Rc;

use quickbind_reflect::{same_type, TypeRef};
use rquickjs::{Exception, IntoJs, Value};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::host_objects::{instantiate_wrapper, wrapper_of, HostObjectManager};
use crate::bridge::marshal::Marshal;

/// Managed, non-trivial classes. Script side these are wrapper objects whose
/// payload carries the host pointer, the type descriptor and the ownership
/// flag; conversion preserves wrapper identity while the host pointer stays
/// mapped.
pub struct NonTrivialMarshaller {
    ty: TypeRef,
}

impl NonTrivialMarshaller {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty }
    }

    fn manager<'js>(&self, cx: &CallContext<'js>) -> rquickjs::Result<Rc<HostObjectManager>> {
        bridge::manager_of(&self.ty).ok_or_else(|| {
            Exception::throw_type(
                &cx.ctx,
                &format!(
                    "unable to convert object of type '{}': no host object manager",
                    self.ty.name()
                ),
            )
        })
    }

    fn copy_construct<'js>(
        &self,
        cx: &CallContext<'js>,
        dest: *mut u8,
        src: *mut u8,
    ) -> rquickjs::Result<()> {
        let Some(copy_ctor) = self.ty.copy_constructor() else {
            return Err(Exception::throw_type(
                &cx.ctx,
                &format!(
                    "object of type '{}' needs a copy and has no copy constructor",
                    self.ty.name()
                ),
            ));
        };
        let mut dest_slot = dest;
        let mut src_slot = src;
        copy_ctor.call(
            ptr::null_mut(),
            &[
                (&mut dest_slot as *mut *mut u8).cast::<u8>(),
                (&mut src_slot as *mut *mut u8).cast::<u8>(),
            ],
        );
        Ok(())
    }
}

impl Marshal for NonTrivialMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        let Some(wrapper) = wrapper_of(value) else {
            return false;
        };
        let payload = wrapper.borrow();
        if payload.is_destroyed() {
            return false;
        }
        same_type(payload.ty(), &self.ty) || payload.ty().upcast_offset(&self.ty).is_some()
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        needs_copy: bool,
        is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let ctx = cx.ctx.clone();
        let manager = self.manager(cx)?;

        if let Some(existing) = manager.get_target_if_mapped(&ctx, ptr) {
            return existing.into_js(&ctx);
        }

        if needs_copy && is_host_return {
            // The value lives in call-scoped storage; move it into a pooled
            // block the wrapper can own.
            let copy = manager.preemptive_alloc();
            self.copy_construct(cx, copy, ptr)?;
            let obj = instantiate_wrapper(&ctx, &self.ty, copy, true)?;
            manager.assign_target(copy, &obj);
            return obj.into_js(&ctx);
        }

        // The pointer outlives the call on the host side; wrap it in place
        // without taking ownership.
        instantiate_wrapper(&ctx, &self.ty, ptr, true)?.into_js(&ctx)
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        let Some(wrapper) = wrapper_of(&value) else {
            return Err(Exception::throw_type(
                &ctx,
                &format!("expected an object of type '{}'", bridge::script_name(&self.ty)),
            ));
        };
        let payload = wrapper.borrow();

        let upcast = if same_type(payload.ty(), &self.ty) {
            0
        } else {
            match payload.ty().upcast_offset(&self.ty) {
                Some(offset) => offset,
                None => {
                    return Err(Exception::throw_type(
                        &ctx,
                        &format!(
                            "provided object is of type '{}', expected '{}' or a type deriving from it",
                            payload.ty().name(),
                            self.ty.name()
                        ),
                    ));
                }
            }
        };

        if payload.is_destroyed() {
            return Err(Exception::throw_type(
                &ctx,
                &format!("object of type '{}' has been destroyed", self.ty.name()),
            ));
        }

        let obj_ptr = unsafe { payload.ptr().add(upcast) };

        if cx.has_allocation_target() {
            // Writing into an enclosing struct field or array element:
            // synthesize a copy at the target.
            let dest = cx.alloc(&self.ty);
            self.copy_construct(cx, dest, obj_ptr)?;
            return Ok(dest);
        }

        Ok(obj_ptr)
    }
}
