use quickbind_reflect::{HostArray, TypeRef};
use rquickjs::{Array, Exception, Value};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::marshal::Marshal;

/// Host arrays of a fixed element type. Elements are addressed as
/// `base + i * sizeof(elem)` and converted through the element type's
/// marshaller; host-bound conversion writes every element straight into the
/// backing store through the allocation-target override.
pub struct ArrayMarshaller {
    ty: TypeRef,
    elem: TypeRef,
}

impl ArrayMarshaller {
    pub fn new(ty: TypeRef, elem: TypeRef) -> Self {
        Self { ty, elem }
    }
}

impl Marshal for ArrayMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        let Some(array) = value.as_array() else {
            return false;
        };
        let Some(elem_m) = bridge::data(&self.elem).marshaller.borrow().clone() else {
            return false;
        };
        for entry in array.iter::<Value>() {
            match entry {
                Ok(v) if elem_m.can_accept(&v) => {}
                _ => return false,
            }
        }
        true
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        needs_copy: bool,
        is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let ctx = cx.ctx.clone();
        let elem_m = bridge::marshaller(&ctx, &self.elem)?;
        let arr = unsafe { &*ptr.cast::<HostArray>() };

        let out = Array::new(ctx.clone())?;
        let elem_size = self.elem.size();
        for i in 0..arr.len() {
            let elem_ptr = unsafe { arr.elem_ptr(i, elem_size) };
            let value = elem_m.to_script(cx, elem_ptr, needs_copy, is_host_return)?;
            out.set(i, value)?;
        }
        Ok(out.into_value())
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        let elem_m = bridge::marshaller(&ctx, &self.elem)?;
        let data = cx.alloc(&self.ty);

        let Some(array) = value.as_array() else {
            unsafe { HostArray::construct_in(data, 0, self.elem.size(), self.elem.align()) };
            return Err(Exception::throw_type(&ctx, "expected an array"));
        };

        let len = array.len();
        let backing =
            unsafe { HostArray::construct_in(data, len, self.elem.size(), self.elem.align()) };

        for i in 0..len {
            let entry = array.get::<Value>(i).map_err(|e| {
                // Only the first `i` elements are live if we bail here.
                unsafe { (*data.cast::<HostArray>()).set_len(i) };
                e
            });
            let entry = entry?;
            cx.set_next_allocation(unsafe { backing.add(i * self.elem.size()) });
            let result = elem_m.from_script(cx, entry);
            cx.arena.clear_next_allocation();
            if let Err(e) = result {
                unsafe { (*data.cast::<HostArray>()).set_len(i) };
                return Err(e);
            }
        }

        Ok(data)
    }
}
