use quickbind_reflect::TypeRef;
use rquickjs::{Exception, Object, Value};

use crate::bridge;
use crate::bridge::call_context::CallContext;
use crate::bridge::marshal::Marshal;

/// Plain-old-data structs, recognised by their positive-offset properties.
/// Script-bound conversion builds a plain object field by field; host-bound
/// conversion writes every field directly into the destination storage
/// through the allocation-target override, zero-filling missing fields.
pub struct TrivialStructMarshaller {
    ty: TypeRef,
}

impl TrivialStructMarshaller {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty }
    }
}

impl Marshal for TrivialStructMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        let Some(obj) = value.as_object() else {
            return false;
        };
        for prop in self.ty.props() {
            let Some(_) = prop.offset else { continue };
            let Ok(field) = obj.get::<_, Value>(prop.name.as_str()) else {
                continue;
            };
            if field.is_undefined() || field.is_null() {
                continue;
            }
            let accepted = bridge::data(&prop.ty)
                .marshaller
                .borrow()
                .as_ref()
                .is_some_and(|m| m.can_accept(&field));
            if !accepted {
                return false;
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
        let obj = Object::new(ctx.clone())?;
        for prop in self.ty.props() {
            let Some(offset) = prop.offset else { continue };
            let m = bridge::marshaller(&ctx, &prop.ty)?;
            let field = m.to_script(cx, unsafe { ptr.add(offset) }, needs_copy, is_host_return)?;
            obj.set(prop.name.as_str(), field)?;
        }
        Ok(obj.into_value())
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        let data = cx.alloc(&self.ty);
        unsafe { std::ptr::write_bytes(data, 0, self.ty.size()) };

        let Some(obj) = value.as_object() else {
            return Err(Exception::throw_type(&ctx, "value is not an object"));
        };

        for prop in self.ty.props() {
            let Some(offset) = prop.offset else { continue };
            let field: Value = obj.get(prop.name.as_str())?;
            if field.is_undefined() || field.is_null() {
                // Stays zero-filled.
                continue;
            }
            let m = bridge::marshaller(&ctx, &prop.ty)?;
            cx.set_next_allocation(unsafe { data.add(offset) });
            let result = m.from_script(cx, field);
            cx.arena.clear_next_allocation();
            result?;
        }

        Ok(data)
    }
}
