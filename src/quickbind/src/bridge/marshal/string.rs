use quickbind_reflect::TypeRef;
use rquickjs::{Exception, IntoJs, Value};

use crate::bridge::call_context::CallContext;
use crate::bridge::marshal::Marshal;

/// The host string type (`String`). Script-bound conversion copies the
/// bytes into a fresh script string; host-bound conversion constructs a
/// `String` in the call arena, whose registered destructor drops it.
pub struct StringMarshaller {
    ty: TypeRef,
}

impl StringMarshaller {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty }
    }
}

impl Marshal for StringMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        value.is_string()
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        _needs_copy: bool,
        _is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let s = unsafe { &*ptr.cast::<String>() };
        s.as_str().into_js(&cx.ctx)
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        let data = cx.alloc(&self.ty);
        // Initialise the storage before anything can fail so the arena's
        // destructor pass never sees garbage.
        unsafe { std::ptr::write(data.cast::<String>(), String::new()) };
        let Some(s) = value.as_string() else {
            return Err(Exception::throw_type(&ctx, "value is not a string"));
        };
        let s = s.to_string()?;
        unsafe { *data.cast::<String>() = s };
        Ok(data)
    }
}
