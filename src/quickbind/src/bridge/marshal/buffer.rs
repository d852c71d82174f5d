use quickbind_reflect::TypeRef;
use rquickjs::{ArrayBuffer, Exception, FromJs, IntoJs, Value};

use crate::bridge::call_context::CallContext;
use crate::bridge::marshal::Marshal;

/// Host-side byte buffer bound to script `ArrayBuffer`s. Conversion copies
/// in both directions; scripts never alias host memory.
#[derive(Default, Clone)]
pub struct DataBuffer {
    bytes: Vec<u8>,
}

impl DataBuffer {
    pub fn new(size: usize) -> Self {
        Self { bytes: vec![0; size] }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Marshaller for [`DataBuffer`], installed manually when the builtin
/// registers the type.
pub struct ByteBufferMarshaller {
    ty: TypeRef,
}

impl ByteBufferMarshaller {
    pub fn new(ty: TypeRef) -> Self {
        Self { ty }
    }
}

impl Marshal for ByteBufferMarshaller {
    fn can_accept(&self, value: &Value<'_>) -> bool {
        value.is_object() && ArrayBuffer::from_js(value.ctx(), value.clone()).is_ok()
    }

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        _needs_copy: bool,
        _is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>> {
        let buffer = unsafe { &*ptr.cast::<DataBuffer>() };
        ArrayBuffer::new(cx.ctx.clone(), buffer.data().to_vec())?.into_js(&cx.ctx)
    }

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8> {
        let ctx = cx.ctx.clone();
        let data = cx.alloc(&self.ty);
        unsafe { std::ptr::write(data.cast::<DataBuffer>(), DataBuffer::default()) };

        let buffer = ArrayBuffer::from_js(&ctx, value)
            .map_err(|_| Exception::throw_type(&ctx, "value is not an ArrayBuffer"))?;
        let Some(bytes) = buffer.as_bytes() else {
            return Err(Exception::throw_type(&ctx, "ArrayBuffer is detached"));
        };
        unsafe { *data.cast::<DataBuffer>() = DataBuffer::from_bytes(bytes.to_vec()) };
        Ok(data)
    }
}
