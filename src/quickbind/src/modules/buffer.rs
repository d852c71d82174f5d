//! The `DataBuffer` builtin: a host byte buffer that scripts see as a plain
//! `ArrayBuffer`. The byte-buffer marshaller is installed as a manual
//! override, so the binding commit leaves the type alone.

use std::rc::Rc;

use quickbind_reflect::{Registry, TypeRef};

use crate::bridge;
use crate::bridge::marshal::{ByteBufferMarshaller, DataBuffer};

pub use crate::bridge::marshal::DataBuffer as HostDataBuffer;

pub fn register(registry: &Registry) -> TypeRef {
    let ty = registry
        .class_of::<DataBuffer>("DataBuffer")
        .expect("DataBuffer registered twice")
        .cloneable::<DataBuffer>()
        .destructible::<DataBuffer>()
        .finish();

    let data = bridge::data(&ty);
    *data.marshaller.borrow_mut() = Some(Rc::new(ByteBufferMarshaller::new(ty.clone())));
    *data.ts_name.borrow_mut() = Some(String::from("ArrayBuffer"));

    ty
}
