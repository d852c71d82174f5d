//! Value marshalling between host storage and script values.
//!
//! One marshaller instance exists per registered type, installed during the
//! binding commit and addressed through the type's bridge data — the bridge
//! never branches on type identity outside the prototype builder's fast
//! path.

mod array;
mod buffer;
mod function;
mod object;
mod pointer;
mod primitive;
mod string;
mod trivial;

use std::rc::Rc;

use quickbind_reflect::{same_type, Registry, TypeRef};
use rquickjs::Value;

pub use array::ArrayMarshaller;
pub use buffer::{ByteBufferMarshaller, DataBuffer};
pub use function::FunctionMarshaller;
pub use object::NonTrivialMarshaller;
pub use pointer::PointerMarshaller;
pub use primitive::PrimitiveMarshaller;
pub use string::StringMarshaller;
pub use trivial::TrivialStructMarshaller;

use crate::bridge;
use crate::bridge::call_context::CallContext;

/// Bidirectional conversion for one type.
///
/// `to_script` reads host storage; `needs_copy` asks for a value that stays
/// valid after the call, `is_host_return` marks a value produced by native
/// code for this call. `from_script` returns a pointer to storage holding
/// the converted value, owned by the call context unless an allocation
/// target redirected it.
///
/// Errors raised here are script exceptions; call proxies abort native
/// dispatch when any argument conversion fails.
pub trait Marshal {
    fn can_accept(&self, value: &Value<'_>) -> bool;

    fn to_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        ptr: *mut u8,
        needs_copy: bool,
        is_host_return: bool,
    ) -> rquickjs::Result<Value<'js>>;

    fn from_script<'js>(
        &self,
        cx: &mut CallContext<'js>,
        value: Value<'js>,
    ) -> rquickjs::Result<*mut u8>;
}

/// Installs a marshaller on every registered type that does not already have
/// one. Kind selection: array element, then primitive (enums and opaques
/// included), then function, then pointer, then trivial struct, then
/// non-trivial object.
pub fn install(registry: &Registry) {
    for ty in registry.types() {
        let data = bridge::data(&ty);
        if data.marshaller.borrow().is_some() {
            // Was set up manually (host string, byte buffers).
            continue;
        }

        let marshaller: Rc<dyn Marshal> = if let Some(elem) = ty.array_element() {
            Rc::new(ArrayMarshaller::new(ty.clone(), elem))
        } else if ty.is_primitive() {
            let is_bool = same_type(&ty, &registry.bool_type());
            Rc::new(PrimitiveMarshaller::new(ty.clone(), is_bool))
        } else if ty.is_function() {
            Rc::new(FunctionMarshaller::new(ty.clone()))
        } else if ty.is_pointer() {
            Rc::new(PointerMarshaller::new(ty.clone()))
        } else if ty.is_trivially_constructible() {
            Rc::new(TrivialStructMarshaller::new(ty.clone()))
        } else {
            Rc::new(NonTrivialMarshaller::new(ty.clone()))
        };

        *data.marshaller.borrow_mut() = Some(marshaller);
    }
}
