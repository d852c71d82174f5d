//! Registration builders. Host code describes its types and namespaces
//! through these; the descriptors they produce are what the binding commit
//! later walks.

use std::rc::Rc;

use crate::function::{copy_ctor, dtor, NativeFunction, RawFn};
use crate::types::{
    BaseClass, EnumField, Property, PropFlags, StaticAddr, TypeFlags, TypeRef,
};
use crate::{Namespace, Registry, Symbol, ValueBinding};

/// Builder over an already-registered class or struct descriptor.
pub struct TypeBuilder<'r> {
    reg: &'r Registry,
    ty: TypeRef,
}

impl<'r> TypeBuilder<'r> {
    pub(crate) fn new(reg: &'r Registry, ty: TypeRef) -> Self {
        Self { reg, ty }
    }

    pub fn ty(&self) -> TypeRef {
        self.ty.clone()
    }

    /// Adds a readable and writable instance field at `offset`.
    pub fn field(&mut self, name: impl Into<String>, ty: &TypeRef, offset: usize) -> &mut Self {
        self.push_field(name, ty, offset, PropFlags::READ | PropFlags::WRITE)
    }

    /// Adds a read-only instance field at `offset`.
    pub fn readonly_field(
        &mut self,
        name: impl Into<String>,
        ty: &TypeRef,
        offset: usize,
    ) -> &mut Self {
        self.push_field(name, ty, offset, PropFlags::READ)
    }

    fn push_field(
        &mut self,
        name: impl Into<String>,
        ty: &TypeRef,
        offset: usize,
        flags: PropFlags,
    ) -> &mut Self {
        self.ty.props.borrow_mut().push(Rc::new(Property {
            name: name.into(),
            offset: Some(offset),
            ty: ty.clone(),
            flags,
            this_offset: 0,
            address: None,
            func: None,
        }));
        self
    }

    /// Adds a static field bound to a host address. The storage must outlive
    /// the registry.
    pub fn static_field(
        &mut self,
        name: impl Into<String>,
        ty: &TypeRef,
        addr: *mut u8,
    ) -> &mut Self {
        self.ty.props.borrow_mut().push(Rc::new(Property {
            name: name.into(),
            offset: None,
            ty: ty.clone(),
            flags: PropFlags::READ | PropFlags::WRITE | PropFlags::STATIC,
            this_offset: 0,
            address: Some(StaticAddr(addr)),
            func: None,
        }));
        self
    }

    /// Adds an instance method. The raw callable receives `this` through the
    /// first argument slot.
    pub fn method(
        &mut self,
        name: impl Into<String>,
        ret: TypeRef,
        args: &[(&str, TypeRef)],
        raw: RawFn,
    ) -> Rc<NativeFunction> {
        self.method_at(name, ret, args, raw, 0)
    }

    /// `method` with an explicit up-cast adjustment for `this`, used when the
    /// bound function belongs to a base class at a non-zero offset.
    pub fn method_at(
        &mut self,
        name: impl Into<String>,
        ret: TypeRef,
        args: &[(&str, TypeRef)],
        raw: RawFn,
        this_offset: usize,
    ) -> Rc<NativeFunction> {
        let name = name.into();
        let sig = self.reg.function_type(ret, args);
        let func = NativeFunction::new(name.clone(), sig, raw);
        self.ty.props.borrow_mut().push(Rc::new(Property {
            name,
            offset: None,
            ty: func.signature_type().clone(),
            flags: PropFlags::READ | PropFlags::METHOD,
            this_offset,
            address: None,
            func: Some(func.clone()),
        }));
        func
    }

    /// Adds a static method.
    pub fn static_method(
        &mut self,
        name: impl Into<String>,
        ret: TypeRef,
        args: &[(&str, TypeRef)],
        raw: RawFn,
    ) -> Rc<NativeFunction> {
        let name = name.into();
        let sig = self.reg.function_type(ret, args);
        let func = NativeFunction::new(name.clone(), sig, raw);
        self.ty.props.borrow_mut().push(Rc::new(Property {
            name,
            offset: None,
            ty: func.signature_type().clone(),
            flags: PropFlags::READ | PropFlags::METHOD | PropFlags::STATIC,
            this_offset: 0,
            address: None,
            func: Some(func.clone()),
        }));
        func
    }

    /// Adds a constructor overload; `args` lists the explicit arguments only.
    pub fn ctor(&mut self, args: &[(&str, TypeRef)], raw: RawFn) -> Rc<NativeFunction> {
        let sig = self.reg.function_type(self.reg.void_type(), args);
        let func = NativeFunction::new("constructor", sig, raw);
        self.ty.ctors.borrow_mut().push(func.clone());
        func
    }

    /// Registers the canonical copy constructor for a `Clone` host type.
    pub fn cloneable<T: Clone + 'static>(&mut self) -> &mut Self {
        let self_ptr = self.reg.pointer_to(&self.ty);
        self.ctor(&[("other", self_ptr)], copy_ctor::<T>());
        self
    }

    /// Registers the destructor for a host type.
    pub fn destructible<T: 'static>(&mut self) -> &mut Self {
        self.dtor_raw(dtor::<T>())
    }

    pub fn dtor_raw(&mut self, raw: RawFn) -> &mut Self {
        let self_ptr = self.reg.pointer_to(&self.ty);
        let sig = self.reg.function_type(self.reg.void_type(), &[("self", self_ptr)]);
        *self.ty.dtor.borrow_mut() = Some(NativeFunction::new(
            format!("~{}", self.ty.name()),
            sig,
            raw,
        ));
        self
    }

    /// Records a base class with its up-cast byte offset.
    pub fn base(&mut self, ty: &TypeRef, offset: usize) -> &mut Self {
        self.ty.bases.borrow_mut().push(BaseClass { ty: ty.clone(), offset });
        self
    }

    pub fn finish(&mut self) -> TypeRef {
        self.ty.clone()
    }
}

/// Builder for an enum type. Finishing registers the descriptor.
pub struct EnumBuilder<'r> {
    reg: &'r Registry,
    name: String,
    unsigned: bool,
    fields: Vec<EnumField>,
}

impl<'r> EnumBuilder<'r> {
    pub(crate) fn new(reg: &'r Registry, name: String) -> Self {
        Self { reg, name, unsigned: false, fields: Vec::new() }
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn variant(mut self, name: impl Into<String>, value: i64) -> Self {
        self.fields.push(EnumField { name: name.into(), value });
        self
    }

    pub fn finish(self) -> Result<TypeRef, crate::ReflectError> {
        let mut flags = TypeFlags::PRIMITIVE
            | TypeFlags::INTEGRAL
            | TypeFlags::ENUM
            | TypeFlags::TRIVIAL_CTOR
            | TypeFlags::TRIVIAL_DTOR;
        if self.unsigned {
            flags |= TypeFlags::UNSIGNED;
        }
        let ty = crate::TypeDescriptor::new(self.name, 4, 4, flags);
        *ty.enum_fields.borrow_mut() = self.fields;
        self.reg.add_type(ty)
    }
}

/// Builder appending symbols to a namespace.
pub struct NamespaceBuilder<'r> {
    reg: &'r Registry,
    ns: Rc<Namespace>,
}

impl<'r> NamespaceBuilder<'r> {
    pub(crate) fn new(reg: &'r Registry, ns: Rc<Namespace>) -> Self {
        Self { reg, ns }
    }

    pub fn namespace(&self) -> Rc<Namespace> {
        self.ns.clone()
    }

    /// Registers a function exported by this namespace's module.
    pub fn function(
        &self,
        name: impl Into<String>,
        ret: TypeRef,
        args: &[(&str, TypeRef)],
        raw: RawFn,
    ) -> Rc<NativeFunction> {
        let sig = self.reg.function_type(ret, args);
        let func = NativeFunction::new(name, sig, raw);
        self.ns.push(Symbol::Function(func.clone()));
        func
    }

    /// Exports an already-built data type from this namespace's module.
    pub fn data_type(&self, ty: &TypeRef) -> &Self {
        self.ns.push(Symbol::Type(ty.clone()));
        self
    }

    /// Exports a static host value from this namespace's module.
    pub fn value(&self, name: impl Into<String>, ty: TypeRef, addr: *mut u8) -> &Self {
        self.ns.push(Symbol::Value(Rc::new(ValueBinding {
            name: name.into(),
            ty,
            addr: StaticAddr(addr),
        })));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrap2;
    use std::mem::offset_of;

    #[repr(C)]
    #[derive(Clone)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn struct_registration_records_offsets() {
        let reg = Registry::new();
        let ty = reg
            .struct_of::<Point>("Point")
            .unwrap()
            .field("x", &reg.i32_type(), offset_of!(Point, x))
            .field("y", &reg.i32_type(), offset_of!(Point, y))
            .finish();

        let props = ty.props();
        assert_eq!(props.len(), 2);
        assert_eq!(props[1].offset, Some(4));
        assert!(ty.is_trivially_constructible());
    }

    #[test]
    fn namespace_symbols_keep_registration_order() {
        let reg = Registry::new();
        let ns = reg.namespace("math");
        ns.function(
            "add",
            reg.i32_type(),
            &[("a", reg.i32_type()), ("b", reg.i32_type())],
            wrap2(|a: &i32, b: &i32| a + b),
        );
        let en = reg.enum_type("Mode").variant("Fast", 0).variant("Safe", 1).finish().unwrap();
        ns.data_type(&en);

        let symbols = reg.global_symbols();
        assert_eq!(symbols.len(), 1);
        let Symbol::Namespace(ns) = &symbols[0] else {
            panic!("expected namespace");
        };
        let inner = ns.symbols();
        assert_eq!(inner.len(), 2);
        assert_eq!(inner[0].name(), "add");
        assert_eq!(inner[1].name(), "Mode");
    }

    #[test]
    fn enum_fields_are_ordered() {
        let reg = Registry::new();
        let ty = reg
            .enum_type("Color")
            .variant("Red", 0)
            .variant("Green", 1)
            .variant("Blue", 2)
            .finish()
            .unwrap();
        assert!(ty.is_enum());
        let fields = ty.enum_fields();
        assert_eq!(fields[2].name, "Blue");
        assert_eq!(fields[2].value, 2);
    }
}
