//! Native reflection registry for the quickbind bridge.
//!
//! The registry owns every [`TypeDescriptor`] and the global symbol list the
//! binding commit walks. Host code registers its types, functions, values and
//! namespaces through the builders in [`builder`]; the bridge only ever reads
//! the result. The whole structure is owned by the host thread and lives for
//! the rest of the process once binding has been committed.

mod array;
pub mod builder;
mod function;
mod types;

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem::{align_of, size_of};
use std::rc::Rc;

pub use array::{array_dtor, array_repr_layout, HostArray};
pub use function::{
    copy_ctor, ctor0, ctor1, ctor2, describe, dtor, method0, method1, method2, wrap0, wrap1,
    wrap2, wrap3, wrap4, DocsBuilder, FunctionDocs, NativeFunction, ParamDocs, RawFn,
};
pub use types::{
    same_type, Argument, BaseClass, EnumField, Property, PropFlags, Signature, StaticAddr,
    TypeDescriptor, TypeFlags, TypeRef,
};

use crate::builder::{EnumBuilder, NamespaceBuilder, TypeBuilder};

#[derive(Debug, thiserror::Error)]
pub enum ReflectError {
    #[error("type '{0}' is already registered")]
    DuplicateType(String),
    #[error("symbol '{0}' is already registered")]
    DuplicateSymbol(String),
}

/// One top-level (or namespace-level) symbol.
#[derive(Clone)]
pub enum Symbol {
    Namespace(Rc<Namespace>),
    Function(Rc<NativeFunction>),
    Type(TypeRef),
    Value(Rc<ValueBinding>),
}

impl Symbol {
    pub fn name(&self) -> &str {
        match self {
            Symbol::Namespace(ns) => ns.name(),
            Symbol::Function(f) => f.name(),
            Symbol::Type(t) => t.name(),
            Symbol::Value(v) => &v.name,
        }
    }
}

/// A named static host variable exposed to scripts.
pub struct ValueBinding {
    pub name: String,
    pub ty: TypeRef,
    pub addr: StaticAddr,
}

/// A named group of symbols, exposed to scripts as a built-in module whose
/// id equals the namespace name.
pub struct Namespace {
    name: String,
    symbols: RefCell<Vec<Symbol>>,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.symbols.borrow().clone()
    }

    pub(crate) fn push(&self, symbol: Symbol) {
        self.symbols.borrow_mut().push(symbol);
    }
}

struct Builtins {
    void: TypeRef,
    boolean: TypeRef,
    i8: TypeRef,
    i16: TypeRef,
    i32: TypeRef,
    i64: TypeRef,
    u8: TypeRef,
    u16: TypeRef,
    u32: TypeRef,
    u64: TypeRef,
    f32: TypeRef,
    f64: TypeRef,
    string: TypeRef,
}

/// The reflection registry: every registered type plus the global symbol
/// walk order.
pub struct Registry {
    named: RefCell<HashMap<String, TypeRef>>,
    types: RefCell<Vec<TypeRef>>,
    globals: RefCell<Vec<Symbol>>,
    builtins: Builtins,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates a registry pre-populated with the built-in primitive types
    /// and the host string type.
    pub fn new() -> Self {
        let trivial = TypeFlags::TRIVIAL_CTOR | TypeFlags::TRIVIAL_DTOR;
        let prim = TypeFlags::PRIMITIVE | trivial;
        let int = prim | TypeFlags::INTEGRAL;
        let uint = int | TypeFlags::UNSIGNED;
        let float = prim | TypeFlags::FLOAT;

        let builtins = Builtins {
            void: TypeDescriptor::new("void", 0, 1, prim),
            boolean: TypeDescriptor::new("bool", 1, 1, uint),
            i8: TypeDescriptor::new("i8", 1, 1, int),
            i16: TypeDescriptor::new("i16", 2, 2, int),
            i32: TypeDescriptor::new("i32", 4, 4, int),
            i64: TypeDescriptor::new("i64", 8, 8, int),
            u8: TypeDescriptor::new("u8", 1, 1, uint),
            u16: TypeDescriptor::new("u16", 2, 2, uint),
            u32: TypeDescriptor::new("u32", 4, 4, uint),
            u64: TypeDescriptor::new("u64", 8, 8, uint),
            f32: TypeDescriptor::new("f32", 4, 4, float),
            f64: TypeDescriptor::new("f64", 8, 8, float),
            string: TypeDescriptor::new(
                "String",
                size_of::<String>(),
                align_of::<String>(),
                TypeFlags::empty(),
            ),
        };

        let registry = Self {
            named: RefCell::new(HashMap::new()),
            types: RefCell::new(Vec::new()),
            globals: RefCell::new(Vec::new()),
            builtins,
        };

        for ty in [
            &registry.builtins.void,
            &registry.builtins.boolean,
            &registry.builtins.i8,
            &registry.builtins.i16,
            &registry.builtins.i32,
            &registry.builtins.i64,
            &registry.builtins.u8,
            &registry.builtins.u16,
            &registry.builtins.u32,
            &registry.builtins.u64,
            &registry.builtins.f32,
            &registry.builtins.f64,
            &registry.builtins.string,
        ] {
            registry.insert(ty.clone());
        }

        // The host string participates in copy and destroy like any other
        // non-trivial class.
        let string = registry.builtins.string.clone();
        let string_ptr = registry.pointer_to(&string);
        let dtor_sig = registry.function_type(registry.builtins.void.clone(), &[("self", string_ptr.clone())]);
        *string.dtor.borrow_mut() = Some(NativeFunction::new("~String", dtor_sig, dtor::<String>()));
        let copy_sig = registry.function_type(registry.builtins.void.clone(), &[("other", string_ptr)]);
        string
            .ctors
            .borrow_mut()
            .push(NativeFunction::new("String", copy_sig, copy_ctor::<String>()));

        registry
    }

    fn insert(&self, ty: TypeRef) -> TypeRef {
        self.named.borrow_mut().insert(ty.name().to_string(), ty.clone());
        self.types.borrow_mut().push(ty.clone());
        ty
    }

    /// Registers a descriptor, failing on a name collision.
    pub fn add_type(&self, ty: TypeRef) -> Result<TypeRef, ReflectError> {
        if self.named.borrow().contains_key(ty.name()) {
            return Err(ReflectError::DuplicateType(ty.name().to_string()));
        }
        Ok(self.insert(ty))
    }

    pub fn get(&self, name: &str) -> Option<TypeRef> {
        self.named.borrow().get(name).cloned()
    }

    /// Every registered type, in registration order.
    pub fn types(&self) -> Vec<TypeRef> {
        self.types.borrow().clone()
    }

    pub fn void_type(&self) -> TypeRef {
        self.builtins.void.clone()
    }

    pub fn bool_type(&self) -> TypeRef {
        self.builtins.boolean.clone()
    }

    pub fn i8_type(&self) -> TypeRef {
        self.builtins.i8.clone()
    }

    pub fn i16_type(&self) -> TypeRef {
        self.builtins.i16.clone()
    }

    pub fn i32_type(&self) -> TypeRef {
        self.builtins.i32.clone()
    }

    pub fn i64_type(&self) -> TypeRef {
        self.builtins.i64.clone()
    }

    pub fn u8_type(&self) -> TypeRef {
        self.builtins.u8.clone()
    }

    pub fn u16_type(&self) -> TypeRef {
        self.builtins.u16.clone()
    }

    pub fn u32_type(&self) -> TypeRef {
        self.builtins.u32.clone()
    }

    pub fn u64_type(&self) -> TypeRef {
        self.builtins.u64.clone()
    }

    pub fn f32_type(&self) -> TypeRef {
        self.builtins.f32.clone()
    }

    pub fn f64_type(&self) -> TypeRef {
        self.builtins.f64.clone()
    }

    pub fn string_type(&self) -> TypeRef {
        self.builtins.string.clone()
    }

    /// Returns the pointer type to `ty`, creating it on first use.
    pub fn pointer_to(&self, ty: &TypeRef) -> TypeRef {
        let name = format!("{}*", ty.name());
        if let Some(existing) = self.get(&name) {
            return existing;
        }
        let ptr = TypeDescriptor::new(
            name,
            size_of::<*mut u8>(),
            align_of::<*mut u8>(),
            TypeFlags::POINTER | TypeFlags::TRIVIAL_CTOR | TypeFlags::TRIVIAL_DTOR,
        );
        *ptr.pointee.borrow_mut() = Some(ty.clone());
        self.insert(ptr)
    }

    /// Returns the function type with the given return type and named
    /// arguments, creating it on first use. Function types are deduplicated
    /// by signature.
    pub fn function_type(&self, ret: TypeRef, args: &[(&str, TypeRef)]) -> TypeRef {
        let mut name = String::from("fn(");
        for (i, (_, ty)) in args.iter().enumerate() {
            if i > 0 {
                name.push_str(", ");
            }
            name.push_str(ty.name());
        }
        name.push_str(") -> ");
        name.push_str(ret.name());

        if let Some(existing) = self.get(&name) {
            return existing;
        }

        let ty = TypeDescriptor::new(
            name,
            size_of::<*const ()>(),
            align_of::<*const ()>(),
            TypeFlags::FUNCTION | TypeFlags::TRIVIAL_CTOR | TypeFlags::TRIVIAL_DTOR,
        );
        *ty.signature.borrow_mut() = Some(Signature {
            ret,
            args: args
                .iter()
                .map(|(name, ty)| Argument { name: (*name).to_string(), ty: ty.clone() })
                .collect(),
        });
        self.insert(ty)
    }

    /// Returns the array type over `elem`, creating it on first use. The
    /// registered destructor tears the backing store down and runs element
    /// destructors.
    pub fn array_of(&self, elem: &TypeRef) -> TypeRef {
        let name = format!("Array<{}>", elem.name());
        if let Some(existing) = self.get(&name) {
            return existing;
        }
        let (size, align) = array_repr_layout();
        let ty = TypeDescriptor::new(name, size, align, TypeFlags::empty());
        *ty.array_element.borrow_mut() = Some(elem.clone());

        let elem_dtor = if elem.is_trivially_destructible() {
            None
        } else {
            elem.destructor().map(|d| d.raw())
        };
        let arr_ptr = self.pointer_to(&ty);
        let dtor_sig = self.function_type(self.void_type(), &[("self", arr_ptr)]);
        *ty.dtor.borrow_mut() = Some(NativeFunction::new(
            "~Array",
            dtor_sig,
            array_dtor(elem.size(), elem.align(), elem_dtor),
        ));
        self.insert(ty)
    }

    /// An opaque handle type: script-side it is a branded number.
    pub fn opaque_type(&self, name: impl Into<String>, size: usize) -> Result<TypeRef, ReflectError> {
        self.add_type(TypeDescriptor::new(
            name,
            size,
            size.next_power_of_two().clamp(1, align_of::<u64>()),
            TypeFlags::PRIMITIVE
                | TypeFlags::OPAQUE
                | TypeFlags::TRIVIAL_CTOR
                | TypeFlags::TRIVIAL_DTOR,
        ))
    }

    /// Starts a plain-old-data struct registration.
    pub fn struct_type(
        &self,
        name: impl Into<String>,
        size: usize,
        align: usize,
    ) -> Result<TypeBuilder<'_>, ReflectError> {
        let ty = self.add_type(TypeDescriptor::new(
            name,
            size,
            align,
            TypeFlags::TRIVIAL_CTOR | TypeFlags::TRIVIAL_DTOR,
        ))?;
        Ok(TypeBuilder::new(self, ty))
    }

    /// `struct_type` with the layout taken from a host type.
    pub fn struct_of<T>(&self, name: impl Into<String>) -> Result<TypeBuilder<'_>, ReflectError> {
        self.struct_type(name, size_of::<T>(), align_of::<T>())
    }

    /// Starts a non-trivial class registration.
    pub fn class_type(
        &self,
        name: impl Into<String>,
        size: usize,
        align: usize,
    ) -> Result<TypeBuilder<'_>, ReflectError> {
        let ty = self.add_type(TypeDescriptor::new(name, size, align, TypeFlags::empty()))?;
        Ok(TypeBuilder::new(self, ty))
    }

    /// `class_type` with the layout taken from a host type.
    pub fn class_of<T>(&self, name: impl Into<String>) -> Result<TypeBuilder<'_>, ReflectError> {
        self.class_type(name, size_of::<T>(), align_of::<T>())
    }

    /// Starts an enum registration.
    pub fn enum_type(&self, name: impl Into<String>) -> EnumBuilder<'_> {
        EnumBuilder::new(self, name.into())
    }

    /// Starts a namespace registration; the namespace is added to the global
    /// symbol list immediately.
    pub fn namespace(&self, name: impl Into<String>) -> NamespaceBuilder<'_> {
        let ns = Rc::new(Namespace {
            name: name.into(),
            symbols: RefCell::new(Vec::new()),
        });
        self.globals.borrow_mut().push(Symbol::Namespace(ns.clone()));
        NamespaceBuilder::new(self, ns)
    }

    /// Registers a function in the global scope.
    pub fn global_function(
        &self,
        name: impl Into<String>,
        ret: TypeRef,
        args: &[(&str, TypeRef)],
        raw: RawFn,
    ) -> Rc<NativeFunction> {
        let sig = self.function_type(ret, args);
        let func = NativeFunction::new(name, sig, raw);
        self.globals.borrow_mut().push(Symbol::Function(func.clone()));
        func
    }

    /// Registers an already-built data type in the global scope.
    pub fn global_type(&self, ty: &TypeRef) {
        self.globals.borrow_mut().push(Symbol::Type(ty.clone()));
    }

    /// Registers a static host value in the global scope.
    pub fn global_value(&self, name: impl Into<String>, ty: TypeRef, addr: StaticAddr) {
        self.globals.borrow_mut().push(Symbol::Value(Rc::new(ValueBinding {
            name: name.into(),
            ty,
            addr,
        })));
    }

    /// The global symbol walk order consumed by the binding commit.
    pub fn global_symbols(&self) -> Vec<Symbol> {
        self.globals.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let reg = Registry::new();
        assert_eq!(reg.get("i32").unwrap().size(), 4);
        assert!(reg.get("bool").unwrap().flags().contains(TypeFlags::INTEGRAL));
        assert!(reg.string_type().destructor().is_some());
        assert!(reg.string_type().copy_constructor().is_some());
    }

    #[test]
    fn pointer_and_function_types_dedup() {
        let reg = Registry::new();
        let p1 = reg.pointer_to(&reg.i32_type());
        let p2 = reg.pointer_to(&reg.i32_type());
        assert!(same_type(&p1, &p2));
        assert!(same_type(&p1.pointee().unwrap(), &reg.i32_type()));

        let f1 = reg.function_type(reg.i32_type(), &[("x", reg.i32_type())]);
        let f2 = reg.function_type(reg.i32_type(), &[("y", reg.i32_type())]);
        assert!(same_type(&f1, &f2));
    }

    #[test]
    fn duplicate_type_names_are_rejected() {
        let reg = Registry::new();
        reg.opaque_type("Handle", 4).unwrap();
        assert!(matches!(
            reg.opaque_type("Handle", 4),
            Err(ReflectError::DuplicateType(_))
        ));
    }

    #[test]
    fn array_types_carry_their_element() {
        let reg = Registry::new();
        let arr = reg.array_of(&reg.string_type());
        assert!(same_type(&arr.array_element().unwrap(), &reg.string_type()));
        assert!(arr.destructor().is_some());
    }
}
