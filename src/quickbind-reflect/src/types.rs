use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::function::NativeFunction;

/// Shared handle to a type descriptor. Descriptors are created once through
/// the [`Registry`](crate::Registry) and live for the rest of the process, so
/// reference cycles between mutually referring types are intentional.
pub type TypeRef = Rc<TypeDescriptor>;

bitflags! {
    /// Meta flags describing the shape of a native type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        const PRIMITIVE      = 1 << 0;
        const INTEGRAL       = 1 << 1;
        const UNSIGNED       = 1 << 2;
        const FLOAT          = 1 << 3;
        const OPAQUE         = 1 << 4;
        const ENUM           = 1 << 5;
        const FUNCTION       = 1 << 6;
        const POINTER        = 1 << 7;
        /// The type can be constructed by zero-filling its storage.
        const TRIVIAL_CTOR   = 1 << 8;
        /// The type needs no destructor call when its storage is released.
        const TRIVIAL_DTOR   = 1 << 9;
    }
}

bitflags! {
    /// Flags carried by a single [`Property`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropFlags: u32 {
        const READ          = 1 << 0;
        const WRITE         = 1 << 1;
        const STATIC        = 1 << 2;
        const METHOD        = 1 << 3;
        const CTOR          = 1 << 4;
        const DTOR          = 1 << 5;
        /// A free function presented as a method; `this` is passed as the
        /// first explicit argument instead of through a member pointer.
        const PSEUDO_METHOD = 1 << 6;
    }
}

/// Address of a static host variable bound to a property or value symbol.
/// The storage must outlive the registry (in practice: leaked or `static`).
#[derive(Clone, Copy)]
pub struct StaticAddr(pub *mut u8);

impl fmt::Debug for StaticAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StaticAddr({:p})", self.0)
    }
}

/// One named member of a type: either an instance field (positive offset),
/// a static field (bound address), or a method (bound function).
pub struct Property {
    pub name: String,
    /// `Some(offset)` for instance fields, `None` for everything else.
    pub offset: Option<usize>,
    pub ty: TypeRef,
    pub flags: PropFlags,
    /// Up-cast adjustment applied to `this` before dispatching the bound
    /// function. Zero for the defining class.
    pub this_offset: usize,
    pub address: Option<StaticAddr>,
    pub func: Option<Rc<NativeFunction>>,
}

impl Property {
    pub fn is_field(&self) -> bool {
        self.offset.is_some()
    }

    pub fn is_method(&self) -> bool {
        self.flags.intersects(PropFlags::METHOD | PropFlags::PSEUDO_METHOD)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(PropFlags::WRITE)
    }
}

/// A base class entry. `offset` is the byte adjustment applied when a pointer
/// to the derived type is viewed as a pointer to the base.
pub struct BaseClass {
    pub ty: TypeRef,
    pub offset: usize,
}

/// A single enumerator of an enum type.
pub struct EnumField {
    pub name: String,
    pub value: i64,
}

/// One argument of a function signature.
#[derive(Clone)]
pub struct Argument {
    pub name: String,
    pub ty: TypeRef,
}

/// The signature carried by a function-type descriptor.
#[derive(Clone)]
pub struct Signature {
    pub ret: TypeRef,
    pub args: Vec<Argument>,
}

/// Description of a single native type as seen by the binding bridge.
///
/// All interior collections use `RefCell` because registration happens
/// incrementally (builders append members after the descriptor exists) while
/// consumers only ever read. The registry, and everything hanging off it, is
/// owned by the host thread.
pub struct TypeDescriptor {
    name: String,
    size: usize,
    align: usize,
    flags: TypeFlags,
    pub(crate) props: RefCell<Vec<Rc<Property>>>,
    pub(crate) bases: RefCell<Vec<BaseClass>>,
    pub(crate) ctors: RefCell<Vec<Rc<NativeFunction>>>,
    pub(crate) dtor: RefCell<Option<Rc<NativeFunction>>>,
    pub(crate) enum_fields: RefCell<Vec<EnumField>>,
    pub(crate) signature: RefCell<Option<Signature>>,
    pub(crate) pointee: RefCell<Option<TypeRef>>,
    pub(crate) array_element: RefCell<Option<TypeRef>>,
    user_data: RefCell<Option<Rc<dyn Any>>>,
}

impl TypeDescriptor {
    pub(crate) fn new(name: impl Into<String>, size: usize, align: usize, flags: TypeFlags) -> TypeRef {
        Rc::new(Self {
            name: name.into(),
            size,
            align: align.max(1),
            flags,
            props: RefCell::new(Vec::new()),
            bases: RefCell::new(Vec::new()),
            ctors: RefCell::new(Vec::new()),
            dtor: RefCell::new(None),
            enum_fields: RefCell::new(Vec::new()),
            signature: RefCell::new(None),
            pointee: RefCell::new(None),
            array_element: RefCell::new(None),
            user_data: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    pub fn is_primitive(&self) -> bool {
        self.flags.contains(TypeFlags::PRIMITIVE)
    }

    pub fn is_pointer(&self) -> bool {
        self.flags.contains(TypeFlags::POINTER)
    }

    pub fn is_function(&self) -> bool {
        self.flags.contains(TypeFlags::FUNCTION)
    }

    pub fn is_enum(&self) -> bool {
        self.flags.contains(TypeFlags::ENUM)
    }

    pub fn is_trivially_constructible(&self) -> bool {
        self.flags.contains(TypeFlags::TRIVIAL_CTOR)
    }

    pub fn is_trivially_destructible(&self) -> bool {
        self.flags.contains(TypeFlags::TRIVIAL_DTOR)
    }

    /// Ordered member list, fields and methods interleaved in declaration
    /// order.
    pub fn props(&self) -> Vec<Rc<Property>> {
        self.props.borrow().clone()
    }

    pub fn bases(&self) -> std::cell::Ref<'_, Vec<BaseClass>> {
        self.bases.borrow()
    }

    /// Byte offset used to view a pointer to this type as a pointer to
    /// `base`, or `None` when `base` is not in the base list.
    pub fn upcast_offset(&self, base: &TypeRef) -> Option<usize> {
        self.bases
            .borrow()
            .iter()
            .find(|b| Rc::ptr_eq(&b.ty, base))
            .map(|b| b.offset)
    }

    pub fn constructors(&self) -> Vec<Rc<NativeFunction>> {
        self.ctors.borrow().clone()
    }

    /// The constructor whose single explicit argument is a pointer to this
    /// type, if one was registered. Used to synthesize copies.
    pub fn copy_constructor(&self) -> Option<Rc<NativeFunction>> {
        self.ctors
            .borrow()
            .iter()
            .find(|c| {
                let sig = c.signature();
                sig.args.len() == 1
                    && sig.args[0].ty.is_pointer()
                    && sig.args[0]
                        .ty
                        .pointee()
                        .is_some_and(|p| std::ptr::eq(Rc::as_ptr(&p), self))
            })
            .cloned()
    }

    pub fn destructor(&self) -> Option<Rc<NativeFunction>> {
        self.dtor.borrow().clone()
    }

    pub fn enum_fields(&self) -> std::cell::Ref<'_, Vec<EnumField>> {
        self.enum_fields.borrow()
    }

    /// The signature of a function-type descriptor. Empty for other kinds.
    pub fn signature(&self) -> Option<Signature> {
        self.signature.borrow().clone()
    }

    /// Destination type of a pointer-type descriptor.
    pub fn pointee(&self) -> Option<TypeRef> {
        self.pointee.borrow().clone()
    }

    /// Element type of an array-type descriptor.
    pub fn array_element(&self) -> Option<TypeRef> {
        self.array_element.borrow().clone()
    }

    /// Installs the bridge-owned slot. The previous value, if any, is
    /// replaced.
    pub fn set_user_data(&self, data: Rc<dyn Any>) {
        *self.user_data.borrow_mut() = Some(data);
    }

    /// Reads the bridge-owned slot back, downcast to the stored type.
    pub fn user_data<T: 'static>(&self) -> Option<Rc<T>> {
        self.user_data
            .borrow()
            .as_ref()
            .and_then(|d| d.clone().downcast::<T>().ok())
    }

    pub fn clear_user_data(&self) {
        *self.user_data.borrow_mut() = None;
    }
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// `true` when both handles refer to the same descriptor.
pub fn same_type(a: &TypeRef, b: &TypeRef) -> bool {
    Rc::ptr_eq(a, b)
}
