use std::cell::{Ref, RefCell};
use std::mem::size_of;
use std::ptr;
use std::rc::Rc;
use std::sync::Arc;

use crate::types::{Signature, TypeRef};

/// The raw calling convention every bound native entry point is adapted to.
///
/// `ret` points at the return-value storage (null when the return type has
/// zero size). Every `args[i]` points at the storage of argument *i*; for
/// pointer-valued arguments, including an implicit `this`, that storage holds
/// the pointer value itself.
///
/// The callable must be `Send + Sync` because asynchronous call proxies
/// invoke it from a worker thread. It must only touch the storage it is
/// given.
pub type RawFn = Arc<dyn Fn(*mut u8, &[*mut u8]) + Send + Sync>;

/// Documentation attached to a bound function. Drives declaration emission
/// and asynchronous dispatch.
#[derive(Default, Clone)]
pub struct FunctionDocs {
    pub description: String,
    pub returns: String,
    pub params: Vec<ParamDocs>,
    pub is_async: bool,
}

#[derive(Clone)]
pub struct ParamDocs {
    pub index: usize,
    pub name: String,
    pub description: String,
}

/// A native function bound into the registry: a name, a function-type
/// descriptor and the raw callable.
pub struct NativeFunction {
    name: String,
    signature_type: TypeRef,
    raw: RawFn,
    docs: RefCell<FunctionDocs>,
}

impl NativeFunction {
    pub fn new(name: impl Into<String>, signature_type: TypeRef, raw: RawFn) -> Rc<Self> {
        debug_assert!(signature_type.is_function());
        Rc::new(Self {
            name: name.into(),
            signature_type,
            raw,
            docs: RefCell::new(FunctionDocs::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The function-type descriptor this function was registered with.
    pub fn signature_type(&self) -> &TypeRef {
        &self.signature_type
    }

    /// The resolved signature. Registration guarantees the descriptor
    /// carries one.
    pub fn signature(&self) -> Signature {
        self.signature_type
            .signature()
            .unwrap_or_else(|| Signature {
                ret: self.signature_type.clone(),
                args: Vec::new(),
            })
    }

    /// Invokes the native code with raw argument pointers.
    pub fn call(&self, ret: *mut u8, args: &[*mut u8]) {
        (self.raw)(ret, args)
    }

    /// The raw callable, shared so a job can carry it to a worker thread
    /// without dragging the descriptor along.
    pub fn raw(&self) -> RawFn {
        self.raw.clone()
    }

    pub fn docs(&self) -> Ref<'_, FunctionDocs> {
        self.docs.borrow()
    }

    pub fn is_async(&self) -> bool {
        self.docs.borrow().is_async
    }
}

/// Fluent documentation builder, used at registration sites:
///
/// ```ignore
/// describe(&func).desc("Reads a file").param(0, "path", "File path").returns("The bytes");
/// ```
pub struct DocsBuilder<'a> {
    func: &'a NativeFunction,
}

pub fn describe(func: &Rc<NativeFunction>) -> DocsBuilder<'_> {
    DocsBuilder { func }
}

impl DocsBuilder<'_> {
    pub fn desc(self, description: impl Into<String>) -> Self {
        self.func.docs.borrow_mut().description = description.into();
        self
    }

    pub fn param(self, index: usize, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.func.docs.borrow_mut().params.push(ParamDocs {
            index,
            name: name.into(),
            description: description.into(),
        });
        self
    }

    pub fn returns(self, description: impl Into<String>) -> Self {
        self.func.docs.borrow_mut().returns = description.into();
        self
    }

    /// Marks the function for asynchronous dispatch through the worker pool.
    pub fn asynchronous(self) -> Self {
        self.func.docs.borrow_mut().is_async = true;
        self
    }
}

#[inline]
unsafe fn arg_ref<'a, T>(args: &[*mut u8], index: usize) -> &'a T {
    unsafe { &*args[index].cast_const().cast::<T>() }
}

#[inline]
unsafe fn this_ptr<T>(args: &[*mut u8]) -> *mut T {
    // The `this` slot stores the pointer value, like any pointer argument.
    unsafe { *args[0].cast::<*mut T>() }
}

#[inline]
unsafe fn write_ret<R>(ret: *mut u8, value: R) {
    if size_of::<R>() != 0 && !ret.is_null() {
        unsafe { ptr::write(ret.cast::<R>(), value) };
    }
}

/// Adapters from typed Rust functions to the raw calling convention.
///
/// Free functions borrow their arguments (`fn(&A, &B) -> R`); the argument
/// storage is owned by the caller's call context, so moving out of it would
/// double-drop.
pub fn wrap0<R: 'static>(f: impl Fn() -> R + Send + Sync + 'static) -> RawFn {
    Arc::new(move |ret, _args| unsafe { write_ret(ret, f()) })
}

pub fn wrap1<A: 'static, R: 'static>(f: impl Fn(&A) -> R + Send + Sync + 'static) -> RawFn {
    Arc::new(move |ret, args| unsafe { write_ret(ret, f(arg_ref(args, 0))) })
}

pub fn wrap2<A: 'static, B: 'static, R: 'static>(
    f: impl Fn(&A, &B) -> R + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |ret, args| unsafe { write_ret(ret, f(arg_ref(args, 0), arg_ref(args, 1))) })
}

pub fn wrap3<A: 'static, B: 'static, C: 'static, R: 'static>(
    f: impl Fn(&A, &B, &C) -> R + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |ret, args| unsafe {
        write_ret(ret, f(arg_ref(args, 0), arg_ref(args, 1), arg_ref(args, 2)))
    })
}

pub fn wrap4<A: 'static, B: 'static, C: 'static, D: 'static, R: 'static>(
    f: impl Fn(&A, &B, &C, &D) -> R + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |ret, args| unsafe {
        write_ret(
            ret,
            f(
                arg_ref(args, 0),
                arg_ref(args, 1),
                arg_ref(args, 2),
                arg_ref(args, 3),
            ),
        )
    })
}

/// Method adapters: `args[0]` is the `this` pointer slot, explicit arguments
/// follow.
pub fn method0<T: 'static, R: 'static>(
    f: impl Fn(&mut T) -> R + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |ret, args| unsafe { write_ret(ret, f(&mut *this_ptr::<T>(args))) })
}

pub fn method1<T: 'static, A: 'static, R: 'static>(
    f: impl Fn(&mut T, &A) -> R + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |ret, args| unsafe {
        write_ret(ret, f(&mut *this_ptr::<T>(args), arg_ref(args, 1)))
    })
}

pub fn method2<T: 'static, A: 'static, B: 'static, R: 'static>(
    f: impl Fn(&mut T, &A, &B) -> R + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |ret, args| unsafe {
        write_ret(
            ret,
            f(&mut *this_ptr::<T>(args), arg_ref(args, 1), arg_ref(args, 2)),
        )
    })
}

/// Constructor adapters: `args[0]` is a pointer to uninitialised storage of
/// the constructed type.
pub fn ctor0<T: 'static>(f: impl Fn() -> T + Send + Sync + 'static) -> RawFn {
    Arc::new(move |_ret, args| unsafe { ptr::write(this_ptr::<T>(args), f()) })
}

pub fn ctor1<T: 'static, A: 'static>(f: impl Fn(&A) -> T + Send + Sync + 'static) -> RawFn {
    Arc::new(move |_ret, args| unsafe { ptr::write(this_ptr::<T>(args), f(arg_ref(args, 1))) })
}

pub fn ctor2<T: 'static, A: 'static, B: 'static>(
    f: impl Fn(&A, &B) -> T + Send + Sync + 'static,
) -> RawFn {
    Arc::new(move |_ret, args| unsafe {
        ptr::write(this_ptr::<T>(args), f(arg_ref(args, 1), arg_ref(args, 2)))
    })
}

/// Destructor adapter: drops the value in place without freeing its storage.
pub fn dtor<T: 'static>() -> RawFn {
    Arc::new(move |_ret, args| unsafe { ptr::drop_in_place(this_ptr::<T>(args)) })
}

/// Copy-constructor adapter for `Clone` host types; `args[1]` holds a pointer
/// to the source value.
pub fn copy_ctor<T: Clone + 'static>() -> RawFn {
    Arc::new(move |_ret, args| unsafe {
        let src = *args[1].cast::<*const T>();
        ptr::write(this_ptr::<T>(args), (*src).clone());
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_reads_args_and_writes_ret() {
        let raw = wrap2(|a: &i32, b: &i32| a + b);
        let a = 3i32;
        let b = 4i32;
        let mut out = 0i32;
        raw(
            (&mut out as *mut i32).cast(),
            &[
                (&a as *const i32).cast_mut().cast(),
                (&b as *const i32).cast_mut().cast(),
            ],
        );
        assert_eq!(out, 7);
    }

    #[test]
    fn ctor_and_dtor_round_trip() {
        let raw_ctor = ctor1(|s: &String| s.clone());
        let raw_dtor = dtor::<String>();

        let mut storage = std::mem::MaybeUninit::<String>::uninit();
        let mut this: *mut u8 = storage.as_mut_ptr().cast();
        let this_slot = (&mut this as *mut *mut u8).cast::<u8>();
        let src = String::from("hello");
        let src_slot = (&src as *const String).cast_mut().cast::<u8>();

        raw_ctor(ptr::null_mut(), &[this_slot, src_slot]);
        assert_eq!(unsafe { &*storage.as_ptr() }, "hello");
        raw_dtor(ptr::null_mut(), &[this_slot]);
    }
}
