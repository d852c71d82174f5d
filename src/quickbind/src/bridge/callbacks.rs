//! Reverse trampolines: script functions exposed to native code as callable
//! function pointers.
//!
//! Each record pairs a persistent script function with an executable libffi
//! closure whose address is unique while the record lives. Records are
//! refcounted: call contexts hold one reference for the duration of a call,
//! native code that stores the pointer takes its own with [`add_ref`].
//!
//! The registry is host-thread state (a trampoline re-enters the engine), so
//! it lives in a thread local, mirroring the rest of the single-threaded
//! cooperative model.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;
use std::mem;
use std::ptr;

use libffi::low;
use quickbind_reflect::{Signature, TypeFlags, TypeRef};
use rquickjs::function::Args;
use rquickjs::{Ctx, Exception, Function, Persistent, Value};
use tracing::error;

use crate::bridge;
use crate::bridge::call_context::CallContext;

thread_local! {
    static REGISTRY: RefCell<HashMap<usize, Box<CallbackRecord>>> = RefCell::new(HashMap::new());
    /// Script exceptions raised inside a trampoline cannot unwind through
    /// the native caller; they park here until the innermost active call
    /// proxy picks them up.
    static PENDING_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Owns the libffi call interface data referenced by a prepared closure or
/// an indirect call. The boxes keep every `ffi_type` at a stable address.
struct CifHolder {
    cif: low::ffi_cif,
    ret: *mut low::ffi_type,
    args: Vec<*mut low::ffi_type>,
    // Struct descriptors referenced from `ret`/`args`; the element arrays
    // are null-terminated as libffi requires.
    structs: Vec<Box<StructType>>,
}

struct StructType {
    ty: low::ffi_type,
    #[allow(dead_code)]
    elements: Vec<*mut low::ffi_type>,
}

/// Maps a type descriptor onto a libffi type. Returns `None` for layouts a
/// native calling convention cannot carry by value.
fn ffi_type_of(ty: &TypeRef, structs: &mut Vec<Box<StructType>>) -> Option<*mut low::ffi_type> {
    let flags = ty.flags();
    if ty.size() == 0 {
        return Some(&raw mut low::types::void);
    }
    if flags.contains(TypeFlags::POINTER) || flags.contains(TypeFlags::FUNCTION) {
        return Some(&raw mut low::types::pointer);
    }
    if flags.contains(TypeFlags::FLOAT) {
        return match ty.size() {
            4 => Some(&raw mut low::types::float),
            8 => Some(&raw mut low::types::double),
            _ => None,
        };
    }
    if flags.intersects(TypeFlags::INTEGRAL | TypeFlags::OPAQUE) {
        let unsigned = flags.intersects(TypeFlags::UNSIGNED | TypeFlags::OPAQUE);
        return match (ty.size(), unsigned) {
            (1, true) => Some(&raw mut low::types::uint8),
            (1, false) => Some(&raw mut low::types::sint8),
            (2, true) => Some(&raw mut low::types::uint16),
            (2, false) => Some(&raw mut low::types::sint16),
            (4, true) => Some(&raw mut low::types::uint32),
            (4, false) => Some(&raw mut low::types::sint32),
            (8, true) => Some(&raw mut low::types::uint64),
            (8, false) => Some(&raw mut low::types::sint64),
            _ => None,
        };
    }
    if ty.is_trivially_constructible() {
        // A POD struct: describe each field so libffi reproduces the layout.
        let props = ty.props();
        let mut elements = Vec::new();
        for prop in &props {
            if prop.offset.is_some() {
                elements.push(ffi_type_of(&prop.ty, structs)?);
            }
        }
        if elements.is_empty() {
            return None;
        }
        elements.push(ptr::null_mut());
        let mut boxed = Box::new(StructType {
            ty: low::ffi_type {
                size: 0,
                alignment: 0,
                type_: low::type_tag::STRUCT,
                elements: ptr::null_mut(),
            },
            elements,
        });
        boxed.ty.elements = boxed.elements.as_mut_ptr();
        let ty_ptr = &raw mut boxed.ty;
        structs.push(boxed);
        return Some(ty_ptr);
    }
    None
}

impl CifHolder {
    fn new(sig: &Signature) -> Option<Box<Self>> {
        let mut structs = Vec::new();
        let ret = ffi_type_of(&sig.ret, &mut structs)?;
        let args = sig
            .args
            .iter()
            .map(|a| ffi_type_of(&a.ty, &mut structs))
            .collect::<Option<Vec<_>>>()?;

        let mut holder = Box::new(CifHolder {
            // libffi fills the cif in during prep.
            cif: unsafe { mem::zeroed() },
            ret,
            args,
            structs,
        });
        let nargs = holder.args.len();
        let args_ptr = holder.args.as_mut_ptr();
        let ret_ptr = holder.ret;
        unsafe {
            low::prep_cif(
                &raw mut holder.cif,
                low::ffi_abi_FFI_DEFAULT_ABI,
                nargs,
                ret_ptr,
                args_ptr,
            )
            .ok()?;
        }
        Some(holder)
    }
}

struct CallbackRecord {
    context: rquickjs::Context,
    func: Persistent<Function<'static>>,
    sig_ty: TypeRef,
    refs: Cell<u32>,
    closure: *mut low::ffi_closure,
    code: low::CodePtr,
    #[allow(dead_code)]
    cif: Box<CifHolder>,
}

/// The generic closure entry point. libffi hands us the raw argument area
/// and the return slot; the record arrives as user data.
unsafe extern "C" fn invoke(
    _cif: &low::ffi_cif,
    result: &mut c_void,
    args: *const *const c_void,
    record: &CallbackRecord,
) {
    let outcome = record.context.clone().with(|ctx| -> rquickjs::Result<()> {
        let sig = record
            .sig_ty
            .signature()
            .ok_or_else(|| Exception::throw_internal(&ctx, "callback lost its signature"))?;

        let mut cx = CallContext::new(ctx.clone());

        let mut call_args = Args::new(ctx.clone(), sig.args.len());
        for (i, arg) in sig.args.iter().enumerate() {
            let m = bridge::marshaller(&ctx, &arg.ty)?;
            let raw = unsafe { *args.add(i) } as *mut u8;
            call_args.push_arg(m.to_script(&mut cx, raw, false, false)?)?;
        }

        let func = record.func.clone().restore(&ctx)?;
        let ret: Value = func.call_arg(call_args)?;

        if sig.ret.size() > 0 {
            if ret.is_undefined() {
                return Err(Exception::throw_type(
                    &ctx,
                    "callback did not return a value when one was expected",
                ));
            }
            let ret_slot = (result as *mut c_void).cast::<u8>();
            // libffi widens small integral returns to a full register slot.
            unsafe { ptr::write_bytes(ret_slot, 0, mem::size_of::<usize>().max(sig.ret.size())) };
            let m = bridge::marshaller(&ctx, &sig.ret)?;
            cx.set_next_allocation(ret_slot);
            m.from_script(&mut cx, ret)?;
        }
        Ok(())
    });

    if let Err(err) = outcome {
        let message = record.context.clone().with(|ctx| describe_error(&ctx, err));
        error!(message, "script callback raised");
        PENDING_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
    }
}

fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    match err {
        rquickjs::Error::Exception => {
            let caught = ctx.catch();
            caught
                .as_exception()
                .and_then(|e| e.message())
                .unwrap_or_else(|| "unknown script exception".to_string())
        }
        other => other.to_string(),
    }
}

/// Takes the error a trampoline parked, if any. Call proxies invoke this
/// right after native dispatch returns.
pub fn take_pending_error() -> Option<String> {
    PENDING_ERROR.with(|slot| slot.borrow_mut().take())
}

/// Creates a trampoline for `func` with the given function-type descriptor
/// and returns its callable address. The new record starts with one
/// reference.
pub fn create<'js>(
    ctx: &Ctx<'js>,
    context: rquickjs::Context,
    sig_ty: &TypeRef,
    func: Function<'js>,
) -> Option<*const c_void> {
    let sig = sig_ty.signature()?;
    let cif = CifHolder::new(&sig)?;

    let (closure, code) = low::closure_alloc();
    if closure.is_null() {
        return None;
    }

    let mut record = Box::new(CallbackRecord {
        context,
        func: Persistent::save(ctx, func),
        sig_ty: sig_ty.clone(),
        refs: Cell::new(1),
        closure,
        code,
        cif,
    });

    let cif_ptr = &raw mut record.cif.cif;
    let prepared = unsafe {
        low::prep_closure(
            closure,
            cif_ptr,
            invoke,
            &*record as *const CallbackRecord,
            code,
        )
    };
    if prepared.is_err() {
        unsafe { low::closure_free(closure) };
        return None;
    }

    let addr = code.as_ptr();
    REGISTRY.with(|reg| reg.borrow_mut().insert(addr as usize, record));
    Some(addr)
}

/// Takes an extra reference on the record behind a trampoline address.
pub fn add_ref(trampoline: *const c_void) {
    REGISTRY.with(|reg| match reg.borrow().get(&(trampoline as usize)) {
        Some(record) => record.refs.set(record.refs.get() + 1),
        None => error!("attempted to add a reference to an unbound callback"),
    });
}

/// Releases one reference; the last release frees the closure memory and the
/// script handle.
pub fn release(trampoline: *const c_void) {
    REGISTRY.with(|reg| {
        let mut reg = reg.borrow_mut();
        let Some(record) = reg.get(&(trampoline as usize)) else {
            error!("attempted to release an unbound callback");
            return;
        };
        let refs = record.refs.get() - 1;
        record.refs.set(refs);
        if refs == 0 {
            let record = reg.remove(&(trampoline as usize)).expect("record vanished");
            unsafe { low::closure_free(record.closure) };
        }
    });
}

/// Number of live callback records, for diagnostics and tests.
pub fn live_count() -> usize {
    REGISTRY.with(|reg| reg.borrow().len())
}

/// Frees every record regardless of reference count. Runs at shutdown,
/// before the engine is torn down.
pub fn destroy_all() {
    REGISTRY.with(|reg| {
        for (_, record) in reg.borrow_mut().drain() {
            unsafe { low::closure_free(record.closure) };
        }
    });
}

/// Calls native code through a raw function pointer of dynamic signature.
/// Used when a function-typed value flows back to the script side and gets
/// invoked.
///
/// # Safety
/// `fn_ptr` must be callable with the given signature; every `args[i]` must
/// point at the storage of argument `i`; `ret` must be valid for at least
/// `max(ret size, register size)` bytes, or null for a void return.
pub unsafe fn call_indirect(
    sig: &Signature,
    fn_ptr: *const c_void,
    ret: *mut u8,
    args: &[*mut u8],
) -> Result<(), ()> {
    let mut cif = CifHolder::new(sig).ok_or(())?;
    let mut avalues: Vec<*mut c_void> = args.iter().map(|p| p.cast::<c_void>()).collect();
    unsafe {
        libffi::raw::ffi_call(
            &raw mut cif.cif,
            Some(mem::transmute::<*const c_void, unsafe extern "C" fn()>(fn_ptr)),
            ret.cast::<c_void>(),
            avalues.as_mut_ptr(),
        );
    }
    Ok(())
}
