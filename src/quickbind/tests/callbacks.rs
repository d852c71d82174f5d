//! Reverse callbacks: script functions handed to native code as callable
//! function pointers, refcounting, and error propagation.

mod common;

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{eval, eval_err, runtime_with};
use quickbind::bridge::callbacks;
use quickbind_reflect::{wrap2, Registry};

type UnaryFn = extern "C" fn(i32) -> i32;

fn register_apply(reg: &Registry) {
    let i32_ty = reg.i32_type();
    let fn_ty = reg.function_type(i32_ty.clone(), &[("v", i32_ty.clone())]);
    reg.global_function(
        "apply",
        i32_ty.clone(),
        &[("fn", fn_ty), ("v", i32_ty)],
        wrap2(|f: &UnaryFn, v: &i32| f(*v)),
    );
}

#[test]
fn script_functions_become_native_function_pointers() {
    let (runtime, _dir) = runtime_with(register_apply);

    assert_eq!(eval::<f64>(&runtime, "apply(x => x * x, 6)"), 36.0);
    // The call context released the only reference: the closure is gone.
    assert_eq!(callbacks::live_count(), 0);
}

#[test]
fn callback_errors_surface_through_the_calling_proxy() {
    let (runtime, _dir) = runtime_with(register_apply);

    let msg = eval_err(&runtime, r#"apply(() => { throw new Error("inner"); }, 1)"#);
    assert!(msg.contains("inner"), "unexpected: {msg}");
    assert_eq!(callbacks::live_count(), 0);
}

#[test]
fn native_holders_control_the_callback_lifetime() {
    static RETAINED: AtomicUsize = AtomicUsize::new(0);

    let (runtime, _dir) = runtime_with(|reg| {
        let i32_ty = reg.i32_type();
        let fn_ty = reg.function_type(i32_ty.clone(), &[("v", i32_ty.clone())]);

        // Keeps the pointer beyond the call by taking its own reference.
        reg.global_function(
            "retain",
            i32_ty.clone(),
            &[("fn", fn_ty.clone()), ("v", i32_ty.clone())],
            wrap2(|f: &UnaryFn, v: &i32| {
                let addr = *f as usize;
                callbacks::add_ref(addr as *const c_void);
                RETAINED.store(addr, Ordering::SeqCst);
                f(*v)
            }),
        );

        reg.global_function(
            "invokeRetained",
            i32_ty.clone(),
            &[("v", i32_ty.clone())],
            quickbind_reflect::wrap1(|v: &i32| {
                let addr = RETAINED.load(Ordering::SeqCst);
                let f: UnaryFn = unsafe { std::mem::transmute(addr) };
                f(*v)
            }),
        );

        reg.global_function(
            "releaseRetained",
            i32_ty.clone(),
            &[],
            quickbind_reflect::wrap0(|| {
                let addr = RETAINED.swap(0, Ordering::SeqCst);
                callbacks::release(addr as *const c_void);
                0i32
            }),
        );
    });

    assert_eq!(eval::<f64>(&runtime, "retain(x => x + 1, 1)"), 2.0);
    // The native holder still has a reference after the call ends.
    assert_eq!(callbacks::live_count(), 1);
    assert_eq!(eval::<f64>(&runtime, "invokeRetained(41)"), 42.0);

    eval::<f64>(&runtime, "releaseRetained()");
    assert_eq!(callbacks::live_count(), 0);
}

#[test]
fn non_functions_are_rejected() {
    let (runtime, _dir) = runtime_with(register_apply);
    let msg = eval_err(&runtime, "apply(42, 1)");
    assert!(msg.contains("not a function"), "unexpected: {msg}");
}
