//! Managed object lifecycle: constructors, destroy, wrapper identity,
//! external ownership and GC-driven frees.

mod common;

use std::mem::offset_of;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{eval, eval_err, runtime_with};
use quickbind_reflect::{ctor0, method0, wrap0, Registry};

static HANDLE_DROPS: AtomicUsize = AtomicUsize::new(0);

struct Handle {
    value: i32,
}

impl Drop for Handle {
    fn drop(&mut self) {
        HANDLE_DROPS.fetch_add(1, Ordering::SeqCst);
    }
}

fn register_handle(reg: &Registry) -> quickbind_reflect::TypeRef {
    let i32_ty = reg.i32_type();
    let mut b = reg.class_of::<Handle>("Handle").unwrap();
    b.field("value", &i32_ty, offset_of!(Handle, value))
        .destructible::<Handle>();
    b.ctor(&[], ctor0(|| Handle { value: 7 }));
    let ty = b.finish();
    reg.global_type(&ty);
    ty
}

#[test]
fn destroy_runs_the_destructor_and_tombstones() {
    HANDLE_DROPS.store(0, Ordering::SeqCst);
    let (runtime, _dir) = runtime_with(|reg| {
        register_handle(reg);
    });

    eval::<()>(&runtime, "globalThis.h = new Handle(); h.destroy();");
    assert_eq!(HANDLE_DROPS.load(Ordering::SeqCst), 1);

    let ty = runtime.registry().get("Handle").unwrap();
    let stats = quickbind::bridge::manager_of(&ty).unwrap().stats();
    assert_eq!(stats.allocs, 1);
    assert_eq!(stats.frees, 1);
    assert_eq!(stats.live, 0);

    // A destroyed wrapper fails cleanly, naming the type.
    let msg = eval_err(&runtime, "h.value");
    assert!(msg.contains("Handle") && msg.contains("destroyed"), "unexpected: {msg}");
    let msg = eval_err(&runtime, "h.destroy()");
    assert!(msg.contains("destroyed"), "unexpected: {msg}");
}

#[test]
fn fields_and_methods_dispatch_on_the_wrapper() {
    let (runtime, _dir) = runtime_with(|reg| {
        let i32_ty = reg.i32_type();
        let mut b = reg.class_of::<Handle>("Handle").unwrap();
        b.field("value", &i32_ty, offset_of!(Handle, value))
            .destructible::<Handle>();
        b.ctor(&[], ctor0(|| Handle { value: 7 }));
        b.method("bump", i32_ty.clone(), &[], method0(|h: &mut Handle| {
            h.value += 1;
            h.value
        }));
        let ty = b.finish();
        reg.global_type(&ty);
    });

    assert_eq!(eval::<f64>(&runtime, "globalThis.h2 = new Handle(); h2.value"), 7.0);
    assert_eq!(eval::<f64>(&runtime, "h2.bump()"), 8.0);
    assert_eq!(eval::<f64>(&runtime, "h2.value = 42; h2.value"), 42.0);
    eval::<()>(&runtime, "h2.destroy()");
}

#[test]
fn wrapper_identity_is_preserved_while_mapped() {
    // Identity goes through a method returning `this` as a pointer: the
    // manager maps the block, so converting the same pointer again must
    // return the existing wrapper, not a new one.
    let (runtime, _dir) = runtime_with(|reg| {
        let i32_ty = reg.i32_type();
        let mut b = reg.class_of::<Handle>("Handle").unwrap();
        b.field("value", &i32_ty, offset_of!(Handle, value))
            .destructible::<Handle>();
        b.ctor(&[], ctor0(|| Handle { value: 7 }));
        let self_ptr = reg.pointer_to(&b.ty());
        b.method("me", self_ptr, &[], method0(|h: &mut Handle| h as *mut Handle));
        let ty = b.finish();
        reg.global_type(&ty);
    });

    assert!(eval::<bool>(&runtime, "globalThis.h3 = new Handle(); h3.me() === h3"));
    eval::<()>(&runtime, "h3.destroy()");
}

#[test]
fn externally_owned_wrappers_reject_destroy() {
    static LEAKED: AtomicUsize = AtomicUsize::new(0);

    let (runtime, _dir) = runtime_with(|reg| {
        let i32_ty = reg.i32_type();
        let mut b = reg.class_of::<Handle>("Handle").unwrap();
        b.field("value", &i32_ty, offset_of!(Handle, value))
            .destructible::<Handle>();
        b.ctor(&[], ctor0(|| Handle { value: 7 }));
        let ty = b.finish();
        reg.global_type(&ty);

        // A pointer return wraps in place: the host owns the lifetime.
        let ptr_ty = reg.pointer_to(&ty);
        reg.global_function("sharedHandle", ptr_ty, &[], wrap0(|| {
            LEAKED.store(1, Ordering::SeqCst);
            let handle: &'static mut Handle = Box::leak(Box::new(Handle { value: 99 }));
            handle as *mut Handle
        }));
    });

    assert_eq!(eval::<f64>(&runtime, "sharedHandle().value"), 99.0);
    let msg = eval_err(&runtime, "sharedHandle().destroy()");
    assert!(msg.contains("externally"), "unexpected: {msg}");
}

#[test]
fn gc_returns_blocks_to_the_pool() {
    HANDLE_DROPS.store(0, Ordering::SeqCst);
    let (runtime, _dir) = runtime_with(|reg| {
        register_handle(reg);
    });

    eval::<()>(&runtime, "{ let tmp = new Handle(); tmp = null; }");
    runtime.with(|ctx| ctx.run_gc());

    assert_eq!(HANDLE_DROPS.load(Ordering::SeqCst), 1);
    let ty = runtime.registry().get("Handle").unwrap();
    let stats = quickbind::bridge::manager_of(&ty).unwrap().stats();
    assert_eq!(stats.allocs, 1);
    assert_eq!(stats.frees, 1);
}
