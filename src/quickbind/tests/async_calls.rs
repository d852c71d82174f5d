//! Asynchronous dispatch through the worker pool: promise resolution,
//! rejection on host failure, and completion ordering.

mod common;

use common::{eval, runtime_with_workers};
use quickbind_reflect::{describe, wrap1, Registry};

fn register_async_fns(reg: &Registry) {
    let i32_ty = reg.i32_type();
    let f = reg.global_function(
        "squareAsync",
        i32_ty.clone(),
        &[("v", i32_ty.clone())],
        wrap1(|v: &i32| v * v),
    );
    describe(&f).desc("Squares a number off-thread").asynchronous();

    let f = reg.global_function(
        "boomAsync",
        i32_ty.clone(),
        &[("v", i32_ty)],
        wrap1(|_: &i32| -> i32 { panic!("boom") }),
    );
    describe(&f).asynchronous();

    let s = reg.string_type();
    let f = reg.global_function(
        "slowEcho",
        s.clone(),
        &[("v", s)],
        wrap1(|v: &String| {
            std::thread::sleep(std::time::Duration::from_millis(2));
            v.clone()
        }),
    );
    describe(&f).asynchronous();
}

#[test]
fn async_calls_resolve_with_the_marshalled_return() {
    let (runtime, _dir) = runtime_with_workers(register_async_fns, 1);

    eval::<()>(
        &runtime,
        "globalThis.result = undefined; squareAsync(9).then(v => { result = v; });",
    );
    runtime.run_until_idle();
    assert_eq!(eval::<f64>(&runtime, "result"), 81.0);
}

#[test]
fn async_failures_reject_with_the_message() {
    let (runtime, _dir) = runtime_with_workers(register_async_fns, 1);

    eval::<()>(
        &runtime,
        "globalThis.err = undefined; boomAsync(9).catch(e => { err = e.message; });",
    );
    runtime.run_until_idle();
    assert_eq!(eval::<String>(&runtime, "err"), "boom");
}

#[test]
fn completions_deliver_in_enqueue_order_within_a_drain() {
    // One worker keeps execution serial, so all completions land in a
    // single drain in submission order.
    let (runtime, _dir) = runtime_with_workers(register_async_fns, 1);

    eval::<()>(
        &runtime,
        r#"
        globalThis.order = [];
        slowEcho("a").then(v => order.push(v));
        slowEcho("b").then(v => order.push(v));
        slowEcho("c").then(v => order.push(v));
        "#,
    );
    runtime.run_until_idle();

    let order: Vec<String> = eval(&runtime, "order");
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[test]
fn async_and_sync_share_the_argument_pipeline() {
    let (runtime, _dir) = runtime_with_workers(
        |reg| {
            register_async_fns(reg);
            let i32_ty = reg.i32_type();
            reg.global_function("squareSync", i32_ty.clone(), &[("v", i32_ty)], wrap1(|v: &i32| v * v));
        },
        1,
    );

    assert_eq!(eval::<f64>(&runtime, "squareSync(12)"), 144.0);
    eval::<()>(
        &runtime,
        "globalThis.both = []; squareAsync(12).then(v => both.push(v, squareSync(2)));",
    );
    runtime.run_until_idle();
    let both: Vec<f64> = eval(&runtime, "both");
    assert_eq!(both, vec![144.0, 4.0]);
}
