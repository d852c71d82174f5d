//! Binding commit: built-in modules, globals, enums, intrinsics, timers and
//! the emitted declaration files.

mod common;

use std::mem::offset_of;

use common::{eval, runtime_with};
use quickbind_reflect::{describe, wrap1, Registry};

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Vec2 {
    x: f32,
    y: f32,
}

fn register_math(reg: &Registry) {
    let ns = reg.namespace("math");

    let f32_ty = reg.f32_type();
    let mut b = reg.struct_of::<Vec2>("Vec2").unwrap();
    b.field("x", &f32_ty, offset_of!(Vec2, x))
        .field("y", &f32_ty, offset_of!(Vec2, y));
    let vec2 = b.finish();
    ns.data_type(&vec2);

    let f = ns.function(
        "length",
        reg.f32_type(),
        &[("v", vec2.clone())],
        wrap1(|v: &Vec2| (v.x * v.x + v.y * v.y).sqrt()),
    );
    describe(&f)
        .desc("Length of a vector")
        .param(0, "v", "The vector")
        .returns("The Euclidean length");

    let f = ns.function(
        "lengthAsync",
        reg.f32_type(),
        &[("v", vec2)],
        wrap1(|v: &Vec2| (v.x * v.x + v.y * v.y).sqrt()),
    );
    describe(&f).asynchronous();

    let mode = reg
        .enum_type("Mode")
        .variant("Fast", 0)
        .variant("Safe", 1)
        .finish()
        .unwrap();
    ns.data_type(&mode);
}

#[test]
fn namespaces_become_requirable_modules() {
    let (runtime, _dir) = runtime_with(register_math);

    let len: f64 = eval(&runtime, r#"require("math").length({x: 3, y: 4})"#);
    assert!((len - 5.0).abs() < 1e-6);

    // Enums are plain value objects on the module.
    assert_eq!(eval::<f64>(&runtime, r#"require("math").Mode.Safe"#), 1.0);
}

#[test]
fn builtin_modules_are_bound() {
    let (runtime, _dir) = runtime_with(|_| {});

    assert_eq!(
        eval::<String>(&runtime, r#"require("path").basename("a/b/c.ts")"#),
        "c.ts"
    );
    assert!(eval::<bool>(&runtime, r#"typeof require("fs").exists === "function""#));
    assert!(eval::<bool>(&runtime, r#"require("fs").FileType.Directory === 2"#));
    assert!(eval::<bool>(&runtime, r#"typeof require("process").env === "object""#));
    assert!(eval::<bool>(&runtime, r#"typeof require("process").cwd() === "string""#));
}

#[test]
fn intrinsic_constants_land_on_the_global_scope() {
    let (runtime, _dir) = runtime_with(|_| {});

    assert_eq!(eval::<f64>(&runtime, "I32_MAX"), f64::from(i32::MAX));
    assert_eq!(eval::<f64>(&runtime, "U8_MAX"), 255.0);
    assert_eq!(eval::<f64>(&runtime, "I16_MIN"), -32768.0);
}

#[test]
fn declaration_files_are_emitted() {
    let (_runtime, dir) = runtime_with(register_math);

    let builtins = std::fs::read_to_string(dir.path().join("internal/lib/builtins.d.ts"))
        .expect("builtins.d.ts");

    assert!(builtins.contains("declare module \"math\""));
    assert!(builtins.contains("declare module \"fs\""));
    assert!(builtins.contains("export type Vec2 = {"));
    assert!(builtins.contains("export enum Mode {"));
    assert!(builtins.contains("export function length(v: Vec2): number;"));
    assert!(builtins.contains("lengthAsync(v: Vec2): Promise<number>;"));
    assert!(builtins.contains("export class DirEntry"));
    assert!(builtins.contains("destroy(): void;"));
    // Imports are derived for types owned by other modules.
    assert!(builtins.contains("export enum FileType {"));

    let core = dir.path().join("internal/lib/core.d.ts");
    assert!(core.exists());
    let core = std::fs::read_to_string(core).unwrap();
    assert!(core.contains("declare function require"));
    assert!(core.contains("declare function setTimeout"));
}

#[test]
fn timers_fire_once_and_clear() {
    let (runtime, _dir) = runtime_with(|_| {});

    eval::<()>(
        &runtime,
        r#"
        globalThis.fired = 0;
        globalThis.cancelled = 0;
        setTimeout(() => { fired += 1; }, 1);
        const id = setTimeout(() => { cancelled += 1; }, 1);
        clearTimeout(id);
        "#,
    );

    std::thread::sleep(std::time::Duration::from_millis(5));
    runtime.run_until_idle();

    assert_eq!(eval::<i32>(&runtime, "fired"), 1);
    assert_eq!(eval::<i32>(&runtime, "cancelled"), 0);
}

#[test]
fn intervals_repeat_until_cleared() {
    let (runtime, _dir) = runtime_with(|_| {});

    eval::<()>(
        &runtime,
        r#"
        globalThis.ticks = 0;
        globalThis.intervalId = setInterval(() => { ticks += 1; }, 1);
        "#,
    );

    for _ in 0..5 {
        std::thread::sleep(std::time::Duration::from_millis(3));
        runtime.service();
    }
    eval::<()>(&runtime, "clearInterval(intervalId)");
    let ticks: i32 = eval(&runtime, "ticks");
    assert!(ticks >= 2, "interval only fired {ticks} times");

    runtime.run_until_idle();
}
