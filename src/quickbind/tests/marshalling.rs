//! Round-trip tests for the marshalling layer: primitives, strings, byte
//! buffers, trivial structs and arrays.

mod common;

use std::mem::offset_of;

use common::{eval, runtime_with};
use quickbind::modules::buffer::HostDataBuffer;
use quickbind_reflect::{wrap1, wrap2, HostArray, Registry};

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Point {
    x: i32,
    y: i32,
}

fn register_point(reg: &Registry) -> quickbind_reflect::TypeRef {
    let i32_ty = reg.i32_type();
    let mut b = reg.struct_of::<Point>("Point").unwrap();
    b.field("x", &i32_ty, offset_of!(Point, x))
        .field("y", &i32_ty, offset_of!(Point, y));
    let ty = b.finish();
    reg.global_type(&ty);
    ty
}

#[test]
fn primitives_round_trip_with_saturation() {
    let (runtime, _dir) = runtime_with(|reg| {
        let u8t = reg.u8_type();
        reg.global_function("idU8", u8t.clone(), &[("v", u8t)], wrap1(|v: &u8| *v));
        let i8t = reg.i8_type();
        reg.global_function("idI8", i8t.clone(), &[("v", i8t)], wrap1(|v: &i8| *v));
        let u16t = reg.u16_type();
        reg.global_function("idU16", u16t.clone(), &[("v", u16t)], wrap1(|v: &u16| *v));
        let i32t = reg.i32_type();
        reg.global_function("idI32", i32t.clone(), &[("v", i32t)], wrap1(|v: &i32| *v));
        let u64t = reg.u64_type();
        reg.global_function("idU64", u64t.clone(), &[("v", u64t)], wrap1(|v: &u64| *v));
        let b = reg.bool_type();
        reg.global_function("idBool", b.clone(), &[("v", b)], wrap1(|v: &bool| *v));
        let f = reg.f64_type();
        reg.global_function("idF64", f.clone(), &[("v", f)], wrap1(|v: &f64| *v));
        let f32t = reg.f32_type();
        reg.global_function("idF32", f32t.clone(), &[("v", f32t)], wrap1(|v: &f32| *v));
    });

    assert_eq!(eval::<f64>(&runtime, "idI32(-123456)"), -123456.0);
    assert_eq!(eval::<f64>(&runtime, "idU8(200)"), 200.0);
    assert!(eval::<bool>(&runtime, "idBool(true)"));
    assert_eq!(eval::<f64>(&runtime, "idF64(1.5)"), 1.5);
    assert_eq!(eval::<f64>(&runtime, "idF32(0.5)"), 0.5);

    // Conversion to the stored width saturates and maps NaN to zero.
    assert_eq!(eval::<f64>(&runtime, "idU8(300)"), 255.0);
    assert_eq!(eval::<f64>(&runtime, "idU8(-1)"), 0.0);
    assert_eq!(eval::<f64>(&runtime, "idI8(1000)"), 127.0);
    assert_eq!(eval::<f64>(&runtime, "idI32(NaN)"), 0.0);
    assert_eq!(eval::<f64>(&runtime, "idU16(65536)"), 65535.0);
}

#[test]
fn strings_round_trip() {
    let (runtime, _dir) = runtime_with(|reg| {
        let s = reg.string_type();
        reg.global_function(
            "concat",
            s.clone(),
            &[("a", s.clone()), ("b", s)],
            wrap2(|a: &String, b: &String| format!("{a}{b}")),
        );
    });

    assert_eq!(eval::<String>(&runtime, r#"concat("héllo ", "wörld")"#), "héllo wörld");
    assert_eq!(eval::<String>(&runtime, r#"concat("", "")"#), "");
}

#[test]
fn byte_buffers_round_trip() {
    let (runtime, _dir) = runtime_with(|reg| {
        let buffer_ty = reg.get("DataBuffer").unwrap();
        reg.global_function(
            "reverseBytes",
            buffer_ty.clone(),
            &[("data", buffer_ty)],
            wrap1(|data: &HostDataBuffer| {
                HostDataBuffer::from_bytes(data.data().iter().rev().copied().collect())
            }),
        );
    });

    let out: Vec<u8> = eval(
        &runtime,
        r#"
        (function () {
            const input = new Uint8Array([1, 2, 3, 4, 5]);
            const result = reverseBytes(input.buffer);
            return Array.from(new Uint8Array(result));
        })()
        "#,
    );
    assert_eq!(out, vec![5, 4, 3, 2, 1]);
}

#[test]
fn trivial_structs_round_trip_and_zero_fill() {
    let (runtime, _dir) = runtime_with(|reg| {
        let point = register_point(reg);
        reg.global_function(
            "plus",
            point.clone(),
            &[("a", point.clone()), ("b", point)],
            wrap2(|a: &Point, b: &Point| Point { x: a.x + b.x, y: a.y + b.y }),
        );
    });

    // Scenario: {3,5} + {7,9} delivered as {10,14}.
    let sum: String = eval(
        &runtime,
        "JSON.stringify(plus({x: 3, y: 5}, {x: 7, y: 9}))",
    );
    assert_eq!(sum, r#"{"x":10,"y":14}"#);

    // Missing fields zero-fill; the result carries exactly the declared
    // fields.
    let partial: String = eval(&runtime, "JSON.stringify(plus({x: 3}, {}))");
    assert_eq!(partial, r#"{"x":3,"y":0}"#);
    let keys: Vec<String> = eval(&runtime, "Object.keys(plus({}, {}))");
    assert_eq!(keys, vec!["x", "y"]);
}

#[test]
fn arrays_marshal_elementwise() {
    let (runtime, _dir) = runtime_with(|reg| {
        let point = register_point(reg);
        let points = reg.array_of(&point);
        reg.global_function(
            "sumPoints",
            point,
            &[("points", points.clone())],
            wrap1(|points: &HostArray| {
                let mut out = Point::default();
                for p in unsafe { points.as_slice::<Point>() } {
                    out.x += p.x;
                    out.y += p.y;
                }
                out
            }),
        );
        let f64_ty = reg.f64_type();
        let doubles = reg.array_of(&f64_ty);
        reg.global_function(
            "roundTripNumbers",
            doubles.clone(),
            &[("values", doubles)],
            wrap1(|values: &HostArray| {
                HostArray::from_vec(unsafe { values.as_slice::<f64>() }.to_vec())
            }),
        );
    });

    let sum: String = eval(
        &runtime,
        "JSON.stringify(sumPoints([{x: 1, y: 2}, {x: 3, y: 4}]))",
    );
    assert_eq!(sum, r#"{"x":4,"y":6}"#);

    let echo: Vec<f64> = eval(&runtime, "roundTripNumbers([0.5, -2, 100])");
    assert_eq!(echo, vec![0.5, -2.0, 100.0]);

    let empty: Vec<f64> = eval(&runtime, "roundTripNumbers([])");
    assert!(empty.is_empty());
}

#[test]
fn wrong_kinds_raise_type_errors() {
    let (runtime, _dir) = runtime_with(|reg| {
        let s = reg.string_type();
        reg.global_function("needsString", s.clone(), &[("v", s)], wrap1(|v: &String| v.clone()));
        let i = reg.i32_type();
        reg.global_function("needsNumber", i.clone(), &[("v", i)], wrap1(|v: &i32| *v));
    });

    let msg = common::eval_err(&runtime, "needsString(42)");
    assert!(msg.contains("not a string"), "unexpected message: {msg}");
    let msg = common::eval_err(&runtime, r#"needsNumber("nope")"#);
    assert!(msg.contains("not a number"), "unexpected message: {msg}");
    // Arity mismatches are range errors.
    let msg = common::eval_err(&runtime, "needsNumber()");
    assert!(msg.contains("number of arguments"), "unexpected message: {msg}");
}
