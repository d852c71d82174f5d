//! Constructor overload resolution: arity plus `canAccept`, with ambiguity
//! as a hard error.

mod common;

use common::{eval, eval_err, runtime_with};
use quickbind_reflect::{ctor1, Registry};

struct Foo {
    #[allow(dead_code)]
    tag: u8,
}

fn register_ambiguous(reg: &Registry) {
    // Foo(i32) and Foo(f64): every script number satisfies both.
    let mut b = reg.class_of::<Foo>("Foo").unwrap();
    b.destructible::<Foo>();
    b.ctor(&[("v", reg.i32_type())], ctor1(|_: &i32| Foo { tag: 1 }));
    b.ctor(&[("v", reg.f64_type())], ctor1(|_: &f64| Foo { tag: 2 }));
    let ty = b.finish();
    reg.global_type(&ty);
}

struct Bar {
    kind: u8,
}

fn register_distinct(reg: &Registry) {
    let mut b = reg.class_of::<Bar>("Bar").unwrap();
    b.destructible::<Bar>();
    b.ctor(&[("v", reg.i32_type())], ctor1(|_: &i32| Bar { kind: 1 }));
    b.ctor(&[("v", reg.string_type())], ctor1(|_: &String| Bar { kind: 2 }));
    b.ctor(&[], quickbind_reflect::ctor0(|| Bar { kind: 0 }));
    let ty = b.finish();
    reg.global_type(&ty);
}

#[test]
fn ambiguous_constructors_are_rejected_by_name() {
    let (runtime, _dir) = runtime_with(register_ambiguous);

    let msg = eval_err(&runtime, "new Foo(1)");
    assert!(
        msg.contains("Foo") && msg.contains("more than one constructor"),
        "unexpected: {msg}"
    );
}

#[test]
fn no_matching_constructor_is_rejected_by_name() {
    let (runtime, _dir) = runtime_with(register_ambiguous);

    let msg = eval_err(&runtime, r#"new Foo("text")"#);
    assert!(
        msg.contains("Foo") && msg.contains("no constructor"),
        "unexpected: {msg}"
    );
    let msg = eval_err(&runtime, "new Foo(1, 2, 3)");
    assert!(msg.contains("no constructor"), "unexpected: {msg}");
}

#[test]
fn distinct_overloads_select_deterministically() {
    let (runtime, _dir) = runtime_with(|reg| {
        register_distinct(reg);
        let u8t = reg.u8_type();
        let bar = reg.get("Bar").unwrap();
        reg.global_function(
            "kindOf",
            u8t,
            &[("bar", bar)],
            quickbind_reflect::wrap1(|bar: &Bar| bar.kind),
        );
    });

    assert_eq!(eval::<f64>(&runtime, "kindOf(new Bar(5))"), 1.0);
    assert_eq!(eval::<f64>(&runtime, r#"kindOf(new Bar("five"))"#), 2.0);
    assert_eq!(eval::<f64>(&runtime, "kindOf(new Bar())"), 0.0);
}
